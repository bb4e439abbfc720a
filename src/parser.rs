//! nom building blocks for the binary layer: type descriptors, typed
//! scalars/strings/vectors, record length words, and the shared-block
//! header words.

use std::convert::TryFrom;

use nom::bytes::streaming::take;
use nom::number::streaming::{le_f32, le_i16, le_i32, le_i64, le_i8, le_u32, le_u8};
use nom::sequence::tuple;
use nom::IResult;

use crate::value::{OffsetBuf, TypeKind, TypedValue, ValueBuf};

fn bad_type(input: &[u8]) -> nom::Err<nom::error::Error<&[u8]>> {
    nom::Err::Failure(nom::error::Error::new(input, nom::error::ErrorKind::Tag))
}

fn type_kind(input: &[u8], bits: u8) -> Result<TypeKind, nom::Err<nom::error::Error<&[u8]>>> {
    TypeKind::try_from(bits).map_err(|_| bad_type(input))
}

/// Parses a typed integer scalar: one control byte `(1 << 4) | kind`
/// followed by the little-endian value.
pub fn typed_int(input: &[u8]) -> IResult<&[u8], i64> {
    let (input, tag) = le_u8(input)?;
    let kind = type_kind(input, tag & 0x0F)?;
    match kind {
        TypeKind::Int8 => {
            let (input, v) = le_i8(input)?;
            Ok((input, i64::from(v)))
        }
        TypeKind::Int16 => {
            let (input, v) = le_i16(input)?;
            Ok((input, i64::from(v)))
        }
        TypeKind::Int32 => {
            let (input, v) = le_i32(input)?;
            Ok((input, i64::from(v)))
        }
        TypeKind::Int64 => le_i64(input),
        _ => Err(bad_type(input)),
    }
}

/// Parses a control byte, resolving the size-nibble escape (nibble 15 means
/// the true size follows as a typed integer scalar).
pub fn type_descriptor(input: &[u8]) -> IResult<&[u8], (u8, usize)> {
    let (input, tag) = le_u8(input)?;
    let nibble = tag >> 4;
    if nibble == 15 {
        let (input, size) = typed_int(input)?;
        Ok((input, (tag, size as usize)))
    } else {
        Ok((input, (tag, nibble as usize)))
    }
}

/// Parses a typed string.
pub fn typed_string(input: &[u8]) -> IResult<&[u8], String> {
    let (input, (tag, size)) = type_descriptor(input)?;
    if type_kind(input, tag & 0x0F)? != TypeKind::String {
        return Err(bad_type(input));
    }
    let (input, bytes) = take(size)(input)?;
    Ok((input, String::from_utf8_lossy(bytes).into_owned()))
}

/// Parses a typed integer vector (the FILTER id list).
pub fn typed_int_vec(input: &[u8]) -> IResult<&[u8], Vec<i32>> {
    let (input, (tag, size)) = type_descriptor(input)?;
    if size == 0 {
        return Ok((input, Vec::new()));
    }
    let kind = type_kind(input, tag & 0x0F)?;
    let mut out = Vec::with_capacity(size);
    let mut input = input;
    for _ in 0..size {
        let (rest, v) = match kind {
            TypeKind::Int8 => {
                let (rest, v) = le_i8(input)?;
                (rest, i32::from(v))
            }
            TypeKind::Int16 => {
                let (rest, v) = le_i16(input)?;
                (rest, i32::from(v))
            }
            TypeKind::Int32 => le_i32(input)?,
            _ => return Err(bad_type(input)),
        };
        out.push(v);
        input = rest;
    }
    Ok((input, out))
}

fn typed_value_body(
    input: &[u8],
    kind_bits: u8,
    size: usize,
    pbwt: bool,
) -> IResult<&[u8], TypedValue> {
    if kind_bits == TypeKind::Sparse as u8 {
        if size == 0 {
            return Ok((
                input,
                TypedValue::from_parts(
                    0,
                    ValueBuf::Int8(Vec::new()),
                    Some(OffsetBuf::U8(Vec::new())),
                    pbwt,
                ),
            ));
        }
        let (input, sp_tag) = le_u8(input)?;
        let off_kind = type_kind(input, sp_tag >> 4)?;
        let val_kind = type_kind(input, sp_tag & 0x0F)?;
        if val_kind == TypeKind::String || val_kind == TypeKind::Sparse {
            return Err(bad_type(input));
        }
        let (input, nnz) = typed_int(input)?;
        let nnz = nnz as usize;
        let (input, off_bytes) = take(nnz * off_kind.width())(input)?;
        let (input, val_bytes) = take(nnz * val_kind.width())(input)?;
        let offsets =
            OffsetBuf::from_le_bytes(off_kind, nnz, off_bytes).map_err(|_| bad_type(input))?;
        let values =
            ValueBuf::from_le_bytes(val_kind, nnz, val_bytes).map_err(|_| bad_type(input))?;
        Ok((
            input,
            TypedValue::from_parts(size, values, Some(offsets), pbwt),
        ))
    } else {
        let kind = type_kind(input, kind_bits)?;
        let (input, bytes) = take(size * kind.width())(input)?;
        let values = ValueBuf::from_le_bytes(kind, size, bytes).map_err(|_| bad_type(input))?;
        Ok((input, TypedValue::from_parts(size, values, None, pbwt)))
    }
}

/// Parses a self-describing typed value as found in INFO fields.
/// `size_divisor` carries the per-sample stride of the BCF profile; SAV
/// always passes 1.
pub fn typed_value(input: &[u8], size_divisor: usize) -> IResult<&[u8], TypedValue> {
    let (input, (tag, size)) = type_descriptor(input)?;
    typed_value_body(input, tag & 0x0F, size * size_divisor, false)
}

/// Parses a FORMAT typed value, whose tag reserves bit 0x08 for the PBWT
/// flag.
pub fn format_value(input: &[u8], size_divisor: usize) -> IResult<&[u8], TypedValue> {
    let (input, (tag, size)) = type_descriptor(input)?;
    let pbwt = tag & 0x08 != 0;
    typed_value_body(input, tag & 0x07, size * size_divisor, pbwt)
}

/// The two little-endian length words preceding every record.
pub fn record_length(input: &[u8]) -> IResult<&[u8], (u32, u32)> {
    tuple((le_u32, le_u32))(input)
}

/// The six 32-bit words opening a shared block.
#[derive(Debug, Clone, Copy)]
pub struct SharedWords {
    pub chrom_id: i32,
    pub pos0: i32,
    pub rlen: i32,
    pub qual: f32,
    pub n_allele: u16,
    pub n_info: u16,
    pub n_fmt: u8,
    pub n_sample: u32,
    pub pbwt_reset: bool,
}

pub fn shared_words(input: &[u8]) -> IResult<&[u8], SharedWords> {
    let (input, (chrom_id, pos0, rlen, qual, alleles_info, fmt_sample)) =
        tuple((le_i32, le_i32, le_i32, le_f32, le_u32, le_u32))(input)?;
    Ok((
        input,
        SharedWords {
            chrom_id,
            pos0,
            rlen,
            qual,
            n_allele: (alleles_info >> 16) as u16,
            n_info: (alleles_info & 0xFFFF) as u16,
            n_fmt: (fmt_sample >> 24) as u8,
            n_sample: fmt_sample & 0x7F_FFFF,
            pbwt_reset: fmt_sample & 0x80_0000 != 0,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::serialize_typed_str;

    #[test]
    fn shared_word_packing() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&3i32.to_le_bytes());
        buf.extend_from_slice(&99i32.to_le_bytes());
        buf.extend_from_slice(&1i32.to_le_bytes());
        buf.extend_from_slice(&30.0f32.to_le_bytes());
        buf.extend_from_slice(&(((2u32 + 1) << 16) | 4).to_le_bytes());
        buf.extend_from_slice(&((2u32 << 24) | 0x80_0000).to_le_bytes());
        let (rest, words) = shared_words(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(words.chrom_id, 3);
        assert_eq!(words.pos0, 99);
        assert_eq!(words.n_allele, 3);
        assert_eq!(words.n_info, 4);
        assert_eq!(words.n_fmt, 2);
        assert_eq!(words.n_sample, 0);
        assert!(words.pbwt_reset);
    }

    #[test]
    fn typed_string_round_trip() {
        for s in &["", "A", "ACGT", "NNNNNNNNNNNNNNNNNNNN"] {
            let mut buf = Vec::new();
            serialize_typed_str(s, &mut buf);
            let (rest, parsed) = typed_string(&buf).unwrap();
            assert!(rest.is_empty());
            assert_eq!(&parsed, s);
        }
    }

    #[test]
    fn truncated_value_is_incomplete() {
        let v = TypedValue::from_ints(&[1, 2, 3, 4]);
        let mut buf = Vec::new();
        v.serialize(&mut buf, 1);
        buf.pop();
        assert!(typed_value(&buf, 1).is_err());
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        // tag bits 0b1000 name no INFO type
        let buf = [0x18u8, 0x00];
        assert!(typed_value(&buf, 1).is_err());
    }
}
