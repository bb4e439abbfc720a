//! Read-only support for the legacy v1 genotype payload: a varint count
//! of non-zero haplotypes followed by one prefix-varint per haplotype,
//! whose prefix bits carry the allele class and whose value is the delta
//! from the previous haplotype index. Writers emit the v2 layout
//! exclusively.

use crate::error::{Result, SavError};
use crate::value::{OffsetBuf, Scalar, TypeKind, TypedValue, ValueBuf};
use crate::varint;

/// Denominator of the quantized dosage carried by a 7-bit prefix.
const HDS_DENOM: f32 = 128.0;
const HDS_MISSING_PREFIX: u8 = 0x7F;

fn decode_deltas(
    input: &[u8],
    prefix_bits: u8,
) -> Result<(Vec<u64>, Vec<u8>)> {
    let (nnz, mut cursor) = varint::decode(input)?;
    let mut deltas = Vec::with_capacity(nnz as usize);
    let mut prefixes = Vec::with_capacity(nnz as usize);
    for _ in 0..nnz {
        let (prefix, delta, consumed) = varint::decode_prefixed(prefix_bits, &input[cursor..])?;
        cursor += consumed;
        deltas.push(delta);
        prefixes.push(prefix);
    }
    Ok((deltas, prefixes))
}

fn offsets_from_deltas(deltas: &[u64]) -> OffsetBuf {
    let max_delta = deltas.iter().copied().max().unwrap_or(0);
    match TypeKind::fitting_offset(max_delta) {
        TypeKind::Int8 => OffsetBuf::U8(deltas.iter().map(|&d| d as u8).collect()),
        TypeKind::Int16 => OffsetBuf::U16(deltas.iter().map(|&d| d as u16).collect()),
        TypeKind::Int32 => OffsetBuf::U32(deltas.iter().map(|&d| d as u32).collect()),
        _ => OffsetBuf::U64(deltas.to_vec()),
    }
}

/// Decodes a v1 GT payload into a sparse int8 vector of `n_haplotypes`
/// elements. A set prefix bit marks an alternate allele, a clear one a
/// missing call.
pub fn decode_gt_payload(input: &[u8], n_haplotypes: usize) -> Result<TypedValue> {
    let (deltas, prefixes) = decode_deltas(input, 1)?;
    if deltas.len() > n_haplotypes {
        return Err(SavError::Truncated);
    }
    let values: Vec<i8> = prefixes
        .iter()
        .map(|&p| if p != 0 { 1 } else { i8::missing() })
        .collect();
    Ok(TypedValue::from_parts(
        n_haplotypes,
        ValueBuf::Int8(values),
        Some(offsets_from_deltas(&deltas)),
        false,
    ))
}

/// Decodes a v1 HDS payload into a sparse float vector; the 7-bit prefix
/// carries the dosage numerator over 128, saturated at the missing mark.
pub fn decode_hds_payload(input: &[u8], n_haplotypes: usize) -> Result<TypedValue> {
    let (deltas, prefixes) = decode_deltas(input, 7)?;
    if deltas.len() > n_haplotypes {
        return Err(SavError::Truncated);
    }
    let values: Vec<f32> = prefixes
        .iter()
        .map(|&p| {
            if p == HDS_MISSING_PREFIX {
                f32::missing()
            } else {
                f32::from(p) / HDS_DENOM
            }
        })
        .collect();
    Ok(TypedValue::from_parts(
        n_haplotypes,
        ValueBuf::Float32(values),
        Some(offsets_from_deltas(&deltas)),
        false,
    ))
}
