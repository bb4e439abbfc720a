//! Text export of records as VCF data lines. This is an encoder only; the
//! VCF/BCF parsing compatibility path lives outside this crate.

use std::io::Write;

use itertools::Itertools;

use crate::error::Result;
use crate::header::{Header, Phasing};
use crate::record::Record;
use crate::value::{Scalar, TypedValue, ValueBuf};

fn push_element(out: &mut String, values: &ValueBuf, i: usize) -> bool {
    fn int<T: Scalar + Into<i64>>(out: &mut String, v: T) -> bool {
        if v.is_end_of_vector() {
            return false;
        }
        if v.is_missing() {
            out.push('.');
        } else {
            let v: i64 = v.into();
            out.push_str(&v.to_string());
        }
        true
    }
    fn float<T: Scalar + Into<f64>>(out: &mut String, v: T) -> bool {
        if v.is_end_of_vector() {
            return false;
        }
        if v.is_missing() {
            out.push('.');
        } else {
            let v: f64 = v.into();
            out.push_str(&format!("{}", v));
        }
        true
    }
    match values {
        ValueBuf::Int8(v) => int(out, v[i]),
        ValueBuf::Int16(v) => int(out, v[i]),
        ValueBuf::Int32(v) => int(out, v[i]),
        ValueBuf::Int64(v) => int(out, v[i]),
        ValueBuf::Float32(v) => float(out, v[i]),
        ValueBuf::Float64(v) => float(out, v[i]),
        ValueBuf::String(v) => {
            out.push(v[i] as char);
            true
        }
    }
}

fn render_value(value: &TypedValue) -> String {
    let dense = value.copy_as_dense();
    if let ValueBuf::String(bytes) = dense.values() {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let mut out = String::new();
    for i in 0..dense.len() {
        if i > 0 {
            out.push(',');
        }
        if !push_element(&mut out, dense.values(), i) {
            out.pop();
            break;
        }
    }
    if out.is_empty() {
        out.push('.');
    }
    out
}

/// Writes the eight site columns (CHROM through INFO).
pub fn write_site<W: Write>(record: &Record, header: &Header, out: &mut W) -> Result<()> {
    write!(
        out,
        "{}\t{}\t{}\t{}",
        record.chrom(),
        record.pos(),
        if record.id().is_empty() {
            "."
        } else {
            record.id()
        },
        record.ref_allele(),
    )?;
    if record.alt_alleles().is_empty() {
        write!(out, "\t.")?;
    } else {
        write!(out, "\t{}", record.alt_alleles().iter().join(","))?;
    }
    match record.qual() {
        Some(qual) => write!(out, "\t{}", qual)?,
        None => write!(out, "\t.")?,
    }
    if record.filters().is_empty() {
        write!(out, "\t.")?;
    } else {
        write!(out, "\t{}", record.filters().iter().join(";"))?;
    }
    if record.info().is_empty() {
        write!(out, "\t.")?;
    } else {
        let rendered = record
            .info()
            .iter()
            .map(|(key, value)| {
                let is_flag = header
                    .info_header(key)
                    .map_or(false, |h| h.ty() == "Flag");
                if is_flag {
                    key.clone()
                } else {
                    format!("{}={}", key, render_value(value))
                }
            })
            .join(";");
        write!(out, "\t{}", rendered)?;
    }
    Ok(())
}

/// Writes the FORMAT column and one genotype column per sample. The `PH`
/// field drives the per-call separators and is not itself printed.
pub fn write_genotypes<W: Write>(record: &Record, header: &Header, out: &mut W) -> Result<()> {
    let n_samples = header.n_samples();
    if n_samples == 0 || record.format_fields().is_empty() {
        return Ok(());
    }

    let printed: Vec<&(String, TypedValue)> = record
        .format_fields()
        .iter()
        .filter(|(key, _)| key != "PH")
        .collect();
    write!(out, "\t{}", printed.iter().map(|(key, _)| key).join(":"))?;

    let ph_bits = record
        .get_format("PH")
        .map(TypedValue::copy_as_dense)
        .and_then(|ph| ph.dense_ints());
    let dense: Vec<(usize, TypedValue)> = printed
        .iter()
        .map(|(_, value)| {
            let dense = value.copy_as_dense();
            (dense.len() / n_samples, dense)
        })
        .collect();

    for sample in 0..n_samples {
        let mut column = String::new();
        for (field_idx, (stride, value)) in dense.iter().enumerate() {
            if field_idx > 0 {
                column.push(':');
            }
            let is_gt = printed[field_idx].0 == "GT";
            for k in 0..*stride {
                if k > 0 {
                    let sep = if is_gt {
                        genotype_separator(header, &ph_bits, sample, *stride, k)
                    } else {
                        ','
                    };
                    column.push(sep);
                }
                if !push_element(&mut column, value.values(), sample * stride + k) {
                    column.pop();
                    break;
                }
            }
        }
        write!(out, "\t{}", column)?;
    }
    Ok(())
}

fn genotype_separator(
    header: &Header,
    ph_bits: &Option<Vec<i64>>,
    sample: usize,
    stride: usize,
    slot: usize,
) -> char {
    match header.phasing() {
        Phasing::Phased => '|',
        Phasing::None => '/',
        _ => {
            let ph_stride = stride - 1;
            let phased = ph_bits
                .as_ref()
                .and_then(|bits| bits.get(sample * ph_stride + slot - 1).copied())
                .map_or(false, |bit| bit == 1);
            if phased {
                '|'
            } else {
                '/'
            }
        }
    }
}

/// Writes one full VCF data line, newline included.
pub fn write_record_line<W: Write>(record: &Record, header: &Header, out: &mut W) -> Result<()> {
    write_site(record, header, out)?;
    write_genotypes(record, header, out)?;
    out.write_all(b"\n")?;
    Ok(())
}
