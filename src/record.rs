//! A record is a site descriptor (contig, position, alleles, filters,
//! INFO annotations) together with an ordered list of per-sample FORMAT
//! fields. On disk it is two length-prefixed byte blocks: the shared block
//! opens with six 32-bit words, the individual block is a concatenation of
//! `(key id, typed value)` pairs.

use getset::Getters;

use crate::error::{Result, SavError};
use crate::header::{Dictionary, Header};
use crate::parser;
use crate::pbwt::PbwtContext;
use crate::value::{
    serialize_typed_int_vec, serialize_typed_scalar, serialize_typed_str, TypeKind, TypedValue,
    MISSING_FLOAT_BITS,
};

#[derive(Debug, Clone, Default, PartialEq, Getters)]
pub struct Record {
    #[getset(get = "pub")]
    chrom: String,
    pos: u32,
    #[getset(get = "pub")]
    id: String,
    #[getset(get = "pub")]
    ref_allele: String,
    #[getset(get = "pub")]
    alt_alleles: Vec<String>,
    qual: Option<f32>,
    #[getset(get = "pub")]
    filters: Vec<String>,
    #[getset(get = "pub")]
    info: Vec<(String, TypedValue)>,
    #[getset(get = "pub")]
    format_fields: Vec<(String, TypedValue)>,
}

impl Record {
    pub fn new<C, R>(chrom: C, pos: u32, ref_allele: R, alt_alleles: Vec<String>) -> Self
    where
        C: Into<String>,
        R: Into<String>,
    {
        Record {
            chrom: chrom.into(),
            pos,
            ref_allele: ref_allele.into(),
            alt_alleles,
            ..Record::default()
        }
    }

    /// 1-based position.
    pub fn pos(&self) -> u32 {
        self.pos
    }

    pub fn qual(&self) -> Option<f32> {
        self.qual
    }

    pub fn set_id<S: Into<String>>(&mut self, id: S) {
        self.id = id.into();
    }

    pub fn set_qual(&mut self, qual: Option<f32>) {
        self.qual = qual;
    }

    pub fn set_filters(&mut self, filters: Vec<String>) {
        self.filters = filters;
    }

    /// Sets or replaces an INFO annotation, preserving insertion order.
    pub fn set_info<S: Into<String>>(&mut self, key: S, value: TypedValue) {
        let key = key.into();
        match self.info.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.info.push((key, value)),
        }
    }

    pub fn get_info(&self, key: &str) -> Option<&TypedValue> {
        self.info.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn info_int(&self, key: &str) -> Option<i64> {
        self.get_info(key).and_then(TypedValue::get_int)
    }

    /// Sets or replaces a FORMAT field; an empty value removes it.
    pub fn set_format<S: Into<String>>(&mut self, key: S, value: TypedValue) {
        let key = key.into();
        if let Some(i) = self.format_fields.iter().position(|(k, _)| *k == key) {
            if value.is_empty() {
                self.format_fields.remove(i);
            } else {
                self.format_fields[i].1 = value;
            }
        } else if !value.is_empty() {
            self.format_fields.push((key, value));
        }
    }

    pub fn get_format(&self, key: &str) -> Option<&TypedValue> {
        self.format_fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Last base covered by the record: `pos + max(len(ref), max(len(alt)))
    /// - 1`, extended by an `END` INFO value when present.
    pub fn end_position(&self) -> u32 {
        let max_allele = self
            .alt_alleles
            .iter()
            .map(String::len)
            .chain(std::iter::once(self.ref_allele.len()))
            .max()
            .unwrap_or(1)
            .max(1);
        let span_end = self.pos + max_allele as u32 - 1;
        match self.info_int("END") {
            Some(end) if end > 0 => span_end.max(end as u32),
            _ => span_end,
        }
    }

    /// Serializes the shared block. `sample_word` carries the flag bits
    /// packed below the format count of the last 32-bit word.
    pub(crate) fn serialize_shared(
        &self,
        out: &mut Vec<u8>,
        header: &Header,
        sample_word: u32,
    ) -> Result<()> {
        let chrom_id = header.contig_id(&self.chrom)?;
        out.extend_from_slice(&(chrom_id as i32).to_le_bytes());
        out.extend_from_slice(&(self.pos.wrapping_sub(1) as i32).to_le_bytes());
        out.extend_from_slice(&(self.ref_allele.len() as i32).to_le_bytes());
        let qual_bits = self.qual.map_or(MISSING_FLOAT_BITS, f32::to_bits);
        out.extend_from_slice(&qual_bits.to_le_bytes());
        let n_allele = self.alt_alleles.len() as u32 + 1;
        out.extend_from_slice(
            &((n_allele << 16) | (self.info.len() as u32 & 0xFFFF)).to_le_bytes(),
        );
        out.extend_from_slice(
            &(((self.format_fields.len() as u32) << 24) | (sample_word & 0xFF_FFFF)).to_le_bytes(),
        );

        serialize_typed_str(&self.id, out);
        serialize_typed_str(&self.ref_allele, out);
        for alt in &self.alt_alleles {
            serialize_typed_str(alt, out);
        }

        let mut filter_ids = Vec::with_capacity(self.filters.len());
        for name in &self.filters {
            let id = header
                .dict()
                .id_of(Dictionary::ID, name)
                .ok_or_else(|| SavError::UnknownKey(name.clone()))?;
            filter_ids.push(id as i32);
        }
        serialize_typed_int_vec(&filter_ids, out);

        for (key, value) in &self.info {
            let id = header
                .dict()
                .id_of(Dictionary::ID, key)
                .ok_or_else(|| SavError::UnknownKey(key.clone()))?;
            serialize_typed_scalar(i64::from(id), out);
            value.serialize(out, 1);
        }
        Ok(())
    }

    /// Serializes the individual block: FORMAT fields in order, each as a
    /// typed key id followed by the typed value. Fields selected by
    /// `pbwt_fields` go through the PBWT permutation; other dense fields
    /// switch to the sparse layout when it is smaller.
    pub(crate) fn serialize_indiv(
        &self,
        out: &mut Vec<u8>,
        header: &Header,
        pbwt_fields: &dyn Fn(&str) -> bool,
        pbwt: &mut PbwtContext,
    ) -> Result<()> {
        let n_samples = header.n_samples();
        for (key, value) in &self.format_fields {
            let id = header
                .dict()
                .id_of(Dictionary::ID, key)
                .ok_or_else(|| SavError::UnknownKey(key.clone()))?;
            if n_samples > 0 && value.len() % n_samples != 0 {
                return Err(SavError::BadStride {
                    size: value.len(),
                    n_samples,
                });
            }
            serialize_typed_scalar(i64::from(id), out);

            let pbwt_eligible = pbwt_fields(key)
                && !value.is_sparse()
                && matches!(value.kind(), TypeKind::Int8 | TypeKind::Int16);
            if pbwt_eligible {
                value.serialize_pbwt(out, pbwt.state(key, value.len()))?;
            } else if !value.is_sparse() && value.kind() != TypeKind::String {
                match value.copy_as_sparse() {
                    Ok(sparse)
                        if sparse.non_zero_len() * (sparse.off_width() + sparse.val_width())
                            < value.len() * value.val_width() =>
                    {
                        sparse.serialize(out, 1)
                    }
                    _ => value.serialize(out, 1),
                }
            } else {
                value.serialize(out, 1);
            }
        }
        Ok(())
    }

    /// Rebuilds a record from its shared and individual blocks. Resets the
    /// PBWT context when the shared sample word carries the reset flag,
    /// then undoes the permutation of any PBWT-tagged field.
    pub(crate) fn deserialize(
        shared: &[u8],
        indiv: &[u8],
        header: &Header,
        pbwt: &mut PbwtContext,
    ) -> Result<Record> {
        let (rest, words) = parser::shared_words(shared)?;
        if words.pbwt_reset {
            pbwt.reset();
        }

        let chrom = header
            .contig_name(words.chrom_id as u32)
            .ok_or_else(|| SavError::UnknownKey(format!("contig #{}", words.chrom_id)))?
            .to_string();

        let (rest, id) = parser::typed_string(rest)?;
        let mut rest = rest;
        let mut alleles = Vec::with_capacity(words.n_allele as usize);
        for _ in 0..words.n_allele {
            let (r, allele) = parser::typed_string(rest)?;
            alleles.push(allele);
            rest = r;
        }
        let mut alleles = alleles.into_iter();
        let ref_allele = alleles.next().unwrap_or_default();
        let alt_alleles: Vec<String> = alleles.collect();

        let (rest, filter_ids) = parser::typed_int_vec(rest)?;
        let mut rest = rest;
        let mut filters = Vec::with_capacity(filter_ids.len());
        for fid in filter_ids {
            let entry = header
                .dict()
                .entry(Dictionary::ID, fid as u32)
                .ok_or_else(|| SavError::UnknownKey(format!("filter #{}", fid)))?;
            filters.push(entry.id.clone());
        }

        let mut info = Vec::with_capacity(words.n_info as usize);
        for _ in 0..words.n_info {
            let (r, key_id) = parser::typed_int(rest)?;
            let key = header
                .dict()
                .entry(Dictionary::ID, key_id as u32)
                .ok_or_else(|| SavError::UnknownKey(format!("info #{}", key_id)))?
                .id
                .clone();
            let (r, value) = parser::typed_value(r, 1)?;
            info.push((key, value));
            rest = r;
        }

        let n_samples = header.n_samples();
        let mut format_fields = Vec::with_capacity(words.n_fmt as usize);
        let mut indiv_rest = indiv;
        for _ in 0..words.n_fmt {
            let (r, key_id) = parser::typed_int(indiv_rest)?;
            let key = header
                .dict()
                .entry(Dictionary::ID, key_id as u32)
                .ok_or_else(|| SavError::UnknownKey(format!("format #{}", key_id)))?
                .id
                .clone();
            let (r, mut value) = parser::format_value(r, 1)?;
            if n_samples > 0 && value.len() % n_samples != 0 {
                return Err(SavError::BadStride {
                    size: value.len(),
                    n_samples,
                });
            }
            if value.pbwt_flag() {
                value.pbwt_unsort(pbwt.state(&key, value.len()))?;
            }
            format_fields.push((key, value));
            indiv_rest = r;
        }

        let qual = if words.qual.to_bits() == MISSING_FLOAT_BITS || words.qual.is_nan() {
            None
        } else {
            Some(words.qual)
        };

        Ok(Record {
            chrom,
            pos: (words.pos0 as u32).wrapping_add(1),
            id,
            ref_allele,
            alt_alleles,
            qual,
            filters,
            info,
            format_fields,
        })
    }

    /// Projects every FORMAT field onto a sample subset.
    pub(crate) fn subset_format(
        &mut self,
        subset_map: &[Option<usize>],
        kept: usize,
    ) -> Result<()> {
        for (_, value) in &mut self.format_fields {
            *value = value.subset(subset_map, kept)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::MISSING_INT8;

    fn test_header() -> Header {
        let (header, _) = Header::for_writing(
            vec![
                ("fileformat".to_string(), "VCFv4.2".to_string()),
                ("phasing".to_string(), "partial".to_string()),
                (
                    "contig".to_string(),
                    "<ID=chr1,length=248956422>".to_string(),
                ),
                ("contig".to_string(), "<ID=chr2>".to_string()),
                (
                    "INFO".to_string(),
                    "<ID=END,Number=1,Type=Integer,Description=\"End position\">".to_string(),
                ),
                (
                    "FORMAT".to_string(),
                    "<ID=GT,Number=.,Type=Integer,Description=\"Genotype\">".to_string(),
                ),
                (
                    "FORMAT".to_string(),
                    "<ID=DS,Number=1,Type=Float,Description=\"Dosage\">".to_string(),
                ),
            ],
            vec!["s1".to_string(), "s2".to_string()],
        )
        .unwrap();
        header
    }

    fn gt_record() -> Record {
        let mut record = Record::new("chr1", 100, "ACG", vec!["A".to_string()]);
        record.set_id("rs1");
        record.set_qual(Some(30.0));
        record.set_filters(vec!["PASS".to_string()]);
        record.set_format(
            "GT",
            TypedValue::from_ints(&[0, 1, 1, i64::from(MISSING_INT8)]),
        );
        record.set_format("PH", TypedValue::from_ints(&[1, 0]));
        record
    }

    fn round_trip(record: &Record, header: &Header, reset: bool) -> Record {
        let mut shared = Vec::new();
        let mut indiv = Vec::new();
        record
            .serialize_shared(&mut shared, header, if reset { 0x80_0000 } else { 0 })
            .unwrap();
        let mut ctx = PbwtContext::default();
        record
            .serialize_indiv(&mut indiv, header, &|_| false, &mut ctx)
            .unwrap();
        let mut read_ctx = PbwtContext::default();
        Record::deserialize(&shared, &indiv, header, &mut read_ctx).unwrap()
    }

    #[test]
    fn shared_and_indiv_round_trip() {
        let header = test_header();
        let record = gt_record();
        let parsed = round_trip(&record, &header, true);
        assert_eq!(parsed, record);
    }

    #[test]
    fn genotype_layout_matches_wire_format() {
        let header = test_header();
        let record = gt_record();
        let parsed = round_trip(&record, &header, true);
        let gt = parsed.get_format("GT").unwrap();
        assert_eq!(gt.kind(), TypeKind::Int8);
        assert_eq!(gt.len(), 4);
        assert_eq!(
            gt.dense_ints().unwrap(),
            vec![0, 1, 1, i64::from(MISSING_INT8)]
        );
        let ph = parsed.get_format("PH").unwrap();
        assert_eq!(ph.len(), 2);
        assert_eq!(ph.dense_ints().unwrap(), vec![1, 0]);
    }

    #[test]
    fn unknown_contig_is_reported() {
        let header = test_header();
        let record = Record::new("chrX", 5, "A", vec![]);
        let mut out = Vec::new();
        assert!(matches!(
            record.serialize_shared(&mut out, &header, 0),
            Err(SavError::UnknownKey(_))
        ));
    }

    #[test]
    fn unknown_format_key_is_reported() {
        let header = test_header();
        let mut record = Record::new("chr1", 5, "A", vec![]);
        record.set_format("XX", TypedValue::from_ints(&[1, 1]));
        let mut out = Vec::new();
        let mut ctx = PbwtContext::default();
        assert!(matches!(
            record.serialize_indiv(&mut out, &header, &|_| false, &mut ctx),
            Err(SavError::UnknownKey(_))
        ));
    }

    #[test]
    fn stride_violation_is_reported() {
        let header = test_header(); // two samples
        let mut record = Record::new("chr1", 5, "A", vec![]);
        record.set_format("DS", TypedValue::from_floats(&[0.5, 0.5, 0.5]));
        let mut out = Vec::new();
        let mut ctx = PbwtContext::default();
        assert!(matches!(
            record.serialize_indiv(&mut out, &header, &|_| false, &mut ctx),
            Err(SavError::BadStride { .. })
        ));
    }

    #[test]
    fn end_info_extends_interval() {
        let header = test_header();
        let mut record = Record::new("chr1", 100, "A", vec!["<DEL>".to_string()]);
        assert_eq!(record.end_position(), 104);
        record.set_info("END", TypedValue::int_scalar(200));
        assert_eq!(record.end_position(), 200);
        let parsed = round_trip(&record, &header, false);
        assert_eq!(parsed.info_int("END"), Some(200));
    }

    #[test]
    fn pbwt_fields_survive_round_trip() {
        let header = test_header();
        let mut write_ctx = PbwtContext::default();
        let mut read_ctx = PbwtContext::default();
        let columns: Vec<Vec<i64>> =
            vec![vec![0, 1, 1, 0], vec![1, 1, 0, 0], vec![0, 0, 1, 1]];
        for (i, column) in columns.iter().enumerate() {
            let mut record = Record::new("chr1", 100 + i as u32, "A", vec!["T".to_string()]);
            record.set_format("GT", TypedValue::from_ints(column));
            record.set_format("PH", TypedValue::from_ints(&[1, 1]));
            let mut shared = Vec::new();
            let mut indiv = Vec::new();
            record
                .serialize_shared(&mut shared, &header, if i == 0 { 0x80_0000 } else { 0 })
                .unwrap();
            record
                .serialize_indiv(&mut indiv, &header, &|k| k == "GT", &mut write_ctx)
                .unwrap();
            let parsed = Record::deserialize(&shared, &indiv, &header, &mut read_ctx).unwrap();
            assert_eq!(
                parsed.get_format("GT").unwrap().dense_ints().unwrap(),
                *column
            );
        }
    }
}
