//! Header metadata and the per-file dictionaries mapping contig, shared
//! id (INFO/FILTER/FORMAT), and sample names to stable integer ids.

use std::collections::HashMap;

use getset::Getters;
use indexmap::IndexMap;
use multimap::MultiMap;
use nom::branch::alt;
use nom::bytes::complete::{escaped, is_not, tag};
use nom::character::complete::none_of;
use nom::multi::separated_list0;
use nom::sequence::{delimited, separated_pair};
use nom::IResult;
use strum::{Display, EnumString};

use crate::error::{Result, SavError};
use crate::value::TypeKind;

/// Phasing declared by the `phasing` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Phasing {
    Unknown,
    None,
    Partial,
    #[strum(to_string = "phased", serialize = "full")]
    Phased,
}

impl Default for Phasing {
    fn default() -> Self {
        Phasing::Unknown
    }
}

/// A structured `<ID=…,Number=…,Type=…,Description=…[,IDX=n]>` value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Getters)]
pub struct HeaderValueDetails {
    #[getset(get = "pub")]
    id: String,
    #[getset(get = "pub")]
    number: String,
    #[getset(get = "pub")]
    ty: String,
    #[getset(get = "pub")]
    description: String,
    #[getset(get = "pub")]
    idx: Option<u32>,
}

fn delimited_string(input: &str) -> IResult<&str, &str> {
    delimited(
        tag("\""),
        escaped(none_of("\\\""), '\\', alt((tag("\\"), tag("\"")))),
        tag("\""),
    )(input)
}

fn keys_and_values(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
    fn key_value(input: &str) -> IResult<&str, (&str, &str)> {
        separated_pair(
            is_not("<,=\n"),
            tag("="),
            alt((delimited_string, is_not(">,=\n"))),
        )(input)
    }
    separated_list0(tag(","), key_value)(input)
}

/// Parses the structured part of a header value; `None` when the value is
/// not of the `<…>` form.
pub fn parse_header_value(value: &str) -> Option<HeaderValueDetails> {
    let (_, pairs) = delimited(tag("<"), keys_and_values, tag(">"))(value).ok()?;
    let mut details = HeaderValueDetails::default();
    for (key, val) in pairs {
        match key {
            "ID" => details.id = val.to_string(),
            "Number" => details.number = val.to_string(),
            "Type" => details.ty = val.to_string(),
            "Description" => details.description = val.to_string(),
            "IDX" => details.idx = val.parse().ok(),
            _ => {}
        }
    }
    Some(details)
}

/// Removes an `IDX=n` sub-field from a structured header value; written
/// files always renumber from scratch.
pub fn strip_idx(value: &str) -> String {
    match parse_header_value(value) {
        Some(details) if details.idx.is_some() => {
            let needle = format!(",IDX={}", details.idx.unwrap());
            value.replacen(&needle, "", 1)
        }
        _ => value.to_string(),
    }
}

/// One dictionary slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictEntry {
    pub id: String,
    pub number: String,
    pub kind: Option<TypeKind>,
}

impl DictEntry {
    fn tombstone() -> Self {
        DictEntry {
            id: "DELETED".to_string(),
            number: String::new(),
            kind: None,
        }
    }

    fn is_tombstone(&self) -> bool {
        self.id == "DELETED" && self.kind.is_none()
    }
}

#[derive(Debug, Default, Clone)]
struct DictTable {
    by_name: IndexMap<String, u32>,
    entries: Vec<DictEntry>,
}

/// Three parallel string-to-id tables: shared ids (INFO/FILTER/FORMAT),
/// contigs, and samples. Ids are stable within a file; the first
/// definition of a name wins.
#[derive(Debug, Default, Clone)]
pub struct Dictionary {
    tables: [DictTable; 3],
}

impl Dictionary {
    pub const ID: usize = 0;
    pub const CONTIG: usize = 1;
    pub const SAMPLE: usize = 2;

    pub fn id_of(&self, which: usize, name: &str) -> Option<u32> {
        self.tables[which].by_name.get(name).copied()
    }

    pub fn entry(&self, which: usize, id: u32) -> Option<&DictEntry> {
        self.tables[which].entries.get(id as usize)
    }

    pub fn len(&self, which: usize) -> usize {
        self.tables[which].entries.len()
    }

    pub fn is_empty(&self, which: usize) -> bool {
        self.tables[which].entries.is_empty()
    }

    /// Appends `entry` unless its name is already bound; returns its id.
    pub fn insert(&mut self, which: usize, entry: DictEntry) -> u32 {
        let table = &mut self.tables[which];
        if let Some(&id) = table.by_name.get(&entry.id) {
            return id;
        }
        let id = table.entries.len() as u32;
        table.by_name.insert(entry.id.clone(), id);
        table.entries.push(entry);
        id
    }

    /// Binds `entry` to the explicit slot `idx`, filling any lower empty
    /// slots with tombstones.
    pub fn insert_at(&mut self, which: usize, idx: u32, entry: DictEntry) -> u32 {
        let table = &mut self.tables[which];
        if let Some(&id) = table.by_name.get(&entry.id) {
            return id;
        }
        while table.entries.len() <= idx as usize {
            table.entries.push(DictEntry::tombstone());
        }
        if table.entries[idx as usize].is_tombstone() {
            table.by_name.insert(entry.id.clone(), idx);
            table.entries[idx as usize] = entry;
            idx
        } else {
            // the slot is taken; fall back to appending
            let id = table.entries.len() as u32;
            table.by_name.insert(entry.id.clone(), id);
            table.entries.push(entry);
            id
        }
    }
}

/// Parsed file header: raw key/value lines, the structured INFO/FORMAT
/// views, the dictionaries, phasing, and the sample list.
#[derive(Debug, Default, Clone, Getters)]
pub struct Header {
    #[getset(get = "pub")]
    meta: MultiMap<String, String>,
    #[getset(get = "pub")]
    dict: Dictionary,
    info: Vec<HeaderValueDetails>,
    info_map: HashMap<String, usize>,
    format: Vec<HeaderValueDetails>,
    format_map: HashMap<String, usize>,
    #[getset(get = "pub")]
    phasing: Phasing,
    #[getset(get = "pub")]
    samples: Vec<String>,
}

impl Header {
    /// An empty header with `PASS` pre-registered at id slot 0.
    pub fn new() -> Self {
        let mut header = Header::default();
        header.dict.insert(
            Dictionary::ID,
            DictEntry {
                id: "PASS".to_string(),
                number: String::new(),
                kind: None,
            },
        );
        header
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn info_header(&self, id: &str) -> Option<&HeaderValueDetails> {
        self.info_map.get(id).map(|&i| &self.info[i])
    }

    pub fn format_header(&self, id: &str) -> Option<&HeaderValueDetails> {
        self.format_map.get(id).map(|&i| &self.format[i])
    }

    pub fn set_samples(&mut self, samples: Vec<String>) {
        let dict = &mut self.dict;
        for name in &samples {
            dict.insert(
                Dictionary::SAMPLE,
                DictEntry {
                    id: name.clone(),
                    number: String::new(),
                    kind: None,
                },
            );
        }
        self.samples = samples;
    }

    /// Folds one `key=value` header pair into the dictionaries and the
    /// structured views. Insertion order is preserved; the first definition
    /// of an id wins.
    pub fn process_header_pair(&mut self, key: &str, value: &str) {
        self.meta.insert(key.to_string(), value.to_string());

        let details = parse_header_value(value);
        if let Some(details) = details.as_ref().filter(|d| !d.id().is_empty()) {
            let which = match key {
                "contig" => Some(Dictionary::CONTIG),
                "INFO" | "FILTER" | "FORMAT" => Some(Dictionary::ID),
                "SAMPLE" => Some(Dictionary::SAMPLE),
                _ => None,
            };
            if let Some(which) = which {
                let kind = match details.ty().as_str() {
                    "Integer" => Some(TypeKind::Int32),
                    "Float" => Some(TypeKind::Float32),
                    "String" | "Character" => Some(TypeKind::String),
                    "Flag" => Some(TypeKind::Int8),
                    _ => None,
                };
                let entry = DictEntry {
                    id: details.id().clone(),
                    number: details.number().clone(),
                    kind,
                };
                match details.idx() {
                    Some(idx) => self.dict.insert_at(which, *idx, entry),
                    None => self.dict.insert(which, entry),
                };
            }

            match key {
                "INFO" => {
                    if !self.info_map.contains_key(details.id()) {
                        self.info_map.insert(details.id().clone(), self.info.len());
                        self.info.push(details.clone());
                    }
                }
                "FORMAT" => {
                    if !self.format_map.contains_key(details.id()) {
                        self.format_map
                            .insert(details.id().clone(), self.format.len());
                        self.format.push(details.clone());
                    }
                }
                _ => {}
            }
        }

        if key == "phasing" {
            if let Ok(phasing) = value.parse() {
                self.phasing = phasing;
            }
        }
    }

    /// Builds a write-side header from raw pairs and sample ids: strips
    /// `IDX=` fields, normalizes the GT declaration, and injects a
    /// synthetic `PH` FORMAT when mixed phasing needs per-call phase bits.
    /// Returns the header together with the amended pair list to emit.
    pub fn for_writing(
        headers: Vec<(String, String)>,
        samples: Vec<String>,
    ) -> Result<(Header, Vec<(String, String)>)> {
        let mut header = Header::new();
        let mut amended = Vec::with_capacity(headers.len() + 1);
        let mut gt_present = false;
        let mut ph_present = false;

        for (key, value) in headers {
            let mut value = strip_idx(&value);
            if key == "FORMAT" {
                if let Some(details) = parse_header_value(&value) {
                    if details.id() == "GT" {
                        if details.ty() == "String" {
                            value = "<ID=GT,Number=.,Type=Integer,Description=\"Genotype\">"
                                .to_string();
                        }
                        gt_present = true;
                    } else if details.id() == "PH" {
                        ph_present = true;
                    }
                }
            }
            header.process_header_pair(&key, &value);
            amended.push((key, value));
        }

        if matches!(header.phasing, Phasing::Unknown | Phasing::Partial) && gt_present && !ph_present
        {
            let ph = (
                "FORMAT".to_string(),
                "<ID=PH,Number=.,Type=Integer,Description=\"Genotype phase\">".to_string(),
            );
            header.process_header_pair(&ph.0, &ph.1);
            amended.push(ph);
        }

        header.set_samples(samples);
        Ok((header, amended))
    }

    /// Resolves a contig name, or reports the dictionary miss.
    pub fn contig_id(&self, name: &str) -> Result<u32> {
        self.dict
            .id_of(Dictionary::CONTIG, name)
            .ok_or_else(|| SavError::UnknownKey(name.to_string()))
    }

    pub fn contig_name(&self, id: u32) -> Option<&str> {
        self.dict
            .entry(Dictionary::CONTIG, id)
            .map(|e| e.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_value_parsing() {
        let details = parse_header_value(
            "<ID=DP,Number=1,Type=Integer,Description=\"Total depth, all samples\">",
        )
        .unwrap();
        assert_eq!(details.id(), "DP");
        assert_eq!(details.number(), "1");
        assert_eq!(details.ty(), "Integer");
        assert_eq!(details.description(), "Total depth, all samples");
        assert_eq!(details.idx(), &None);
    }

    #[test]
    fn idx_reserves_slot_with_tombstones() {
        let mut header = Header::new();
        header.process_header_pair("INFO", "<ID=END,Number=1,Type=Integer,IDX=5>");
        // PASS holds slot 0, 1..=4 are tombstones, END lands at 5
        assert_eq!(header.dict().id_of(Dictionary::ID, "END"), Some(5));
        assert_eq!(header.dict().len(Dictionary::ID), 6);
        header.process_header_pair("INFO", "<ID=DP,Number=1,Type=Integer>");
        assert_eq!(header.dict().id_of(Dictionary::ID, "DP"), Some(6));
    }

    #[test]
    fn first_definition_wins() {
        let mut header = Header::new();
        header.process_header_pair("INFO", "<ID=DP,Number=1,Type=Integer>");
        header.process_header_pair("INFO", "<ID=DP,Number=.,Type=Float>");
        assert_eq!(header.info_header("DP").unwrap().ty(), "Integer");
        assert_eq!(header.dict().len(Dictionary::ID), 2);
    }

    #[test]
    fn phasing_header_is_parsed() {
        let mut header = Header::new();
        assert_eq!(*header.phasing(), Phasing::Unknown);
        header.process_header_pair("phasing", "partial");
        assert_eq!(*header.phasing(), Phasing::Partial);
        header.process_header_pair("phasing", "full");
        assert_eq!(*header.phasing(), Phasing::Phased);
    }

    #[test]
    fn ph_injection_under_partial_phasing() {
        let headers = vec![
            ("phasing".to_string(), "partial".to_string()),
            (
                "FORMAT".to_string(),
                "<ID=GT,Number=.,Type=Integer,Description=\"Genotype\">".to_string(),
            ),
        ];
        let (header, amended) = Header::for_writing(headers, vec!["s1".to_string()]).unwrap();
        assert!(header.format_header("PH").is_some());
        assert!(amended.iter().any(|(k, v)| k == "FORMAT" && v.contains("ID=PH")));
        assert!(header.dict().id_of(Dictionary::ID, "PH").is_some());
    }

    #[test]
    fn no_ph_injection_when_phased() {
        let headers = vec![
            ("phasing".to_string(), "phased".to_string()),
            (
                "FORMAT".to_string(),
                "<ID=GT,Number=.,Type=Integer,Description=\"Genotype\">".to_string(),
            ),
        ];
        let (header, amended) = Header::for_writing(headers, Vec::new()).unwrap();
        assert!(header.format_header("PH").is_none());
        assert_eq!(amended.len(), 2);
    }

    #[test]
    fn gt_string_declaration_is_normalized() {
        let headers = vec![(
            "FORMAT".to_string(),
            "<ID=GT,Number=1,Type=String,Description=\"Genotype\">".to_string(),
        )];
        let (header, amended) = Header::for_writing(headers, Vec::new()).unwrap();
        assert_eq!(header.format_header("GT").unwrap().ty(), "Integer");
        assert!(amended[0].1.contains("Type=Integer"));
    }

    #[test]
    fn strip_idx_rewrites_value() {
        assert_eq!(
            strip_idx("<ID=DP,Number=1,Type=Integer,IDX=3>"),
            "<ID=DP,Number=1,Type=Integer>"
        );
        assert_eq!(strip_idx("<ID=DP,Number=1>"), "<ID=DP,Number=1>");
    }
}
