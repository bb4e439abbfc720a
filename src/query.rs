//! Point and range queries: the s1r index resolves a contig interval to
//! candidate blocks, the reader seeks and decodes them, and a bounding
//! policy filters individual records.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use log::warn;
use strum::EnumString;

use crate::error::{Result, SavError};
use crate::header::Header;
use crate::pbwt::PbwtContext;
use crate::reader::{read_prologue, read_record_from};
use crate::record::Record;
use crate::s1r::{self, Entry, IndexReader};

/// A genomic interval, 1-based and inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    contig: String,
    beg: u64,
    end: u64,
}

impl Region {
    pub fn new<S: Into<String>>(contig: S, beg: u64, end: u64) -> Region {
        Region {
            contig: contig.into(),
            beg,
            end,
        }
    }

    /// Parses `chr`, `chr:pos`, or `chr:beg-end`.
    pub fn parse(text: &str) -> Option<Region> {
        match text.split_once(':') {
            None => Some(Region::new(text, 1, u64::MAX)),
            Some((contig, range)) => match range.split_once('-') {
                None => {
                    let pos: u64 = range.parse().ok()?;
                    Some(Region::new(contig, pos, pos))
                }
                Some((beg, end)) => {
                    Some(Region::new(contig, beg.parse().ok()?, end.parse().ok()?))
                }
            },
        }
    }

    pub fn contig(&self) -> &str {
        &self.contig
    }

    pub fn beg(&self) -> u64 {
        self.beg
    }

    pub fn end(&self) -> u64 {
        self.end
    }
}

/// How a record interval must relate to the query interval to be admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum BoundingPolicy {
    /// Any base of the record interval lies inside the query.
    Any,
    /// The whole record interval lies inside the query.
    All,
    /// The record start lies inside the query.
    Beg,
    /// The record end lies inside the query.
    End,
}

impl Default for BoundingPolicy {
    fn default() -> Self {
        BoundingPolicy::Any
    }
}

impl BoundingPolicy {
    pub fn admits(self, record: &Record, beg: u64, end: u64) -> bool {
        let rec_beg = u64::from(record.pos());
        let rec_end = u64::from(record.end_position());
        match self {
            BoundingPolicy::Any => rec_beg <= end && rec_end >= beg,
            BoundingPolicy::All => rec_beg >= beg && rec_end <= end,
            BoundingPolicy::Beg => rec_beg >= beg && rec_beg <= end,
            BoundingPolicy::End => rec_end >= beg && rec_end <= end,
        }
    }
}

/// Random-access reader over an indexed SAV file.
pub struct IndexedReader<R: Read + Seek> {
    input: R,
    header: Header,
    uuid: [u8; 16],
    data_start: u64,
    compressed: bool,
    index: Option<IndexReader>,
}

impl IndexedReader<BufReader<File>> {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        IndexedReader::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> IndexedReader<R> {
    pub fn new(mut input: R) -> Result<Self> {
        let (header, uuid, data_start) = read_prologue(&mut input)?;

        input.seek(SeekFrom::Start(data_start))?;
        let mut magic = [0u8; 4];
        let compressed = match input.read_exact(&mut magic) {
            Ok(()) => u32::from_le_bytes(magic) == s1r::ZSTD_MAGIC,
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => false,
            Err(e) => return Err(e.into()),
        };

        // an unreadable index downgrades queries to a sequential scan
        let index = match s1r::read_embedded(&mut input, data_start, compressed) {
            Ok(Some(payload)) => match IndexReader::new(payload) {
                Ok(index) => Some(index),
                Err(e) => {
                    warn!("unreadable s1r index, falling back to sequential scan: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("failed to locate s1r index, falling back to sequential scan: {}", e);
                None
            }
        };

        Ok(IndexedReader {
            input,
            header,
            uuid,
            data_start,
            compressed,
            index,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn uuid(&self) -> &[u8; 16] {
        &self.uuid
    }

    pub fn has_index(&self) -> bool {
        self.index.is_some()
    }

    /// All records admitted by `policy` within `region`, in file order.
    /// The returned iterator borrows the reader and advances its cursor.
    pub fn query<'a>(
        &'a mut self,
        region: &Region,
        policy: BoundingPolicy,
    ) -> Result<Query<'a, R>> {
        let (entries, pending) = match self.index.as_ref() {
            Some(index) => (
                index
                    .query(region.contig(), region.beg(), region.end())
                    .collect::<Vec<Entry>>(),
                VecDeque::new(),
            ),
            // no index: decode the whole stream once, filtering as we go
            None => (Vec::new(), self.scan(region, policy)?),
        };
        Ok(Query {
            reader: self,
            entries: entries.into_iter(),
            pending,
            region: region.clone(),
            policy,
            failed: false,
        })
    }

    fn scan(&mut self, region: &Region, policy: BoundingPolicy) -> Result<VecDeque<Record>> {
        self.input.seek(SeekFrom::Start(self.data_start))?;
        let mut pbwt = PbwtContext::default();
        let mut admitted = VecDeque::new();
        if self.compressed {
            let mut stream = zstd::stream::read::Decoder::new(&mut self.input)?;
            while let Some(record) =
                read_record_from(&mut stream, &self.header, &mut pbwt, true)?
            {
                if record.chrom() == region.contig()
                    && policy.admits(&record, region.beg(), region.end())
                {
                    admitted.push_back(record);
                }
            }
        } else {
            while let Some(record) =
                read_record_from(&mut self.input, &self.header, &mut pbwt, false)?
            {
                if record.chrom() == region.contig()
                    && policy.admits(&record, region.beg(), region.end())
                {
                    admitted.push_back(record);
                }
            }
        }
        Ok(admitted)
    }

    /// Decodes the records of one indexed block.
    fn read_block(&mut self, entry: Entry) -> Result<Vec<Record>> {
        self.input.seek(SeekFrom::Start(entry.file_offset()))?;
        let mut pbwt = PbwtContext::default();
        let mut records = Vec::with_capacity(entry.record_count() as usize);
        if self.compressed {
            let mut stream = zstd::stream::read::Decoder::new(&mut self.input)?;
            for _ in 0..entry.record_count() {
                match read_record_from(&mut stream, &self.header, &mut pbwt, true)? {
                    Some(record) => records.push(record),
                    None => return Err(SavError::Truncated),
                }
            }
        } else {
            for _ in 0..entry.record_count() {
                match read_record_from(&mut self.input, &self.header, &mut pbwt, false)? {
                    Some(record) => records.push(record),
                    None => return Err(SavError::Truncated),
                }
            }
        }
        Ok(records)
    }
}

/// Iterator over query results; borrows the reader for its lifetime.
pub struct Query<'a, R: Read + Seek> {
    reader: &'a mut IndexedReader<R>,
    entries: std::vec::IntoIter<Entry>,
    pending: VecDeque<Record>,
    region: Region,
    policy: BoundingPolicy,
    failed: bool,
}

impl<'a, R: Read + Seek> Iterator for Query<'a, R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Some(Ok(record));
            }
            let entry = self.entries.next()?;
            match self.reader.read_block(entry) {
                Ok(records) => {
                    let region = self.region.clone();
                    let policy = self.policy.clone();
                    self.pending.extend(records.into_iter().filter(|record| {
                        record.chrom() == region.contig()
                            && policy.admits(record, region.beg(), region.end())
                    }));
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TypedValue;

    #[test]
    fn region_parsing() {
        assert_eq!(
            Region::parse("chr1:100-200"),
            Some(Region::new("chr1", 100, 200))
        );
        assert_eq!(Region::parse("chr1:150"), Some(Region::new("chr1", 150, 150)));
        assert_eq!(Region::parse("chr1"), Some(Region::new("chr1", 1, u64::MAX)));
        assert_eq!(Region::parse("chr1:x-y"), None);
    }

    #[test]
    fn policy_parsing() {
        assert_eq!("any".parse(), Ok(BoundingPolicy::Any));
        assert_eq!("all".parse(), Ok(BoundingPolicy::All));
        assert_eq!("beg".parse(), Ok(BoundingPolicy::Beg));
        assert_eq!("end".parse(), Ok(BoundingPolicy::End));
        assert!("middle".parse::<BoundingPolicy>().is_err());
    }

    #[test]
    fn bounding_policies_on_record_intervals() {
        // pos 100, ref ACG, alt A: interval [100, 102]
        let record = Record::new("chr1", 100, "ACG", vec!["A".to_string()]);
        for policy in [BoundingPolicy::Any, BoundingPolicy::All, BoundingPolicy::Beg] {
            assert!(policy.admits(&record, 100, 102), "{:?}", policy);
        }
        assert!(BoundingPolicy::End.admits(&record, 100, 102));

        // [102, 102] touches only the record's last base
        assert!(BoundingPolicy::Any.admits(&record, 102, 102));
        assert!(BoundingPolicy::End.admits(&record, 102, 102));
        assert!(!BoundingPolicy::All.admits(&record, 102, 102));
        assert!(!BoundingPolicy::Beg.admits(&record, 102, 102));
    }

    #[test]
    fn end_info_drives_policies() {
        let mut record = Record::new("chr1", 100, "A", vec!["<DEL>".to_string()]);
        record.set_info("END", TypedValue::int_scalar(200));
        assert!(BoundingPolicy::Any.admits(&record, 150, 150));
        assert!(!BoundingPolicy::Beg.admits(&record, 150, 150));
    }
}
