//! Streaming SAV v2 reader: parses the container prologue, then iterates
//! records from the decompressed frame stream, undoing PBWT permutations
//! and honoring the in-band reset flag.

use std::collections::HashSet;
use std::convert::TryInto;
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read};
use std::path::Path;

use crate::error::{Result, SavError};
use crate::header::Header;
use crate::pbwt::PbwtContext;
use crate::record::Record;
use crate::s1r;
use crate::writer::MAGIC;

/// Raw byte stream with the peeked frame-detection bytes stitched back on.
type Tail<R> = io::Chain<Cursor<Vec<u8>>, R>;

enum Stream<R: Read> {
    Raw(Tail<R>),
    Zstd(zstd::stream::read::Decoder<'static, BufReader<Tail<R>>>),
}

impl<R: Read> Read for Stream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Raw(inner) => inner.read(buf),
            Stream::Zstd(inner) => inner.read(buf),
        }
    }
}

/// Reads one unsigned LEB128 varint byte-by-byte off a stream.
pub(crate) fn read_varint<R: Read>(input: &mut R) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let mut byte = [0u8; 1];
        input.read_exact(&mut byte)?;
        if shift >= 64 {
            return Err(SavError::Overflow);
        }
        value |= u64::from(byte[0] & 0x7F) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn read_string<R: Read>(input: &mut R) -> Result<String> {
    let len = read_varint(input)? as usize;
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

struct CountingReader<'a, R: Read> {
    inner: &'a mut R,
    consumed: u64,
}

impl<'a, R: Read> Read for CountingReader<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed += n as u64;
        Ok(n)
    }
}

/// Parses the container prologue, returning the header, the file UUID,
/// and the byte offset of the first record frame.
pub(crate) fn read_prologue<R: Read>(input: &mut R) -> Result<(Header, [u8; 16], u64)> {
    let mut counted = CountingReader {
        inner: input,
        consumed: 0,
    };
    let mut magic = [0u8; 5];
    counted.read_exact(&mut magic)?;
    if magic[..3] != MAGIC[..3] {
        return Err(SavError::BadMagic);
    }
    if magic[3..] != MAGIC[3..] {
        return Err(SavError::BadVersion(magic[3], magic[4]));
    }
    let mut uuid = [0u8; 16];
    counted.read_exact(&mut uuid)?;

    let mut header = Header::new();
    let n_headers = read_varint(&mut counted)?;
    for _ in 0..n_headers {
        let key = read_string(&mut counted)?;
        let value = read_string(&mut counted)?;
        header.process_header_pair(&key, &value);
    }
    let n_samples = read_varint(&mut counted)?;
    let mut samples = Vec::with_capacity(n_samples as usize);
    for _ in 0..n_samples {
        samples.push(read_string(&mut counted)?);
    }
    header.set_samples(samples);

    let data_start = counted.consumed;
    Ok((header, uuid, data_start))
}

pub struct Reader<R: Read> {
    header: Header,
    uuid: [u8; 16],
    stream: Stream<R>,
    compressed: bool,
    pbwt: PbwtContext,
    subset: Option<(Vec<Option<usize>>, usize)>,
    failed: bool,
    finished: bool,
}

impl Reader<BufReader<File>> {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Reader::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read> Reader<R> {
    pub fn new(mut input: R) -> Result<Self> {
        let (header, uuid, _) = read_prologue(&mut input)?;

        // sniff the first frame: zstd magic means compressed blocks,
        // anything else is the level-0 raw layout
        let mut peeked = Vec::with_capacity(4);
        let mut byte = [0u8; 1];
        while peeked.len() < 4 {
            match input.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => peeked.push(byte[0]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        let compressed = peeked.len() == 4
            && u32::from_le_bytes([peeked[0], peeked[1], peeked[2], peeked[3]]) == s1r::ZSTD_MAGIC;
        let tail = Cursor::new(peeked).chain(input);
        let stream = if compressed {
            Stream::Zstd(zstd::stream::read::Decoder::new(tail)?)
        } else {
            Stream::Raw(tail)
        };

        Ok(Reader {
            header,
            uuid,
            stream,
            compressed,
            pbwt: PbwtContext::default(),
            subset: None,
            failed: false,
            finished: false,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn uuid(&self) -> &[u8; 16] {
        &self.uuid
    }

    pub fn samples(&self) -> &[String] {
        self.header.samples()
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Restricts every subsequent record to the given sample ids; returns
    /// the intersection in file order.
    pub fn subset_samples(&mut self, ids: &HashSet<String>) -> Vec<String> {
        let mut map = Vec::with_capacity(self.header.n_samples());
        let mut kept_names = Vec::new();
        for name in self.header.samples() {
            if ids.contains(name) {
                map.push(Some(kept_names.len()));
                kept_names.push(name.clone());
            } else {
                map.push(None);
            }
        }
        self.subset = Some((map, kept_names.len()));
        kept_names
    }

    /// Reads the next record, or `None` at end of stream.
    fn read_record(&mut self) -> Result<Option<Record>> {
        let record = read_record_from(&mut self.stream, &self.header, &mut self.pbwt, self.compressed)?;
        match record {
            None => Ok(None),
            Some(mut record) => {
                if let Some((map, kept)) = &self.subset {
                    record.subset_format(map, *kept)?;
                }
                Ok(Some(record))
            }
        }
    }
}

/// Reads one length-prefixed record off a decompressed stream. `None` at a
/// clean end of stream, or when a raw-layout stream runs into the index
/// trailer.
pub(crate) fn read_record_from<S: Read>(
    stream: &mut S,
    header: &Header,
    pbwt: &mut PbwtContext,
    compressed: bool,
) -> Result<Option<Record>> {
    let mut len_words = [0u8; 8];
    match read_exact_or_eof(stream, &mut len_words)? {
        ReadOutcome::Eof => return Ok(None),
        ReadOutcome::Full => {}
    }
    let shared_len = u32::from_le_bytes(len_words[0..4].try_into().unwrap());
    let indiv_len = u32::from_le_bytes(len_words[4..8].try_into().unwrap());
    if !compressed && shared_len == s1r::SKIPPABLE_MAGIC {
        return Ok(None);
    }
    let mut payload = vec![0u8; shared_len as usize + indiv_len as usize];
    stream.read_exact(&mut payload)?;
    let (shared, indiv) = payload.split_at(shared_len as usize);
    Record::deserialize(shared, indiv, header, pbwt).map(Some)
}

enum ReadOutcome {
    Full,
    Eof,
}

/// `read_exact` that reports a clean end-of-stream at a record boundary.
/// An error with zero bytes consumed is treated as the end of the stream,
/// which also covers decoders that stop at the trailing skippable frame.
fn read_exact_or_eof<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<ReadOutcome> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => {
                return if filled == 0 {
                    Ok(ReadOutcome::Eof)
                } else {
                    Err(SavError::Truncated)
                }
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if filled == 0 => {
                log::debug!(
                    "treating read error at record boundary as end of stream: {}",
                    e
                );
                return Ok(ReadOutcome::Eof);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(ReadOutcome::Full)
}

impl<R: Read> Iterator for Reader<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.finished {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
