//! Streaming SAV v2 writer: accumulates records into fixed-count blocks,
//! compresses each block into its own zstd frame, maintains the s1r index,
//! and appends it as a skippable frame at close.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::warn;

use crate::error::{Result, SavError};
use crate::header::{Header, Phasing};
use crate::pbwt::PbwtContext;
use crate::record::Record;
use crate::s1r::{self, Entry, IndexWriter};
use crate::varint;

pub const MAGIC: [u8; 5] = *b"SAV\x02\x00";
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 6;
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Where the s1r index goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexMode {
    /// Appended to the container as a skippable zstd frame.
    Embedded,
    /// Written to a separate file; nothing is appended.
    File(PathBuf),
    Disabled,
}

#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub compression_level: i32,
    pub block_size: u32,
    pub index: IndexMode,
    pub pbwt_fields: HashSet<String>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        WriterOptions {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            block_size: DEFAULT_BLOCK_SIZE,
            index: IndexMode::Embedded,
            pbwt_fields: HashSet::new(),
        }
    }
}

impl WriterOptions {
    /// FORMAT fields to run through the PBWT transform.
    pub fn pbwt<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pbwt_fields = fields.into_iter().map(Into::into).collect();
        self
    }
}

pub struct Writer<W: Write> {
    inner: W,
    header: Header,
    uuid: [u8; 16],
    opts: WriterOptions,
    bytes_written: u64,
    block_buf: Vec<u8>,
    record_buf: Vec<u8>,
    current_contig: String,
    records_in_block: u64,
    record_count: u64,
    block_min: u32,
    block_max: u32,
    pending_reset: bool,
    pbwt: PbwtContext,
    index: Option<IndexWriter>,
    failed: bool,
    closed: bool,
}

impl Writer<BufWriter<File>> {
    /// Creates a SAV file at `path`.
    pub fn create<P: AsRef<Path>>(
        path: P,
        headers: Vec<(String, String)>,
        samples: Vec<String>,
        opts: WriterOptions,
    ) -> Result<Self> {
        let file = File::create(path)?;
        Writer::new(BufWriter::new(file), headers, samples, opts)
    }
}

impl<W: Write> Writer<W> {
    /// Wraps `inner`, emitting the container prologue (magic, UUID,
    /// headers, samples) immediately.
    pub fn new(
        mut inner: W,
        headers: Vec<(String, String)>,
        samples: Vec<String>,
        opts: WriterOptions,
    ) -> Result<Self> {
        if opts.block_size == 0 {
            if opts.compression_level != 0 {
                return Err(SavError::Unsupported(
                    "block size 0 requires compression level 0",
                ));
            }
            if opts.index != IndexMode::Disabled && opts.index != IndexMode::Embedded {
                return Err(SavError::Unsupported("block size 0 disables indexing"));
            }
        }

        let (header, amended) = Header::for_writing(headers, samples)?;
        let uuid: [u8; 16] = rand::random();

        let mut prologue = Vec::new();
        prologue.extend_from_slice(&MAGIC);
        prologue.extend_from_slice(&uuid);
        varint::encode(amended.len() as u64, &mut prologue);
        for (key, value) in &amended {
            varint::encode(key.len() as u64, &mut prologue);
            prologue.extend_from_slice(key.as_bytes());
            varint::encode(value.len() as u64, &mut prologue);
            prologue.extend_from_slice(value.as_bytes());
        }
        varint::encode(header.samples().len() as u64, &mut prologue);
        for name in header.samples() {
            varint::encode(name.len() as u64, &mut prologue);
            prologue.extend_from_slice(name.as_bytes());
        }
        inner.write_all(&prologue)?;

        let index = match (&opts.index, opts.block_size) {
            (IndexMode::Disabled, _) | (_, 0) => None,
            _ => Some(IndexWriter::default()),
        };

        Ok(Writer {
            inner,
            header,
            uuid,
            opts,
            bytes_written: prologue.len() as u64,
            block_buf: Vec::new(),
            record_buf: Vec::new(),
            current_contig: String::new(),
            records_in_block: 0,
            record_count: 0,
            block_min: u32::MAX,
            block_max: 0,
            pending_reset: false,
            pbwt: PbwtContext::default(),
            index,
            failed: false,
            closed: false,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn uuid(&self) -> &[u8; 16] {
        &self.uuid
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// File position of the start of the current block's frame.
    pub fn tell(&self) -> u64 {
        self.bytes_written
    }

    fn poisoned() -> SavError {
        SavError::Io(io::Error::new(
            io::ErrorKind::Other,
            "writer poisoned by an earlier error",
        ))
    }

    /// Serializes one record. A failed write poisons the writer; the file
    /// up to the previous record remains valid.
    pub fn write(&mut self, record: &Record) -> Result<()> {
        if self.failed || self.closed {
            return Err(Self::poisoned());
        }
        match self.write_inner(record) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }

    fn write_inner(&mut self, record: &Record) -> Result<()> {
        if self.opts.block_size != 0
            && (self.records_in_block >= u64::from(self.opts.block_size.min(0x1_0000))
                || record.chrom() != &self.current_contig)
        {
            self.flush_block()?;
            self.current_contig = record.chrom().clone();
            self.pending_reset = true;
        }

        // GT under mixed phasing must carry its phase bits
        if matches!(self.header.phasing(), Phasing::Unknown | Phasing::Partial)
            && record.get_format("GT").is_some()
            && record.get_format("PH").is_none()
        {
            return Err(SavError::Unsupported(
                "GT requires a PH field under unknown or partial phasing",
            ));
        }

        self.record_buf.clear();
        let sample_word = if self.pending_reset { 0x80_0000 } else { 0 };
        record.serialize_shared(&mut self.record_buf, &self.header, sample_word)?;
        let shared_len = self.record_buf.len();
        if shared_len > u32::MAX as usize {
            return Err(SavError::OversizedRecord("shared"));
        }
        let pbwt_fields = &self.opts.pbwt_fields;
        record.serialize_indiv(
            &mut self.record_buf,
            &self.header,
            &|key| pbwt_fields.contains(key),
            &mut self.pbwt,
        )?;
        let indiv_len = self.record_buf.len() - shared_len;
        if indiv_len > u32::MAX as usize {
            return Err(SavError::OversizedRecord("individual"));
        }

        if self.opts.block_size == 0 {
            // unblocked raw stream: straight through
            self.inner.write_all(&(shared_len as u32).to_le_bytes())?;
            self.inner.write_all(&(indiv_len as u32).to_le_bytes())?;
            self.inner.write_all(&self.record_buf)?;
            self.bytes_written += 8 + self.record_buf.len() as u64;
        } else {
            self.block_buf
                .extend_from_slice(&(shared_len as u32).to_le_bytes());
            self.block_buf
                .extend_from_slice(&(indiv_len as u32).to_le_bytes());
            self.block_buf.extend_from_slice(&self.record_buf);
        }

        self.block_min = self.block_min.min(record.pos());
        self.block_max = self.block_max.max(record.end_position());
        self.records_in_block += 1;
        self.record_count += 1;
        self.pending_reset = false;
        Ok(())
    }

    /// Compresses and emits the pending block, recording its index entry.
    fn flush_block(&mut self) -> Result<()> {
        if self.records_in_block == 0 {
            return Ok(());
        }
        if let Some(index) = &mut self.index {
            let entry = Entry::new(
                u64::from(self.block_min),
                u64::from(self.block_max),
                self.bytes_written,
                self.records_in_block,
            )?;
            index.write(&self.current_contig, entry);
        }

        if self.opts.compression_level > 0 {
            let frame = zstd::stream::encode_all(&self.block_buf[..], self.opts.compression_level)?;
            self.inner.write_all(&frame)?;
            self.bytes_written += frame.len() as u64;
        } else {
            self.inner.write_all(&self.block_buf)?;
            self.bytes_written += self.block_buf.len() as u64;
        }

        self.block_buf.clear();
        self.records_in_block = 0;
        self.block_min = u32::MAX;
        self.block_max = 0;
        self.pbwt.reset();
        Ok(())
    }

    /// Finalizes the stream: flushes the last block and appends (or writes
    /// out) the s1r index. Must be called; dropping an unclosed writer
    /// leaves the file without its embedded index.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.failed {
            return Err(Self::poisoned());
        }
        self.flush_block()?;
        self.closed = true;

        if let Some(index) = self.index.take() {
            if !index.is_empty() {
                match &self.opts.index {
                    IndexMode::Embedded => {
                        if let Some(mut tmp) = index.close()? {
                            let len = tmp.metadata()?.len();
                            self.inner.write_all(&s1r::SKIPPABLE_MAGIC.to_le_bytes())?;
                            self.inner.write_all(&(len as u32).to_le_bytes())?;
                            io::copy(&mut tmp, &mut self.inner)?;
                            self.bytes_written += 8 + len;
                        }
                    }
                    IndexMode::File(path) => {
                        if let Some(payload) = index.into_payload()? {
                            let mut out = File::create(path)?;
                            out.write_all(&payload)?;
                        }
                    }
                    IndexMode::Disabled => {}
                }
            }
        }
        self.inner.flush()?;
        Ok(())
    }
}

impl<W: Write> Drop for Writer<W> {
    fn drop(&mut self) {
        if !self.closed && !self.failed && self.record_count > 0 {
            warn!("SAV writer dropped without close(); embedded index not written");
        }
    }
}
