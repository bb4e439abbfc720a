//! SAV: a compressed columnar container for population-scale variant
//! data. Records are laid out in zstd-compressed blocks with a paged
//! B+-tree index (s1r) over genomic intervals appended as a skippable
//! frame; genotype-like FORMAT fields may be run through a PBWT
//! permutation before compression.

pub mod error;
pub mod header;
pub(crate) mod parser;
pub mod pbwt;
pub mod query;
pub mod reader;
pub mod record;
pub mod s1r;
pub mod sav1;
pub mod value;
pub mod varint;
pub mod vcf;
pub mod writer;

pub use error::{Result, SavError};
pub use header::{Header, Phasing};
pub use query::{BoundingPolicy, IndexedReader, Query, Region};
pub use reader::Reader;
pub use record::Record;
pub use value::{TypeKind, TypedValue};
pub use writer::{IndexMode, Writer, WriterOptions};
