use std::io;

use thiserror::Error;

/// Errors surfaced by the SAV core.
///
/// Encoding errors abort the current record and poison the writer; the file
/// up to the previous record remains valid. Decoding errors poison the
/// reader, whose iterator yields the error once and then stops.
#[derive(Debug, Error)]
pub enum SavError {
    #[error("input ended mid-structure")]
    Truncated,
    #[error("varint wider than 64 bits")]
    Overflow,
    #[error("container signature mismatch")]
    BadMagic,
    #[error("unsupported container version {0}.{1}")]
    BadVersion(u8, u8),
    #[error("unknown or illegal type tag {0:#04x}")]
    BadType(u8),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("key not present in header dictionary: {0}")]
    UnknownKey(String),
    #[error("FORMAT size {size} is not a multiple of sample count {n_samples}")]
    BadStride { size: usize, n_samples: usize },
    #[error("{0} block exceeds the 32-bit size limit")]
    OversizedRecord(&'static str),
    #[error("{0}")]
    IndexOverflow(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SavError>;

impl From<nom::Err<nom::error::Error<&[u8]>>> for SavError {
    fn from(err: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        match err {
            nom::Err::Incomplete(_) => SavError::Truncated,
            nom::Err::Error(e) | nom::Err::Failure(e) => {
                SavError::BadType(e.input.first().copied().unwrap_or(0))
            }
        }
    }
}
