//! Error types for region storage.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegionError>;

#[derive(Error, Debug)]
pub enum RegionError {
    /// The region file was closed; a new instance must be opened.
    #[error("region file {path} is closed")]
    Closed { path: PathBuf },

    /// A reader or writer is already open for this entry.
    #[error("entry {index} already has an open stream")]
    StreamConflict { index: usize },

    #[error("entry index {index} out of range (capacity {capacity})")]
    IndexOutOfRange { index: usize, capacity: usize },

    /// Failure reported by the operating system, passed through unchanged.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Header or length prefix disagrees with the file contents.
    #[error("malformed region file {path}: {reason}")]
    Format { path: PathBuf, reason: String },

    #[error("record of {len} bytes exceeds the maximum record size")]
    RecordTooLarge { len: usize },

    #[error("invalid region configuration: {0}")]
    Config(String),
}

impl RegionError {
    pub fn is_closed(&self) -> bool {
        matches!(self, RegionError::Closed { .. })
    }

    pub(crate) fn format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        RegionError::Format {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<RegionError> for io::Error {
    fn from(err: RegionError) -> Self {
        match err {
            RegionError::Io(e) => e,
            RegionError::Format { .. } => io::Error::new(io::ErrorKind::InvalidData, err),
            RegionError::StreamConflict { .. } => io::Error::new(io::ErrorKind::WouldBlock, err),
            other => io::Error::other(other),
        }
    }
}
