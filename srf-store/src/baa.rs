//! The byte-array-array abstraction: a fixed number of addressable,
//! variable-length records exposed as streams.

use std::io::{Read, Write};

use crate::error::Result;

/// A writer whose bytes only become visible once committed.
pub trait Commit {
    /// Publish the buffered bytes as the entry's new value.
    fn commit(self) -> Result<()>;
}

/// Fixed-capacity collection of byte records with an open/closed lifecycle.
///
/// Every method except [`is_closed`](ByteArrayArray::is_closed) fails with
/// [`RegionError::Closed`](crate::RegionError::Closed) once the array has
/// been closed. At most one stream may be open per index; asking for a
/// second one fails with
/// [`RegionError::StreamConflict`](crate::RegionError::StreamConflict).
pub trait ByteArrayArray: Send + Sync {
    type Reader<'a>: Read
    where
        Self: 'a;
    type Writer<'a>: Write + Commit
    where
        Self: 'a;

    /// Stream over the current bytes at `index`. Empty if nothing was stored.
    fn input_stream(&self, index: usize) -> Result<Self::Reader<'_>>;

    /// Buffering stream that replaces the record at `index` on commit.
    fn output_stream(&self, index: usize) -> Result<Self::Writer<'_>>;

    /// Whether `index` currently holds a record.
    fn exists(&self, index: usize) -> Result<bool>;

    /// Close and release the backing resources, unless a stream is open.
    fn attempt_close(&self) -> Result<bool>;

    fn is_timed_out(&self) -> bool;

    /// Close if idle for longer than the timeout and no stream is open.
    fn close_if_timed_out(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    /// Convenience: read the whole record at `index`.
    fn read_entry(&self, index: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.input_stream(index)?.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Convenience: replace the record at `index` with `data`.
    fn write_entry(&self, index: usize, data: &[u8]) -> Result<()> {
        let mut writer = self.output_stream(index)?;
        writer.write_all(data)?;
        writer.commit()
    }
}
