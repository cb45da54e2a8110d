//! Random-access file with an LRU write-back page cache.
//!
//! The file is viewed as a sequence of 4 KB pages. Reads and writes touch
//! only the cached copy; dirty pages reach the disk when they are evicted,
//! on [`CachedRandomAccessFile::flush`], or on close.
//!
//! The logical length grows with every write past the end. Pages are loaded
//! zero-filled past the physical end of the file, so a write far past the end
//! leaves a zero gap behind it.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use srf_metrics::IoMetrics;

/// log2 of the page size.
pub const PAGE_SHIFT: u32 = 12;

/// Size of one cached page in bytes (4 KB).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    ReadWrite,
}

struct Page {
    data: Box<[u8; PAGE_SIZE]>,
    dirty: bool,
}

pub struct CachedRandomAccessFile {
    path: PathBuf,
    mode: AccessMode,
    file: Option<File>,
    pages: LruCache<u64, Page>,
    position: u64,
    length: u64,
    metrics: Option<Arc<IoMetrics>>,
}

impl CachedRandomAccessFile {
    /// Open `path` with room for `capacity` cached pages.
    ///
    /// `ReadWrite` creates the file if it does not exist.
    pub fn open(path: impl AsRef<Path>, mode: AccessMode, capacity: usize) -> io::Result<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "page cache capacity must be non-zero")
        })?;
        let path = path.as_ref().to_path_buf();

        let file = match mode {
            AccessMode::Read => OpenOptions::new().read(true).open(&path)?,
            AccessMode::ReadWrite => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?,
        };
        let length = file.metadata()?.len();

        Ok(Self {
            path,
            mode,
            file: Some(file),
            pages: LruCache::new(capacity),
            position: 0,
            length,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<IoMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    /// Logical length, including bytes still only in the cache.
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Number of pages currently held in memory.
    pub fn cached_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn seek(&mut self, pos: u64) -> io::Result<()> {
        self.ensure_open()?;
        self.position = pos;
        Ok(())
    }

    /// Fill `buf` from the current position, failing if it runs past the end.
    pub fn read_fully(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.ensure_open()?;
        let end = self.position + buf.len() as u64;
        if end > self.length {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "read of {} bytes at {} passes end of {} ({} bytes)",
                    buf.len(),
                    self.position,
                    self.path.display(),
                    self.length
                ),
            ));
        }

        let mut done = 0;
        while done < buf.len() {
            let pos = self.position;
            let offset = (pos as usize) & (PAGE_SIZE - 1);
            let n = std::cmp::min(PAGE_SIZE - offset, buf.len() - done);
            let page = self.page_mut(pos >> PAGE_SHIFT)?;
            buf[done..done + n].copy_from_slice(&page.data[offset..offset + n]);
            done += n;
            self.position += n as u64;
        }
        Ok(())
    }

    /// Write `buf` at the current position into the cache.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.ensure_open()?;
        if self.mode == AccessMode::Read {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is open read-only", self.path.display()),
            ));
        }

        let mut done = 0;
        while done < buf.len() {
            let pos = self.position;
            let offset = (pos as usize) & (PAGE_SIZE - 1);
            let n = std::cmp::min(PAGE_SIZE - offset, buf.len() - done);
            let page = self.page_mut(pos >> PAGE_SHIFT)?;
            page.data[offset..offset + n].copy_from_slice(&buf[done..done + n]);
            page.dirty = true;
            done += n;
            self.position += n as u64;
        }
        self.length = self.length.max(self.position);
        Ok(())
    }

    pub fn read_u8(&mut self) -> io::Result<u8> {
        let mut b = [0u8; 1];
        self.read_fully(&mut b)?;
        Ok(b[0])
    }

    pub fn read_i16(&mut self) -> io::Result<i16> {
        let mut b = [0u8; 2];
        self.read_fully(&mut b)?;
        Ok(i16::from_be_bytes(b))
    }

    pub fn read_i32(&mut self) -> io::Result<i32> {
        let mut b = [0u8; 4];
        self.read_fully(&mut b)?;
        Ok(i32::from_be_bytes(b))
    }

    pub fn read_u32(&mut self) -> io::Result<u32> {
        let mut b = [0u8; 4];
        self.read_fully(&mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    pub fn read_i64(&mut self) -> io::Result<i64> {
        let mut b = [0u8; 8];
        self.read_fully(&mut b)?;
        Ok(i64::from_be_bytes(b))
    }

    pub fn write_u8(&mut self, v: u8) -> io::Result<()> {
        self.write(&[v])
    }

    pub fn write_i16(&mut self, v: i16) -> io::Result<()> {
        self.write(&v.to_be_bytes())
    }

    pub fn write_i32(&mut self, v: i32) -> io::Result<()> {
        self.write(&v.to_be_bytes())
    }

    pub fn write_u32(&mut self, v: u32) -> io::Result<()> {
        self.write(&v.to_be_bytes())
    }

    pub fn write_i64(&mut self, v: i64) -> io::Result<()> {
        self.write(&v.to_be_bytes())
    }

    /// Write every dirty page back and sync file data. Pages stay cached.
    pub fn flush(&mut self) -> io::Result<()> {
        let Some(file) = self.file.as_ref() else {
            return Err(closed_error(&self.path));
        };

        // Ascending order keeps the write-back sequential.
        let mut dirty: Vec<u64> = self
            .pages
            .iter()
            .filter(|(_, page)| page.dirty)
            .map(|(index, _)| *index)
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }
        dirty.sort_unstable();

        for index in dirty {
            if let Some(page) = self.pages.peek_mut(&index) {
                write_page(file, index, &page.data[..], self.length)?;
                page.dirty = false;
                if let Some(m) = &self.metrics {
                    m.record_write_back();
                }
            }
        }
        file.sync_data()
    }

    /// Flush and release the file handle. Calling it again is a no-op.
    pub fn close(&mut self) -> io::Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        if self.mode == AccessMode::ReadWrite {
            self.flush()?;
        }
        if let Some(file) = self.file.take() {
            if self.mode == AccessMode::ReadWrite {
                file.sync_all()?;
            }
        }
        self.pages.clear();
        log::debug!("Closed {}", self.path.display());
        Ok(())
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.file.is_none() {
            return Err(closed_error(&self.path));
        }
        Ok(())
    }

    /// Cached page `index`, loading it (and evicting the LRU page) on a miss.
    fn page_mut(&mut self, index: u64) -> io::Result<&mut Page> {
        let Some(file) = self.file.as_ref() else {
            return Err(closed_error(&self.path));
        };

        if self.pages.contains(&index) {
            if let Some(m) = &self.metrics {
                m.record_page_hit();
            }
        } else {
            if let Some(m) = &self.metrics {
                m.record_page_miss();
            }

            if self.pages.len() == self.pages.cap().get() {
                // Write back before dropping so a failed write keeps the page.
                if let Some((&victim, page)) = self.pages.peek_lru() {
                    if page.dirty {
                        write_page(file, victim, &page.data[..], self.length)?;
                        if let Some(m) = &self.metrics {
                            m.record_write_back();
                        }
                    }
                }
                self.pages.pop_lru();
                if let Some(m) = &self.metrics {
                    m.record_eviction();
                }
            }

            let data = load_page(file, index)?;
            self.pages.put(index, Page { data, dirty: false });
        }

        self.pages
            .get_mut(&index)
            .ok_or_else(|| io::Error::other(format!("page {} missing from cache", index)))
    }
}

impl Drop for CachedRandomAccessFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Failed to close {}: {:?}", self.path.display(), e);
        }
    }
}

fn closed_error(path: &Path) -> io::Error {
    io::Error::other(format!("{} is closed", path.display()))
}

fn load_page(file: &File, index: u64) -> io::Result<Box<[u8; PAGE_SIZE]>> {
    let mut data = Box::new([0u8; PAGE_SIZE]);
    let mut f = file;
    f.seek(SeekFrom::Start(index << PAGE_SHIFT))?;

    // Anything past the physical end stays zero.
    let mut filled = 0;
    while filled < PAGE_SIZE {
        match f.read(&mut data[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(data)
}

/// Write a page, clipped so the file never grows past `length`.
fn write_page(file: &File, index: u64, data: &[u8], length: u64) -> io::Result<()> {
    let start = index << PAGE_SHIFT;
    if start >= length {
        return Ok(());
    }
    let n = std::cmp::min(PAGE_SIZE as u64, length - start) as usize;
    let mut f = file;
    f.seek(SeekFrom::Start(start))?;
    f.write_all(&data[..n])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn open_rw(path: &Path, pages: usize) -> CachedRandomAccessFile {
        CachedRandomAccessFile::open(path, AccessMode::ReadWrite, pages).unwrap()
    }

    #[test]
    fn test_ramp_across_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ramp.dat");
        let mut file = open_rw(&path, 4);

        let ramp: Vec<u8> = (0..PAGE_SIZE * 3 + 100).map(|i| (i % 251) as u8).collect();
        file.seek(17).unwrap();
        file.write(&ramp).unwrap();
        assert_eq!(file.position(), 17 + ramp.len() as u64);

        file.seek(17).unwrap();
        let mut back = vec![0u8; ramp.len()];
        file.read_fully(&mut back).unwrap();
        assert_eq!(back, ramp);
        assert_eq!(file.length(), 17 + ramp.len() as u64);
    }

    #[test]
    fn test_int_straddles_page_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("straddle.dat");
        let mut file = open_rw(&path, 2);

        let pos = PAGE_SIZE as u64 - 2;
        file.seek(pos).unwrap();
        file.write_i32(0x1234_5678).unwrap();
        file.write_i64(-42).unwrap();

        file.seek(pos).unwrap();
        assert_eq!(file.read_i32().unwrap(), 0x1234_5678);
        assert_eq!(file.read_i64().unwrap(), -42);

        file.close().unwrap();
        let mut file = open_rw(&path, 2);
        file.seek(pos).unwrap();
        assert_eq!(file.read_i32().unwrap(), 0x1234_5678);
    }

    #[test]
    fn test_primitives_are_big_endian() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("be.dat");
        let mut file = open_rw(&path, 1);

        file.write_u8(0xAB).unwrap();
        file.write_i16(0x0102).unwrap();
        file.write_u32(0xDEAD_BEEF).unwrap();
        file.close().unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw, vec![0xAB, 0x01, 0x02, 0xDE, 0xAD, 0xBE, 0xEF]);

        let mut file = CachedRandomAccessFile::open(&path, AccessMode::Read, 1).unwrap();
        assert_eq!(file.read_u8().unwrap(), 0xAB);
        assert_eq!(file.read_i16().unwrap(), 0x0102);
        assert_eq!(file.read_u32().unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_eviction_writes_back_dirty_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evict.dat");
        let metrics = Arc::new(IoMetrics::new());
        let mut file = open_rw(&path, 1).with_metrics(metrics.clone());

        for page in 0..6u64 {
            file.seek(page * PAGE_SIZE as u64).unwrap();
            file.write(&[page as u8 + 1; 16]).unwrap();
        }
        assert_eq!(file.cached_pages(), 1);
        assert_eq!(metrics.page_evictions.load(Ordering::Relaxed), 5);

        // Evicted pages were written back; reading them reloads from disk.
        for page in 0..6u64 {
            file.seek(page * PAGE_SIZE as u64).unwrap();
            let mut buf = [0u8; 16];
            file.read_fully(&mut buf).unwrap();
            assert_eq!(buf, [page as u8 + 1; 16]);
        }
        assert!(metrics.page_write_backs.load(Ordering::Relaxed) >= 5);
    }

    #[test]
    fn test_durable_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("durable.dat");

        let mut file = open_rw(&path, 8);
        file.seek(10_000).unwrap();
        file.write(b"hello").unwrap();
        // Nothing written back yet.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
        file.close().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10_005);

        let mut file = open_rw(&path, 8);
        assert_eq!(file.length(), 10_005);
        file.seek(10_000).unwrap();
        let mut buf = [0u8; 5];
        file.read_fully(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        // Never-written gap reads back as zero.
        file.seek(0).unwrap();
        let mut gap = vec![0xFFu8; 10_000];
        file.read_fully(&mut gap).unwrap();
        assert!(gap.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_past_end_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eof.dat");
        let mut file = open_rw(&path, 1);
        file.write(&[1, 2, 3]).unwrap();

        file.seek(1).unwrap();
        let mut buf = [0u8; 4];
        let err = file.read_fully(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.dat");
        std::fs::write(&path, [7u8; 8]).unwrap();

        let mut file = CachedRandomAccessFile::open(&path, AccessMode::Read, 1).unwrap();
        let err = file.write(&[1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert_eq!(file.read_u8().unwrap(), 7);
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("close.dat");
        let mut file = open_rw(&path, 1);
        file.write_i32(5).unwrap();

        file.close().unwrap();
        file.close().unwrap();
        assert!(file.is_closed());
        assert!(file.seek(0).is_err());
        assert!(file.read_i32().is_err());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zero.dat");
        let err = CachedRandomAccessFile::open(&path, AccessMode::ReadWrite, 0)
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
