//! Sector-allocated region file.
//!
//! Layout:
//! - Sectors 0..K: allocation table (see [`crate::header`])
//! - Sectors K..: record heap. A record's first sector starts with its
//!   length as a big-endian u32; the rest of its last sector is zero.
//!
//! A record is written into its sectors before the table slot is pointed
//! at them, and the old sectors are freed only after that, so an
//! interrupted write leaves the previous record intact.

use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use srf_metrics::IoMetrics;

use crate::baa::{ByteArrayArray, Commit};
use crate::cached_file::{AccessMode, CachedRandomAccessFile};
use crate::config::RegionConfig;
use crate::error::{RegionError, Result};
use crate::header::{self, Allocation, SectorMap};

/// Bytes taken by the length prefix at the start of every record.
const LENGTH_PREFIX: u64 = 4;

/// Largest payload the u32 length prefix can describe.
pub const MAX_RECORD_BYTES: usize = (u32::MAX as u64 - LENGTH_PREFIX) as usize;

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    allocation: Allocation,
    /// Header slot was inconsistent when the file was opened.
    damaged: bool,
    /// A reader or writer is open.
    busy: bool,
}

struct Inner {
    file: CachedRandomAccessFile,
    slots: Vec<Slot>,
    sectors: SectorMap,
    open_streams: usize,
    last_access: Instant,
    closed: bool,
}

/// Snapshot of a region file's header, for inspection tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionStats {
    pub entries: usize,
    pub allocated_entries: usize,
    pub damaged_entries: usize,
    pub sector_size: usize,
    pub header_sectors: u32,
    pub total_sectors: u32,
    pub used_sectors: u32,
    pub free_sectors: u32,
    pub file_bytes: u64,
}

/// A fixed number of variable-length records stored in one file.
///
/// Safe to share between threads; every metadata change happens under a
/// single lock.
pub struct SimpleRegionFile {
    path: PathBuf,
    sector_exponent: u8,
    header_sectors: u32,
    entries: usize,
    timeout: Duration,
    closed: AtomicBool,
    inner: Mutex<Inner>,
    metrics: Option<Arc<IoMetrics>>,
}

impl SimpleRegionFile {
    /// Open or create the region file at `path`.
    pub fn open(path: impl AsRef<Path>, config: &RegionConfig) -> Result<Self> {
        Self::open_with_metrics(path, config, None)
    }

    pub fn open_with_metrics(
        path: impl AsRef<Path>,
        config: &RegionConfig,
        metrics: Option<Arc<IoMetrics>>,
    ) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();

        let mut file = CachedRandomAccessFile::open(&path, AccessMode::ReadWrite, config.cache_pages)?;
        if let Some(m) = &metrics {
            file = file.with_metrics(m.clone());
        }

        let sector_size = config.sector_size() as u64;
        let header_sectors = config.header_sectors();
        let header_bytes = header_sectors as u64 * sector_size;

        if file.length() == 0 {
            log::debug!("Creating region file {} ({} entries)", path.display(), config.entries);
            file.seek(0)?;
            file.write(&vec![0u8; header_bytes as usize])?;
        } else if file.length() < header_bytes {
            return Err(RegionError::format(
                &path,
                format!("file is {} bytes, header needs {}", file.length(), header_bytes),
            ));
        }

        // A partial last sector still counts as a sector.
        let total_sectors = u32::try_from(file.length().div_ceil(sector_size))
            .map_err(|_| RegionError::format(&path, "file has more sectors than u32 can address"))?;
        let mut sectors = SectorMap::new(header_sectors, total_sectors);

        file.seek(0)?;
        let mut slots = Vec::with_capacity(config.entries);
        for index in 0..config.entries {
            let start = file.read_u32()?;
            let count = file.read_u32()?;
            let allocation = Allocation::from_raw(start, count);
            let mut slot = Slot { allocation, ..Default::default() };

            if allocation.is_allocated() {
                let run = allocation.sectors();
                let in_bounds = count > 0
                    && start >= header_sectors
                    && start as u64 + count as u64 <= total_sectors as u64;
                if in_bounds && sectors.is_free(run.clone()) {
                    sectors.reserve(run);
                } else {
                    log::warn!(
                        "Region file {}: entry {} points at sectors {}+{} which are out of bounds or shared; ignoring it",
                        path.display(), index, start, count
                    );
                    slot.damaged = true;
                }
            }
            slots.push(slot);
        }

        if let Some(m) = &metrics {
            m.record_open();
        }
        log::debug!(
            "Opened region file {}: {} sectors, {} in use",
            path.display(), sectors.len(), sectors.used_count()
        );

        Ok(Self {
            path,
            sector_exponent: config.sector_exponent,
            header_sectors,
            entries: config.entries,
            timeout: config.timeout(),
            closed: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                file,
                slots,
                sectors,
                open_streams: 0,
                last_access: Instant::now(),
                closed: false,
            }),
            metrics,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> usize {
        self.entries
    }

    pub fn sector_size(&self) -> usize {
        1 << self.sector_exponent
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of readers and writers currently open.
    pub fn open_streams(&self) -> usize {
        self.inner.lock().open_streams
    }

    pub fn allocation(&self, index: usize) -> Result<Allocation> {
        self.check_index(index)?;
        let inner = self.lock_open()?;
        Ok(inner.slots[index].allocation)
    }

    pub fn stats(&self) -> Result<RegionStats> {
        let inner = self.lock_open()?;
        Ok(RegionStats {
            entries: self.entries,
            allocated_entries: inner.slots.iter().filter(|s| s.allocation.is_allocated()).count(),
            damaged_entries: inner.slots.iter().filter(|s| s.damaged).count(),
            sector_size: self.sector_size(),
            header_sectors: self.header_sectors,
            total_sectors: inner.sectors.len(),
            used_sectors: inner.sectors.used_count(),
            free_sectors: inner.sectors.free_count(),
            file_bytes: inner.file.length(),
        })
    }

    /// Push cached pages to disk without closing.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.lock_open()?;
        inner.file.flush()?;
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.entries {
            return Err(RegionError::IndexOutOfRange {
                index,
                capacity: self.entries,
            });
        }
        Ok(())
    }

    fn closed_error(&self) -> RegionError {
        RegionError::Closed {
            path: self.path.clone(),
        }
    }

    /// Take the file lock, failing if closed, and mark the file as used.
    fn lock_open(&self) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(self.closed_error());
        }
        inner.last_access = Instant::now();
        Ok(inner)
    }

    fn close_locked(&self, inner: &mut Inner) -> Result<()> {
        inner.file.close()?;
        inner.closed = true;
        self.closed.store(true, Ordering::Release);
        if let Some(m) = &self.metrics {
            m.record_close();
        }
        log::debug!("Closed region file {}", self.path.display());
        Ok(())
    }

    fn release_stream(&self, inner: &mut Inner, index: usize) {
        inner.slots[index].busy = false;
        inner.open_streams -= 1;
        inner.last_access = Instant::now();
    }

    fn read_record(&self, inner: &mut Inner, index: usize) -> Result<Vec<u8>> {
        let slot = inner.slots[index];
        if slot.damaged {
            return Err(RegionError::format(
                &self.path,
                format!("entry {} has an invalid header slot", index),
            ));
        }
        let Allocation::Allocated { start, count } = slot.allocation else {
            return Ok(Vec::new());
        };

        let run_bytes = (count as u64) << self.sector_exponent;
        let offset = (start as u64) << self.sector_exponent;
        if offset + LENGTH_PREFIX > inner.file.length() {
            return Err(RegionError::format(
                &self.path,
                format!("entry {} starts past the end of the file", index),
            ));
        }
        inner.file.seek(offset)?;
        let len = inner.file.read_u32()? as u64;
        if len + LENGTH_PREFIX > run_bytes {
            return Err(RegionError::format(
                &self.path,
                format!("entry {} claims {} bytes but owns {} sectors", index, len, count),
            ));
        }
        // The last sector may be partial, so the run can still be cut short.
        if offset + LENGTH_PREFIX + len > inner.file.length() {
            return Err(RegionError::format(
                &self.path,
                format!("entry {} is truncated: {} bytes claimed, file ends first", index, len),
            ));
        }

        let mut data = vec![0u8; len as usize];
        inner.file.read_fully(&mut data)?;
        Ok(data)
    }

    /// Store `data` as the new value of `index`.
    fn write_record(&self, inner: &mut Inner, index: usize, data: &[u8]) -> Result<()> {
        if data.len() > MAX_RECORD_BYTES {
            return Err(RegionError::RecordTooLarge { len: data.len() });
        }
        let sector_size = self.sector_size() as u64;
        let needed = (data.len() as u64 + LENGTH_PREFIX).div_ceil(sector_size) as u32;

        let slot = inner.slots[index];
        // A damaged slot's sectors were never reserved, so they are not ours to reuse or free.
        let old = if slot.damaged { Allocation::Unallocated } else { slot.allocation };

        let new = match old {
            Allocation::Allocated { start, count } if needed <= count => {
                self.write_run(inner, start, needed, data)?;
                if needed < count {
                    // The shorter slot must not reach the disk before the data does.
                    inner.file.flush()?;
                    let new = Allocation::Allocated { start, count: needed };
                    self.write_slot(inner, index, new)?;
                    // Tail sectors may be reused only once the shorter slot is on disk.
                    inner.file.flush()?;
                    inner.sectors.release(start + needed..start + count);
                    log::debug!("Entry {} shrank in place to {} sectors", index, needed);
                    new
                } else {
                    old
                }
            }
            _ => {
                let start = inner.sectors.find_run(needed);
                let end = start.checked_add(needed).ok_or(RegionError::RecordTooLarge { len: data.len() })?;
                let appended = end.saturating_sub(inner.sectors.len());
                inner.sectors.reserve(start..end);

                let new = Allocation::Allocated { start, count: needed };
                if let Err(e) = self.place_record(inner, index, new, data) {
                    inner.sectors.release(start..end);
                    return Err(e);
                }
                inner.sectors.release(old.sectors());

                if appended > 0 {
                    if let Some(m) = &self.metrics {
                        m.record_append(appended);
                    }
                }
                log::debug!("Entry {} moved from {:?} to sectors {}+{}", index, old, start, needed);
                new
            }
        };

        inner.slots[index].allocation = new;
        inner.slots[index].damaged = false;
        Ok(())
    }

    /// Write `data` into a fresh run, then point the slot at it.
    ///
    /// Both the data and the slot are on disk when this returns, so the
    /// caller may hand the old run back to the free map.
    fn place_record(&self, inner: &mut Inner, index: usize, allocation: Allocation, data: &[u8]) -> Result<()> {
        let Allocation::Allocated { start, count } = allocation else {
            return Ok(());
        };
        self.write_run(inner, start, count, data)?;
        // The slot must not reach the disk before the data does.
        inner.file.flush()?;
        self.write_slot(inner, index, allocation)?;
        inner.file.flush()?;
        Ok(())
    }

    /// Length prefix, payload, then zeros up to the end of the run.
    fn write_run(&self, inner: &mut Inner, start: u32, count: u32, data: &[u8]) -> Result<()> {
        let run_bytes = (count as u64) << self.sector_exponent;
        let padding = (run_bytes - LENGTH_PREFIX - data.len() as u64) as usize;

        inner.file.seek((start as u64) << self.sector_exponent)?;
        inner.file.write_u32(data.len() as u32)?;
        inner.file.write(data)?;
        if padding > 0 {
            inner.file.write(&vec![0u8; padding])?;
        }
        Ok(())
    }

    fn write_slot(&self, inner: &mut Inner, index: usize, allocation: Allocation) -> Result<()> {
        let (start, count) = allocation.to_raw();
        inner.file.seek(header::slot_offset(index))?;
        inner.file.write_u32(start)?;
        inner.file.write_u32(count)?;
        Ok(())
    }

    /// Commit (when `data` is given) and release the writer on `index`.
    fn finish_write(&self, index: usize, data: Option<&[u8]>) -> Result<()> {
        let started = Instant::now();
        let mut inner = self.inner.lock();
        let result = match data {
            Some(data) => self.write_record(&mut inner, index, data),
            None => Ok(()),
        };
        self.release_stream(&mut inner, index);
        drop(inner);

        if let (Some(m), Some(data), Ok(())) = (&self.metrics, data, &result) {
            m.record_write(started.elapsed(), data.len());
        }
        result
    }

    fn finish_read(&self, index: usize) {
        let mut inner = self.inner.lock();
        self.release_stream(&mut inner, index);
    }
}

impl ByteArrayArray for SimpleRegionFile {
    type Reader<'a> = RegionReader<'a>;
    type Writer<'a> = RegionWriter<'a>;

    fn input_stream(&self, index: usize) -> Result<RegionReader<'_>> {
        self.check_index(index)?;
        let started = Instant::now();
        let mut inner = self.lock_open()?;
        if inner.slots[index].busy {
            return Err(RegionError::StreamConflict { index });
        }

        let data = self.read_record(&mut inner, index)?;
        inner.slots[index].busy = true;
        inner.open_streams += 1;
        drop(inner);

        if let Some(m) = &self.metrics {
            m.record_read(started.elapsed(), data.len());
        }
        Ok(RegionReader {
            region: self,
            index,
            data: Cursor::new(data),
        })
    }

    fn output_stream(&self, index: usize) -> Result<RegionWriter<'_>> {
        self.check_index(index)?;
        let mut inner = self.lock_open()?;
        if inner.slots[index].busy {
            return Err(RegionError::StreamConflict { index });
        }
        inner.slots[index].busy = true;
        inner.open_streams += 1;

        Ok(RegionWriter {
            region: self,
            index,
            buf: Vec::new(),
            finished: false,
        })
    }

    fn exists(&self, index: usize) -> Result<bool> {
        self.check_index(index)?;
        let inner = self.lock_open()?;
        Ok(inner.slots[index].allocation.is_allocated())
    }

    fn attempt_close(&self) -> Result<bool> {
        let mut inner = self.lock_open()?;
        if inner.open_streams > 0 {
            return Ok(false);
        }
        self.close_locked(&mut inner)?;
        Ok(true)
    }

    fn is_timed_out(&self) -> bool {
        self.inner.lock().last_access.elapsed() > self.timeout
    }

    fn close_if_timed_out(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(self.closed_error());
        }
        if inner.open_streams > 0 || inner.last_access.elapsed() <= self.timeout {
            return Ok(());
        }
        log::debug!("Region file {} idle for {:?}, closing", self.path.display(), inner.last_access.elapsed());
        self.close_locked(&mut inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Reader over one record. The entry stays busy until it is dropped.
pub struct RegionReader<'a> {
    region: &'a SimpleRegionFile,
    index: usize,
    data: Cursor<Vec<u8>>,
}

impl RegionReader<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Total record length, independent of how much has been read.
    pub fn len(&self) -> usize {
        self.data.get_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Read for RegionReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.data.read(buf)
    }
}

impl Drop for RegionReader<'_> {
    fn drop(&mut self) {
        self.region.finish_read(self.index);
    }
}

/// Buffering writer for one record.
///
/// Nothing reaches the file until [`Commit::commit`]. Dropping the writer
/// commits too and logs any failure, except while unwinding from a panic,
/// when the buffered bytes are thrown away.
pub struct RegionWriter<'a> {
    region: &'a SimpleRegionFile,
    index: usize,
    buf: Vec<u8>,
    finished: bool,
}

impl RegionWriter<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Release the entry without touching the stored record.
    pub fn discard(mut self) {
        self.finished = true;
        // Only the busy flag changes, nothing can fail.
        let _ = self.region.finish_write(self.index, None);
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        let data = std::mem::take(&mut self.buf);
        self.region.finish_write(self.index, Some(&data))
    }
}

impl Write for RegionWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Commit for RegionWriter<'_> {
    fn commit(mut self) -> Result<()> {
        self.finish()
    }
}

impl Drop for RegionWriter<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if std::thread::panicking() {
            log::warn!("Discarding write to entry {} of {} during panic", self.index, self.region.path.display());
            self.finished = true;
            let _ = self.region.finish_write(self.index, None);
        } else if let Err(e) = self.finish() {
            log::error!("Failed to commit entry {} of {}: {:?}", self.index, self.region.path.display(), e);
        }
    }
}
