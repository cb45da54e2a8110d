use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Counters shared by the page cache, region files and the file pool.
///
/// Every field is a relaxed atomic so recording never takes a lock.
#[derive(Debug, Default)]
pub struct IoMetrics {
    // Page cache
    pub page_hits: AtomicUsize,
    pub page_misses: AtomicUsize,
    pub page_evictions: AtomicUsize,
    pub page_write_backs: AtomicUsize,

    // Records
    pub records_read: AtomicUsize,
    pub total_read_time_us: AtomicU64,
    pub bytes_read: AtomicU64,
    pub records_written: AtomicUsize,
    pub total_write_time_us: AtomicU64,
    pub max_write_time_us: AtomicU64,
    pub bytes_written: AtomicU64,
    pub sectors_appended: AtomicU64,

    // Files
    pub files_opened: AtomicUsize,
    pub files_closed: AtomicUsize,

    // Session
    pub start_time: Option<Instant>,
}

impl IoMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn record_page_hit(&self) {
        self.page_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_page_miss(&self) {
        self.page_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.page_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_back(&self) {
        self.page_write_backs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read(&self, duration: Duration, bytes: usize) {
        self.records_read.fetch_add(1, Ordering::Relaxed);
        self.total_read_time_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_write(&self, duration: Duration, bytes: usize) {
        self.records_written.fetch_add(1, Ordering::Relaxed);
        let us = duration.as_micros() as u64;
        self.total_write_time_us.fetch_add(us, Ordering::Relaxed);
        self.max_write_time_us.fetch_max(us, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_append(&self, sectors: u32) {
        self.sectors_appended.fetch_add(sectors as u64, Ordering::Relaxed);
    }

    pub fn record_open(&self) {
        self.files_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_close(&self) {
        self.files_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Fraction of page lookups served from memory, in percent.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.page_hits.load(Ordering::Relaxed);
        let misses = self.page_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total > 0 { (hits as f64 / total as f64) * 100.0 } else { 0.0 }
    }

    pub fn generate_report(&self) -> String {
        let uptime = self.start_time.unwrap_or_else(Instant::now).elapsed();

        let hits = self.page_hits.load(Ordering::Relaxed);
        let misses = self.page_misses.load(Ordering::Relaxed);
        let evictions = self.page_evictions.load(Ordering::Relaxed);
        let write_backs = self.page_write_backs.load(Ordering::Relaxed);

        let read = self.records_read.load(Ordering::Relaxed);
        let read_time = self.total_read_time_us.load(Ordering::Relaxed) as f64 / 1000.0; // ms
        let read_avg = if read > 0 { read_time / read as f64 } else { 0.0 };
        let read_bytes = self.bytes_read.load(Ordering::Relaxed);

        let written = self.records_written.load(Ordering::Relaxed);
        let write_time = self.total_write_time_us.load(Ordering::Relaxed) as f64 / 1000.0; // ms
        let write_avg = if written > 0 { write_time / written as f64 } else { 0.0 };
        let write_max = self.max_write_time_us.load(Ordering::Relaxed) as f64 / 1000.0;
        let written_bytes = self.bytes_written.load(Ordering::Relaxed);
        let appended = self.sectors_appended.load(Ordering::Relaxed);

        let opened = self.files_opened.load(Ordering::Relaxed);
        let closed = self.files_closed.load(Ordering::Relaxed);

        format!(
            "Region Store I/O Report\n\
             =======================\n\
             Session Duration: {:.2?}\n\n\
             [Page Cache]\n\
             Hits: {}\n\
             Misses: {}\n\
             Hit Rate: {:.1}%\n\
             Evictions: {}\n\
             Write-backs: {}\n\n\
             [Records Read]\n\
             Count: {}\n\
             Bytes: {}\n\
             Avg Time: {:.3} ms/record\n\n\
             [Records Written]\n\
             Count: {}\n\
             Bytes: {}\n\
             Avg Time: {:.3} ms/record\n\
             Max Time: {:.3} ms\n\
             Sectors Appended: {}\n\n\
             [Files]\n\
             Opened: {}\n\
             Closed: {}\n",
            uptime,
            hits, misses, self.hit_rate(), evictions, write_backs,
            read, read_bytes, read_avg,
            written, written_bytes, write_avg, write_max, appended,
            opened, closed
        )
    }
}
