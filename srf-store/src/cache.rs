//! Pool of open region files keyed by path.
//!
//! Each world (or test) owns its own `RegionFileCache`; there is no global
//! pool. The cache guarantees at most one live [`SimpleRegionFile`] per path
//! and closes files that have been idle for longer than their timeout.
//!
//! A caller holding an `Arc<SimpleRegionFile>` across a maintenance pass may
//! find it closed; calling [`RegionFileCache::region_file`] again opens a
//! fresh instance.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use srf_metrics::IoMetrics;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::baa::ByteArrayArray;
use crate::config::RegionConfig;
use crate::error::Result;
use crate::region_file::SimpleRegionFile;
use crate::{RegionPos, chunk_to_local, local_to_index};

pub struct RegionFileCache {
    config: RegionConfig,
    files: Mutex<HashMap<PathBuf, Arc<SimpleRegionFile>>>,
    metrics: Option<Arc<IoMetrics>>,
}

impl RegionFileCache {
    pub fn new(config: RegionConfig) -> Self {
        Self {
            config,
            files: Mutex::new(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(config: RegionConfig, metrics: Arc<IoMetrics>) -> Self {
        Self {
            config,
            files: Mutex::new(HashMap::new()),
            metrics: Some(metrics),
        }
    }

    /// Path of the region file for `pos` inside `dir`.
    pub fn region_path(dir: &Path, pos: RegionPos) -> PathBuf {
        dir.join(pos.file_name())
    }

    /// Entry index of a chunk inside its region file.
    #[inline]
    pub fn chunk_index(chunk_x: i32, chunk_z: i32) -> usize {
        local_to_index(chunk_to_local(chunk_x), chunk_to_local(chunk_z))
    }

    /// Region file holding chunk `(chunk_x, chunk_z)`, opened on demand.
    pub fn region_file(&self, dir: &Path, chunk_x: i32, chunk_z: i32) -> Result<Arc<SimpleRegionFile>> {
        let pos = RegionPos::from_chunk(chunk_x, chunk_z);
        let path = Self::region_path(dir, pos);

        // Opening under the map lock keeps a second instance from racing in.
        let mut files = self.files.lock();
        if let Some(file) = files.get(&path) {
            if !file.is_closed() {
                return Ok(file.clone());
            }
        }

        std::fs::create_dir_all(dir)?;
        let file = Arc::new(SimpleRegionFile::open_with_metrics(
            &path,
            &self.config,
            self.metrics.clone(),
        )?);
        log::debug!("Opened region ({}, {}) at {}", pos.x, pos.z, path.display());
        files.insert(path, file.clone());
        Ok(file)
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every file that has timed out and drop closed files from the pool.
    ///
    /// Returns how many files this pass closed. Failures are logged.
    pub fn close_idle(&self) -> usize {
        let snapshot: Vec<Arc<SimpleRegionFile>> = self.files.lock().values().cloned().collect();

        let mut closed = 0;
        for file in &snapshot {
            if file.is_closed() {
                continue;
            }
            match file.close_if_timed_out() {
                Ok(()) if file.is_closed() => closed += 1,
                Ok(()) => {}
                Err(e) => log::error!("Failed to close idle region file {}: {:?}", file.path().display(), e),
            }
        }

        self.files.lock().retain(|_, file| !file.is_closed());
        closed
    }

    /// Close every idle cached file and drop it from the pool.
    ///
    /// A busy file stays open and stays in the pool, so later lookups keep
    /// getting the same instance. Returns how many files closed.
    pub fn clear(&self) -> usize {
        let mut files = self.files.lock();
        let mut closed = 0;
        files.retain(|path, file| {
            if file.is_closed() {
                return false;
            }
            match file.attempt_close() {
                Ok(true) => {
                    closed += 1;
                    false
                }
                Ok(false) => {
                    log::warn!(
                        "Region file {} still has {} open streams, leaving it open",
                        path.display(),
                        file.open_streams()
                    );
                    true
                }
                Err(e) => {
                    log::error!("Failed to close region file {}: {:?}", path.display(), e);
                    !file.is_closed()
                }
            }
        });
        closed
    }

    /// Run [`close_idle`](Self::close_idle) every `period` on the tokio runtime.
    ///
    /// Must be called from within a runtime. Abort the handle to stop it.
    pub fn spawn_maintenance(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let pass = cache.clone();
                match tokio::task::spawn_blocking(move || pass.close_idle()).await {
                    Ok(0) => {}
                    Ok(n) => log::debug!("Maintenance closed {} idle region files", n),
                    Err(e) => log::warn!("Maintenance pass failed: {:?}", e),
                }
            }
        })
    }
}

impl Drop for RegionFileCache {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baa::Commit;
    use std::io::Write;

    fn fast_config(timeout: Duration) -> RegionConfig {
        RegionConfig {
            cache_pages: 8,
            ..RegionConfig::default()
        }
        .with_timeout(timeout)
    }

    #[test]
    fn test_chunk_index() {
        assert_eq!(RegionFileCache::chunk_index(0, 0), 0);
        assert_eq!(RegionFileCache::chunk_index(-1, 0), 31);
        assert_eq!(RegionFileCache::chunk_index(33, 2), 65);
    }

    #[test]
    fn test_one_instance_per_region() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RegionFileCache::new(fast_config(Duration::from_secs(60)));

        let a = cache.region_file(dir.path(), 0, 0).unwrap();
        let b = cache.region_file(dir.path(), 5, 31).unwrap();
        let c = cache.region_file(dir.path(), 40, 0).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
        assert!(dir.path().join("r.0.0.srf").exists());
        assert!(dir.path().join("r.1.0.srf").exists());
    }

    #[test]
    fn test_reopens_closed_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RegionFileCache::new(fast_config(Duration::from_secs(60)));

        let index = RegionFileCache::chunk_index(-3, 7);
        let first = cache.region_file(dir.path(), -3, 7).unwrap();
        first.write_entry(index, b"chunk").unwrap();
        assert!(first.attempt_close().unwrap());

        let second = cache.region_file(dir.path(), -3, 7).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_closed());
        assert_eq!(second.read_entry(index).unwrap(), b"chunk");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_close_idle() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RegionFileCache::new(fast_config(Duration::from_millis(10)));

        let file = cache.region_file(dir.path(), 0, 0).unwrap();
        file.write_entry(0, b"data").unwrap();
        assert_eq!(cache.close_idle(), 0);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.close_idle(), 1);
        assert!(file.is_closed());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_close_idle_skips_busy_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RegionFileCache::new(fast_config(Duration::from_millis(10)));

        let file = cache.region_file(dir.path(), 0, 0).unwrap();
        let reader = file.input_stream(0).unwrap();
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(cache.close_idle(), 0);
        assert_eq!(cache.len(), 1);
        drop(reader);
    }

    #[test]
    fn test_clear_closes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RegionFileCache::new(fast_config(Duration::from_secs(60)));

        let a = cache.region_file(dir.path(), 0, 0).unwrap();
        let b = cache.region_file(dir.path(), -40, 0).unwrap();
        a.write_entry(1, b"a").unwrap();

        assert_eq!(cache.clear(), 2);
        assert!(cache.is_empty());
        assert!(a.is_closed());
        assert!(b.is_closed());
    }

    #[test]
    fn test_clear_keeps_busy_file_in_pool() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RegionFileCache::new(fast_config(Duration::from_secs(60)));

        let a = cache.region_file(dir.path(), 0, 0).unwrap();
        let idle = cache.region_file(dir.path(), 40, 0).unwrap();
        let mut writer = a.output_stream(0).unwrap();
        writer.write_all(&[0xAA; 4]).unwrap();

        assert_eq!(cache.clear(), 1);
        assert!(idle.is_closed());
        assert!(!a.is_closed());
        assert_eq!(cache.len(), 1);

        // Same instance, so both entries land in one header.
        let b = cache.region_file(dir.path(), 1, 0).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        b.write_entry(1, &[0xBB; 4]).unwrap();
        writer.commit().unwrap();

        assert_eq!(cache.clear(), 1);
        assert!(cache.is_empty());

        let reopened = cache.region_file(dir.path(), 0, 0).unwrap();
        assert_eq!(reopened.read_entry(0).unwrap(), [0xAA; 4]);
        assert_eq!(reopened.read_entry(1).unwrap(), [0xBB; 4]);
    }

    #[test]
    fn test_independent_caches() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let world_a = RegionFileCache::new(fast_config(Duration::from_secs(60)));
        let world_b = RegionFileCache::new(fast_config(Duration::from_secs(60)));

        world_a.region_file(dir_a.path(), 0, 0).unwrap().write_entry(0, b"a").unwrap();
        world_b.region_file(dir_b.path(), 0, 0).unwrap().write_entry(0, b"b").unwrap();

        assert_eq!(world_a.region_file(dir_a.path(), 0, 0).unwrap().read_entry(0).unwrap(), b"a");
        assert_eq!(world_b.region_file(dir_b.path(), 0, 0).unwrap().read_entry(0).unwrap(), b"b");
    }

    #[tokio::test]
    async fn test_maintenance_task_reclaims_idle_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(RegionFileCache::new(fast_config(Duration::from_millis(10))));

        let file = cache.region_file(dir.path(), 0, 0).unwrap();
        file.write_entry(0, b"data").unwrap();
        drop(file);

        let handle = cache.spawn_maintenance(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();

        assert!(cache.is_empty());
    }
}
