//! srf-store: sector-allocated region files for voxel world storage.
//!
//! A region file holds a fixed number of variable-length records (one per
//! chunk column) in a single backing file:
//! - Bytes 0..K sectors: allocation table, one `(start, count)` pair per entry
//! - Remaining sectors: record heap, each run starting with a 4-byte length
//!
//! All file access goes through a write-back page cache so small header
//! updates and record rewrites do not hit the disk one by one.

pub mod baa;
pub mod cache;
pub mod cached_file;
pub mod config;
pub mod error;
mod header;
pub mod region_file;

pub use baa::{ByteArrayArray, Commit};
pub use cache::RegionFileCache;
pub use cached_file::{AccessMode, CachedRandomAccessFile, PAGE_SIZE};
pub use config::RegionConfig;
pub use error::{RegionError, Result};
pub use header::Allocation;
pub use region_file::{RegionReader, RegionStats, RegionWriter, SimpleRegionFile};

/// Number of chunks per region dimension.
pub const REGION_SIZE: i32 = 32;

/// File extension of region files managed by [`RegionFileCache`].
pub const REGION_EXTENSION: &str = "srf";

/// Convert chunk coordinates to local region coordinates (0-31).
#[inline]
pub fn chunk_to_local(chunk_coord: i32) -> i32 {
    chunk_coord.rem_euclid(REGION_SIZE)
}

/// Convert chunk coordinates to region coordinates.
#[inline]
pub fn chunk_to_region(chunk_coord: i32) -> i32 {
    chunk_coord.div_euclid(REGION_SIZE)
}

/// Calculate linear index for a chunk within a region (0-1023).
#[inline]
pub fn local_to_index(local_x: i32, local_z: i32) -> usize {
    (local_z * REGION_SIZE + local_x) as usize
}

/// Calculate local coordinates from linear index.
#[inline]
pub fn index_to_local(index: usize) -> (i32, i32) {
    let local_x = (index % REGION_SIZE as usize) as i32;
    let local_z = (index / REGION_SIZE as usize) as i32;
    (local_x, local_z)
}

/// Region file coordinates (parsed from filename like "r.0.-1.srf").
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct RegionPos {
    pub x: i32,
    pub z: i32,
}

impl RegionPos {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Region containing the given chunk.
    pub fn from_chunk(chunk_x: i32, chunk_z: i32) -> Self {
        Self::new(chunk_to_region(chunk_x), chunk_to_region(chunk_z))
    }

    pub fn file_name(&self) -> String {
        format!("r.{}.{}.{}", self.x, self.z, REGION_EXTENSION)
    }

    /// Parse region position from filename (e.g., "r.0.-1.srf").
    pub fn from_filename(name: &str) -> Option<Self> {
        let parts: Vec<&str> = name.split('.').collect();
        if parts.len() == 4 && parts[0] == "r" && parts[3] == REGION_EXTENSION {
            let x = parts[1].parse().ok()?;
            let z = parts[2].parse().ok()?;
            Some(Self { x, z })
        } else {
            None
        }
    }

    /// Convert local chunk coordinates to world chunk coordinates.
    pub fn local_to_world(&self, local_x: i32, local_z: i32) -> (i32, i32) {
        (
            self.x * REGION_SIZE + local_x,
            self.z * REGION_SIZE + local_z,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_to_region_negative() {
        assert_eq!(chunk_to_region(30), 0);
        assert_eq!(chunk_to_region(-3), -1);
        assert_eq!(chunk_to_region(70), 2);
        assert_eq!(chunk_to_local(-3), 29);
    }

    #[test]
    fn test_index_round_trip() {
        for z in 0..REGION_SIZE {
            for x in 0..REGION_SIZE {
                let index = local_to_index(x, z);
                assert_eq!(index_to_local(index), (x, z));
            }
        }
        assert_eq!(local_to_index(31, 31), 1023);
    }

    #[test]
    fn test_region_filename() {
        let pos = RegionPos::from_chunk(-1, 64);
        assert_eq!(pos, RegionPos::new(-1, 2));
        assert_eq!(pos.file_name(), "r.-1.2.srf");
        assert_eq!(RegionPos::from_filename("r.-1.2.srf"), Some(pos));
        assert_eq!(RegionPos::from_filename("r.-1.2.mca"), None);
        assert_eq!(RegionPos::from_filename("garbage"), None);
    }

    #[test]
    fn test_local_to_world() {
        let pos = RegionPos::new(-1, 2);
        assert_eq!(pos.local_to_world(31, 0), (-1, 64));
    }
}
