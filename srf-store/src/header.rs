//! Allocation table and sector occupancy map.
//!
//! The table is an array of `(start_sector, sector_count)` pairs, both
//! big-endian u32, one per entry, starting at byte 0. A `(0, 0)` pair means
//! the entry holds nothing. Sector 0 always belongs to the table itself, so
//! no real record can start there.

use std::ops::Range;

/// Size of one table slot in bytes.
pub const SLOT_BYTES: u64 = 8;

/// Where an entry's record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Allocation {
    #[default]
    Unallocated,
    Allocated { start: u32, count: u32 },
}

impl Allocation {
    pub fn from_raw(start: u32, count: u32) -> Self {
        if start == 0 && count == 0 {
            Allocation::Unallocated
        } else {
            Allocation::Allocated { start, count }
        }
    }

    pub fn to_raw(self) -> (u32, u32) {
        match self {
            Allocation::Unallocated => (0, 0),
            Allocation::Allocated { start, count } => (start, count),
        }
    }

    pub fn is_allocated(self) -> bool {
        matches!(self, Allocation::Allocated { .. })
    }

    /// Sectors covered by this allocation (empty when unallocated).
    pub fn sectors(self) -> Range<u32> {
        match self {
            Allocation::Unallocated => 0..0,
            Allocation::Allocated { start, count } => start..start.saturating_add(count),
        }
    }
}

/// Byte offset of the table slot for `index`.
#[inline]
pub fn slot_offset(index: usize) -> u64 {
    index as u64 * SLOT_BYTES
}

/// Which sectors of the file are in use.
///
/// Rebuilt from the table every time a file is opened; it is never stored.
#[derive(Debug)]
pub struct SectorMap {
    used: Vec<bool>,
}

impl SectorMap {
    /// Map of a file `total` sectors long whose first `header` sectors hold the table.
    pub fn new(header: u32, total: u32) -> Self {
        let total = total.max(header);
        let mut used = vec![false; total as usize];
        used[..header as usize].fill(true);
        Self { used }
    }

    /// Total sectors tracked, i.e. the end of the heap.
    pub fn len(&self) -> u32 {
        self.used.len() as u32
    }

    pub fn used_count(&self) -> u32 {
        self.used.iter().filter(|&&u| u).count() as u32
    }

    pub fn free_count(&self) -> u32 {
        self.len() - self.used_count()
    }

    /// True if every sector in `range` exists and is free.
    pub fn is_free(&self, range: Range<u32>) -> bool {
        range.end <= self.len() && self.used[range.start as usize..range.end as usize].iter().all(|&u| !u)
    }

    /// Mark `range` used, growing the map if it runs past the end.
    pub fn reserve(&mut self, range: Range<u32>) {
        if range.end as usize > self.used.len() {
            self.used.resize(range.end as usize, false);
        }
        self.used[range.start as usize..range.end as usize].fill(true);
    }

    pub fn release(&mut self, range: Range<u32>) {
        let end = std::cmp::min(range.end, self.len());
        if range.start < end {
            self.used[range.start as usize..end as usize].fill(false);
        }
    }

    /// First sector of a free run of `count` sectors.
    ///
    /// A free run that reaches the end of the heap counts even if it is too
    /// short, since the file can grow past it. With no fit the run starts at
    /// the current end.
    pub fn find_run(&self, count: u32) -> u32 {
        let mut run_start = 0u32;
        let mut run_len = 0u32;
        for (i, &used) in self.used.iter().enumerate() {
            if used {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = i as u32;
            }
            run_len += 1;
            if run_len >= count {
                return run_start;
            }
        }
        if run_len > 0 { run_start } else { self.len() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_round_trip() {
        assert_eq!(Allocation::from_raw(0, 0), Allocation::Unallocated);
        assert_eq!(Allocation::Unallocated.to_raw(), (0, 0));

        let alloc = Allocation::from_raw(5, 2);
        assert_eq!(alloc, Allocation::Allocated { start: 5, count: 2 });
        assert_eq!(alloc.sectors(), 5..7);
        assert_eq!(alloc.to_raw(), (5, 2));
    }

    #[test]
    fn test_header_sectors_reserved() {
        let map = SectorMap::new(2, 2);
        assert_eq!(map.len(), 2);
        assert_eq!(map.free_count(), 0);
        // Nothing free: append at the end.
        assert_eq!(map.find_run(3), 2);
    }

    #[test]
    fn test_first_fit_reuses_hole() {
        let mut map = SectorMap::new(1, 1);
        map.reserve(1..4);
        map.reserve(4..6);
        map.reserve(6..7);
        map.release(1..4);

        assert_eq!(map.find_run(2), 1);
        assert_eq!(map.find_run(3), 1);
        // Hole of 3 is too small and not at the end.
        assert_eq!(map.find_run(4), 7);
    }

    #[test]
    fn test_trailing_run_extends() {
        let mut map = SectorMap::new(1, 1);
        map.reserve(1..3);
        map.reserve(3..5);
        map.release(3..5);

        assert_eq!(map.find_run(5), 3);
        map.reserve(3..8);
        assert_eq!(map.len(), 8);
        assert_eq!(map.used_count(), 8);
    }

    #[test]
    fn test_is_free() {
        let mut map = SectorMap::new(1, 4);
        map.reserve(2..3);
        assert!(map.is_free(1..2));
        assert!(!map.is_free(1..3));
        assert!(map.is_free(3..4));
        // Past the end is not "free", it does not exist yet.
        assert!(!map.is_free(3..5));
    }

    #[test]
    fn test_slot_offset() {
        assert_eq!(slot_offset(0), 0);
        assert_eq!(slot_offset(42), 336);
    }
}
