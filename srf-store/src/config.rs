//! Region file tuning knobs.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RegionError, Result};

/// Smallest supported sector: 64 bytes.
pub const MIN_SECTOR_EXPONENT: u8 = 6;
/// Largest supported sector: 1 MiB.
pub const MAX_SECTOR_EXPONENT: u8 = 20;

/// Parameters shared by every region file opened with them.
///
/// `sector_exponent` and `entries` are part of the on-disk layout, so a
/// file must always be reopened with the values it was created with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    /// log2 of the sector size in bytes.
    pub sector_exponent: u8,
    /// Number of record slots in each file.
    pub entries: usize,
    /// Idle time before an unused file may be closed.
    pub timeout_ms: u64,
    /// Page cache capacity per open file.
    pub cache_pages: usize,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            sector_exponent: 9,
            entries: (crate::REGION_SIZE * crate::REGION_SIZE) as usize,
            timeout_ms: 120_000,
            cache_pages: 256,
        }
    }
}

impl RegionConfig {
    pub fn sector_size(&self) -> usize {
        1 << self.sector_exponent
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Number of sectors taken by the allocation table.
    pub fn header_sectors(&self) -> u32 {
        let bytes = self.entries * 8;
        bytes.div_ceil(self.sector_size()) as u32
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_SECTOR_EXPONENT..=MAX_SECTOR_EXPONENT).contains(&self.sector_exponent) {
            return Err(RegionError::Config(format!(
                "sector exponent {} outside {}..={}",
                self.sector_exponent, MIN_SECTOR_EXPONENT, MAX_SECTOR_EXPONENT
            )));
        }
        if self.entries == 0 {
            return Err(RegionError::Config("entry capacity must be non-zero".into()));
        }
        if self.cache_pages == 0 {
            return Err(RegionError::Config("page cache needs at least one page".into()));
        }
        // Sector numbers are stored as u32 in the table.
        if (self.entries as u64) * 8 > u32::MAX as u64 {
            return Err(RegionError::Config(format!(
                "{} entries do not fit in a u32-addressed header",
                self.entries
            )));
        }
        Ok(())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: RegionConfig = serde_json::from_str(&raw)
            .map_err(|e| RegionError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = RegionConfig::default();
        config.validate().unwrap();
        assert_eq!(config.sector_size(), 512);
        // 1024 entries * 8 bytes = 8192 bytes = 16 sectors of 512
        assert_eq!(config.header_sectors(), 16);
    }

    #[test]
    fn test_header_rounds_up() {
        let config = RegionConfig { entries: 65, ..Default::default() };
        assert_eq!(config.header_sectors(), 2);
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad_exponent = RegionConfig { sector_exponent: 3, ..Default::default() };
        assert!(matches!(bad_exponent.validate(), Err(RegionError::Config(_))));

        let no_entries = RegionConfig { entries: 0, ..Default::default() };
        assert!(no_entries.validate().is_err());

        let no_pages = RegionConfig { cache_pages: 0, ..Default::default() };
        assert!(no_pages.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.json");
        std::fs::write(&path, r#"{ "entries": 128, "timeout_ms": 10 }"#).unwrap();

        let config = RegionConfig::from_json_file(&path).unwrap();
        assert_eq!(config.entries, 128);
        assert_eq!(config.timeout(), Duration::from_millis(10));
        assert_eq!(config.sector_exponent, 9);
    }
}
