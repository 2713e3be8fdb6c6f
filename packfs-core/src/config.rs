//! Filesystem tunables
//!
//! Persisted as `fsx.conf` in the repository root. Every field has a
//! default so an absent or partial file still yields a usable
//! configuration.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Current on-disk format number. Bump when the layout changes.
pub const FORMAT_NUMBER: u32 = 1;

/// Tunable parameters for a filesystem instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Propagate remote cache backend errors instead of degrading to a miss
    pub fail_stop: bool,

    /// Deduplicate representations by strong content digest
    pub enable_rep_sharing: bool,

    /// Restart deltification histories after this many chained deltas
    pub max_deltification_walk: u64,

    /// Length of the linear delta history after which skip deltas kick in
    pub max_linear_deltification: u64,

    /// zstd level for representation payloads; 0 stores raw bytes
    pub compression_level: i32,

    /// Pack multiple revprop files into one up to this size (bytes)
    pub revprop_pack_size: u64,

    /// Compress packed revprop files
    pub compress_packed_revprops: bool,

    /// Pack file read granularity in bytes; container bundles cover one
    /// block each
    pub block_size: u64,

    /// Capacity in entries of log-to-phys index pages
    pub l2p_page_size: u64,

    /// Byte range covered by a single phys-to-log index page
    pub p2l_page_size: u64,

    /// Number of consecutive revisions per shard
    pub shard_size: u64,

    /// Run a full pack after every commit
    pub pack_after_commit: bool,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            fail_stop: false,
            enable_rep_sharing: true,
            max_deltification_walk: 1023,
            max_linear_deltification: 16,
            compression_level: 3,
            revprop_pack_size: 64 * 1024,
            compress_packed_revprops: false,
            block_size: 64 * 1024,
            l2p_page_size: 8192,
            p2l_page_size: 64 * 1024,
            shard_size: 1000,
            pack_after_commit: false,
        }
    }
}

impl FsConfig {
    /// Load configuration from `fsx.conf`, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Write configuration to `fsx.conf`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_when_absent() {
        let dir = TempDir::new().unwrap();
        let cfg = FsConfig::load(&dir.path().join("fsx.conf")).unwrap();
        assert!(cfg.enable_rep_sharing);
        assert_eq!(cfg.shard_size, 1000);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fsx.conf");

        let mut cfg = FsConfig::default();
        cfg.compression_level = 0;
        cfg.max_linear_deltification = 4;
        cfg.save(&path).unwrap();

        let loaded = FsConfig::load(&path).unwrap();
        assert_eq!(loaded.compression_level, 0);
        assert_eq!(loaded.max_linear_deltification, 4);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fsx.conf");
        std::fs::write(&path, r#"{"compression_level": 9}"#).unwrap();

        let cfg = FsConfig::load(&path).unwrap();
        assert_eq!(cfg.compression_level, 9);
        assert_eq!(cfg.max_deltification_walk, 1023);
    }
}
