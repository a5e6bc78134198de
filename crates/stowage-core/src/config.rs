use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Options for the data block processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Target maximum compressed size of a block volume, in bytes.
    #[serde(default = "default_volume_size")]
    pub volume_size: u64,
    #[serde(default)]
    pub index_file_policy: IndexFilePolicy,
    #[serde(default)]
    pub compression: CompressionConfig,
    /// Directory for in-progress volume temp files. System temp dir when unset.
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            volume_size: default_volume_size(),
            index_file_policy: IndexFilePolicy::default(),
            compression: CompressionConfig::default(),
            spool_dir: None,
        }
    }
}

/// Whether an auxiliary index volume is accumulated alongside each block volume.
///
/// `Full` records every blocklist entry so the uploader can synthesise a
/// standalone index volume; `Lookup` relies on remote lookups only; `None`
/// disables index volumes entirely. Only `Full` engages the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexFilePolicy {
    None,
    Lookup,
    #[default]
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            zstd_level: default_zstd_level(),
        }
    }
}

fn default_volume_size() -> u64 {
    50 * 1024 * 1024
}

fn default_algorithm() -> String {
    "zstd".to_string()
}

fn default_zstd_level() -> i32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ProcessorConfig::default();
        assert_eq!(config.volume_size, 50 * 1024 * 1024);
        assert_eq!(config.index_file_policy, IndexFilePolicy::Full);
        assert_eq!(config.compression.algorithm, "zstd");
        assert!(config.spool_dir.is_none());
    }

    #[test]
    fn policy_deserializes_lowercase() {
        let encoded = rmp_serde::to_vec("lookup").unwrap();
        let policy: IndexFilePolicy = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(policy, IndexFilePolicy::Lookup);
    }
}
