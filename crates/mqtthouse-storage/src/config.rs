//! Storage Configuration
//!
//! This module defines the per-database configuration and the per-batch
//! write options.
//!
//! ## DbConfig
//!
//! Controls how a database is sharded and which storage layout new
//! generations use:
//!
//! - **backend**: the embedded KV engine (RocksDB)
//! - **storage**: layout for newly created generations (reference or
//!   skipstream-LTS); existing generations keep the layout they were
//!   created with
//! - **n_shards**: number of shards; fixed for the lifetime of the DB
//! - **force_monotonic_timestamps**: rewrite message timestamps so they are
//!   strictly increasing within a shard
//! - **serialize_by**: the routing key for shard placement (client id or
//!   topic)

use serde::{Deserialize, Serialize};

/// Embedded KV engine backing a database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    #[default]
    #[serde(rename = "rocksdb")]
    RocksDb,
}

/// Which message field picks the shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializeBy {
    #[default]
    ClientId,
    Topic,
}

/// Storage layout schema tag, persisted in generation metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    Reference,
    SkipstreamLts,
}

/// Layout selection for newly created generations. Persisted inside
/// generation metadata, so the encoding must stay bincode-friendly
/// (externally tagged).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutConfig {
    Reference,
    SkipstreamLts(SkipstreamConfig),
}

impl Default for LayoutConfig {
    fn default() -> Self {
        LayoutConfig::SkipstreamLts(SkipstreamConfig::default())
    }
}

impl LayoutConfig {
    pub fn kind(&self) -> LayoutKind {
        match self {
            LayoutConfig::Reference => LayoutKind::Reference,
            LayoutConfig::SkipstreamLts(_) => LayoutKind::SkipstreamLts,
        }
    }
}

/// Tuning for the skipstream-LTS layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipstreamConfig {
    /// Width of the static topic-shape key in bytes (default: 8).
    #[serde(default = "default_static_key_bytes")]
    pub static_key_bytes: usize,

    /// Width of the truncated token hash in index keys (default: 8).
    #[serde(default = "default_hash_bytes")]
    pub hash_bytes: usize,

    /// Per-level wildcard promotion thresholds; the last entry repeats for
    /// deeper levels (default: `[100, 10]`, root 100, non-root 10).
    #[serde(default = "default_wildcard_thresholds")]
    pub wildcard_thresholds: Vec<usize>,
}

impl Default for SkipstreamConfig {
    fn default() -> Self {
        Self {
            static_key_bytes: default_static_key_bytes(),
            hash_bytes: default_hash_bytes(),
            wildcard_thresholds: default_wildcard_thresholds(),
        }
    }
}

fn default_static_key_bytes() -> usize {
    8
}

fn default_hash_bytes() -> usize {
    8
}

fn default_wildcard_thresholds() -> Vec<usize> {
    vec![100, 10]
}

/// Per-database configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbConfig {
    #[serde(default)]
    pub backend: Backend,

    #[serde(default)]
    pub storage: LayoutConfig,

    /// Number of shards (default: 4).
    #[serde(default = "default_n_shards")]
    pub n_shards: u16,

    /// Rewrite message timestamps to be strictly increasing per shard
    /// (default: true).
    #[serde(default = "default_true")]
    pub force_monotonic_timestamps: bool,

    /// Treat every batch as atomic even when its options do not say so
    /// (default: false). An atomic batch must route to a single shard.
    #[serde(default)]
    pub atomic_batches: bool,

    #[serde(default)]
    pub serialize_by: SerializeBy,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            backend: Backend::RocksDb,
            storage: LayoutConfig::default(),
            n_shards: default_n_shards(),
            force_monotonic_timestamps: true,
            atomic_batches: false,
            serialize_by: SerializeBy::ClientId,
        }
    }
}

fn default_n_shards() -> u16 {
    4
}

fn default_true() -> bool {
    true
}

/// Per-batch write options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Require the whole batch to commit atomically, which confines it to
    /// one shard (default: false).
    #[serde(default)]
    pub atomic: bool,

    /// Wait for a durable (WAL-flushed) acknowledgement (default: false).
    #[serde(default)]
    pub sync: bool,

    /// Write to the WAL at all; `false` trades durability for throughput
    /// (default: true).
    #[serde(default = "default_true")]
    pub durable: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            atomic: false,
            sync: false,
            durable: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_default() {
        let cfg = DbConfig::default();
        assert_eq!(cfg.backend, Backend::RocksDb);
        assert_eq!(cfg.n_shards, 4);
        assert!(cfg.force_monotonic_timestamps);
        assert_eq!(cfg.serialize_by, SerializeBy::ClientId);
        assert_eq!(cfg.storage.kind(), LayoutKind::SkipstreamLts);
    }

    #[test]
    fn test_batch_options_default() {
        let opts = BatchOptions::default();
        assert!(!opts.atomic);
        assert!(!opts.sync);
        assert!(opts.durable);
    }

    #[test]
    fn test_config_serde_defaults() {
        let cfg: DbConfig = serde_json::from_str("{}").expect("deserialize");
        assert_eq!(cfg, DbConfig::default());
    }
}
