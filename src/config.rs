//! Mount configuration.
//!
//! All recognized options with their defaults; anything else is rejected at
//! deserialization time (`deny_unknown_fields`). `validate()` enforces the
//! documented ranges before a mount is attempted.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{FsError, Result};

/// When the WAL calls fsync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalSync {
    /// fsync before every commit returns (group commit may share the call).
    #[default]
    Always,
    /// fsync every N commits; a commit may return before its fsync.
    Batched,
    /// Never fsync explicitly. Crash durability is waived.
    Off,
}

/// NUMA binding policy for fresh mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumaPolicy {
    /// Bind to the local node when the syscall is available, else degrade.
    #[default]
    Auto,
    /// Bind and log a warning if binding fails.
    On,
    /// Never attempt binding.
    Off,
}

/// Maximum node count addressable by a 16-bit arena index.
pub const MAX_NODE_LIMIT: u32 = u16::MAX as u32;

/// Contract range for the rebalance trigger.
pub const REBALANCE_MIN_OPS: u32 = 50;
pub const REBALANCE_MAX_OPS: u32 = 500;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Directory holding nodes.dat, strings.dat, wal.log and data files.
    pub data_dir: PathBuf,
    /// Arena capacity in nodes (including the sentinel slot).
    pub max_nodes: u32,
    /// Ceiling for string table growth.
    pub string_capacity_bytes: u64,
    pub wal_sync: WalSync,
    pub compression: bool,
    /// Files below this size are never compressed.
    pub compression_min_bytes: u64,
    /// Mutations between background BFS relayout passes.
    pub rebalance_interval_ops: u32,
    pub numa: NumaPolicy,
    /// Longest accepted path component, in bytes.
    pub max_name_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/razorfs"),
            max_nodes: MAX_NODE_LIMIT,
            string_capacity_bytes: 16 * 1024 * 1024,
            wal_sync: WalSync::Always,
            compression: true,
            compression_min_bytes: 512,
            rebalance_interval_ops: 100,
            numa: NumaPolicy::Auto,
            max_name_len: 255,
        }
    }
}

impl Config {
    /// Creates a config rooted at `data_dir` with every other option default.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_nodes < 2 || self.max_nodes > MAX_NODE_LIMIT {
            return Err(FsError::InvalidArgument(format!(
                "max_nodes must be in 2..={MAX_NODE_LIMIT}, got {}",
                self.max_nodes
            )));
        }
        if self.string_capacity_bytes < 4096 {
            return Err(FsError::InvalidArgument(format!(
                "string_capacity_bytes must be at least 4096, got {}",
                self.string_capacity_bytes
            )));
        }
        if !(REBALANCE_MIN_OPS..=REBALANCE_MAX_OPS).contains(&self.rebalance_interval_ops) {
            return Err(FsError::InvalidArgument(format!(
                "rebalance_interval_ops must be in {REBALANCE_MIN_OPS}..={REBALANCE_MAX_OPS}, got {}",
                self.rebalance_interval_ops
            )));
        }
        if self.max_name_len == 0 || self.max_name_len > 4096 {
            return Err(FsError::InvalidArgument(format!(
                "max_name_len must be in 1..=4096, got {}",
                self.max_name_len
            )));
        }
        Ok(())
    }
}
