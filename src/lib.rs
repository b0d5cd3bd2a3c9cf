//! Crash-safe user-space filesystem core.
//!
//! This crate provides the metadata and data engine behind a FUSE bridge:
//! - Cache-line sized nodes in a memory-mapped, index-addressed arena
//! - An append-only string interning table for entry names
//! - A write-ahead journal with Analysis/Redo/Undo crash recovery
//! - Transparent zlib compression for file payloads
//! - An offline consistency checker with guarded repair
//!
//! The bridge consumes the [`fs::Vfs`] trait; the core never imports it.

pub mod config;
pub mod data;
pub mod error;
pub mod fs;
pub mod fsck;
pub mod numa;
pub mod persist;
pub mod storage;
pub mod tree;
pub mod wal;
pub mod xattr;

// Re-export the mount-facing types
pub use config::{Config, NumaPolicy, WalSync};
pub use error::{FsError, Result};
pub use fs::{RazorFs, StatFs, Vfs};
pub use storage::node::NodeIndex;
pub use tree::{DirEntry, NodeAttr, RenameFlags};
