//! File payload storage: per-inode data files and the compression codec.

pub mod blocks;
pub mod codec;

pub use blocks::DataStore;
