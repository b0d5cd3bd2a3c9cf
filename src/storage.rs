//! On-disk metadata storage: the node arena and the string table.
//!
//! Both structures are memory-mapped at stable paths and carry bit-exact
//! headers so a remount (or the offline checker) can validate them without
//! replaying anything.

pub mod arena;
pub mod node;
pub mod strings;

pub use arena::NodeArena;
pub use node::{Node, NodeIndex, BRANCH_FACTOR};
pub use strings::StringTable;
