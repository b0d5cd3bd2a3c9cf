//! Per-node locks and the global ordering discipline.
//!
//! Locks live in a parallel array so the 64-byte node record stays a single
//! cache line. The global order, violated nowhere:
//!
//! 1. The rename serialization mutex (cross-directory topology changes).
//! 2. The tree growth lock (shared by every operation; exclusive for
//!    string-table growth and relayout).
//! 3. The lower-indexed parent, then the higher-indexed parent.
//! 4. The node (lower-indexed first when an operation locks two).
//!
//! Locks release in reverse order and never cross the bridge boundary.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::storage::node::NodeIndex;

pub struct LockTable {
    locks: Box<[RwLock<()>]>,
}

impl LockTable {
    pub fn new(capacity: u32) -> Self {
        let locks = (0..capacity).map(|_| RwLock::new(())).collect::<Vec<_>>();
        Self {
            locks: locks.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn read(&self, idx: NodeIndex) -> RwLockReadGuard<'_, ()> {
        self.locks[idx.slot()].read()
    }

    #[inline]
    pub fn write(&self, idx: NodeIndex) -> RwLockWriteGuard<'_, ()> {
        self.locks[idx.slot()].write()
    }

    /// Write-locks two directories in index order. Equal indices take the
    /// lock once.
    pub fn write_pair(
        &self,
        a: NodeIndex,
        b: NodeIndex,
    ) -> (RwLockWriteGuard<'_, ()>, Option<RwLockWriteGuard<'_, ()>>) {
        if a == b {
            (self.write(a), None)
        } else if a < b {
            let first = self.write(a);
            let second = self.write(b);
            (first, Some(second))
        } else {
            let first = self.write(b);
            let second = self.write(a);
            (first, Some(second))
        }
    }
}
