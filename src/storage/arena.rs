//! Memory-mapped node arena.
//!
//! A single contiguous mapping of 64-byte records behind a 32-byte header.
//! Slots are addressed by 16-bit index; freed slots form an O(1) freelist
//! threaded through their `parent_idx` fields. The arena never grows while
//! mounted; the checker may rebuild into a larger one offline.

use std::fs::OpenOptions;
use std::mem;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

use crate::error::{FsError, Result};
use crate::storage::node::{Node, NodeIndex};

pub const ARENA_MAGIC: [u8; 4] = *b"RZNA";
pub const ARENA_VERSION: u32 = 1;
pub const ARENA_HEADER_LEN: usize = 32;
const NODE_SIZE: usize = mem::size_of::<Node>();

/// Header layout (32 bytes, little-endian):
/// magic[4] | version u32 | node_size u32 | count u32 | free_head u16 | reserved[14]
const OFF_VERSION: usize = 4;
const OFF_NODE_SIZE: usize = 8;
const OFF_COUNT: usize = 12;
const OFF_FREE_HEAD: usize = 16;

struct AllocState {
    free_head: u16,
    live: u32,
}

pub struct NodeArena {
    map: MmapMut,
    /// Base of the record region (header skipped). The mapping never moves
    /// while mounted, so the pointer is stable.
    base: *mut Node,
    capacity: u32,
    alloc: Mutex<AllocState>,
}

// SAFETY: all mutation goes through `node_mut`/`write_node`, whose contracts
// require the caller to hold the slot's write lock (or exclusive access to
// the whole arena during mount/recovery/rebalance).
unsafe impl Send for NodeArena {}
unsafe impl Sync for NodeArena {}

impl NodeArena {
    /// Creates a fresh arena file sized for `capacity` slots and chains the
    /// freelist over every slot above the root.
    pub fn create(path: &Path, capacity: u32) -> Result<Self> {
        debug_assert!(capacity >= 2 && capacity <= u16::MAX as u32);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let len = ARENA_HEADER_LEN as u64 + capacity as u64 * NODE_SIZE as u64;
        file.set_len(len)?;
        // SAFETY: we own the file and size it before mapping.
        let mut map = unsafe { MmapOptions::new().map_mut(&file)? };

        map[0..4].copy_from_slice(&ARENA_MAGIC);
        map[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&ARENA_VERSION.to_le_bytes());
        map[OFF_NODE_SIZE..OFF_NODE_SIZE + 4].copy_from_slice(&(NODE_SIZE as u32).to_le_bytes());
        map[OFF_COUNT..OFF_COUNT + 4].copy_from_slice(&capacity.to_le_bytes());

        let mut arena = Self::from_map(map, capacity);

        // Slot 0 is the sentinel, slot 1 the root (initialized by the
        // mounting caller). Chain the rest as free.
        for slot in 2..capacity as u16 {
            let next = if slot as u32 + 1 < capacity { slot + 1 } else { 0 };
            // SAFETY: no concurrent access exists during creation.
            let node = unsafe { arena.node_mut(NodeIndex::new(slot)) };
            *node = Node::zeroed();
            node.parent_idx = next;
        }
        let free_head = if capacity > 2 { 2 } else { 0 };
        arena.alloc.get_mut().free_head = free_head;
        arena.write_free_head(free_head);
        Ok(arena)
    }

    /// Opens an existing arena, validating the header. The on-disk `count`
    /// is authoritative for capacity.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < ARENA_HEADER_LEN as u64 {
            return Err(FsError::Corrupted(format!(
                "{}: arena shorter than its header",
                path.display()
            )));
        }
        // SAFETY: shared read-write mapping of a regular file we own the
        // locking discipline for.
        let map = unsafe { MmapOptions::new().map_mut(&file)? };

        if map[0..4] != ARENA_MAGIC {
            return Err(FsError::Corrupted(format!("{}: bad arena magic", path.display())));
        }
        let version = u32::from_le_bytes(map[OFF_VERSION..OFF_VERSION + 4].try_into().unwrap());
        if version != ARENA_VERSION {
            return Err(FsError::Corrupted(format!(
                "{}: arena version {version}, expected {ARENA_VERSION}",
                path.display()
            )));
        }
        let node_size =
            u32::from_le_bytes(map[OFF_NODE_SIZE..OFF_NODE_SIZE + 4].try_into().unwrap());
        if node_size as usize != NODE_SIZE {
            return Err(FsError::Corrupted(format!(
                "{}: node size {node_size}, expected {NODE_SIZE}",
                path.display()
            )));
        }
        let count = u32::from_le_bytes(map[OFF_COUNT..OFF_COUNT + 4].try_into().unwrap());
        let expect = ARENA_HEADER_LEN as u64 + count as u64 * NODE_SIZE as u64;
        if count < 2 || count > u16::MAX as u32 || len < expect {
            return Err(FsError::Corrupted(format!(
                "{}: arena count {count} does not match file length {len}",
                path.display()
            )));
        }

        let free_head = u16::from_le_bytes(map[OFF_FREE_HEAD..OFF_FREE_HEAD + 2].try_into().unwrap());
        let mut arena = Self::from_map(map, count);
        let live = (1..count as u16)
            .filter(|&slot| !arena.node(NodeIndex::new(slot)).is_free())
            .count() as u32;
        let state = arena.alloc.get_mut();
        state.free_head = free_head;
        state.live = live;
        log::debug!("opened arena: {count} slots, {live} live, free head {free_head}");
        Ok(arena)
    }

    fn from_map(mut map: MmapMut, capacity: u32) -> Self {
        let base = unsafe { map.as_mut_ptr().add(ARENA_HEADER_LEN) } as *mut Node;
        Self {
            map,
            base,
            capacity,
            alloc: Mutex::new(AllocState { free_head: 0, live: 0 }),
        }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Live (allocated) node count, root included.
    pub fn live_count(&self) -> u32 {
        self.alloc.lock().live
    }

    /// The record region, for NUMA binding and prefetch.
    pub fn region(&self) -> (*const u8, usize) {
        (self.base as *const u8, self.capacity as usize * NODE_SIZE)
    }

    #[inline]
    fn in_bounds(&self, idx: NodeIndex) -> bool {
        (idx.slot() as u32) < self.capacity
    }

    /// Shared view of a slot. Callers must hold at least the slot's read
    /// lock (or exclusive arena access) for the returned reference to be
    /// race-free.
    #[inline]
    pub fn node(&self, idx: NodeIndex) -> &Node {
        assert!(self.in_bounds(idx), "node index {idx} out of bounds");
        // SAFETY: in-bounds slot of an initialized, naturally aligned region.
        unsafe { &*self.base.add(idx.slot()) }
    }

    /// Raw slot address for prefetch hints; never dereferenced by callers.
    #[inline]
    pub fn node_ptr(&self, idx: NodeIndex) -> *const Node {
        debug_assert!(self.in_bounds(idx));
        // SAFETY: pointer arithmetic stays inside the mapping.
        unsafe { self.base.add(idx.slot()) }
    }

    /// Checked variant for untrusted indices (checker, recovery).
    pub fn try_node(&self, idx: NodeIndex) -> Result<&Node> {
        if !self.in_bounds(idx) {
            return Err(FsError::Corrupted(format!("node index {idx} out of bounds")));
        }
        Ok(self.node(idx))
    }

    /// Mutable view of a slot.
    ///
    /// # Safety
    /// The caller must hold the slot's write lock, or have exclusive access
    /// to the arena (mount, recovery, rebalance, checker).
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn node_mut(&self, idx: NodeIndex) -> &mut Node {
        assert!(self.in_bounds(idx), "node index {idx} out of bounds");
        &mut *self.base.add(idx.slot())
    }

    /// Overwrites a slot wholesale.
    ///
    /// # Safety
    /// Same contract as [`node_mut`](Self::node_mut).
    pub unsafe fn write_node(&self, idx: NodeIndex, node: Node) {
        *self.node_mut(idx) = node;
    }

    /// Pops a slot off the freelist. The slot keeps its freelist image until
    /// the caller initializes it.
    pub fn alloc(&self) -> Result<NodeIndex> {
        let mut state = self.alloc.lock();
        let head = state.free_head;
        if head == 0 {
            return Err(FsError::NoSpace("node arena full"));
        }
        let idx = NodeIndex::new(head);
        let slot = self.node(idx);
        if !slot.is_free() {
            return Err(FsError::Corrupted(format!(
                "freelist head {idx} points at a live node"
            )));
        }
        state.free_head = slot.parent_idx;
        state.live += 1;
        self.write_free_head(state.free_head);
        Ok(idx)
    }

    /// Returns a slot to the freelist. Called only after the DELETE commit
    /// is durable.
    ///
    /// # Safety
    /// Same contract as [`node_mut`](Self::node_mut): the caller must be the
    /// only writer of this slot.
    pub unsafe fn free(&self, idx: NodeIndex) {
        debug_assert!(!idx.is_sentinel() && idx != NodeIndex::ROOT);
        let mut state = self.alloc.lock();
        let node = self.node_mut(idx);
        *node = Node::zeroed();
        node.parent_idx = state.free_head;
        state.free_head = idx.raw();
        state.live = state.live.saturating_sub(1);
        self.write_free_head(state.free_head);
    }

    /// Accounts a slot written outside `alloc` (the root, initialized
    /// directly by the formatter).
    pub(crate) fn mark_allocated(&self) {
        self.alloc.lock().live += 1;
    }

    fn write_free_head(&self, head: u16) {
        // SAFETY: the header word is only written under the alloc mutex.
        unsafe {
            let ptr = self.map.as_ptr().add(OFF_FREE_HEAD) as *mut u16;
            ptr.write_unaligned(head.to_le());
        }
    }

    /// Rebuilds the freelist from slot contents, chaining every free slot in
    /// ascending order. Used after recovery and relayout passes.
    ///
    /// # Safety
    /// Exclusive arena access required.
    pub unsafe fn rebuild_freelist(&self) {
        let mut state = self.alloc.lock();
        let mut head: u16 = 0;
        let mut live: u32 = 1; // root
        for slot in (2..self.capacity as u16).rev() {
            let node = self.node_mut(NodeIndex::new(slot));
            if node.is_free() {
                *node = Node::zeroed();
                node.parent_idx = head;
                head = slot;
            } else {
                live += 1;
            }
        }
        state.free_head = head;
        state.live = live;
        self.write_free_head(head);
    }

    /// Flushes the mapping to disk.
    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::node::MODE_DIR;

    fn scratch_arena(capacity: u32) -> (tempfile::TempDir, NodeArena) {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let arena = NodeArena::create(&dir.path().join("nodes.dat"), capacity)
            .expect("arena creation should succeed");
        (dir, arena)
    }

    #[test]
    fn alloc_free_reuses_slots() {
        let (_dir, arena) = scratch_arena(8);
        let a = arena.alloc().expect("alloc should succeed");
        let b = arena.alloc().expect("alloc should succeed");
        assert_ne!(a, b);
        unsafe {
            let node = arena.node_mut(a);
            node.inode = 7;
            node.mode = MODE_DIR;
        }
        assert_eq!(arena.live_count(), 2);

        unsafe { arena.free(a) };
        assert_eq!(arena.live_count(), 1);
        let c = arena.alloc().expect("alloc should succeed");
        assert_eq!(c, a);
        let _ = b;
    }

    #[test]
    fn alloc_exhausts_at_capacity() {
        let (_dir, arena) = scratch_arena(4);
        // Slots 2 and 3 are allocatable; 0 is the sentinel, 1 the root.
        arena.alloc().expect("alloc should succeed");
        arena.alloc().expect("alloc should succeed");
        assert!(matches!(arena.alloc(), Err(FsError::NoSpace(_))));
    }

    #[test]
    fn reopen_preserves_contents_and_freelist() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let path = dir.path().join("nodes.dat");
        let idx;
        {
            let arena = NodeArena::create(&path, 16).expect("arena creation should succeed");
            idx = arena.alloc().expect("alloc should succeed");
            unsafe {
                let node = arena.node_mut(idx);
                node.inode = 42;
                node.mode = MODE_DIR;
                node.parent_idx = NodeIndex::ROOT.raw();
            }
            arena.flush().expect("flush should succeed");
        }
        let arena = NodeArena::open(&path).expect("arena open should succeed");
        assert_eq!(arena.node(idx).inode, 42);
        assert_eq!(arena.live_count(), 1);
        let next = arena.alloc().expect("alloc should succeed");
        assert_ne!(next, idx);
    }

    #[test]
    fn open_rejects_bad_magic() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let path = dir.path().join("nodes.dat");
        std::fs::write(&path, vec![0u8; 256]).expect("write should succeed");
        assert!(matches!(NodeArena::open(&path), Err(FsError::Corrupted(_))));
    }
}
