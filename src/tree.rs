//! The n-ary metadata tree.
//!
//! Nodes reference each other by 16-bit arena indices; directories hold at
//! most sixteen children, kept sorted by `(name length, name bytes)` so
//! resolution is a binary search. Every mutation follows the same ordering:
//! take locks, mutate the mapped state, journal the transaction, fsync,
//! unlock. A mutation that fails to journal is rolled back in place before
//! the error propagates, so no user-visible effect survives without a
//! durable COMMIT.

pub mod locks;
pub mod rebalance;

use parking_lot::{Mutex, RwLock};

use crate::error::{FsError, Result};
use crate::numa;
use crate::storage::node::{name_order, Node, NodeIndex, BRANCH_FACTOR, MODE_DIR, MODE_FILE};
use crate::storage::strings::Intern;
use crate::storage::{NodeArena, StringTable};
use crate::wal::{Payload, Wal};
use locks::LockTable;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RenameFlags: u32 {
        /// Fail with `Exists` if the destination entry exists.
        const NOREPLACE = 1;
        /// Atomically swap source and destination; both must exist.
        const EXCHANGE = 2;
    }
}

/// Field-wise metadata update; `None` keeps the current value.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetaPatch {
    pub mode: Option<u16>,
    pub size: Option<u64>,
    pub mtime: Option<u32>,
}

/// A copied-out view of one node, safe to hold without locks.
#[derive(Debug, Clone, Copy)]
pub struct NodeAttr {
    pub idx: NodeIndex,
    pub inode: u32,
    pub mode: u16,
    pub nlink: u16,
    pub size: u64,
    pub mtime: u32,
    pub is_dir: bool,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub idx: NodeIndex,
    pub inode: u32,
    pub mode: u16,
}

/// Result of a rename; the caller reaps the replaced entry's inode.
#[derive(Debug, Clone, Copy)]
pub struct RenameOutcome {
    pub child: NodeIndex,
    /// The unlinked destination entry (index and inode), when one existed.
    pub replaced: Option<(NodeIndex, u32)>,
}

/// Result of a hardlink; the caller propagates the new link count to the
/// inode's other link records.
#[derive(Debug, Clone, Copy)]
pub struct LinkOutcome {
    pub new_idx: NodeIndex,
    pub inode: u32,
    pub nlink: u16,
}

pub struct Tree {
    pub(crate) arena: NodeArena,
    pub(crate) strings: StringTable,
    pub(crate) locks: LockTable,
    /// Shared by every operation; exclusive while the string table grows or
    /// the arena is relaid out.
    pub(crate) growth: RwLock<()>,
    /// Serializes renames: the ancestry walk in the descendant check spans
    /// directories no per-node order covers.
    rename_lock: Mutex<()>,
    max_name_len: usize,
}

impl Tree {
    pub fn new(arena: NodeArena, strings: StringTable, max_name_len: usize) -> Self {
        let locks = LockTable::new(arena.capacity());
        Self {
            arena,
            strings,
            locks,
            growth: RwLock::new(()),
            rename_lock: Mutex::new(()),
            max_name_len,
        }
    }

    pub fn arena(&self) -> &NodeArena {
        &self.arena
    }

    pub fn strings(&self) -> &StringTable {
        &self.strings
    }

    /// Writes the root directory into slot 1 of a freshly formatted arena.
    pub fn init_root(&self, mtime: u32) -> Result<()> {
        let offset = match self.strings.intern(b"/")? {
            Intern::Interned(offset) => offset,
            Intern::NeedsGrowth => return Err(FsError::NoSpace("string table")),
        };
        // SAFETY: formatting runs before any lock is handed out.
        let root = unsafe { self.arena.node_mut(NodeIndex::ROOT) };
        if !root.is_free() {
            return Ok(());
        }
        *root = Node::zeroed();
        root.inode = 1;
        root.parent_idx = NodeIndex::ROOT.raw();
        root.name_offset = offset;
        root.mode = MODE_DIR | 0o755;
        root.mtime = mtime;
        root.nlink = 1;
        self.arena.mark_allocated();
        Ok(())
    }

    fn check_name(&self, name: &[u8]) -> Result<()> {
        if name.is_empty() {
            return Err(FsError::InvalidArgument("empty name".into()));
        }
        if name.len() > self.max_name_len {
            return Err(FsError::InvalidArgument(format!(
                "name of {} bytes exceeds the {}-byte limit",
                name.len(),
                self.max_name_len
            )));
        }
        if name.contains(&0) || name.contains(&b'/') {
            return Err(FsError::InvalidArgument("name contains NUL or '/'".into()));
        }
        Ok(())
    }

    /// Binary search over a directory's sorted children. `Ok((pos, idx))`
    /// when found, `Err(insertion_pos)` otherwise.
    pub(crate) fn search_children(
        &self,
        node: &Node,
        name: &[u8],
    ) -> Result<std::result::Result<(usize, NodeIndex), usize>> {
        let children = &node.children[..node.num_children as usize];
        let mut lo = 0usize;
        let mut hi = children.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            // The next candidate in either half is adjacent to mid.
            if mid + 1 < children.len() {
                numa::prefetch_read(self.arena.node_ptr(NodeIndex::new(children[mid + 1])));
            }
            let child = NodeIndex::new(children[mid]);
            let child_name = self.strings.name_at(self.arena.node(child).name_offset)?;
            match name_order(name, child_name) {
                std::cmp::Ordering::Less => hi = mid,
                std::cmp::Ordering::Greater => lo = mid + 1,
                std::cmp::Ordering::Equal => return Ok(Ok((mid, child))),
            }
        }
        Ok(Err(lo))
    }

    /// Resolves a `/`-separated path from the root using read locks only.
    pub fn lookup(&self, path: &str) -> Result<NodeIndex> {
        let _growth = self.growth.read();
        let mut idx = NodeIndex::ROOT;
        for comp in path.split('/') {
            if comp.is_empty() || comp == "." {
                continue;
            }
            if comp == ".." {
                return Err(FsError::InvalidArgument(
                    "'..' is resolved by the bridge, not the core".into(),
                ));
            }
            let name = comp.as_bytes();
            self.check_name(name)?;

            let _guard = self.locks.read(idx);
            let node = *self.arena.node(idx);
            if node.is_free() || !node.is_dir() {
                return Err(FsError::NotFound);
            }
            // Warm the first few child records before the search touches
            // them.
            for &raw in node.children[..(node.num_children as usize).min(4)].iter() {
                numa::prefetch_read(self.arena.node_ptr(NodeIndex::new(raw)));
            }
            idx = match self.search_children(&node, name)? {
                Ok((_, child)) => child,
                Err(_) => return Err(FsError::NotFound),
            };
        }
        Ok(idx)
    }

    /// Resolves one component under `parent`. Read locks only.
    pub fn lookup_child(&self, parent: NodeIndex, name: &[u8]) -> Result<NodeIndex> {
        self.check_name(name)?;
        let _growth = self.growth.read();
        let _guard = self.locks.read(parent);
        let node = *self.arena.node(parent);
        if node.is_free() || !node.is_dir() {
            return Err(FsError::NotFound);
        }
        match self.search_children(&node, name)? {
            Ok((_, child)) => Ok(child),
            Err(_) => Err(FsError::NotFound),
        }
    }

    /// Copied-out attributes under a read lock.
    pub fn node_attr(&self, idx: NodeIndex) -> Result<NodeAttr> {
        let _growth = self.growth.read();
        let _guard = self.locks.read(idx);
        let node = *self.arena.try_node(idx)?;
        if node.is_free() {
            return Err(FsError::NotFound);
        }
        Ok(NodeAttr {
            idx,
            inode: node.inode,
            mode: node.mode,
            nlink: node.nlink,
            size: node.size,
            mtime: node.mtime,
            is_dir: node.is_dir(),
        })
    }

    /// Directory listing in the on-disk (sorted) order.
    pub fn readdir(&self, idx: NodeIndex) -> Result<Vec<DirEntry>> {
        let _growth = self.growth.read();
        let _guard = self.locks.read(idx);
        let node = *self.arena.node(idx);
        if node.is_free() {
            return Err(FsError::NotFound);
        }
        if !node.is_dir() {
            return Err(FsError::InvalidArgument("not a directory".into()));
        }
        let mut entries = Vec::with_capacity(node.num_children as usize);
        for child in node.child_indices() {
            let child_node = *self.arena.node(child);
            let name_bytes = self.strings.name_at(child_node.name_offset)?;
            let name = std::str::from_utf8(name_bytes)
                .map_err(|_| FsError::Corrupted(format!("non-UTF-8 name on node {child}")))?
                .to_string();
            entries.push(DirEntry {
                name,
                idx: child,
                inode: child_node.inode,
                mode: child_node.mode,
            });
        }
        Ok(entries)
    }

    /// Interns a name under the growth discipline: when the table needs
    /// room, the shared growth lock is traded for the exclusive one, the
    /// table grows, and the attempt is retried. `body` runs with the shared
    /// growth lock held.
    fn with_interned<T>(
        &self,
        name: &[u8],
        mut body: impl FnMut(&Self, u32) -> Result<T>,
    ) -> Result<T> {
        loop {
            {
                let _growth = self.growth.read();
                if let Intern::Interned(offset) = self.strings.intern(name)? {
                    return body(self, offset);
                }
            }
            let _growth = self.growth.write();
            self.strings.grow()?;
        }
    }

    /// Creates a child under `parent`. The caller supplies the inode and
    /// timestamp; the WAL transaction is appended and synced before the
    /// locks release.
    pub fn insert(
        &self,
        wal: &Wal,
        txn_id: u64,
        parent: NodeIndex,
        name: &[u8],
        mode: u16,
        inode: u32,
        mtime: u32,
    ) -> Result<NodeIndex> {
        self.check_name(name)?;
        let kind = mode & crate::storage::node::MODE_TYPE_MASK;
        if kind != MODE_DIR && kind != MODE_FILE {
            return Err(FsError::InvalidArgument(format!(
                "mode {mode:#o} is neither a file nor a directory"
            )));
        }
        self.with_interned(name, |tree, name_offset| {
            let _parent_guard = tree.locks.write(parent);
            let parent_node = *tree.arena.try_node(parent)?;
            if parent_node.is_free() {
                return Err(FsError::NotFound);
            }
            if !parent_node.is_dir() {
                return Err(FsError::InvalidArgument("parent is not a directory".into()));
            }
            let pos = match tree.search_children(&parent_node, name)? {
                Ok(_) => return Err(FsError::Exists),
                Err(pos) => pos,
            };
            if parent_node.num_children as usize >= BRANCH_FACTOR {
                return Err(FsError::NoSpace("directory is full"));
            }

            let idx = tree.arena.alloc()?;
            // SAFETY: we hold the parent's write lock and the fresh slot is
            // invisible until spliced below.
            unsafe {
                let node = tree.arena.node_mut(idx);
                *node = Node::zeroed();
                node.inode = inode;
                node.parent_idx = parent.raw();
                node.name_offset = name_offset;
                node.mode = mode;
                node.mtime = mtime;
                node.nlink = 1;
                tree.arena.node_mut(parent).insert_child_at(pos, idx);
            }

            let journaled = wal
                .append_txn(
                    txn_id,
                    vec![
                        Payload::Begin,
                        Payload::Insert {
                            parent: parent.raw(),
                            new_idx: idx.raw(),
                            inode,
                            name_offset,
                            mode,
                            mtime,
                        },
                        Payload::Commit,
                    ],
                )
                .and_then(|target| wal.commit_sync(target));
            if let Err(err) = journaled {
                // SAFETY: same locks as the mutation above.
                unsafe {
                    let parent_node = tree.arena.node_mut(parent);
                    if let Some(pos) = parent_node.child_position(idx) {
                        parent_node.remove_child_at(pos);
                    }
                    tree.arena.free(idx);
                }
                return Err(err);
            }
            Ok(idx)
        })
    }

    /// Removes a node. Directories must be empty; the root is untouchable.
    /// Returns the inode for payload reaping by the caller.
    pub fn delete(&self, wal: &Wal, txn_id: u64, idx: NodeIndex) -> Result<u32> {
        if idx == NodeIndex::ROOT || idx.is_sentinel() {
            return Err(FsError::InvalidArgument("cannot remove the root directory".into()));
        }
        let _growth = self.growth.read();
        loop {
            let parent = {
                let _guard = self.locks.read(idx);
                let node = *self.arena.try_node(idx)?;
                if node.is_free() {
                    return Err(FsError::NotFound);
                }
                NodeIndex::new(node.parent_idx)
            };

            if parent == idx {
                return Err(FsError::Corrupted(format!("node {idx} is its own parent")));
            }
            let _parent_guard = self.locks.write(parent);
            let _node_guard = self.locks.write(idx);
            let node = *self.arena.node(idx);
            if node.is_free() {
                return Err(FsError::NotFound);
            }
            if NodeIndex::new(node.parent_idx) != parent {
                // A concurrent rename moved it between the peek and the
                // locks; retry against the new parent.
                continue;
            }
            if node.is_dir() && node.num_children > 0 {
                return Err(FsError::NotEmpty);
            }
            let parent_node = *self.arena.node(parent);
            let Some(pos) = parent_node.child_position(idx) else {
                return Err(FsError::Corrupted(format!(
                    "node {idx} missing from its parent {parent}"
                )));
            };

            // SAFETY: parent write lock held.
            unsafe {
                self.arena.node_mut(parent).remove_child_at(pos);
            }
            let journaled = wal
                .append_txn(
                    txn_id,
                    vec![
                        Payload::Begin,
                        Payload::Delete {
                            parent: parent.raw(),
                            child: idx.raw(),
                            prior_position: pos as u16,
                        },
                        Payload::Commit,
                    ],
                )
                .and_then(|target| wal.commit_sync(target));
            if let Err(err) = journaled {
                // SAFETY: same locks as the mutation above.
                unsafe {
                    self.arena.node_mut(parent).insert_child_at(pos, idx);
                }
                return Err(err);
            }
            // The slot is reclaimed only now that the commit is durable.
            // SAFETY: node write lock held.
            unsafe {
                self.arena.free(idx);
            }
            return Ok(node.inode);
        }
    }

    /// Applies a metadata patch under the node's write lock.
    pub fn set_meta(&self, wal: &Wal, txn_id: u64, idx: NodeIndex, patch: MetaPatch) -> Result<()> {
        let _growth = self.growth.read();
        let _guard = self.locks.write(idx);
        let prior = *self.arena.try_node(idx)?;
        if prior.is_free() {
            return Err(FsError::NotFound);
        }
        let mode = patch.mode.map_or(prior.mode, |mode| {
            // Type bits are immutable; only permissions change.
            (prior.mode & crate::storage::node::MODE_TYPE_MASK) | (mode & !crate::storage::node::MODE_TYPE_MASK)
        });
        let size = patch.size.unwrap_or(prior.size);
        let mtime = patch.mtime.unwrap_or(prior.mtime);
        if (mode, size, mtime) == (prior.mode, prior.size, prior.mtime) {
            return Ok(());
        }
        // SAFETY: node write lock held.
        unsafe {
            let node = self.arena.node_mut(idx);
            node.mode = mode;
            node.size = size;
            node.mtime = mtime;
        }
        let journaled = wal
            .append_txn(
                txn_id,
                vec![
                    Payload::Begin,
                    Payload::UpdateMeta {
                        idx: idx.raw(),
                        mode,
                        size,
                        mtime,
                        prior_mode: prior.mode,
                        prior_size: prior.size,
                        prior_mtime: prior.mtime,
                    },
                    Payload::Commit,
                ],
            )
            .and_then(|target| wal.commit_sync(target));
        if let Err(err) = journaled {
            // SAFETY: same lock as the mutation above.
            unsafe {
                let node = self.arena.node_mut(idx);
                node.mode = prior.mode;
                node.size = prior.size;
                node.mtime = prior.mtime;
            }
            return Err(err);
        }
        Ok(())
    }

    /// True if `node` is `ancestor` or sits anywhere below it.
    fn is_descendant_of(&self, node: NodeIndex, ancestor: NodeIndex) -> bool {
        let mut at = node;
        loop {
            if at == ancestor {
                return true;
            }
            if at == NodeIndex::ROOT || at.is_sentinel() {
                return false;
            }
            at = NodeIndex::new(self.arena.node(at).parent_idx);
        }
    }

    /// Moves `src_parent/src_name` to `dst_parent/dst_name`.
    pub fn rename(
        &self,
        wal: &Wal,
        txn_id: u64,
        src_parent: NodeIndex,
        src_name: &[u8],
        dst_parent: NodeIndex,
        dst_name: &[u8],
        flags: RenameFlags,
    ) -> Result<RenameOutcome> {
        self.check_name(src_name)?;
        self.check_name(dst_name)?;
        if flags.contains(RenameFlags::NOREPLACE | RenameFlags::EXCHANGE) {
            return Err(FsError::InvalidArgument(
                "NOREPLACE and EXCHANGE are mutually exclusive".into(),
            ));
        }
        let _rename = self.rename_lock.lock();
        self.with_interned(dst_name, |tree, dst_name_offset| {
            tree.rename_locked(
                wal,
                txn_id,
                src_parent,
                src_name,
                dst_parent,
                dst_name,
                dst_name_offset,
                flags,
            )
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn rename_locked(
        &self,
        wal: &Wal,
        txn_id: u64,
        src_parent: NodeIndex,
        src_name: &[u8],
        dst_parent: NodeIndex,
        dst_name: &[u8],
        dst_name_offset: u32,
        flags: RenameFlags,
    ) -> Result<RenameOutcome> {
        let (_first, _second) = self.locks.write_pair(src_parent, dst_parent);

        let src_parent_node = *self.arena.try_node(src_parent)?;
        let dst_parent_node = *self.arena.try_node(dst_parent)?;
        if src_parent_node.is_free() || dst_parent_node.is_free() {
            return Err(FsError::NotFound);
        }
        if !src_parent_node.is_dir() || !dst_parent_node.is_dir() {
            return Err(FsError::InvalidArgument("rename parent is not a directory".into()));
        }

        let (src_pos, child) = match self.search_children(&src_parent_node, src_name)? {
            Ok(found) => found,
            Err(_) => return Err(FsError::NotFound),
        };
        if child == src_parent || child == dst_parent {
            return Err(FsError::Corrupted(format!("directory {child} links itself")));
        }
        let dst_found = self.search_children(&dst_parent_node, dst_name)?;

        // Moving a directory below itself would orphan the whole subtree.
        if self.is_descendant_of(dst_parent, child) {
            return Err(FsError::InvalidArgument(
                "cannot move a directory into its own subtree".into(),
            ));
        }

        let child_node = *self.arena.node(child);
        let src_name_offset = child_node.name_offset;

        if flags.contains(RenameFlags::EXCHANGE) {
            let (_, other) = dst_found.map_err(|_| FsError::NotFound)?;
            if other == child {
                return Ok(RenameOutcome { child, replaced: None });
            }
            if other == src_parent || other == dst_parent {
                return Err(FsError::Corrupted(format!("directory {other} links itself")));
            }
            if self.is_descendant_of(src_parent, other) {
                return Err(FsError::InvalidArgument(
                    "cannot move a directory into its own subtree".into(),
                ));
            }
            let other_name_offset = self.arena.node(other).name_offset;
            let (_a, _b) = self.locks.write_pair(child, other);
            self.apply_exchange(child, other, src_parent, dst_parent)?;
            let journaled = wal
                .append_txn(
                    txn_id,
                    vec![
                        Payload::Begin,
                        Payload::Rename {
                            src_parent: src_parent.raw(),
                            dst_parent: dst_parent.raw(),
                            child: child.raw(),
                            src_name_offset,
                            dst_name_offset: other_name_offset,
                            prior_position: src_pos as u16,
                            exchange_with: Some(other.raw()),
                            replaced: None,
                        },
                        Payload::Commit,
                    ],
                )
                .and_then(|target| wal.commit_sync(target));
            if let Err(err) = journaled {
                self.apply_exchange(other, child, src_parent, dst_parent)?;
                return Err(err);
            }
            return Ok(RenameOutcome { child, replaced: None });
        }

        let replaced = match dst_found {
            Ok((_, existing)) => {
                if flags.contains(RenameFlags::NOREPLACE) {
                    return Err(FsError::Exists);
                }
                if existing == child {
                    // Renaming an entry onto itself.
                    return Ok(RenameOutcome { child, replaced: None });
                }
                if existing == src_parent || existing == dst_parent {
                    return Err(FsError::Corrupted(format!("directory {existing} links itself")));
                }
                let existing_node = *self.arena.node(existing);
                if existing_node.is_dir() {
                    if existing_node.num_children > 0 {
                        return Err(FsError::NotEmpty);
                    }
                    if !child_node.is_dir() {
                        return Err(FsError::InvalidArgument(
                            "cannot replace a directory with a file".into(),
                        ));
                    }
                } else if child_node.is_dir() {
                    return Err(FsError::InvalidArgument(
                        "cannot replace a file with a directory".into(),
                    ));
                }
                Some((existing, existing_node.inode))
            }
            Err(_) => None,
        };

        if replaced.is_none()
            && src_parent != dst_parent
            && dst_parent_node.num_children as usize >= BRANCH_FACTOR
        {
            return Err(FsError::NoSpace("directory is full"));
        }

        let (_child_guard, _replaced_guard) = match replaced {
            Some((existing, _)) => {
                let (a, b) = self.locks.write_pair(child, existing);
                (a, b)
            }
            None => (self.locks.write(child), None),
        };

        // Mutate: unlink the replaced entry, move the child.
        // SAFETY: write locks on both parents and both nodes are held.
        unsafe {
            if let Some((existing, _)) = replaced {
                let dst = self.arena.node_mut(dst_parent);
                if let Some(pos) = dst.child_position(existing) {
                    dst.remove_child_at(pos);
                }
            }
            let src = self.arena.node_mut(src_parent);
            if let Some(pos) = src.child_position(child) {
                src.remove_child_at(pos);
            }
            {
                let node = self.arena.node_mut(child);
                node.parent_idx = dst_parent.raw();
                node.name_offset = dst_name_offset;
            }
            let dst_node = *self.arena.node(dst_parent);
            let pos = match self.search_children(&dst_node, dst_name)? {
                Ok(_) => {
                    return Err(FsError::Corrupted(
                        "destination entry reappeared during rename".into(),
                    ))
                }
                Err(pos) => pos,
            };
            self.arena.node_mut(dst_parent).insert_child_at(pos, child);
        }

        let journaled = wal
            .append_txn(
                txn_id,
                vec![
                    Payload::Begin,
                    Payload::Rename {
                        src_parent: src_parent.raw(),
                        dst_parent: dst_parent.raw(),
                        child: child.raw(),
                        src_name_offset,
                        dst_name_offset,
                        prior_position: src_pos as u16,
                        exchange_with: None,
                        replaced: replaced.map(|(existing, _)| existing.raw()),
                    },
                    Payload::Commit,
                ],
            )
            .and_then(|target| wal.commit_sync(target));
        if let Err(err) = journaled {
            // Put everything back where it was.
            // SAFETY: same locks as the mutation above.
            unsafe {
                let dst = self.arena.node_mut(dst_parent);
                if let Some(pos) = dst.child_position(child) {
                    dst.remove_child_at(pos);
                }
                {
                    let node = self.arena.node_mut(child);
                    node.parent_idx = src_parent.raw();
                    node.name_offset = src_name_offset;
                }
                self.arena
                    .node_mut(src_parent)
                    .insert_child_at(src_pos.min(self.arena.node(src_parent).num_children as usize), child);
                if let Some((existing, _)) = replaced {
                    let dst_node = *self.arena.node(dst_parent);
                    if let Ok(Err(pos)) = self.search_children(&dst_node, dst_name) {
                        self.arena.node_mut(dst_parent).insert_child_at(pos, existing);
                    }
                }
            }
            return Err(err);
        }

        // Reclaim the replaced slot now that the commit is durable.
        if let Some((existing, inode)) = replaced {
            // SAFETY: the replaced node's write lock is held.
            unsafe {
                self.arena.free(existing);
            }
            return Ok(RenameOutcome { child, replaced: Some((existing, inode)) });
        }
        Ok(RenameOutcome { child, replaced: None })
    }

    /// Swaps two entries between their parents, names included.
    fn apply_exchange(
        &self,
        child: NodeIndex,
        other: NodeIndex,
        src_parent: NodeIndex,
        dst_parent: NodeIndex,
    ) -> Result<()> {
        // SAFETY: callers hold write locks on both parents and both nodes.
        unsafe {
            let child_name = self.arena.node(child).name_offset;
            let other_name = self.arena.node(other).name_offset;

            let src = self.arena.node_mut(src_parent);
            if let Some(pos) = src.child_position(child) {
                src.remove_child_at(pos);
            }
            let dst = self.arena.node_mut(dst_parent);
            if let Some(pos) = dst.child_position(other) {
                dst.remove_child_at(pos);
            }

            {
                let node = self.arena.node_mut(child);
                node.parent_idx = dst_parent.raw();
                node.name_offset = other_name;
            }
            {
                let node = self.arena.node_mut(other);
                node.parent_idx = src_parent.raw();
                node.name_offset = child_name;
            }

            let other_name_bytes = self.strings.name_at(other_name)?.to_vec();
            let dst_node = *self.arena.node(dst_parent);
            if let Err(pos) = self.search_children(&dst_node, &other_name_bytes)? {
                self.arena.node_mut(dst_parent).insert_child_at(pos, child);
            }
            let child_name_bytes = self.strings.name_at(child_name)?.to_vec();
            let src_node = *self.arena.node(src_parent);
            if let Err(pos) = self.search_children(&src_node, &child_name_bytes)? {
                self.arena.node_mut(src_parent).insert_child_at(pos, other);
            }
        }
        Ok(())
    }

    /// Adds a second (or later) directory entry for a regular file's inode.
    pub fn hardlink(
        &self,
        wal: &Wal,
        txn_id: u64,
        src: NodeIndex,
        dst_parent: NodeIndex,
        name: &[u8],
    ) -> Result<LinkOutcome> {
        self.check_name(name)?;
        if src == dst_parent {
            return Err(FsError::InvalidArgument("hardlinks apply to regular files only".into()));
        }
        self.with_interned(name, |tree, name_offset| {
            let _parent_guard = tree.locks.write(dst_parent);
            let _src_guard = tree.locks.write(src);

            let src_node = *tree.arena.try_node(src)?;
            if src_node.is_free() {
                return Err(FsError::NotFound);
            }
            if !src_node.is_file() {
                return Err(FsError::InvalidArgument("hardlinks apply to regular files only".into()));
            }
            if src_node.nlink == u16::MAX {
                return Err(FsError::TooManyLinks);
            }
            let parent_node = *tree.arena.node(dst_parent);
            if parent_node.is_free() || !parent_node.is_dir() {
                return Err(FsError::NotFound);
            }
            let pos = match tree.search_children(&parent_node, name)? {
                Ok(_) => return Err(FsError::Exists),
                Err(pos) => pos,
            };
            if parent_node.num_children as usize >= BRANCH_FACTOR {
                return Err(FsError::NoSpace("directory is full"));
            }

            let idx = tree.arena.alloc()?;
            let nlink = src_node.nlink + 1;
            // SAFETY: parent and source write locks held; the fresh slot is
            // invisible until spliced.
            unsafe {
                let node = tree.arena.node_mut(idx);
                *node = Node::zeroed();
                node.inode = src_node.inode;
                node.parent_idx = dst_parent.raw();
                node.name_offset = name_offset;
                node.mode = src_node.mode;
                node.size = src_node.size;
                node.mtime = src_node.mtime;
                node.nlink = nlink;
                tree.arena.node_mut(src).nlink = nlink;
                tree.arena.node_mut(dst_parent).insert_child_at(pos, idx);
            }

            let journaled = wal
                .append_txn(
                    txn_id,
                    vec![
                        Payload::Begin,
                        Payload::Hardlink {
                            src_idx: src.raw(),
                            new_idx: idx.raw(),
                            dst_parent: dst_parent.raw(),
                            inode: src_node.inode,
                            name_offset,
                        },
                        Payload::Commit,
                    ],
                )
                .and_then(|target| wal.commit_sync(target));
            if let Err(err) = journaled {
                // SAFETY: same locks as the mutation above.
                unsafe {
                    let parent = tree.arena.node_mut(dst_parent);
                    if let Some(pos) = parent.child_position(idx) {
                        parent.remove_child_at(pos);
                    }
                    tree.arena.node_mut(src).nlink = src_node.nlink;
                    tree.arena.free(idx);
                }
                return Err(err);
            }
            Ok(LinkOutcome {
                new_idx: idx,
                inode: src_node.inode,
                nlink,
            })
        })
    }

    /// Adjusts `nlink` on a set of link records (unjournaled; recovery
    /// recomputes counts from topology).
    pub(crate) fn set_nlink(&self, indices: &[NodeIndex], nlink: u16) {
        let _growth = self.growth.read();
        for &idx in indices {
            let _guard = self.locks.write(idx);
            // SAFETY: node write lock held.
            unsafe {
                let node = self.arena.node_mut(idx);
                if !node.is_free() {
                    node.nlink = nlink;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalSync;
    use crate::storage::node::{MODE_DIR, MODE_FILE};

    struct Fixture {
        _dir: tempfile::TempDir,
        tree: Tree,
        wal: Wal,
        next_txn: u64,
        next_inode: u32,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir should succeed");
            let arena = NodeArena::create(&dir.path().join("nodes.dat"), 64)
                .expect("arena creation should succeed");
            let strings = StringTable::create(&dir.path().join("strings.dat"), 4096, 1 << 20)
                .expect("table creation should succeed");
            let wal = Wal::create(&dir.path().join("wal.log"), WalSync::Always)
                .expect("wal creation should succeed");
            let tree = Tree::new(arena, strings, 255);
            tree.init_root(0).expect("root init should succeed");
            Self { _dir: dir, tree, wal, next_txn: 0, next_inode: 1 }
        }

        fn txn(&mut self) -> u64 {
            self.next_txn += 1;
            self.next_txn
        }

        fn inode(&mut self) -> u32 {
            self.next_inode += 1;
            self.next_inode
        }

        fn mkdir(&mut self, parent: NodeIndex, name: &str) -> Result<NodeIndex> {
            let (txn, inode) = (self.txn(), self.inode());
            self.tree
                .insert(&self.wal, txn, parent, name.as_bytes(), MODE_DIR | 0o755, inode, 10)
        }

        fn touch(&mut self, parent: NodeIndex, name: &str) -> Result<NodeIndex> {
            let (txn, inode) = (self.txn(), self.inode());
            self.tree
                .insert(&self.wal, txn, parent, name.as_bytes(), MODE_FILE | 0o644, inode, 10)
        }
    }

    #[test]
    fn insert_and_lookup() {
        let mut fx = Fixture::new();
        let a = fx.mkdir(NodeIndex::ROOT, "a").expect("mkdir should succeed");
        let b = fx.touch(a, "b.txt").expect("touch should succeed");
        assert_eq!(fx.tree.lookup("/a").expect("lookup should succeed"), a);
        assert_eq!(fx.tree.lookup("/a/b.txt").expect("lookup should succeed"), b);
        assert_eq!(fx.tree.lookup("/").expect("lookup should succeed"), NodeIndex::ROOT);
        assert!(matches!(fx.tree.lookup("/a/missing"), Err(FsError::NotFound)));
    }

    #[test]
    fn duplicate_insert_fails() {
        let mut fx = Fixture::new();
        fx.touch(NodeIndex::ROOT, "x").expect("touch should succeed");
        assert!(matches!(fx.touch(NodeIndex::ROOT, "x"), Err(FsError::Exists)));
    }

    #[test]
    fn seventeenth_child_is_rejected() {
        let mut fx = Fixture::new();
        let dir = fx.mkdir(NodeIndex::ROOT, "d").expect("mkdir should succeed");
        for i in 1..=16 {
            fx.touch(dir, &format!("f{i}")).expect("touch should succeed");
        }
        assert!(matches!(
            fx.touch(dir, "f17"),
            Err(FsError::NoSpace(_))
        ));
    }

    #[test]
    fn children_stay_sorted() {
        let mut fx = Fixture::new();
        let dir = fx.mkdir(NodeIndex::ROOT, "d").expect("mkdir should succeed");
        for name in ["zz", "a", "mm", "b", "aaa"] {
            fx.touch(dir, name).expect("touch should succeed");
        }
        let entries = fx.tree.readdir(dir).expect("readdir should succeed");
        let names: Vec<&str> = entries.iter().map(|entry| entry.name.as_str()).collect();
        // Sorted by (length, bytes).
        assert_eq!(names, vec!["a", "b", "mm", "zz", "aaa"]);
    }

    #[test]
    fn delete_requires_empty_directory() {
        let mut fx = Fixture::new();
        let dir = fx.mkdir(NodeIndex::ROOT, "d").expect("mkdir should succeed");
        let file = fx.touch(dir, "f").expect("touch should succeed");
        let txn = fx.txn();
        assert!(matches!(fx.tree.delete(&fx.wal, txn, dir), Err(FsError::NotEmpty)));
        let txn = fx.txn();
        fx.tree.delete(&fx.wal, txn, file).expect("delete should succeed");
        let txn = fx.txn();
        fx.tree.delete(&fx.wal, txn, dir).expect("delete should succeed");
        assert!(matches!(fx.tree.lookup("/d"), Err(FsError::NotFound)));
    }

    #[test]
    fn root_is_not_deletable() {
        let mut fx = Fixture::new();
        let txn = fx.txn();
        assert!(matches!(
            fx.tree.delete(&fx.wal, txn, NodeIndex::ROOT),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn rename_moves_between_directories() {
        let mut fx = Fixture::new();
        let a = fx.mkdir(NodeIndex::ROOT, "a").expect("mkdir should succeed");
        let b = fx.mkdir(NodeIndex::ROOT, "b").expect("mkdir should succeed");
        let x = fx.touch(a, "x").expect("touch should succeed");
        let txn = fx.txn();
        let outcome = fx
            .tree
            .rename(&fx.wal, txn, a, b"x", b, b"x", RenameFlags::empty())
            .expect("rename should succeed");
        assert_eq!(outcome.child, x);
        assert!(matches!(fx.tree.lookup("/a/x"), Err(FsError::NotFound)));
        assert_eq!(fx.tree.lookup("/b/x").expect("lookup should succeed"), x);
    }

    #[test]
    fn rename_noreplace_refuses_existing_target() {
        let mut fx = Fixture::new();
        fx.touch(NodeIndex::ROOT, "x").expect("touch should succeed");
        fx.touch(NodeIndex::ROOT, "y").expect("touch should succeed");
        let txn = fx.txn();
        assert!(matches!(
            fx.tree.rename(
                &fx.wal,
                txn,
                NodeIndex::ROOT,
                b"x",
                NodeIndex::ROOT,
                b"y",
                RenameFlags::NOREPLACE
            ),
            Err(FsError::Exists)
        ));
    }

    #[test]
    fn rename_exchange_swaps_entries() {
        let mut fx = Fixture::new();
        let a = fx.mkdir(NodeIndex::ROOT, "a").expect("mkdir should succeed");
        let b = fx.mkdir(NodeIndex::ROOT, "b").expect("mkdir should succeed");
        let x = fx.touch(a, "x").expect("touch should succeed");
        let y = fx.touch(b, "y").expect("touch should succeed");
        let txn = fx.txn();
        fx.tree
            .rename(&fx.wal, txn, a, b"x", b, b"y", RenameFlags::EXCHANGE)
            .expect("exchange should succeed");
        assert_eq!(fx.tree.lookup("/a/x").expect("lookup should succeed"), y);
        assert_eq!(fx.tree.lookup("/b/y").expect("lookup should succeed"), x);
    }

    #[test]
    fn rename_into_descendant_is_rejected() {
        let mut fx = Fixture::new();
        let a = fx.mkdir(NodeIndex::ROOT, "a").expect("mkdir should succeed");
        let b = fx.mkdir(a, "b").expect("mkdir should succeed");
        let txn = fx.txn();
        assert!(matches!(
            fx.tree
                .rename(&fx.wal, txn, NodeIndex::ROOT, b"a", b, b"a2", RenameFlags::empty()),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn rename_replaces_existing_file() {
        let mut fx = Fixture::new();
        let x = fx.touch(NodeIndex::ROOT, "x").expect("touch should succeed");
        fx.touch(NodeIndex::ROOT, "y").expect("touch should succeed");
        let txn = fx.txn();
        let outcome = fx
            .tree
            .rename(
                &fx.wal,
                txn,
                NodeIndex::ROOT,
                b"x",
                NodeIndex::ROOT,
                b"y",
                RenameFlags::empty(),
            )
            .expect("rename should succeed");
        assert!(outcome.replaced.is_some());
        assert_eq!(fx.tree.lookup("/y").expect("lookup should succeed"), x);
        assert!(matches!(fx.tree.lookup("/x"), Err(FsError::NotFound)));
    }

    #[test]
    fn hardlink_shares_the_inode() {
        let mut fx = Fixture::new();
        let file = fx.touch(NodeIndex::ROOT, "orig").expect("touch should succeed");
        let txn = fx.txn();
        let link = fx
            .tree
            .hardlink(&fx.wal, txn, file, NodeIndex::ROOT, b"alias")
            .expect("hardlink should succeed");
        assert_eq!(link.nlink, 2);
        let orig = fx.tree.node_attr(file).expect("attr should succeed");
        let alias = fx.tree.node_attr(link.new_idx).expect("attr should succeed");
        assert_eq!(orig.inode, alias.inode);
        assert_eq!(orig.nlink, 2);
    }

    #[test]
    fn hardlink_rejects_directories() {
        let mut fx = Fixture::new();
        let dir = fx.mkdir(NodeIndex::ROOT, "d").expect("mkdir should succeed");
        let txn = fx.txn();
        assert!(matches!(
            fx.tree.hardlink(&fx.wal, txn, dir, NodeIndex::ROOT, b"alias"),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn set_meta_patches_fields() {
        let mut fx = Fixture::new();
        let file = fx.touch(NodeIndex::ROOT, "f").expect("touch should succeed");
        let txn = fx.txn();
        fx.tree
            .set_meta(
                &fx.wal,
                txn,
                file,
                MetaPatch { mode: Some(0o600), size: Some(123), mtime: Some(99) },
            )
            .expect("set_meta should succeed");
        let attr = fx.tree.node_attr(file).expect("attr should succeed");
        assert_eq!(attr.mode & 0o777, 0o600);
        assert!(attr.mode & MODE_FILE != 0);
        assert_eq!(attr.size, 123);
        assert_eq!(attr.mtime, 99);
    }

    #[test]
    fn long_names_are_rejected() {
        let mut fx = Fixture::new();
        let name = "n".repeat(300);
        assert!(matches!(
            fx.touch(NodeIndex::ROOT, &name),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn concurrent_inserts_into_one_directory() {
        use std::sync::Arc;
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let arena = NodeArena::create(&dir.path().join("nodes.dat"), 64)
            .expect("arena creation should succeed");
        let strings = StringTable::create(&dir.path().join("strings.dat"), 4096, 1 << 20)
            .expect("table creation should succeed");
        let wal = Arc::new(
            Wal::create(&dir.path().join("wal.log"), WalSync::Always)
                .expect("wal creation should succeed"),
        );
        let tree = Arc::new(Tree::new(arena, strings, 255));
        tree.init_root(0).expect("root init should succeed");

        let mut handles = Vec::new();
        for worker in 0..4u32 {
            let tree = Arc::clone(&tree);
            let wal = Arc::clone(&wal);
            handles.push(std::thread::spawn(move || {
                for i in 0..3u32 {
                    let name = format!("w{worker}-{i}");
                    tree.insert(
                        &wal,
                        u64::from(worker * 100 + i) + 1,
                        NodeIndex::ROOT,
                        name.as_bytes(),
                        MODE_FILE | 0o644,
                        worker * 100 + i + 2,
                        0,
                    )
                    .expect("insert should succeed");
                }
            }));
        }
        for handle in handles {
            handle.join().expect("worker should finish");
        }

        let entries = tree.readdir(NodeIndex::ROOT).expect("readdir should succeed");
        assert_eq!(entries.len(), 12);
        let mut sorted = entries.clone();
        sorted.sort_by(|a, b| name_order(a.name.as_bytes(), b.name.as_bytes()));
        let lhs: Vec<&str> = entries.iter().map(|entry| entry.name.as_str()).collect();
        let rhs: Vec<&str> = sorted.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(lhs, rhs, "children must stay sorted under concurrency");
    }
}
