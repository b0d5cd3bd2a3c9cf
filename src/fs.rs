//! The mounted filesystem.
//!
//! `RazorFs` is the single owned value a bridge receives at mount: it ties
//! the tree, journal, data store and attribute map together, allocates
//! transaction ids and inodes, and runs the background relayout thread.
//! The operation surface a bridge consumes is the [`Vfs`] trait; the core
//! never imports the bridge.
//!
//! Any `Corrupted` error flips the filesystem read-only; the next mount
//! must run the checker before writes are accepted again.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use fnv::FnvHashMap;
use parking_lot::{Condvar, Mutex};

use crate::config::Config;
use crate::data::DataStore;
use crate::error::{FsError, Result};
use crate::numa;
use crate::persist::{DataDir, LockFile};
use crate::storage::node::{NodeIndex, MODE_DIR, MODE_FILE};
use crate::storage::{NodeArena, StringTable};
use crate::tree::rebalance;
use crate::tree::{DirEntry, MetaPatch, NodeAttr, RenameFlags, Tree};
use crate::wal::record::{Blob, Payload};
use crate::wal::{recover, Wal};
use crate::xattr::{self, XattrStore};

/// Filesystem-wide occupancy numbers for `statfs`.
#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub max_nodes: u32,
    pub live_nodes: u32,
    pub strings_used: u32,
    pub strings_capacity: u32,
    pub journal_bytes: u64,
    pub block_size: u32,
}

/// The capability surface consumed by a FUSE bridge or a test harness.
pub trait Vfs: Send + Sync {
    fn lookup(&self, path: &str) -> Result<NodeAttr>;
    fn getattr(&self, idx: NodeIndex) -> Result<NodeAttr>;
    fn setattr(&self, idx: NodeIndex, mode: Option<u16>, mtime: Option<u32>) -> Result<NodeAttr>;
    fn readdir(&self, idx: NodeIndex) -> Result<Vec<DirEntry>>;
    fn create(&self, parent: NodeIndex, name: &str, mode: u16) -> Result<NodeAttr>;
    fn mkdir(&self, parent: NodeIndex, name: &str, mode: u16) -> Result<NodeAttr>;
    fn unlink(&self, parent: NodeIndex, name: &str) -> Result<()>;
    fn rmdir(&self, parent: NodeIndex, name: &str) -> Result<()>;
    fn rename(
        &self,
        src_parent: NodeIndex,
        src_name: &str,
        dst_parent: NodeIndex,
        dst_name: &str,
        flags: RenameFlags,
    ) -> Result<()>;
    fn link(&self, src: NodeIndex, dst_parent: NodeIndex, name: &str) -> Result<NodeAttr>;
    fn symlink(&self, parent: NodeIndex, name: &str, target: &str) -> Result<NodeAttr>;
    fn open(&self, idx: NodeIndex) -> Result<()>;
    fn read(&self, idx: NodeIndex, offset: u64, len: usize) -> Result<Vec<u8>>;
    fn write(&self, idx: NodeIndex, offset: u64, buf: &[u8]) -> Result<usize>;
    fn truncate(&self, idx: NodeIndex, size: u64) -> Result<()>;
    fn fsync(&self, idx: NodeIndex) -> Result<()>;
    fn flush(&self, idx: NodeIndex) -> Result<()>;
    fn release(&self, idx: NodeIndex) -> Result<()>;
    fn statfs(&self) -> Result<StatFs>;
    fn utimens(&self, idx: NodeIndex, mtime: u32) -> Result<()>;
    /// True when `mask` (an rwx bit set) is allowed by the node's owner
    /// permission bits; the bridge maps `false` to EACCES.
    fn access(&self, idx: NodeIndex, mask: u16) -> Result<bool>;
    fn xattr_set(&self, idx: NodeIndex, name: &str, value: &[u8]) -> Result<()>;
    fn xattr_get(&self, idx: NodeIndex, name: &str) -> Result<Vec<u8>>;
    fn xattr_list(&self, idx: NodeIndex) -> Result<Vec<String>>;
    fn xattr_remove(&self, idx: NodeIndex, name: &str) -> Result<()>;
}

struct InodeAllocator {
    next: u32,
    free: Vec<u32>,
}

impl InodeAllocator {
    fn alloc(&mut self) -> u32 {
        self.free.pop().unwrap_or_else(|| {
            self.next += 1;
            self.next
        })
    }

    fn release(&mut self, inode: u32) {
        self.free.push(inode);
    }
}

pub struct RazorFs {
    config: Config,
    paths: DataDir,
    tree: Tree,
    wal: Wal,
    data: DataStore,
    xattrs: XattrStore,
    next_txn: AtomicU64,
    inodes: Mutex<InodeAllocator>,
    /// Inode to link records, tracked only while an inode has more than one
    /// link. Kept so a write through one link can refresh its siblings.
    links: Mutex<FnvHashMap<u32, Vec<NodeIndex>>>,
    read_only: AtomicBool,
    unmounted: AtomicBool,
    mutations: AtomicU32,
    relayout_due: Mutex<bool>,
    relayout_cv: Condvar,
    relayout_thread: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
    /// Held until unmount (or abandonment) so the lock releases after
    /// every map has flushed.
    lock: Mutex<Option<LockFile>>,
}

fn unix_now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as u32)
        .unwrap_or(0)
}

impl RazorFs {
    /// Mounts (formatting on first use), running recovery when the last
    /// shutdown was not clean.
    pub fn mount(config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        let paths = DataDir::new(&config.data_dir);
        paths.ensure_exists()?;
        let lock = LockFile::acquire(&paths)?;

        let fresh = !paths.is_formatted();
        let (arena, strings, wal) = if fresh {
            log::info!("formatting {}", paths.root().display());
            (
                NodeArena::create(&paths.arena(), config.max_nodes)?,
                StringTable::create(&paths.strings(), 64 * 1024, config.string_capacity_bytes)?,
                Wal::create(&paths.wal(), config.wal_sync)?,
            )
        } else {
            (
                NodeArena::open(&paths.arena())?,
                StringTable::open(&paths.strings(), config.string_capacity_bytes)?,
                Wal::open(&paths.wal(), config.wal_sync)?,
            )
        };

        let (region, region_len) = arena.region();
        numa::bind_local(region, region_len, config.numa);

        let tree = Tree::new(arena, strings, config.max_name_len);
        let data = DataStore::new(paths.root(), config.compression, config.compression_min_bytes);
        let xattrs = XattrStore::load(&paths.xattrs())?;

        if fresh {
            tree.init_root(unix_now_secs())?;
        } else if !wal.clean_flag()? {
            log::warn!("unclean shutdown detected, running recovery");
            let stats = recover(&wal, tree.arena(), tree.strings(), &data, &xattrs)?;
            log::info!(
                "recovered {} records ({} committed, {} undone)",
                stats.records_scanned,
                stats.committed_txns,
                stats.undone_txns
            );
        }

        let fs = Arc::new(Self {
            next_txn: AtomicU64::new(1),
            inodes: Mutex::new(InodeAllocator { next: 1, free: Vec::new() }),
            links: Mutex::new(FnvHashMap::default()),
            read_only: AtomicBool::new(false),
            unmounted: AtomicBool::new(false),
            mutations: AtomicU32::new(0),
            relayout_due: Mutex::new(false),
            relayout_cv: Condvar::new(),
            relayout_thread: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            config,
            paths,
            tree,
            wal,
            data,
            xattrs,
            lock: Mutex::new(Some(lock)),
        });

        fs.rebuild_runtime_state();
        // Recovery (or the fresh format) left a consistent image; persist
        // it and restart the journal before going live.
        fs.checkpoint()?;
        fs.wal.set_clean_flag(false)?;
        fs.spawn_relayout_thread();
        log::info!("mounted {}", fs.paths.root().display());
        Ok(fs)
    }

    /// Scans the arena to rebuild the inode allocator and the hardlink map.
    fn rebuild_runtime_state(&self) {
        let arena = self.tree.arena();
        let mut max_inode = 1u32;
        let mut groups: FnvHashMap<u32, Vec<NodeIndex>> = FnvHashMap::default();
        for slot in 1..arena.capacity() as u16 {
            let idx = NodeIndex::new(slot);
            let node = *arena.node(idx);
            if node.is_free() {
                continue;
            }
            max_inode = max_inode.max(node.inode);
            if node.is_file() {
                groups.entry(node.inode).or_default().push(idx);
            }
        }
        groups.retain(|_, indices| indices.len() > 1);
        *self.links.lock() = groups;
        self.inodes.lock().next = max_inode;
    }

    /// Quiesces writers, flushes every map, checkpoints the journal and
    /// sets the clean flag. Idempotent; also invoked by `Drop`.
    pub fn unmount(&self) -> Result<()> {
        if self.unmounted.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.store(true, Ordering::SeqCst);
        self.relayout_cv.notify_all();
        if let Some(handle) = self.relayout_thread.lock().take() {
            // When the final drop happens on the relayout thread itself,
            // joining would be a self-join; the thread is already exiting.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
        // The exclusive growth lock waits out every in-flight operation.
        {
            let _growth = self.tree.growth.write();
            self.checkpoint_locked()?;
            self.wal.set_clean_flag(true)?;
        }
        self.lock.lock().take();
        log::info!("unmounted {}", self.paths.root().display());
        Ok(())
    }

    /// Tears the mount down the way `kill -9` would: the background thread
    /// stops and the mount lock releases, but nothing is flushed,
    /// checkpointed, or marked clean. The next mount must recover. Exists
    /// for crash scenarios in tests and fault-injection harnesses.
    pub fn abandon(&self) {
        if self.unmounted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.store(true, Ordering::SeqCst);
        self.relayout_cv.notify_all();
        if let Some(handle) = self.relayout_thread.lock().take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
        self.lock.lock().take();
        log::warn!("abandoned {} without a clean shutdown", self.paths.root().display());
    }

    fn checkpoint(&self) -> Result<()> {
        let _growth = self.tree.growth.write();
        self.checkpoint_locked()
    }

    /// Caller holds the growth lock exclusively (or is single-threaded at
    /// mount).
    fn checkpoint_locked(&self) -> Result<()> {
        self.tree.arena().flush()?;
        self.tree.strings().flush()?;
        self.xattrs.save(&self.paths.xattrs())?;
        self.wal.checkpoint()?;
        Ok(())
    }

    fn txn(&self) -> u64 {
        self.next_txn.fetch_add(1, Ordering::Relaxed)
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(FsError::ReadOnly);
        }
        Ok(())
    }

    /// Funnel for operation results: corruption flips the filesystem
    /// read-only before the error continues to the bridge.
    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                log::error!("fatal error, switching read-only: {err}");
                self.read_only.store(true, Ordering::Release);
            }
        }
        result
    }

    fn note_mutation(&self) {
        let count = self.mutations.fetch_add(1, Ordering::Relaxed) + 1;
        if count % self.config.rebalance_interval_ops == 0 {
            *self.relayout_due.lock() = true;
            self.relayout_cv.notify_one();
        }
    }

    fn spawn_relayout_thread(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = std::thread::Builder::new()
            .name("razorfs-relayout".into())
            .spawn(move || loop {
                // The strong reference is dropped at the bottom of every
                // iteration so an abandoned mount can still tear down.
                let Some(fs) = weak.upgrade() else { return };
                let due_now = {
                    let mut due = fs.relayout_due.lock();
                    if !*due && !fs.shutdown.load(Ordering::SeqCst) {
                        let _ = fs
                            .relayout_cv
                            .wait_for(&mut due, std::time::Duration::from_millis(200));
                    }
                    if fs.shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    std::mem::take(&mut *due)
                };
                if due_now {
                    if let Err(err) = fs.run_relayout() {
                        log::warn!("relayout pass failed: {err}");
                    }
                }
                drop(fs);
            })
            .expect("relayout thread should spawn");
        *self.relayout_thread.lock() = Some(handle);
    }

    /// One relayout pass: rewrite the arena in BFS order, remap the link
    /// table, checkpoint so the journal prefix can be dropped.
    fn run_relayout(&self) -> Result<()> {
        if self.read_only.load(Ordering::Acquire) {
            return Ok(());
        }
        let _growth = self.tree.growth.write();
        let stats = self.track(rebalance::relayout(&self.tree))?;
        {
            let mut links = self.links.lock();
            for indices in links.values_mut() {
                for idx in indices.iter_mut() {
                    *idx = NodeIndex::new(stats.perm[idx.slot()]);
                }
            }
        }
        self.checkpoint_locked()?;
        log::debug!("relayout moved {} of {} nodes", stats.moved, stats.live);
        Ok(())
    }

    /// Reaps an inode after its last link went away: payload, attributes,
    /// and the inode number itself.
    fn reap_or_relink(&self, inode: u32, removed_idx: NodeIndex) -> Result<()> {
        let remaining = {
            let mut links = self.links.lock();
            match links.get_mut(&inode) {
                Some(indices) => {
                    indices.retain(|&idx| idx != removed_idx);
                    if indices.len() <= 1 {
                        links.remove(&inode).unwrap_or_default()
                    } else {
                        indices.clone()
                    }
                }
                None => Vec::new(),
            }
        };
        if remaining.is_empty() {
            self.data.remove(inode)?;
            self.xattrs.remove_inode(inode);
            self.inodes.lock().release(inode);
        } else {
            let nlink = remaining.len() as u16;
            self.tree.set_nlink(&remaining, nlink);
        }
        Ok(())
    }

    fn insert_entry(&self, parent: NodeIndex, name: &str, mode: u16) -> Result<NodeAttr> {
        self.check_writable()?;
        let inode = self.inodes.lock().alloc();
        let txn = self.txn();
        let outcome = self.track(self.tree.insert(
            &self.wal,
            txn,
            parent,
            name.as_bytes(),
            mode,
            inode,
            unix_now_secs(),
        ));
        match outcome {
            Ok(idx) => {
                self.note_mutation();
                self.tree.node_attr(idx)
            }
            Err(err) => {
                self.inodes.lock().release(inode);
                Err(err)
            }
        }
    }

    fn remove_entry(&self, parent: NodeIndex, name: &str, want_dir: bool) -> Result<()> {
        self.check_writable()?;
        let child = self.tree.lookup_child(parent, name.as_bytes())?;
        let attr = self.tree.node_attr(child)?;
        if want_dir != attr.is_dir {
            return Err(if want_dir {
                FsError::InvalidArgument(format!("{name:?} is not a directory"))
            } else {
                FsError::InvalidArgument(format!("{name:?} is a directory"))
            });
        }
        let txn = self.txn();
        let inode = self.track(self.tree.delete(&self.wal, txn, child))?;
        self.reap_or_relink(inode, child)?;
        self.note_mutation();
        Ok(())
    }

    /// Direct access to the tree, for the checker's mounted-state asserts
    /// in tests.
    pub fn tree(&self) -> &Tree {
        &self.tree
    }
}

impl Drop for RazorFs {
    fn drop(&mut self) {
        if !self.unmounted.load(Ordering::SeqCst) {
            if let Err(err) = self.unmount() {
                log::error!("unmount during drop failed: {err}");
            }
        }
    }
}

impl Vfs for RazorFs {
    fn lookup(&self, path: &str) -> Result<NodeAttr> {
        let idx = self.tree.lookup(path)?;
        self.tree.node_attr(idx)
    }

    fn getattr(&self, idx: NodeIndex) -> Result<NodeAttr> {
        self.tree.node_attr(idx)
    }

    fn setattr(&self, idx: NodeIndex, mode: Option<u16>, mtime: Option<u32>) -> Result<NodeAttr> {
        self.check_writable()?;
        let txn = self.txn();
        let patch = MetaPatch { mode, size: None, mtime };
        self.track(self.tree.set_meta(&self.wal, txn, idx, patch))?;
        self.note_mutation();
        self.tree.node_attr(idx)
    }

    fn readdir(&self, idx: NodeIndex) -> Result<Vec<DirEntry>> {
        self.tree.readdir(idx)
    }

    fn create(&self, parent: NodeIndex, name: &str, mode: u16) -> Result<NodeAttr> {
        self.insert_entry(parent, name, MODE_FILE | (mode & 0o7777))
    }

    fn mkdir(&self, parent: NodeIndex, name: &str, mode: u16) -> Result<NodeAttr> {
        self.insert_entry(parent, name, MODE_DIR | (mode & 0o7777))
    }

    fn unlink(&self, parent: NodeIndex, name: &str) -> Result<()> {
        self.remove_entry(parent, name, false)
    }

    fn rmdir(&self, parent: NodeIndex, name: &str) -> Result<()> {
        self.remove_entry(parent, name, true)
    }

    fn rename(
        &self,
        src_parent: NodeIndex,
        src_name: &str,
        dst_parent: NodeIndex,
        dst_name: &str,
        flags: RenameFlags,
    ) -> Result<()> {
        self.check_writable()?;
        let txn = self.txn();
        let outcome = self.track(self.tree.rename(
            &self.wal,
            txn,
            src_parent,
            src_name.as_bytes(),
            dst_parent,
            dst_name.as_bytes(),
            flags,
        ))?;
        if let Some((replaced_idx, inode)) = outcome.replaced {
            self.reap_or_relink(inode, replaced_idx)?;
        }
        self.note_mutation();
        Ok(())
    }

    fn link(&self, src: NodeIndex, dst_parent: NodeIndex, name: &str) -> Result<NodeAttr> {
        self.check_writable()?;
        let txn = self.txn();
        let outcome = self.track(self.tree.hardlink(
            &self.wal,
            txn,
            src,
            dst_parent,
            name.as_bytes(),
        ))?;
        {
            let mut links = self.links.lock();
            let indices = links.entry(outcome.inode).or_insert_with(|| vec![src]);
            if !indices.contains(&src) {
                indices.push(src);
            }
            indices.push(outcome.new_idx);
            let siblings: Vec<NodeIndex> = indices
                .iter()
                .copied()
                .filter(|&idx| idx != src && idx != outcome.new_idx)
                .collect();
            drop(links);
            if !siblings.is_empty() {
                self.tree.set_nlink(&siblings, outcome.nlink);
            }
        }
        self.note_mutation();
        self.tree.node_attr(outcome.new_idx)
    }

    fn symlink(&self, _parent: NodeIndex, _name: &str, _target: &str) -> Result<NodeAttr> {
        Err(FsError::Unsupported("symlink"))
    }

    fn open(&self, idx: NodeIndex) -> Result<()> {
        self.tree.node_attr(idx).map(|_| ())
    }

    fn read(&self, idx: NodeIndex, offset: u64, len: usize) -> Result<Vec<u8>> {
        let _growth = self.tree.growth.read();
        let _guard = self.tree.locks.read(idx);
        let node = *self.tree.arena().try_node(idx)?;
        if node.is_free() {
            return Err(FsError::NotFound);
        }
        if !node.is_file() {
            return Err(FsError::InvalidArgument("not a regular file".into()));
        }
        self.track(self.data.read(node.inode, offset, len, node.size))
    }

    fn write(&self, idx: NodeIndex, offset: u64, buf: &[u8]) -> Result<usize> {
        self.check_writable()?;
        let mtime = unix_now_secs();
        if buf.is_empty() {
            // No data record for empty writes; the timestamp still moves.
            let txn = self.txn();
            self.track(self.tree.set_meta(
                &self.wal,
                txn,
                idx,
                MetaPatch { mode: None, size: None, mtime: Some(mtime) },
            ))?;
            return Ok(0);
        }

        let (written, inode, new_size) = {
            let _growth = self.tree.growth.read();
            let _guard = self.tree.locks.write(idx);
            let node = *self.tree.arena().try_node(idx)?;
            if node.is_free() {
                return Err(FsError::NotFound);
            }
            if !node.is_file() {
                return Err(FsError::InvalidArgument("not a regular file".into()));
            }
            let result = self.write_locked(idx, &node, offset, buf, mtime);
            let written = self.track(result)?;
            (written, node.inode, node.size.max(offset + buf.len() as u64))
        };

        // Refresh sibling link records after releasing this node's lock:
        // the locks are taken one at a time, so two writers through
        // different links of the same inode cannot deadlock.
        let siblings: Vec<NodeIndex> = self
            .links
            .lock()
            .get(&inode)
            .map(|indices| indices.iter().copied().filter(|&other| other != idx).collect())
            .unwrap_or_default();
        if !siblings.is_empty() {
            let _growth = self.tree.growth.read();
            for sibling in siblings {
                let _sibling_guard = self.tree.locks.write(sibling);
                // SAFETY: the sibling's write lock is held.
                unsafe {
                    let other = self.tree.arena().node_mut(sibling);
                    if !other.is_free() && other.inode == inode {
                        other.size = new_size;
                        other.mtime = mtime;
                    }
                }
            }
        }

        self.note_mutation();
        Ok(written)
    }

    fn truncate(&self, idx: NodeIndex, size: u64) -> Result<()> {
        self.check_writable()?;
        let txn = self.txn();
        let node = self.tree.node_attr(idx)?;
        if node.is_dir {
            return Err(FsError::InvalidArgument("cannot truncate a directory".into()));
        }
        self.track(self.tree.set_meta(
            &self.wal,
            txn,
            idx,
            MetaPatch { mode: None, size: Some(size), mtime: Some(unix_now_secs()) },
        ))?;
        // Shrink the payload best-effort; node size stays authoritative
        // either way.
        let outcome = self.data.truncate(node.inode, size, node.size);
        self.track(outcome)?;
        self.note_mutation();
        Ok(())
    }

    fn fsync(&self, idx: NodeIndex) -> Result<()> {
        let node = self.tree.node_attr(idx)?;
        if !node.is_dir {
            self.data.sync(node.inode)?;
        }
        self.wal.sync_now()
    }

    fn flush(&self, _idx: NodeIndex) -> Result<()> {
        // Writes are synchronous; nothing is buffered per handle.
        Ok(())
    }

    fn release(&self, _idx: NodeIndex) -> Result<()> {
        Ok(())
    }

    fn statfs(&self) -> Result<StatFs> {
        Ok(StatFs {
            max_nodes: self.tree.arena().capacity(),
            live_nodes: self.tree.arena().live_count(),
            strings_used: self.tree.strings().used(),
            strings_capacity: self.tree.strings().capacity(),
            journal_bytes: self.wal.len(),
            block_size: crate::data::codec::BLOCK_SIZE,
        })
    }

    fn utimens(&self, idx: NodeIndex, mtime: u32) -> Result<()> {
        self.check_writable()?;
        let txn = self.txn();
        self.track(self.tree.set_meta(
            &self.wal,
            txn,
            idx,
            MetaPatch { mode: None, size: None, mtime: Some(mtime) },
        ))?;
        self.note_mutation();
        Ok(())
    }

    fn access(&self, idx: NodeIndex, mask: u16) -> Result<bool> {
        let attr = self.tree.node_attr(idx)?;
        let owner_bits = (attr.mode >> 6) & 0o7;
        Ok(mask & !owner_bits == 0)
    }

    fn xattr_set(&self, idx: NodeIndex, name: &str, value: &[u8]) -> Result<()> {
        self.check_writable()?;
        xattr::validate_name(name)?;
        let attr = self.tree.node_attr(idx)?;
        let _growth = self.tree.growth.read();
        let _guard = self.tree.locks.write(idx);
        let prior = self.xattrs.set(attr.inode, name, value.to_vec());
        let txn = self.txn();
        let journaled = self
            .wal
            .append_txn(
                txn,
                vec![
                    Payload::Begin,
                    Payload::XattrSet {
                        inode: attr.inode,
                        name: name.to_string(),
                        value: value.to_vec(),
                        prior: prior.clone(),
                    },
                    Payload::Commit,
                ],
            )
            .and_then(|target| self.wal.commit_sync(target));
        if let Err(err) = journaled {
            match prior {
                Some(old) => {
                    self.xattrs.set(attr.inode, name, old);
                }
                None => {
                    self.xattrs.remove(attr.inode, name);
                }
            }
            return self.track(Err(err));
        }
        self.note_mutation();
        Ok(())
    }

    fn xattr_get(&self, idx: NodeIndex, name: &str) -> Result<Vec<u8>> {
        xattr::validate_name(name)?;
        let attr = self.tree.node_attr(idx)?;
        self.xattrs.get(attr.inode, name).ok_or(FsError::NotFound)
    }

    fn xattr_list(&self, idx: NodeIndex) -> Result<Vec<String>> {
        let attr = self.tree.node_attr(idx)?;
        Ok(self.xattrs.list(attr.inode))
    }

    fn xattr_remove(&self, idx: NodeIndex, name: &str) -> Result<()> {
        self.check_writable()?;
        xattr::validate_name(name)?;
        let attr = self.tree.node_attr(idx)?;
        let _growth = self.tree.growth.read();
        let _guard = self.tree.locks.write(idx);
        let Some(prior) = self.xattrs.remove(attr.inode, name) else {
            return Err(FsError::NotFound);
        };
        let txn = self.txn();
        let journaled = self
            .wal
            .append_txn(
                txn,
                vec![
                    Payload::Begin,
                    Payload::XattrDel {
                        inode: attr.inode,
                        name: name.to_string(),
                        prior: Some(prior.clone()),
                    },
                    Payload::Commit,
                ],
            )
            .and_then(|target| self.wal.commit_sync(target));
        if let Err(err) = journaled {
            self.xattrs.set(attr.inode, name, prior);
            return self.track(Err(err));
        }
        self.note_mutation();
        Ok(())
    }
}

impl RazorFs {
    /// The journaled body of `write`; caller holds the growth lock shared
    /// and the node's write lock.
    fn write_locked(
        &self,
        idx: NodeIndex,
        node: &crate::storage::node::Node,
        offset: u64,
        buf: &[u8],
        mtime: u32,
    ) -> Result<usize> {
        let prior_size = node.size;
        let mut content = self.data.load(node.inode, prior_size)?;
        let prior_range = {
            let start = (offset as usize).min(content.len());
            let end = (offset as usize + buf.len()).min(content.len());
            content[start..end].to_vec()
        };

        let end = offset as usize + buf.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[offset as usize..end].copy_from_slice(buf);
        self.data.store(node.inode, &content)?;

        let new_size = prior_size.max(end as u64);
        // SAFETY: the node's write lock is held by the caller.
        unsafe {
            let live = self.tree.arena().node_mut(idx);
            live.size = new_size;
            live.mtime = mtime;
        }

        let txn = self.txn();
        let journaled = self
            .wal
            .append_txn(
                txn,
                vec![
                    Payload::Begin,
                    Payload::WriteData {
                        inode: node.inode,
                        offset,
                        length: buf.len() as u64,
                        compressed: self.config.compression,
                        blob: Blob::Inline(buf.to_vec()),
                        prior: Blob::Inline(prior_range.clone()),
                        prior_size,
                    },
                    Payload::UpdateMeta {
                        idx: idx.raw(),
                        mode: node.mode,
                        size: new_size,
                        mtime,
                        prior_mode: node.mode,
                        prior_size,
                        prior_mtime: node.mtime,
                    },
                    Payload::Commit,
                ],
            )
            .and_then(|target| self.wal.commit_sync(target));
        if let Err(err) = journaled {
            // Unwind both the node fields and the payload image.
            // SAFETY: same lock as the mutation above.
            unsafe {
                let live = self.tree.arena().node_mut(idx);
                live.size = prior_size;
                live.mtime = node.mtime;
            }
            let mut restored = content;
            let end = (offset as usize + prior_range.len()).min(restored.len());
            let start = (offset as usize).min(end);
            restored[start..end].copy_from_slice(&prior_range);
            restored.truncate(prior_size as usize);
            let _ = self.data.store(node.inode, &restored);
            return Err(err);
        }
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mount_scratch() -> (tempfile::TempDir, Arc<RazorFs>) {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let config = Config::with_data_dir(dir.path());
        let fs = RazorFs::mount(config).expect("mount should succeed");
        (dir, fs)
    }

    #[test]
    fn create_write_read() {
        let (_dir, fs) = mount_scratch();
        let root = NodeIndex::ROOT;
        let file = fs.create(root, "hello.txt", 0o644).expect("create should succeed");
        let written = fs.write(file.idx, 0, b"hello world").expect("write should succeed");
        assert_eq!(written, 11);
        let back = fs.read(file.idx, 0, 64).expect("read should succeed");
        assert_eq!(back, b"hello world");
        let attr = fs.getattr(file.idx).expect("getattr should succeed");
        assert_eq!(attr.size, 11);
        fs.unmount().expect("unmount should succeed");
    }

    #[test]
    fn mkdir_and_listing() {
        let (_dir, fs) = mount_scratch();
        let dir_attr = fs.mkdir(NodeIndex::ROOT, "docs", 0o755).expect("mkdir should succeed");
        fs.create(dir_attr.idx, "a.txt", 0o644).expect("create should succeed");
        fs.create(dir_attr.idx, "b.txt", 0o644).expect("create should succeed");
        let entries = fs.readdir(dir_attr.idx).expect("readdir should succeed");
        let names: Vec<&str> = entries.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        fs.unmount().expect("unmount should succeed");
    }

    #[test]
    fn unlink_reclaims_inode_and_payload() {
        let (dir, fs) = mount_scratch();
        let file = fs.create(NodeIndex::ROOT, "gone", 0o644).expect("create should succeed");
        fs.write(file.idx, 0, b"bytes").expect("write should succeed");
        let payload = dir.path().join(format!("file_{}", file.inode));
        assert!(payload.exists());
        fs.unlink(NodeIndex::ROOT, "gone").expect("unlink should succeed");
        assert!(!payload.exists());
        assert!(matches!(fs.lookup("/gone"), Err(FsError::NotFound)));
        fs.unmount().expect("unmount should succeed");
    }

    #[test]
    fn symlink_is_unsupported() {
        let (_dir, fs) = mount_scratch();
        assert!(matches!(
            fs.symlink(NodeIndex::ROOT, "s", "/target"),
            Err(FsError::Unsupported(_))
        ));
        fs.unmount().expect("unmount should succeed");
    }

    #[test]
    fn double_mount_is_excluded() {
        let (dir, fs) = mount_scratch();
        let second = RazorFs::mount(Config::with_data_dir(dir.path()));
        assert!(second.is_err());
        fs.unmount().expect("unmount should succeed");
    }

    #[test]
    fn hardlink_then_unlink_keeps_content() {
        let (_dir, fs) = mount_scratch();
        let file = fs.create(NodeIndex::ROOT, "orig", 0o644).expect("create should succeed");
        fs.write(file.idx, 0, b"shared").expect("write should succeed");
        let alias = fs.link(file.idx, NodeIndex::ROOT, "alias").expect("link should succeed");
        assert_eq!(alias.nlink, 2);

        fs.unlink(NodeIndex::ROOT, "orig").expect("unlink should succeed");
        let attr = fs.lookup("/alias").expect("lookup should succeed");
        assert_eq!(attr.nlink, 1);
        let back = fs.read(attr.idx, 0, 16).expect("read should succeed");
        assert_eq!(back, b"shared");
        fs.unmount().expect("unmount should succeed");
    }

    #[test]
    fn xattr_surface() {
        let (_dir, fs) = mount_scratch();
        let file = fs.create(NodeIndex::ROOT, "f", 0o644).expect("create should succeed");
        fs.xattr_set(file.idx, "user.color", b"red").expect("xattr_set should succeed");
        assert_eq!(
            fs.xattr_get(file.idx, "user.color").expect("xattr_get should succeed"),
            b"red"
        );
        assert_eq!(fs.xattr_list(file.idx).expect("xattr_list should succeed"), vec![
            "user.color".to_string()
        ]);
        assert!(fs.xattr_set(file.idx, "nope.key", b"x").is_err());
        fs.xattr_remove(file.idx, "user.color").expect("xattr_remove should succeed");
        assert!(matches!(fs.xattr_get(file.idx, "user.color"), Err(FsError::NotFound)));
        fs.unmount().expect("unmount should succeed");
    }

    #[test]
    fn zero_length_write_bumps_mtime_only() {
        let (_dir, fs) = mount_scratch();
        let file = fs.create(NodeIndex::ROOT, "f", 0o644).expect("create should succeed");
        let journal_before = fs.wal.len();
        let written = fs.write(file.idx, 0, b"").expect("write should succeed");
        assert_eq!(written, 0);
        let journal_after = fs.wal.len();
        // An UPDATE_META transaction may land, but no WRITE_DATA record.
        let scan = fs.wal.scan().expect("scan should succeed");
        assert!(scan
            .records
            .iter()
            .all(|record| !matches!(record.payload, Payload::WriteData { .. })));
        assert!(journal_after >= journal_before);
        fs.unmount().expect("unmount should succeed");
    }

    #[test]
    fn statfs_reports_occupancy() {
        let (_dir, fs) = mount_scratch();
        fs.create(NodeIndex::ROOT, "a", 0o644).expect("create should succeed");
        let stat = fs.statfs().expect("statfs should succeed");
        assert_eq!(stat.live_nodes, 2); // root + file
        assert!(stat.strings_used > 0);
        fs.unmount().expect("unmount should succeed");
    }

    #[test]
    fn access_checks_owner_bits() {
        let (_dir, fs) = mount_scratch();
        let file = fs.create(NodeIndex::ROOT, "f", 0o600).expect("create should succeed");
        assert!(fs.access(file.idx, 0o6).expect("access should succeed"));
        assert!(!fs.access(file.idx, 0o1).expect("access should succeed"));
        fs.unmount().expect("unmount should succeed");
    }
}
