//! Offline consistency checker.
//!
//! Runs against an unmounted data directory (the mount lock is taken to
//! make sure of it) in six ordered phases: tree structure, inode validity,
//! string offsets, data blocks, journal health, and finally repair, which
//! only runs under operator consent. Detection phases collect issues with
//! their fixes; repair applies the fixes and reflushes the maps.

use std::collections::HashSet;
use std::path::Path;

use fnv::FnvHashMap;
use rayon::prelude::*;

use crate::data::{codec, DataStore};
use crate::error::{FsError, Result};
use crate::persist::{DataDir, LockFile};
use crate::storage::node::{name_order, Node, NodeIndex, BRANCH_FACTOR};
use crate::storage::{NodeArena, StringTable};
use crate::wal::writer::{Wal, WAL_HEADER_LEN};
use crate::config::WalSync;

#[derive(Debug, Clone, Copy, Default)]
pub struct CheckOptions {
    /// Apply fixes (phase 6). `--dry-run` forces this off.
    pub repair: bool,
    pub verbose: bool,
}

/// How a finding can be fixed; `Unrepairable` drives exit code 2.
#[derive(Debug, Clone)]
enum Fix {
    /// Drop a child entry pointing at a dead or misparented node.
    DropChildLink { parent: NodeIndex, child: NodeIndex },
    /// Reattach an orphaned node under the root.
    ReconnectOrphan { idx: NodeIndex },
    /// Clear a node whose record cannot be trusted.
    ClearNode { idx: NodeIndex },
    /// Truncate a data file with a corrupt compressed stream to zero.
    TruncateData { inode: u32 },
    /// Cut the journal back to its valid prefix.
    TruncateJournalTail { valid_len: u64 },
    /// Nothing automatic can be done.
    Unrepairable,
}

#[derive(Debug, Clone)]
pub struct Finding {
    pub phase: u8,
    pub message: String,
    fix: Fix,
}

#[derive(Debug, Default)]
pub struct Summary {
    pub findings: Vec<Finding>,
    pub repaired: usize,
    pub repair_failures: usize,
    /// The last shutdown was not clean; recovery runs at next mount.
    pub unclean_shutdown: bool,
}

impl Summary {
    pub fn errors_found(&self) -> usize {
        self.findings.len()
    }

    pub fn unrepairable(&self) -> bool {
        self.repair_failures > 0
            || self
                .findings
                .iter()
                .any(|finding| matches!(finding.fix, Fix::Unrepairable))
    }

    /// 0 clean, 1 errors found, 2 unrepairable.
    pub fn exit_code(&self) -> i32 {
        if self.unrepairable() {
            2
        } else if self.findings.is_empty() {
            0
        } else {
            1
        }
    }
}

struct Checker {
    arena: NodeArena,
    strings: StringTable,
    data: DataStore,
    paths: DataDir,
    options: CheckOptions,
    summary: Summary,
}

/// Checks (and optionally repairs) the filesystem at `data_dir`.
pub fn check(data_dir: &Path, options: CheckOptions) -> Result<Summary> {
    let paths = DataDir::new(data_dir);
    if !paths.is_formatted() {
        return Err(FsError::InvalidArgument(format!(
            "{} holds no filesystem",
            data_dir.display()
        )));
    }
    let _lock = LockFile::acquire(&paths)?;

    let arena = NodeArena::open(&paths.arena())?;
    let strings = StringTable::open(&paths.strings(), u64::MAX)?;
    let data = DataStore::new(paths.root(), true, 0);

    let mut checker = Checker {
        arena,
        strings,
        data,
        paths,
        options,
        summary: Summary::default(),
    };
    checker.phase1_tree_structure();
    checker.phase2_inodes();
    checker.phase3_string_offsets();
    checker.phase4_data_blocks();
    checker.phase5_journal()?;
    if options.repair {
        checker.phase6_repair()?;
    }
    Ok(checker.summary)
}

impl Checker {
    fn report(&mut self, phase: u8, message: String, fix: Fix) {
        if self.options.verbose {
            log::info!("phase {phase}: {message}");
        }
        self.summary.findings.push(Finding { phase, message, fix });
    }

    fn live_indices(&self) -> Vec<NodeIndex> {
        (1..self.arena.capacity() as u16)
            .map(NodeIndex::new)
            .filter(|&idx| !self.arena.node(idx).is_free())
            .collect()
    }

    /// Phase 1: parent/child consistency, branching factor, sort order,
    /// reachability (which also rules out cycles).
    fn phase1_tree_structure(&mut self) {
        if self.arena.node(NodeIndex::ROOT).is_free() {
            self.report(1, "root directory is missing".into(), Fix::Unrepairable);
            return;
        }

        let live = self.live_indices();
        for &idx in &live {
            let node = *self.arena.node(idx);
            if node.num_children as usize > BRANCH_FACTOR {
                self.report(
                    1,
                    format!("node {idx} claims {} children", node.num_children),
                    Fix::ClearNode { idx },
                );
                continue;
            }
            if node.is_dir() {
                self.check_children(idx, &node);
            } else if node.num_children != 0 {
                self.report(
                    1,
                    format!("file node {idx} has child entries"),
                    Fix::ClearNode { idx },
                );
            }
            if idx != NodeIndex::ROOT {
                self.check_parent_link(idx, &node);
            }
        }

        // Reachability from the root covers orphan and cycle detection:
        // directories have one parent, so a cycle is unreachable from the
        // root by construction.
        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut queue = std::collections::VecDeque::from([NodeIndex::ROOT]);
        visited.insert(NodeIndex::ROOT);
        while let Some(at) = queue.pop_front() {
            for child in self.arena.node(at).child_indices() {
                if child.is_sentinel() || child.slot() as u32 >= self.arena.capacity() {
                    continue;
                }
                if visited.insert(child) {
                    queue.push_back(child);
                }
            }
        }
        for &idx in &live {
            if !visited.contains(&idx) {
                self.report(
                    1,
                    format!("node {idx} is unreachable from the root"),
                    Fix::ReconnectOrphan { idx },
                );
            }
        }
    }

    fn check_children(&mut self, idx: NodeIndex, node: &Node) {
        let mut prev_name: Option<Vec<u8>> = None;
        for child in node.child_indices() {
            if child.is_sentinel() || child.slot() as u32 >= self.arena.capacity() {
                self.report(
                    1,
                    format!("directory {idx} links out-of-range child {child}"),
                    Fix::DropChildLink { parent: idx, child },
                );
                continue;
            }
            let child_node = *self.arena.node(child);
            if child_node.is_free() {
                self.report(
                    1,
                    format!("directory {idx} links freed node {child}"),
                    Fix::DropChildLink { parent: idx, child },
                );
                continue;
            }
            if NodeIndex::new(child_node.parent_idx) != idx {
                self.report(
                    1,
                    format!(
                        "child {child} of {idx} claims parent {}",
                        child_node.parent_idx
                    ),
                    Fix::DropChildLink { parent: idx, child },
                );
                continue;
            }
            if let Ok(name) = self.strings.name_at(child_node.name_offset) {
                let name = name.to_vec();
                if let Some(prev) = &prev_name {
                    if name_order(prev, &name) != std::cmp::Ordering::Less {
                        self.report(
                            1,
                            format!("children of {idx} are not sorted at {child}"),
                            Fix::Unrepairable,
                        );
                    }
                }
                prev_name = Some(name);
            }
        }
    }

    fn check_parent_link(&mut self, idx: NodeIndex, node: &Node) {
        let parent = NodeIndex::new(node.parent_idx);
        if parent.is_sentinel() || parent.slot() as u32 >= self.arena.capacity() {
            self.report(
                1,
                format!("node {idx} has out-of-range parent {}", node.parent_idx),
                Fix::ReconnectOrphan { idx },
            );
            return;
        }
        let parent_node = *self.arena.node(parent);
        if parent_node.is_free() || !parent_node.is_dir() {
            self.report(
                1,
                format!("node {idx} has non-directory parent {parent}"),
                Fix::ReconnectOrphan { idx },
            );
            return;
        }
        let links = parent_node
            .child_indices()
            .filter(|&child| child == idx)
            .count();
        if links != 1 {
            self.report(
                1,
                format!("parent {parent} links node {idx} {links} times"),
                if links == 0 { Fix::ReconnectOrphan { idx } } else { Fix::Unrepairable },
            );
        }
    }

    /// Phase 2: inode values are non-zero and shared only by hardlinked
    /// regular files.
    fn phase2_inodes(&mut self) {
        let mut by_inode: FnvHashMap<u32, Vec<NodeIndex>> = FnvHashMap::default();
        for idx in self.live_indices() {
            let node = *self.arena.node(idx);
            if node.inode == 0 {
                self.report(2, format!("live node {idx} has inode 0"), Fix::ClearNode { idx });
                continue;
            }
            by_inode.entry(node.inode).or_default().push(idx);
        }
        for (inode, indices) in by_inode {
            if indices.len() < 2 {
                continue;
            }
            let all_files = indices
                .iter()
                .all(|&idx| self.arena.node(idx).is_file());
            if !all_files {
                self.report(
                    2,
                    format!("inode {inode} is shared by non-file nodes {indices:?}"),
                    Fix::Unrepairable,
                );
            }
        }
    }

    /// Phase 3: every referenced name offset lands on a name start.
    fn phase3_string_offsets(&mut self) {
        for idx in self.live_indices() {
            let offset = self.arena.node(idx).name_offset;
            if !self.strings.is_name_start(offset) {
                self.report(
                    3,
                    format!("node {idx} references invalid name offset {offset}"),
                    Fix::ClearNode { idx },
                );
            }
        }
    }

    /// Phase 4: payload presence, header sanity, stream decodability. The
    /// per-inode validation is independent, so it fans out over rayon.
    fn phase4_data_blocks(&mut self) {
        let mut inodes: Vec<(u32, u64)> = Vec::new();
        let mut seen = HashSet::new();
        for idx in self.live_indices() {
            let node = *self.arena.node(idx);
            if node.is_file() && seen.insert(node.inode) {
                inodes.push((node.inode, node.size));
            }
        }

        let data = &self.data;
        let issues: Vec<(u32, String)> = inodes
            .par_iter()
            .filter_map(|&(inode, size)| validate_payload(data, inode, size).err().map(|msg| (inode, msg)))
            .collect();
        for (inode, message) in issues {
            self.report(4, message, Fix::TruncateData { inode });
        }
    }

    /// Phase 5: journal header and trailing-record validity.
    fn phase5_journal(&mut self) -> Result<()> {
        let wal = match Wal::open(&self.paths.wal(), WalSync::Off) {
            Ok(wal) => wal,
            Err(FsError::Corrupted(message)) => {
                self.report(5, message, Fix::Unrepairable);
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        self.summary.unclean_shutdown = !wal.clean_flag()?;
        if self.summary.unclean_shutdown {
            log::warn!("unclean shutdown flagged; recovery will run at next mount");
        }
        let scan = wal.scan()?;
        if let Some((lsn, reason)) = scan.undecodable {
            self.report(
                5,
                format!("journal record at lsn {lsn} does not decode: {reason}"),
                Fix::Unrepairable,
            );
        }
        if scan.torn_tail {
            self.report(
                5,
                "journal has a torn trailing record".into(),
                Fix::TruncateJournalTail { valid_len: scan.valid_len },
            );
        }
        Ok(())
    }

    /// Phase 6: apply the fixes recorded by phases 1–5.
    fn phase6_repair(&mut self) -> Result<()> {
        let findings = std::mem::take(&mut self.summary.findings);
        for finding in &findings {
            let outcome = self.apply_fix(&finding.fix);
            match outcome {
                Ok(true) => {
                    self.summary.repaired += 1;
                    log::info!("repaired: {}", finding.message);
                }
                Ok(false) => {}
                Err(err) => {
                    self.summary.repair_failures += 1;
                    log::error!("repair failed for {:?}: {err}", finding.message);
                }
            }
        }
        self.summary.findings = findings;
        // SAFETY: the checker owns the arena exclusively (mount lock held).
        unsafe {
            self.arena.rebuild_freelist();
        }
        self.arena.flush()?;
        self.strings.flush()?;
        Ok(())
    }

    fn apply_fix(&mut self, fix: &Fix) -> Result<bool> {
        // SAFETY (all arms): offline checker; the mount lock guarantees
        // exclusive access to every structure.
        match fix {
            Fix::DropChildLink { parent, child } => unsafe {
                let node = self.arena.node_mut(*parent);
                if let Some(pos) = node.child_position(*child) {
                    node.remove_child_at(pos);
                }
                Ok(true)
            },
            Fix::ReconnectOrphan { idx } => unsafe {
                let root = self.arena.node_mut(NodeIndex::ROOT);
                if root.num_children as usize >= BRANCH_FACTOR {
                    return Err(FsError::NoSpace("root directory is full"));
                }
                if root.child_position(*idx).is_some() {
                    return Ok(false);
                }
                let name = self
                    .strings
                    .name_at(self.arena.node(*idx).name_offset)
                    .map(<[u8]>::to_vec);
                let Ok(name) = name else {
                    // Phase 3 already reported the bad offset.
                    return Ok(false);
                };
                let root_copy = *self.arena.node(NodeIndex::ROOT);
                let pos = match search_sorted(&self.arena, &self.strings, &root_copy, &name)? {
                    Some(pos) => pos,
                    None => return Err(FsError::Exists),
                };
                self.arena.node_mut(NodeIndex::ROOT).insert_child_at(pos, *idx);
                self.arena.node_mut(*idx).parent_idx = NodeIndex::ROOT.raw();
                Ok(true)
            },
            Fix::ClearNode { idx } => unsafe {
                let parent = NodeIndex::new(self.arena.node(*idx).parent_idx);
                if (parent.slot() as u32) < self.arena.capacity() {
                    let parent_node = self.arena.node_mut(parent);
                    if let Some(pos) = parent_node.child_position(*idx) {
                        parent_node.remove_child_at(pos);
                    }
                }
                *self.arena.node_mut(*idx) = Node::zeroed();
                Ok(true)
            },
            Fix::TruncateData { inode } => {
                self.data.remove(*inode)?;
                Ok(true)
            }
            Fix::TruncateJournalTail { valid_len } => {
                let file = std::fs::OpenOptions::new()
                    .write(true)
                    .open(self.paths.wal())?;
                file.set_len((*valid_len).max(WAL_HEADER_LEN))?;
                file.sync_all()?;
                Ok(true)
            }
            Fix::Unrepairable => Ok(false),
        }
    }
}

/// Sorted insertion position for `name` under `node`, or `None` when an
/// entry with that name already exists.
fn search_sorted(
    arena: &NodeArena,
    strings: &StringTable,
    node: &Node,
    name: &[u8],
) -> Result<Option<usize>> {
    let mut pos = 0usize;
    for (i, child) in node.child_indices().enumerate() {
        let child_name = strings.name_at(arena.node(child).name_offset)?;
        match name_order(name, child_name) {
            std::cmp::Ordering::Greater => pos = i + 1,
            std::cmp::Ordering::Equal => return Ok(None),
            std::cmp::Ordering::Less => break,
        }
    }
    Ok(Some(pos))
}

fn validate_payload(
    data: &DataStore,
    inode: u32,
    size: u64,
) -> std::result::Result<(), String> {
    let Some(disk_len) = data
        .disk_len(inode)
        .map_err(|err| format!("file_{inode}: {err}"))?
    else {
        // Absent payload reads as zeros; only a problem if the node claims
        // content and compression would have produced a file.
        return Ok(());
    };
    if disk_len == 0 {
        return Ok(());
    }
    let image = std::fs::read(data.path_for(inode)).map_err(|err| format!("file_{inode}: {err}"))?;
    if codec::is_compressed(&image) {
        let header = codec::parse_header(&image)
            .map_err(|err| format!("file_{inode}: bad header: {err}"))?;
        let decoded = codec::decode(&image)
            .map_err(|err| format!("file_{inode}: corrupt stream: {err}"))?;
        if decoded.len() as u64 != header.original_size {
            return Err(format!(
                "file_{inode}: decoded {} bytes, header claims {}",
                decoded.len(),
                header.original_size
            ));
        }
        if header.original_size > size {
            return Err(format!(
                "file_{inode}: payload of {} bytes exceeds node size {size}",
                header.original_size
            ));
        }
    } else if disk_len > size {
        return Err(format!(
            "file_{inode}: raw payload of {disk_len} bytes exceeds node size {size}"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fs::{RazorFs, Vfs};

    fn mounted_then_unmounted(build: impl FnOnce(&RazorFs)) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let fs = RazorFs::mount(Config::with_data_dir(dir.path())).expect("mount should succeed");
        build(&fs);
        fs.unmount().expect("unmount should succeed");
        drop(fs);
        dir
    }

    #[test]
    fn clean_filesystem_passes() {
        let dir = mounted_then_unmounted(|fs| {
            let d = fs.mkdir(NodeIndex::ROOT, "d", 0o755).expect("mkdir should succeed");
            let f = fs.create(d.idx, "f", 0o644).expect("create should succeed");
            fs.write(f.idx, 0, b"payload").expect("write should succeed");
        });
        let summary = check(dir.path(), CheckOptions::default()).expect("check should succeed");
        assert_eq!(summary.exit_code(), 0, "findings: {:?}", summary.findings);
        assert!(!summary.unclean_shutdown);
    }

    #[test]
    fn checker_refuses_a_mounted_filesystem() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let fs = RazorFs::mount(Config::with_data_dir(dir.path())).expect("mount should succeed");
        assert!(check(dir.path(), CheckOptions::default()).is_err());
        fs.unmount().expect("unmount should succeed");
    }

    #[test]
    fn dangling_child_link_is_found_and_repaired() {
        let dir = mounted_then_unmounted(|fs| {
            fs.create(NodeIndex::ROOT, "a", 0o644).expect("create should succeed");
        });
        // Corrupt: point the root's child entry at a free slot.
        {
            let arena = NodeArena::open(&DataDir::new(dir.path()).arena())
                .expect("arena open should succeed");
            // SAFETY: nothing else has the arena open.
            unsafe {
                let root = arena.node_mut(NodeIndex::ROOT);
                root.children[0] = 40;
            }
            arena.flush().expect("flush should succeed");
        }

        let summary = check(dir.path(), CheckOptions::default()).expect("check should succeed");
        assert_eq!(summary.exit_code(), 1);

        let summary = check(dir.path(), CheckOptions { repair: true, verbose: false })
            .expect("check should succeed");
        assert!(summary.repaired >= 1);

        // After repair the filesystem checks out clean apart from the
        // orphaned node, which was reconnected or dropped.
        let summary = check(dir.path(), CheckOptions::default()).expect("check should succeed");
        assert!(summary.exit_code() <= 1);
    }

    #[test]
    fn corrupt_compressed_payload_is_flagged() {
        let mut payload_path = None;
        let dir = mounted_then_unmounted(|fs| {
            let f = fs.create(NodeIndex::ROOT, "big", 0o644).expect("create should succeed");
            fs.write(f.idx, 0, &vec![b'A'; 4096]).expect("write should succeed");
            payload_path = Some(format!("file_{}", f.inode));
        });
        let payload = dir.path().join(payload_path.expect("payload should exist"));
        let mut image = std::fs::read(&payload).expect("read should succeed");
        let at = codec::DATA_HEADER_LEN + 8;
        image[at] ^= 0xff;
        std::fs::write(&payload, &image).expect("write should succeed");

        let summary = check(dir.path(), CheckOptions::default()).expect("check should succeed");
        assert_eq!(summary.exit_code(), 1);
        assert!(summary.findings.iter().any(|finding| finding.phase == 4));

        // Repair truncates the payload with operator consent.
        let summary = check(dir.path(), CheckOptions { repair: true, verbose: false })
            .expect("check should succeed");
        assert!(summary.repaired >= 1);
        assert!(!payload.exists());
    }

    #[test]
    fn unclean_shutdown_is_flagged() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        {
            let fs =
                RazorFs::mount(Config::with_data_dir(dir.path())).expect("mount should succeed");
            fs.create(NodeIndex::ROOT, "f", 0o644).expect("create should succeed");
            // Simulated crash: drop every reference without unmounting is
            // not possible through the public API (Drop unmounts), so clear
            // the flag the way a kill would leave it.
            fs.unmount().expect("unmount should succeed");
        }
        let wal = Wal::open(&DataDir::new(dir.path()).wal(), WalSync::Off)
            .expect("wal open should succeed");
        wal.set_clean_flag(false).expect("flag write should succeed");
        drop(wal);

        let summary = check(dir.path(), CheckOptions::default()).expect("check should succeed");
        assert!(summary.unclean_shutdown);
    }
}
