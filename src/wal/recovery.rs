//! Crash recovery: Analysis, Redo, Undo.
//!
//! Runs single-threaded at mount, before any lock is handed out, so every
//! arena access here has exclusive ownership. Redo is idempotent against
//! whatever subset of the mutations reached the mapped files; Undo applies
//! compensating actions for transactions that never committed and stamps
//! each with an ABORT record.

use std::collections::HashMap;

use fnv::FnvHashMap;

use crate::data::DataStore;
use crate::error::{FsError, Result};
use crate::storage::node::{name_order, Node, NodeIndex, BRANCH_FACTOR};
use crate::storage::{NodeArena, StringTable};
use crate::wal::record::{Blob, Payload, Record};
use crate::wal::writer::Wal;
use crate::xattr::XattrStore;

#[derive(Debug, Default)]
pub struct RecoveryStats {
    pub records_scanned: usize,
    pub committed_txns: usize,
    pub undone_txns: usize,
    pub torn_tail: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnStatus {
    Live,
    Committed,
    Aborted,
}

/// Replays the journal against the mapped state. The caller checkpoints
/// (flush + truncate + clean flag) after a successful return.
pub fn recover(
    wal: &Wal,
    arena: &NodeArena,
    strings: &StringTable,
    data: &DataStore,
    xattrs: &XattrStore,
) -> Result<RecoveryStats> {
    // Analysis: one forward scan builds the transaction table.
    let scan = wal.scan()?;
    if let Some((lsn, reason)) = scan.undecodable {
        return Err(FsError::Corrupted(format!(
            "journal record at lsn {lsn} has a valid checksum but cannot be decoded: {reason}"
        )));
    }
    if scan.torn_tail {
        log::warn!("journal has a torn trailing record; discarding it");
    }

    let mut txns: HashMap<u64, TxnStatus> = HashMap::new();
    for record in &scan.records {
        match record.payload {
            Payload::Begin => {
                txns.insert(record.txn_id, TxnStatus::Live);
            }
            Payload::Commit => {
                txns.insert(record.txn_id, TxnStatus::Committed);
            }
            Payload::Abort => {
                txns.insert(record.txn_id, TxnStatus::Aborted);
            }
            _ => {
                txns.entry(record.txn_id).or_insert(TxnStatus::Live);
            }
        }
    }
    let committed = txns
        .values()
        .filter(|status| **status == TxnStatus::Committed)
        .count();

    // Redo: every committed record, in LSN order.
    for record in &scan.records {
        if txns.get(&record.txn_id) == Some(&TxnStatus::Committed) {
            apply_redo(wal, arena, strings, data, xattrs, record)?;
        }
    }

    // Undo: live transactions, newest record first, then an ABORT marker.
    let mut undone = 0usize;
    let live: Vec<u64> = txns
        .iter()
        .filter(|(_, status)| **status == TxnStatus::Live)
        .map(|(txn_id, _)| *txn_id)
        .collect();
    for txn_id in live {
        for record in scan
            .records
            .iter()
            .rev()
            .filter(|record| record.txn_id == txn_id)
        {
            apply_undo(wal, arena, strings, data, xattrs, record)?;
        }
        wal.append_raw_synced(txn_id, vec![Payload::Abort])?;
        undone += 1;
        log::debug!("undid transaction {txn_id}");
    }

    // SAFETY: recovery holds exclusive access; see module docs.
    unsafe {
        arena.rebuild_freelist();
    }
    recompute_links(arena);

    log::info!(
        "recovery complete: {} records, {committed} committed, {undone} undone",
        scan.records.len()
    );
    Ok(RecoveryStats {
        records_scanned: scan.records.len(),
        committed_txns: committed,
        undone_txns: undone,
        torn_tail: scan.torn_tail,
    })
}

// ---------------------------------------------------------------------------
// Structural helpers (exclusive-access, tolerant)
// ---------------------------------------------------------------------------

/// Mutable slot access for the single-threaded recovery passes.
#[allow(clippy::mut_from_ref)]
fn slot_mut(arena: &NodeArena, idx: NodeIndex) -> &mut Node {
    // SAFETY: recovery holds exclusive access; see module docs.
    unsafe { arena.node_mut(idx) }
}

fn check_idx(arena: &NodeArena, raw: u16) -> Result<NodeIndex> {
    let idx = NodeIndex::new(raw);
    arena.try_node(idx)?;
    Ok(idx)
}

/// Removes `child` from `parent`'s children if linked. Returns whether it
/// was present.
fn unlink_child(arena: &NodeArena, parent: NodeIndex, child: NodeIndex) -> bool {
    let node = slot_mut(arena, parent);
    match node.child_position(child) {
        Some(pos) => {
            node.remove_child_at(pos);
            true
        }
        None => false,
    }
}

/// Links `child` into `parent` at its sorted position, if absent.
fn link_child_sorted(
    arena: &NodeArena,
    strings: &StringTable,
    parent: NodeIndex,
    child: NodeIndex,
) -> Result<()> {
    if arena.node(parent).child_position(child).is_some() {
        return Ok(());
    }
    if arena.node(parent).num_children as usize >= BRANCH_FACTOR {
        return Err(FsError::Corrupted(format!(
            "redo would overflow directory {parent}"
        )));
    }
    let name = strings.name_at(arena.node(child).name_offset)?.to_vec();
    let mut pos = 0usize;
    for (i, existing) in arena.node(parent).child_indices().enumerate() {
        let existing_name = strings.name_at(arena.node(existing).name_offset)?;
        if name_order(&name, existing_name) == std::cmp::Ordering::Greater {
            pos = i + 1;
        } else {
            break;
        }
    }
    slot_mut(arena, parent).insert_child_at(pos, child);
    Ok(())
}

/// Zeroes a slot; the freelist is rebuilt wholesale at the end of recovery.
fn clear_slot(arena: &NodeArena, idx: NodeIndex) {
    *slot_mut(arena, idx) = Node::zeroed();
}

/// True if any live node carries `inode`.
fn inode_live(arena: &NodeArena, inode: u32) -> bool {
    (1..arena.capacity() as u16)
        .map(NodeIndex::new)
        .any(|idx| arena.node(idx).inode == inode)
}

/// Drops the payload and attributes of an inode no node references.
fn reap_inode(arena: &NodeArena, data: &DataStore, xattrs: &XattrStore, inode: u32) -> Result<()> {
    if !inode_live(arena, inode) {
        data.remove(inode)?;
        xattrs.remove_inode(inode);
    }
    Ok(())
}

/// Normalizes hardlink groups after replay: `nlink` is recomputed from how
/// many live nodes share each inode, and the freshest link record's size
/// and mtime are propagated to its siblings (replay only patches the node
/// the write went through).
fn recompute_links(arena: &NodeArena) {
    let mut groups: FnvHashMap<u32, (u16, u64, u32)> = FnvHashMap::default();
    for slot in 1..arena.capacity() as u16 {
        let node = *arena.node(NodeIndex::new(slot));
        if node.is_file() {
            let entry = groups.entry(node.inode).or_insert((0, node.size, node.mtime));
            entry.0 += 1;
            if node.mtime > entry.2 || (node.mtime == entry.2 && node.size > entry.1) {
                entry.1 = node.size;
                entry.2 = node.mtime;
            }
        }
    }
    for slot in 1..arena.capacity() as u16 {
        let idx = NodeIndex::new(slot);
        let (is_file, inode) = {
            let node = arena.node(idx);
            (node.is_file(), node.inode)
        };
        if is_file {
            let (nlink, size, mtime) = groups[&inode];
            let node = slot_mut(arena, idx);
            node.nlink = nlink;
            node.size = size;
            node.mtime = mtime;
        }
    }
}

fn blob_bytes(wal: &Wal, lsn: u64, blob: &Blob) -> Result<Vec<u8>> {
    match blob {
        Blob::Inline(bytes) => Ok(bytes.clone()),
        Blob::Spilled { len } => {
            let bytes = wal.read_blob(lsn)?;
            if bytes.len() as u64 != *len {
                return Err(FsError::Corrupted(format!(
                    "spilled blob for lsn {lsn} is {} bytes, record says {len}",
                    bytes.len()
                )));
            }
            Ok(bytes)
        }
    }
}

fn prior_blob_bytes(wal: &Wal, lsn: u64, blob: &Blob) -> Result<Vec<u8>> {
    match blob {
        Blob::Inline(bytes) => Ok(bytes.clone()),
        Blob::Spilled { len } => {
            let bytes = wal.read_prior_blob(lsn)?;
            if bytes.len() as u64 != *len {
                return Err(FsError::Corrupted(format!(
                    "spilled before-image for lsn {lsn} is {} bytes, record says {len}",
                    bytes.len()
                )));
            }
            Ok(bytes)
        }
    }
}

// ---------------------------------------------------------------------------
// Redo
// ---------------------------------------------------------------------------

fn apply_redo(
    wal: &Wal,
    arena: &NodeArena,
    strings: &StringTable,
    data: &DataStore,
    xattrs: &XattrStore,
    record: &Record,
) -> Result<()> {
    match &record.payload {
        Payload::Begin | Payload::Commit | Payload::Abort | Payload::Checkpoint => Ok(()),

        Payload::Insert { parent, new_idx, inode, name_offset, mode, mtime } => {
            let parent = check_idx(arena, *parent)?;
            let idx = check_idx(arena, *new_idx)?;
            if arena.node(idx).inode != *inode {
                let node = slot_mut(arena, idx);
                *node = Node::zeroed();
                node.inode = *inode;
                node.parent_idx = parent.raw();
                node.name_offset = *name_offset;
                node.mode = *mode;
                node.mtime = *mtime;
                node.nlink = 1;
            }
            link_child_sorted(arena, strings, parent, idx)
        }

        Payload::Delete { parent, child, .. } => {
            let parent = check_idx(arena, *parent)?;
            let child = check_idx(arena, *child)?;
            unlink_child(arena, parent, child);
            let inode = arena.node(child).inode;
            if inode != 0 {
                clear_slot(arena, child);
                reap_inode(arena, data, xattrs, inode)?;
            }
            Ok(())
        }

        Payload::UpdateMeta { idx, mode, size, mtime, .. } => {
            let idx = check_idx(arena, *idx)?;
            let node = slot_mut(arena, idx);
            if !node.is_free() {
                node.mode = *mode;
                node.size = *size;
                node.mtime = *mtime;
            }
            Ok(())
        }

        Payload::WriteData { inode, offset, blob, .. } => {
            let bytes = blob_bytes(wal, record.lsn, blob)?;
            let mut content = data.load_all(*inode)?;
            let end = *offset as usize + bytes.len();
            if content.len() < end {
                content.resize(end, 0);
            }
            content[*offset as usize..end].copy_from_slice(&bytes);
            data.store(*inode, &content)
        }

        Payload::Rename {
            src_parent,
            dst_parent,
            child,
            src_name_offset,
            dst_name_offset,
            exchange_with,
            replaced,
            ..
        } => {
            let src_parent = check_idx(arena, *src_parent)?;
            let dst_parent = check_idx(arena, *dst_parent)?;
            let child = check_idx(arena, *child)?;
            if let Some(other) = exchange_with {
                let other = check_idx(arena, *other)?;
                unlink_child(arena, src_parent, child);
                unlink_child(arena, dst_parent, other);
                {
                    let node = slot_mut(arena, child);
                    node.parent_idx = dst_parent.raw();
                    node.name_offset = *dst_name_offset;
                }
                {
                    let node = slot_mut(arena, other);
                    node.parent_idx = src_parent.raw();
                    node.name_offset = *src_name_offset;
                }
                link_child_sorted(arena, strings, dst_parent, child)?;
                link_child_sorted(arena, strings, src_parent, other)?;
                return Ok(());
            }
            if let Some(replaced) = replaced {
                let replaced = check_idx(arena, *replaced)?;
                unlink_child(arena, dst_parent, replaced);
                let inode = arena.node(replaced).inode;
                if inode != 0 {
                    clear_slot(arena, replaced);
                    reap_inode(arena, data, xattrs, inode)?;
                }
            }
            unlink_child(arena, src_parent, child);
            {
                let node = slot_mut(arena, child);
                node.parent_idx = dst_parent.raw();
                node.name_offset = *dst_name_offset;
            }
            link_child_sorted(arena, strings, dst_parent, child)
        }

        Payload::XattrSet { inode, name, value, .. } => {
            xattrs.set(*inode, name, value.clone());
            Ok(())
        }

        Payload::XattrDel { inode, name, .. } => {
            xattrs.remove(*inode, name);
            Ok(())
        }

        Payload::Hardlink { src_idx, new_idx, dst_parent, inode, name_offset } => {
            let src = check_idx(arena, *src_idx)?;
            let idx = check_idx(arena, *new_idx)?;
            let parent = check_idx(arena, *dst_parent)?;
            if arena.node(idx).inode != *inode {
                let src_node = *arena.node(src);
                if src_node.inode != *inode {
                    return Err(FsError::Corrupted(format!(
                        "hardlink redo: node {src} no longer carries inode {inode}"
                    )));
                }
                let node = slot_mut(arena, idx);
                *node = Node::zeroed();
                node.inode = *inode;
                node.parent_idx = parent.raw();
                node.name_offset = *name_offset;
                node.mode = src_node.mode;
                node.size = src_node.size;
                node.mtime = src_node.mtime;
                node.nlink = 1; // recomputed after the passes
            }
            link_child_sorted(arena, strings, parent, idx)
        }
    }
}

// ---------------------------------------------------------------------------
// Undo
// ---------------------------------------------------------------------------

fn apply_undo(
    wal: &Wal,
    arena: &NodeArena,
    strings: &StringTable,
    data: &DataStore,
    xattrs: &XattrStore,
    record: &Record,
) -> Result<()> {
    // Uncommitted slots keep their contents (freeing happens only after
    // commit), so compensation restores links rather than rebuilding nodes.
    match &record.payload {
        Payload::Begin | Payload::Commit | Payload::Abort | Payload::Checkpoint => Ok(()),

        Payload::Insert { parent, new_idx, .. } => {
            let parent = check_idx(arena, *parent)?;
            let idx = check_idx(arena, *new_idx)?;
            unlink_child(arena, parent, idx);
            clear_slot(arena, idx);
            Ok(())
        }

        Payload::Delete { parent, child, prior_position } => {
            let parent = check_idx(arena, *parent)?;
            let child = check_idx(arena, *child)?;
            let node = slot_mut(arena, parent);
            if node.child_position(child).is_none() {
                let pos = (*prior_position as usize).min(node.num_children as usize);
                if (node.num_children as usize) < BRANCH_FACTOR {
                    node.insert_child_at(pos, child);
                }
            }
            Ok(())
        }

        Payload::UpdateMeta { idx, prior_mode, prior_size, prior_mtime, .. } => {
            let idx = check_idx(arena, *idx)?;
            let node = slot_mut(arena, idx);
            if !node.is_free() {
                node.mode = *prior_mode;
                node.size = *prior_size;
                node.mtime = *prior_mtime;
            }
            Ok(())
        }

        Payload::WriteData { inode, offset, prior, prior_size, .. } => {
            let before = prior_blob_bytes(wal, record.lsn, prior)?;
            let mut content = data.load_all(*inode)?;
            // A write past the prior EOF has an empty before-image, so the
            // clamped end can fall below the offset; the start clamps too.
            let end = (*offset as usize + before.len()).min(*prior_size as usize);
            if content.len() < end {
                content.resize(end, 0);
            }
            let start = (*offset as usize).min(end);
            let take = end - start;
            content[start..end].copy_from_slice(&before[..take]);
            content.truncate(*prior_size as usize);
            if content.is_empty() {
                data.remove(*inode)?;
            } else {
                data.store(*inode, &content)?;
            }
            Ok(())
        }

        Payload::Rename {
            src_parent,
            dst_parent,
            child,
            src_name_offset,
            dst_name_offset,
            prior_position: _,
            exchange_with,
            replaced,
        } => {
            let src_parent = check_idx(arena, *src_parent)?;
            let dst_parent = check_idx(arena, *dst_parent)?;
            let child = check_idx(arena, *child)?;
            if let Some(other) = exchange_with {
                let other = check_idx(arena, *other)?;
                unlink_child(arena, dst_parent, child);
                unlink_child(arena, src_parent, other);
                {
                    let node = slot_mut(arena, child);
                    node.parent_idx = src_parent.raw();
                    node.name_offset = *src_name_offset;
                }
                {
                    let node = slot_mut(arena, other);
                    node.parent_idx = dst_parent.raw();
                    node.name_offset = *dst_name_offset;
                }
                link_child_sorted(arena, strings, src_parent, child)?;
                link_child_sorted(arena, strings, dst_parent, other)?;
                return Ok(());
            }
            unlink_child(arena, dst_parent, child);
            {
                let node = slot_mut(arena, child);
                node.parent_idx = src_parent.raw();
                node.name_offset = *src_name_offset;
            }
            link_child_sorted(arena, strings, src_parent, child)?;
            if let Some(replaced) = replaced {
                let replaced = check_idx(arena, *replaced)?;
                {
                    let node = slot_mut(arena, replaced);
                    node.parent_idx = dst_parent.raw();
                }
                link_child_sorted(arena, strings, dst_parent, replaced)?;
            }
            Ok(())
        }

        Payload::XattrSet { inode, name, prior, .. } | Payload::XattrDel { inode, name, prior } => {
            match prior {
                Some(value) => {
                    xattrs.set(*inode, name, value.clone());
                }
                None => {
                    xattrs.remove(*inode, name);
                }
            }
            Ok(())
        }

        Payload::Hardlink { new_idx, dst_parent, .. } => {
            let parent = check_idx(arena, *dst_parent)?;
            let idx = check_idx(arena, *new_idx)?;
            unlink_child(arena, parent, idx);
            clear_slot(arena, idx);
            Ok(())
        }
    }
}
