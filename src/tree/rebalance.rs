//! Breadth-first arena relayout.
//!
//! Mutation-heavy workloads scatter related nodes across the arena; every
//! N committed mutations a background pass rewrites the live nodes in BFS
//! order so siblings and near ancestors share cache lines again. The pass
//! runs under the exclusive growth lock, so readers only stall for the
//! duration of the in-place rewrite.

use crate::error::{FsError, Result};
use crate::storage::node::{Node, NodeIndex};
use crate::tree::Tree;

#[derive(Debug, Clone)]
pub struct RelayoutStats {
    pub live: usize,
    pub moved: usize,
    /// Old raw index to new raw index; 0 marks a slot that held no live
    /// node. Callers holding index-keyed side state remap through this.
    pub perm: Vec<u16>,
}

/// Rewrites the arena in BFS order and fixes every parent/child index.
///
/// The caller must hold the tree growth lock exclusively; nothing else may
/// touch the arena while the permutation is applied.
pub fn relayout(tree: &Tree) -> Result<RelayoutStats> {
    let capacity = tree.arena.capacity() as usize;
    let mut perm = vec![0u16; capacity];
    let mut order: Vec<NodeIndex> = Vec::new();

    // BFS from the root; child order inside each directory is preserved,
    // so the sorted-children invariant survives untouched.
    let mut queue = std::collections::VecDeque::from([NodeIndex::ROOT]);
    perm[NodeIndex::ROOT.slot()] = NodeIndex::ROOT.raw();
    while let Some(idx) = queue.pop_front() {
        order.push(idx);
        let node = *tree.arena.node(idx);
        for child in node.child_indices() {
            if perm[child.slot()] != 0 {
                return Err(FsError::Corrupted(format!(
                    "node {child} linked from more than one directory"
                )));
            }
            perm[child.slot()] = (order.len() + queue.len() + 1) as u16;
            queue.push_back(child);
        }
    }

    if order.len() != tree.arena.live_count() as usize {
        return Err(FsError::Corrupted(format!(
            "relayout reached {} nodes, arena holds {} live",
            order.len(),
            tree.arena.live_count()
        )));
    }

    // Final BFS positions are simply 1..=live in visit order.
    for (visit, idx) in order.iter().enumerate() {
        perm[idx.slot()] = (visit + 1) as u16;
    }

    let mut scratch: Vec<Node> = order.iter().map(|&idx| *tree.arena.node(idx)).collect();
    for node in &mut scratch {
        node.parent_idx = perm[node.parent_idx as usize];
        for raw in node.children.iter_mut() {
            *raw = perm[*raw as usize];
        }
    }

    let moved = order
        .iter()
        .enumerate()
        .filter(|(visit, idx)| idx.slot() != visit + 1)
        .count();

    // SAFETY: exclusive growth lock per the contract above.
    unsafe {
        for (visit, node) in scratch.iter().enumerate() {
            tree.arena.write_node(NodeIndex::new((visit + 1) as u16), *node);
        }
        for slot in (order.len() + 1)..capacity {
            tree.arena.write_node(NodeIndex::new(slot as u16), Node::zeroed());
        }
        tree.arena.rebuild_freelist();
    }

    log::debug!("relayout: {} live nodes, {moved} moved", order.len());
    Ok(RelayoutStats {
        live: order.len(),
        moved,
        perm,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalSync;
    use crate::storage::node::{MODE_DIR, MODE_FILE};
    use crate::storage::{NodeArena, StringTable};
    use crate::wal::Wal;

    fn scratch_tree() -> (tempfile::TempDir, Tree, Wal) {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let arena = NodeArena::create(&dir.path().join("nodes.dat"), 64)
            .expect("arena creation should succeed");
        let strings = StringTable::create(&dir.path().join("strings.dat"), 4096, 1 << 20)
            .expect("table creation should succeed");
        let wal = Wal::create(&dir.path().join("wal.log"), WalSync::Always)
            .expect("wal creation should succeed");
        let tree = Tree::new(arena, strings, 255);
        tree.init_root(0).expect("root init should succeed");
        (dir, tree, wal)
    }

    #[test]
    fn relayout_preserves_paths() {
        let (_dir, tree, wal) = scratch_tree();
        let mut txn = 0u64;
        let mut inode = 1u32;
        let mut mk = |parent, name: &str, mode| {
            txn += 1;
            inode += 1;
            tree.insert(&wal, txn, parent, name.as_bytes(), mode, inode, 0)
                .expect("insert should succeed")
        };
        let a = mk(NodeIndex::ROOT, "a", MODE_DIR | 0o755);
        let b = mk(a, "b", MODE_DIR | 0o755);
        mk(b, "deep.txt", MODE_FILE | 0o644);
        mk(NodeIndex::ROOT, "top.txt", MODE_FILE | 0o644);

        // Punch a hole so the layout is non-trivial.
        let victim = mk(NodeIndex::ROOT, "victim", MODE_FILE | 0o644);
        txn += 1;
        tree.delete(&wal, txn, victim).expect("delete should succeed");

        let stats = {
            let _growth = tree.growth.write();
            relayout(&tree).expect("relayout should succeed")
        };
        assert_eq!(stats.live, 5);

        // Every path still resolves, and the listing is still sorted.
        tree.lookup("/a/b/deep.txt").expect("lookup should succeed");
        tree.lookup("/top.txt").expect("lookup should succeed");
        let entries = tree.readdir(NodeIndex::ROOT).expect("readdir should succeed");
        let names: Vec<&str> = entries.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, vec!["a", "top.txt"]);
    }

    #[test]
    fn relayout_is_breadth_first() {
        let (_dir, tree, wal) = scratch_tree();
        let mut txn = 0u64;
        let mut inode = 1u32;
        let mut mk = |parent, name: &str, mode| {
            txn += 1;
            inode += 1;
            tree.insert(&wal, txn, parent, name.as_bytes(), mode, inode, 0)
                .expect("insert should succeed")
        };
        let a = mk(NodeIndex::ROOT, "a", MODE_DIR | 0o755);
        mk(a, "leaf", MODE_FILE | 0o644);
        mk(NodeIndex::ROOT, "b", MODE_FILE | 0o644);

        {
            let _growth = tree.growth.write();
            relayout(&tree).expect("relayout should succeed");
        }

        // Root's children occupy the slots right after the root; the
        // grandchild comes after them.
        let a_new = tree.lookup("/a").expect("lookup should succeed");
        let b_new = tree.lookup("/b").expect("lookup should succeed");
        let leaf_new = tree.lookup("/a/leaf").expect("lookup should succeed");
        assert!(a_new.raw() <= 3 && b_new.raw() <= 3);
        assert_eq!(leaf_new.raw(), 4);
    }

    #[test]
    fn relayout_reuses_freed_slots_for_new_inserts() {
        let (_dir, tree, wal) = scratch_tree();
        let mut txn = 0u64;
        for i in 0..10u32 {
            txn += 1;
            tree.insert(
                &wal,
                txn,
                NodeIndex::ROOT,
                format!("f{i}").as_bytes(),
                MODE_FILE | 0o644,
                i + 2,
                0,
            )
            .expect("insert should succeed");
        }
        {
            let _growth = tree.growth.write();
            relayout(&tree).expect("relayout should succeed");
        }
        // The next allocation lands just past the compacted prefix.
        txn += 1;
        let fresh = tree
            .insert(&wal, txn, NodeIndex::ROOT, b"fresh", MODE_FILE | 0o644, 99, 0)
            .expect("insert should succeed");
        assert_eq!(fresh.raw(), 12);
    }
}
