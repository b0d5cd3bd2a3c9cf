//! End-to-end scenarios through the mounted surface.

use razorfs::fs::{RazorFs, Vfs};
use razorfs::{Config, FsError, NodeIndex, RenameFlags};

fn mount(dir: &std::path::Path) -> std::sync::Arc<RazorFs> {
    RazorFs::mount(Config::with_data_dir(dir)).expect("mount should succeed")
}

#[test]
fn payload_above_threshold_is_stored_compressed() {
    let dir = tempfile::tempdir().expect("tempdir should succeed");
    let fs = mount(dir.path());

    let f = fs.create(NodeIndex::ROOT, "x", 0o644).expect("create should succeed");
    let body = vec![b'A'; 700];
    fs.write(f.idx, 0, &body).expect("write should succeed");

    let back = fs.read(f.idx, 0, 1024).expect("read should succeed");
    assert_eq!(back, body);

    let image = std::fs::read(dir.path().join(format!("file_{}", f.inode)))
        .expect("payload file should exist");
    assert_eq!(&image[..8], b"RZCOMP\0\0");
    assert!(image.len() < body.len(), "700 identical bytes should shrink");

    fs.unmount().expect("unmount should succeed");
}

#[test]
fn small_payload_stays_raw() {
    let dir = tempfile::tempdir().expect("tempdir should succeed");
    let fs = mount(dir.path());

    let f = fs.create(NodeIndex::ROOT, "tiny", 0o644).expect("create should succeed");
    fs.write(f.idx, 0, b"just a few bytes").expect("write should succeed");
    let image = std::fs::read(dir.path().join(format!("file_{}", f.inode)))
        .expect("payload file should exist");
    assert_eq!(image, b"just a few bytes");

    fs.unmount().expect("unmount should succeed");
}

#[test]
fn directory_accepts_sixteen_children_and_no_more() {
    let dir = tempfile::tempdir().expect("tempdir should succeed");
    let fs = mount(dir.path());

    let d = fs.mkdir(NodeIndex::ROOT, "d", 0o755).expect("mkdir should succeed");
    for i in 1..=16 {
        fs.create(d.idx, &format!("f{i}"), 0o644).expect("create should succeed");
    }
    assert!(matches!(
        fs.create(d.idx, "f17", 0o644),
        Err(FsError::NoSpace(_))
    ));
    assert_eq!(fs.readdir(d.idx).expect("readdir should succeed").len(), 16);

    fs.unmount().expect("unmount should succeed");
}

#[test]
fn rename_moves_visibility_atomically() {
    let dir = tempfile::tempdir().expect("tempdir should succeed");
    let fs = mount(dir.path());

    let a = fs.mkdir(NodeIndex::ROOT, "a", 0o755).expect("mkdir should succeed");
    let b = fs.mkdir(NodeIndex::ROOT, "b", 0o755).expect("mkdir should succeed");
    let x = fs.create(a.idx, "x", 0o644).expect("create should succeed");
    fs.write(x.idx, 0, b"moved").expect("write should succeed");

    fs.rename(a.idx, "x", b.idx, "x", RenameFlags::empty()).expect("rename should succeed");
    assert!(matches!(fs.lookup("/a/x"), Err(FsError::NotFound)));
    let moved = fs.lookup("/b/x").expect("lookup should succeed");
    assert_eq!(fs.read(moved.idx, 0, 16).expect("read should succeed"), b"moved");

    fs.unmount().expect("unmount should succeed");
}

#[test]
fn truncate_shrinks_and_extends_with_zeros() {
    let dir = tempfile::tempdir().expect("tempdir should succeed");
    let fs = mount(dir.path());

    let f = fs.create(NodeIndex::ROOT, "t", 0o644).expect("create should succeed");
    fs.write(f.idx, 0, b"0123456789").expect("write should succeed");

    fs.truncate(f.idx, 4).expect("truncate should succeed");
    assert_eq!(fs.getattr(f.idx).expect("getattr should succeed").size, 4);
    assert_eq!(fs.read(f.idx, 0, 16).expect("read should succeed"), b"0123");

    fs.truncate(f.idx, 8).expect("truncate should succeed");
    assert_eq!(fs.read(f.idx, 0, 16).expect("read should succeed"), b"0123\0\0\0\0");

    fs.unmount().expect("unmount should succeed");
}

#[test]
fn tree_persists_across_clean_remounts() {
    let dir = tempfile::tempdir().expect("tempdir should succeed");

    {
        let fs = mount(dir.path());
        let a = fs.mkdir(NodeIndex::ROOT, "persisted", 0o755).expect("mkdir should succeed");
        let f = fs.create(a.idx, "data.bin", 0o644).expect("create should succeed");
        fs.write(f.idx, 0, b"across remounts").expect("write should succeed");
        fs.unmount().expect("unmount should succeed");
    }

    let fs = mount(dir.path());
    let f = fs.lookup("/persisted/data.bin").expect("lookup should succeed");
    assert_eq!(
        fs.read(f.idx, 0, 32).expect("read should succeed"),
        b"across remounts"
    );
    fs.unmount().expect("unmount should succeed");
}

#[test]
fn heavy_mutation_churn_triggers_relayout_and_keeps_paths() {
    let dir = tempfile::tempdir().expect("tempdir should succeed");
    let mut config = Config::with_data_dir(dir.path());
    config.rebalance_interval_ops = 50;
    let fs = RazorFs::mount(config).expect("mount should succeed");

    // Interleave creates and unlinks so slots scatter, then wait long
    // enough for the background pass to run at least once.
    let top = fs.mkdir(NodeIndex::ROOT, "churn", 0o755).expect("mkdir should succeed");
    for round in 0..10 {
        let d = fs
            .mkdir(top.idx, &format!("round{round}"), 0o755)
            .expect("mkdir should succeed");
        for i in 0..8 {
            fs.create(d.idx, &format!("f{i}"), 0o644).expect("create should succeed");
        }
        for i in 0..8 {
            if (i + round) % 2 == 0 {
                fs.unlink(d.idx, &format!("f{i}")).expect("unlink should succeed");
            }
        }
    }
    std::thread::sleep(std::time::Duration::from_millis(600));

    for round in 0..10 {
        for i in 0..8 {
            let path = format!("/churn/round{round}/f{i}");
            let found = fs.lookup(&path);
            if (i + round) % 2 == 0 {
                assert!(matches!(found, Err(FsError::NotFound)), "{path} should be gone");
            } else {
                found.unwrap_or_else(|err| panic!("{path} should resolve: {err}"));
            }
        }
    }

    fs.unmount().expect("unmount should succeed");

    // Everything still resolves after a remount of the relaid-out arena.
    let fs = mount(dir.path());
    fs.lookup("/churn/round0/f1").expect("lookup should succeed");
    fs.unmount().expect("unmount should succeed");
}

#[test]
fn hardlinked_content_is_shared_and_sized_consistently() {
    let dir = tempfile::tempdir().expect("tempdir should succeed");
    let fs = mount(dir.path());

    let f = fs.create(NodeIndex::ROOT, "orig", 0o644).expect("create should succeed");
    let alias = fs.link(f.idx, NodeIndex::ROOT, "alias").expect("link should succeed");
    fs.write(f.idx, 0, b"written through orig").expect("write should succeed");

    let alias_attr = fs.getattr(alias.idx).expect("getattr should succeed");
    assert_eq!(alias_attr.size, 20);
    assert_eq!(
        fs.read(alias.idx, 0, 32).expect("read should succeed"),
        b"written through orig"
    );

    fs.unmount().expect("unmount should succeed");
}

#[test]
fn wide_directories_are_replaced_by_nesting() {
    let dir = tempfile::tempdir().expect("tempdir should succeed");
    let fs = mount(dir.path());

    // The documented pattern for more than sixteen entries: intermediate
    // directories.
    let top = fs.mkdir(NodeIndex::ROOT, "many", 0o755).expect("mkdir should succeed");
    let mut created = 0;
    for bucket in 0..4 {
        let b = fs
            .mkdir(top.idx, &format!("b{bucket}"), 0o755)
            .expect("mkdir should succeed");
        for i in 0..10 {
            fs.create(b.idx, &format!("f{i}"), 0o644).expect("create should succeed");
            created += 1;
        }
    }
    assert_eq!(created, 40);
    fs.lookup("/many/b3/f9").expect("lookup should succeed");

    fs.unmount().expect("unmount should succeed");
}
