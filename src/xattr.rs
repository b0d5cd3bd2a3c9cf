//! Extended attribute side map.
//!
//! Attributes live outside the 64-byte node record, keyed by inode with
//! namespace-qualified names (`user.`, `trusted.`, `security.`,
//! `system.`). Mutations are journaled by the caller; this module holds the
//! in-memory map plus its checkpoint snapshot (postcard, like the rest of
//! the persisted auxiliary state).

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;

use fnv::FnvHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{FsError, Result};

pub const XATTR_NAMESPACES: [&str; 4] = ["user", "trusted", "security", "system"];

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    entries: FnvHashMap<u32, BTreeMap<String, Vec<u8>>>,
}

#[derive(Default)]
pub struct XattrStore {
    entries: Mutex<FnvHashMap<u32, BTreeMap<String, Vec<u8>>>>,
}

/// Checks the `namespace.name` shape and returns the full name.
pub fn validate_name(name: &str) -> Result<()> {
    let Some((namespace, rest)) = name.split_once('.') else {
        return Err(FsError::InvalidArgument(format!(
            "xattr name {name:?} has no namespace"
        )));
    };
    if rest.is_empty() {
        return Err(FsError::InvalidArgument(format!("xattr name {name:?} is empty")));
    }
    if !XATTR_NAMESPACES.contains(&namespace) {
        return Err(FsError::InvalidArgument(format!(
            "unknown xattr namespace {namespace:?}"
        )));
    }
    Ok(())
}

impl XattrStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the attribute and returns the prior value, if any.
    pub fn set(&self, inode: u32, name: &str, value: Vec<u8>) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .entry(inode)
            .or_default()
            .insert(name.to_string(), value)
    }

    pub fn get(&self, inode: u32, name: &str) -> Option<Vec<u8>> {
        self.entries.lock().get(&inode)?.get(name).cloned()
    }

    /// Removes the attribute, returning the prior value if it existed.
    pub fn remove(&self, inode: u32, name: &str) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock();
        let attrs = entries.get_mut(&inode)?;
        let prior = attrs.remove(name);
        if attrs.is_empty() {
            entries.remove(&inode);
        }
        prior
    }

    pub fn list(&self, inode: u32) -> Vec<String> {
        self.entries
            .lock()
            .get(&inode)
            .map(|attrs| attrs.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Drops every attribute of a destroyed inode.
    pub fn remove_inode(&self, inode: u32) {
        self.entries.lock().remove(&inode);
    }

    /// Writes the checkpoint snapshot (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            entries: self.entries.lock().clone(),
        };
        let bytes = postcard::to_stdvec(&snapshot)
            .map_err(|err| FsError::Corrupted(format!("xattr snapshot encode: {err}")))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Loads the checkpoint snapshot; a missing file is an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::new()),
            Err(err) => return Err(err.into()),
        };
        let snapshot: Snapshot = postcard::from_bytes(&bytes)
            .map_err(|err| FsError::Corrupted(format!("xattr snapshot decode: {err}")))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(FsError::Corrupted(format!(
                "xattr snapshot version {}, expected {SNAPSHOT_VERSION}",
                snapshot.version
            )));
        }
        Ok(Self {
            entries: Mutex::new(snapshot.entries),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_validation() {
        validate_name("user.color").expect("user namespace should validate");
        validate_name("security.selinux").expect("security namespace should validate");
        assert!(validate_name("bogus.key").is_err());
        assert!(validate_name("user.").is_err());
        assert!(validate_name("nodot").is_err());
    }

    #[test]
    fn set_get_remove_cycle() {
        let store = XattrStore::new();
        assert_eq!(store.set(1, "user.a", b"x".to_vec()), None);
        assert_eq!(store.set(1, "user.a", b"y".to_vec()), Some(b"x".to_vec()));
        assert_eq!(store.get(1, "user.a"), Some(b"y".to_vec()));
        assert_eq!(store.list(1), vec!["user.a".to_string()]);
        assert_eq!(store.remove(1, "user.a"), Some(b"y".to_vec()));
        assert_eq!(store.get(1, "user.a"), None);
        assert!(store.list(1).is_empty());
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let path = dir.path().join("xattrs.dat");
        let store = XattrStore::new();
        store.set(3, "user.tag", b"blue".to_vec());
        store.set(9, "system.posix_acl", vec![1, 2, 3]);
        store.save(&path).expect("save should succeed");

        let restored = XattrStore::load(&path).expect("load should succeed");
        assert_eq!(restored.get(3, "user.tag"), Some(b"blue".to_vec()));
        assert_eq!(restored.get(9, "system.posix_acl"), Some(vec![1, 2, 3]));
    }

    #[test]
    fn missing_snapshot_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let store = XattrStore::load(&dir.path().join("absent.dat")).expect("load should succeed");
        assert!(store.list(1).is_empty());
    }
}
