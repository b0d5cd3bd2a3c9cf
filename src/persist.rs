//! Persistent layout of the data directory and the mount lock.
//!
//! One directory holds everything: `nodes.dat` (arena), `strings.dat`
//! (string table), `wal.log` (journal), `xattrs.dat` (attribute snapshot)
//! and one `file_<inode>` per payload-carrying inode. A lock file taken
//! with `O_EXCL` prevents double mounts; it is removed on unmount, and a
//! leftover one after a crash is removed by the operator (no PID probing).

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{FsError, Result};

pub const ARENA_FILE: &str = "nodes.dat";
pub const STRINGS_FILE: &str = "strings.dat";
pub const WAL_FILE: &str = "wal.log";
pub const XATTRS_FILE: &str = "xattrs.dat";
pub const LOCK_FILE: &str = ".razorfs.lock";

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: &Path) -> Self {
        Self { root: root.to_path_buf() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn arena(&self) -> PathBuf {
        self.root.join(ARENA_FILE)
    }

    pub fn strings(&self) -> PathBuf {
        self.root.join(STRINGS_FILE)
    }

    pub fn wal(&self) -> PathBuf {
        self.root.join(WAL_FILE)
    }

    pub fn xattrs(&self) -> PathBuf {
        self.root.join(XATTRS_FILE)
    }

    pub fn lock(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// True once a filesystem has been formatted here.
    pub fn is_formatted(&self) -> bool {
        self.arena().exists()
    }

    pub fn ensure_exists(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }
}

/// Exclusive mount guard. Dropping it releases the lock.
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn acquire(dir: &DataDir) -> Result<Self> {
        let path = dir.lock();
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(FsError::InvalidArgument(format!(
                    "{} is locked by another mount (remove {} if that mount is gone)",
                    dir.root().display(),
                    path.display()
                )))
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            log::warn!("could not remove lock file {}: {err}", self.path.display());
        }
    }
}
