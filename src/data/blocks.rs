//! Per-inode data files.
//!
//! Each inode with payload owns one `file_<inode>` under the data
//! directory, holding either raw bytes or the RZCOMP container. Reads map
//! the file and decode through the codec; writes re-encode the whole
//! payload and land atomically (temp file + rename). The node's `size`
//! field stays authoritative: short on-disk payloads read back zero-filled.
//!
//! Concurrency is delegated to the tree: a writer holds the owning node's
//! write lock, so the store itself carries no locks.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::data::codec;
use crate::error::Result;

pub struct DataStore {
    dir: PathBuf,
    compression: bool,
    compression_min_bytes: u64,
}

impl DataStore {
    pub fn new(dir: &Path, compression: bool, compression_min_bytes: u64) -> Self {
        Self {
            dir: dir.to_path_buf(),
            compression,
            compression_min_bytes,
        }
    }

    pub fn path_for(&self, inode: u32) -> PathBuf {
        self.dir.join(format!("file_{inode}"))
    }

    /// Full decoded content at its stored length, no clamping. Recovery
    /// uses this so an idempotent re-apply never truncates a newer image.
    pub fn load_all(&self, inode: u32) -> Result<Vec<u8>> {
        match File::open(self.path_for(inode)) {
            Ok(file) => {
                let len = file.metadata()?.len();
                if len == 0 {
                    return Ok(Vec::new());
                }
                // SAFETY: read-only map; writers replace the file via
                // rename instead of mutating it in place.
                let map = unsafe { Mmap::map(&file)? };
                Ok(codec::decode(&map)?.into_owned())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Full decoded content, zero-filled out to `size`.
    pub fn load(&self, inode: u32, size: u64) -> Result<Vec<u8>> {
        let mut content = match File::open(self.path_for(inode)) {
            Ok(file) => {
                let len = file.metadata()?.len();
                if len == 0 {
                    Vec::new()
                } else {
                    // SAFETY: read-only map; writers replace the file via
                    // rename instead of mutating it in place.
                    let map = unsafe { Mmap::map(&file)? };
                    codec::decode(&map)?.into_owned()
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        content.resize(size as usize, 0);
        Ok(content)
    }

    /// Reads `len` bytes at `offset`, clamped to `size`.
    pub fn read(&self, inode: u32, offset: u64, len: usize, size: u64) -> Result<Vec<u8>> {
        if offset >= size {
            return Ok(Vec::new());
        }
        let content = self.load(inode, size)?;
        let end = (offset + len as u64).min(size) as usize;
        Ok(content[offset as usize..end].to_vec())
    }

    /// Replaces the payload with `content`, encoded per configuration, and
    /// syncs it to disk.
    pub fn store(&self, inode: u32, content: &[u8]) -> Result<()> {
        let encoded = if self.compression {
            codec::encode(content, self.compression_min_bytes)?
        } else {
            None
        };
        let image: &[u8] = encoded.as_deref().unwrap_or(content);

        let path = self.path_for(inode);
        let tmp = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(image)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Applies a positional write and returns the new file size.
    pub fn write(&self, inode: u32, offset: u64, data: &[u8], size: u64) -> Result<u64> {
        let mut content = self.load(inode, size)?;
        let end = offset as usize + data.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[offset as usize..end].copy_from_slice(data);
        self.store(inode, &content)?;
        Ok(content.len() as u64)
    }

    /// Truncates or extends the payload to `new_size`. Extension zero-fills.
    pub fn truncate(&self, inode: u32, new_size: u64, size: u64) -> Result<()> {
        if new_size == size {
            return Ok(());
        }
        let mut content = self.load(inode, size)?;
        content.resize(new_size as usize, 0);
        if new_size == 0 {
            // An unlinked or emptied inode keeps no payload file content.
            match fs::remove_file(self.path_for(inode)) {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
        self.store(inode, &content)
    }

    /// Removes the payload file outright (inode destruction).
    pub fn remove(&self, inode: u32) -> Result<()> {
        match fs::remove_file(self.path_for(inode)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// fsync on the payload file, if it exists.
    pub fn sync(&self, inode: u32) -> Result<()> {
        match File::open(self.path_for(inode)) {
            Ok(file) => {
                file.sync_all()?;
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// On-disk length of the stored image, if present. For statfs and the
    /// checker.
    pub fn disk_len(&self, inode: u32) -> Result<Option<u64>> {
        match fs::metadata(self.path_for(inode)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::codec::DATA_MAGIC;

    fn scratch_store(compression: bool) -> (tempfile::TempDir, DataStore) {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let store = DataStore::new(dir.path(), compression, 512);
        (dir, store)
    }

    #[test]
    fn write_read_round_trip() {
        let (_dir, store) = scratch_store(true);
        let size = store.write(9, 0, b"hello", 0).expect("write should succeed");
        assert_eq!(size, 5);
        let back = store.read(9, 0, 16, size).expect("read should succeed");
        assert_eq!(back, b"hello");
    }

    #[test]
    fn large_repetitive_file_lands_compressed() {
        let (_dir, store) = scratch_store(true);
        let data = vec![b'A'; 700];
        let size = store.write(3, 0, &data, 0).expect("write should succeed");
        let raw = fs::read(store.path_for(3)).expect("payload file should exist");
        assert_eq!(&raw[..DATA_MAGIC.len()], &DATA_MAGIC);
        assert_eq!(store.read(3, 0, 700, size).expect("read should succeed"), data);
    }

    #[test]
    fn positional_write_extends_with_zeros() {
        let (_dir, store) = scratch_store(false);
        let size = store.write(5, 10, b"xy", 0).expect("write should succeed");
        assert_eq!(size, 12);
        let back = store.read(5, 0, 12, size).expect("read should succeed");
        assert_eq!(&back[..10], &[0u8; 10]);
        assert_eq!(&back[10..], b"xy");
    }

    #[test]
    fn truncate_to_zero_removes_payload() {
        let (_dir, store) = scratch_store(false);
        store.write(4, 0, b"payload", 0).expect("write should succeed");
        store.truncate(4, 0, 7).expect("truncate should succeed");
        assert_eq!(store.disk_len(4).expect("disk_len should succeed"), None);
        assert_eq!(store.read(4, 0, 8, 0).expect("read should succeed"), b"");
    }

    #[test]
    fn size_is_authoritative_over_short_payload() {
        let (_dir, store) = scratch_store(false);
        store.write(6, 0, b"abc", 0).expect("write should succeed");
        // Node claims 6 bytes; the tail reads as zeros.
        let back = store.read(6, 0, 6, 6).expect("read should succeed");
        assert_eq!(back, b"abc\0\0\0");
    }
}
