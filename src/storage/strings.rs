//! Append-only string interning table.
//!
//! Names are stored NUL-terminated in a memory-mapped file; an offset into
//! the byte region uniquely identifies a name and stays stable for the
//! lifetime of the filesystem (growth remaps, it never compacts). The hash
//! index is an in-memory structure rebuilt on every mount by scanning the
//! table.

use std::cell::UnsafeCell;
use std::fs::{File, OpenOptions};
use std::path::Path;

use fnv::FnvHashMap;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

use crate::error::{FsError, Result};

pub const STRINGS_MAGIC: [u8; 4] = *b"RZST";
pub const STRINGS_VERSION: u32 = 1;
pub const STRINGS_HEADER_LEN: usize = 12;

const OFF_VERSION: usize = 4;
const OFF_USED: usize = 8;

/// Outcome of an intern attempt under a shared growth lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intern {
    /// Stable offset of the (possibly pre-existing) name.
    Interned(u32),
    /// The table must grow first; retry after `grow()` under the exclusive
    /// growth lock.
    NeedsGrowth,
}

struct InternState {
    index: FnvHashMap<Box<[u8]>, u32>,
    used: u32,
    capacity: u32,
}

pub struct StringTable {
    file: File,
    /// Remapped on growth; all remaps happen under the exclusive tree
    /// growth lock while readers hold it shared.
    map: UnsafeCell<MmapMut>,
    state: Mutex<InternState>,
    ceiling: u64,
}

// SAFETY: `map` is only replaced by `grow()`, whose contract requires the
// exclusive growth lock; every reader holds that lock shared.
unsafe impl Send for StringTable {}
unsafe impl Sync for StringTable {}

impl StringTable {
    pub fn create(path: &Path, initial_capacity: u32, ceiling: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let capacity = initial_capacity.max(4096).min(ceiling.min(u32::MAX as u64) as u32);
        file.set_len(STRINGS_HEADER_LEN as u64 + capacity as u64)?;
        // SAFETY: freshly created file, sized above.
        let mut map = unsafe { MmapOptions::new().map_mut(&file)? };
        map[0..4].copy_from_slice(&STRINGS_MAGIC);
        map[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&STRINGS_VERSION.to_le_bytes());
        map[OFF_USED..OFF_USED + 4].copy_from_slice(&0u32.to_le_bytes());
        map.flush()?;
        Ok(Self {
            file,
            map: UnsafeCell::new(map),
            state: Mutex::new(InternState {
                index: FnvHashMap::default(),
                used: 0,
                capacity,
            }),
            ceiling,
        })
    }

    /// Opens an existing table and rebuilds the hash index by scanning the
    /// used region for NUL terminators.
    pub fn open(path: &Path, ceiling: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < STRINGS_HEADER_LEN as u64 {
            return Err(FsError::Corrupted(format!(
                "{}: string table shorter than its header",
                path.display()
            )));
        }
        // SAFETY: shared read-write mapping guarded by the growth-lock
        // discipline.
        let map = unsafe { MmapOptions::new().map_mut(&file)? };
        if map[0..4] != STRINGS_MAGIC {
            return Err(FsError::Corrupted(format!(
                "{}: bad string table magic",
                path.display()
            )));
        }
        let version = u32::from_le_bytes(map[OFF_VERSION..OFF_VERSION + 4].try_into().unwrap());
        if version != STRINGS_VERSION {
            return Err(FsError::Corrupted(format!(
                "{}: string table version {version}, expected {STRINGS_VERSION}",
                path.display()
            )));
        }
        let used = u32::from_le_bytes(map[OFF_USED..OFF_USED + 4].try_into().unwrap());
        let capacity = (len - STRINGS_HEADER_LEN as u64) as u32;
        if used > capacity {
            return Err(FsError::Corrupted(format!(
                "{}: used {used} exceeds capacity {capacity}",
                path.display()
            )));
        }

        let mut index = FnvHashMap::default();
        let region = &map[STRINGS_HEADER_LEN..STRINGS_HEADER_LEN + used as usize];
        let mut start = 0usize;
        while start < region.len() {
            match memchr::memchr(0, &region[start..]) {
                Some(rel) => {
                    let name = &region[start..start + rel];
                    index.insert(name.into(), start as u32);
                    start += rel + 1;
                }
                None => {
                    return Err(FsError::Corrupted(format!(
                        "{}: unterminated name at offset {start}",
                        path.display()
                    )));
                }
            }
        }
        log::debug!("opened string table: {used} bytes used, {} names", index.len());

        Ok(Self {
            file,
            map: UnsafeCell::new(map),
            state: Mutex::new(InternState { index, used, capacity }),
            ceiling,
        })
    }

    #[inline]
    fn map_ref(&self) -> &MmapMut {
        // SAFETY: see the Send/Sync rationale above.
        unsafe { &*self.map.get() }
    }

    pub fn used(&self) -> u32 {
        self.state.lock().used
    }

    pub fn capacity(&self) -> u32 {
        self.state.lock().capacity
    }

    /// Interns `name`, appending it with a NUL terminator if unseen. The
    /// appended bytes and the header are flushed before returning so a WAL
    /// record may reference the offset durably.
    ///
    /// Callers hold the growth lock shared; `Intern::NeedsGrowth` asks them
    /// to re-acquire it exclusively and call [`grow`](Self::grow).
    pub fn intern(&self, name: &[u8]) -> Result<Intern> {
        if name.is_empty() || name.contains(&0) {
            return Err(FsError::InvalidArgument("name is empty or contains NUL".into()));
        }
        let mut state = self.state.lock();
        if let Some(&offset) = state.index.get(name) {
            return Ok(Intern::Interned(offset));
        }
        let needed = name.len() as u32 + 1;
        if state.used.checked_add(needed).is_none()
            || state.used + needed > state.capacity
        {
            if state.capacity as u64 >= self.ceiling {
                return Err(FsError::NoSpace("string table at configured ceiling"));
            }
            return Ok(Intern::NeedsGrowth);
        }

        let offset = state.used;
        let at = STRINGS_HEADER_LEN + offset as usize;
        // SAFETY: the target range is beyond `used`, so no reader holds a
        // slice into it; the intern mutex serializes appenders. Writes go
        // through raw pointers so shared slices over the used region stay
        // valid.
        unsafe {
            let base = (*self.map.get()).as_mut_ptr();
            std::ptr::copy_nonoverlapping(name.as_ptr(), base.add(at), name.len());
            base.add(at + name.len()).write(0);
            state.used += needed;
            std::ptr::copy_nonoverlapping(
                state.used.to_le_bytes().as_ptr(),
                base.add(OFF_USED),
                4,
            );
        }
        let map = self.map_ref();
        map.flush_range(0, STRINGS_HEADER_LEN)?;
        map.flush_range(at, needed as usize)?;
        state.index.insert(name.into(), offset);
        Ok(Intern::Interned(offset))
    }

    /// Doubles the capacity (clamped to the ceiling) and remaps.
    ///
    /// # Safety contract
    /// The caller must hold the tree growth lock exclusively; every
    /// outstanding `name_at` slice is invalidated by the remap.
    pub fn grow(&self) -> Result<()> {
        let mut state = self.state.lock();
        let new_capacity = (state.capacity as u64 * 2)
            .min(self.ceiling)
            .max(state.capacity as u64);
        if new_capacity == state.capacity as u64 {
            return Err(FsError::NoSpace("string table at configured ceiling"));
        }
        self.map_ref().flush()?;
        self.file
            .set_len(STRINGS_HEADER_LEN as u64 + new_capacity)?;
        // SAFETY: exclusive growth lock per the contract; no reader holds a
        // slice into the old mapping.
        unsafe {
            let map = &mut *self.map.get();
            *map = MmapOptions::new().map_mut(&self.file)?;
        }
        state.capacity = new_capacity as u32;
        log::debug!("string table grown to {new_capacity} bytes");
        Ok(())
    }

    /// Bytes of the name starting at `offset`, without the terminator.
    ///
    /// Callers must hold the growth lock (shared is enough); the slice is
    /// invalidated by `grow()`.
    pub fn name_at(&self, offset: u32) -> Result<&[u8]> {
        let used = self.state.lock().used;
        if offset >= used {
            return Err(FsError::Corrupted(format!(
                "string offset {offset} beyond used size {used}"
            )));
        }
        let region = &self.map_ref()[STRINGS_HEADER_LEN..STRINGS_HEADER_LEN + used as usize];
        match memchr::memchr(0, &region[offset as usize..]) {
            Some(rel) => Ok(&region[offset as usize..offset as usize + rel]),
            None => Err(FsError::Corrupted(format!(
                "unterminated name at offset {offset}"
            ))),
        }
    }

    /// True if `offset` lands on a name start. Linear; for the checker.
    pub fn is_name_start(&self, offset: u32) -> bool {
        let state = self.state.lock();
        state.index.values().any(|&start| start == offset)
    }

    pub fn flush(&self) -> Result<()> {
        self.map_ref().flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_table(capacity: u32, ceiling: u64) -> (tempfile::TempDir, StringTable) {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let table = StringTable::create(&dir.path().join("strings.dat"), capacity, ceiling)
            .expect("table creation should succeed");
        (dir, table)
    }

    fn intern_ok(table: &StringTable, name: &[u8]) -> u32 {
        match table.intern(name).expect("intern should succeed") {
            Intern::Interned(offset) => offset,
            Intern::NeedsGrowth => panic!("unexpected growth request"),
        }
    }

    #[test]
    fn intern_is_idempotent() {
        let (_dir, table) = scratch_table(4096, 1 << 20);
        let a = intern_ok(&table, b"hello");
        let b = intern_ok(&table, b"hello");
        assert_eq!(a, b);
        let c = intern_ok(&table, b"world");
        assert_ne!(a, c);
        assert_eq!(table.name_at(a).expect("name_at should succeed"), b"hello");
        assert_eq!(table.name_at(c).expect("name_at should succeed"), b"world");
    }

    #[test]
    fn growth_keeps_offsets_stable() {
        let (_dir, table) = scratch_table(4096, 1 << 20);
        let offset = intern_ok(&table, b"stable");
        // Fill until a growth request appears, then grow and continue.
        let mut i = 0u32;
        loop {
            let name = format!("filler-{i}");
            match table.intern(name.as_bytes()).expect("intern should succeed") {
                Intern::Interned(_) => i += 1,
                Intern::NeedsGrowth => break,
            }
        }
        table.grow().expect("grow should succeed");
        let name = format!("filler-{i}");
        intern_ok(&table, name.as_bytes());
        assert_eq!(table.name_at(offset).expect("name_at should succeed"), b"stable");
    }

    #[test]
    fn ceiling_is_enforced() {
        let (_dir, table) = scratch_table(4096, 4096);
        let mut i = 0u32;
        let err = loop {
            let name = format!("filler-{i}");
            match table.intern(name.as_bytes()) {
                Ok(Intern::Interned(_)) => i += 1,
                Ok(Intern::NeedsGrowth) => panic!("growth should be refused at the ceiling"),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, FsError::NoSpace(_)));
    }

    #[test]
    fn reopen_rebuilds_index() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let path = dir.path().join("strings.dat");
        let offset;
        {
            let table =
                StringTable::create(&path, 4096, 1 << 20).expect("table creation should succeed");
            offset = intern_ok(&table, b"persistent");
            intern_ok(&table, b"other");
        }
        let table = StringTable::open(&path, 1 << 20).expect("table open should succeed");
        // Interning an existing name returns the offset found by the scan.
        assert_eq!(intern_ok(&table, b"persistent"), offset);
        assert!(table.is_name_start(offset));
        assert!(!table.is_name_start(offset + 1));
    }

    #[test]
    fn rejects_invalid_offsets() {
        let (_dir, table) = scratch_table(4096, 1 << 20);
        intern_ok(&table, b"only");
        assert!(matches!(table.name_at(9999), Err(FsError::Corrupted(_))));
    }

    #[test]
    fn rejects_nul_and_empty_names() {
        let (_dir, table) = scratch_table(4096, 1 << 20);
        assert!(table.intern(b"").is_err());
        assert!(table.intern(b"a\0b").is_err());
    }
}
