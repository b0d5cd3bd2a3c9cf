//! The journal append path.
//!
//! A single tail mutex orders appends; fsync follows the configured policy.
//! Under `always`, committers share fsyncs: whoever finds no sync in flight
//! becomes the syncer and one `fdatasync` covers every byte appended so
//! far, while the rest wait on a condvar until the synced watermark passes
//! their commit offset.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::config::WalSync;
use crate::error::{FsError, Result};
use crate::wal::record::{decode_frame, Blob, Frame, Payload, Record, BLOB_SPILL_THRESHOLD};

pub const WAL_MAGIC: [u8; 4] = *b"RZWL";
pub const WAL_VERSION: u32 = 1;
/// magic[4] | version u32 | last_lsn u64 | clean_flag u8
pub const WAL_HEADER_LEN: u64 = 17;

const OFF_LAST_LSN: u64 = 8;
const OFF_CLEAN: u64 = 16;

/// Commits between fsyncs in `batched` mode.
const BATCH_COMMITS: u32 = 32;
/// Longest time a batched commit stays unsynced, in milliseconds.
const BATCH_WINDOW_MS: u128 = 50;

struct Tail {
    file: File,
    offset: u64,
    next_lsn: u64,
    pending_commits: u32,
    last_sync: Instant,
}

struct SyncState {
    synced: u64,
    syncing: bool,
}

pub struct Wal {
    path: PathBuf,
    dir: PathBuf,
    mode: WalSync,
    tail: Mutex<Tail>,
    /// Handle used by the group-commit syncer so it never holds the tail.
    sync_handle: File,
    sync_state: Mutex<SyncState>,
    sync_cv: Condvar,
}

/// Everything found by a forward scan of the journal.
pub struct ScanOutcome {
    pub records: Vec<Record>,
    /// Byte length of the valid prefix (header included).
    pub valid_len: u64,
    pub torn_tail: bool,
    /// First record with a valid CRC that does not decode, if any.
    pub undecodable: Option<(u64, String)>,
}

fn spill_if_oversize(blob: &mut Blob, sidecar: PathBuf) -> Result<()> {
    if let Blob::Inline(bytes) = blob {
        if bytes.len() > BLOB_SPILL_THRESHOLD {
            let mut file = File::create(&sidecar)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            *blob = Blob::Spilled { len: bytes.len() as u64 };
        }
    }
    Ok(())
}

impl Wal {
    /// Creates a fresh journal with the clean flag set (an empty filesystem
    /// is consistent).
    pub fn create(path: &Path, mode: WalSync) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let mut header = [0u8; WAL_HEADER_LEN as usize];
        header[0..4].copy_from_slice(&WAL_MAGIC);
        header[4..8].copy_from_slice(&WAL_VERSION.to_le_bytes());
        header[8..16].copy_from_slice(&0u64.to_le_bytes());
        header[16] = 1;
        file.write_all(&header)?;
        file.sync_all()?;
        Self::from_file(path, file, mode)
    }

    /// Opens an existing journal and validates the header. `next_lsn` is
    /// derived from the scan, not the header, so a stale header cannot
    /// reissue LSNs.
    pub fn open(path: &Path, mode: WalSync) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < WAL_HEADER_LEN {
            return Err(FsError::Corrupted(format!(
                "{}: journal shorter than its header",
                path.display()
            )));
        }
        let mut header = [0u8; WAL_HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        if header[0..4] != WAL_MAGIC {
            return Err(FsError::Corrupted(format!("{}: bad journal magic", path.display())));
        }
        let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if version != WAL_VERSION {
            return Err(FsError::Corrupted(format!(
                "{}: journal version {version}, expected {WAL_VERSION}",
                path.display()
            )));
        }
        let wal = Self::from_file(path, file, mode)?;
        let scan = wal.scan()?;
        let header_last = wal.header_last_lsn()?;
        let next_lsn = scan
            .records
            .iter()
            .map(|record| record.lsn)
            .max()
            .map_or(header_last + 1, |lsn| lsn + 1);
        wal.tail.lock().next_lsn = next_lsn;
        Ok(wal)
    }

    fn from_file(path: &Path, file: File, mode: WalSync) -> Result<Self> {
        let offset = file.metadata()?.len();
        let sync_handle = file.try_clone()?;
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self {
            path: path.to_path_buf(),
            dir,
            mode,
            tail: Mutex::new(Tail {
                file,
                offset,
                next_lsn: 1,
                pending_commits: 0,
                last_sync: Instant::now(),
            }),
            sync_handle,
            sync_state: Mutex::new(SyncState { synced: 0, syncing: false }),
            sync_cv: Condvar::new(),
        })
    }

    fn header_last_lsn(&self) -> Result<u64> {
        let mut tail = self.tail.lock();
        tail.file.seek(SeekFrom::Start(OFF_LAST_LSN))?;
        let mut buf = [0u8; 8];
        tail.file.read_exact(&mut buf)?;
        tail.file.seek(SeekFrom::End(0))?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn blob_path(&self, lsn: u64) -> PathBuf {
        self.dir.join(format!("wal_blob_{lsn}"))
    }

    pub fn prior_blob_path(&self, lsn: u64) -> PathBuf {
        self.dir.join(format!("wal_blob_{lsn}_prior"))
    }

    /// Reads the clean flag without touching the tail state.
    pub fn clean_flag(&self) -> Result<bool> {
        let mut tail = self.tail.lock();
        tail.file.seek(SeekFrom::Start(OFF_CLEAN))?;
        let mut byte = [0u8; 1];
        tail.file.read_exact(&mut byte)?;
        tail.file.seek(SeekFrom::End(0))?;
        Ok(byte[0] == 1)
    }

    /// Writes and syncs the clean flag.
    pub fn set_clean_flag(&self, clean: bool) -> Result<()> {
        let mut tail = self.tail.lock();
        tail.file.seek(SeekFrom::Start(OFF_CLEAN))?;
        tail.file.write_all(&[clean as u8])?;
        tail.file.seek(SeekFrom::End(0))?;
        tail.file.sync_all()?;
        Ok(())
    }

    /// Appends one transaction's records (LSNs assigned here, consecutive)
    /// and returns the tail offset its commit must be synced to. Oversize
    /// data blobs are spilled to sidecar files, synced before the frame
    /// that references them.
    pub fn append_txn(&self, txn_id: u64, payloads: Vec<Payload>) -> Result<u64> {
        let mut tail = self.tail.lock();
        let mut buf = Vec::with_capacity(256);
        for mut payload in payloads {
            let lsn = tail.next_lsn;
            tail.next_lsn += 1;
            if let Payload::WriteData { blob, prior, .. } = &mut payload {
                spill_if_oversize(blob, self.blob_path(lsn))?;
                spill_if_oversize(prior, self.prior_blob_path(lsn))?;
            }
            Record { lsn, txn_id, payload }.encode_into(&mut buf)?;
        }
        tail.file.write_all(&buf)?;
        tail.offset += buf.len() as u64;
        tail.pending_commits += 1;
        Ok(tail.offset)
    }

    /// Makes a commit at `target` offset durable per the sync policy.
    pub fn commit_sync(&self, target: u64) -> Result<()> {
        match self.mode {
            WalSync::Off => Ok(()),
            WalSync::Always => self.group_sync(target),
            WalSync::Batched => {
                let due = {
                    let mut tail = self.tail.lock();
                    let due = tail.pending_commits >= BATCH_COMMITS
                        || tail.last_sync.elapsed().as_millis() >= BATCH_WINDOW_MS;
                    if due {
                        tail.pending_commits = 0;
                        tail.last_sync = Instant::now();
                    }
                    due
                };
                if due {
                    self.group_sync(target)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Shared-fsync loop: one syncer per round, everyone whose offset is
    /// covered by the round's watermark returns without its own fsync.
    fn group_sync(&self, target: u64) -> Result<()> {
        let mut state = self.sync_state.lock();
        loop {
            if state.synced >= target {
                return Ok(());
            }
            if state.syncing {
                self.sync_cv.wait(&mut state);
                continue;
            }
            state.syncing = true;
            drop(state);

            let covered = self.tail.lock().offset;
            let outcome = self.sync_handle.sync_data();

            state = self.sync_state.lock();
            state.syncing = false;
            match outcome {
                Ok(()) => state.synced = state.synced.max(covered),
                Err(err) => {
                    self.sync_cv.notify_all();
                    return Err(err.into());
                }
            }
            self.sync_cv.notify_all();
        }
    }

    /// Forces everything appended so far to disk, whatever the sync policy.
    /// Backs the `fsync` operation surface.
    pub fn sync_now(&self) -> Result<()> {
        let target = self.tail.lock().offset;
        self.group_sync(target)
    }

    /// Forward scan from the header. A torn trailing record ends the scan
    /// quietly; a valid-CRC record that fails to decode is surfaced for the
    /// recovery engine to treat as fatal.
    pub fn scan(&self) -> Result<ScanOutcome> {
        let mut tail = self.tail.lock();
        tail.file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::new();
        tail.file.read_to_end(&mut bytes)?;
        tail.file.seek(SeekFrom::End(0))?;
        drop(tail);

        let mut records = Vec::new();
        let mut at = WAL_HEADER_LEN as usize;
        let mut torn_tail = false;
        let mut undecodable = None;
        while let Some(frame) = decode_frame(&bytes[at.min(bytes.len())..]) {
            match frame {
                Frame::Record(record, consumed) => {
                    records.push(record);
                    at += consumed;
                }
                Frame::Torn => {
                    torn_tail = true;
                    break;
                }
                Frame::Undecodable { lsn, reason } => {
                    undecodable = Some((lsn, reason));
                    break;
                }
            }
        }
        Ok(ScanOutcome {
            records,
            valid_len: at as u64,
            torn_tail,
            undecodable,
        })
    }

    /// Reads a spilled blob for `lsn`.
    pub fn read_blob(&self, lsn: u64) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.blob_path(lsn))?)
    }

    /// Reads a spilled before-image for `lsn`.
    pub fn read_prior_blob(&self, lsn: u64) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.prior_blob_path(lsn))?)
    }

    /// Appends records outside any transaction protocol (recovery's ABORT
    /// compensation markers) and syncs them.
    pub fn append_raw_synced(&self, txn_id: u64, payloads: Vec<Payload>) -> Result<()> {
        let target = self.append_txn(txn_id, payloads)?;
        let covered = {
            let tail = self.tail.lock();
            tail.file.sync_data()?;
            tail.offset
        };
        let mut state = self.sync_state.lock();
        state.synced = state.synced.max(covered.max(target));
        Ok(())
    }

    /// Truncates the journal back to its header and appends a fresh
    /// CHECKPOINT record. Callers must have flushed the arena, strings and
    /// data first. Spilled blobs are reclaimed.
    pub fn checkpoint(&self) -> Result<u64> {
        let mut tail = self.tail.lock();
        let checkpoint_lsn = tail.next_lsn;
        tail.next_lsn += 1;

        // Reclaim sidecars before dropping the records that reference them.
        if let Ok(entries) = std::fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                if entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("wal_blob_")
                {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }

        tail.file.set_len(WAL_HEADER_LEN)?;
        tail.file.seek(SeekFrom::Start(OFF_LAST_LSN))?;
        tail.file.write_all(&checkpoint_lsn.to_le_bytes())?;
        tail.file.seek(SeekFrom::End(0))?;

        let mut buf = Vec::new();
        Record {
            lsn: checkpoint_lsn,
            txn_id: 0,
            payload: Payload::Checkpoint,
        }
        .encode_into(&mut buf)?;
        tail.file.write_all(&buf)?;
        tail.offset = WAL_HEADER_LEN + buf.len() as u64;
        tail.pending_commits = 0;
        tail.file.sync_all()?;

        let offset = tail.offset;
        drop(tail);
        let mut state = self.sync_state.lock();
        state.synced = offset;
        log::debug!("journal checkpoint at lsn {checkpoint_lsn}");
        Ok(checkpoint_lsn)
    }

    /// Current journal length in bytes, for statfs and tests.
    pub fn len(&self) -> u64 {
        self.tail.lock().offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= WAL_HEADER_LEN
    }
}
