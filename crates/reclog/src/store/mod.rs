//! The record store: a pair of files under a caller-supplied directory.
//!
//! `<name>.dat` holds the records themselves (fixed header, then metadata
//! and data bytes); `<name>.idx` holds one fixed-size index record per data
//! record so that any seqnum can be located with one positional read and
//! timestamps can be bisected. See [`crate::format`] for the byte layouts.
//!
//! # Concurrency
//!
//! A store supports one writer and many readers on parallel threads:
//!
//! - the **state mutex** protects the in-memory [`State`] block and is held
//!   only for the copy in or out;
//! - the **file lock** (a reader-writer lock) keeps file contents coherent
//!   with the state: read-type operations take it shared, the destructive
//!   operations (rollback, purge) take it exclusive.
//!
//! Append takes neither side of the file lock. It only grows the files and
//! publishes the new state afterwards, so a concurrent reader either sees
//! the old state (and never looks at the new bytes, because `last_seqnum`
//! bounds every read loop) or sees the new state once the records are
//! already on disk.
//!
//! Preventing *multiple* concurrent writers is the caller's responsibility;
//! the writer handles sit behind a mutex so misuse cannot corrupt memory,
//! only serialize.

use crate::error::{AppendError, Error, Result};
use crate::format::{
    DatHeader, DatRecord, IdxRecord, DAT_HEADER_SIZE, DAT_RECORD_SIZE, IDX_HEADER_SIZE,
    IDX_RECORD_SIZE, MILESTONE_OFFSET,
};
use crate::fsutil;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

mod recover;

/// Maximum length of a store name.
pub const NAME_MAX_LEN: usize = 32;

const DAT_EXT: &str = "dat";
const IDX_EXT: &str = "idx";
const TMP_EXT: &str = "tmp";

/// Durability mode applied to the data file after mutating operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Write through to the kernel only (default). Records survive a process
    /// crash but a machine crash may lose the tail; recovery on open trims
    /// it back to a consistent log.
    #[default]
    Flush,
    /// Additionally `fdatasync` the data file after append batches, rollback
    /// and milestone updates.
    Fdatasync,
}

/// Configuration for opening a [`Store`].
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Deep-validate both files on open: walk every record, verifying
    /// checksums, sequence continuity and index consistency. Without it the
    /// opener trusts well-formed records and only repairs the tails.
    pub check: bool,
    /// Durability mode for mutating operations.
    pub sync: SyncMode,
}

impl StoreConfig {
    /// Creates a configuration with the given settings.
    pub fn new(check: bool, sync: SyncMode) -> Self {
        Self { check, sync }
    }
}

/// Snapshot of the cached store state.
///
/// All fields are zero when the store is empty, except `dat_end` which then
/// sits just past the data file header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct State {
    /// Seqnum of the oldest record (0 when empty).
    pub first_seqnum: u64,
    /// Timestamp of the oldest record.
    pub first_timestamp: u64,
    /// Seqnum of the newest record (0 when empty).
    pub last_seqnum: u64,
    /// Timestamp of the newest record.
    pub last_timestamp: u64,
    /// Opaque milestone value stored in the data file header.
    pub milestone: u64,
    /// Byte offset one past the last data record.
    pub dat_end: u64,
}

impl State {
    /// Returns true when the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.first_seqnum == 0
    }

    fn cleared(milestone: u64) -> Self {
        Self {
            milestone,
            dat_end: DAT_HEADER_SIZE as u64,
            ..Self::default()
        }
    }
}

/// Statistics over a seqnum range, as returned by [`Store::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// First seqnum of the effective (clamped) range.
    pub min_seqnum: u64,
    /// Last seqnum of the effective range.
    pub max_seqnum: u64,
    /// Timestamp of the first record in the range.
    pub min_timestamp: u64,
    /// Timestamp of the last record in the range.
    pub max_timestamp: u64,
    /// Number of records in the range.
    pub num_entries: u64,
    /// Bytes of data-file space the range occupies (headers + payloads).
    pub data_size: u64,
    /// Bytes of index-file space the range occupies.
    pub index_size: u64,
}

/// Search mode for [`Store::search`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Find the smallest seqnum whose timestamp is greater than or equal to
    /// the searched value.
    Lower,
    /// Find the smallest seqnum whose timestamp is strictly greater than
    /// the searched value.
    Upper,
}

/// A logical record: seqnum, timestamp and two opaque byte strings.
///
/// Metadata and data share a single allocation; the data slice starts at
/// the metadata length rounded up to the word size. Entries handed to
/// [`Store::read`] keep their allocation across calls and are only regrown
/// when a record does not fit.
#[derive(Debug, Default, Clone)]
pub struct Entry {
    /// Record sequence number. 0 on an append input means "assign the next
    /// seqnum"; the field is updated in place with the assigned value.
    pub seqnum: u64,
    /// Record timestamp. 0 on an append input means "stamp with wall-clock
    /// milliseconds, floored to the last stored timestamp".
    pub timestamp: u64,
    buf: Vec<u8>,
    metadata_len: u32,
    data_len: u32,
}

fn align_word(n: usize) -> usize {
    (n + 7) & !7
}

impl Entry {
    /// Creates an entry with auto-assigned seqnum and timestamp.
    pub fn new(metadata: &[u8], data: &[u8]) -> Self {
        Self::with_ids(0, 0, metadata, data)
    }

    /// Creates an entry with explicit seqnum and timestamp (0 = assign).
    pub fn with_ids(seqnum: u64, timestamp: u64, metadata: &[u8], data: &[u8]) -> Self {
        let mut entry = Entry {
            seqnum,
            timestamp,
            ..Entry::default()
        };
        let (m, d) = entry.reset(metadata.len() as u32, data.len() as u32);
        m.copy_from_slice(metadata);
        d.copy_from_slice(data);
        entry
    }

    /// The metadata bytes.
    pub fn metadata(&self) -> &[u8] {
        &self.buf[..self.metadata_len as usize]
    }

    /// The data bytes.
    pub fn data(&self) -> &[u8] {
        if self.data_len == 0 {
            return &[];
        }
        let off = align_word(self.metadata_len as usize);
        &self.buf[off..off + self.data_len as usize]
    }

    /// Resizes the backing buffer for the given lengths, reusing the
    /// existing allocation when it is large enough, and returns the
    /// writable metadata and data slices.
    fn reset(&mut self, metadata_len: u32, data_len: u32) -> (&mut [u8], &mut [u8]) {
        let data_off = if data_len == 0 {
            metadata_len as usize
        } else {
            align_word(metadata_len as usize)
        };
        self.buf.clear();
        self.buf.resize(data_off + data_len as usize, 0);
        self.metadata_len = metadata_len;
        self.data_len = data_len;
        let (head, tail) = self.buf.split_at_mut(data_off);
        (&mut head[..metadata_len as usize], &mut tail[..data_len as usize])
    }

    fn clear_ids(&mut self) {
        self.seqnum = 0;
        self.timestamp = 0;
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.seqnum == other.seqnum
            && self.timestamp == other.timestamp
            && self.metadata() == other.metadata()
            && self.data() == other.data()
    }
}

impl Eq for Entry {}

#[derive(Debug)]
struct ReadPair {
    dat: File,
    idx: File,
}

#[derive(Debug)]
struct WritePair {
    dat: File,
    idx: File,
}

/// An open record store.
///
/// A store exclusively owns its two files between open and drop. It is
/// `Send + Sync`; see the module documentation for the locking discipline.
#[derive(Debug)]
pub struct Store {
    name: String,
    dir: PathBuf,
    dat_path: PathBuf,
    idx_path: PathBuf,
    config: StoreConfig,
    state: Mutex<State>,
    files: RwLock<ReadPair>,
    writer: Mutex<WritePair>,
}

impl Store {
    /// Opens the store `<name>` under `dir`, creating the files when absent
    /// and repairing them when a previous run crashed.
    ///
    /// With `config.check` the opener walks every record of both files and
    /// verifies all checksums; otherwise it verifies the first record and
    /// repairs only the tails. A missing or inconsistent index file is
    /// rebuilt from the data file in either mode.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPath`] / [`Error::InvalidName`] before touching the
    /// filesystem; otherwise the error reported by validation or repair. On
    /// error no `Store` is returned and all handles are released.
    pub fn open(dir: impl AsRef<Path>, name: &str, config: StoreConfig) -> Result<Store> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(Error::InvalidPath(dir.to_path_buf()));
        }
        if !is_valid_name(name) {
            return Err(Error::InvalidName(name.to_string()));
        }

        let dat_path = dir.join(format!("{name}.{DAT_EXT}"));
        let idx_path = dir.join(format!("{name}.{IDX_EXT}"));

        let opened = recover::open_pair(&dat_path, &idx_path, config.check)?;
        let dat_r = File::open(&dat_path).map_err(Error::OpenData)?;
        let idx_r = File::open(&idx_path).map_err(Error::OpenIndex)?;

        debug!(
            name,
            first = opened.state.first_seqnum,
            last = opened.state.last_seqnum,
            "store opened"
        );

        Ok(Store {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            dat_path,
            idx_path,
            config,
            state: Mutex::new(opened.state),
            files: RwLock::new(ReadPair {
                dat: dat_r,
                idx: idx_r,
            }),
            writer: Mutex::new(WritePair {
                dat: opened.dat,
                idx: opened.idx,
            }),
        })
    }

    /// The store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The directory holding the store files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns a snapshot of the cached state.
    pub fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    /// Returns true when the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.state().is_empty()
    }

    /// Appends entries in order.
    ///
    /// For each entry, a zero seqnum is replaced with `last_seqnum + 1` (1
    /// for the first record, which may otherwise carry any non-zero value),
    /// and a zero timestamp with `max(wall-clock ms, last_timestamp)`; both
    /// assignments are written back into the entry. Explicit values are
    /// validated against the sequence and monotonicity rules.
    ///
    /// The batch is not atomic: on failure, entries written before the
    /// failing position stay in the store and the returned [`AppendError`]
    /// carries their count.
    pub fn append(&self, entries: &mut [Entry]) -> std::result::Result<usize, AppendError> {
        let mut writer = self.writer.lock().unwrap();
        let mut state = *self.state.lock().unwrap();

        let mut appended = 0usize;
        let mut failure = None;
        for entry in entries.iter_mut() {
            match append_one(&mut writer, &mut state, entry) {
                Ok(()) => appended += 1,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        let mut sync_failure = None;
        if appended > 0 && self.config.sync == SyncMode::Fdatasync {
            if let Err(err) = writer.dat.sync_data() {
                sync_failure = Some(Error::WriteData(err));
            }
        }

        // Records written so far are durable; publish them even when the
        // batch stopped early.
        *self.state.lock().unwrap() = state;

        match failure.or(sync_failure) {
            None => Ok(appended),
            Some(source) => Err(AppendError { appended, source }),
        }
    }

    /// Reads consecutive entries starting at `seqnum` into `entries`.
    ///
    /// Returns the number of entries filled; the remaining slots have their
    /// seqnum and timestamp reset to zero. Stops early when the last record
    /// is reached. Entry buffers are reused when they are large enough.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when the store is empty or `seqnum` is zero or
    /// outside the stored range; [`Error::Checksum`] when a record fails
    /// verification.
    pub fn read(&self, seqnum: u64, entries: &mut [Entry]) -> Result<usize> {
        let files = self.files.read().unwrap();
        let state = *self.state.lock().unwrap();

        for entry in entries.iter_mut() {
            entry.clear_ids();
        }

        if seqnum == 0 || state.is_empty() || seqnum < state.first_seqnum || state.last_seqnum < seqnum
        {
            return Err(Error::NotFound);
        }

        let mut sn = seqnum;
        let mut num = 0;
        for entry in entries.iter_mut() {
            if sn > state.last_seqnum {
                break;
            }
            let idx = read_idx_record(&files.idx, &state, sn)?;
            read_entry_at(&files.dat, &state, idx.pos, entry)?;
            if entry.seqnum != sn {
                return Err(Error::FormatIndex("index offset does not match data record"));
            }
            sn += 1;
            num += 1;
        }
        Ok(num)
    }

    /// Reads the single entry with the given seqnum.
    pub fn read_one(&self, seqnum: u64) -> Result<Entry> {
        let mut entries = [Entry::default()];
        self.read(seqnum, &mut entries)?;
        let [entry] = entries;
        Ok(entry)
    }

    /// Searches the seqnum matching a timestamp by bisecting the index.
    ///
    /// [`SearchMode::Lower`] returns the smallest seqnum whose timestamp is
    /// `>= timestamp`; [`SearchMode::Upper`] the smallest seqnum whose
    /// timestamp is `> timestamp`. Because timestamps are only
    /// non-decreasing, several records may share one value; `Lower` resolves
    /// ties to the smallest matching seqnum.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when no record qualifies (including the empty
    /// store).
    pub fn search(&self, timestamp: u64, mode: SearchMode) -> Result<u64> {
        let files = self.files.read().unwrap();
        let state = *self.state.lock().unwrap();

        if state.is_empty() {
            return Err(Error::NotFound);
        }
        match mode {
            SearchMode::Lower if state.last_timestamp < timestamp => return Err(Error::NotFound),
            SearchMode::Upper if state.last_timestamp <= timestamp => return Err(Error::NotFound),
            SearchMode::Lower if timestamp <= state.first_timestamp => {
                return Ok(state.first_seqnum)
            }
            SearchMode::Upper if timestamp < state.first_timestamp => {
                return Ok(state.first_seqnum)
            }
            _ => {}
        }

        // Bisection over the index, keeping ts1 <= timestamp <= ts2.
        let mut sn1 = state.first_seqnum;
        let mut ts1 = state.first_timestamp;
        let mut sn2 = state.last_seqnum;
        let mut ts2 = state.last_timestamp;

        while sn1 + 1 < sn2 && ts1 != ts2 {
            let sn = sn1 + (sn2 - sn1) / 2;
            let record = read_idx_record(&files.idx, &state, sn)?;
            let ts = record.timestamp;
            if ts < timestamp {
                sn1 = sn;
                ts1 = ts;
            } else if timestamp < ts || mode == SearchMode::Lower {
                sn2 = sn;
                ts2 = ts;
            } else {
                sn1 = sn;
                ts1 = ts;
            }
        }

        let mut result = sn2;
        if mode == SearchMode::Lower {
            // Duplicate timestamps: walk back to the true lower bound.
            while result > state.first_seqnum {
                let prev = read_idx_record(&files.idx, &state, result - 1)?;
                if prev.timestamp < timestamp {
                    break;
                }
                result -= 1;
            }
        }
        Ok(result)
    }

    /// Returns statistics for the seqnum range `[seqnum1, seqnum2]`.
    ///
    /// The range is clamped to the stored range; when the two do not
    /// intersect (or the store is empty) an all-zero [`Stats`] is returned
    /// with success.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] when `seqnum1 > seqnum2`.
    pub fn stats(&self, seqnum1: u64, seqnum2: u64) -> Result<Stats> {
        if seqnum2 < seqnum1 {
            return Err(Error::InvalidArg("seqnum1 greater than seqnum2"));
        }

        let files = self.files.read().unwrap();
        let state = *self.state.lock().unwrap();

        if state.is_empty() || seqnum2 < state.first_seqnum || state.last_seqnum < seqnum1 {
            return Ok(Stats::default());
        }

        let sn1 = seqnum1.clamp(state.first_seqnum, state.last_seqnum);
        let sn2 = seqnum2.clamp(state.first_seqnum, state.last_seqnum);

        let record1 = read_idx_record(&files.idx, &state, sn1)?;
        let record2 = read_idx_record(&files.idx, &state, sn2)?;
        let min_span = (record2.seqnum - record1.seqnum) * DAT_RECORD_SIZE as u64;
        if record2.pos < record1.pos + min_span {
            return Err(Error::FormatIndex("index offsets do not ascend"));
        }

        let record_dat = read_dat_record_at(&files.dat, record2.pos)?;
        if record_dat.seqnum != sn2 {
            return Err(Error::FormatIndex("index offset does not match data record"));
        }

        let num_entries = sn2 - sn1 + 1;
        Ok(Stats {
            min_seqnum: record1.seqnum,
            max_seqnum: record2.seqnum,
            min_timestamp: record1.timestamp,
            max_timestamp: record2.timestamp,
            num_entries,
            data_size: record2.pos - record1.pos + record_dat.disk_len(),
            index_size: num_entries * IDX_RECORD_SIZE as u64,
        })
    }

    /// Removes every record with seqnum greater than `seqnum` and returns
    /// the removed count (0 when there is nothing above the threshold).
    ///
    /// The index suffix is zeroed top-down and flushed before the data tail
    /// is zeroised, so a crash at any point leaves a log that the next open
    /// recovers to either the pre- or the post-rollback state.
    pub fn rollback(&self, seqnum: u64) -> Result<u64> {
        let _files = self.files.write().unwrap();
        let writer = self.writer.lock().unwrap();
        let state = *self.state.lock().unwrap();

        if state.last_seqnum <= seqnum {
            return Ok(0);
        }
        // Non-empty here: an empty store has last_seqnum == 0.
        let removed = state.last_seqnum - seqnum.max(state.first_seqnum - 1);

        let (new_last_timestamp, new_dat_end) = if seqnum >= state.first_seqnum {
            let keep = read_idx_record(&writer.idx, &state, seqnum)?;
            let next = read_idx_record(&writer.idx, &state, seqnum + 1)?;
            (keep.timestamp, next.pos)
        } else {
            (0, DAT_HEADER_SIZE as u64)
        };

        let zeros = [0u8; IDX_RECORD_SIZE];
        let mut sn = state.last_seqnum;
        while sn > seqnum && sn >= state.first_seqnum {
            let pos = idx_pos(state.first_seqnum, sn);
            writer
                .idx
                .write_all_at(&zeros, pos)
                .map_err(Error::WriteIndex)?;
            sn -= 1;
        }
        if self.config.sync == SyncMode::Fdatasync {
            writer.idx.sync_data().map_err(Error::WriteIndex)?;
        }

        let new_state = if seqnum < state.first_seqnum {
            State::cleared(state.milestone)
        } else {
            State {
                last_seqnum: seqnum,
                last_timestamp: new_last_timestamp,
                dat_end: new_dat_end,
                ..state
            }
        };
        *self.state.lock().unwrap() = new_state;

        fsutil::zeroize_from(&writer.dat, new_state.dat_end).map_err(Error::WriteData)?;
        if self.config.sync == SyncMode::Fdatasync {
            writer.dat.sync_data().map_err(Error::WriteData)?;
        }

        debug!(removed, last = new_state.last_seqnum, "rollback complete");
        Ok(removed)
    }

    /// Removes every record with seqnum lower than `seqnum` and returns the
    /// removed count (0 when there is nothing below the threshold).
    ///
    /// Purge rewrites the data file: retained records are copied into
    /// `<name>.tmp` (which must not pre-exist), the temp file is renamed
    /// over the data file, and the index is dropped and rebuilt by the
    /// opener. A failure before the rename leaves the store untouched on
    /// disk; after the rename the next open completes the rebuild. The
    /// milestone value is preserved.
    ///
    /// After an error the in-memory store is stale: drop it and reopen.
    pub fn purge(&self, seqnum: u64) -> Result<u64> {
        let mut files = self.files.write().unwrap();
        let mut writer = self.writer.lock().unwrap();
        let state = *self.state.lock().unwrap();

        if state.is_empty() || seqnum <= state.first_seqnum {
            return Ok(0);
        }

        // Whole store purged: recreate both files from scratch.
        if state.last_seqnum < seqnum {
            let removed = state.last_seqnum - state.first_seqnum + 1;
            let _ = fs::remove_file(&self.dat_path);
            let _ = fs::remove_file(&self.idx_path);
            recover::create_dat(&self.dat_path, state.milestone)?;
            recover::create_idx(&self.idx_path)?;
            self.reopen(&mut files, &mut writer)?;
            debug!(removed, "purge removed all records");
            return Ok(removed);
        }

        let removed = seqnum - state.first_seqnum;

        let keep = read_idx_record(&writer.idx, &state, seqnum)?;
        let record_dat = read_dat_record_at(&writer.dat, keep.pos)?;
        if record_dat.seqnum != seqnum {
            return Err(Error::FormatIndex("index offset does not match data record"));
        }

        let tmp_path = self.dir.join(format!("{}.{TMP_EXT}", self.name));
        let tmp = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .map_err(Error::TempFile)?;
        tmp.write_all_at(&DatHeader::new(state.milestone).to_bytes(), 0)
            .map_err(Error::TempFile)?;
        fsutil::copy_range(
            &writer.dat,
            keep.pos,
            state.dat_end,
            &tmp,
            DAT_HEADER_SIZE as u64,
        )
        .map_err(Error::TempFile)?;
        drop(tmp);

        fs::remove_file(&self.idx_path).map_err(Error::OpenIndex)?;
        fs::rename(&tmp_path, &self.dat_path).map_err(Error::TempFile)?;
        recover::create_idx(&self.idx_path)?;
        self.reopen(&mut files, &mut writer)?;

        debug!(removed, first = seqnum, "purge complete");
        Ok(removed)
    }

    /// Overwrites the 8-byte milestone slot in the data file header.
    ///
    /// The value is opaque to the engine; consensus implementations use it
    /// to record a commit index.
    pub fn update_milestone(&self, value: u64) -> Result<()> {
        let writer = self.writer.lock().unwrap();
        writer
            .dat
            .write_all_at(&value.to_le_bytes(), MILESTONE_OFFSET)
            .map_err(Error::WriteData)?;
        if self.config.sync == SyncMode::Fdatasync {
            writer.dat.sync_data().map_err(Error::WriteData)?;
        }
        self.state.lock().unwrap().milestone = value;
        Ok(())
    }

    /// Current milestone value.
    pub fn milestone(&self) -> u64 {
        self.state().milestone
    }

    /// Closes the store, syncing both files to stable storage.
    ///
    /// Dropping the store performs the same sync on a best-effort basis;
    /// use `close` to observe the outcome.
    pub fn close(self) -> Result<()> {
        let writer = self.writer.lock().unwrap();
        writer.dat.sync_all().map_err(Error::WriteData)?;
        writer.idx.sync_all().map_err(Error::WriteIndex)?;
        Ok(())
    }

    /// Re-runs the fast open on the current paths and swaps in the fresh
    /// handles and state. Used by purge once the files have been replaced.
    fn reopen(
        &self,
        files: &mut ReadPair,
        writer: &mut WritePair,
    ) -> Result<()> {
        let opened = recover::open_pair(&self.dat_path, &self.idx_path, false)?;
        let dat_r = File::open(&self.dat_path).map_err(Error::OpenData)?;
        let idx_r = File::open(&self.idx_path).map_err(Error::OpenIndex)?;
        *writer = WritePair {
            dat: opened.dat,
            idx: opened.idx,
        };
        *files = ReadPair {
            dat: dat_r,
            idx: idx_r,
        };
        *self.state.lock().unwrap() = opened.state;
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // Best effort; a poisoned lock means a writer panicked mid-operation
        // and the next open will recover from disk anyway.
        if let Ok(writer) = self.writer.lock() {
            if let Err(err) = writer.dat.sync_data() {
                warn!("failed to sync dat file on drop: {err}");
            }
            if let Err(err) = writer.idx.sync_data() {
                warn!("failed to sync idx file on drop: {err}");
            }
        }
    }
}

/// Validates a store name: 1..=32 characters from `[A-Za-z0-9_]`.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= NAME_MAX_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Milliseconds since the Unix epoch, 0 if the clock is unavailable.
fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Offset of the index record for `seqnum` within the index file.
fn idx_pos(first_seqnum: u64, seqnum: u64) -> u64 {
    debug_assert!(first_seqnum > 0 && first_seqnum <= seqnum);
    IDX_HEADER_SIZE as u64 + (seqnum - first_seqnum) * IDX_RECORD_SIZE as u64
}

/// Validates one entry against the current state and writes its data record
/// and index record, updating the local state copy.
fn append_one(writer: &mut WritePair, state: &mut State, entry: &mut Entry) -> Result<()> {
    if entry.seqnum == 0 {
        entry.seqnum = state.last_seqnum + 1;
    } else if state.last_seqnum != 0 && entry.seqnum != state.last_seqnum + 1 {
        return Err(Error::EntrySeqnum {
            expected: state.last_seqnum + 1,
            got: entry.seqnum,
        });
    }
    if entry.timestamp == 0 {
        entry.timestamp = wall_clock_millis().max(state.last_timestamp);
    } else if entry.timestamp < state.last_timestamp {
        return Err(Error::EntryTimestamp {
            last: state.last_timestamp,
            got: entry.timestamp,
        });
    }

    let mut record = DatRecord {
        seqnum: entry.seqnum,
        timestamp: entry.timestamp,
        metadata_len: entry.metadata().len() as u32,
        data_len: entry.data().len() as u32,
        checksum: 0,
    };
    let mut hasher = record.checksum_seed();
    hasher.update(entry.metadata());
    hasher.update(entry.data());
    record.checksum = hasher.finalize();

    // One contiguous write keeps the torn-tail window small.
    let mut buf = Vec::with_capacity(record.disk_len() as usize);
    buf.extend_from_slice(&record.to_bytes());
    buf.extend_from_slice(entry.metadata());
    buf.extend_from_slice(entry.data());
    writer
        .dat
        .write_all_at(&buf, state.dat_end)
        .map_err(Error::WriteData)?;

    let record_idx = IdxRecord {
        seqnum: entry.seqnum,
        timestamp: entry.timestamp,
        pos: state.dat_end,
    };

    if state.first_seqnum == 0 {
        state.first_seqnum = entry.seqnum;
        state.first_timestamp = entry.timestamp;
    }
    state.last_seqnum = entry.seqnum;
    state.last_timestamp = entry.timestamp;
    state.dat_end += record.disk_len();

    writer
        .idx
        .write_all_at(
            &record_idx.to_bytes(),
            idx_pos(state.first_seqnum, record_idx.seqnum),
        )
        .map_err(Error::WriteIndex)?;

    Ok(())
}

/// Reads the index record for `seqnum`.
///
/// The record for `first_seqnum` is synthesised from the cached state (its
/// offset is always just past the data header), saving an index read.
pub(crate) fn read_idx_record(idx: &File, state: &State, seqnum: u64) -> Result<IdxRecord> {
    debug_assert!(seqnum > 0);
    debug_assert!(state.first_seqnum <= seqnum && seqnum <= state.last_seqnum);

    if seqnum == state.first_seqnum {
        return Ok(IdxRecord {
            seqnum,
            timestamp: state.first_timestamp,
            pos: DAT_HEADER_SIZE as u64,
        });
    }

    let record = read_idx_record_at(idx, idx_pos(state.first_seqnum, seqnum))?;
    if record.seqnum != seqnum {
        return Err(Error::FormatIndex("index record seqnum mismatch"));
    }
    Ok(record)
}

/// Reads the index record stored at byte offset `pos`.
pub(crate) fn read_idx_record_at(idx: &File, pos: u64) -> Result<IdxRecord> {
    let mut buf = [0u8; IDX_RECORD_SIZE];
    idx.read_exact_at(&mut buf, pos).map_err(Error::ReadIndex)?;
    Ok(IdxRecord::from_bytes(&buf))
}

/// Reads the data record header stored at byte offset `pos`.
pub(crate) fn read_dat_record_at(dat: &File, pos: u64) -> Result<DatRecord> {
    let mut buf = [0u8; DAT_RECORD_SIZE];
    dat.read_exact_at(&mut buf, pos).map_err(Error::ReadData)?;
    Ok(DatRecord::from_bytes(&buf))
}

/// Verifies the checksum of the record whose payload starts at `payload_pos`
/// by streaming the payload bytes from the file.
pub(crate) fn verify_record_checksum(dat: &File, payload_pos: u64, record: &DatRecord) -> Result<()> {
    let mut hasher = record.checksum_seed();
    fsutil::crc_range(dat, payload_pos, record.payload_len(), &mut hasher)
        .map_err(Error::ReadData)?;
    let actual = hasher.finalize();
    if actual != record.checksum {
        return Err(Error::Checksum {
            expected: record.checksum,
            actual,
        });
    }
    Ok(())
}

/// Reads the full record (header, metadata, data) at `pos` into `entry`,
/// verifying its checksum.
fn read_entry_at(dat: &File, state: &State, pos: u64, entry: &mut Entry) -> Result<()> {
    let record = read_dat_record_at(dat, pos)?;
    if record.seqnum < state.first_seqnum || state.last_seqnum < record.seqnum {
        return Err(Error::FormatData("record seqnum outside stored range"));
    }

    let (metadata, data) = entry.reset(record.metadata_len, record.data_len);
    let body = pos + DAT_RECORD_SIZE as u64;
    if !metadata.is_empty() {
        dat.read_exact_at(metadata, body).map_err(Error::ReadData)?;
    }
    if !data.is_empty() {
        dat.read_exact_at(data, body + record.metadata_len as u64)
            .map_err(Error::ReadData)?;
    }

    let mut hasher = record.checksum_seed();
    hasher.update(entry.metadata());
    hasher.update(entry.data());
    let actual = hasher.finalize();
    if actual != record.checksum {
        return Err(Error::Checksum {
            expected: record.checksum,
            actual,
        });
    }

    entry.seqnum = record.seqnum;
    entry.timestamp = record.timestamp;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("test"));
        assert!(is_valid_name("test_1"));
        assert!(is_valid_name("_"));
        assert!(is_valid_name("A"));
        assert!(is_valid_name(&"x".repeat(32)));

        assert!(!is_valid_name(""));
        assert!(!is_valid_name(&"x".repeat(33)));
        assert!(!is_valid_name("with-dash"));
        assert!(!is_valid_name("with space"));
        assert!(!is_valid_name("dotted.name"));
    }

    #[test]
    fn test_entry_single_allocation_layout() {
        let entry = Entry::new(b"1234567", b"abcdefghijk");
        assert_eq!(entry.metadata(), b"1234567");
        assert_eq!(entry.data(), b"abcdefghijk");
        // data starts at the metadata length rounded up to the word size
        let base = entry.buf.as_ptr() as usize;
        let data = entry.data().as_ptr() as usize;
        assert_eq!(data - base, 8);
    }

    #[test]
    fn test_entry_buffer_reuse_when_smaller() {
        let mut entry = Entry::new(b"1234567", b"abcdefghijk");
        let cap = entry.buf.capacity();
        let (m, d) = entry.reset(2, 5);
        m.copy_from_slice(b"mm");
        d.copy_from_slice(b"ddddd");
        assert_eq!(entry.buf.capacity(), cap);
        assert_eq!(entry.metadata(), b"mm");
        assert_eq!(entry.data(), b"ddddd");
    }

    #[test]
    fn test_entry_empty_slices() {
        let entry = Entry::new(b"", b"");
        assert!(entry.metadata().is_empty());
        assert!(entry.data().is_empty());

        let meta_only = Entry::new(b"abc", b"");
        assert_eq!(meta_only.metadata(), b"abc");
        assert!(meta_only.data().is_empty());
        assert_eq!(meta_only.buf.len(), 3);

        let data_only = Entry::new(b"", b"xyz");
        assert!(data_only.metadata().is_empty());
        assert_eq!(data_only.data(), b"xyz");
    }

    #[test]
    fn test_entry_logical_equality() {
        let a = Entry::with_ids(1, 2, b"m", b"d");
        let mut b = Entry::with_ids(1, 2, b"ignored", b"ignored");
        let (m, d) = b.reset(1, 1);
        m.copy_from_slice(b"m");
        d.copy_from_slice(b"d");
        assert_eq!(a, b);
    }

    #[test]
    fn test_idx_pos() {
        assert_eq!(idx_pos(10, 10), IDX_HEADER_SIZE as u64);
        assert_eq!(
            idx_pos(10, 13),
            IDX_HEADER_SIZE as u64 + 3 * IDX_RECORD_SIZE as u64
        );
    }
}
