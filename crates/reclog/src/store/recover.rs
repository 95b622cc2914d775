//! Open-time validation and repair of the file pair.
//!
//! Opening a store must cope with every state a crash can leave behind: a
//! torn data tail, an index flushed later than the data (or not at all), a
//! half-erased rollback, or a missing/corrupt index file. The protocol:
//!
//! 1. create whichever files are missing (removing a stray index when the
//!    data file is gone);
//! 2. validate the data file header and first record, erasing a torn,
//!    erased or checksum-corrupt first record and opening the store empty;
//!    with `check`, walk and verify every record;
//! 3. validate the index header and first record against the data file;
//!    with `check`, cross-validate every index record, otherwise locate the
//!    last live index record by scanning backwards from the end;
//! 4. erase the index tail, re-add the first record if the index is bare,
//!    then walk data records beyond the last indexed one (written but never
//!    indexed before a crash) and index them, erasing any torn data tail;
//! 5. on any index-level error, delete the index file and rerun step 4's
//!    logic against a freshly created index: the index is derived data and
//!    can always be rebuilt from a valid data file. A failing rebuild is
//!    fatal.
//!
//! Violations that cannot be explained by a crash (broken seqnum sequence,
//! decreasing timestamps, a checksum mismatch on a fully present record
//! beyond the first) are reported, not repaired.

use crate::error::{Error, Result};
use crate::format::{
    DatHeader, DatRecord, IdxHeader, IdxRecord, DAT_HEADER_SIZE, DAT_RECORD_SIZE, IDX_HEADER_SIZE,
    IDX_RECORD_SIZE,
};
use crate::fsutil;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::{debug, warn};

use super::{read_dat_record_at, read_idx_record_at, verify_record_checksum, State};

/// Result of a successful open: the two read-write handles and the
/// recovered state.
#[derive(Debug)]
pub(crate) struct Opened {
    pub dat: File,
    pub idx: File,
    pub state: State,
}

/// Opens and validates the file pair, creating and repairing as needed.
pub(crate) fn open_pair(dat_path: &Path, idx_path: &Path, check: bool) -> Result<Opened> {
    ensure_files(dat_path, idx_path)?;

    let dat = open_rw(dat_path).map_err(Error::OpenData)?;
    let scan = open_dat(&dat, check)?;

    match open_idx_phase(&dat, idx_path, &scan, check) {
        Ok((idx, state)) => Ok(Opened { dat, idx, state }),
        Err(err) if idx_recoverable(&err) => {
            warn!("index file unusable ({err}), rebuilding from data file");
            let _ = fs::remove_file(idx_path);
            create_idx(idx_path)?;
            let (idx, state) = open_idx_phase(&dat, idx_path, &scan, check)?;
            Ok(Opened { dat, idx, state })
        }
        Err(err) => Err(err),
    }
}

/// Creates a fresh data file containing only its header.
pub(crate) fn create_dat(path: &Path, milestone: u64) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(Error::OpenData)?;
    file.write_all(&DatHeader::new(milestone).to_bytes())
        .map_err(Error::OpenData)
}

/// Creates a fresh index file containing only its header.
pub(crate) fn create_idx(path: &Path) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(Error::OpenIndex)?;
    file.write_all(&IdxHeader::new().to_bytes())
        .map_err(Error::OpenIndex)
}

fn open_rw(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

/// Index-level failures are repaired by deleting and rebuilding the index;
/// anything else (data corruption, checksum mismatch) is surfaced.
fn idx_recoverable(err: &Error) -> bool {
    matches!(
        err,
        Error::OpenIndex(_) | Error::ReadIndex(_) | Error::WriteIndex(_) | Error::FormatIndex(_)
    )
}

fn open_idx_phase(dat: &File, idx_path: &Path, scan: &DatScan, check: bool) -> Result<(File, State)> {
    let idx = open_rw(idx_path).map_err(Error::OpenIndex)?;
    let state = open_idx(dat, &idx, scan, check)?;
    Ok((idx, state))
}

/// Materialises missing files. A stray index without its data file is
/// removed: it indexes nothing.
fn ensure_files(dat_path: &Path, idx_path: &Path) -> Result<()> {
    if !dat_path.exists() {
        match fs::remove_file(idx_path) {
            Ok(()) => debug!("removed stray index file"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(Error::OpenIndex(err)),
        }
        create_dat(dat_path, 0)?;
    }
    if !idx_path.exists() {
        create_idx(idx_path)?;
    }
    Ok(())
}

/// What the data-file pass learned. `last_*` only reflect the full file
/// after a `check` walk; the index pass derives the final values either way.
struct DatScan {
    format: u32,
    milestone: u64,
    first_seqnum: u64,
    first_timestamp: u64,
    last_seqnum: u64,
    last_timestamp: u64,
}

/// Validates the data file header and first record; with `check`, walks and
/// verifies every record and erases a torn tail.
fn open_dat(dat: &File, check: bool) -> Result<DatScan> {
    let len = fsutil::file_len(dat).map_err(Error::ReadData)?;

    let mut header_buf = [0u8; DAT_HEADER_SIZE];
    dat.read_exact_at(&mut header_buf, 0)
        .map_err(|_| Error::FormatData("file shorter than header"))?;
    let header = DatHeader::from_bytes(&header_buf)?;

    let mut pos = DAT_HEADER_SIZE as u64;
    let mut first = DatRecord::default();

    if pos == len {
        // freshly created store, nothing after the header
    } else if pos + DAT_RECORD_SIZE as u64 > len {
        // not even room for a record header: torn first write
        fsutil::zeroize_from(dat, pos).map_err(Error::WriteData)?;
    } else {
        let record = read_dat_record_at(dat, pos)?;
        if record.seqnum == 0 || pos + record.disk_len() > len {
            // erased (rolled back to empty) or incomplete first record
            fsutil::zeroize_from(dat, pos).map_err(Error::WriteData)?;
        } else {
            match verify_record_checksum(dat, pos + DAT_RECORD_SIZE as u64, &record) {
                Ok(()) => {
                    pos += record.disk_len();
                    first = record;
                }
                Err(Error::Checksum { .. }) => {
                    // a torn first write; erase it and open empty
                    warn!("first record fails its checksum, treating store as empty");
                    fsutil::zeroize_from(dat, pos).map_err(Error::WriteData)?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    let mut scan = DatScan {
        format: header.format,
        milestone: header.milestone,
        first_seqnum: first.seqnum,
        first_timestamp: first.timestamp,
        last_seqnum: first.seqnum,
        last_timestamp: first.timestamp,
    };

    if !check {
        return Ok(scan);
    }

    while pos + DAT_RECORD_SIZE as u64 <= len {
        let record = read_dat_record_at(dat, pos)?;
        if record.seqnum == 0 || scan.first_seqnum == 0 {
            // erased space after a rollback
            break;
        }
        if record.seqnum != scan.last_seqnum + 1 {
            return Err(Error::FormatData("broken record sequence"));
        }
        if record.timestamp < scan.last_timestamp {
            return Err(Error::FormatData("decreasing timestamp"));
        }
        if pos + record.disk_len() > len {
            warn!(offset = pos, "zeroising torn data record");
            break;
        }
        verify_record_checksum(dat, pos + DAT_RECORD_SIZE as u64, &record)?;
        pos += record.disk_len();
        scan.last_seqnum = record.seqnum;
        scan.last_timestamp = record.timestamp;
    }

    fsutil::zeroize_from(dat, pos).map_err(Error::WriteData)?;
    Ok(scan)
}

/// Validates the index against the data file, erases its tail, and indexes
/// any trailing data records the index never saw. Returns the final state.
fn open_idx(dat: &File, idx: &File, scan: &DatScan, check: bool) -> Result<State> {
    let len = fsutil::file_len(idx).map_err(Error::ReadIndex)?;

    let mut header_buf = [0u8; IDX_HEADER_SIZE];
    idx.read_exact_at(&mut header_buf, 0)
        .map_err(|_| Error::FormatIndex("file shorter than header"))?;
    let header = IdxHeader::from_bytes(&header_buf)?;
    if header.format != scan.format {
        return Err(Error::FormatIndex("format differs from data file"));
    }

    let mut pos = IDX_HEADER_SIZE as u64;
    let mut record_0 = IdxRecord::default();

    if pos + IDX_RECORD_SIZE as u64 <= len {
        record_0 = read_idx_record_at(idx, pos)?;
        pos += IDX_RECORD_SIZE as u64;
        if record_0.seqnum != scan.first_seqnum || record_0.timestamp != scan.first_timestamp {
            return Err(Error::FormatIndex("first index record does not match data file"));
        }
        if record_0.seqnum != 0 && record_0.pos != DAT_HEADER_SIZE as u64 {
            return Err(Error::FormatIndex("first index record has a wrong offset"));
        }
    }

    let mut record_n = record_0;

    if record_0.seqnum == 0 {
        // bare index; rebuilt below if the data file has records
    } else if check {
        let dat_len = fsutil::file_len(dat).map_err(Error::ReadData)?;
        while pos + IDX_RECORD_SIZE as u64 <= len {
            let aux = read_idx_record_at(idx, pos)?;
            if aux.seqnum == 0 {
                break;
            }
            pos += IDX_RECORD_SIZE as u64;
            if aux.seqnum != record_n.seqnum + 1
                || aux.timestamp < record_n.timestamp
                || aux.pos < record_n.pos + DAT_RECORD_SIZE as u64
            {
                return Err(Error::FormatIndex("index records do not ascend"));
            }
            if aux.pos + DAT_RECORD_SIZE as u64 > dat_len {
                return Err(Error::FormatIndex("index record points past end of data"));
            }
            let record_dat = read_dat_record_at(dat, aux.pos)?;
            if aux.seqnum != record_dat.seqnum || aux.timestamp != record_dat.timestamp {
                return Err(Error::FormatIndex("index record does not match data record"));
            }
            verify_record_checksum(dat, aux.pos + DAT_RECORD_SIZE as u64, &record_dat)?;
            record_n = aux;
        }
    } else {
        // Fast path: back off a partial trailing record, then scan
        // backwards for the last record not erased by a rollback.
        let rem = (len - IDX_HEADER_SIZE as u64) % IDX_RECORD_SIZE as u64;
        pos = len - rem;
        while pos > IDX_HEADER_SIZE as u64 {
            let record = read_idx_record_at(idx, pos - IDX_RECORD_SIZE as u64)?;
            if record.seqnum != 0 {
                record_n = record;
                break;
            }
            pos -= IDX_RECORD_SIZE as u64;
        }
    }

    // pos sits just after the last live record; erase whatever follows.
    fsutil::zeroize_from(idx, pos).map_err(Error::WriteIndex)?;

    let mut state = State {
        first_seqnum: scan.first_seqnum,
        first_timestamp: scan.first_timestamp,
        last_seqnum: 0,
        last_timestamp: 0,
        milestone: scan.milestone,
        dat_end: DAT_HEADER_SIZE as u64,
    };

    if record_0.seqnum == 0 {
        if scan.first_seqnum != 0 {
            // the index lost all its records; re-add the first one
            record_0 = IdxRecord {
                seqnum: scan.first_seqnum,
                timestamp: scan.first_timestamp,
                pos: DAT_HEADER_SIZE as u64,
            };
            state.last_seqnum = scan.first_seqnum;
            state.last_timestamp = scan.first_timestamp;
            append_idx_record(idx, &state, &record_0)?;
            record_n = record_0;
        }
    } else {
        if record_n.seqnum < record_0.seqnum || record_n.timestamp < record_0.timestamp {
            return Err(Error::FormatIndex("last index record below the first"));
        }
        let diff = record_n.seqnum - record_0.seqnum;
        if pos != IDX_HEADER_SIZE as u64 + (diff + 1) * IDX_RECORD_SIZE as u64 {
            return Err(Error::FormatIndex("index length does not match record span"));
        }
        if record_n.pos < DAT_HEADER_SIZE as u64 + diff * DAT_RECORD_SIZE as u64 {
            return Err(Error::FormatIndex("last index record offset too low"));
        }
        state.last_seqnum = record_n.seqnum;
        state.last_timestamp = record_n.timestamp;
    }

    if scan.first_seqnum == 0 {
        return Ok(state);
    }

    // Verify the last indexed data record and derive the data end offset.
    let dat_len = fsutil::file_len(dat).map_err(Error::ReadData)?;
    let mut pos_dat = record_n.pos;
    if pos_dat + DAT_RECORD_SIZE as u64 > dat_len {
        return Err(Error::FormatIndex("last index record points past end of data"));
    }
    let record_dat = read_dat_record_at(dat, pos_dat)?;
    pos_dat += DAT_RECORD_SIZE as u64;
    if record_dat.seqnum != record_n.seqnum || record_dat.timestamp != record_n.timestamp {
        return Err(Error::FormatIndex("last index record does not match data record"));
    }
    if pos_dat + record_dat.payload_len() > dat_len {
        return Err(Error::FormatIndex("last data record is truncated"));
    }
    verify_record_checksum(dat, pos_dat, &record_dat)?;
    pos_dat += record_dat.payload_len();
    state.dat_end = pos_dat;

    // Index data records written after the last index flush (a crash
    // between the data write and the index write leaves exactly this).
    while pos_dat + DAT_RECORD_SIZE as u64 <= dat_len {
        let record = read_dat_record_at(dat, pos_dat)?;
        if record.seqnum == 0 {
            break;
        }
        if record.seqnum != state.last_seqnum + 1 {
            return Err(Error::FormatData("broken record sequence"));
        }
        if record.timestamp < state.last_timestamp {
            return Err(Error::FormatData("decreasing timestamp"));
        }
        if pos_dat + record.disk_len() > dat_len {
            warn!(offset = pos_dat, "zeroising torn data record");
            break;
        }
        verify_record_checksum(dat, pos_dat + DAT_RECORD_SIZE as u64, &record)?;
        let record_idx = IdxRecord {
            seqnum: record.seqnum,
            timestamp: record.timestamp,
            pos: pos_dat,
        };
        state.last_seqnum = record.seqnum;
        state.last_timestamp = record.timestamp;
        pos_dat += record.disk_len();
        state.dat_end = pos_dat;
        append_idx_record(idx, &state, &record_idx)?;
        debug!(seqnum = record.seqnum, "indexed unflushed data record");
    }

    fsutil::zeroize_from(dat, pos_dat).map_err(Error::WriteData)?;
    Ok(state)
}

fn append_idx_record(idx: &File, state: &State, record: &IdxRecord) -> Result<()> {
    debug_assert_eq!(record.seqnum, state.last_seqnum);
    idx.write_all_at(
        &record.to_bytes(),
        super::idx_pos(state.first_seqnum, record.seqnum),
    )
    .map_err(Error::WriteIndex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_pair_creates_files() {
        let dir = TempDir::new().unwrap();
        let dat_path = dir.path().join("log.dat");
        let idx_path = dir.path().join("log.idx");

        let opened = open_pair(&dat_path, &idx_path, true).unwrap();
        assert!(opened.state.is_empty());
        assert_eq!(opened.state.dat_end, DAT_HEADER_SIZE as u64);
        assert_eq!(fsutil::file_len(&opened.dat).unwrap(), DAT_HEADER_SIZE as u64);
        assert_eq!(fsutil::file_len(&opened.idx).unwrap(), IDX_HEADER_SIZE as u64);
    }

    #[test]
    fn test_stray_index_is_removed() {
        let dir = TempDir::new().unwrap();
        let dat_path = dir.path().join("log.dat");
        let idx_path = dir.path().join("log.idx");

        fs::write(&idx_path, b"leftover from a deleted store").unwrap();
        let opened = open_pair(&dat_path, &idx_path, false).unwrap();
        assert!(opened.state.is_empty());
        // the stray file was replaced by a fresh header-only index
        assert_eq!(fsutil::file_len(&opened.idx).unwrap(), IDX_HEADER_SIZE as u64);
    }

    #[test]
    fn test_garbage_data_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let dat_path = dir.path().join("log.dat");
        let idx_path = dir.path().join("log.idx");

        fs::write(&dat_path, vec![0xAB; 200]).unwrap();
        let err = open_pair(&dat_path, &idx_path, false).unwrap_err();
        assert!(matches!(err, Error::FormatData(_)));
    }
}
