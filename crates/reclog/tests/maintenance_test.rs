//! Rollback (trim suffix) and purge (trim prefix) behaviour.

use reclog::{Entry, Error, Store, StoreConfig};
use tempfile::TempDir;

fn open_store(dir: &TempDir) -> Store {
    Store::open(dir.path(), "test", StoreConfig::default()).unwrap()
}

fn append_range(store: &Store, seqnum1: u64, seqnum2: u64) {
    for sn in seqnum1..=seqnum2 {
        let metadata = format!("metadata-{sn}");
        let data = format!("data-{sn}");
        let mut entries = [Entry::with_ids(
            sn,
            sn - sn % 10,
            metadata.as_bytes(),
            data.as_bytes(),
        )];
        store.append(&mut entries).unwrap();
    }
}

#[test]
fn test_rollback_nominal() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    assert_eq!(store.rollback(0).unwrap(), 0);
    assert_eq!(store.rollback(1).unwrap(), 0);

    append_range(&store, 20, 314);
    let mut end = store.state().dat_end;

    // nothing above the threshold
    assert_eq!(store.rollback(400).unwrap(), 0);
    assert_eq!(store.rollback(314).unwrap(), 0);
    assert_eq!(store.state().last_seqnum, 314);
    assert_eq!(store.state().dat_end, end);

    assert_eq!(store.rollback(313).unwrap(), 1);
    let state = store.state();
    assert_eq!(state.first_seqnum, 20);
    assert_eq!(state.last_seqnum, 313);
    assert_eq!(state.last_timestamp, 310);
    assert!(state.dat_end < end);
    end = state.dat_end;

    assert_eq!(store.rollback(100).unwrap(), 213);
    let state = store.state();
    assert_eq!(state.last_seqnum, 100);
    assert_eq!(state.last_timestamp, 100);
    assert!(state.dat_end < end);
    end = state.dat_end;

    assert_eq!(store.rollback(20).unwrap(), 80);
    let state = store.state();
    assert_eq!(state.first_seqnum, 20);
    assert_eq!(state.last_seqnum, 20);
    assert!(state.dat_end < end);
    end = state.dat_end;

    // threshold below the first record empties the store
    assert_eq!(store.rollback(0).unwrap(), 1);
    let state = store.state();
    assert!(state.is_empty());
    assert_eq!(state.last_seqnum, 0);
    assert!(state.dat_end < end);
}

#[test]
fn test_rollback_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    append_range(&store, 11, 60);

    assert_eq!(store.rollback(40).unwrap(), 20);
    assert_eq!(store.rollback(40).unwrap(), 0);
    assert_eq!(store.state().last_seqnum, 40);
}

#[test]
fn test_rollback_then_append_continues_sequence() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    append_range(&store, 11, 20);

    store.rollback(15).unwrap();
    let mut entries = [Entry::new(b"", b"fresh")];
    store.append(&mut entries).unwrap();
    assert_eq!(entries[0].seqnum, 16);
    assert_eq!(store.read_one(16).unwrap().data(), b"fresh");
    assert!(matches!(store.read_one(17), Err(Error::NotFound)));
}

#[test]
fn test_purge_empty_and_noop() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    assert_eq!(store.purge(10).unwrap(), 0);

    append_range(&store, 20, 314);
    // nothing below the threshold
    assert_eq!(store.purge(10).unwrap(), 0);
    assert_eq!(store.purge(20).unwrap(), 0);
    let state = store.state();
    assert_eq!(state.first_seqnum, 20);
    assert_eq!(state.last_seqnum, 314);
}

#[test]
fn test_purge_nominal() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    append_range(&store, 20, 314);

    assert_eq!(store.purge(100).unwrap(), 80);
    let state = store.state();
    assert_eq!(state.first_seqnum, 100);
    assert_eq!(state.last_seqnum, 314);

    // retained records kept their contents
    let entry = store.read_one(100).unwrap();
    assert_eq!(entry.timestamp, 100);
    assert_eq!(entry.metadata(), b"metadata-100");
    assert_eq!(entry.data(), b"data-100");
    assert!(matches!(store.read_one(99), Err(Error::NotFound)));

    // appending continues the surviving sequence
    let mut entries = [Entry::new(b"", b"tail")];
    store.append(&mut entries).unwrap();
    assert_eq!(entries[0].seqnum, 315);
}

#[test]
fn test_purge_all() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    append_range(&store, 20, 314);

    assert_eq!(store.purge(1000).unwrap(), 295);
    let state = store.state();
    assert!(state.is_empty());
    assert_eq!(state.last_seqnum, 0);

    // the emptied store accepts a fresh sequence
    let mut entries = [Entry::with_ids(500, 1, b"", b"restart")];
    store.append(&mut entries).unwrap();
    assert_eq!(store.state().first_seqnum, 500);
}

#[test]
fn test_purge_preserves_milestone() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    append_range(&store, 11, 40);
    store.update_milestone(25).unwrap();

    store.purge(20).unwrap();
    assert_eq!(store.milestone(), 25);

    store.purge(1000).unwrap();
    assert_eq!(store.milestone(), 25);
    drop(store);

    let store = open_store(&dir);
    assert_eq!(store.milestone(), 25);
}

#[test]
fn test_purge_rejects_leftover_tmp_file() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    append_range(&store, 11, 30);

    std::fs::write(dir.path().join("test.tmp"), b"leftover").unwrap();
    assert!(matches!(store.purge(20), Err(Error::TempFile(_))));
}
