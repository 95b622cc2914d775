//! Timestamp search: bisection over the index with duplicate timestamps.
//!
//! The fixture appends seqnums 20..=314 with `ts = sn - sn % 10`, so every
//! stored timestamp is shared by up to ten consecutive records and the
//! search must resolve ties correctly in both modes.

use proptest::prelude::*;
use reclog::{Entry, Error, SearchMode, Store, StoreConfig};
use tempfile::TempDir;

fn open_store(dir: &TempDir) -> Store {
    Store::open(dir.path(), "test", StoreConfig::default()).unwrap()
}

fn append_range(store: &Store, seqnum1: u64, seqnum2: u64) {
    for sn in seqnum1..=seqnum2 {
        let mut entries = [Entry::with_ids(sn, sn - sn % 10, b"m", b"d")];
        store.append(&mut entries).unwrap();
    }
}

#[test]
fn test_search_lower() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    append_range(&store, 20, 314);

    let lower = |ts| store.search(ts, SearchMode::Lower);
    assert_eq!(lower(0).unwrap(), 20);
    assert_eq!(lower(10).unwrap(), 20);
    assert_eq!(lower(20).unwrap(), 20);
    assert_eq!(lower(25).unwrap(), 30);
    assert_eq!(lower(30).unwrap(), 30);
    assert_eq!(lower(295).unwrap(), 300);
    assert_eq!(lower(300).unwrap(), 300);
    assert_eq!(lower(305).unwrap(), 310);
    assert_eq!(lower(310).unwrap(), 310);
    assert!(matches!(lower(311), Err(Error::NotFound)));
    assert!(matches!(lower(314), Err(Error::NotFound)));
    assert!(matches!(lower(999), Err(Error::NotFound)));
}

#[test]
fn test_search_upper() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    append_range(&store, 20, 314);

    let upper = |ts| store.search(ts, SearchMode::Upper);
    assert_eq!(upper(0).unwrap(), 20);
    assert_eq!(upper(10).unwrap(), 20);
    assert_eq!(upper(20).unwrap(), 30);
    assert_eq!(upper(25).unwrap(), 30);
    assert_eq!(upper(30).unwrap(), 40);
    assert_eq!(upper(295).unwrap(), 300);
    assert_eq!(upper(300).unwrap(), 310);
    assert_eq!(upper(305).unwrap(), 310);
    assert!(matches!(upper(310), Err(Error::NotFound)));
    assert!(matches!(upper(311), Err(Error::NotFound)));
    assert!(matches!(upper(999), Err(Error::NotFound)));
}

#[test]
fn test_search_single_record() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let mut entries = [Entry::with_ids(7, 100, b"m", b"d")];
    store.append(&mut entries).unwrap();

    assert_eq!(store.search(99, SearchMode::Lower).unwrap(), 7);
    assert_eq!(store.search(100, SearchMode::Lower).unwrap(), 7);
    assert!(matches!(
        store.search(101, SearchMode::Lower),
        Err(Error::NotFound)
    ));

    assert_eq!(store.search(99, SearchMode::Upper).unwrap(), 7);
    assert!(matches!(
        store.search(100, SearchMode::Upper),
        Err(Error::NotFound)
    ));
}

#[test]
fn test_search_lower_returns_smallest_duplicate() {
    // A long run of one timestamp: Lower must land on the run's first
    // seqnum regardless of which duplicate the bisection probes.
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    for (sn, ts) in (1..=50).map(|sn| (sn, if sn < 10 { 5 } else { 70 })) {
        let mut entries = [Entry::with_ids(sn, ts, b"m", b"d")];
        store.append(&mut entries).unwrap();
    }

    assert_eq!(store.search(70, SearchMode::Lower).unwrap(), 10);
    assert_eq!(store.search(6, SearchMode::Lower).unwrap(), 10);
    assert_eq!(store.search(5, SearchMode::Upper).unwrap(), 10);
}

/// Reference implementation: linear scan over the appended timestamps.
fn reference_search(timestamps: &[u64], first_seqnum: u64, target: u64, mode: SearchMode) -> Option<u64> {
    let found = match mode {
        SearchMode::Lower => timestamps.iter().position(|ts| *ts >= target),
        SearchMode::Upper => timestamps.iter().position(|ts| *ts > target),
    };
    found.map(|i| first_seqnum + i as u64)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_search_matches_linear_reference(
        increments in prop::collection::vec(0u64..4, 1..120),
        probe_offset in 0u64..500,
    ) {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut timestamps = Vec::with_capacity(increments.len());
        let mut ts = 100u64;
        for inc in &increments {
            ts += inc;
            timestamps.push(ts);
        }

        let first_seqnum = 10u64;
        for (i, ts) in timestamps.iter().enumerate() {
            let mut entries = [Entry::with_ids(first_seqnum + i as u64, *ts, b"", b"x")];
            store.append(&mut entries).unwrap();
        }

        let target = 100 + probe_offset % (timestamps.last().unwrap() - 95);
        for mode in [SearchMode::Lower, SearchMode::Upper] {
            let expected = reference_search(&timestamps, first_seqnum, target, mode);
            match store.search(target, mode) {
                Ok(seqnum) => prop_assert_eq!(Some(seqnum), expected),
                Err(Error::NotFound) => prop_assert_eq!(None, expected),
                Err(err) => panic!("search failed: {err}"),
            }
        }
    }
}
