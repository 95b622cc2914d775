//! reclog - an embeddable append-only record log.
//!
//! Records carry a strictly increasing sequence number (`seqnum`), a
//! monotonically non-decreasing `timestamp`, and two opaque byte strings
//! (metadata and data). The store is optimised for callers that write far
//! more than they read (journals, write-ahead logs, the log layer of a
//! consensus implementation) and that need crash tolerance with a minimal
//! resident footprint: the whole in-memory state is a handful of integers,
//! and every lookup is a couple of positional file reads.
//!
//! # Components
//!
//! - [`Store`]: the record store itself (a `<name>.dat` / `<name>.idx` file
//!   pair under a caller-supplied directory)
//! - [`Entry`]: a logical record with a single-allocation payload buffer
//! - [`format`]: the on-disk layouts and checksum definition
//!
//! # Example
//!
//! ```rust,ignore
//! use reclog::{Entry, SearchMode, Store, StoreConfig};
//!
//! let store = Store::open("/var/lib/myapp", "journal", StoreConfig::default())?;
//!
//! // Append entries; seqnum and timestamp are assigned when zero.
//! let mut entries = vec![Entry::new(b"meta", b"payload")];
//! store.append(&mut entries)?;
//!
//! // Point reads by seqnum, bisection by timestamp.
//! let entry = store.read_one(entries[0].seqnum)?;
//! let seqnum = store.search(entry.timestamp, SearchMode::Lower)?;
//!
//! // Trim the suffix (undo) or the prefix (retention).
//! store.rollback(entry.seqnum)?;
//! store.purge(entry.seqnum)?;
//! ```
//!
//! # Crash tolerance
//!
//! Appends go to the data file before the index, so the index never points
//! at bytes that do not exist. On open the store validates both files and
//! repairs what a crash can have left behind: torn tails are erased, data
//! records missing from the index are re-indexed, and a missing or corrupt
//! index file is rebuilt from the data file. See [`store`] for the
//! single-writer / multi-reader locking discipline.

#![deny(missing_docs)]

pub mod error;
pub mod format;
mod fsutil;
pub mod store;

pub use error::{AppendError, Error, Result};
pub use store::{Entry, SearchMode, State, Stats, Store, StoreConfig, SyncMode};

/// Crate version (semantic version, e.g. `0.1.0`).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
