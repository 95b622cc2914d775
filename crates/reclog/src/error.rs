//! Error and Result types for reclog operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for reclog operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for log store operations.
///
/// The `Display` rendering of each variant is stable across releases and is
/// the human-readable description of the condition (suitable for CLIs and
/// log output).
#[derive(Debug, Error)]
pub enum Error {
    /// The supplied directory does not exist or is not a directory.
    #[error("Invalid directory: {}", .0.display())]
    InvalidPath(PathBuf),

    /// The store name contains characters outside `[A-Za-z0-9_]` or has an
    /// invalid length (1..=32).
    #[error("Invalid store name: {0:?}")]
    InvalidName(String),

    /// An argument failed validation before any state change.
    #[error("Invalid argument: {0}")]
    InvalidArg(&'static str),

    /// Cannot open or create the data file.
    #[error("Cannot open dat file: {0}")]
    OpenData(#[source] io::Error),

    /// Error reading the data file.
    #[error("Error reading dat file: {0}")]
    ReadData(#[source] io::Error),

    /// Error writing to the data file.
    #[error("Error writing to dat file: {0}")]
    WriteData(#[source] io::Error),

    /// Cannot open or create the index file.
    #[error("Cannot open idx file: {0}")]
    OpenIndex(#[source] io::Error),

    /// Error reading the index file.
    #[error("Error reading idx file: {0}")]
    ReadIndex(#[source] io::Error),

    /// Error writing to the index file.
    #[error("Error writing to idx file: {0}")]
    WriteIndex(#[source] io::Error),

    /// The data file is malformed (bad magic, unsupported format, broken
    /// record sequence, decreasing timestamp).
    #[error("Invalid dat file: {0}")]
    FormatData(&'static str),

    /// The index file is malformed or inconsistent with the data file.
    ///
    /// The opener promotes this to an index rebuild; it only surfaces to the
    /// caller when the rebuild itself fails.
    #[error("Invalid idx file: {0}")]
    FormatIndex(&'static str),

    /// An appended entry breaks the sequence of record numbers.
    #[error("Broken sequence: expected seqnum {expected}, got {got}")]
    EntrySeqnum {
        /// The only acceptable seqnum at this position.
        expected: u64,
        /// The seqnum supplied by the caller.
        got: u64,
    },

    /// An appended entry has a timestamp lower than the preceding one.
    #[error("Invalid timestamp: {got} is lower than last timestamp {last}")]
    EntryTimestamp {
        /// Timestamp of the last stored record.
        last: u64,
        /// The timestamp supplied by the caller.
        got: u64,
    },

    /// An appended entry declares metadata bytes it does not carry.
    #[error("Metadata not found")]
    EntryMetadata,

    /// An appended entry declares data bytes it does not carry.
    #[error("Data not found")]
    EntryData,

    /// No matching record. This is an ordinary result of read and search,
    /// not a store failure.
    #[error("No results")]
    NotFound,

    /// Error creating or renaming the temporary file used by purge.
    #[error("Error creating temp file: {0}")]
    TempFile(#[source] io::Error),

    /// A stored record checksum does not match the recomputed value.
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    Checksum {
        /// Checksum stored in the record header.
        expected: u32,
        /// Checksum computed over the record bytes.
        actual: u32,
    },
}

/// Error returned by a partially failed append batch.
///
/// Append is not atomic across a batch: entries are written in order and the
/// records written before the failure are durable after the final flush.
/// `appended` reports how many entries of the batch made it in.
#[derive(Debug, Error)]
#[error("{source} (after appending {appended} entries)")]
pub struct AppendError {
    /// Number of entries durably appended before the failure.
    pub appended: usize,
    /// The underlying failure.
    #[source]
    pub source: Error,
}
