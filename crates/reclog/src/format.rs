//! On-disk format of the paired data/index files.
//!
//! A store named `<name>` consists of two files in the caller's directory:
//!
//! ```text
//! <name>.dat:
//! ┌────────────────┬──────────┬───────────┬────────┬──────────┬─...─┬────────────┐
//! │ DatHeader 152B │ record₁  │ metadata₁ │ data₁  │ record₂  │     │ zeros..EOF │
//! └────────────────┴──────────┴───────────┴────────┴──────────┴─...─┴────────────┘
//!
//! <name>.idx:
//! ┌────────────────┬──────┬──────┬─...─┬────────────┐
//! │ IdxHeader 144B │ idx₁ │ idx₂ │     │ zeros..EOF │
//! └────────────────┴──────┴──────┴─...─┴────────────┘
//! ```
//!
//! Data records are contiguous: the offset of record *i+1* equals the offset
//! of record *i* plus its on-disk size (header + metadata + data). Index
//! records have a fixed size, so the index record for seqnum `s` lives at
//! `IDX_HEADER_SIZE + (s - first_seqnum) * IDX_RECORD_SIZE` and any record
//! can be located with a single positional read.
//!
//! All integers are encoded little-endian. Every size below is a fixed,
//! documented constant; reserved bytes are written as zero and ignored on
//! read.

use crate::error::{Error, Result};

/// Magic number opening both files.
pub const MAGIC: u64 = 0x211A_BF1A_6264_6C00;

/// Current file format version.
pub const FORMAT_V1: u32 = 1;

/// Length of the human-readable text blob in both headers.
///
/// Kept a multiple of 8 so the fields that follow stay 8-aligned.
pub const TEXT_LEN: usize = 128;

/// Text blob identifying a data file (for `file`-style inspection).
pub const DAT_TEXT: &str = "\nThis is a reclog data file.\nDo not edit it.\n";

/// Text blob identifying an index file.
pub const IDX_TEXT: &str = "\nThis is a reclog index file.\nDo not edit it.\n";

/// Size of the data file header in bytes.
pub const DAT_HEADER_SIZE: usize = 152;

/// Size of the index file header in bytes.
pub const IDX_HEADER_SIZE: usize = 144;

/// Offset of the milestone slot within the data file.
pub const MILESTONE_OFFSET: u64 = 144;

/// Size of a data record header in bytes.
pub const DAT_RECORD_SIZE: usize = 32;

/// Size of an index record in bytes.
pub const IDX_RECORD_SIZE: usize = 24;

fn text_bytes(text: &str) -> [u8; TEXT_LEN] {
    debug_assert!(text.len() <= TEXT_LEN);
    let mut out = [0u8; TEXT_LEN];
    out[..text.len()].copy_from_slice(text.as_bytes());
    out
}

/// Header of the data file (152 bytes).
///
/// Layout: magic (u64), format (u32), 4 reserved bytes, text blob (128
/// bytes), milestone (u64). The milestone is an opaque 8-byte slot updated
/// in place by [`Store::update_milestone`](crate::Store::update_milestone);
/// the engine never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatHeader {
    /// File format version (currently 1).
    pub format: u32,
    /// Opaque milestone value, 0 on creation.
    pub milestone: u64,
}

impl DatHeader {
    /// Creates a header for a new data file.
    pub fn new(milestone: u64) -> Self {
        Self {
            format: FORMAT_V1,
            milestone,
        }
    }

    /// Encodes the header, including magic and text blob.
    pub fn to_bytes(&self) -> [u8; DAT_HEADER_SIZE] {
        let mut buf = [0u8; DAT_HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC.to_le_bytes());
        buf[8..12].copy_from_slice(&self.format.to_le_bytes());
        // 12..16 reserved
        buf[16..144].copy_from_slice(&text_bytes(DAT_TEXT));
        buf[144..152].copy_from_slice(&self.milestone.to_le_bytes());
        buf
    }

    /// Decodes and validates a header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FormatData`] if the magic number or format version
    /// does not match.
    pub fn from_bytes(buf: &[u8; DAT_HEADER_SIZE]) -> Result<Self> {
        if u64::from_le_bytes(buf[0..8].try_into().unwrap()) != MAGIC {
            return Err(Error::FormatData("bad magic number"));
        }
        let format = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if format != FORMAT_V1 {
            return Err(Error::FormatData("unsupported format version"));
        }
        let milestone = u64::from_le_bytes(buf[144..152].try_into().unwrap());
        Ok(Self { format, milestone })
    }
}

/// Header of the index file (144 bytes).
///
/// Same magic, format and text-blob layout as [`DatHeader`], without the
/// milestone slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdxHeader {
    /// File format version (currently 1).
    pub format: u32,
}

impl IdxHeader {
    /// Creates a header for a new index file.
    pub fn new() -> Self {
        Self { format: FORMAT_V1 }
    }

    /// Encodes the header, including magic and text blob.
    pub fn to_bytes(&self) -> [u8; IDX_HEADER_SIZE] {
        let mut buf = [0u8; IDX_HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC.to_le_bytes());
        buf[8..12].copy_from_slice(&self.format.to_le_bytes());
        // 12..16 reserved
        buf[16..144].copy_from_slice(&text_bytes(IDX_TEXT));
        buf
    }

    /// Decodes and validates a header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FormatIndex`] if the magic number or format version
    /// does not match.
    pub fn from_bytes(buf: &[u8; IDX_HEADER_SIZE]) -> Result<Self> {
        if u64::from_le_bytes(buf[0..8].try_into().unwrap()) != MAGIC {
            return Err(Error::FormatIndex("bad magic number"));
        }
        let format = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if format != FORMAT_V1 {
            return Err(Error::FormatIndex("unsupported format version"));
        }
        Ok(Self { format })
    }
}

impl Default for IdxHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed header preceding every data record (32 bytes).
///
/// Layout: seqnum (u64), timestamp (u64), metadata_len (u32), data_len
/// (u32), checksum (u32), 4 reserved bytes. The metadata and data bytes
/// follow immediately after the header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DatRecord {
    /// Record sequence number (> 0 for live records, 0 marks erased space).
    pub seqnum: u64,
    /// Record timestamp.
    pub timestamp: u64,
    /// Length of the metadata bytes following the header.
    pub metadata_len: u32,
    /// Length of the data bytes following the metadata.
    pub data_len: u32,
    /// CRC-32 over seqnum, timestamp, metadata_len, data_len (little-endian
    /// encoding), then the metadata bytes, then the data bytes.
    pub checksum: u32,
}

impl DatRecord {
    /// Length of the payload (metadata + data) following the header.
    pub fn payload_len(&self) -> u64 {
        self.metadata_len as u64 + self.data_len as u64
    }

    /// Total on-disk size of the record (header + payload).
    pub fn disk_len(&self) -> u64 {
        DAT_RECORD_SIZE as u64 + self.payload_len()
    }

    /// Returns a hasher primed with the checksummed header fields.
    ///
    /// Feed the metadata bytes and then the data bytes (in any number of
    /// chunks) and finalize to obtain the record checksum. The checksum and
    /// reserved fields are not part of the covered input.
    pub fn checksum_seed(&self) -> crc32fast::Hasher {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.seqnum.to_le_bytes());
        hasher.update(&self.timestamp.to_le_bytes());
        hasher.update(&self.metadata_len.to_le_bytes());
        hasher.update(&self.data_len.to_le_bytes());
        hasher
    }

    /// Encodes the record header.
    pub fn to_bytes(&self) -> [u8; DAT_RECORD_SIZE] {
        let mut buf = [0u8; DAT_RECORD_SIZE];
        buf[0..8].copy_from_slice(&self.seqnum.to_le_bytes());
        buf[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[16..20].copy_from_slice(&self.metadata_len.to_le_bytes());
        buf[20..24].copy_from_slice(&self.data_len.to_le_bytes());
        buf[24..28].copy_from_slice(&self.checksum.to_le_bytes());
        // 28..32 reserved
        buf
    }

    /// Decodes a record header. Field validation is left to the caller,
    /// which knows whether a zeroed record is legitimate (erased space) or
    /// a corruption.
    pub fn from_bytes(buf: &[u8; DAT_RECORD_SIZE]) -> Self {
        Self {
            seqnum: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            timestamp: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            metadata_len: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            data_len: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            checksum: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
        }
    }
}

/// A fixed-size index record (24 bytes).
///
/// Layout: seqnum (u64), timestamp (u64), offset of the matching data
/// record within the data file (u64). A zeroed index record marks erased
/// space (rollback) or the not-yet-written tail.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IdxRecord {
    /// Sequence number of the referenced data record.
    pub seqnum: u64,
    /// Timestamp of the referenced data record.
    pub timestamp: u64,
    /// Byte offset of the data record within the data file.
    pub pos: u64,
}

impl IdxRecord {
    /// Encodes the index record.
    pub fn to_bytes(&self) -> [u8; IDX_RECORD_SIZE] {
        let mut buf = [0u8; IDX_RECORD_SIZE];
        buf[0..8].copy_from_slice(&self.seqnum.to_le_bytes());
        buf[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[16..24].copy_from_slice(&self.pos.to_le_bytes());
        buf
    }

    /// Decodes an index record.
    pub fn from_bytes(buf: &[u8; IDX_RECORD_SIZE]) -> Self {
        Self {
            seqnum: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            timestamp: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            pos: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        }
    }
}
