//! Low-level file utilities shared by recovery, rollback and purge.
//!
//! Everything here uses positional I/O (`read_at`/`write_at`), so no helper
//! ever moves a file cursor: the reader handles of a store can work the same
//! file concurrently with the writer without seek interference.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

const CHUNK: usize = 8192;

/// Returns the current length of the file in bytes.
pub fn file_len(file: &File) -> io::Result<u64> {
    Ok(file.metadata()?.len())
}

/// Overwrites every byte from `pos` to the end of the file with zero.
///
/// If the range is already all-zero nothing is written, so re-running after
/// a crash is free. Fails if `pos` lies beyond the end of the file.
pub fn zeroize_from(file: &File, pos: u64) -> io::Result<()> {
    let len = file_len(file)?;
    if pos > len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "zeroize offset beyond end of file",
        ));
    }

    // Scan forward for the first non-zero byte.
    let mut buf = [0u8; CHUNK];
    let mut first_nonzero = None;
    let mut cur = pos;
    'scan: while cur < len {
        let n = (len - cur).min(CHUNK as u64) as usize;
        file.read_exact_at(&mut buf[..n], cur)?;
        for (i, byte) in buf[..n].iter().enumerate() {
            if *byte != 0 {
                first_nonzero = Some(cur + i as u64);
                break 'scan;
            }
        }
        cur += n as u64;
    }

    let Some(start) = first_nonzero else {
        return Ok(());
    };

    let zeros = [0u8; CHUNK];
    let mut cur = start;
    while cur < len {
        let n = (len - cur).min(CHUNK as u64) as usize;
        file.write_all_at(&zeros[..n], cur)?;
        cur += n as u64;
    }
    Ok(())
}

/// Copies bytes `[pos0, pos1)` of `src` into `dst` starting at `pos2`.
///
/// Fails without writing anything if the source range is out of bounds, or
/// if `pos2` lies beyond the end of the destination.
pub fn copy_range(src: &File, pos0: u64, pos1: u64, dst: &File, pos2: u64) -> io::Result<()> {
    if pos0 > pos1 || pos1 > file_len(src)? || pos2 > file_len(dst)? {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "copy range out of bounds",
        ));
    }
    if pos0 == pos1 {
        return Ok(());
    }

    let mut buf = [0u8; CHUNK];
    let mut read_pos = pos0;
    let mut write_pos = pos2;
    while read_pos < pos1 {
        let n = (pos1 - read_pos).min(CHUNK as u64) as usize;
        src.read_exact_at(&mut buf[..n], read_pos)?;
        dst.write_all_at(&buf[..n], write_pos)?;
        read_pos += n as u64;
        write_pos += n as u64;
    }
    Ok(())
}

/// Feeds the file bytes `[pos, pos + len)` into `hasher`.
///
/// Used to accumulate a record checksum over payload bytes without
/// materialising the record in memory.
pub fn crc_range(file: &File, pos: u64, len: u64, hasher: &mut crc32fast::Hasher) -> io::Result<()> {
    if len == 0 {
        return Ok(());
    }
    if pos + len > file_len(file)? {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "checksum range beyond end of file",
        ));
    }

    let mut buf = [0u8; CHUNK];
    let mut cur = pos;
    let end = pos + len;
    while cur < end {
        let n = (end - cur).min(CHUNK as u64) as usize;
        file.read_exact_at(&mut buf[..n], cur)?;
        hasher.update(&buf[..n]);
        cur += n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempfile;

    fn file_with(content: &[u8]) -> File {
        let mut file = tempfile().unwrap();
        file.write_all(content).unwrap();
        file
    }

    fn read_all(file: &File) -> Vec<u8> {
        let len = file_len(file).unwrap() as usize;
        let mut buf = vec![0u8; len];
        file.read_exact_at(&mut buf, 0).unwrap();
        buf
    }

    #[test]
    fn test_zeroize_tail() {
        let file = file_with(b"abcdef");
        zeroize_from(&file, 2).unwrap();
        assert_eq!(read_all(&file), b"ab\0\0\0\0");
    }

    #[test]
    fn test_zeroize_noop_when_already_zero() {
        let file = file_with(&[1, 2, 0, 0, 0]);
        zeroize_from(&file, 2).unwrap();
        assert_eq!(read_all(&file), &[1, 2, 0, 0, 0]);
        // offset at end of file is a no-op as well
        zeroize_from(&file, 5).unwrap();
    }

    #[test]
    fn test_zeroize_interior_zeros() {
        // zeros between non-zero bytes must not stop the overwrite
        let file = file_with(&[9, 0, 0, 7, 0, 5]);
        zeroize_from(&file, 1).unwrap();
        assert_eq!(read_all(&file), &[9, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_zeroize_rejects_offset_past_eof() {
        let file = file_with(b"ab");
        assert!(zeroize_from(&file, 3).is_err());
    }

    #[test]
    fn test_copy_range() {
        let src = file_with(b"0123456789");
        let dst = file_with(b"XXXXXX");
        copy_range(&src, 2, 6, &dst, 1).unwrap();
        assert_eq!(read_all(&dst), b"X2345X");
    }

    #[test]
    fn test_copy_range_rejects_bad_bounds() {
        let src = file_with(b"0123");
        let dst = file_with(b"XX");
        assert!(copy_range(&src, 3, 2, &dst, 0).is_err());
        assert!(copy_range(&src, 0, 5, &dst, 0).is_err());
        assert!(copy_range(&src, 0, 2, &dst, 3).is_err());
        // empty range is fine
        copy_range(&src, 2, 2, &dst, 0).unwrap();
        assert_eq!(read_all(&dst), b"XX");
    }

    #[test]
    fn test_crc_range_matches_in_memory_hash() {
        let content = b"the quick brown fox jumps over the lazy dog";
        let file = file_with(content);
        let mut hasher = crc32fast::Hasher::new();
        crc_range(&file, 4, 11, &mut hasher).unwrap();
        assert_eq!(hasher.finalize(), crc32fast::hash(&content[4..15]));
    }

    #[test]
    fn test_crc_range_rejects_overrun() {
        let file = file_with(b"abc");
        let mut hasher = crc32fast::Hasher::new();
        assert!(crc_range(&file, 2, 5, &mut hasher).is_err());
    }
}
