//! Varint and checksum helpers shared by the on-disk formats.
//!
//! Varints are unsigned LEB128: seven payload bits per byte, high bit set on
//! every byte except the last.

use std::io::{self, Read};

use crate::error::{CoreError, Result};

/// Maximum encoded length of a `u64` varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Append `value` to `buf` as a varint.
pub fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Number of bytes `value` occupies as a varint.
pub fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Read a varint from a stream.
///
/// Returns `Ok(None)` on a clean end of stream before the first byte and
/// `Truncated` when the stream ends mid-varint.
pub fn read_varint<R: Read>(reader: &mut R) -> Result<Option<u64>> {
    let mut value = 0u64;
    let mut byte = [0u8; 1];
    for i in 0..MAX_VARINT_LEN {
        match reader.read_exact(&mut byte) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                if i == 0 {
                    return Ok(None);
                }
                return Err(CoreError::Truncated { what: "varint" });
            }
            Err(e) => return Err(CoreError::Io(e)),
        }
        value |= u64::from(byte[0] & 0x7f) << (7 * i);
        if byte[0] & 0x80 == 0 {
            return Ok(Some(value));
        }
    }
    Err(CoreError::VarintOverflow {
        bytes: MAX_VARINT_LEN,
    })
}

/// CRC32 over a sequence of byte slices.
pub fn checksum(parts: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

/// Verify that `expected` matches the CRC32 of `parts`.
pub fn verify_checksum(expected: u32, parts: &[&[u8]]) -> Result<()> {
    let actual = checksum(parts);
    if actual != expected {
        return Err(CoreError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn varint_boundaries() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            put_varint(&mut buf, value);
            assert_eq!(buf.len(), varint_len(value));
            let mut reader = Cursor::new(buf);
            assert_eq!(read_varint(&mut reader).unwrap(), Some(value));
            assert_eq!(reader.position() as usize, varint_len(value));
        }
    }

    #[test]
    fn consecutive_varints_read_in_order() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 300);
        put_varint(&mut buf, 5);
        let mut reader = Cursor::new(buf);
        assert_eq!(read_varint(&mut reader).unwrap(), Some(300));
        assert_eq!(read_varint(&mut reader).unwrap(), Some(5));
        assert_eq!(read_varint(&mut reader).unwrap(), None);
    }

    #[test]
    fn overlong_varint_is_rejected() {
        let mut reader = Cursor::new(vec![0xffu8; 11]);
        assert!(matches!(
            read_varint(&mut reader),
            Err(CoreError::VarintOverflow { .. })
        ));
    }

    #[test]
    fn stream_eof_is_clean_only_at_boundary() {
        let mut empty = Cursor::new(Vec::<u8>::new());
        assert_eq!(read_varint(&mut empty).unwrap(), None);

        let mut torn = Cursor::new(vec![0x80u8]);
        assert!(matches!(
            read_varint(&mut torn),
            Err(CoreError::Truncated { .. })
        ));
    }

    #[test]
    fn checksum_covers_all_parts() {
        let crc = checksum(&[b"abc", b"def"]);
        assert_eq!(crc, checksum(&[b"abcdef"]));
        assert!(verify_checksum(crc, &[b"abcdef"]).is_ok());
        assert!(verify_checksum(crc, &[b"abcdeg"]).is_err());
    }
}
