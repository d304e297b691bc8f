//! Segment file header.

use byteorder::{LittleEndian, ReadBytesExt};
use causal_core::codec::{checksum, verify_checksum};
use std::io::{self, Read};
use std::path::Path;

use crate::error::{ClusterError, ClusterResult};

/// Magic bytes opening every segment file.
pub const SEGMENT_MAGIC: &[u8; 4] = b"CCRL";

/// Current segment format version.
pub const FORMAT_VERSION: u8 = 1;

/// Encoded header size: magic, version, ordinal, prev index, prev term, crc.
pub const HEADER_SIZE: usize = 4 + 1 + 8 + 8 + 8 + 4; // 33 bytes

/// Fixed header at the start of each segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Format version the segment was written with.
    pub version: u8,
    /// Ordinal of the segment; also encoded in its file name.
    pub ordinal: u64,
    /// Index of the entry preceding this segment's first entry.
    pub prev_index: u64,
    /// Term of the entry preceding this segment's first entry.
    pub prev_term: u64,
}

impl SegmentHeader {
    /// Header for a new segment.
    pub fn new(ordinal: u64, prev_index: u64, prev_term: u64) -> Self {
        Self {
            version: FORMAT_VERSION,
            ordinal,
            prev_index,
            prev_term,
        }
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(SEGMENT_MAGIC);
        buf.push(self.version);
        buf.extend_from_slice(&self.ordinal.to_le_bytes());
        buf.extend_from_slice(&self.prev_index.to_le_bytes());
        buf.extend_from_slice(&self.prev_term.to_le_bytes());
        let crc = checksum(&[&buf]);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Read and verify a header. Any mismatch is reported as corruption of
    /// `path`.
    pub fn read_from<R: Read>(r: &mut R, path: &Path) -> ClusterResult<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        r.read_exact(&mut buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                ClusterError::corruption(path, "segment shorter than its header")
            } else {
                ClusterError::Io(e)
            }
        })?;

        if &buf[..4] != SEGMENT_MAGIC {
            return Err(ClusterError::corruption(path, "bad segment magic"));
        }

        let body = &buf[..HEADER_SIZE - 4];
        let mut cursor = &buf[4..];
        let version = cursor.read_u8()?;
        let ordinal = cursor.read_u64::<LittleEndian>()?;
        let prev_index = cursor.read_u64::<LittleEndian>()?;
        let prev_term = cursor.read_u64::<LittleEndian>()?;
        let stored_crc = cursor.read_u32::<LittleEndian>()?;

        verify_checksum(stored_crc, &[body])
            .map_err(|e| ClusterError::corruption(path, format!("header: {e}")))?;

        if version != FORMAT_VERSION {
            return Err(ClusterError::corruption(
                path,
                format!("unsupported segment version {version}"),
            ));
        }

        Ok(Self {
            version,
            ordinal,
            prev_index,
            prev_term,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_fixed_size() {
        let header = SegmentHeader::new(7, 120, 3);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        let parsed = SegmentHeader::read_from(&mut &bytes[..], Path::new("seg")).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn flipped_bit_is_corruption() {
        let mut bytes = SegmentHeader::new(1, 0, 0).to_bytes();
        bytes[10] ^= 0x01;
        let err = SegmentHeader::read_from(&mut &bytes[..], Path::new("seg")).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, ClusterError::Corruption { .. }));
    }

    #[test]
    fn short_header_is_corruption() {
        let bytes = SegmentHeader::new(1, 0, 0).to_bytes();
        let err = SegmentHeader::read_from(&mut &bytes[..10], Path::new("seg")).unwrap_err();
        assert!(matches!(err, ClusterError::Corruption { .. }));
    }
}
