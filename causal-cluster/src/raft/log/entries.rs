//! Entry framing within a segment.
//!
//! Each entry is written as
//! `{varint length}{term: u64 LE}{content type: u8}{payload}{crc32 LE}` where
//! the length covers everything after the varint and the checksum covers the
//! term, tag and payload.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use causal_core::codec::{checksum, put_varint, read_varint, varint_len, verify_checksum};
use causal_core::CoreError;
use std::io::{self, Read, Write};
use std::path::Path;

use crate::command::{ContentType, ReplicatedContent};
use crate::error::{ClusterError, ClusterResult};
use crate::types::RaftLogEntry;

/// Bytes in a frame body besides the payload: term, tag and checksum.
pub const FRAME_OVERHEAD: usize = 8 + 1 + 4;

/// Encode one entry, appending the frame to `buf`.
///
/// Returns the number of bytes appended.
pub fn encode_entry(entry: &RaftLogEntry, buf: &mut Vec<u8>) -> ClusterResult<usize> {
    let start = buf.len();
    let payload = entry.content.encode_payload()?;
    let tag = entry.content.content_type() as u8;

    put_varint(buf, (FRAME_OVERHEAD + payload.len()) as u64);
    let body_start = buf.len();
    buf.write_u64::<LittleEndian>(entry.term)?;
    buf.write_u8(tag)?;
    buf.write_all(&payload)?;
    let crc = checksum(&[&buf[body_start..]]);
    buf.write_u32::<LittleEndian>(crc)?;

    Ok(buf.len() - start)
}

/// Size of the encoded frame for `entry`.
pub fn encoded_len(entry: &RaftLogEntry) -> ClusterResult<usize> {
    let payload_len = entry.content.encode_payload()?.len();
    let body = FRAME_OVERHEAD + payload_len;
    Ok(varint_len(body as u64) + body)
}

/// Result of reading one frame from a segment.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete, verified entry and its encoded size.
    Entry(RaftLogEntry, usize),
    /// Clean end of segment.
    End,
    /// The segment ends in the middle of a frame.
    Torn,
}

/// Read the next frame. Checksum failures and malformed frames are
/// corruption of `path`.
pub fn read_entry<R: Read>(r: &mut R, path: &Path) -> ClusterResult<ReadOutcome> {
    let body_len = match read_varint(r) {
        Ok(Some(len)) => len as usize,
        Ok(None) => return Ok(ReadOutcome::End),
        Err(CoreError::Truncated { .. }) => return Ok(ReadOutcome::Torn),
        Err(CoreError::Io(e)) => return Err(ClusterError::Io(e)),
        Err(e) => return Err(ClusterError::corruption(path, e.to_string())),
    };

    if body_len < FRAME_OVERHEAD {
        return Err(ClusterError::corruption(
            path,
            format!("frame length {body_len} below minimum {FRAME_OVERHEAD}"),
        ));
    }

    let mut body = vec![0u8; body_len];
    match r.read_exact(&mut body) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(ReadOutcome::Torn),
        Err(e) => return Err(ClusterError::Io(e)),
    }

    let (checked, mut crc_bytes) = body.split_at(body_len - 4);
    let stored_crc = crc_bytes.read_u32::<LittleEndian>()?;
    verify_checksum(stored_crc, &[checked])
        .map_err(|e| ClusterError::corruption(path, format!("entry: {e}")))?;

    let mut cursor = checked;
    let term = cursor.read_u64::<LittleEndian>()?;
    let tag = cursor.read_u8()?;
    let content_type =
        ContentType::try_from(tag).map_err(|e| ClusterError::corruption(path, e.to_string()))?;
    let content = ReplicatedContent::decode(content_type, cursor)
        .map_err(|e| ClusterError::corruption(path, e.to_string()))?;

    Ok(ReadOutcome::Entry(
        RaftLogEntry { term, content },
        varint_len(body_len as u64) + body_len,
    ))
}
