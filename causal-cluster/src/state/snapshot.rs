//! Core snapshots: a consistent cut of every state machine at one log index.
//!
//! Binary layout, little-endian:
//!
//! ```text
//! "CCSN" | version u8 | prev_index u64 | prev_term u64 | count u32
//!   | (state_type u8 | len u32 | bytes) * count | crc32 u32
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use causal_core::codec::{checksum, verify_checksum};
use causal_core::LogPosition;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::io::{Read, Write};

use super::machine::StateType;
use crate::error::{ClusterError, ClusterResult};

const SNAPSHOT_MAGIC: &[u8; 4] = b"CCSN";
const SNAPSHOT_VERSION: u8 = 1;

/// Aggregate state of all state machines at `(prev_index, prev_term)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreSnapshot {
    prev_index: u64,
    prev_term: u64,
    states: BTreeMap<StateType, Vec<u8>>,
}

impl CoreSnapshot {
    /// An empty snapshot at the given position.
    pub fn new(prev_index: u64, prev_term: u64) -> Self {
        Self {
            prev_index,
            prev_term,
            states: BTreeMap::new(),
        }
    }

    /// Index the snapshot reflects.
    pub fn prev_index(&self) -> u64 {
        self.prev_index
    }

    /// Term of the entry at `prev_index`.
    pub fn prev_term(&self) -> u64 {
        self.prev_term
    }

    /// Log position of the snapshot.
    pub fn position(&self) -> LogPosition {
        LogPosition::new(self.prev_index, self.prev_term)
    }

    /// Add serialized state for `state_type`.
    pub fn add(&mut self, state_type: StateType, data: Vec<u8>) {
        self.states.insert(state_type, data);
    }

    /// Serialized state for `state_type`.
    pub fn get(&self, state_type: StateType) -> Option<&[u8]> {
        self.states.get(&state_type).map(Vec::as_slice)
    }

    /// Deserialize the state for `state_type`.
    pub fn get_state<T: DeserializeOwned>(&self, state_type: StateType) -> ClusterResult<T> {
        let data = self
            .get(state_type)
            .ok_or(ClusterError::MissingSnapshotState(state_type))?;
        Ok(serde_json::from_slice(data)?)
    }

    /// All states.
    pub fn states(&self) -> &BTreeMap<StateType, Vec<u8>> {
        &self.states
    }

    /// Encode to the binary layout.
    pub fn to_bytes(&self) -> ClusterResult<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_all(SNAPSHOT_MAGIC)?;
        buf.write_u8(SNAPSHOT_VERSION)?;
        buf.write_u64::<LittleEndian>(self.prev_index)?;
        buf.write_u64::<LittleEndian>(self.prev_term)?;
        buf.write_u32::<LittleEndian>(self.states.len() as u32)?;
        for (state_type, data) in &self.states {
            buf.write_u8(*state_type as u8)?;
            buf.write_u32::<LittleEndian>(data.len() as u32)?;
            buf.write_all(data)?;
        }
        let crc = checksum(&[&buf]);
        buf.write_u32::<LittleEndian>(crc)?;
        Ok(buf)
    }

    /// Decode from the binary layout. Checksum or structure mismatches are
    /// corruption.
    pub fn from_bytes(bytes: &[u8]) -> ClusterResult<Self> {
        let corrupt = |cause: String| ClusterError::corruption("core snapshot", cause);

        if bytes.len() < 4 + 1 + 8 + 8 + 4 + 4 {
            return Err(corrupt(format!("snapshot too short: {} bytes", bytes.len())));
        }
        let (body, mut crc_bytes) = bytes.split_at(bytes.len() - 4);
        let stored = crc_bytes.read_u32::<LittleEndian>()?;
        verify_checksum(stored, &[body]).map_err(|e| corrupt(format!("snapshot: {e}")))?;

        let mut cursor = body;
        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(corrupt("bad snapshot magic".to_string()));
        }
        let version = cursor.read_u8()?;
        if version != SNAPSHOT_VERSION {
            return Err(corrupt(format!("unsupported snapshot version {version}")));
        }
        let prev_index = cursor.read_u64::<LittleEndian>()?;
        let prev_term = cursor.read_u64::<LittleEndian>()?;
        let count = cursor.read_u32::<LittleEndian>()?;

        let mut states = BTreeMap::new();
        for _ in 0..count {
            let tag = cursor
                .read_u8()
                .map_err(|_| corrupt("truncated state header".to_string()))?;
            let state_type =
                StateType::from_u8(tag).ok_or_else(|| corrupt(format!("unknown state type {tag}")))?;
            let len = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| corrupt("truncated state header".to_string()))?
                as usize;
            if cursor.len() < len {
                return Err(corrupt(format!("state {state_type:?} truncated")));
            }
            let (data, rest) = cursor.split_at(len);
            states.insert(state_type, data.to_vec());
            cursor = rest;
        }
        if !cursor.is_empty() {
            return Err(corrupt(format!("{} trailing bytes", cursor.len())));
        }

        Ok(Self {
            prev_index,
            prev_term,
            states,
        })
    }
}
