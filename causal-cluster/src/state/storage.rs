//! Durable storage for state machine state.
//!
//! Each state machine persists its whole state as one checksummed JSON
//! document, replaced atomically on every flush.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use causal_core::codec::{checksum, verify_checksum};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{ClusterError, ClusterResult};

/// Where a state machine keeps its durable state.
pub trait StateStorage<T>: Send {
    /// State to start from: the last persisted state, or the initial one.
    fn initial_state(&self) -> T;

    /// Durably replace the stored state.
    fn persist(&mut self, state: &T) -> ClusterResult<()>;
}

/// File-backed storage: `{crc32 LE}{json}` written via temp file and rename.
#[derive(Debug)]
pub struct DurableStateStorage<T> {
    path: PathBuf,
    current: T,
}

impl<T> DurableStateStorage<T>
where
    T: Serialize + DeserializeOwned + Clone + Send,
{
    /// Open `dir/<name>.state`, loading it if present and falling back to
    /// `default` otherwise. A checksum mismatch is corruption.
    pub fn open(dir: &Path, name: &str, default: T) -> ClusterResult<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{name}.state"));
        let current = if path.exists() {
            load(&path)?
        } else {
            default
        };
        Ok(Self { path, current })
    }

    /// File backing this storage.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn load<T: DeserializeOwned>(path: &Path) -> ClusterResult<T> {
    let bytes = fs::read(path)?;
    if bytes.len() < 4 {
        return Err(ClusterError::corruption(path, "state file shorter than checksum"));
    }
    let (mut crc_bytes, body) = bytes.split_at(4);
    let stored = crc_bytes.read_u32::<LittleEndian>()?;
    verify_checksum(stored, &[body])
        .map_err(|e| ClusterError::corruption(path, format!("state file: {e}")))?;
    serde_json::from_slice(body).map_err(|e| ClusterError::corruption(path, e.to_string()))
}

impl<T> StateStorage<T> for DurableStateStorage<T>
where
    T: Serialize + DeserializeOwned + Clone + Send,
{
    fn initial_state(&self) -> T {
        self.current.clone()
    }

    fn persist(&mut self, state: &T) -> ClusterResult<()> {
        let body = serde_json::to_vec(state)?;
        let temp_path = self.path.with_extension("state.tmp");

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_u32::<LittleEndian>(checksum(&[&body]))?;
        writer.write_all(&body)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        fs::rename(&temp_path, &self.path)?;
        self.current = state.clone();
        Ok(())
    }
}

/// Volatile storage for tests and throwaway replicas.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStateStorage<T> {
    current: T,
    persists: u64,
}

impl<T> InMemoryStateStorage<T> {
    /// Start from `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            current: initial,
            persists: 0,
        }
    }

    /// How many times `persist` was called.
    pub fn persist_count(&self) -> u64 {
        self.persists
    }
}

impl<T: Clone + Send> StateStorage<T> for InMemoryStateStorage<T> {
    fn initial_state(&self) -> T {
        self.current.clone()
    }

    fn persist(&mut self, state: &T) -> ClusterResult<()> {
        self.current = state.clone();
        self.persists += 1;
        Ok(())
    }
}
