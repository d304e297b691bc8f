//! Segment files.
//!
//! A segment is one file holding a header followed by a contiguous run of
//! entry frames. Only the last segment of the log is ever written to.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::entries::{read_entry, ReadOutcome};
use super::header::{SegmentHeader, HEADER_SIZE};
use crate::error::{ClusterError, ClusterResult};

/// Where an entry lives inside its segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    /// Byte offset of the frame within the file.
    pub offset: u64,
    /// Term of the entry.
    pub term: u64,
}

/// In-memory index of one segment file.
#[derive(Debug)]
pub struct Segment {
    /// Parsed header.
    pub header: SegmentHeader,
    /// File path.
    pub path: PathBuf,
    /// Entry locations, in index order starting at `first_index()`.
    pub entries: Vec<EntryLocation>,
    /// Bytes of valid data in the file.
    pub size: u64,
}

impl Segment {
    /// Generate segment filename from its ordinal.
    pub fn file_name(ordinal: u64) -> String {
        format!("seg_{:012}.log", ordinal)
    }

    /// Parse the ordinal from a segment filename.
    pub fn parse_file_name(filename: &str) -> Option<u64> {
        filename
            .strip_prefix("seg_")
            .and_then(|rest| rest.strip_suffix(".log"))
            .and_then(|ordinal| ordinal.parse().ok())
    }

    /// List segment files in `dir` sorted by ordinal.
    pub fn list(dir: &Path) -> ClusterResult<Vec<(u64, PathBuf)>> {
        let mut segments = Vec::new();

        if !dir.exists() {
            return Ok(segments);
        }

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if let Some(filename) = path.file_name().and_then(|n| n.to_str()) {
                if let Some(ordinal) = Self::parse_file_name(filename) {
                    segments.push((ordinal, path));
                }
            }
        }

        segments.sort_by_key(|(ordinal, _)| *ordinal);
        Ok(segments)
    }

    /// Create an empty segment on disk.
    ///
    /// The header is written to a temporary file and renamed into place, so
    /// the segment becomes visible only once complete.
    pub fn create(dir: &Path, header: SegmentHeader) -> ClusterResult<Self> {
        let name = Self::file_name(header.ordinal);
        let path = dir.join(&name);
        let temp_path = dir.join(format!("{name}.tmp"));

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(&header.to_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &path)?;

        tracing::debug!(
            ordinal = header.ordinal,
            prev_index = header.prev_index,
            prev_term = header.prev_term,
            "Created segment"
        );

        Ok(Self {
            header,
            path,
            entries: Vec::new(),
            size: HEADER_SIZE as u64,
        })
    }

    /// Scan an existing segment, rebuilding its entry index.
    ///
    /// A torn final frame is cut off when `is_last` is set, since only the
    /// active segment can be mid-write at a crash. Anywhere else it is
    /// corruption.
    pub fn recover(path: &Path, expected_ordinal: u64, is_last: bool) -> ClusterResult<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let header = SegmentHeader::read_from(&mut reader, path)?;
        if header.ordinal != expected_ordinal {
            return Err(ClusterError::corruption(
                path,
                format!(
                    "header ordinal {} does not match file name ordinal {}",
                    header.ordinal, expected_ordinal
                ),
            ));
        }

        let mut entries = Vec::new();
        let mut offset = HEADER_SIZE as u64;
        loop {
            match read_entry(&mut reader, path)? {
                ReadOutcome::Entry(entry, len) => {
                    entries.push(EntryLocation {
                        offset,
                        term: entry.term,
                    });
                    offset += len as u64;
                }
                ReadOutcome::End => break,
                ReadOutcome::Torn if is_last => {
                    tracing::warn!(
                        path = %path.display(),
                        valid_bytes = offset,
                        discarded_bytes = file_len - offset,
                        "Truncating torn write at end of log"
                    );
                    let file = OpenOptions::new().write(true).open(path)?;
                    file.set_len(offset)?;
                    file.sync_all()?;
                    break;
                }
                ReadOutcome::Torn => {
                    return Err(ClusterError::corruption(
                        path,
                        format!("torn entry at offset {offset} in a closed segment"),
                    ));
                }
            }
        }

        Ok(Self {
            header,
            path: path.to_path_buf(),
            entries,
            size: offset,
        })
    }

    /// Index of the first entry this segment can hold.
    pub fn first_index(&self) -> u64 {
        self.header.prev_index + 1
    }

    /// Index of the last entry, or `prev_index` when empty.
    pub fn last_index(&self) -> u64 {
        self.header.prev_index + self.entries.len() as u64
    }

    /// Term of the last entry, or `prev_term` when empty.
    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|loc| loc.term)
            .unwrap_or(self.header.prev_term)
    }

    /// Whether the segment holds `index`.
    pub fn contains(&self, index: u64) -> bool {
        index >= self.first_index() && index <= self.last_index()
    }

    /// Location of `index`, if held here.
    pub fn locate(&self, index: u64) -> Option<EntryLocation> {
        if !self.contains(index) {
            return None;
        }
        self.entries.get((index - self.first_index()) as usize).copied()
    }

    /// Drop entries from `index` onwards, shrinking the file to match.
    pub fn truncate_from(&mut self, index: u64) -> ClusterResult<()> {
        let keep = index.saturating_sub(self.first_index()) as usize;
        if keep >= self.entries.len() {
            return Ok(());
        }
        let new_size = self.entries[keep].offset;
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(new_size)?;
        file.sync_all()?;
        self.entries.truncate(keep);
        self.size = new_size;
        Ok(())
    }

    /// Open the file for appending at its current valid end.
    pub fn open_for_append(&self) -> ClusterResult<File> {
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(self.size))?;
        Ok(file)
    }

    /// Remove the file.
    pub fn delete(&self) -> ClusterResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
