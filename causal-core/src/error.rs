//! Error types for the core primitives.

use thiserror::Error;

/// The main error type for core operations.
#[derive(Error, Debug)]
pub enum CoreError {
    // =========================================================================
    // Codec Errors (E001-E099)
    // =========================================================================
    /// A varint ran past ten bytes.
    #[error("E001: Varint overflow after {bytes} bytes")]
    VarintOverflow {
        /// Number of bytes consumed before giving up.
        bytes: usize,
    },

    /// Input ended in the middle of a value.
    #[error("E002: Truncated input while reading {what}")]
    Truncated {
        /// What was being decoded.
        what: &'static str,
    },

    /// A stored checksum did not match the computed one.
    #[error("E003: Checksum mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum stored alongside the data.
        expected: u32,
        /// Checksum computed over the data.
        actual: u32,
    },

    /// An enumerated tag had no known variant.
    #[error("E004: Unknown {kind} tag {tag}")]
    UnknownTag {
        /// The enumeration being decoded.
        kind: &'static str,
        /// The offending tag value.
        tag: u8,
    },

    // =========================================================================
    // Runtime Errors (E100-E199)
    // =========================================================================
    /// Timers require a tokio runtime.
    #[error("E100: No tokio runtime available: {0}")]
    NoRuntime(String),

    /// I/O failure.
    #[error("E101: I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
