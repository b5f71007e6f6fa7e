//! Error types for HybridLog operations
//!
//! All engine errors are represented by the `HybridError` enum. Integrity
//! variants carry the file and offset where the problem was detected so a
//! damaged store can be diagnosed without a debugger.

use std::path::PathBuf;

use thiserror::Error;

use crate::checkpoint::CheckpointToken;

/// HybridLog error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum HybridError {
    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", .path.as_ref().map(|p| format!(" in {}", p.display())).unwrap_or_default())]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Log segment is corrupted and cannot be read at this position
    #[error("Log corrupted in {} at offset {offset}: {reason}", .path.display())]
    LogCorrupted {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    /// Checksum verification failed
    #[error("Checksum mismatch in {} at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}", .path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
        offset: u64,
    },

    /// Partial record at the end of a file
    #[error("Torn write in {} at offset {offset}: expected {expected_size} bytes, only {available_bytes} available", .path.display())]
    TornWrite {
        path: PathBuf,
        expected_size: u32,
        available_bytes: u64,
        offset: u64,
    },

    /// Key or value exceeds the configured maximum
    #[error("Entry {component} too large: {entry_size} bytes exceeds limit of {max_size} bytes")]
    OversizedEntry {
        entry_size: u64,
        max_size: u64,
        /// "key" or "value"
        component: String,
    },

    /// Magic bytes not found at expected location
    #[error("Magic bytes not found in {} at offset {offset}: found {:02x}{:02x}{:02x}{:02x}",
            .path.display(), .found_bytes[0], .found_bytes[1], .found_bytes[2], .found_bytes[3])]
    NoMagicFound {
        path: PathBuf,
        offset: u64,
        found_bytes: [u8; 4],
    },

    /// A pooled session could not be constructed
    #[error("Session acquisition failed: {reason}")]
    SessionAcquisition { reason: String },

    /// The session pool was disposed
    #[error("Session pool has been disposed")]
    PoolDisposed,

    /// State could not be reconstructed from a checkpoint or the log
    #[error("Recovery failed{}: {reason}", .token.as_ref().map(|t| format!(" for checkpoint {}", t)).unwrap_or_default())]
    Recovery {
        token: Option<CheckpointToken>,
        reason: String,
    },

    /// A checkpoint could not be initiated or completed
    #[error("Checkpoint failed: {reason}")]
    Checkpoint { reason: String },

    /// No checkpoint exists for the given token
    #[error("Checkpoint {token} not found")]
    CheckpointNotFound { token: CheckpointToken },

    /// Commit replay failed for some keys; the rest were applied
    #[error("Commit applied {applied} entries, {} failed", .failures.len())]
    CommitFailed {
        applied: usize,
        /// (key, error message) for every key that could not be applied
        failures: Vec<(Vec<u8>, String)>,
    },

    /// The store has been disposed
    #[error("Store has been disposed")]
    Disposed,

    /// Configuration rejected by `Config::validate`
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl HybridError {
    /// Build an `Io` error tagged with the path it happened on.
    pub(crate) fn io_at(path: impl Into<PathBuf>, err: std::io::Error, what: &str) -> Self {
        HybridError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }

    /// True for errors caused by damaged on-disk data rather than the device.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            HybridError::LogCorrupted { .. }
                | HybridError::ChecksumMismatch { .. }
                | HybridError::TornWrite { .. }
                | HybridError::NoMagicFound { .. }
        )
    }
}

/// Convert std::io::Error to HybridError::Io
impl From<std::io::Error> for HybridError {
    fn from(err: std::io::Error) -> Self {
        HybridError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for HybridLog operations
pub type HybridResult<T> = Result<T, HybridError>;
