//! Centralized error types for mboxstore.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the mboxstore library.
#[derive(Error, Debug)]
pub enum MboxError {
    /// I/O error with the associated file path.
    #[error("I/O error reading '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The specified file does not exist.
    #[error("MBOX file not found: {0}")]
    FileNotFound(PathBuf),

    /// The file does not start with a `From ` separator line.
    #[error("File isn't in mbox format: {0}")]
    InvalidMbox(PathBuf),

    /// The exclusive lock on the mailbox could not be acquired.
    #[error("Could not lock mailbox '{path}': {reason}")]
    LockFailed { path: PathBuf, reason: String },

    /// The mailbox changed underneath the lock: a message boundary was
    /// expected but the line terminator before it is missing.
    #[error("Mailbox changed unexpectedly at offset {offset}")]
    ExternalChange { offset: u64 },

    /// The index file is corrupt or was built with an incompatible version.
    #[error("Corrupt or incompatible index for '{path}': {reason}")]
    InvalidIndex { path: PathBuf, reason: String },

    /// A mutation was attempted without holding the exclusive index lock.
    #[error("Index is not exclusively locked")]
    IndexNotLocked,

    /// No record exists at the given sequence number.
    #[error("No index record with sequence number {seq}")]
    RecordNotFound { seq: u32 },

    /// A staged record update could not be committed.
    #[error("Failed to update record {seq}: {reason}")]
    UpdateFailed { seq: u32, reason: String },

    /// The cached structural breakdown could not be re-derived.
    #[error("Cannot update message part data: {0}")]
    PartUpdate(String),
}

/// Convenience alias for `Result<T, MboxError>`.
pub type Result<T> = std::result::Result<T, MboxError>;

impl MboxError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
