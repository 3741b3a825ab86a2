//! Error types for the cached block file

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cached block file and its collaborators
#[derive(Error, Debug)]
pub enum Error {
    /// A request object could not be allocated (request pool exhausted).
    /// Reported synchronously; no asynchronous work was started.
    #[error("Insufficient resources to start request")]
    InsufficientResources,

    /// The request was cancelled before any physical transfer was issued
    #[error("Request cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The lower block file failed an operation
    #[error("Lower file {operation} failed: {reason}")]
    LowerFile { operation: String, reason: String },

    /// Access beyond the end of the lower file
    #[error("Access at offset {offset} + {length} bytes exceeds file size {size}")]
    OutOfBounds { offset: u64, length: u64, size: u64 },

    /// The lower file has been closed
    #[error("File is closed")]
    FileClosed,

    // =========================================================================
    // Read Cache Errors
    // =========================================================================
    /// The read cache has no room for the entry
    #[error("Read cache full: {requested} bytes requested, capacity {capacity}")]
    CacheFull { requested: u64, capacity: u64 },

    /// No cache entry covers the offset
    #[error("No cache entry covers offset {offset}")]
    NotCached { offset: u64 },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a lower-file failure.
    pub fn lower_file(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::LowerFile {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` if this is a cancellation status.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
