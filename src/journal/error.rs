//! Journal error types

use thiserror::Error;

/// Journal file errors
#[derive(Error, Debug)]
pub enum JournalError {
    /// Async IO error
    #[error("IO error: {0}")]
    Io(#[from] crate::io::IoError),

    /// Standard IO error
    #[error("IO error: {0}")]
    StdIo(#[from] std::io::Error),

    /// The configured backend cannot be used in this process
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// File names must be a single non-empty path component
    #[error("Invalid journal file name: {0:?}")]
    InvalidFileName(String),
}

/// Result type for journal operations
pub type JournalResult<T> = Result<T, JournalError>;
