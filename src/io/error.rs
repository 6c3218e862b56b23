//! IO error types

use thiserror::Error;

/// Numeric error codes reported through the callback error path
///
/// The values match the broker's exception codes so that journal code and
/// management tooling see the same numbers regardless of backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Unexpected failure inside the submission path
    InternalError = 0,
    /// Plain IO failure
    IoError = 6,
    /// Backend reported an internal failure
    NativeErrorInternal = 200,
    /// Buffer unusable for the backend
    InvalidBuffer = 201,
    /// Buffer, offset or size not aligned for direct IO
    NotAligned = 202,
    /// Backend could not allocate the requested concurrency
    CannotInitializeBackend = 203,
    /// Backend resources could not be released
    CannotReleaseBackend = 204,
    /// File could not be opened or closed
    CannotOpenCloseFile = 205,
    /// Backend queue could not be allocated
    CannotAllocateQueue = 206,
    /// File preallocation failed
    PreallocateFile = 208,
    /// Memory allocation failed
    AllocateMemory = 209,
    /// Backend submission queue is full
    BackendQueueFull = 211,
}

impl ErrorCode {
    /// Numeric value of the code
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.as_i32())
    }
}

/// IO operation errors
#[derive(Error, Debug)]
pub enum IoError {
    /// Operation attempted outside an open session
    #[error("File is not opened")]
    NotOpen,

    /// Open attempted on a file that is open or still closing
    #[error("File is already opened")]
    AlreadyOpen,

    /// Backend refused the requested concurrency
    #[error(
        "Can't initialize backend. Currently IO in use = {reserved}, trying to allocate more {requested}: {message}"
    )]
    CannotInitializeBackend {
        requested: usize,
        reserved: usize,
        message: String,
    },

    /// Backend could not be set up for this file
    #[error("Backend initialization failed ({code}): {message}")]
    BackendInit { code: ErrorCode, message: String },

    /// A submitted or synchronous backend operation failed
    #[error("Backend operation failed ({code}): {message}")]
    Backend { code: ErrorCode, message: String },

    /// Unexpected failure in the submission path
    #[error("Internal error: {0}")]
    Internal(String),

    /// Invalid argument supplied by the caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Standard IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Buffer alignment error
    #[error("Buffer not aligned to {expected} bytes (got offset {actual})")]
    Alignment { expected: usize, actual: usize },

    /// Buffer size error
    #[error("Buffer size {size} not a multiple of {alignment}")]
    BufferSize { size: usize, alignment: usize },

    /// File offset error
    #[error("File offset {offset} not aligned to {alignment}")]
    OffsetAlignment { offset: u64, alignment: usize },
}

impl IoError {
    /// Build a backend operation error from an OS error
    pub fn backend(code: ErrorCode, err: std::io::Error) -> Self {
        IoError::Backend {
            code,
            message: err.to_string(),
        }
    }

    /// Error code reported to callbacks for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            IoError::NotOpen | IoError::AlreadyOpen => ErrorCode::CannotOpenCloseFile,
            IoError::CannotInitializeBackend { .. } => ErrorCode::CannotInitializeBackend,
            IoError::BackendInit { code, .. } | IoError::Backend { code, .. } => *code,
            IoError::Internal(_) | IoError::InvalidArgument(_) => ErrorCode::InternalError,
            IoError::Io(_) => ErrorCode::IoError,
            IoError::Alignment { .. } | IoError::OffsetAlignment { .. } => ErrorCode::NotAligned,
            IoError::BufferSize { .. } => ErrorCode::InvalidBuffer,
        }
    }
}

/// Result type for IO operations
pub type IoResult<T> = Result<T, IoError>;
