//! Backend capability behind an [`AsyncFile`](crate::io::AsyncFile)
//!
//! A backend performs the actual file IO for one open file. Operations are
//! submitted without waiting; finished operations are collected by the
//! completion poller through [`Backend::poll`] and identified by the id the
//! file assigned at submission, so they may complete in any order.
//!
//! Two implementations exist:
//! - Linux: io_uring with direct IO ([`UringBackendFactory`])
//! - Everywhere: positioned reads and writes on a blocking thread pool
//!   ([`PosixBackendFactory`])

pub mod posix;
#[cfg(target_os = "linux")]
pub mod uring;

use std::collections::VecDeque;
use std::path::Path;
use std::sync::OnceLock;

use parking_lot::{Condvar, Mutex};

use super::aligned_buffer::AlignedBuffer;
use super::error::{IoError, IoResult};

pub use posix::{PosixBackend, PosixBackendFactory, PosixPool};
#[cfg(target_os = "linux")]
pub use uring::{UringBackend, UringBackendFactory};

/// Kind of a submitted operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
}

/// An operation handed to a backend
///
/// The backend owns the buffer until it hands it back in the matching
/// [`RawCompletion`] or [`SubmitError`].
#[derive(Debug)]
pub struct IoRequest {
    /// Operation identity assigned by the file
    pub id: u64,
    pub kind: OpKind,
    /// File offset
    pub position: u64,
    /// Bytes to transfer, at most the buffer capacity
    pub len: usize,
    pub buffer: AlignedBuffer,
}

/// A finished operation reported by [`Backend::poll`]
#[derive(Debug)]
pub struct RawCompletion {
    pub id: u64,
    /// Bytes transferred, or the backend failure
    pub result: IoResult<usize>,
    pub buffer: AlignedBuffer,
}

/// Submission refused by the backend; the buffer comes back to the caller
#[derive(Debug)]
pub struct SubmitError {
    pub error: IoError,
    pub buffer: AlignedBuffer,
}

/// Outcome of one poll iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Completions were appended (possibly none on a spurious wakeup)
    Completed,
    /// A stop was requested; the poller must exit
    Stopped,
}

/// Per-file IO engine
pub trait Backend: Send + Sync {
    /// Submit an operation without waiting for it
    fn submit(&self, request: IoRequest) -> Result<(), SubmitError>;

    /// Block until at least one operation completes or a stop is requested
    ///
    /// Completions are appended to `completions`, also when returning
    /// [`PollOutcome::Stopped`]. Only the poller thread calls this.
    fn poll(&self, completions: &mut Vec<RawCompletion>) -> IoResult<PollOutcome>;

    /// Make the current or next `poll` return [`PollOutcome::Stopped`]
    fn stop_poller(&self) -> IoResult<()>;

    /// Current file size in bytes
    fn size(&self) -> IoResult<u64>;

    /// Write `blocks` blocks of `block_size` bytes of `fill_byte` at `position`
    fn fill(&self, position: u64, blocks: usize, block_size: usize, fill_byte: u8)
        -> IoResult<()>;

    /// Flush written data to stable storage
    fn sync(&self) -> IoResult<()>;
}

/// Opens backends for files
pub trait BackendFactory: Send + Sync {
    /// Short backend name for diagnostics
    fn name(&self) -> &'static str;

    /// Required buffer/offset alignment (1 = unconstrained)
    fn alignment(&self) -> usize;

    /// Open `path` (creating it if missing) with room for `max_io` operations
    ///
    /// Failure to allocate the requested concurrency is reported as
    /// `IoError::BackendInit` with `ErrorCode::CannotInitializeBackend`.
    fn open(&self, path: &Path, max_io: usize) -> IoResult<Box<dyn Backend>>;
}

/// Completion queue for backends that finish operations on other threads
///
/// Workers push completions; the poller blocks in [`CompletionQueue::poll`].
#[derive(Debug, Default)]
pub struct CompletionQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<RawCompletion>,
    stopped: bool,
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a finished operation
    pub fn push(&self, completion: RawCompletion) {
        self.state.lock().ready.push_back(completion);
        self.cond.notify_one();
    }

    /// Wait for completions or a stop request
    pub fn poll(&self, completions: &mut Vec<RawCompletion>) -> PollOutcome {
        let mut state = self.state.lock();
        while state.ready.is_empty() && !state.stopped {
            self.cond.wait(&mut state);
        }
        if !state.ready.is_empty() {
            completions.extend(state.ready.drain(..));
            return PollOutcome::Completed;
        }
        state.stopped = false;
        PollOutcome::Stopped
    }

    /// Wake the poller and make it exit once the queue is empty
    pub fn stop(&self) {
        self.state.lock().stopped = true;
        self.cond.notify_all();
    }

    /// Completions waiting to be polled
    pub fn len(&self) -> usize {
        self.state.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of the process-wide backend probe
#[derive(Debug, Clone)]
pub struct BackendSupport {
    uring: Result<(), String>,
}

static SUPPORT: OnceLock<BackendSupport> = OnceLock::new();

impl BackendSupport {
    /// Probe the platform once and cache the result for the process
    pub fn detect() -> &'static BackendSupport {
        SUPPORT.get_or_init(|| {
            let support = Self::probe();
            match &support.uring {
                Ok(()) => tracing::debug!("io_uring backend available"),
                Err(reason) => {
                    tracing::debug!(%reason, "io_uring backend unavailable, using POSIX fallback")
                }
            }
            support
        })
    }

    #[cfg(target_os = "linux")]
    fn probe() -> Self {
        Self {
            uring: uring::probe(),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn probe() -> Self {
        Self {
            uring: Err("io_uring requires Linux".to_string()),
        }
    }

    /// Support report that never offers io_uring
    pub fn fallback_only(reason: impl Into<String>) -> Self {
        Self {
            uring: Err(reason.into()),
        }
    }

    /// Whether the io_uring backend validated successfully
    pub fn uring_available(&self) -> bool {
        self.uring.is_ok()
    }

    /// Why io_uring is unavailable, if it is
    pub fn uring_unavailable_reason(&self) -> Option<&str> {
        self.uring.as_ref().err().map(String::as_str)
    }
}

/// Whether the high-throughput backend is available in this process
pub fn uring_available() -> bool {
    BackendSupport::detect().uring_available()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn completion(id: u64) -> RawCompletion {
        RawCompletion {
            id,
            result: Ok(0),
            buffer: AlignedBuffer::new(1).unwrap(),
        }
    }

    #[test]
    fn test_queue_delivers_then_stops() {
        let queue = CompletionQueue::new();
        queue.push(completion(1));
        queue.push(completion(2));
        queue.stop();

        let mut out = Vec::new();
        assert_eq!(queue.poll(&mut out), PollOutcome::Completed);
        assert_eq!(out.iter().map(|c| c.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(queue.poll(&mut out), PollOutcome::Stopped);
    }

    #[test]
    fn test_queue_poll_blocks_until_push() {
        let queue = Arc::new(CompletionQueue::new());
        let pusher = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                queue.push(completion(7));
            })
        };

        let mut out = Vec::new();
        assert_eq!(queue.poll(&mut out), PollOutcome::Completed);
        assert_eq!(out[0].id, 7);
        pusher.join().unwrap();
    }

    #[test]
    fn test_fallback_only_support() {
        let support = BackendSupport::fallback_only("disabled");
        assert!(!support.uring_available());
        assert_eq!(support.uring_unavailable_reason(), Some("disabled"));
    }
}
