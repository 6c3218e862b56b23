//! Asynchronous file handle
//!
//! An [`AsyncFile`] submits positioned reads and writes to a [`Backend`] and
//! returns immediately; each operation's [`IoCallback`] fires exactly once,
//! on the completion poller thread, when the backend finishes it. The number
//! of operations in flight per file is bounded by `max_io`; callers block
//! while the bound is saturated.
//!
//! ```text
//! write/read ─► PendingCounter::up ─► [WriteExecutor] ─► IoPermits::acquire
//!                                                          │
//!                                       Backend::submit ◄──┘
//!                                              │
//! CompletionPoller ◄── Backend::poll ◄─────────┘
//!   └─► route(id): drop Permit ─► PendingCounter::down ─► callback ─► buffer_done
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::aligned_buffer::AlignedBuffer;
use super::backend::{Backend, BackendFactory, IoRequest, OpKind, RawCompletion, SubmitError};
use super::budget::IoBudget;
use super::callback::{BufferCallback, IoCallback};
use super::config::DEFAULT_DRAIN_WARN_INTERVAL;
use super::error::{ErrorCode, IoError, IoResult};
use super::executor::WriteExecutor;
use super::pending::PendingCounter;
use super::permits::{IoPermits, Permit};
use super::poller::CompletionPoller;
use super::stats::IoStats;

type SharedBufferCallback = Arc<Mutex<Option<Arc<dyn BufferCallback>>>>;

/// How often close checks that the poller is still alive while draining
const POLLER_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Everything the completion side needs to finish one operation
struct CompletionRecord {
    callback: Box<dyn IoCallback>,
    permit: Permit,
    kind: OpKind,
    submitted_at: Instant,
}

/// An operation accepted by `write`/`read`, not yet handed to the backend
struct Operation {
    kind: OpKind,
    position: u64,
    len: usize,
    buffer: AlignedBuffer,
    callback: Box<dyn IoCallback>,
}

/// State of one open period of a file
pub(crate) struct Session {
    path: PathBuf,
    max_io: usize,
    backend: Box<dyn Backend>,
    permits: Arc<IoPermits>,
    pending: PendingCounter,
    records: Mutex<HashMap<u64, CompletionRecord>>,
    next_id: AtomicU64,
    poller: CompletionPoller,
    stats: Arc<IoStats>,
    buffer_callback: SharedBufferCallback,
}

impl Session {
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    fn submit(&self, op: Operation) {
        let Operation {
            kind,
            position,
            len,
            buffer,
            callback,
        } = op;

        let permit = self.permits.acquire();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // Registered before submission: the completion may be polled before
        // `Backend::submit` returns
        self.records.lock().insert(
            id,
            CompletionRecord {
                callback,
                permit,
                kind,
                submitted_at: Instant::now(),
            },
        );
        self.stats.record_submit();

        let request = IoRequest {
            id,
            kind,
            position,
            len,
            buffer,
        };

        match panic::catch_unwind(AssertUnwindSafe(|| self.backend.submit(request))) {
            Ok(Ok(())) => {}
            Ok(Err(SubmitError { error, buffer })) => {
                tracing::warn!(
                    path = %self.path.display(),
                    ?kind,
                    position,
                    error = %error,
                    "IO submission failed"
                );
                self.finish(id, Err(error), Some(buffer));
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(
                    path = %self.path.display(),
                    ?kind,
                    position,
                    %message,
                    "IO submission panicked"
                );
                self.finish(id, Err(IoError::Internal(message)), None);
            }
        }
    }

    /// Route a backend completion to its operation
    pub(crate) fn route(&self, completion: RawCompletion) {
        let RawCompletion { id, result, buffer } = completion;
        self.finish(id, result, Some(buffer));
    }

    fn finish(&self, id: u64, result: IoResult<usize>, buffer: Option<AlignedBuffer>) {
        let Some(record) = self.records.lock().remove(&id) else {
            tracing::warn!(path = %self.path.display(), id, "Completion for unknown operation");
            if let Some(buffer) = buffer {
                self.release_buffer(buffer);
            }
            return;
        };

        let CompletionRecord {
            callback,
            permit,
            kind,
            submitted_at,
        } = record;

        drop(permit);
        self.pending.down();

        let outcome = match (result, buffer.as_ref()) {
            (Ok(_), Some(buffer)) => Ok(buffer),
            (Ok(_), None) => Err(IoError::Internal("completion without buffer".into())),
            (Err(e), _) => Err(e),
        };

        match &outcome {
            Ok(_) => self.stats.record_success(submitted_at.elapsed()),
            Err(e) => {
                self.stats.record_failure();
                tracing::warn!(
                    path = %self.path.display(),
                    ?kind,
                    code = %e.code(),
                    error = %e,
                    "IO operation failed"
                );
            }
        }

        let invoked = panic::catch_unwind(AssertUnwindSafe(move || match outcome {
            Ok(buffer) => callback.on_success(buffer),
            Err(e) => callback.on_error(e.code(), &e.to_string()),
        }));
        if invoked.is_err() {
            tracing::error!(path = %self.path.display(), id, "IO callback panicked");
        }

        if let Some(buffer) = buffer {
            self.release_buffer(buffer);
        }
    }

    fn release_buffer(&self, buffer: AlignedBuffer) {
        let target = self.buffer_callback.lock().clone();
        if let Some(target) = target {
            target.buffer_done(buffer);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic during IO submission".to_string()
    }
}

enum FileState {
    Closed,
    Open(Arc<Session>),
    Closing,
}

/// Asynchronous file with a bounded number of in-flight operations
///
/// Shareable across threads: `write` and `read` take `&self`.
pub struct AsyncFile {
    factory: Arc<dyn BackendFactory>,
    budget: Arc<IoBudget>,
    executor: Option<Arc<WriteExecutor>>,
    open_files: Option<Arc<AtomicUsize>>,
    drain_warn_interval: Duration,
    state: Mutex<FileState>,
    stats: Arc<IoStats>,
    buffer_callback: SharedBufferCallback,
}

impl AsyncFile {
    /// Create an unopened file using `factory` for its backend
    pub fn new(factory: Arc<dyn BackendFactory>, budget: Arc<IoBudget>) -> Self {
        Self {
            factory,
            budget,
            executor: None,
            open_files: None,
            drain_warn_interval: DEFAULT_DRAIN_WARN_INTERVAL,
            state: Mutex::new(FileState::Closed),
            stats: Arc::new(IoStats::new()),
            buffer_callback: Arc::new(Mutex::new(None)),
        }
    }

    /// Submit writes from `executor` instead of the caller thread
    pub fn with_write_executor(mut self, executor: Arc<WriteExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Interval between warnings while close waits for operations
    pub fn with_drain_warn_interval(mut self, interval: Duration) -> Self {
        self.drain_warn_interval = interval;
        self
    }

    /// Count this file in `counter` while it is open
    pub fn with_open_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.open_files = Some(counter);
        self
    }

    /// Open `path` (created if missing) allowing `max_io` concurrent operations
    pub fn open(&self, path: impl AsRef<Path>, max_io: usize) -> IoResult<()> {
        let path = path.as_ref();
        let mut state = self.state.lock();
        if !matches!(*state, FileState::Closed) {
            return Err(IoError::AlreadyOpen);
        }
        if max_io == 0 {
            return Err(IoError::InvalidArgument(
                "max_io must be at least 1".to_string(),
            ));
        }

        let reservation =
            self.budget
                .try_reserve(max_io)
                .ok_or_else(|| IoError::CannotInitializeBackend {
                    requested: max_io,
                    reserved: self.budget.reserved(),
                    message: "process IO limit reached".to_string(),
                })?;

        let backend = match self.factory.open(path, max_io) {
            Ok(backend) => backend,
            Err(IoError::BackendInit {
                code: ErrorCode::CannotInitializeBackend,
                message,
            }) => {
                drop(reservation);
                return Err(IoError::CannotInitializeBackend {
                    requested: max_io,
                    reserved: self.budget.reserved(),
                    message,
                });
            }
            Err(e) => return Err(e),
        };
        reservation.commit();

        let session = Session {
            path: path.to_path_buf(),
            max_io,
            backend,
            permits: IoPermits::new(max_io),
            pending: PendingCounter::new(),
            records: Mutex::new(HashMap::with_capacity(max_io)),
            next_id: AtomicU64::new(0),
            poller: CompletionPoller::new(),
            stats: self.stats.clone(),
            buffer_callback: self.buffer_callback.clone(),
        };
        *state = FileState::Open(Arc::new(session));

        if let Some(counter) = &self.open_files {
            counter.fetch_add(1, Ordering::Relaxed);
        }

        tracing::debug!(
            path = %path.display(),
            max_io,
            backend = self.factory.name(),
            "Opened async file"
        );
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state.lock(), FileState::Open(_))
    }

    /// Path of the open file
    pub fn path(&self) -> Option<PathBuf> {
        match &*self.state.lock() {
            FileState::Open(session) => Some(session.path.clone()),
            _ => None,
        }
    }

    /// Concurrency bound of the current session
    pub fn max_io(&self) -> Option<usize> {
        match &*self.state.lock() {
            FileState::Open(session) => Some(session.max_io),
            _ => None,
        }
    }

    /// Operations accepted but not completed
    pub fn pending(&self) -> usize {
        match &*self.state.lock() {
            FileState::Open(session) => session.pending.count(),
            _ => 0,
        }
    }

    /// Whether the completion poller of the current session is running
    pub fn is_polling(&self) -> bool {
        match &*self.state.lock() {
            FileState::Open(session) => session.poller.is_running(),
            _ => false,
        }
    }

    /// Counters, kept across reopen
    pub fn stats(&self) -> &IoStats {
        &self.stats
    }

    /// Required buffer and offset alignment of the backend
    pub fn alignment(&self) -> usize {
        self.factory.alignment()
    }

    fn session(&self) -> IoResult<Arc<Session>> {
        match &*self.state.lock() {
            FileState::Open(session) => Ok(session.clone()),
            _ => Err(IoError::NotOpen),
        }
    }

    /// Accept one operation into the open session
    ///
    /// Runs under the state lock so close, which swaps the state first,
    /// either rejects the operation or waits for it.
    fn admit(&self, size: usize, capacity: usize) -> IoResult<Arc<Session>> {
        let state = self.state.lock();
        let FileState::Open(session) = &*state else {
            return Err(IoError::NotOpen);
        };
        if size > capacity {
            return Err(IoError::BufferSize {
                size,
                alignment: capacity,
            });
        }

        session.poller.ensure_started(session)?;
        session.pending.up();
        Ok(session.clone())
    }

    /// Write `size` bytes from the start of `buffer` at `position`
    ///
    /// The callback fires once the data has been written. The buffer is
    /// dropped if the call fails synchronously.
    pub fn write(
        &self,
        position: u64,
        size: usize,
        buffer: AlignedBuffer,
        callback: Box<dyn IoCallback>,
    ) -> IoResult<()> {
        self.submit(OpKind::Write, position, size, buffer, callback)
    }

    /// Read `size` bytes at `position` into `buffer`
    ///
    /// The callback receives the buffer holding the bytes read; fewer than
    /// `size` are returned at end of file.
    pub fn read(
        &self,
        position: u64,
        size: usize,
        buffer: AlignedBuffer,
        callback: Box<dyn IoCallback>,
    ) -> IoResult<()> {
        self.submit(OpKind::Read, position, size, buffer, callback)
    }

    fn submit(
        &self,
        kind: OpKind,
        position: u64,
        size: usize,
        buffer: AlignedBuffer,
        callback: Box<dyn IoCallback>,
    ) -> IoResult<()> {
        let session = self.admit(size, buffer.capacity())?;

        let op = Operation {
            kind,
            position,
            len: size,
            buffer,
            callback,
        };

        match (&self.executor, kind) {
            (Some(executor), OpKind::Write) => {
                executor.execute(move || session.submit(op));
            }
            _ => session.submit(op),
        }
        Ok(())
    }

    /// Current file size in bytes
    pub fn size(&self) -> IoResult<u64> {
        self.session()?.backend.size()
    }

    /// Write `blocks` blocks of `block_size` bytes of `fill_byte` at `position`
    pub fn fill(&self, position: u64, blocks: usize, block_size: usize, fill_byte: u8) -> IoResult<()> {
        self.session()?
            .backend
            .fill(position, blocks, block_size, fill_byte)
    }

    /// Flush written data to stable storage
    pub fn sync(&self) -> IoResult<()> {
        self.session()?.backend.sync()
    }

    /// Set the target notified when an operation no longer needs its buffer
    ///
    /// Every operation that reached the session hands its buffer back here
    /// after its callback, reads included: the buffer was moved in, so the
    /// read data must be copied out inside the callback. Files created by
    /// the journal factory use its buffer pool, which zeroes recycled
    /// buffers.
    pub fn set_buffer_callback(&self, callback: Option<Arc<dyn BufferCallback>>) {
        *self.buffer_callback.lock() = callback;
    }

    /// Wait until every accepted operation has completed
    ///
    /// A poller that exited on a backend error is restarted so completions
    /// still queued in the backend get routed.
    fn drain_pending(&self, session: &Arc<Session>) {
        let slice = self.drain_warn_interval.min(POLLER_CHECK_INTERVAL);
        let mut last_warning = Instant::now();
        loop {
            if session.pending.count() > 0 {
                if let Err(e) = session.poller.ensure_started(session) {
                    tracing::error!(
                        path = %session.path.display(),
                        error = %e,
                        "Failed to restart completion poller during close"
                    );
                }
            }
            if session.pending.wait_completion(slice) {
                return;
            }
            if last_warning.elapsed() >= self.drain_warn_interval {
                last_warning = Instant::now();
                self.stats.record_drain_warning();
                tracing::warn!(
                    path = %session.path.display(),
                    pending = session.pending.count(),
                    "Still waiting for pending IO operations before close"
                );
            }
        }
    }

    /// Wait for in-flight operations, stop the poller and release the backend
    pub fn close(&self) -> IoResult<()> {
        let session = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, FileState::Closing) {
                FileState::Open(session) => session,
                other => {
                    *state = other;
                    return Err(IoError::NotOpen);
                }
            }
        };

        self.drain_pending(&session);

        while !session.permits.acquire_all(self.drain_warn_interval) {
            self.stats.record_drain_warning();
            tracing::warn!(
                path = %session.path.display(),
                in_use = session.permits.in_use(),
                "Still waiting for IO permits before close"
            );
        }

        session.poller.stop(&session);

        let max_io = session.max_io;
        let path = session.path.clone();
        // The poller has exited, so this is normally the last reference
        drop(session);
        self.budget.release(max_io);

        if let Some(counter) = &self.open_files {
            counter.fetch_sub(1, Ordering::Relaxed);
        }

        *self.state.lock() = FileState::Closed;
        tracing::debug!(path = %path.display(), "Closed async file");
        Ok(())
    }
}

impl Drop for AsyncFile {
    fn drop(&mut self) {
        if self.is_open() {
            tracing::warn!(path = ?self.path(), "Async file dropped while open, closing");
            if let Err(e) = self.close() {
                tracing::error!(error = %e, "Failed to close async file on drop");
            }
        }
    }
}

impl std::fmt::Debug for AsyncFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFile")
            .field("backend", &self.factory.name())
            .field("path", &self.path())
            .field("pending", &self.pending())
            .finish()
    }
}
