//! Completion callbacks for asynchronous file operations

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::aligned_buffer::AlignedBuffer;
use super::error::{ErrorCode, IoError, IoResult};

/// Callback invoked exactly once per submitted operation
///
/// Both methods consume the callback, so a second invocation cannot be
/// expressed. `on_success` receives the buffer the operation carried: for a
/// read it holds the bytes read, for a write the bytes that were written.
pub trait IoCallback: Send + 'static {
    /// The operation completed
    fn on_success(self: Box<Self>, buffer: &AlignedBuffer);

    /// The operation failed
    fn on_error(self: Box<Self>, code: ErrorCode, message: &str);
}

/// Closures taking the operation outcome are callbacks
impl<F> IoCallback for F
where
    F: FnOnce(IoResult<&AlignedBuffer>) + Send + 'static,
{
    fn on_success(self: Box<Self>, buffer: &AlignedBuffer) {
        (*self)(Ok(buffer))
    }

    fn on_error(self: Box<Self>, code: ErrorCode, message: &str) {
        (*self)(Err(IoError::Backend {
            code,
            message: message.to_string(),
        }))
    }
}

/// Buffer-release notification target
///
/// Fires after the operation callback, once per completed operation. From
/// that point on the buffer is no longer referenced by the file.
pub trait BufferCallback: Send + Sync {
    fn buffer_done(&self, buffer: AlignedBuffer);
}

#[derive(Default)]
struct WaitState {
    outcome: Option<Result<(), (ErrorCode, String)>>,
    data: Option<Vec<u8>>,
}

struct WaitShared {
    state: Mutex<WaitState>,
    cond: Condvar,
    capture: bool,
}

/// Callback that lets a thread block until the operation finishes
///
/// Clone it, hand one clone to the operation and `wait` on the other.
#[derive(Clone)]
pub struct WaitCallback {
    shared: Arc<WaitShared>,
}

impl WaitCallback {
    /// Create a callback that records only the outcome
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Create a callback that also keeps a copy of the buffer contents
    pub fn capturing() -> Self {
        Self::build(true)
    }

    fn build(capture: bool) -> Self {
        Self {
            shared: Arc::new(WaitShared {
                state: Mutex::new(WaitState::default()),
                cond: Condvar::new(),
                capture,
            }),
        }
    }

    /// Box a clone of this callback for submission
    pub fn boxed(&self) -> Box<dyn IoCallback> {
        Box::new(self.clone())
    }

    /// Block until the operation completes
    pub fn wait(&self) -> IoResult<()> {
        let mut state = self.shared.state.lock();
        while state.outcome.is_none() {
            self.shared.cond.wait(&mut state);
        }
        Self::outcome(&state)
    }

    /// Block until the operation completes or the timeout elapses
    ///
    /// Returns `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<IoResult<()>> {
        let mut state = self.shared.state.lock();
        if state.outcome.is_none() {
            self.shared.cond.wait_while_for(&mut state, |s| s.outcome.is_none(), timeout);
        }
        state.outcome.as_ref()?;
        Some(Self::outcome(&state))
    }

    /// Whether the operation has completed
    pub fn is_done(&self) -> bool {
        self.shared.state.lock().outcome.is_some()
    }

    /// Take the captured buffer contents, if any
    pub fn take_data(&self) -> Option<Vec<u8>> {
        self.shared.state.lock().data.take()
    }

    fn outcome(state: &WaitState) -> IoResult<()> {
        match &state.outcome {
            Some(Ok(())) => Ok(()),
            Some(Err((code, message))) => Err(IoError::Backend {
                code: *code,
                message: message.clone(),
            }),
            None => Err(IoError::Internal("operation still pending".into())),
        }
    }

    fn finish(&self, outcome: Result<(), (ErrorCode, String)>, data: Option<Vec<u8>>) {
        let mut state = self.shared.state.lock();
        state.outcome = Some(outcome);
        state.data = data;
        self.shared.cond.notify_all();
    }
}

impl Default for WaitCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl IoCallback for WaitCallback {
    fn on_success(self: Box<Self>, buffer: &AlignedBuffer) {
        let data = self.shared.capture.then(|| buffer.as_slice().to_vec());
        self.finish(Ok(()), data);
    }

    fn on_error(self: Box<Self>, code: ErrorCode, message: &str) {
        self.finish(Err((code, message.to_string())), None);
    }
}
