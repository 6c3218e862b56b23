//! Shared test utilities
//!
//! Note: clippy reports false-positive dead_code warnings because it can't
//! trace usage across test binaries. These utilities are used by multiple tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use roomq::io::backend::{
    Backend, BackendFactory, CompletionQueue, IoRequest, OpKind, PollOutcome, RawCompletion,
    SubmitError,
};
use roomq::io::{AlignedBuffer, BufferCallback, ErrorCode, IoCallback, IoError, IoResult};

/// Unique path under the system temp dir
pub fn test_file_path(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("roomq_io_test_{}_{}", name, std::process::id()));
    path
}

pub fn cleanup(path: &Path) {
    if path.is_dir() {
        let _ = std::fs::remove_dir_all(path);
    } else {
        let _ = std::fs::remove_file(path);
    }
}

/// Poll `cond` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// In-memory backend whose completions the test controls
///
/// In auto mode every operation completes immediately. With [`hold`] set,
/// completions are parked until the test releases them, in any order.
///
/// [`hold`]: ScriptedBackend::hold
#[derive(Default)]
pub struct ScriptedBackend {
    queue: CompletionQueue,
    held: Mutex<Vec<RawCompletion>>,
    hold: AtomicBool,
    fail_submit: AtomicBool,
    panic_submit: AtomicBool,
    fail_completions: AtomicBool,
    fail_next_poll: AtomicBool,
    fail_stop: AtomicBool,
    submits: AtomicUsize,
    data: Mutex<Vec<u8>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Park completions instead of delivering them
    pub fn hold(&self, enabled: bool) {
        self.hold.store(enabled, Ordering::SeqCst);
    }

    /// Refuse submissions, handing the buffer back
    pub fn fail_submit(&self, enabled: bool) {
        self.fail_submit.store(enabled, Ordering::SeqCst);
    }

    /// Panic inside submit
    pub fn panic_submit(&self, enabled: bool) {
        self.panic_submit.store(enabled, Ordering::SeqCst);
    }

    /// Report every completion as a backend error
    pub fn fail_completions(&self, enabled: bool) {
        self.fail_completions.store(enabled, Ordering::SeqCst);
    }

    /// Make the next poll return an error, leaving queued completions in place
    pub fn fail_next_poll(&self) {
        self.fail_next_poll.store(true, Ordering::SeqCst);
    }

    /// Make `stop_poller` report an error without waking the poller
    pub fn fail_stop(&self, enabled: bool) {
        self.fail_stop.store(enabled, Ordering::SeqCst);
    }

    /// Wake and stop the poller after `delay`, from another thread
    pub fn stop_after(self: &Arc<Self>, delay: Duration) -> std::thread::JoinHandle<()> {
        let backend = self.clone();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            backend.queue.stop();
        })
    }

    /// Submissions accepted so far
    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Ids of parked completions in submission order
    pub fn held_ids(&self) -> Vec<u64> {
        self.held.lock().iter().map(|c| c.id).collect()
    }

    /// Deliver the parked completion with `id`
    pub fn release(&self, id: u64) -> bool {
        let completion = {
            let mut held = self.held.lock();
            match held.iter().position(|c| c.id == id) {
                Some(index) => held.remove(index),
                None => return false,
            }
        };
        self.queue.push(completion);
        true
    }

    /// Deliver all parked completions, newest first
    pub fn release_reversed(&self) {
        let mut held = std::mem::take(&mut *self.held.lock());
        while let Some(completion) = held.pop() {
            self.queue.push(completion);
        }
    }

    /// Deliver all parked completions in submission order
    pub fn release_all(&self) {
        let held = std::mem::take(&mut *self.held.lock());
        for completion in held {
            self.queue.push(completion);
        }
    }

    /// Deliver all parked completions after `delay`, from another thread
    pub fn release_all_after(self: &Arc<Self>, delay: Duration) -> std::thread::JoinHandle<()> {
        let backend = self.clone();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            backend.release_all();
        })
    }

    /// Bytes written so far
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    fn execute(&self, request: &mut IoRequest) -> usize {
        let mut data = self.data.lock();
        let start = request.position as usize;
        match request.kind {
            OpKind::Write => {
                let end = start + request.len;
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[start..end].copy_from_slice(&request.buffer.as_full_slice()[..request.len]);
                request.len
            }
            OpKind::Read => {
                let end = (start + request.len).min(data.len());
                let n = end.saturating_sub(start);
                if n > 0 {
                    request.buffer.as_mut_slice()[..n].copy_from_slice(&data[start..end]);
                }
                request.buffer.set_len(n);
                n
            }
        }
    }
}

impl Backend for ScriptedBackend {
    fn submit(&self, mut request: IoRequest) -> Result<(), SubmitError> {
        if self.panic_submit.load(Ordering::SeqCst) {
            panic!("injected submit panic");
        }
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(SubmitError {
                error: IoError::Backend {
                    code: ErrorCode::BackendQueueFull,
                    message: "injected submit failure".to_string(),
                },
                buffer: request.buffer,
            });
        }

        self.submits.fetch_add(1, Ordering::SeqCst);
        let result = if self.fail_completions.load(Ordering::SeqCst) {
            Err(IoError::Backend {
                code: ErrorCode::IoError,
                message: "injected completion failure".to_string(),
            })
        } else {
            Ok(self.execute(&mut request))
        };

        let completion = RawCompletion {
            id: request.id,
            result,
            buffer: request.buffer,
        };
        if self.hold.load(Ordering::SeqCst) {
            self.held.lock().push(completion);
        } else {
            self.queue.push(completion);
        }
        Ok(())
    }

    fn poll(&self, completions: &mut Vec<RawCompletion>) -> IoResult<PollOutcome> {
        if self.fail_next_poll.swap(false, Ordering::SeqCst) {
            return Err(IoError::Backend {
                code: ErrorCode::NativeErrorInternal,
                message: "injected poll failure".to_string(),
            });
        }
        Ok(self.queue.poll(completions))
    }

    fn stop_poller(&self) -> IoResult<()> {
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(IoError::Backend {
                code: ErrorCode::CannotReleaseBackend,
                message: "injected stop failure".to_string(),
            });
        }
        self.queue.stop();
        Ok(())
    }

    fn size(&self) -> IoResult<u64> {
        Ok(self.data.lock().len() as u64)
    }

    fn fill(&self, position: u64, blocks: usize, block_size: usize, fill_byte: u8) -> IoResult<()> {
        let mut data = self.data.lock();
        let start = position as usize;
        let end = start + blocks * block_size;
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].fill(fill_byte);
        Ok(())
    }

    fn sync(&self) -> IoResult<()> {
        Ok(())
    }
}

/// Backend handle given to the file; the test keeps the other reference
struct SharedBackend(Arc<ScriptedBackend>);

impl Backend for SharedBackend {
    fn submit(&self, request: IoRequest) -> Result<(), SubmitError> {
        self.0.submit(request)
    }

    fn poll(&self, completions: &mut Vec<RawCompletion>) -> IoResult<PollOutcome> {
        self.0.poll(completions)
    }

    fn stop_poller(&self) -> IoResult<()> {
        self.0.stop_poller()
    }

    fn size(&self) -> IoResult<u64> {
        self.0.size()
    }

    fn fill(&self, position: u64, blocks: usize, block_size: usize, fill_byte: u8) -> IoResult<()> {
        self.0.fill(position, blocks, block_size, fill_byte)
    }

    fn sync(&self) -> IoResult<()> {
        self.0.sync()
    }
}

/// Factory handing out the same scripted backend on every open
pub struct ScriptedFactory {
    pub backend: Arc<ScriptedBackend>,
    open_error: Mutex<Option<ErrorCode>>,
    opens: AtomicUsize,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            backend: ScriptedBackend::new(),
            open_error: Mutex::new(None),
            opens: AtomicUsize::new(0),
        })
    }

    /// Make the next opens fail with `code`
    pub fn fail_open(&self, code: Option<ErrorCode>) {
        *self.open_error.lock() = code;
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl BackendFactory for ScriptedFactory {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn alignment(&self) -> usize {
        1
    }

    fn open(&self, _path: &Path, max_io: usize) -> IoResult<Box<dyn Backend>> {
        if let Some(code) = *self.open_error.lock() {
            return Err(IoError::BackendInit {
                code,
                message: format!("injected failure for max_io {}", max_io),
            });
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SharedBackend(self.backend.clone())))
    }
}

/// Ordered log of callback and buffer-release events
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback logging `ok:<tag>` or `err:<tag>:<code>`
    pub fn callback(&self, tag: &str) -> Box<dyn IoCallback> {
        let events = self.events.clone();
        let tag = tag.to_string();
        Box::new(move |result: IoResult<&AlignedBuffer>| {
            let event = match result {
                Ok(_) => format!("ok:{}", tag),
                Err(e) => format!("err:{}:{}", tag, e.code().as_i32()),
            };
            events.lock().push(event);
        })
    }

    pub fn push(&self, event: String) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

/// Logs `buf:<first byte>` for every released buffer
impl BufferCallback for EventLog {
    fn buffer_done(&self, buffer: AlignedBuffer) {
        let marker = buffer.as_full_slice()[0];
        self.push(format!("buf:{}", marker));
    }
}

/// One-byte-aligned buffer whose first byte is `marker`
pub fn marked_buffer(marker: u8, len: usize) -> AlignedBuffer {
    let mut buffer = AlignedBuffer::with_alignment(len, 1).unwrap();
    let data = vec![marker; len];
    buffer.copy_from_slice(&data).unwrap();
    buffer
}
