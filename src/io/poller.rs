//! Completion poller thread
//!
//! One poller per open file session. It blocks in [`Backend::poll`] and hands
//! every finished operation to the session's routing function. The thread is
//! started lazily by the first operation and stopped by close.
//!
//! [`Backend::poll`]: super::backend::Backend::poll

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::async_file::Session;
use super::backend::PollOutcome;
use super::error::IoResult;

const POLLER_THREAD_NAME: &str = "roomq-aio-poller";

/// Upper bound on waiting for a poller that could not be woken
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_JOIN_POLL: Duration = Duration::from_millis(10);

/// Handle to a session's poller thread
#[derive(Debug, Default)]
pub(crate) struct CompletionPoller {
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CompletionPoller {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Start the poller unless it is already running
    ///
    /// A poller that exited after a backend error is joined and replaced.
    pub(crate) fn ensure_started(&self, session: &Arc<Session>) -> IoResult<()> {
        let mut thread = self.thread.lock();
        if let Some(handle) = thread.as_ref() {
            if !handle.is_finished() {
                return Ok(());
            }
            if let Some(handle) = thread.take() {
                let _ = handle.join();
            }
            tracing::debug!(path = %session.path().display(), "Restarting completion poller");
        }

        let session = session.clone();
        let handle = std::thread::Builder::new()
            .name(POLLER_THREAD_NAME.to_string())
            .spawn(move || run(session))?;
        *thread = Some(handle);
        Ok(())
    }

    pub(crate) fn is_running(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Ask the backend to wake the poller and wait for the thread to exit
    pub(crate) fn stop(&self, session: &Session) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };

        if handle.thread().id() == std::thread::current().id() {
            if let Err(e) = session.backend().stop_poller() {
                tracing::error!(error = %e, "Failed to stop completion poller");
            }
            tracing::warn!("Close called from a completion callback, poller not joined");
            return;
        }

        if !handle.is_finished() {
            if let Err(e) = session.backend().stop_poller() {
                tracing::error!(
                    path = %session.path().display(),
                    error = %e,
                    "Failed to stop completion poller, waiting for it to exit"
                );
                let deadline = Instant::now() + STOP_JOIN_TIMEOUT;
                while !handle.is_finished() && Instant::now() < deadline {
                    std::thread::sleep(STOP_JOIN_POLL);
                }
                if !handle.is_finished() {
                    tracing::error!(
                        path = %session.path().display(),
                        "Completion poller did not exit, backend stays open until it does"
                    );
                    return;
                }
            }
        }

        if handle.join().is_err() {
            tracing::error!("Completion poller thread panicked");
        }
    }
}

fn run(session: Arc<Session>) {
    let mut batch = Vec::new();
    loop {
        let outcome = session.backend().poll(&mut batch);

        for completion in batch.drain(..) {
            session.route(completion);
        }

        match outcome {
            Ok(PollOutcome::Completed) => {}
            Ok(PollOutcome::Stopped) => break,
            Err(e) => {
                tracing::error!(
                    path = %session.path().display(),
                    error = %e,
                    "Completion poller failed"
                );
                break;
            }
        }
    }
    tracing::trace!(path = %session.path().display(), "Completion poller exited");
}
