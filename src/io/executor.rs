//! Single-thread write executor
//!
//! Writes of all files sharing an executor are submitted from one thread, in
//! the order they were requested. Reads do not go through it.

use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::error::IoResult;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Dedicated thread running submission tasks in FIFO order
pub struct WriteExecutor {
    sender: Mutex<Option<UnboundedSender<Task>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WriteExecutor {
    /// Spawn the executor thread
    pub fn new(name: &str) -> IoResult<Self> {
        let (sender, receiver) = mpsc::unbounded_channel::<Task>();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::run(receiver))?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    fn run(mut receiver: UnboundedReceiver<Task>) {
        while let Some(task) = receiver.blocking_recv() {
            task();
        }
        tracing::trace!("Write executor drained");
    }

    /// Queue a task; runs it on the calling thread once the executor is shut down
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        let task: Task = Box::new(task);
        let rejected = match self.sender.lock().as_ref() {
            Some(sender) => match sender.send(task) {
                Ok(()) => return,
                Err(mpsc::error::SendError(task)) => task,
            },
            None => task,
        };

        tracing::warn!("Write executor is shut down, submitting on caller thread");
        rejected();
    }

    /// Stop accepting tasks, run the queued ones and join the thread
    pub fn shutdown(&self) {
        // Dropping the sender ends the receive loop after the queue drains
        self.sender.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            if std::thread::current().id() == handle.thread().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("Write executor thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }
}

impl Drop for WriteExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WriteExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteExecutor")
            .field("running", &self.is_running())
            .finish()
    }
}
