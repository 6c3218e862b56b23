//! POSIX fallback backend
//!
//! Executes positioned reads and writes with standard file operations on
//! tokio's blocking thread pool. Used on non-Linux platforms, when io_uring
//! fails its startup probe, or when explicitly configured. Buffers and offsets
//! are unconstrained.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use tokio::runtime::{Builder, Handle, Runtime};

use super::{
    Backend, BackendFactory, CompletionQueue, IoRequest, OpKind, PollOutcome, RawCompletion,
    SubmitError,
};
use crate::io::aligned_buffer::AlignedBuffer;
use crate::io::error::{ErrorCode, IoError, IoResult};

/// Blocking thread pool shared by all files of the POSIX backend
pub struct PosixPool {
    runtime: Runtime,
}

impl PosixPool {
    /// Build a pool with at most `threads` blocking threads
    pub fn new(threads: usize) -> IoResult<Arc<Self>> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads.max(1))
            .thread_name("roomq-posix-io")
            .build()?;
        Ok(Arc::new(Self { runtime }))
    }

    fn handle(&self) -> &Handle {
        self.runtime.handle()
    }
}

impl std::fmt::Debug for PosixPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PosixPool").finish_non_exhaustive()
    }
}

/// POSIX-based backend for one file
pub struct PosixBackend {
    file: Arc<File>,
    pool: Arc<PosixPool>,
    completions: Arc<CompletionQueue>,
}

impl PosixBackend {
    /// Open a file for POSIX IO operations
    pub fn open(path: &Path, pool: Arc<PosixPool>) -> IoResult<Self> {
        // Note: no O_DIRECT here, it may not be supported on all
        // platforms (e.g., macOS) or filesystems
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| IoError::BackendInit {
                code: ErrorCode::CannotOpenCloseFile,
                message: format!("{}: {}", path.display(), e),
            })?;

        Ok(Self {
            file: Arc::new(file),
            pool,
            completions: Arc::new(CompletionQueue::new()),
        })
    }
}

fn execute(
    file: &File,
    kind: OpKind,
    position: u64,
    len: usize,
    buffer: &mut AlignedBuffer,
) -> IoResult<usize> {
    if len > buffer.capacity() {
        return Err(IoError::BufferSize {
            size: len,
            alignment: buffer.alignment(),
        });
    }

    match kind {
        OpKind::Write => {
            file.write_all_at(&buffer.as_full_slice()[..len], position)
                .map_err(|e| IoError::backend(ErrorCode::IoError, e))?;
            Ok(len)
        }
        OpKind::Read => {
            let target = &mut buffer.as_mut_slice()[..len];
            let mut read = 0;
            // A short read only happens at end of file
            while read < len {
                match file.read_at(&mut target[read..], position + read as u64) {
                    Ok(0) => break,
                    Ok(n) => read += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(IoError::backend(ErrorCode::IoError, e)),
                }
            }
            buffer.set_len(read);
            Ok(read)
        }
    }
}

impl Backend for PosixBackend {
    fn submit(&self, request: IoRequest) -> Result<(), SubmitError> {
        let file = self.file.clone();
        let completions = self.completions.clone();

        // The JoinHandle is dropped: the result travels through the queue
        let _ = self.pool.handle().spawn_blocking(move || {
            let IoRequest {
                id,
                kind,
                position,
                len,
                mut buffer,
            } = request;
            let result = execute(&file, kind, position, len, &mut buffer);
            completions.push(RawCompletion { id, result, buffer });
        });

        Ok(())
    }

    fn poll(&self, completions: &mut Vec<RawCompletion>) -> IoResult<PollOutcome> {
        Ok(self.completions.poll(completions))
    }

    fn stop_poller(&self) -> IoResult<()> {
        self.completions.stop();
        Ok(())
    }

    fn size(&self) -> IoResult<u64> {
        let metadata = self
            .file
            .metadata()
            .map_err(|e| IoError::backend(ErrorCode::IoError, e))?;
        Ok(metadata.len())
    }

    fn fill(&self, position: u64, blocks: usize, block_size: usize, fill_byte: u8) -> IoResult<()> {
        let block = vec![fill_byte; block_size];
        for i in 0..blocks {
            self.file
                .write_all_at(&block, position + (i * block_size) as u64)
                .map_err(|e| IoError::backend(ErrorCode::PreallocateFile, e))?;
        }
        Ok(())
    }

    fn sync(&self) -> IoResult<()> {
        self.file
            .sync_all()
            .map_err(|e| IoError::backend(ErrorCode::IoError, e))
    }
}

/// Factory for creating PosixBackend instances
#[derive(Debug, Clone)]
pub struct PosixBackendFactory {
    pool: Arc<PosixPool>,
}

impl PosixBackendFactory {
    pub fn new(pool: Arc<PosixPool>) -> Self {
        Self { pool }
    }

    /// Factory with its own pool of `threads` blocking threads
    pub fn with_threads(threads: usize) -> IoResult<Self> {
        Ok(Self::new(PosixPool::new(threads)?))
    }
}

impl BackendFactory for PosixBackendFactory {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn alignment(&self) -> usize {
        1
    }

    fn open(&self, path: &Path, max_io: usize) -> IoResult<Box<dyn Backend>> {
        if max_io == 0 {
            return Err(IoError::BackendInit {
                code: ErrorCode::CannotInitializeBackend,
                message: "max_io must be at least 1".to_string(),
            });
        }
        Ok(Box::new(PosixBackend::open(path, self.pool.clone())?))
    }
}
