//! Sequential file factory
//!
//! Chooses the IO backend once, at construction, and hands out journal files
//! that share the factory's IO budget, write executor and buffer pool.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::io::backend::PosixPool;
use crate::io::{
    AlignedBuffer, AsyncFile, BackendFactory, BackendPreference, BackendSupport, BufferPool,
    IoBudget, IoConfig, IoError, PosixBackendFactory, WriteExecutor,
};
use crate::journal::error::{JournalError, JournalResult};
use crate::journal::sequential_file::SequentialFile;

const WRITER_THREAD_NAME: &str = "roomq-journal-writer";

/// Creates [`SequentialFile`]s in one directory
pub struct SequentialFileFactory {
    directory: PathBuf,
    config: IoConfig,
    backend: Arc<dyn BackendFactory>,
    budget: Arc<IoBudget>,
    executor: Option<Arc<WriteExecutor>>,
    buffers: Arc<BufferPool>,
    open_files: Arc<AtomicUsize>,
}

impl SequentialFileFactory {
    /// Create a factory using the backend selected by `config`
    pub fn new(directory: impl Into<PathBuf>, config: IoConfig) -> JournalResult<Self> {
        let backend = select_backend(&config, BackendSupport::detect())?;
        Self::with_backend(directory, config, backend)
    }

    /// Create a factory around an explicit backend
    pub fn with_backend(
        directory: impl Into<PathBuf>,
        config: IoConfig,
        backend: Arc<dyn BackendFactory>,
    ) -> JournalResult<Self> {
        let budget = match config.io_limit {
            Some(limit) => IoBudget::with_limit(limit),
            None => IoBudget::new(),
        };

        let executor = if config.serialize_writes {
            Some(Arc::new(WriteExecutor::new(WRITER_THREAD_NAME)?))
        } else {
            None
        };

        let buffers = Arc::new(BufferPool::new(
            backend.alignment(),
            config.buffer_pool_size,
        ));

        let directory = directory.into();
        tracing::debug!(
            directory = %directory.display(),
            backend = backend.name(),
            max_io = config.max_io,
            "Created sequential file factory"
        );

        Ok(Self {
            directory,
            config,
            backend,
            budget,
            executor,
            buffers,
            open_files: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Share an IO budget with other factories
    pub fn with_budget(mut self, budget: Arc<IoBudget>) -> Self {
        self.budget = budget;
        self
    }

    /// Create an unopened file named `name` in the factory directory
    ///
    /// Completed operations hand their buffers back to the factory's buffer
    /// pool unless the file is given another buffer callback.
    pub fn create_sequential_file(&self, name: &str) -> JournalResult<SequentialFile> {
        validate_file_name(name)?;

        let mut file = AsyncFile::new(self.backend.clone(), self.budget.clone())
            .with_drain_warn_interval(self.config.drain_warn_interval)
            .with_open_counter(self.open_files.clone());
        if let Some(executor) = &self.executor {
            file = file.with_write_executor(executor.clone());
        }
        file.set_buffer_callback(Some(self.buffers.clone()));

        Ok(SequentialFile::new(
            &self.directory,
            name.to_string(),
            self.config.max_io,
            file,
        ))
    }

    /// Names of files in the directory with the given extension, sorted
    pub fn list_files(&self, extension: &str) -> JournalResult<Vec<String>> {
        let extension = extension.trim_start_matches('.');
        let mut names = Vec::new();

        for entry in std::fs::read_dir(&self.directory)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(extension) {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }

        names.sort();
        Ok(names)
    }

    /// Allocate a zeroed buffer suitable for this factory's files
    ///
    /// With an aligned backend `size` must be a multiple of the alignment.
    pub fn new_buffer(&self, size: usize) -> JournalResult<AlignedBuffer> {
        let alignment = self.alignment();
        if alignment > 1 && !size.is_multiple_of(alignment) {
            return Err(IoError::BufferSize { size, alignment }.into());
        }
        Ok(self.buffers.acquire(size)?)
    }

    /// Return a buffer to the pool
    pub fn release_buffer(&self, buffer: AlignedBuffer) {
        self.buffers.release(buffer);
    }

    /// Round `bytes` up to the backend alignment
    pub fn calculate_block_size(&self, bytes: usize) -> usize {
        AlignedBuffer::round_up_to(bytes, self.alignment())
    }

    pub fn alignment(&self) -> usize {
        self.backend.alignment()
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Create the directory and missing parents
    pub fn create_dirs(&self) -> JournalResult<()> {
        std::fs::create_dir_all(&self.directory)?;
        Ok(())
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Files created by this factory that are currently open
    pub fn open_file_count(&self) -> usize {
        self.open_files.load(Ordering::Relaxed)
    }

    pub fn budget(&self) -> &Arc<IoBudget> {
        &self.budget
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    pub fn config(&self) -> &IoConfig {
        &self.config
    }

    /// Shut the write executor down after the queued writes are submitted
    pub fn stop(&self) {
        let open = self.open_file_count();
        if open > 0 {
            tracing::warn!(open, "Stopping file factory with open files");
        }
        if let Some(executor) = &self.executor {
            executor.shutdown();
        }
    }
}

impl Drop for SequentialFileFactory {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for SequentialFileFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialFileFactory")
            .field("directory", &self.directory)
            .field("backend", &self.backend.name())
            .field("open_files", &self.open_file_count())
            .finish()
    }
}

/// Pick the backend for `config` given the probe result
pub fn select_backend(
    config: &IoConfig,
    support: &BackendSupport,
) -> JournalResult<Arc<dyn BackendFactory>> {
    match config.backend {
        BackendPreference::Posix => posix_backend(config),
        BackendPreference::Uring => match support.uring_unavailable_reason() {
            None => uring_backend(config),
            Some(reason) => Err(JournalError::BackendUnavailable(reason.to_string())),
        },
        BackendPreference::Auto => {
            if support.uring_available() {
                uring_backend(config)
            } else {
                tracing::debug!(
                    reason = support.uring_unavailable_reason().unwrap_or_default(),
                    "Using POSIX journal backend"
                );
                posix_backend(config)
            }
        }
    }
}

fn posix_backend(config: &IoConfig) -> JournalResult<Arc<dyn BackendFactory>> {
    let pool = PosixPool::new(config.posix_threads)?;
    Ok(Arc::new(PosixBackendFactory::new(pool)))
}

#[cfg(target_os = "linux")]
fn uring_backend(config: &IoConfig) -> JournalResult<Arc<dyn BackendFactory>> {
    Ok(Arc::new(crate::io::UringBackendFactory::new(config.direct_io)))
}

#[cfg(not(target_os = "linux"))]
fn uring_backend(_config: &IoConfig) -> JournalResult<Arc<dyn BackendFactory>> {
    Err(JournalError::BackendUnavailable(
        "io_uring requires Linux".to_string(),
    ))
}

pub(crate) fn validate_file_name(name: &str) -> JournalResult<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains(std::path::MAIN_SEPARATOR)
        || name.contains('\0');
    if invalid {
        return Err(JournalError::InvalidFileName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_file_name() {
        assert!(validate_file_name("000001.amq").is_ok());
        assert!(validate_file_name("").is_err());
        assert!(validate_file_name("..").is_err());
        assert!(validate_file_name("a/b").is_err());
    }

    #[test]
    fn test_select_posix_when_forced() {
        let config = IoConfig::new().with_backend(BackendPreference::Posix);
        let support = BackendSupport::fallback_only("test");
        let backend = select_backend(&config, &support).unwrap();
        assert_eq!(backend.name(), "posix");
    }

    #[test]
    fn test_auto_falls_back_without_uring() {
        let config = IoConfig::new();
        let support = BackendSupport::fallback_only("probe failed");
        let backend = select_backend(&config, &support).unwrap();
        assert_eq!(backend.name(), "posix");
        assert_eq!(backend.alignment(), 1);
    }

    #[test]
    fn test_uring_required_but_unavailable() {
        let config = IoConfig::new().with_backend(BackendPreference::Uring);
        let support = BackendSupport::fallback_only("kernel too old");
        match select_backend(&config, &support) {
            Err(JournalError::BackendUnavailable(reason)) => assert_eq!(reason, "kernel too old"),
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("io_uring should not be selected"),
        }
    }
}
