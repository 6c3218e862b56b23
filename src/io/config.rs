//! Journal IO configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;

use super::error::IoError;

/// Default maximum concurrent operations per file
pub const DEFAULT_MAX_IO: usize = 500;

/// Default interval between drain warnings on close
pub const DEFAULT_DRAIN_WARN_INTERVAL: Duration = Duration::from_secs(60);

/// Default number of blocking threads for the portable backend
pub const DEFAULT_POSIX_THREADS: usize = 4;

/// Default number of released buffers kept per capacity
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 16;

/// Which backend the file factory should use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendPreference {
    /// io_uring when the startup probe validated it, else the fallback
    #[default]
    Auto,
    /// Require io_uring
    Uring,
    /// Always use the portable fallback
    Posix,
}

impl FromStr for BackendPreference {
    type Err = IoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendPreference::Auto),
            "uring" | "io_uring" | "aio" => Ok(BackendPreference::Uring),
            "posix" | "nio" | "fallback" => Ok(BackendPreference::Posix),
            other => Err(IoError::InvalidArgument(format!(
                "unknown backend '{}'",
                other
            ))),
        }
    }
}

/// Configuration for journal files
#[derive(Debug, Clone)]
pub struct IoConfig {
    /// Maximum concurrent operations per file
    pub max_io: usize,

    /// Backend selection
    pub backend: BackendPreference,

    /// How long close waits between drain warnings
    pub drain_warn_interval: Duration,

    /// Funnel writes through one dedicated thread
    pub serialize_writes: bool,

    /// Open files with O_DIRECT on the io_uring backend
    pub direct_io: bool,

    /// Blocking threads used by the portable backend
    pub posix_threads: usize,

    /// Process-wide limit on reserved IO slots (None = unlimited)
    pub io_limit: Option<usize>,

    /// Released buffers retained per capacity by the buffer pool
    pub buffer_pool_size: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            max_io: DEFAULT_MAX_IO,
            backend: BackendPreference::Auto,
            drain_warn_interval: DEFAULT_DRAIN_WARN_INTERVAL,
            serialize_writes: true,
            direct_io: true,
            posix_threads: DEFAULT_POSIX_THREADS,
            io_limit: None,
            buffer_pool_size: DEFAULT_BUFFER_POOL_SIZE,
        }
    }
}

impl IoConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by environment variables
    ///
    /// - `ROOMQ_JOURNAL_MAX_IO`
    /// - `ROOMQ_JOURNAL_BACKEND` (`auto`, `uring`, `posix`)
    /// - `ROOMQ_JOURNAL_DIRECT_IO` (`true`/`false`)
    /// - `ROOMQ_JOURNAL_IO_LIMIT`
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(max_io) = parse_env::<usize>("ROOMQ_JOURNAL_MAX_IO") {
            config.max_io = max_io;
        }
        if let Some(backend) = parse_env::<BackendPreference>("ROOMQ_JOURNAL_BACKEND") {
            config.backend = backend;
        }
        if let Some(direct) = parse_env::<bool>("ROOMQ_JOURNAL_DIRECT_IO") {
            config.direct_io = direct;
        }
        if let Some(limit) = parse_env::<usize>("ROOMQ_JOURNAL_IO_LIMIT") {
            config.io_limit = Some(limit);
        }

        config
    }

    /// Set the maximum concurrent operations per file
    pub fn with_max_io(mut self, max_io: usize) -> Self {
        self.max_io = max_io;
        self
    }

    /// Set the backend preference
    pub fn with_backend(mut self, backend: BackendPreference) -> Self {
        self.backend = backend;
        self
    }

    /// Set the drain warning interval
    pub fn with_drain_warn_interval(mut self, interval: Duration) -> Self {
        self.drain_warn_interval = interval;
        self
    }

    /// Enable or disable the single write thread
    pub fn with_serialize_writes(mut self, enabled: bool) -> Self {
        self.serialize_writes = enabled;
        self
    }

    /// Enable or disable O_DIRECT
    pub fn with_direct_io(mut self, enabled: bool) -> Self {
        self.direct_io = enabled;
        self
    }

    /// Set the blocking thread count of the portable backend
    pub fn with_posix_threads(mut self, threads: usize) -> Self {
        self.posix_threads = threads.max(1);
        self
    }

    /// Set the process-wide IO slot limit
    pub fn with_io_limit(mut self, limit: Option<usize>) -> Self {
        self.io_limit = limit;
        self
    }

    /// Set how many released buffers are retained per capacity
    pub fn with_buffer_pool_size(mut self, size: usize) -> Self {
        self.buffer_pool_size = size;
        self
    }
}

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable configuration value");
            None
        }
    }
}
