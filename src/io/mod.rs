//! Asynchronous file IO for the journal
//!
//! This module provides bounded, callback-driven file IO:
//! - Linux: io_uring with direct IO when the startup probe validates it
//! - Everywhere else, or when the probe fails: positioned reads and writes on
//!   a blocking thread pool
//!
//! Buffers handed to the io_uring backend must be aligned to [`BLOCK_SIZE`]
//! (512 bytes), as must file offsets and transfer sizes. Use
//! [`BackendFactory::alignment`] to find out what the active backend needs.

pub mod aligned_buffer;
pub mod async_file;
pub mod backend;
pub mod budget;
pub mod buffer_pool;
pub mod callback;
pub mod config;
pub mod error;
pub mod executor;
pub mod pending;
pub mod permits;
mod poller;
pub mod stats;

pub use aligned_buffer::{AlignedBuffer, BLOCK_SIZE};
pub use async_file::AsyncFile;
pub use backend::{
    uring_available, Backend, BackendFactory, BackendSupport, PosixBackendFactory,
};
pub use budget::{BudgetReservation, IoBudget};
pub use buffer_pool::BufferPool;
pub use callback::{BufferCallback, IoCallback, WaitCallback};
pub use config::{BackendPreference, IoConfig};
pub use error::{ErrorCode, IoError, IoResult};
pub use executor::WriteExecutor;
pub use pending::PendingCounter;
pub use permits::{IoPermits, Permit};
pub use stats::IoStats;

#[cfg(target_os = "linux")]
pub use backend::UringBackendFactory;
