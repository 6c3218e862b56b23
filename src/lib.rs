//! RooMQ journal storage
//!
//! Features:
//! - Bounded asynchronous file IO with exactly-once completion callbacks
//! - io_uring on Linux, POSIX fallback elsewhere
//! - Sequential journal files created by a backend-agnostic factory

pub mod io;
pub mod journal;
