//! Journal file layer
//!
//! Sequential journal files on top of the async IO layer. The factory picks
//! the backend once; the files it creates never expose which one is active.

pub mod error;
pub mod factory;
pub mod sequential_file;

pub use error::{JournalError, JournalResult};
pub use factory::SequentialFileFactory;
pub use sequential_file::SequentialFile;
