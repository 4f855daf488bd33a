//! File driver backends.
//!
//! Each backend implements [`FileDriver`](crate::FileDriver) and
//! [`OpenDriver`](crate::OpenDriver).

mod log;
mod memory;
mod posix;

pub use log::{AccessRun, LogDriver, LogTotals, OpStats, run_length_encode};
pub use memory::MemoryDriver;
pub use posix::PosixDriver;
