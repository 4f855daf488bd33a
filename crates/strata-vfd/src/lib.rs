//! Virtual file drivers for strata.
//!
//! A file driver maps a flat, typed address space onto storage. Three
//! backends ship here:
//!
//! - [`MemoryDriver`]: the file lives in a growable image, optionally
//!   mirrored to a backing file on flush
//! - [`PosixDriver`]: direct positioned I/O on one OS file
//! - [`LogDriver`]: posix I/O with per-byte access tracking and a text log
//!
//! ## Address model
//!
//! Every driver keeps an end-of-address (EOA), the highest address handed
//! out, and an end-of-file (EOF), the size of the underlying storage. Reads
//! past EOF return zeros. `truncate` brings EOF back in line with EOA.
//!
//! Buffers for file images and tracking arrays are drawn from the
//! [`strata_freelist`] block pools held by a [`DriverContext`].

#[cfg(not(unix))]
compile_error!("strata-vfd requires a unix platform");

pub mod backends;
pub mod common;
pub mod config;
pub mod dirty;
pub mod driver;
pub mod error;
pub mod platform;
pub mod types;

pub use backends::{AccessRun, LogDriver, LogTotals, MemoryDriver, OpStats, PosixDriver};
pub use config::{
    FileLocking, IoMode, LogConfig, LogFlags, LogTarget, MemoryConfig, PosixConfig, StrataConfig,
};
pub use dirty::{DirtyRegion, DirtyRegionTracker};
pub use driver::{DriverContext, FileDriver, OpenDriver};
pub use error::{IoOp, VfdError, VfdResult};
pub use types::{ADDR_UNDEF, Addr, Features, MAXADDR, MemType, OpenFlags};
