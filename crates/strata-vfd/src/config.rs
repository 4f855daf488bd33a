//! Driver configuration.
//!
//! Each backend takes its own config struct. [`StrataConfig`] bundles them
//! with the shared settings (free-list ceilings, locking policy, I/O mode)
//! and loads from RON:
//!
//! ```ron
//! (
//!     memory: (increment: 65536, backing_store: true, write_tracking: true),
//!     log: (target: File("/tmp/strata.log"), flags: "FILE_IO | NUM_IO"),
//!     locking: BestEffort,
//! )
//! ```

use std::path::{Path, PathBuf};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use strata_freelist::{AllocatorContext, FreeListLimits};
use thiserror::Error;

use crate::driver::DriverContext;

/// Environment variable that overrides [`FileLocking`].
pub const FILE_LOCKING_ENV: &str = "STRATA_USE_FILE_LOCKING";

/// Default memory growth increment.
pub const DEFAULT_INCREMENT: u64 = 8 * 1024;

/// Default dirty-tracking page size.
pub const DEFAULT_PAGE_SIZE: u64 = 512 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
}

/// Memory backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Growth step for the in-memory image. Zero selects the default.
    pub increment: u64,
    /// Mirror the image to the named file on flush and close.
    pub backing_store: bool,
    /// Flush only pages written since the last flush.
    pub write_tracking: bool,
    /// Granularity of dirty tracking.
    pub page_size: u64,
    /// Initial contents used instead of reading the file.
    #[serde(skip)]
    pub initial_image: Option<Vec<u8>>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            increment: DEFAULT_INCREMENT,
            backing_store: false,
            write_tracking: false,
            page_size: DEFAULT_PAGE_SIZE,
            initial_image: None,
        }
    }
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_increment(mut self, increment: u64) -> Self {
        self.increment = increment;
        self
    }

    pub fn with_backing_store(mut self, backing_store: bool) -> Self {
        self.backing_store = backing_store;
        self
    }

    pub fn with_write_tracking(mut self, page_size: u64) -> Self {
        self.write_tracking = true;
        self.page_size = page_size;
        self
    }

    pub fn with_image(mut self, image: Vec<u8>) -> Self {
        self.initial_image = Some(image);
        self
    }
}

/// Posix backend settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PosixConfig {
    /// Report `IGNORE_DRVRINFO` so callers reinterpret stored driver info.
    pub ignore_driver_info: bool,
}

bitflags! {
    /// What the logging backend records.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct LogFlags: u64 {
        const TRUNCATE = 0x0000_0001;
        const LOC_READ = 0x0000_0002;
        const LOC_WRITE = 0x0000_0004;
        const LOC_SEEK = 0x0000_0008;
        const FILE_READ = 0x0000_0010;
        const FILE_WRITE = 0x0000_0020;
        const FLAVOR = 0x0000_0040;
        const NUM_READ = 0x0000_0080;
        const NUM_WRITE = 0x0000_0100;
        const NUM_SEEK = 0x0000_0200;
        const NUM_TRUNCATE = 0x0000_0400;
        const TIME_OPEN = 0x0000_0800;
        const TIME_STAT = 0x0000_1000;
        const TIME_READ = 0x0000_2000;
        const TIME_WRITE = 0x0000_4000;
        const TIME_SEEK = 0x0000_8000;
        const TIME_TRUNCATE = 0x0001_0000;
        const TIME_CLOSE = 0x0002_0000;
        const ALLOC = 0x0004_0000;
        const FREE = 0x0008_0000;
        const TIME_LOCK = 0x0010_0000;
        const TIME_UNLOCK = 0x0020_0000;

        const LOC_IO = Self::LOC_READ.bits() | Self::LOC_WRITE.bits() | Self::LOC_SEEK.bits();
        const FILE_IO = Self::FILE_READ.bits() | Self::FILE_WRITE.bits();
        const NUM_IO = Self::NUM_READ.bits()
            | Self::NUM_WRITE.bits()
            | Self::NUM_SEEK.bits()
            | Self::NUM_TRUNCATE.bits();
        const TIME_IO = Self::TIME_OPEN.bits()
            | Self::TIME_STAT.bits()
            | Self::TIME_READ.bits()
            | Self::TIME_WRITE.bits()
            | Self::TIME_SEEK.bits()
            | Self::TIME_TRUNCATE.bits()
            | Self::TIME_CLOSE.bits()
            | Self::TIME_LOCK.bits()
            | Self::TIME_UNLOCK.bits();
        const ALL = Self::TRUNCATE.bits()
            | Self::LOC_IO.bits()
            | Self::FILE_IO.bits()
            | Self::FLAVOR.bits()
            | Self::NUM_IO.bits()
            | Self::TIME_IO.bits()
            | Self::ALLOC.bits()
            | Self::FREE.bits();
    }
}

impl Default for LogFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Where the logging backend writes its text output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogTarget {
    #[default]
    Stderr,
    File(PathBuf),
}

/// Logging backend settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub target: LogTarget,
    pub flags: LogFlags,
    /// Initial size of each per-byte tracking array. Arrays grow on demand.
    pub buf_size: usize,
    /// Fail reads and writes that hit bytes tagged with another flavor.
    pub strict_flavor: bool,
}

impl LogConfig {
    pub fn new(flags: LogFlags) -> Self {
        Self {
            flags,
            ..Default::default()
        }
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.target = LogTarget::File(path.into());
        self
    }

    pub fn with_buf_size(mut self, buf_size: usize) -> Self {
        self.buf_size = buf_size;
        self
    }

    pub fn with_strict_flavor(mut self, strict: bool) -> Self {
        self.strict_flavor = strict;
        self
    }
}

/// Advisory file locking policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileLocking {
    /// Lock, and fail when the filesystem does not support it.
    #[default]
    Enabled,
    /// Lock, but treat "not implemented" from the OS as success.
    BestEffort,
    /// Never issue lock calls.
    Disabled,
}

impl FileLocking {
    /// Parse an environment value: `TRUE`/`1`, `FALSE`/`0`, `BEST_EFFORT`.
    pub fn parse_env_value(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("true") || value == "1" {
            Some(Self::Enabled)
        } else if value.eq_ignore_ascii_case("false") || value == "0" {
            Some(Self::Disabled)
        } else if value.eq_ignore_ascii_case("best_effort") {
            Some(Self::BestEffort)
        } else {
            None
        }
    }

    /// Read [`FILE_LOCKING_ENV`], if set to a recognized value.
    pub fn from_env() -> Option<Self> {
        let value = std::env::var(FILE_LOCKING_ENV).ok()?;
        let parsed = Self::parse_env_value(&value);
        if parsed.is_none() {
            tracing::warn!(%value, "ignoring unrecognized {FILE_LOCKING_ENV}");
        }
        parsed
    }

    pub fn ignore_unsupported(self) -> bool {
        matches!(self, Self::BestEffort)
    }
}

/// How the posix layer issues transfers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoMode {
    /// `pread`/`pwrite` at explicit offsets.
    #[default]
    Positioned,
    /// Seek then `read`/`write`, skipping the seek when the file position
    /// already matches.
    Sequential,
}

/// Complete configuration for a strata driver stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    pub memory: MemoryConfig,
    pub posix: PosixConfig,
    pub log: LogConfig,
    pub free_lists: FreeListLimits,
    pub locking: FileLocking,
    pub io_mode: IoMode,
}

impl StrataConfig {
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_ron(&text)
    }

    /// Apply [`FILE_LOCKING_ENV`] on top of the loaded settings.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(locking) = FileLocking::from_env() {
            self.locking = locking;
        }
        self
    }

    /// Build a driver context with a fresh allocator using these limits.
    pub fn driver_context(&self) -> DriverContext {
        let allocator = AllocatorContext::new()
            .with_limits(self.free_lists)
            .into_shared();
        DriverContext::new(allocator)
            .with_locking(self.locking)
            .with_io_mode(self.io_mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StrataConfig::default();
        assert_eq!(config.memory.increment, 8192);
        assert!(!config.memory.backing_store);
        assert_eq!(config.log.flags, LogFlags::empty());
        assert_eq!(config.locking, FileLocking::Enabled);
        assert_eq!(config.io_mode, IoMode::Positioned);
    }

    #[test]
    fn test_parse_ron() {
        let config = StrataConfig::from_ron(
            r#"(
                memory: (increment: 4096, backing_store: true, write_tracking: true, page_size: 1024),
                log: (target: File("/tmp/trace.log"), flags: "FILE_READ | FILE_WRITE", strict_flavor: true),
                posix: (ignore_driver_info: true),
                locking: BestEffort,
                io_mode: Sequential,
            )"#,
        )
        .unwrap();

        assert_eq!(config.memory.increment, 4096);
        assert!(config.memory.write_tracking);
        assert_eq!(config.memory.page_size, 1024);
        assert_eq!(config.log.target, LogTarget::File("/tmp/trace.log".into()));
        assert_eq!(config.log.flags, LogFlags::FILE_READ | LogFlags::FILE_WRITE);
        assert!(config.log.strict_flavor);
        assert!(config.posix.ignore_driver_info);
        assert_eq!(config.locking, FileLocking::BestEffort);
        assert_eq!(config.io_mode, IoMode::Sequential);
        assert_eq!(config.free_lists, FreeListLimits::default());
    }

    #[test]
    fn test_parse_error() {
        let err = StrataConfig::from_ron("(memory: (increment: \"lots\"))").unwrap_err();
        assert!(matches!(err, ConfigError::Ron(_)));
    }

    #[test]
    fn test_locking_env_values() {
        assert_eq!(FileLocking::parse_env_value("TRUE"), Some(FileLocking::Enabled));
        assert_eq!(FileLocking::parse_env_value("1"), Some(FileLocking::Enabled));
        assert_eq!(FileLocking::parse_env_value("false"), Some(FileLocking::Disabled));
        assert_eq!(FileLocking::parse_env_value("0"), Some(FileLocking::Disabled));
        assert_eq!(
            FileLocking::parse_env_value("best_effort"),
            Some(FileLocking::BestEffort)
        );
        assert_eq!(FileLocking::parse_env_value("maybe"), None);
        assert!(FileLocking::BestEffort.ignore_unsupported());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("strata.ron");
        std::fs::write(&path, "(log: (flags: \"ALL\", buf_size: 128))").unwrap();
        let config = StrataConfig::load(&path).unwrap();
        assert_eq!(config.log.flags, LogFlags::ALL);
        assert_eq!(config.log.buf_size, 128);
    }
}
