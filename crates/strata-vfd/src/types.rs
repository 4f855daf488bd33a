//! Core driver types: addresses, open flags, feature flags, memory types.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// A byte address in a driver's address space.
pub type Addr = u64;

/// The undefined address.
pub const ADDR_UNDEF: Addr = u64::MAX;

/// Largest representable address: addresses must fit a signed 64-bit
/// file offset.
pub const MAXADDR: Addr = i64::MAX as u64;

/// Whether `addr` is a real address.
pub fn addr_defined(addr: Addr) -> bool {
    addr != ADDR_UNDEF
}

/// Whether `addr` is undefined or beyond [`MAXADDR`].
pub fn addr_overflow(addr: Addr) -> bool {
    !addr_defined(addr) || addr & !MAXADDR != 0
}

/// Whether `size` cannot be represented as a file offset.
pub fn size_overflow(size: u64) -> bool {
    size & !MAXADDR != 0
}

/// Whether the region `[addr, addr + size)` leaves the address space.
pub fn region_overflow(addr: Addr, size: u64) -> bool {
    if addr_overflow(addr) || size_overflow(size) {
        return true;
    }
    match addr.checked_add(size) {
        Some(end) => end == ADDR_UNDEF || end > MAXADDR,
        None => true,
    }
}

/// Flags for opening a file driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFlags {
    /// Open read-write rather than read-only.
    pub write: bool,
    /// Create the file if it does not exist.
    pub create: bool,
    /// Truncate the file on open.
    pub truncate: bool,
    /// Fail if the file already exists (with `create`).
    pub exclusive: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self::default()
    }

    pub fn read_write() -> Self {
        Self {
            write: true,
            ..Default::default()
        }
    }

    /// Read-write, create, truncate.
    pub fn create() -> Self {
        Self {
            write: true,
            create: true,
            truncate: true,
            exclusive: false,
        }
    }

    /// Read-write, create, fail if the file exists.
    pub fn create_exclusive() -> Self {
        Self {
            write: true,
            create: true,
            truncate: false,
            exclusive: true,
        }
    }
}

impl fmt::Display for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.write { "RDWR" } else { "RDONLY" })?;
        for (set, name) in [
            (self.create, "CREAT"),
            (self.truncate, "TRUNC"),
            (self.exclusive, "EXCL"),
        ] {
            if set {
                write!(f, "|{name}")?;
            }
        }
        Ok(())
    }
}

bitflags! {
    /// Capabilities a driver reports from `query`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Features: u64 {
        const AGGREGATE_METADATA = 1 << 0;
        const ACCUMULATE_METADATA = 1 << 1;
        const DATA_SIEVE = 1 << 2;
        const AGGREGATE_SMALLDATA = 1 << 3;
        const IGNORE_DRVRINFO = 1 << 4;
        const POSIX_COMPAT_HANDLE = 1 << 6;
        const ALLOW_FILE_IMAGE = 1 << 10;
        const CAN_USE_FILE_IMAGE_CALLBACKS = 1 << 11;
        const SUPPORTS_SWMR_IO = 1 << 12;
        const DEFAULT_VFD_COMPATIBLE = 1 << 15;
    }
}

impl Features {
    /// Metadata aggregation, accumulation, data sieving and small-data
    /// aggregation, which every driver here supports.
    pub fn base() -> Self {
        Self::AGGREGATE_METADATA
            | Self::ACCUMULATE_METADATA
            | Self::DATA_SIEVE
            | Self::AGGREGATE_SMALLDATA
    }
}

/// The kind of data stored at an address.
///
/// `Default` marks untagged space; the rest are metadata or raw-data
/// categories used for allocation bookkeeping and flavor tracking.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumString, EnumIter,
    Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum MemType {
    #[default]
    Default = 0,
    Super = 1,
    Btree = 2,
    Draw = 3,
    Gheap = 4,
    Lheap = 5,
    Ohdr = 6,
}

impl MemType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode a tag byte. Unknown values map to `None`.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Default,
            1 => Self::Super,
            2 => Self::Btree,
            3 => Self::Draw,
            4 => Self::Gheap,
            5 => Self::Lheap,
            6 => Self::Ohdr,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_overflow_bounds() {
        assert!(!addr_overflow(0));
        assert!(!addr_overflow(MAXADDR));
        assert!(addr_overflow(MAXADDR + 1));
        assert!(addr_overflow(ADDR_UNDEF));

        assert!(!region_overflow(0, MAXADDR));
        assert!(region_overflow(1, MAXADDR));
        assert!(region_overflow(MAXADDR, 1));
        assert!(!region_overflow(MAXADDR - 10, 10));
        assert!(region_overflow(0, MAXADDR + 1));
    }

    #[test]
    fn test_open_flags_display() {
        assert_eq!(OpenFlags::read_only().to_string(), "RDONLY");
        assert_eq!(OpenFlags::create().to_string(), "RDWR|CREAT|TRUNC");
        assert_eq!(OpenFlags::create_exclusive().to_string(), "RDWR|CREAT|EXCL");
    }

    #[test]
    fn test_mem_type_tags_roundtrip() {
        for ty in MemType::iter() {
            assert_eq!(MemType::from_u8(ty.as_u8()), Some(ty));
        }
        assert_eq!(MemType::from_u8(7), None);
        assert_eq!("OHDR".parse::<MemType>().unwrap(), MemType::Ohdr);
        assert_eq!(MemType::Btree.to_string(), "btree");
    }
}
