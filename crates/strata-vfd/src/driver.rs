//! The file driver contract.
//!
//! A driver presents a file as a flat, byte-addressed space with two
//! independent extents:
//!
//! - **EOA** (end of allocated address): set by the caller as space is
//!   handed out
//! - **EOF** (end of file): the physical extent of the storage
//!
//! Reads past EOF return zeros. Writes past EOF grow the storage.
//!
//! ## Design Decisions
//!
//! - **Blocking calls**: every operation runs to completion on the calling
//!   thread. There is no async layer and no cancellation.
//! - **Open is separate**: [`OpenDriver`] carries the per-backend config
//!   type, so [`FileDriver`] stays object safe and callers can hold a
//!   `Box<dyn FileDriver>`.
//! - **Closed drivers error**: after `close`, every operation returns
//!   [`VfdError::NotOpen`]. Dropping an open driver closes it best-effort.

use std::cmp::Ordering;
use std::os::fd::BorrowedFd;

use strata_freelist::{BlockPool, SharedAllocator, shared_allocator};

use crate::config::{FileLocking, IoMode};
use crate::error::{VfdError, VfdResult};
use crate::types::{Addr, Features, MemType, OpenFlags, region_overflow};

/// Shared state every driver is opened against.
///
/// Cloning is cheap; clones share the allocator and pools.
#[derive(Debug, Clone)]
pub struct DriverContext {
    allocator: SharedAllocator,
    image_pool: BlockPool,
    tracking_pool: BlockPool,
    locking: FileLocking,
    io_mode: IoMode,
}

impl Default for DriverContext {
    fn default() -> Self {
        Self::new(shared_allocator())
    }
}

impl DriverContext {
    pub fn new(allocator: SharedAllocator) -> Self {
        Self {
            image_pool: BlockPool::new(&allocator, "memory file image"),
            tracking_pool: BlockPool::new(&allocator, "log tracking arrays"),
            allocator,
            locking: FileLocking::default(),
            io_mode: IoMode::default(),
        }
    }

    pub fn with_locking(mut self, locking: FileLocking) -> Self {
        self.locking = locking;
        self
    }

    pub fn with_io_mode(mut self, io_mode: IoMode) -> Self {
        self.io_mode = io_mode;
        self
    }

    pub fn allocator(&self) -> &SharedAllocator {
        &self.allocator
    }

    /// Pool backing in-memory file images.
    pub fn image_pool(&self) -> &BlockPool {
        &self.image_pool
    }

    /// Pool backing per-byte tracking arrays.
    pub fn tracking_pool(&self) -> &BlockPool {
        &self.tracking_pool
    }

    pub fn locking(&self) -> FileLocking {
        self.locking
    }

    pub fn io_mode(&self) -> IoMode {
        self.io_mode
    }
}

/// Operations every backend implements.
pub trait FileDriver: Send + std::fmt::Debug {
    /// Short backend name.
    fn name(&self) -> &'static str;

    /// Flush and release everything. Later calls return `NotOpen`.
    fn close(&mut self) -> VfdResult<()>;

    /// Capabilities of this driver instance.
    fn query(&self) -> VfdResult<Features>;

    // ========================================================================
    // Address space
    // ========================================================================

    fn get_eoa(&self, ty: MemType) -> VfdResult<Addr>;

    fn set_eoa(&mut self, ty: MemType, addr: Addr) -> VfdResult<()>;

    /// Physical end of file.
    fn get_eof(&self, ty: MemType) -> VfdResult<Addr>;

    /// Hand out `size` bytes at the current EOA and advance it.
    fn alloc(&mut self, ty: MemType, size: u64) -> VfdResult<Addr> {
        let addr = self.get_eoa(ty)?;
        if region_overflow(addr, size) {
            return Err(VfdError::overflow(format!(
                "allocating {size} bytes at {addr} exceeds the address space"
            )));
        }
        self.set_eoa(ty, addr + size)?;
        Ok(addr)
    }

    /// Return space. Only a region ending exactly at EOA is reclaimed.
    fn free(&mut self, ty: MemType, addr: Addr, size: u64) -> VfdResult<()> {
        if region_overflow(addr, size) {
            return Err(VfdError::overflow(format!(
                "freeing {size} bytes at {addr} exceeds the address space"
            )));
        }
        if addr + size == self.get_eoa(ty)? {
            self.set_eoa(ty, addr)?;
        }
        Ok(())
    }

    // ========================================================================
    // Data
    // ========================================================================

    /// Fill `buf` from `addr`. Bytes past EOF read as zero.
    fn read(&mut self, ty: MemType, addr: Addr, buf: &mut [u8]) -> VfdResult<()>;

    /// Write `buf` at `addr`, growing the file as needed.
    fn write(&mut self, ty: MemType, addr: Addr, buf: &[u8]) -> VfdResult<()>;

    /// Push buffered data to storage.
    fn flush(&mut self, _closing: bool) -> VfdResult<()> {
        Ok(())
    }

    /// Make EOF agree with EOA.
    fn truncate(&mut self, closing: bool) -> VfdResult<()>;

    // ========================================================================
    // Locking and identity
    // ========================================================================

    /// Take a non-blocking advisory lock.
    fn lock(&mut self, exclusive: bool) -> VfdResult<()>;

    fn unlock(&mut self) -> VfdResult<()>;

    /// The OS handle, when the driver has one.
    fn handle(&self) -> VfdResult<Option<BorrowedFd<'_>>>;

    /// Order two drivers; `Equal` means the same underlying file.
    fn cmp(&self, other: &Self) -> Ordering
    where
        Self: Sized;
}

/// Opening a backend with its own config type.
pub trait OpenDriver: FileDriver + Sized {
    type Config;

    /// Open `name`. `maxaddr` bounds the address space and must be neither
    /// zero nor undefined.
    fn open(
        ctx: &DriverContext,
        name: &str,
        flags: OpenFlags,
        config: &Self::Config,
        maxaddr: Addr,
    ) -> VfdResult<Self>;
}
