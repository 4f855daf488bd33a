//! In-memory file driver.
//!
//! The whole file lives in one heap image drawn from the context's block
//! pool. With a backing store, the image is loaded from the named file on
//! open and written back on flush; with write tracking only the pages
//! touched since the last flush go to disk.
//!
//! ## Design Decisions
//!
//! - **Grow in increments**: writes past EOF grow the image to the next
//!   multiple of `increment`, zero-filling the new space. Writes never
//!   shrink it; only `truncate` does.
//! - **EOF is the image size**: the backing file's own extent is tracked
//!   separately by [`PosixCommon`] and only synchronized on a closing
//!   truncate.

use std::cmp::Ordering;
use std::num::NonZeroU64;
use std::os::fd::BorrowedFd;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use strata_freelist::{Block, BlockPool};
use tracing::{debug, trace, warn};

use crate::common::{PosixCommon, check_maxaddr};
use crate::config::{DEFAULT_INCREMENT, MemoryConfig};
use crate::dirty::{DirtyRegion, DirtyRegionTracker};
use crate::driver::{DriverContext, FileDriver, OpenDriver};
use crate::error::{VfdError, VfdResult};
use crate::types::{Addr, Features, MemType, OpenFlags, addr_overflow, region_overflow};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

fn to_len(addr: Addr) -> VfdResult<usize> {
    usize::try_from(addr)
        .map_err(|_| VfdError::CantAlloc(format!("{addr} bytes exceeds the address width")))
}

/// Round `addr` up to a multiple of `increment`.
fn round_up(addr: Addr, increment: u64) -> Addr {
    addr.div_ceil(increment) * increment
}

#[derive(Debug)]
struct MemoryState {
    name: Option<String>,
    pool: BlockPool,
    image: Option<Block>,
    eoa: Addr,
    eof: Addr,
    increment: u64,
    backing: Option<PosixCommon>,
    backing_store: bool,
    dirty: bool,
    tracker: Option<DirtyRegionTracker>,
}

impl MemoryState {
    fn image(&self) -> &[u8] {
        self.image.as_deref().unwrap_or(&[])
    }

    /// Resize the image to `new_len` bytes, zero-filling any growth.
    fn resize_image(&mut self, new_len: Addr) -> VfdResult<()> {
        let new_len = to_len(new_len)?;
        match self.image.as_mut() {
            None if new_len == 0 => {}
            None => self.image = Some(self.pool.calloc(new_len)?),
            Some(_) if new_len == 0 => {
                if let Some(block) = self.image.take() {
                    self.pool.free(block)?;
                }
            }
            Some(block) => {
                let old_len = block.size();
                self.pool.resize(block, new_len)?;
                if new_len > old_len {
                    block[old_len..].fill(0);
                }
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> VfdResult<()> {
        if !self.dirty || !self.backing_store {
            return Ok(());
        }
        let Some(backing) = self.backing.as_mut() else {
            return Ok(());
        };
        let image = self.image.as_deref().unwrap_or(&[]);
        let eof = self.eof;

        match self.tracker.as_mut() {
            Some(tracker) => {
                while let Some(region) = tracker.pop_first() {
                    if region.start >= eof {
                        continue;
                    }
                    let end = region.end.min(eof - 1);
                    trace!(start = region.start, end, "flushing dirty region");
                    backing.write(region.start, &image[region.start as usize..=end as usize])?;
                }
            }
            None => {
                backing.write(0, &image[..eof as usize])?;
            }
        }
        self.dirty = false;
        Ok(())
    }
}

/// A file held entirely in memory.
#[derive(Debug)]
pub struct MemoryDriver {
    serial: u64,
    state: Option<MemoryState>,
}

impl MemoryDriver {
    fn state(&self) -> VfdResult<&MemoryState> {
        self.state.as_ref().ok_or(VfdError::NotOpen)
    }

    fn state_mut(&mut self) -> VfdResult<&mut MemoryState> {
        self.state.as_mut().ok_or(VfdError::NotOpen)
    }

    /// The current image, `eof` bytes long.
    pub fn image(&self) -> VfdResult<&[u8]> {
        Ok(self.state()?.image())
    }

    /// Pending dirty regions, when write tracking is active.
    pub fn dirty_regions(&self) -> VfdResult<Option<Vec<DirtyRegion>>> {
        Ok(self
            .state()?
            .tracker
            .as_ref()
            .map(|t| t.regions().collect()))
    }

    /// Whether there are writes not yet flushed to the backing store.
    pub fn is_dirty(&self) -> VfdResult<bool> {
        Ok(self.state()?.dirty)
    }

    pub fn is_open(&self) -> bool {
        self.state.is_some()
    }
}

impl OpenDriver for MemoryDriver {
    type Config = MemoryConfig;

    #[tracing::instrument(skip(ctx, config), name = "vfd.memory.open")]
    fn open(
        ctx: &DriverContext,
        name: &str,
        flags: OpenFlags,
        config: &MemoryConfig,
        maxaddr: Addr,
    ) -> VfdResult<Self> {
        check_maxaddr(maxaddr)?;

        let image = config.initial_image.as_deref().filter(|i| !i.is_empty());
        let mut backing = if image.is_some() && !flags.create {
            if !name.is_empty() && Path::new(name).exists() {
                return Err(VfdError::FileExists(name.to_string()));
            }
            if config.backing_store {
                let forced = OpenFlags {
                    create: true,
                    ..flags
                };
                Some(PosixCommon::open(ctx, name, forced, maxaddr)?.0)
            } else {
                None
            }
        } else if config.backing_store || !flags.create {
            Some(PosixCommon::open(ctx, name, flags, maxaddr)?.0)
        } else {
            None
        };

        let increment = if config.increment > 0 {
            config.increment
        } else {
            DEFAULT_INCREMENT
        };

        let tracker = (config.write_tracking && flags.write && config.backing_store)
            .then(|| NonZeroU64::new(config.page_size).map(DirtyRegionTracker::new))
            .flatten();

        let pool = ctx.image_pool().clone();
        let mut state = MemoryState {
            name: (!name.is_empty()).then(|| name.to_string()),
            pool,
            image: None,
            eoa: 0,
            eof: 0,
            increment,
            backing: None,
            backing_store: config.backing_store,
            dirty: false,
            tracker,
        };

        if !flags.create {
            let size = match (image, backing.as_ref()) {
                (Some(image), _) => image.len() as u64,
                (None, Some(backing)) => backing.eof(),
                (None, None) => 0,
            };
            if size > 0 {
                let mut block = state.pool.alloc(to_len(size)?)?;
                let loaded = match (image, backing.as_mut()) {
                    (Some(image), _) => {
                        block.copy_from_slice(image);
                        Ok(())
                    }
                    (None, Some(backing)) => backing.read(0, &mut block).map(|_| ()),
                    (None, None) => Ok(()),
                };
                if let Err(e) = loaded {
                    if let Err(free_err) = state.pool.free(block) {
                        warn!(error = %free_err, "failed to release image after load error");
                    }
                    return Err(e);
                }
                state.image = Some(block);
                state.eof = size;

                // A supplied image is new to the backing file
                if image.is_some() && config.backing_store {
                    state.dirty = true;
                    if let Some(tracker) = state.tracker.as_mut() {
                        tracker.insert(0, size - 1, size)?;
                    }
                }
            }
        }

        state.backing = backing;
        debug!(eof = state.eof, increment, tracking = state.tracker.is_some(), "memory file open");
        Ok(Self {
            serial: NEXT_SERIAL.fetch_add(1, AtomicOrdering::Relaxed),
            state: Some(state),
        })
    }
}

impl FileDriver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    #[tracing::instrument(skip(self), name = "vfd.memory.close")]
    fn close(&mut self) -> VfdResult<()> {
        let mut state = self.state.take().ok_or(VfdError::NotOpen)?;

        let mut first_err = state.flush().err();
        if let Some(tracker) = state.tracker.as_mut() {
            tracker.clear();
        }
        if let Some(backing) = state.backing.take() {
            backing.close();
        }
        if let Some(image) = state.image.take() {
            if let Err(e) = state.pool.free(image) {
                first_err.get_or_insert(e.into());
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn query(&self) -> VfdResult<Features> {
        let state = self.state()?;
        let mut features = Features::base()
            | Features::ALLOW_FILE_IMAGE
            | Features::CAN_USE_FILE_IMAGE_CALLBACKS;
        if state.backing.is_some() && state.backing_store {
            features |= Features::POSIX_COMPAT_HANDLE | Features::DEFAULT_VFD_COMPATIBLE;
        }
        Ok(features)
    }

    fn get_eoa(&self, _ty: MemType) -> VfdResult<Addr> {
        Ok(self.state()?.eoa)
    }

    fn set_eoa(&mut self, _ty: MemType, addr: Addr) -> VfdResult<()> {
        let state = self.state_mut()?;
        if addr_overflow(addr) {
            return Err(VfdError::overflow(format!("address {addr} overflow")));
        }
        state.eoa = addr;
        Ok(())
    }

    fn get_eof(&self, _ty: MemType) -> VfdResult<Addr> {
        Ok(self.state()?.eof)
    }

    fn read(&mut self, _ty: MemType, addr: Addr, buf: &mut [u8]) -> VfdResult<()> {
        let state = self.state()?;
        let size = buf.len() as u64;
        if region_overflow(addr, size) {
            return Err(VfdError::overflow(format!(
                "file read request at {addr} of {size} bytes overflows"
            )));
        }

        let mut copied = 0;
        if addr < state.eof {
            let n = size.min(state.eof - addr) as usize;
            let from = addr as usize;
            buf[..n].copy_from_slice(&state.image()[from..from + n]);
            copied = n;
        }
        buf[copied..].fill(0);
        Ok(())
    }

    fn write(&mut self, _ty: MemType, addr: Addr, buf: &[u8]) -> VfdResult<()> {
        let state = self.state_mut()?;
        let size = buf.len() as u64;
        if region_overflow(addr, size) {
            return Err(VfdError::overflow(format!(
                "file write request at {addr} of {size} bytes overflows"
            )));
        }
        if buf.is_empty() {
            return Ok(());
        }

        let end = addr + size;
        if end > state.eof {
            let new_eof = round_up(end, state.increment);
            state.resize_image(new_eof)?;
            trace!(old_eof = state.eof, new_eof, "grew memory image");
            state.eof = new_eof;
        }

        if let Some(tracker) = state.tracker.as_mut() {
            tracker.insert(addr, end - 1, state.eof)?;
        }

        let from = addr as usize;
        if let Some(image) = state.image.as_mut() {
            image[from..from + buf.len()].copy_from_slice(buf);
        }
        state.dirty = true;
        Ok(())
    }

    #[tracing::instrument(skip(self), name = "vfd.memory.flush")]
    fn flush(&mut self, _closing: bool) -> VfdResult<()> {
        self.state_mut()?.flush()
    }

    #[tracing::instrument(skip(self), name = "vfd.memory.truncate")]
    fn truncate(&mut self, closing: bool) -> VfdResult<()> {
        let state = self.state_mut()?;
        if closing && !state.backing_store {
            return Ok(());
        }

        let new_eof = if closing {
            state.eoa
        } else {
            round_up(state.eoa, state.increment)
        };
        if new_eof == state.eof {
            return Ok(());
        }

        state.resize_image(new_eof)?;
        if closing {
            if let Some(backing) = state.backing.as_mut() {
                backing.truncate(Some(new_eof))?;
            }
        }
        debug!(old_eof = state.eof, new_eof, "truncated memory image");
        state.eof = new_eof;
        Ok(())
    }

    fn lock(&mut self, exclusive: bool) -> VfdResult<()> {
        if let Some(backing) = self.state_mut()?.backing.as_mut() {
            backing.lock(exclusive)?;
        }
        Ok(())
    }

    fn unlock(&mut self) -> VfdResult<()> {
        if let Some(backing) = self.state_mut()?.backing.as_mut() {
            backing.unlock()?;
        }
        Ok(())
    }

    fn handle(&self) -> VfdResult<Option<BorrowedFd<'_>>> {
        Ok(self.state()?.backing.as_ref().map(PosixCommon::handle))
    }

    fn cmp(&self, other: &Self) -> Ordering {
        let (Some(a), Some(b)) = (self.state.as_ref(), other.state.as_ref()) else {
            return self.serial.cmp(&other.serial);
        };
        if let (Some(x), Some(y)) = (a.backing.as_ref(), b.backing.as_ref()) {
            return x.cmp(y);
        }
        match (&a.name, &b.name) {
            (None, None) => self.serial.cmp(&other.serial),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(y),
        }
    }
}

impl Drop for MemoryDriver {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(e) = self.close() {
                warn!(error = %e, "memory driver close on drop failed");
            }
        }
    }
}
