//! Direct posix file driver.
//!
//! Every call goes straight to the OS through [`PosixCommon`].

use std::cmp::Ordering;
use std::os::fd::BorrowedFd;

use tracing::warn;

use crate::common::PosixCommon;
use crate::config::PosixConfig;
use crate::driver::{DriverContext, FileDriver, OpenDriver};
use crate::error::{VfdError, VfdResult};
use crate::types::{Addr, Features, MemType, OpenFlags};

/// A file accessed with plain posix I/O.
#[derive(Debug)]
pub struct PosixDriver {
    common: Option<PosixCommon>,
    ignore_driver_info: bool,
}

impl PosixDriver {
    fn common(&self) -> VfdResult<&PosixCommon> {
        self.common.as_ref().ok_or(VfdError::NotOpen)
    }

    fn common_mut(&mut self) -> VfdResult<&mut PosixCommon> {
        self.common.as_mut().ok_or(VfdError::NotOpen)
    }

    pub fn file_name(&self) -> VfdResult<&str> {
        Ok(self.common()?.file_name())
    }

    pub fn is_open(&self) -> bool {
        self.common.is_some()
    }
}

impl OpenDriver for PosixDriver {
    type Config = PosixConfig;

    #[tracing::instrument(skip(ctx, config), name = "vfd.posix.open")]
    fn open(
        ctx: &DriverContext,
        name: &str,
        flags: OpenFlags,
        config: &PosixConfig,
        maxaddr: Addr,
    ) -> VfdResult<Self> {
        let (common, _) = PosixCommon::open(ctx, name, flags, maxaddr)?;
        Ok(Self {
            common: Some(common),
            ignore_driver_info: config.ignore_driver_info,
        })
    }
}

impl FileDriver for PosixDriver {
    fn name(&self) -> &'static str {
        "posix"
    }

    #[tracing::instrument(skip(self), name = "vfd.posix.close")]
    fn close(&mut self) -> VfdResult<()> {
        let common = self.common.take().ok_or(VfdError::NotOpen)?;
        common.close();
        Ok(())
    }

    fn query(&self) -> VfdResult<Features> {
        self.common()?;
        let mut features = Features::base()
            | Features::POSIX_COMPAT_HANDLE
            | Features::SUPPORTS_SWMR_IO
            | Features::DEFAULT_VFD_COMPATIBLE;
        if self.ignore_driver_info {
            features |= Features::IGNORE_DRVRINFO;
        }
        Ok(features)
    }

    fn get_eoa(&self, _ty: MemType) -> VfdResult<Addr> {
        Ok(self.common()?.eoa())
    }

    fn set_eoa(&mut self, _ty: MemType, addr: Addr) -> VfdResult<()> {
        self.common_mut()?.set_eoa(addr)
    }

    fn get_eof(&self, _ty: MemType) -> VfdResult<Addr> {
        Ok(self.common()?.eof())
    }

    fn read(&mut self, _ty: MemType, addr: Addr, buf: &mut [u8]) -> VfdResult<()> {
        self.common_mut()?.read(addr, buf).map(|_| ())
    }

    fn write(&mut self, _ty: MemType, addr: Addr, buf: &[u8]) -> VfdResult<()> {
        self.common_mut()?.write(addr, buf).map(|_| ())
    }

    #[tracing::instrument(skip(self), name = "vfd.posix.truncate")]
    fn truncate(&mut self, _closing: bool) -> VfdResult<()> {
        self.common_mut()?.truncate(None).map(|_| ())
    }

    fn lock(&mut self, exclusive: bool) -> VfdResult<()> {
        self.common_mut()?.lock(exclusive).map(|_| ())
    }

    fn unlock(&mut self) -> VfdResult<()> {
        self.common_mut()?.unlock().map(|_| ())
    }

    fn handle(&self) -> VfdResult<Option<BorrowedFd<'_>>> {
        Ok(Some(self.common()?.handle()))
    }

    fn cmp(&self, other: &Self) -> Ordering {
        match (self.common.as_ref(), other.common.as_ref()) {
            (Some(a), Some(b)) => a.cmp(b),
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
        }
    }
}

impl Drop for PosixDriver {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(e) = self.close() {
                warn!(error = %e, "posix driver close on drop failed");
            }
        }
    }
}
