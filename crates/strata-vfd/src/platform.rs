//! Raw file primitives over rustix.
//!
//! Every transfer call retries on `EINTR` and caps a single syscall at
//! [`MAX_IO_BYTES`]; looping over short transfers is left to the caller.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, IntoRawFd, OwnedFd};
use std::path::Path;

use rustix::fs::{FlockOperation, Mode, OFlags, SeekFrom};
use rustix::io::Errno;

use crate::types::OpenFlags;

/// Largest transfer issued in one syscall.
pub const MAX_IO_BYTES: usize = 1 << 30;

/// Identity and size from `fstat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub device: u64,
    pub inode: u64,
}

fn retry<T>(mut op: impl FnMut() -> rustix::io::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(e) if e == Errno::INTR => continue,
            other => return other.map_err(io::Error::from),
        }
    }
}

/// Whether the OS reported that locking is not implemented.
pub fn is_unsupported(err: &io::Error) -> bool {
    err.raw_os_error() == Some(Errno::NOSYS.raw_os_error())
}

/// An open OS file. Closed when dropped, or by [`PlatformFile::close`] to
/// see the result.
#[derive(Debug)]
pub struct PlatformFile {
    fd: OwnedFd,
}

impl PlatformFile {
    pub fn open(path: &Path, flags: OpenFlags) -> io::Result<Self> {
        let mut oflags = if flags.write {
            OFlags::RDWR
        } else {
            OFlags::RDONLY
        };
        if flags.truncate {
            oflags |= OFlags::TRUNC;
        }
        if flags.create {
            oflags |= OFlags::CREATE;
        }
        if flags.exclusive {
            oflags |= OFlags::EXCL;
        }
        oflags |= OFlags::CLOEXEC;

        let mode = Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP | Mode::ROTH | Mode::WOTH;
        let fd = retry(|| rustix::fs::open(path, oflags, mode))?;
        Ok(Self { fd })
    }

    pub fn stat(&self) -> io::Result<FileStat> {
        let st = retry(|| rustix::fs::fstat(&self.fd))?;
        Ok(FileStat {
            size: u64::try_from(st.st_size).map_err(|_| io::Error::other("negative file size"))?,
            device: st.st_dev as u64,
            inode: st.st_ino as u64,
        })
    }

    pub fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let len = buf.len().min(MAX_IO_BYTES);
        retry(|| rustix::io::pread(&self.fd, &mut buf[..len], offset))
    }

    pub fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let len = buf.len().min(MAX_IO_BYTES);
        retry(|| rustix::io::pwrite(&self.fd, &buf[..len], offset))
    }

    /// Read at the current file position.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len().min(MAX_IO_BYTES);
        retry(|| rustix::io::read(&self.fd, &mut buf[..len]))
    }

    /// Write at the current file position.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let len = buf.len().min(MAX_IO_BYTES);
        retry(|| rustix::io::write(&self.fd, &buf[..len]))
    }

    pub fn seek(&self, offset: u64) -> io::Result<u64> {
        retry(|| rustix::fs::seek(&self.fd, SeekFrom::Start(offset)))
    }

    pub fn truncate(&self, len: u64) -> io::Result<()> {
        retry(|| rustix::fs::ftruncate(&self.fd, len))
    }

    /// Non-blocking advisory lock.
    pub fn lock(&self, exclusive: bool) -> io::Result<()> {
        let op = if exclusive {
            FlockOperation::NonBlockingLockExclusive
        } else {
            FlockOperation::NonBlockingLockShared
        };
        retry(|| rustix::fs::flock(&self.fd, op))
    }

    pub fn unlock(&self) -> io::Result<()> {
        retry(|| rustix::fs::flock(&self.fd, FlockOperation::Unlock))
    }

    /// Close the descriptor and report what the OS said.
    ///
    /// Not retried on `EINTR`: the descriptor is gone either way.
    pub fn close(self) -> io::Result<()> {
        let raw = self.fd.into_raw_fd();
        // SAFETY: `raw` was owned by the consumed `OwnedFd`, so nothing else
        // closes it.
        if unsafe { libc::close(raw) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl AsFd for PlatformFile {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
