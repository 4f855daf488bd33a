//! State and I/O shared by the posix-backed drivers.
//!
//! [`PosixCommon`] owns the OS file plus the bookkeeping every posix-style
//! driver needs: the name it was opened under, device and inode for
//! identity, EOA and EOF, the lock policy, and (in sequential mode) a cache
//! of the last file position. Each call returns a small timing report so
//! wrappers such as the logging driver can account for it without extra
//! syscalls.

use std::cmp::Ordering;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::config::{FileLocking, IoMode};
use crate::driver::DriverContext;
use crate::error::{IoOp, VfdError, VfdResult};
use crate::platform::{PlatformFile, is_unsupported};
use crate::types::{ADDR_UNDEF, Addr, OpenFlags, addr_defined, addr_overflow, region_overflow};

/// Last transfer direction, used to decide whether a seek is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastOp {
    Unknown,
    Read,
    Write,
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    pos: Addr,
    op: LastOp,
}

impl Cursor {
    fn reset(&mut self) {
        self.pos = ADDR_UNDEF;
        self.op = LastOp::Unknown;
    }
}

/// Time spent opening a file.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenTimings {
    pub open: Duration,
    pub stat: Duration,
}

/// An explicit seek issued before a transfer.
#[derive(Debug, Clone, Copy)]
pub struct SeekReport {
    /// Previous position, if it was known.
    pub from: Option<Addr>,
    pub to: Addr,
    pub elapsed: Duration,
}

/// Outcome of one read or write.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoReport {
    pub seek: Option<SeekReport>,
    /// Start of the transfer, relative to open.
    pub started: Duration,
    pub elapsed: Duration,
}

/// Outcome of a truncate.
#[derive(Debug, Clone, Copy, Default)]
pub struct TruncateReport {
    pub truncated: bool,
    pub new_eof: Addr,
    pub elapsed: Duration,
}

/// An open posix file and its extents.
#[derive(Debug)]
pub struct PosixCommon {
    file: PlatformFile,
    name: String,
    eoa: Addr,
    eof: Addr,
    device: u64,
    inode: u64,
    locking: FileLocking,
    cursor: Option<Cursor>,
    opened_at: Instant,
}

impl PosixCommon {
    /// Validate arguments and open `name`.
    pub fn open(
        ctx: &DriverContext,
        name: &str,
        flags: OpenFlags,
        maxaddr: Addr,
    ) -> VfdResult<(Self, OpenTimings)> {
        if name.is_empty() {
            return Err(VfdError::bad_value("invalid file name"));
        }
        check_maxaddr(maxaddr)?;

        let opened_at = Instant::now();
        let file = PlatformFile::open(Path::new(name), flags).map_err(|source| {
            VfdError::CantOpenFile {
                name: name.to_string(),
                flags: flags.to_string(),
                source,
            }
        })?;
        let open = opened_at.elapsed();

        let stat_start = Instant::now();
        let stat = file
            .stat()
            .map_err(|e| VfdError::io(IoOp::Stat, format!("unable to fstat '{name}'"), e))?;
        let stat_time = stat_start.elapsed();

        let cursor = match ctx.io_mode() {
            IoMode::Positioned => None,
            IoMode::Sequential => Some(Cursor {
                pos: ADDR_UNDEF,
                op: LastOp::Unknown,
            }),
        };

        trace!(name, size = stat.size, "opened posix file");
        Ok((
            Self {
                file,
                name: name.to_string(),
                eoa: 0,
                eof: stat.size,
                device: stat.device,
                inode: stat.inode,
                locking: ctx.locking(),
                cursor,
                opened_at,
            },
            OpenTimings {
                open,
                stat: stat_time,
            },
        ))
    }

    pub fn file_name(&self) -> &str {
        &self.name
    }

    pub fn eoa(&self) -> Addr {
        self.eoa
    }

    pub fn set_eoa(&mut self, addr: Addr) -> VfdResult<()> {
        if addr_overflow(addr) {
            return Err(VfdError::overflow(format!("address {addr} overflow")));
        }
        self.eoa = addr;
        Ok(())
    }

    pub fn eof(&self) -> Addr {
        self.eof
    }

    pub fn set_eof(&mut self, addr: Addr) -> VfdResult<()> {
        if addr_overflow(addr) {
            return Err(VfdError::overflow(format!("address {addr} overflow")));
        }
        self.eof = addr;
        Ok(())
    }

    /// Time since open, for log timestamps.
    pub fn since_open(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Identity order: device, then inode.
    pub fn cmp(&self, other: &Self) -> Ordering {
        self.device
            .cmp(&other.device)
            .then(self.inode.cmp(&other.inode))
    }

    pub fn handle(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }

    /// Reject undefined addresses and regions past the address space.
    pub fn check_region(&self, addr: Addr, size: u64) -> VfdResult<()> {
        if !addr_defined(addr) {
            return Err(VfdError::bad_value(format!("addr undefined, addr = {addr}")));
        }
        if region_overflow(addr, size) {
            return Err(VfdError::overflow(format!(
                "addr overflow, addr = {addr}, size = {size}"
            )));
        }
        Ok(())
    }

    /// Seek if the cached position or direction does not match.
    fn position(&mut self, addr: Addr, op: LastOp) -> VfdResult<Option<SeekReport>> {
        let Some(cursor) = self.cursor else {
            return Ok(None);
        };
        if cursor.pos == addr && cursor.op == op {
            return Ok(None);
        }
        let start = Instant::now();
        if let Err(e) = self.file.seek(addr) {
            self.reset_cursor();
            return Err(VfdError::io(
                IoOp::Seek,
                format!("unable to seek '{}' to {addr}", self.name),
                e,
            ));
        }
        Ok(Some(SeekReport {
            from: addr_defined(cursor.pos).then_some(cursor.pos),
            to: addr,
            elapsed: start.elapsed(),
        }))
    }

    fn reset_cursor(&mut self) {
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.reset();
        }
    }

    fn finish(&mut self, end: Addr, op: LastOp) {
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.pos = end;
            cursor.op = op;
        }
    }

    /// Fill `buf` from `addr`, zero-filling past the end of the file.
    pub fn read(&mut self, addr: Addr, buf: &mut [u8]) -> VfdResult<IoReport> {
        self.check_region(addr, buf.len() as u64)?;
        let seek = self.position(addr, LastOp::Read)?;

        let started = self.since_open();
        let start = Instant::now();
        let requested = buf.len();
        let mut done = 0;
        let mut offset = addr;
        while done < requested {
            let chunk = &mut buf[done..];
            let result = match self.cursor {
                Some(_) => self.file.read(chunk),
                None => self.file.pread(chunk, offset),
            };
            let n = match result {
                Ok(n) => n,
                Err(e) => {
                    self.reset_cursor();
                    return Err(VfdError::io(
                        IoOp::Read,
                        format!(
                            "file = '{}', total read size = {requested}, bytes this sub-read = {}, bytes actually read = {done}, offset = {offset}",
                            self.name,
                            chunk.len(),
                        ),
                        e,
                    ));
                }
            };
            if n == 0 {
                buf[done..].fill(0);
                break;
            }
            done += n;
            offset += n as u64;
        }
        let elapsed = start.elapsed();

        self.finish(offset, LastOp::Read);
        Ok(IoReport {
            seek,
            started,
            elapsed,
        })
    }

    /// Write `buf` at `addr`, extending EOF as needed.
    pub fn write(&mut self, addr: Addr, buf: &[u8]) -> VfdResult<IoReport> {
        self.check_region(addr, buf.len() as u64)?;
        let seek = self.position(addr, LastOp::Write)?;

        let started = self.since_open();
        let start = Instant::now();
        let requested = buf.len();
        let mut done = 0;
        let mut offset = addr;
        while done < requested {
            let chunk = &buf[done..];
            let result = match self.cursor {
                Some(_) => self.file.write(chunk),
                None => self.file.pwrite(chunk, offset),
            };
            let n = match result {
                Ok(0) => Err(std::io::Error::from(std::io::ErrorKind::WriteZero)),
                other => other,
            };
            let n = match n {
                Ok(n) => n,
                Err(e) => {
                    self.reset_cursor();
                    return Err(VfdError::io(
                        IoOp::Write,
                        format!(
                            "file = '{}', total write size = {requested}, bytes this sub-write = {}, bytes actually written = {done}, offset = {offset}",
                            self.name,
                            chunk.len(),
                        ),
                        e,
                    ));
                }
            };
            done += n;
            offset += n as u64;
        }
        let elapsed = start.elapsed();

        self.finish(offset, LastOp::Write);
        self.eof = self.eof.max(offset);
        Ok(IoReport {
            seek,
            started,
            elapsed,
        })
    }

    /// Set the physical size to `new_eof`, or to EOA when `None`.
    pub fn truncate(&mut self, new_eof: Option<Addr>) -> VfdResult<TruncateReport> {
        let target = new_eof.unwrap_or(self.eoa);
        if target == self.eof {
            return Ok(TruncateReport {
                truncated: false,
                new_eof: target,
                elapsed: Duration::ZERO,
            });
        }

        let start = Instant::now();
        self.file.truncate(target).map_err(|e| {
            VfdError::io(
                IoOp::Truncate,
                format!("unable to extend '{}' to {target}", self.name),
                e,
            )
        })?;
        let elapsed = start.elapsed();

        self.eof = target;
        self.reset_cursor();
        Ok(TruncateReport {
            truncated: true,
            new_eof: target,
            elapsed,
        })
    }

    pub fn lock(&mut self, exclusive: bool) -> VfdResult<Duration> {
        if self.locking == FileLocking::Disabled {
            return Ok(Duration::ZERO);
        }
        let start = Instant::now();
        match self.file.lock(exclusive) {
            Ok(()) => Ok(start.elapsed()),
            Err(e) if is_unsupported(&e) && self.locking.ignore_unsupported() => {
                warn!(name = %self.name, "file locking not supported, continuing");
                Ok(start.elapsed())
            }
            Err(source) => Err(VfdError::CantLock {
                name: self.name.clone(),
                source,
            }),
        }
    }

    pub fn unlock(&mut self) -> VfdResult<Duration> {
        if self.locking == FileLocking::Disabled {
            return Ok(Duration::ZERO);
        }
        let start = Instant::now();
        match self.file.unlock() {
            Ok(()) => Ok(start.elapsed()),
            Err(e) if is_unsupported(&e) && self.locking.ignore_unsupported() => {
                Ok(start.elapsed())
            }
            Err(source) => Err(VfdError::CantUnlock {
                name: self.name.clone(),
                source,
            }),
        }
    }

    /// Close the file, returning how long it took.
    ///
    /// A failed OS close is logged rather than returned: the descriptor is
    /// released regardless and there is nothing left to retry.
    pub fn close(self) -> Duration {
        let start = Instant::now();
        if let Err(e) = self.file.close() {
            warn!(name = %self.name, error = %e, "close failed");
        }
        start.elapsed()
    }
}

/// Reject an unusable address-space ceiling.
pub fn check_maxaddr(maxaddr: Addr) -> VfdResult<()> {
    if maxaddr == 0 || !addr_defined(maxaddr) {
        return Err(VfdError::bad_range("bogus maxaddr"));
    }
    if addr_overflow(maxaddr) {
        return Err(VfdError::overflow("bogus maxaddr"));
    }
    Ok(())
}
