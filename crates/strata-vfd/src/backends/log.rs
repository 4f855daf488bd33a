//! Logging file driver.
//!
//! Posix I/O plus instrumentation, all selected by [`LogFlags`]:
//!
//! - per-byte read and write counters (`FILE_READ`, `FILE_WRITE`)
//! - per-byte flavor tags recording the [`MemType`] stored there (`FLAVOR`)
//! - operation counts and cumulative times (`NUM_*`, `TIME_*`)
//! - a line per access, allocation or free (`LOC_*`, `ALLOC`, `FREE`)
//!
//! Text goes to the configured [`LogTarget`] and is mirrored as `debug`
//! events under the `strata_vfd::log` target. On close the counters and
//! tags are dumped as run-length encoded address ranges.
//!
//! Tracking arrays come from the context's block pool and grow to cover the
//! highest byte touched.

use std::cmp::Ordering;
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::os::fd::BorrowedFd;
use std::time::Duration;

use strata_freelist::{Block, BlockPool};
use tracing::{debug, warn};

use crate::common::{IoReport, PosixCommon};
use crate::config::{LogConfig, LogFlags, LogTarget};
use crate::driver::{DriverContext, FileDriver, OpenDriver};
use crate::error::{VfdError, VfdResult};
use crate::types::{Addr, Features, MemType, OpenFlags, addr_overflow, region_overflow};

/// Count and cumulative time for one kind of operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpStats {
    pub count: u64,
    pub time: Duration,
}

impl OpStats {
    fn record(&mut self, count: bool, time: Option<Duration>) {
        if count {
            self.count += 1;
        }
        if let Some(time) = time {
            self.time += time;
        }
    }
}

/// Running totals kept by the logging driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogTotals {
    pub read: OpStats,
    pub write: OpStats,
    pub seek: OpStats,
    pub truncate: OpStats,
    pub lock: OpStats,
    pub unlock: OpStats,
}

/// A run of consecutive addresses holding the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRun {
    pub start: Addr,
    /// Inclusive.
    pub end: Addr,
    pub value: u8,
}

/// Run-length encode `values` over `[0, eoa)`.
///
/// Addresses past the end of `values` count as zero.
pub fn run_length_encode(values: &[u8], eoa: Addr) -> Vec<AccessRun> {
    let mut runs: Vec<AccessRun> = Vec::new();
    let covered = values.len().min(usize::try_from(eoa).unwrap_or(usize::MAX));

    let mut push = |addr: Addr, value: u8| match runs.last_mut() {
        Some(run) if run.value == value => run.end = addr,
        _ => runs.push(AccessRun {
            start: addr,
            end: addr,
            value,
        }),
    };
    for (addr, &value) in values[..covered].iter().enumerate() {
        push(addr as Addr, value);
    }
    if eoa > covered as Addr {
        push(covered as Addr, 0);
        push(eoa - 1, 0);
    }
    runs
}

/// A per-byte array drawn from a block pool.
#[derive(Debug)]
struct ByteTrack {
    pool: BlockPool,
    block: Option<Block>,
}

impl ByteTrack {
    fn new(pool: &BlockPool, initial: usize) -> VfdResult<Self> {
        let block = if initial > 0 {
            Some(pool.calloc(initial)?)
        } else {
            None
        };
        Ok(Self {
            pool: pool.clone(),
            block,
        })
    }

    fn as_slice(&self) -> &[u8] {
        self.block.as_deref().unwrap_or(&[])
    }

    fn get(&self, addr: Addr) -> u8 {
        usize::try_from(addr)
            .ok()
            .and_then(|i| self.as_slice().get(i).copied())
            .unwrap_or(0)
    }

    /// Grow to at least `len` bytes and return the whole array.
    fn ensure(&mut self, len: usize) -> VfdResult<&mut [u8]> {
        let current = self.as_slice().len();
        if len > current {
            let target = len.max(current.saturating_mul(2));
            match self.block.as_mut() {
                None => self.block = Some(self.pool.calloc(target)?),
                Some(block) => {
                    self.pool.resize(block, target)?;
                    block[current..].fill(0);
                }
            }
        }
        Ok(self.block.as_deref_mut().unwrap_or(&mut []))
    }

    /// Zero `[start, end)` without growing.
    fn clear(&mut self, start: usize, end: usize) {
        if let Some(block) = self.block.as_mut() {
            let end = end.min(block.len());
            if start < end {
                block[start..end].fill(0);
            }
        }
    }

    fn release(&mut self) -> VfdResult<()> {
        if let Some(block) = self.block.take() {
            self.pool.free(block)?;
        }
        Ok(())
    }
}

fn to_index(addr: Addr) -> VfdResult<usize> {
    usize::try_from(addr)
        .map_err(|_| VfdError::CantAlloc(format!("tracking array for address {addr}")))
}

/// Destination for the driver's text log.
struct LogSink {
    target: LogTarget,
    writer: Box<dyn Write + Send>,
    failed: bool,
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSink")
            .field("target", &self.target)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl LogSink {
    fn open(target: &LogTarget) -> VfdResult<Self> {
        let writer: Box<dyn Write + Send> = match target {
            LogTarget::Stderr => Box::new(io::stderr()),
            LogTarget::File(path) => {
                let file = File::create(path).map_err(|source| VfdError::CantOpenFile {
                    name: path.display().to_string(),
                    flags: "log".to_string(),
                    source,
                })?;
                Box::new(BufWriter::new(file))
            }
        };
        Ok(Self {
            target: target.clone(),
            writer,
            failed: false,
        })
    }

    fn line(&mut self, args: fmt::Arguments<'_>) {
        if self.failed {
            return;
        }
        if let Err(e) = writeln!(self.writer, "{args}") {
            warn!(error = %e, target = ?self.target, "log output failed, disabling");
            self.failed = true;
        }
    }

    fn flush(&mut self) {
        if !self.failed {
            if let Err(e) = self.writer.flush() {
                warn!(error = %e, "log flush failed");
            }
        }
    }
}

fn secs(d: Duration) -> f64 {
    d.as_secs_f64()
}

fn flavor_name(tag: u8) -> String {
    MemType::from_u8(tag)
        .map(|t| t.to_string())
        .unwrap_or_else(|| format!("unknown({tag})"))
}

fn emit(sink: &mut Option<LogSink>, args: fmt::Arguments<'_>) {
    debug!(target: "strata_vfd::log", "{args}");
    if let Some(sink) = sink.as_mut() {
        sink.line(args);
    }
}

#[derive(Debug)]
struct LogState {
    common: PosixCommon,
    flags: LogFlags,
    strict_flavor: bool,
    nread: Option<ByteTrack>,
    nwrite: Option<ByteTrack>,
    flavor: Option<ByteTrack>,
    totals: LogTotals,
    sink: Option<LogSink>,
}

impl LogState {
    fn has(&self, flag: LogFlags) -> bool {
        self.flags.contains(flag)
    }

    fn emit(&mut self, args: fmt::Arguments<'_>) {
        emit(&mut self.sink, args);
    }

    fn check_region(&self, addr: Addr, size: u64) -> VfdResult<()> {
        self.common.check_region(addr, size)
    }

    /// The first and last byte of an access must be untagged or carry `ty`.
    fn check_flavor(&self, op: &str, ty: MemType, addr: Addr, size: u64) -> VfdResult<()> {
        let Some(flavor) = self.flavor.as_ref() else {
            return Ok(());
        };
        if ty == MemType::Default || size == 0 {
            return Ok(());
        }
        for at in [addr, addr + size - 1] {
            let tag = flavor.get(at);
            if tag != MemType::Default.as_u8() && tag != ty.as_u8() {
                let msg = format!(
                    "{op} of {ty} data at {at} hits bytes tagged {}",
                    flavor_name(tag)
                );
                if self.strict_flavor {
                    return Err(VfdError::Consistency(msg));
                }
                warn!(file = self.common.file_name(), "{msg}");
            }
        }
        Ok(())
    }

    fn tag(&mut self, ty: MemType, start: Addr, end: Addr) -> VfdResult<()> {
        if let Some(flavor) = self.flavor.as_mut() {
            let (start, end) = (to_index(start)?, to_index(end)?);
            flavor.ensure(end)?[start..end].fill(ty.as_u8());
        }
        Ok(())
    }

    fn untag(&mut self, start: Addr, end: Addr) -> VfdResult<()> {
        if let Some(flavor) = self.flavor.as_mut() {
            flavor.clear(to_index(start)?, to_index(end)?);
        }
        Ok(())
    }

    fn record_seek(&mut self, report: &IoReport) {
        let Some(seek) = report.seek else {
            return;
        };
        let timed = self.has(LogFlags::TIME_SEEK).then_some(seek.elapsed);
        let counted = self.has(LogFlags::NUM_SEEK);
        self.totals.seek.record(counted, timed);
        if self.has(LogFlags::LOC_SEEK) {
            let from = seek.from.map_or_else(|| "?".to_string(), |a| a.to_string());
            match timed {
                Some(t) => self.emit(format_args!(
                    "Seek: From {from:>10} To {:>10} ({:.6}s)",
                    seek.to,
                    secs(t)
                )),
                None => self.emit(format_args!("Seek: From {from:>10} To {:>10}", seek.to)),
            }
        }
    }

    fn bump(track: Option<&mut ByteTrack>, start: Addr, end: Addr) -> VfdResult<()> {
        if let Some(track) = track {
            let (start, end) = (to_index(start)?, to_index(end)?);
            for count in &mut track.ensure(end)?[start..end] {
                *count = count.wrapping_add(1);
            }
        }
        Ok(())
    }

    fn dump_counts(&mut self, title: &str, verb: &str, values: Vec<AccessRun>) {
        self.emit(format_args!("Dumping {title} I/O information:"));
        // Untouched ranges are left out of the dump.
        for run in values.into_iter().filter(|r| r.value != 0) {
            self.emit(format_args!(
                "\tAddr {:>10}-{:>10} ({:>10} bytes) {verb} to {:>3} times",
                run.start,
                run.end,
                run.end - run.start + 1,
                run.value
            ));
        }
    }

    fn dump_tracks(&mut self) {
        let eoa = self.common.eoa();
        if let Some(runs) = self.nwrite.as_ref().map(|t| run_length_encode(t.as_slice(), eoa)) {
            self.dump_counts("Write", "Written", runs);
        }
        if let Some(runs) = self.nread.as_ref().map(|t| run_length_encode(t.as_slice(), eoa)) {
            self.dump_counts("Read", "Read", runs);
        }
        if let Some(runs) = self.flavor.as_ref().map(|t| run_length_encode(t.as_slice(), eoa)) {
            self.emit(format_args!("Dumping I/O flavor information:"));
            for run in runs {
                self.emit(format_args!(
                    "\tAddr {:>10}-{:>10} ({:>10} bytes) flavor is {}",
                    run.start,
                    run.end,
                    run.end - run.start + 1,
                    flavor_name(run.value)
                ));
            }
        }
    }

    fn dump_totals(&mut self) {
        let totals = self.totals;
        let rows = [
            (LogFlags::NUM_READ, LogFlags::TIME_READ, "read", totals.read),
            (LogFlags::NUM_WRITE, LogFlags::TIME_WRITE, "write", totals.write),
            (LogFlags::NUM_SEEK, LogFlags::TIME_SEEK, "seek", totals.seek),
            (LogFlags::NUM_TRUNCATE, LogFlags::TIME_TRUNCATE, "truncate", totals.truncate),
        ];
        for (num, time, label, stats) in rows {
            if self.has(num) {
                self.emit(format_args!("Total number of {label} operations: {}", stats.count));
            }
            if self.has(time) {
                self.emit(format_args!(
                    "Total time in {label} operations: {:.6} s",
                    secs(stats.time)
                ));
            }
        }
    }
}

/// Posix I/O with access tracking and logging.
#[derive(Debug)]
pub struct LogDriver {
    state: Option<LogState>,
}

impl LogDriver {
    fn state(&self) -> VfdResult<&LogState> {
        self.state.as_ref().ok_or(VfdError::NotOpen)
    }

    fn state_mut(&mut self) -> VfdResult<&mut LogState> {
        self.state.as_mut().ok_or(VfdError::NotOpen)
    }

    pub fn is_open(&self) -> bool {
        self.state.is_some()
    }

    /// Per-byte read counts, when `FILE_READ` is set.
    pub fn read_counts(&self) -> VfdResult<Option<&[u8]>> {
        Ok(self.state()?.nread.as_ref().map(ByteTrack::as_slice))
    }

    /// Per-byte write counts, when `FILE_WRITE` is set.
    pub fn write_counts(&self) -> VfdResult<Option<&[u8]>> {
        Ok(self.state()?.nwrite.as_ref().map(ByteTrack::as_slice))
    }

    /// Per-byte flavor tags, when `FLAVOR` is set.
    pub fn flavors(&self) -> VfdResult<Option<&[u8]>> {
        Ok(self.state()?.flavor.as_ref().map(ByteTrack::as_slice))
    }

    /// Flavor of the byte at `addr`.
    pub fn flavor_at(&self, addr: Addr) -> VfdResult<Option<MemType>> {
        Ok(self
            .state()?
            .flavor
            .as_ref()
            .and_then(|f| MemType::from_u8(f.get(addr))))
    }

    pub fn totals(&self) -> VfdResult<LogTotals> {
        Ok(self.state()?.totals)
    }
}

impl OpenDriver for LogDriver {
    type Config = LogConfig;

    #[tracing::instrument(skip(ctx, config), name = "vfd.log.open")]
    fn open(
        ctx: &DriverContext,
        name: &str,
        flags: OpenFlags,
        config: &LogConfig,
        maxaddr: Addr,
    ) -> VfdResult<Self> {
        let (common, timings) = PosixCommon::open(ctx, name, flags, maxaddr)?;

        let pool = ctx.tracking_pool();
        let track = |flag: LogFlags| -> VfdResult<Option<ByteTrack>> {
            if config.flags.contains(flag) {
                Ok(Some(ByteTrack::new(pool, config.buf_size)?))
            } else {
                Ok(None)
            }
        };
        let nread = track(LogFlags::FILE_READ)?;
        let nwrite = track(LogFlags::FILE_WRITE)?;
        let flavor = track(LogFlags::FLAVOR)?;

        let sink = if config.flags.is_empty() {
            None
        } else {
            Some(LogSink::open(&config.target)?)
        };

        let mut state = LogState {
            common,
            flags: config.flags,
            strict_flavor: config.strict_flavor,
            nread,
            nwrite,
            flavor,
            totals: LogTotals::default(),
            sink,
        };
        if state.has(LogFlags::TIME_OPEN) {
            state.emit(format_args!("Open took: ({:.6}s)", secs(timings.open)));
        }
        if state.has(LogFlags::TIME_STAT) {
            state.emit(format_args!("Stat took: ({:.6}s)", secs(timings.stat)));
        }
        Ok(Self { state: Some(state) })
    }
}

impl FileDriver for LogDriver {
    fn name(&self) -> &'static str {
        "log"
    }

    #[tracing::instrument(skip(self), name = "vfd.log.close")]
    fn close(&mut self) -> VfdResult<()> {
        let mut state = self.state.take().ok_or(VfdError::NotOpen)?;

        if !state.flags.is_empty() {
            state.dump_totals();
            state.dump_tracks();
        }
        let mut first_err = None;
        for track in [state.nread.as_mut(), state.nwrite.as_mut(), state.flavor.as_mut()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = track.release() {
                first_err.get_or_insert(e);
            }
        }

        let LogState {
            common,
            flags,
            mut sink,
            ..
        } = state;
        let close_time = common.close();
        if flags.contains(LogFlags::TIME_CLOSE) {
            emit(&mut sink, format_args!("Close took: ({:.6}s)", secs(close_time)));
        }
        if let Some(sink) = sink.as_mut() {
            sink.flush();
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn query(&self) -> VfdResult<Features> {
        self.state()?;
        Ok(Features::base()
            | Features::POSIX_COMPAT_HANDLE
            | Features::SUPPORTS_SWMR_IO
            | Features::DEFAULT_VFD_COMPATIBLE)
    }

    fn get_eoa(&self, _ty: MemType) -> VfdResult<Addr> {
        Ok(self.state()?.common.eoa())
    }

    fn set_eoa(&mut self, ty: MemType, addr: Addr) -> VfdResult<()> {
        let state = self.state_mut()?;
        if addr_overflow(addr) {
            return Err(VfdError::overflow(format!("address {addr} overflow")));
        }

        let eoa = state.common.eoa();
        if !state.flags.is_empty() && addr > 0 {
            if addr > eoa {
                state.tag(ty, eoa, addr)?;
                if state.has(LogFlags::ALLOC) {
                    state.emit(format_args!(
                        "{eoa:>10}-{:>10} ({:>10} bytes) ({ty}) Allocated",
                        addr - 1,
                        addr - eoa
                    ));
                }
            } else if addr < eoa {
                state.untag(addr, eoa)?;
                if state.has(LogFlags::FREE) {
                    state.emit(format_args!(
                        "{addr:>10}-{:>10} ({:>10} bytes) ({ty}) Freed",
                        eoa - 1,
                        eoa - addr
                    ));
                }
            }
        }
        state.common.set_eoa(addr)
    }

    fn get_eof(&self, _ty: MemType) -> VfdResult<Addr> {
        Ok(self.state()?.common.eof())
    }

    fn alloc(&mut self, ty: MemType, size: u64) -> VfdResult<Addr> {
        let state = self.state_mut()?;
        let addr = state.common.eoa();
        if region_overflow(addr, size) {
            return Err(VfdError::overflow(format!(
                "allocating {size} bytes at {addr} exceeds the address space"
            )));
        }
        state.common.set_eoa(addr + size)?;
        state.tag(ty, addr, addr + size)?;
        if state.has(LogFlags::ALLOC) {
            state.emit(format_args!(
                "{addr:>10}-{:>10} ({size:>10} bytes) ({ty}) Allocated",
                (addr + size).saturating_sub(1)
            ));
        }
        Ok(addr)
    }

    fn free(&mut self, ty: MemType, addr: Addr, size: u64) -> VfdResult<()> {
        let state = self.state_mut()?;
        state.check_region(addr, size)?;
        state.untag(addr, addr + size)?;
        if state.has(LogFlags::FREE) {
            state.emit(format_args!(
                "{addr:>10}-{:>10} ({size:>10} bytes) ({ty}) Freed",
                (addr + size).saturating_sub(1)
            ));
        }
        Ok(())
    }

    fn read(&mut self, ty: MemType, addr: Addr, buf: &mut [u8]) -> VfdResult<()> {
        let state = self.state_mut()?;
        let size = buf.len() as u64;
        state.check_region(addr, size)?;
        state.check_flavor("read", ty, addr, size)?;

        let report = match state.common.read(addr, buf) {
            Ok(report) => report,
            Err(e) => {
                if state.has(LogFlags::LOC_READ) {
                    state.emit(format_args!(
                        "Error! Reading: {addr:>10}-{:>10} ({size:>10} bytes)",
                        (addr + size).saturating_sub(1)
                    ));
                }
                return Err(e);
            }
        };
        state.record_seek(&report);

        LogState::bump(state.nread.as_mut(), addr, addr + size)?;
        let timed = state.has(LogFlags::TIME_READ).then_some(report.elapsed);
        let counted = state.has(LogFlags::NUM_READ);
        state.totals.read.record(counted, timed);

        if state.has(LogFlags::LOC_READ) {
            let last = (addr + size).saturating_sub(1);
            match timed {
                Some(t) => state.emit(format_args!(
                    "{addr:>10}-{last:>10} ({size:>10} bytes) ({ty}) Read, time = {:.6}s @ {:.6}",
                    secs(t),
                    secs(report.started)
                )),
                None => state.emit(format_args!(
                    "{addr:>10}-{last:>10} ({size:>10} bytes) ({ty}) Read"
                )),
            }
        }
        Ok(())
    }

    fn write(&mut self, ty: MemType, addr: Addr, buf: &[u8]) -> VfdResult<()> {
        let state = self.state_mut()?;
        let size = buf.len() as u64;
        state.check_region(addr, size)?;
        state.check_flavor("write", ty, addr, size)?;

        let report = match state.common.write(addr, buf) {
            Ok(report) => report,
            Err(e) => {
                if state.has(LogFlags::LOC_WRITE) {
                    state.emit(format_args!(
                        "Error! Writing: {addr:>10}-{:>10} ({size:>10} bytes)",
                        (addr + size).saturating_sub(1)
                    ));
                }
                return Err(e);
            }
        };
        state.record_seek(&report);

        LogState::bump(state.nwrite.as_mut(), addr, addr + size)?;
        let timed = state.has(LogFlags::TIME_WRITE).then_some(report.elapsed);
        let counted = state.has(LogFlags::NUM_WRITE);
        state.totals.write.record(counted, timed);

        // Untagged space takes the flavor of its first write
        let fresh = size > 0
            && state
                .flavor
                .as_ref()
                .is_some_and(|f| f.get(addr) == MemType::Default.as_u8());
        if fresh {
            state.tag(ty, addr, addr + size)?;
        }

        if state.has(LogFlags::LOC_WRITE) {
            let last = (addr + size).saturating_sub(1);
            let suffix = if fresh { " (fresh)" } else { "" };
            match timed {
                Some(t) => state.emit(format_args!(
                    "{addr:>10}-{last:>10} ({size:>10} bytes) ({ty}) Written{suffix}, time = {:.6}s @ {:.6}",
                    secs(t),
                    secs(report.started)
                )),
                None => state.emit(format_args!(
                    "{addr:>10}-{last:>10} ({size:>10} bytes) ({ty}) Written{suffix}"
                )),
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip(self), name = "vfd.log.truncate")]
    fn truncate(&mut self, _closing: bool) -> VfdResult<()> {
        let state = self.state_mut()?;
        let report = state.common.truncate(None)?;
        if report.truncated {
            let timed = state.has(LogFlags::TIME_TRUNCATE).then_some(report.elapsed);
            let counted = state.has(LogFlags::NUM_TRUNCATE);
            state.totals.truncate.record(counted, timed);
            if state.has(LogFlags::TRUNCATE) {
                state.emit(format_args!("Truncated file to {} bytes", report.new_eof));
            }
        }
        Ok(())
    }

    fn lock(&mut self, exclusive: bool) -> VfdResult<()> {
        let state = self.state_mut()?;
        let elapsed = state.common.lock(exclusive)?;
        if state.has(LogFlags::TIME_LOCK) {
            state.totals.lock.record(true, Some(elapsed));
            let kind = if exclusive { "exclusive" } else { "shared" };
            state.emit(format_args!("Lock ({kind}) took: ({:.6}s)", secs(elapsed)));
        }
        Ok(())
    }

    fn unlock(&mut self) -> VfdResult<()> {
        let state = self.state_mut()?;
        let elapsed = state.common.unlock()?;
        if state.has(LogFlags::TIME_UNLOCK) {
            state.totals.unlock.record(true, Some(elapsed));
            state.emit(format_args!("Unlock took: ({:.6}s)", secs(elapsed)));
        }
        Ok(())
    }

    fn handle(&self) -> VfdResult<Option<BorrowedFd<'_>>> {
        Ok(Some(self.state()?.common.handle()))
    }

    fn cmp(&self, other: &Self) -> Ordering {
        match (self.state.as_ref(), other.state.as_ref()) {
            (Some(a), Some(b)) => a.common.cmp(&b.common),
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
        }
    }
}

impl Drop for LogDriver {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(e) = self.close() {
                warn!(error = %e, "log driver close on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_freelist::shared_allocator;

    fn run(start: Addr, end: Addr, value: u8) -> AccessRun {
        AccessRun { start, end, value }
    }

    #[test]
    fn rle_of_empty_space_is_empty() {
        assert!(run_length_encode(&[1, 2, 3], 0).is_empty());
        assert!(run_length_encode(&[], 0).is_empty());
    }

    #[test]
    fn rle_splits_on_value_change() {
        let values = [0, 0, 1, 1, 1, 2, 0];
        assert_eq!(
            run_length_encode(&values, 7),
            vec![run(0, 1, 0), run(2, 4, 1), run(5, 5, 2), run(6, 6, 0)]
        );
    }

    #[test]
    fn rle_stops_at_eoa() {
        let values = [3, 3, 3, 4, 4];
        assert_eq!(run_length_encode(&values, 2), vec![run(0, 1, 3)]);
    }

    #[test]
    fn rle_treats_untracked_tail_as_zero() {
        assert_eq!(
            run_length_encode(&[5, 5], 6),
            vec![run(0, 1, 5), run(2, 5, 0)]
        );
        // A zero tail merges with a trailing zero run
        assert_eq!(
            run_length_encode(&[5, 0], 4),
            vec![run(0, 0, 5), run(1, 3, 0)]
        );
    }

    #[test]
    fn byte_track_grows_zeroed() {
        let ctx = shared_allocator();
        let pool = BlockPool::new(&ctx, "test tracks");
        let mut track = ByteTrack::new(&pool, 4).unwrap();
        track.ensure(4).unwrap().fill(9);
        let grown = track.ensure(6).unwrap();
        assert!(grown.len() >= 8, "doubles when growing");
        assert_eq!(&grown[..4], &[9, 9, 9, 9]);
        assert!(grown[4..].iter().all(|&b| b == 0));
        assert_eq!(track.get(100), 0);

        track.clear(1, 3);
        assert_eq!(&track.as_slice()[..4], &[9, 0, 0, 9]);
        track.release().unwrap();
        assert!(track.as_slice().is_empty());
    }

    #[test]
    fn byte_track_starts_lazily() {
        let ctx = shared_allocator();
        let pool = BlockPool::new(&ctx, "lazy tracks");
        let mut track = ByteTrack::new(&pool, 0).unwrap();
        assert!(track.as_slice().is_empty());
        assert_eq!(track.ensure(3).unwrap(), &[0, 0, 0]);
    }
}
