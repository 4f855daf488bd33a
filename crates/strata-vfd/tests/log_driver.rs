//! Logging driver: access counters, flavor tags and the text log.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use strata_vfd::{
    DriverContext, FileDriver, IoMode, LogConfig, LogDriver, LogFlags, MAXADDR, MemType,
    OpenDriver, OpenFlags, VfdError,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Scratch {
    _dir: TempDir,
    data: PathBuf,
    log: PathBuf,
}

fn scratch() -> Scratch {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("data.bin");
    let log = dir.path().join("access.log");
    Scratch {
        _dir: dir,
        data,
        log,
    }
}

fn open_with(ctx: &DriverContext, path: &Path, config: &LogConfig) -> LogDriver {
    LogDriver::open(ctx, path.to_str().unwrap(), OpenFlags::create(), config, MAXADDR).unwrap()
}

fn open(path: &Path, config: &LogConfig) -> LogDriver {
    open_with(&DriverContext::default(), path, config)
}

#[test]
fn counts_reads_and_writes_per_byte() {
    init_tracing();
    let s = scratch();
    let config = LogConfig::new(LogFlags::FILE_READ | LogFlags::FILE_WRITE)
        .with_file(&s.log)
        .with_buf_size(256);
    let mut drv = open(&s.data, &config);

    drv.set_eoa(MemType::Default, 100).unwrap();
    drv.write(MemType::Draw, 0, &[5u8; 100]).unwrap();
    let mut buf = [0u8; 50];
    drv.read(MemType::Draw, 0, &mut buf).unwrap();
    assert_eq!(buf, [5u8; 50]);

    let writes = drv.write_counts().unwrap().unwrap();
    assert!(writes[..100].iter().all(|&n| n == 1));
    let reads = drv.read_counts().unwrap().unwrap();
    assert!(reads[..50].iter().all(|&n| n == 1));
    assert!(reads[50..100].iter().all(|&n| n == 0));
    assert!(drv.flavors().unwrap().is_none());

    drv.close().unwrap();
    let text = fs::read_to_string(&s.log).unwrap();
    assert!(text.contains("Dumping Write I/O information:"), "{text}");
    assert!(
        text.contains("Addr          0-        99 (       100 bytes) Written to   1 times"),
        "{text}"
    );
    assert!(text.contains("Dumping Read I/O information:"), "{text}");
    assert!(
        text.contains("Addr          0-        49 (        50 bytes) Read to   1 times"),
        "{text}"
    );
    assert!(!text.contains("Addr         50-"), "zero runs are skipped: {text}");
}

#[test]
fn tracking_arrays_grow_past_initial_size() {
    let s = scratch();
    let config = LogConfig::new(LogFlags::FILE_WRITE).with_file(&s.log);
    let mut drv = open(&s.data, &config);

    drv.write(MemType::Draw, 1000, &[1u8; 24]).unwrap();
    drv.write(MemType::Draw, 1010, &[2u8; 4]).unwrap();
    let writes = drv.write_counts().unwrap().unwrap();
    assert!(writes.len() >= 1024);
    assert_eq!(writes[999], 0);
    assert_eq!(writes[1000], 1);
    assert_eq!(writes[1010], 2);
    assert_eq!(writes[1013], 2);
    assert_eq!(writes[1014], 1);
}

#[test]
fn strict_flavor_rejects_mismatched_access() {
    let s = scratch();
    let config = LogConfig::new(LogFlags::FLAVOR)
        .with_file(&s.log)
        .with_strict_flavor(true);
    let mut drv = open(&s.data, &config);

    let addr = drv.alloc(MemType::Ohdr, 64).unwrap();
    assert_eq!(addr, 0);
    assert_eq!(drv.flavor_at(0).unwrap(), Some(MemType::Ohdr));
    assert_eq!(drv.flavor_at(63).unwrap(), Some(MemType::Ohdr));
    assert_eq!(drv.flavor_at(64).unwrap(), Some(MemType::Default));

    let err = drv.write(MemType::Btree, 0, &[1u8; 8]).unwrap_err();
    assert!(matches!(err, VfdError::Consistency(_)), "{err}");
    let mut buf = [0u8; 8];
    let err = drv.read(MemType::Btree, 56, &mut buf).unwrap_err();
    assert!(matches!(err, VfdError::Consistency(_)), "{err}");

    // Matching and untyped accesses pass
    drv.write(MemType::Ohdr, 0, &[1u8; 8]).unwrap();
    drv.read(MemType::Default, 0, &mut buf).unwrap();
    assert_eq!(buf, [1u8; 8]);
}

#[test]
fn lenient_flavor_only_warns() {
    init_tracing();
    let s = scratch();
    let config = LogConfig::new(LogFlags::FLAVOR).with_file(&s.log);
    let mut drv = open(&s.data, &config);

    drv.alloc(MemType::Ohdr, 16).unwrap();
    drv.write(MemType::Btree, 0, &[3u8; 16]).unwrap();
    // Tagged bytes keep their first flavor
    assert_eq!(drv.flavor_at(0).unwrap(), Some(MemType::Ohdr));
}

#[test]
fn free_clears_flavor_and_fresh_writes_retag() {
    let s = scratch();
    let config = LogConfig::new(LogFlags::FLAVOR | LogFlags::LOC_WRITE | LogFlags::FREE)
        .with_file(&s.log)
        .with_strict_flavor(true);
    let mut drv = open(&s.data, &config);

    drv.alloc(MemType::Ohdr, 64).unwrap();
    drv.free(MemType::Ohdr, 0, 64).unwrap();
    assert_eq!(drv.flavor_at(0).unwrap(), Some(MemType::Default));
    assert_eq!(drv.get_eoa(MemType::Default).unwrap(), 64);

    drv.write(MemType::Btree, 0, &[9u8; 8]).unwrap();
    assert_eq!(drv.flavor_at(0).unwrap(), Some(MemType::Btree));
    assert_eq!(drv.flavor_at(7).unwrap(), Some(MemType::Btree));
    assert_eq!(drv.flavor_at(8).unwrap(), Some(MemType::Default));
    drv.close().unwrap();

    let text = fs::read_to_string(&s.log).unwrap();
    assert!(text.contains("(ohdr) Freed"), "{text}");
    assert!(text.contains("(btree) Written (fresh)"), "{text}");
    assert!(text.contains("Dumping I/O flavor information:"), "{text}");
}

#[test]
fn set_eoa_tags_growth_and_clears_shrink() {
    let s = scratch();
    let config = LogConfig::new(LogFlags::FLAVOR | LogFlags::ALLOC).with_file(&s.log);
    let mut drv = open(&s.data, &config);

    drv.set_eoa(MemType::Lheap, 32).unwrap();
    assert_eq!(drv.flavor_at(31).unwrap(), Some(MemType::Lheap));

    drv.set_eoa(MemType::Lheap, 16).unwrap();
    assert_eq!(drv.flavor_at(15).unwrap(), Some(MemType::Lheap));
    assert_eq!(drv.flavor_at(16).unwrap(), Some(MemType::Default));
    assert_eq!(drv.get_eoa(MemType::Default).unwrap(), 16);
    drv.close().unwrap();

    let text = fs::read_to_string(&s.log).unwrap();
    assert!(text.contains("(lheap) Allocated"), "{text}");
}

#[test]
fn sequential_mode_counts_only_needed_seeks() {
    let s = scratch();
    let ctx = DriverContext::default().with_io_mode(IoMode::Sequential);
    let config = LogConfig::new(
        LogFlags::NUM_SEEK | LogFlags::NUM_READ | LogFlags::NUM_WRITE | LogFlags::LOC_SEEK,
    )
    .with_file(&s.log);
    let mut drv = open_with(&ctx, &s.data, &config);

    drv.write(MemType::Draw, 0, &[1u8; 10]).unwrap();
    drv.write(MemType::Draw, 10, &[2u8; 10]).unwrap();
    let mut buf = [0u8; 10];
    drv.read(MemType::Draw, 0, &mut buf).unwrap();
    assert_eq!(buf, [1u8; 10]);
    drv.read(MemType::Draw, 10, &mut buf).unwrap();
    assert_eq!(buf, [2u8; 10]);

    let totals = drv.totals().unwrap();
    assert_eq!(totals.write.count, 2);
    assert_eq!(totals.read.count, 2);
    assert_eq!(totals.seek.count, 2);
    drv.close().unwrap();

    let text = fs::read_to_string(&s.log).unwrap();
    assert!(text.contains("Total number of seek operations: 2"), "{text}");
    assert!(text.contains("Seek: From         20 To          0"), "{text}");
}

#[test]
fn positioned_mode_never_seeks() {
    let s = scratch();
    let config = LogConfig::new(LogFlags::NUM_IO).with_file(&s.log);
    let mut drv = open(&s.data, &config);

    drv.write(MemType::Draw, 100, &[1u8; 4]).unwrap();
    let mut buf = [0u8; 4];
    drv.read(MemType::Draw, 0, &mut buf).unwrap();
    assert_eq!(drv.totals().unwrap().seek.count, 0);
}

#[test]
fn truncate_is_counted_when_eof_moves() {
    let s = scratch();
    let config = LogConfig::new(LogFlags::TRUNCATE | LogFlags::NUM_TRUNCATE).with_file(&s.log);
    let mut drv = open(&s.data, &config);

    drv.write(MemType::Draw, 0, &[1u8; 100]).unwrap();
    drv.set_eoa(MemType::Default, 40).unwrap();
    drv.truncate(false).unwrap();
    drv.truncate(false).unwrap();
    assert_eq!(drv.get_eof(MemType::Default).unwrap(), 40);
    assert_eq!(drv.totals().unwrap().truncate.count, 1);
    drv.close().unwrap();

    assert_eq!(fs::metadata(&s.data).unwrap().len(), 40);
    let text = fs::read_to_string(&s.log).unwrap();
    assert!(text.contains("Truncated file to 40 bytes"), "{text}");
}

#[test]
fn quiet_driver_writes_no_log() {
    let s = scratch();
    let config = LogConfig::new(LogFlags::empty()).with_file(&s.log);
    let mut drv = open(&s.data, &config);
    drv.write(MemType::Draw, 0, b"abc").unwrap();
    drv.close().unwrap();
    assert!(!s.log.exists());
    assert!(matches!(drv.close(), Err(VfdError::NotOpen)));
}
