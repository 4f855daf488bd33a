//! Memory driver against a real backing file.

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use strata_vfd::{
    DirtyRegion, DriverContext, FileDriver, MAXADDR, MemType, MemoryConfig, MemoryDriver,
    OpenDriver, OpenFlags, VfdError,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn open(path: &Path, flags: OpenFlags, config: &MemoryConfig) -> MemoryDriver {
    MemoryDriver::open(
        &DriverContext::default(),
        path.to_str().unwrap(),
        flags,
        config,
        MAXADDR,
    )
    .unwrap()
}

#[test]
fn tracked_writes_merge_and_land_on_disk() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tracked.bin");
    let config = MemoryConfig::new()
        .with_increment(8192)
        .with_backing_store(true)
        .with_write_tracking(4096);
    let mut drv = open(&path, OpenFlags::create(), &config);

    drv.write(MemType::Draw, 0, b"0123456789").unwrap();
    assert_eq!(drv.get_eof(MemType::Default).unwrap(), 8192);
    assert_eq!(
        drv.dirty_regions().unwrap().unwrap(),
        vec![DirtyRegion { start: 0, end: 4095 }]
    );

    drv.write(MemType::Draw, 5000, b"abcdefghij").unwrap();
    assert_eq!(drv.get_eof(MemType::Default).unwrap(), 8192);
    assert_eq!(
        drv.dirty_regions().unwrap().unwrap(),
        vec![DirtyRegion { start: 0, end: 8191 }]
    );

    drv.set_eoa(MemType::Default, 5010).unwrap();
    drv.truncate(true).unwrap();
    assert_eq!(drv.get_eof(MemType::Default).unwrap(), 5010);
    drv.close().unwrap();

    let disk = fs::read(&path).unwrap();
    assert_eq!(disk.len(), 5010);
    assert_eq!(&disk[..10], b"0123456789");
    assert!(disk[10..5000].iter().all(|&b| b == 0));
    assert_eq!(&disk[5000..], b"abcdefghij");
}

#[test]
fn flush_writes_only_dirty_pages() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pages.bin");
    fs::write(&path, vec![0xAAu8; 3 * 4096]).unwrap();

    let config = MemoryConfig::new()
        .with_increment(4096)
        .with_backing_store(true)
        .with_write_tracking(4096);
    let mut drv = open(&path, OpenFlags::read_write(), &config);
    assert_eq!(drv.get_eof(MemType::Default).unwrap(), 3 * 4096);
    assert!(!drv.is_dirty().unwrap());

    // Someone else rewrites the last page behind our back
    let mut outside = fs::read(&path).unwrap();
    outside[2 * 4096..].fill(0xBB);
    fs::write(&path, &outside).unwrap();

    drv.write(MemType::Draw, 100, &[0x11u8; 8]).unwrap();
    assert!(drv.is_dirty().unwrap());
    drv.flush(false).unwrap();
    assert!(!drv.is_dirty().unwrap());
    assert_eq!(drv.dirty_regions().unwrap().unwrap(), vec![]);

    let disk = fs::read(&path).unwrap();
    assert_eq!(&disk[100..108], &[0x11u8; 8]);
    assert!(disk[..100].iter().all(|&b| b == 0xAA));
    assert!(disk[108..4096].iter().all(|&b| b == 0xAA));
    assert!(disk[2 * 4096..].iter().all(|&b| b == 0xBB), "clean page was rewritten");
    drv.close().unwrap();
}

#[test]
fn untracked_flush_writes_whole_image() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("whole.bin");
    let config = MemoryConfig::new()
        .with_increment(64)
        .with_backing_store(true);
    let mut drv = open(&path, OpenFlags::create(), &config);
    assert!(drv.dirty_regions().unwrap().is_none());

    drv.write(MemType::Lheap, 10, b"xyz").unwrap();
    drv.flush(false).unwrap();
    let disk = fs::read(&path).unwrap();
    assert_eq!(disk.len(), 64);
    assert_eq!(&disk[10..13], b"xyz");
    drv.close().unwrap();
}

#[test]
fn reopen_loads_existing_contents() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("reopen.bin");
    fs::write(&path, b"persisted bytes").unwrap();

    let mut drv = open(&path, OpenFlags::read_only(), &MemoryConfig::default());
    assert_eq!(drv.get_eof(MemType::Default).unwrap(), 15);
    let mut buf = [0u8; 9];
    drv.read(MemType::Draw, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"persisted");
    assert!(drv.handle().unwrap().is_some());
    drv.close().unwrap();
}

#[test]
fn supplied_image_is_flushed_to_new_backing_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("from-image.bin");
    let config = MemoryConfig::new()
        .with_backing_store(true)
        .with_image(b"image bytes".to_vec());

    let mut drv = open(&path, OpenFlags::read_write(), &config);
    assert!(drv.is_dirty().unwrap());
    drv.close().unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"image bytes");
}

#[test]
fn missing_file_without_create_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.bin");
    let result = MemoryDriver::open(
        &DriverContext::default(),
        path.to_str().unwrap(),
        OpenFlags::read_write(),
        &MemoryConfig::default(),
        MAXADDR,
    );
    assert!(matches!(result, Err(VfdError::CantOpenFile { .. })));
}

#[test]
fn drivers_on_same_backing_file_compare_equal() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("same.bin");
    fs::write(&path, b"x").unwrap();
    let other = dir.path().join("other.bin");
    fs::write(&other, b"y").unwrap();

    let config = MemoryConfig::default();
    let a = open(&path, OpenFlags::read_only(), &config);
    let b = open(&path, OpenFlags::read_only(), &config);
    let c = open(&other, OpenFlags::read_only(), &config);
    assert_eq!(a.cmp(&b), std::cmp::Ordering::Equal);
    assert_ne!(a.cmp(&c), std::cmp::Ordering::Equal);
}
