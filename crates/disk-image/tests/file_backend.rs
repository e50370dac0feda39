#![cfg(not(target_arch = "wasm32"))]

use std::fs;

use disk_image::{read_padded, DiskError, FileBackend, StorageBackend};
use tempfile::tempdir;

#[test]
fn file_backend_reads_at_explicit_offsets() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("disk.img");
    let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    fs::write(&path, &data).unwrap();

    let backend = FileBackend::open_read_only(&path).unwrap();
    assert_eq!(backend.len().unwrap(), 4096);

    // Interleaved reads must not depend on a shared cursor.
    let mut a = [0u8; 16];
    let mut b = [0u8; 16];
    backend.read_at(3000, &mut a).unwrap();
    backend.read_at(123, &mut b).unwrap();
    assert_eq!(&a, &data[3000..3016]);
    assert_eq!(&b, &data[123..139]);
}

#[test]
fn file_backend_read_oob_returns_out_of_bounds() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("disk.img");
    fs::write(&path, vec![0x5Au8; 1024]).unwrap();
    let backend = FileBackend::open_read_only(&path).unwrap();

    let mut buf = [0u8; 200];
    let err = backend.read_at(900, &mut buf).unwrap_err();
    assert!(matches!(err, DiskError::OutOfBounds { .. }));

    // The padded variant tolerates the same read.
    assert_eq!(read_padded(&backend, 900, &mut buf).unwrap(), 124);
    assert!(buf[..124].iter().all(|&b| b == 0x5A));
    assert!(buf[124..].iter().all(|&b| b == 0));
}

#[test]
fn open_missing_file_reports_path() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("nope.img");
    let err = FileBackend::open_read_only(&missing).unwrap_err();
    match err {
        DiskError::Io(msg) => assert!(msg.contains("nope.img"), "{msg}"),
        other => panic!("unexpected error {other:?}"),
    }
}
