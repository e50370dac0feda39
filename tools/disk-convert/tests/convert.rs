#![cfg(not(target_arch = "wasm32"))]

use std::fs;

use predicates::prelude::*;
use tempfile::tempdir;

const DISK_BYTES: usize = 6 * 1024 * 1024;

fn sample_image() -> Vec<u8> {
    let mut data = vec![0u8; DISK_BYTES];
    data[..16].copy_from_slice(b"disk-convert mbr");
    data[510] = 0x55;
    data[511] = 0xAA;
    // Lands in the third 2 MiB block; the second stays sparse.
    data[4 * 1024 * 1024 + 777] = 0x99;
    data
}

#[test]
fn raw_to_dynamic_and_back_roundtrips() {
    let dir = tempdir().unwrap();
    let raw = dir.path().join("disk.img");
    let vhd = dir.path().join("disk.vhd");
    let flat = dir.path().join("restored.img");
    let data = sample_image();
    fs::write(&raw, &data).unwrap();

    assert_cmd::cargo::cargo_bin_cmd!("disk-convert")
        .args(["to-dynamic", "--quiet", "--threads", "2"])
        .arg(&raw)
        .arg(&vhd)
        .assert()
        .success();

    let container = fs::read(&vhd).unwrap();
    // footer + header + BAT sector + two allocated blocks + footer
    assert_eq!(
        container.len(),
        512 + 1024 + 512 + 2 * (512 + 2 * 1024 * 1024) + 512
    );
    assert!(container.len() < data.len());
    assert_eq!(&container[..8], b"conectix");
    assert_eq!(&container[container.len() - 512..][..8], b"conectix");

    assert_cmd::cargo::cargo_bin_cmd!("disk-convert")
        .args(["to-flat", "--quiet"])
        .arg(&vhd)
        .arg(&flat)
        .assert()
        .success();

    assert_eq!(fs::read(&flat).unwrap(), data);
}

#[test]
fn sprs_roundtrip_through_cli() {
    let dir = tempdir().unwrap();
    let raw = dir.path().join("disk.img");
    let sprs = dir.path().join("disk.sprs");
    let flat = dir.path().join("restored.img");
    let data = sample_image();
    fs::write(&raw, &data).unwrap();

    assert_cmd::cargo::cargo_bin_cmd!("disk-convert")
        .args(["to-sprs", "--quiet"])
        .arg(&raw)
        .arg(&sprs)
        .assert()
        .success();
    // Sectors 0 and 8192 are the only non-zero ones.
    assert_eq!(fs::metadata(&sprs).unwrap().len(), 12 + 2 * 516);

    assert_cmd::cargo::cargo_bin_cmd!("disk-convert")
        .args(["to-flat", "--quiet"])
        .arg(&sprs)
        .arg(&flat)
        .assert()
        .success();
    assert_eq!(fs::read(&flat).unwrap(), data);
}

#[test]
fn refuses_to_overwrite_without_force() {
    let dir = tempdir().unwrap();
    let raw = dir.path().join("disk.img");
    let vhd = dir.path().join("disk.vhd");
    fs::write(&raw, sample_image()).unwrap();
    fs::write(&vhd, b"keep me").unwrap();

    assert_cmd::cargo::cargo_bin_cmd!("disk-convert")
        .args(["to-dynamic", "--quiet"])
        .arg(&raw)
        .arg(&vhd)
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
    assert_eq!(fs::read(&vhd).unwrap(), b"keep me");

    assert_cmd::cargo::cargo_bin_cmd!("disk-convert")
        .args(["to-dynamic", "--quiet", "--force"])
        .arg(&raw)
        .arg(&vhd)
        .assert()
        .success();
    assert_eq!(&fs::read(&vhd).unwrap()[..8], b"conectix");
}

#[test]
fn rejects_bad_block_size() {
    let dir = tempdir().unwrap();
    let raw = dir.path().join("disk.img");
    let vhd = dir.path().join("disk.vhd");
    fs::write(&raw, sample_image()).unwrap();

    assert_cmd::cargo::cargo_bin_cmd!("disk-convert")
        .args(["to-dynamic", "--quiet", "--block-size-bytes", "3000"])
        .arg(&raw)
        .arg(&vhd)
        .assert()
        .failure()
        .stderr(predicate::str::contains("block size"));
    assert!(!vhd.exists());
}

#[test]
fn partial_trailing_sector_is_refused() {
    let dir = tempdir().unwrap();
    let raw = dir.path().join("odd.img");
    let vhd = dir.path().join("odd.vhd");
    let sprs = dir.path().join("odd.sprs");
    fs::write(&raw, vec![0x3Cu8; 1000]).unwrap();

    assert_cmd::cargo::cargo_bin_cmd!("disk-convert")
        .args(["to-dynamic", "--quiet"])
        .arg(&raw)
        .arg(&vhd)
        .assert()
        .failure()
        .stderr(predicate::str::contains("multiple of 512"));
    assert!(!vhd.exists());

    assert_cmd::cargo::cargo_bin_cmd!("disk-convert")
        .args(["to-sprs", "--quiet"])
        .arg(&raw)
        .arg(&sprs)
        .assert()
        .failure()
        .stderr(predicate::str::contains("multiple of 512"));
    assert!(!sprs.exists());
}

#[test]
fn to_flat_rejects_raw_input_and_leaves_no_output() {
    let dir = tempdir().unwrap();
    let raw = dir.path().join("disk.img");
    let flat = dir.path().join("out.img");
    fs::write(&raw, vec![0u8; 4096]).unwrap();

    assert_cmd::cargo::cargo_bin_cmd!("disk-convert")
        .args(["to-flat", "--quiet"])
        .arg(&raw)
        .arg(&flat)
        .assert()
        .failure()
        .stderr(predicate::str::contains("not a VHD or SPRS image"));
    assert!(!flat.exists());
}

#[test]
fn corrupted_footer_checksum_fails_unless_ignored() {
    let dir = tempdir().unwrap();
    let raw = dir.path().join("disk.img");
    let vhd = dir.path().join("disk.vhd");
    let flat = dir.path().join("out.img");
    let data = sample_image();
    fs::write(&raw, &data).unwrap();

    assert_cmd::cargo::cargo_bin_cmd!("disk-convert")
        .args(["to-dynamic", "--quiet"])
        .arg(&raw)
        .arg(&vhd)
        .assert()
        .success();

    let mut container = fs::read(&vhd).unwrap();
    let footer = container.len() - 512;
    container[footer + 64] ^= 0xFF;
    fs::write(&vhd, &container).unwrap();

    assert_cmd::cargo::cargo_bin_cmd!("disk-convert")
        .args(["to-flat", "--quiet"])
        .arg(&vhd)
        .arg(&flat)
        .assert()
        .failure()
        .stderr(predicate::str::contains("checksum"));
    assert!(!flat.exists());

    assert_cmd::cargo::cargo_bin_cmd!("disk-convert")
        .args(["to-flat", "--quiet", "--ignore-checksums"])
        .arg(&vhd)
        .arg(&flat)
        .assert()
        .success();
    assert_eq!(fs::read(&flat).unwrap(), data);
}

#[test]
fn info_reports_dynamic_layout_as_json() {
    let dir = tempdir().unwrap();
    let raw = dir.path().join("disk.img");
    let vhd = dir.path().join("disk.vhd");
    fs::write(&raw, sample_image()).unwrap();

    assert_cmd::cargo::cargo_bin_cmd!("disk-convert")
        .args(["to-dynamic", "--quiet"])
        .arg(&raw)
        .arg(&vhd)
        .assert()
        .success();

    let output = assert_cmd::cargo::cargo_bin_cmd!("disk-convert")
        .args(["info", "--json"])
        .arg(&vhd)
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["format"], "vhd-dynamic");
    assert_eq!(json["diskSizeBytes"], DISK_BYTES as u64);
    assert_eq!(json["vhd"]["blockSizeBytes"], 2 * 1024 * 1024);
    assert_eq!(json["vhd"]["totalBlocks"], 3);
    assert_eq!(json["vhd"]["allocatedBlocks"], 2);
    assert_eq!(json["vhd"]["creatorApp"], "dcnv");
}

#[test]
fn info_prints_text_for_raw_images() {
    let dir = tempdir().unwrap();
    let raw = dir.path().join("disk.img");
    fs::write(&raw, vec![0u8; 8192]).unwrap();

    assert_cmd::cargo::cargo_bin_cmd!("disk-convert")
        .arg("info")
        .arg(&raw)
        .assert()
        .success()
        .stdout(predicate::str::contains("format:       raw"))
        .stdout(predicate::str::contains("8192 bytes"));
}
