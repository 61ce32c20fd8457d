//! Integration tests for the VHDX virtual size reader.

mod common;

use common::{build_vhdx, METADATA_OFFSET};
use ovacat_core::vhdx::{read_virtual_size, virtual_size};
use ovacat_core::Error;
use std::fs;
use std::io::Cursor;
use tempfile::TempDir;

#[test]
fn test_reads_virtual_size() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("disk.vhdx");
    fs::write(&path, build_vhdx(21474836480)).unwrap();

    assert_eq!(virtual_size(&path).unwrap(), 21474836480);
}

#[test]
fn test_backup_region_table_used_when_primary_is_damaged() {
    let mut image = build_vhdx(1 << 40);
    image[0x30000..0x30004].copy_from_slice(b"XXXX");
    assert_eq!(read_virtual_size(&mut Cursor::new(image)).unwrap(), 1 << 40);
}

#[test]
fn test_not_vhdx() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("disk.vhd");
    fs::write(&path, b"conectix\0\0\0\0").unwrap();
    assert!(matches!(virtual_size(&path).unwrap_err(), Error::NotVhdx));
}

#[test]
fn test_bad_region_count() {
    let mut image = build_vhdx(4096);
    for table in [0x30000usize, 0x40000] {
        image[table + 8..table + 12].copy_from_slice(&2000u32.to_le_bytes());
    }
    let err = read_virtual_size(&mut Cursor::new(image)).unwrap_err();
    assert!(matches!(err, Error::Corrupt { .. }), "got {:?}", err);
}

#[test]
fn test_bad_metadata_signature() {
    let mut image = build_vhdx(4096);
    image[METADATA_OFFSET..METADATA_OFFSET + 8].copy_from_slice(b"metadat!");
    let err = read_virtual_size(&mut Cursor::new(image)).unwrap_err();
    assert!(matches!(err, Error::Corrupt { .. }), "got {:?}", err);
}

#[test]
fn test_missing_size_item() {
    let mut image = build_vhdx(4096);
    // Overwrite the size entry's item id.
    let entry = METADATA_OFFSET + 64;
    image[entry..entry + 16].fill(0xEE);
    let err = read_virtual_size(&mut Cursor::new(image)).unwrap_err();
    assert!(matches!(err, Error::MissingMetadata { .. }), "got {:?}", err);
}

#[test]
fn test_missing_metadata_region() {
    let mut image = build_vhdx(4096);
    for table in [0x30000usize, 0x40000] {
        let entry = table + 48;
        image[entry..entry + 16].fill(0x11);
    }
    let err = read_virtual_size(&mut Cursor::new(image)).unwrap_err();
    assert!(matches!(err, Error::MissingMetadata { .. }), "got {:?}", err);
}

#[test]
fn test_size_item_outside_region() {
    let mut image = build_vhdx(4096);
    let entry = METADATA_OFFSET + 64;
    image[entry + 16..entry + 20].copy_from_slice(&0x0FFFCu32.to_le_bytes());
    let err = read_virtual_size(&mut Cursor::new(image)).unwrap_err();
    assert!(matches!(err, Error::Corrupt { .. }), "got {:?}", err);
}

#[test]
fn test_truncated_image() {
    let image = build_vhdx(4096);
    let err = read_virtual_size(&mut Cursor::new(image[..0x30008].to_vec())).unwrap_err();
    assert!(matches!(err, Error::Corrupt { .. }), "got {:?}", err);
}
