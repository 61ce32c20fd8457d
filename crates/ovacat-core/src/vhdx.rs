//! VHDX metadata reader.
//!
//! Only the virtual disk size is decoded. The reader follows the file
//! type identifier, the region table and the metadata table with bounded
//! reads; it never maps or loads the whole image.

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use uuid::{uuid, Uuid};

use crate::error::{Error, Result};

/// File type identifier signature at offset 0.
pub const FILE_SIGNATURE: &[u8; 8] = b"vhdxfile";
/// Region table signature `regi` as a little-endian integer.
pub const REGION_SIGNATURE: u32 = 0x6967_6572;
/// Metadata table signature `metadata` as a little-endian integer.
pub const METADATA_SIGNATURE: u64 = 0x6174_6164_6174_656d;

/// Offsets of the primary and backup region tables.
pub const REGION_TABLE_OFFSETS: [u64; 2] = [0x30000, 0x40000];

/// Region table entry locating the metadata region.
pub const METADATA_REGION: Uuid = uuid!("8B7CA206-4790-4B9A-B8FE-575F050F886E");
/// Metadata item holding the virtual disk size.
pub const VIRTUAL_DISK_SIZE: Uuid = uuid!("2FA54224-CD1B-4876-B211-5DBED83BF4B8");

const REGION_HEADER_SIZE: usize = 16;
const REGION_ENTRY_SIZE: usize = 32;
const MAX_REGION_ENTRIES: u32 = 1024;

const METADATA_HEADER_SIZE: usize = 32;
const METADATA_ENTRY_SIZE: usize = 32;
const MAX_METADATA_ENTRIES: u16 = 2048;

/// Location of a region inside the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Region {
    offset: u64,
    length: u64,
}

fn le_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn le_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn le_u64(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// VHDX GUIDs are stored in the mixed-endian Windows layout.
fn guid_at(data: &[u8], at: usize) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&data[at..at + 16]);
    Uuid::from_bytes_le(bytes)
}

/// Read exactly `len` bytes at `offset`, mapping a short read to `Corrupt`.
fn read_at<R: Read + Seek>(reader: &mut R, offset: u64, len: usize, what: &str) -> Result<Vec<u8>> {
    reader.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => {
            Error::corrupt(format!("{} at offset {:#x} extends past end of file", what, offset))
        }
        _ => Error::io_simple(e),
    })?;
    Ok(buf)
}

/// Read the region table at `offset` and return the metadata region.
///
/// `Ok(None)` means the table is valid but has no metadata entry.
fn find_metadata_region<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<Option<Region>> {
    let header = read_at(reader, offset, REGION_HEADER_SIZE, "region table header")?;

    let signature = le_u32(&header, 0);
    if signature != REGION_SIGNATURE {
        return Err(Error::corrupt(format!(
            "invalid region table signature at {:#x}: {:#010x}",
            offset, signature
        )));
    }
    let count = le_u32(&header, 8);
    if count == 0 || count > MAX_REGION_ENTRIES {
        return Err(Error::corrupt(format!(
            "region table entry count {} out of range",
            count
        )));
    }

    let entries = read_at(
        reader,
        offset + REGION_HEADER_SIZE as u64,
        count as usize * REGION_ENTRY_SIZE,
        "region table entries",
    )?;
    Ok(entries.chunks_exact(REGION_ENTRY_SIZE).find_map(|entry| {
        (guid_at(entry, 0) == METADATA_REGION).then(|| Region {
            offset: le_u64(entry, 16),
            length: le_u32(entry, 24) as u64,
        })
    }))
}

/// Decode the virtual disk size from a VHDX stream.
pub fn read_virtual_size<R: Read + Seek>(reader: &mut R) -> Result<u64> {
    reader.seek(SeekFrom::Start(0))?;
    let mut signature = [0u8; 8];
    match reader.read_exact(&mut signature) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(Error::NotVhdx),
        Err(e) => return Err(Error::io_simple(e)),
    }
    if &signature != FILE_SIGNATURE {
        return Err(Error::NotVhdx);
    }

    // The backup table is only consulted when the primary is unusable.
    let mut region = None;
    let mut last_error = None;
    for offset in REGION_TABLE_OFFSETS {
        match find_metadata_region(reader, offset) {
            Ok(found) => {
                region = found;
                last_error = None;
                break;
            }
            Err(e @ Error::Io { .. }) => return Err(e),
            Err(e) => last_error = Some(e),
        }
    }
    if let Some(e) = last_error {
        return Err(e);
    }
    let region = region.ok_or_else(|| Error::missing_metadata("no metadata region in region table"))?;

    let header = read_at(reader, region.offset, METADATA_HEADER_SIZE, "metadata table header")?;
    let signature = le_u64(&header, 0);
    if signature != METADATA_SIGNATURE {
        return Err(Error::corrupt(format!(
            "invalid metadata table signature: {:#018x}",
            signature
        )));
    }
    let count = le_u16(&header, 10);
    if count == 0 || count > MAX_METADATA_ENTRIES {
        return Err(Error::corrupt(format!(
            "metadata entry count {} out of range",
            count
        )));
    }

    let entries = read_at(
        reader,
        region.offset.saturating_add(METADATA_HEADER_SIZE as u64),
        count as usize * METADATA_ENTRY_SIZE,
        "metadata table entries",
    )?;
    let item_offset = entries
        .chunks_exact(METADATA_ENTRY_SIZE)
        .find(|entry| guid_at(entry, 0) == VIRTUAL_DISK_SIZE)
        .map(|entry| le_u32(entry, 16) as u64)
        .ok_or_else(|| Error::missing_metadata("no virtual disk size item"))?;

    let value_start = region.offset.saturating_add(item_offset);
    let region_end = region.offset.saturating_add(region.length);
    if value_start.saturating_add(8) > region_end {
        return Err(Error::corrupt(format!(
            "virtual disk size at {:#x} lies outside the metadata region",
            value_start
        )));
    }

    let value = read_at(reader, value_start, 8, "virtual disk size")?;
    Ok(le_u64(&value, 0))
}

/// Read the virtual disk size in bytes of the VHDX at `path`.
///
/// # Errors
///
/// Returns [`Error::NotVhdx`] when the signature is absent,
/// [`Error::Corrupt`] when a table fails validation, and
/// [`Error::MissingMetadata`] when the size item cannot be found.
pub fn virtual_size(path: &Path) -> Result<u64> {
    let mut file = File::open(path).map_err(|e| Error::io(e, path))?;
    read_virtual_size(&mut file).map_err(|e| match e {
        Error::Io { source, path: None } => Error::io(source, path),
        other => other,
    })
}
