//! Appliance access for OVA archives and loose OVF descriptors.
//!
//! An OVA is a POSIX tar stream. Entries are visited in order and the first
//! one named `*.ovf` is taken as the descriptor; nothing after it is read.
//! Disk entries before it are skipped without being buffered.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::ovf::{parse_envelope, Envelope};

/// Initial buffer reserved for a descriptor; larger ones grow on demand.
const DESCRIPTOR_RESERVE: u64 = 4 * 1024 * 1024;

/// An appliance on disk, by container shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Appliance {
    /// A `.ova` tar archive holding the descriptor.
    Archive(PathBuf),
    /// A `.ovf` descriptor with its files alongside.
    Loose(PathBuf),
}

/// Whether `path` names an OVA archive.
pub fn is_ova(path: &Path) -> bool {
    has_extension(path, "ova")
}

/// Whether `path` names a loose OVF descriptor.
pub fn is_ovf(path: &Path) -> bool {
    has_extension(path, "ovf")
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

impl Appliance {
    /// Classify `path` by its extension.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotArchive`] when the extension is neither `.ova`
    /// nor `.ovf`.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if is_ova(&path) {
            Ok(Appliance::Archive(path))
        } else if is_ovf(&path) {
            Ok(Appliance::Loose(path))
        } else {
            Err(Error::not_archive(format!(
                "'{}' is neither an .ova nor an .ovf file",
                path.display()
            )))
        }
    }

    /// The path this appliance was opened from.
    pub fn path(&self) -> &Path {
        match self {
            Appliance::Archive(path) | Appliance::Loose(path) => path,
        }
    }

    /// Open the underlying file for reading.
    pub fn open_stream(&self) -> Result<File> {
        File::open(self.path()).map_err(|e| Error::io(e, self.path()))
    }

    /// Return the raw descriptor bytes.
    ///
    /// For archives the token is checked before each tar entry, and
    /// [`Error::Cancelled`] is returned once it fires.
    pub fn locate_descriptor(&self, cancel: &CancellationToken) -> Result<Vec<u8>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut stream = self.open_stream()?;
        match self {
            Appliance::Loose(path) => {
                let mut data = Vec::new();
                stream
                    .read_to_end(&mut data)
                    .map_err(|e| Error::io(e, path))?;
                Ok(data)
            }
            Appliance::Archive(_) => read_descriptor_from_tar(stream, cancel),
        }
    }

    /// Locate and parse the descriptor.
    pub fn envelope(&self, cancel: &CancellationToken) -> Result<Envelope> {
        let data = self.locate_descriptor(cancel)?;
        parse_envelope(&data)
    }
}

/// Read the envelope of the appliance at `path`.
///
/// # Arguments
///
/// * `path` - Path to a `.ova` or `.ovf` file.
/// * `cancel` - Token checked between tar entries.
///
/// # Errors
///
/// Fails with [`Error::NotArchive`], [`Error::NoDescriptor`],
/// [`Error::MalformedXml`] or [`Error::Truncated`] for bad content, and
/// with [`Error::Io`] or [`Error::Cancelled`] otherwise.
pub fn read_envelope(path: &Path, cancel: &CancellationToken) -> Result<Envelope> {
    Appliance::from_path(path)?.envelope(cancel)
}

/// Scan a tar stream for the first `.ovf` entry and return its contents.
pub fn read_descriptor_from_tar<R: Read>(reader: R, cancel: &CancellationToken) -> Result<Vec<u8>> {
    let mut archive = tar::Archive::new(reader);
    let mut entries = archive
        .entries()
        .map_err(|e| Error::not_archive(e.to_string()))?;

    let mut seen_header = false;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let Some(entry) = entries.next() else {
            break;
        };

        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) if !seen_header => return Err(Error::not_archive(e.to_string())),
            Err(e) => return Err(Error::truncated(format!("reading tar entry: {}", e))),
        };
        seen_header = true;

        let size = entry.size();
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        if size == 0 {
            debug!(entry = %name, "skipping empty tar entry");
            continue;
        }
        if !name.to_ascii_lowercase().ends_with(".ovf") {
            continue;
        }

        let mut data = Vec::with_capacity(size.min(DESCRIPTOR_RESERVE) as usize);
        entry.read_to_end(&mut data).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => {
                Error::truncated(format!("descriptor '{}' ends early: {}", name, e))
            }
            _ => Error::io_simple(e),
        })?;
        // The tar reader stops at end of input without an error.
        if (data.len() as u64) < size {
            return Err(Error::truncated(format!(
                "descriptor '{}' has {} of {} bytes",
                name,
                data.len(),
                size
            )));
        }
        return Ok(data);
    }

    Err(Error::NoDescriptor)
}
