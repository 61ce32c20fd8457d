//! Catalog discovery.
//!
//! The scanner walks the catalog root, skips files that still look like an
//! in-progress copy, and parses every remaining appliance. Per-path failures
//! are logged once and skipped; only an unreadable root fails the scan.

use std::collections::HashSet;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::error::{Error, Result};
use crate::ova::{is_ova, is_ovf, read_envelope};
use crate::ovf::Envelope;

/// Files modified more recently than this are skipped for the pass.
pub const QUARANTINE: Duration = Duration::from_secs(30);

/// Deepest level an `.ova` is accepted at, counting the root's entries as 1.
pub const OVA_MAX_DEPTH: usize = 2;
/// Deepest level an `.ovf` is accepted at.
pub const OVF_MAX_DEPTH: usize = 3;

/// A parsed appliance and the path it was read from.
#[derive(Debug, Clone)]
pub struct ScannedAppliance {
    pub path: PathBuf,
    pub envelope: Envelope,
}

/// Whether a file looks like it is still being written.
///
/// Empty files and files whose mtime is within [`QUARANTINE`] of `now` (or
/// in the future) are quarantined.
pub fn is_quarantined(metadata: &Metadata, now: SystemTime) -> bool {
    if metadata.len() == 0 {
        return true;
    }
    match metadata.modified() {
        Ok(modified) => match now.duration_since(modified) {
            Ok(age) => age < QUARANTINE,
            Err(_) => true,
        },
        Err(_) => false,
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

fn is_candidate(entry: &DirEntry) -> bool {
    if !entry.file_type().is_file() {
        return false;
    }
    let path = entry.path();
    (is_ova(path) && entry.depth() <= OVA_MAX_DEPTH) || (is_ovf(path) && entry.depth() <= OVF_MAX_DEPTH)
}

/// Walks a catalog root and parses the appliances in it.
///
/// The scanner remembers which `(path, error)` pairs it has already
/// reported so repeated passes over a broken appliance log it only once.
#[derive(Debug, Default)]
pub struct Scanner {
    reported: Mutex<HashSet<(PathBuf, String)>>,
}

impl Scanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan `root` and return every appliance that parsed.
    ///
    /// # Arguments
    ///
    /// * `root` - The catalog root directory.
    /// * `cancel` - Checked before each directory entry and inside the parser.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if `root` cannot be read and
    /// [`Error::Cancelled`] if the token fires mid-walk.
    pub fn scan(&self, root: &Path, cancel: &CancellationToken) -> Result<Vec<ScannedAppliance>> {
        std::fs::read_dir(root).map_err(|e| Error::io(e, root))?;

        let now = SystemTime::now();
        let mut appliances = Vec::new();
        let walker = WalkDir::new(root)
            .min_depth(1)
            .max_depth(OVF_MAX_DEPTH)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_hidden(e));

        for entry in walker {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                    self.report(&path, &e.to_string());
                    continue;
                }
            };
            if !is_candidate(&entry) {
                continue;
            }

            let path = entry.path();
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    self.report(path, &e.to_string());
                    continue;
                }
            };
            if is_quarantined(&metadata, now) {
                debug!(path = %path.display(), "skipping appliance in quarantine");
                continue;
            }

            match read_envelope(path, cancel) {
                Ok(envelope) => {
                    self.forget(path);
                    appliances.push(ScannedAppliance {
                        path: path.to_path_buf(),
                        envelope,
                    });
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => self.report(path, &e.to_string()),
            }
        }

        Ok(appliances)
    }

    fn report(&self, path: &Path, error: &str) {
        let first = self
            .reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((path.to_path_buf(), error.to_string()));
        if first {
            warn!(path = %path.display(), error, "skipping appliance");
        }
    }

    fn forget(&self, path: &Path) {
        self.reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(reported, _)| reported != path);
    }
}
