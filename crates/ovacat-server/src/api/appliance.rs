//! Appliance upload, listing and removal.
//!
//! Each uploaded appliance lives alone in `appliance-<sha256(filename)>`
//! under the catalog root. Creating that directory is the per-filename lock:
//! a second upload of the same name sees `EEXIST` and is refused. The body is
//! streamed to a hidden temporary file in the directory and renamed into
//! place, so the scanner never observes a partial upload.

use std::fs::{self, Metadata, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use axum::extract::multipart::{Field, MultipartRejection};
use axum::extract::rejection::PathRejection;
use axum::extract::{Multipart, Path as UrlPath, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ovacat_core::inventory::{guess_source, project_vm};
use ovacat_core::ova::{is_ova, read_envelope};
use ovacat_core::scan::QUARANTINE;
use ovacat_core::{Error, IdMaps, ScannedAppliance};

use super::{blocking, ApiError};
use crate::AppState;

pub const DIRECTORY_PREFIX: &str = "appliance-";
pub const APPLIANCE_FIELD: &str = "appliance";
pub const DIR_MODE: u32 = 0o750;
pub const FILE_MODE: u32 = 0o640;

/// An appliance as listed by `GET /appliances`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplianceInfo {
    pub file: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub virtual_systems: Vec<SystemRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemRef {
    pub name: String,
    pub id: String,
}

/// Lowercase hex SHA-256 of an uploaded filename.
pub fn name_digest(filename: &str) -> String {
    format!("{:x}", Sha256::digest(filename.as_bytes()))
}

/// Where an uploaded appliance named `filename` is stored.
pub fn appliance_path(catalog: &Path, filename: &str) -> PathBuf {
    catalog
        .join(format!("{}{}", DIRECTORY_PREFIX, name_digest(filename)))
        .join(filename)
}

/// Final component of a client-supplied name, if it has one.
fn base_name(name: &str) -> Option<String> {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
}

/// Lock directory of an in-flight upload, removed when dropped unless kept.
///
/// Removal runs on every exit path, including when the handler future is
/// dropped because the client went away or the server stopped waiting.
struct UploadDir {
    path: PathBuf,
    keep: bool,
}

impl UploadDir {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for UploadDir {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(dir = %self.path.display(), error = %e, "failed to remove upload directory")
            }
        }
    }
}

/// Describe one appliance file, parsing it for its virtual systems.
///
/// Parse failures are recorded in `error`; only cancellation and identifier
/// encoding faults fail the call.
pub fn appliance_info(
    path: &Path,
    metadata: &Metadata,
    ids: &IdMaps,
    cancel: &CancellationToken,
) -> ovacat_core::Result<ApplianceInfo> {
    let mut info = ApplianceInfo {
        file: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        size: metadata.len(),
        modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        source: None,
        virtual_systems: Vec::new(),
        error: None,
    };

    let envelope = match read_envelope(path, cancel) {
        Ok(envelope) => envelope,
        Err(Error::Cancelled) => return Err(Error::Cancelled),
        Err(e) => {
            info.error = Some(e.to_string());
            return Ok(info);
        }
    };

    info.source = Some(guess_source(&envelope).to_string());
    let appliance = ScannedAppliance {
        path: path.to_path_buf(),
        envelope,
    };
    for system in &appliance.envelope.virtual_systems {
        let vm = project_vm(&appliance, system, ids)?;
        info.virtual_systems.push(SystemRef {
            name: system.name.clone(),
            id: vm.uuid,
        });
    }
    Ok(info)
}

fn sorted_entries(dir: &Path) -> ovacat_core::Result<Vec<fs::DirEntry>> {
    let mut entries = fs::read_dir(dir)
        .and_then(|entries| entries.collect::<io::Result<Vec<_>>>())
        .map_err(|e| Error::io(e, dir))?;
    entries.sort_by_key(|entry| entry.file_name());
    Ok(entries)
}

/// Every `.ova` held in an `appliance-*` directory of the catalog.
pub fn list_appliances(
    catalog: &Path,
    ids: &IdMaps,
    cancel: &CancellationToken,
) -> ovacat_core::Result<Vec<ApplianceInfo>> {
    let mut appliances = Vec::new();
    for entry in sorted_entries(catalog)? {
        let is_appliance_dir = entry.file_type().is_ok_and(|t| t.is_dir())
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(DIRECTORY_PREFIX));
        if !is_appliance_dir {
            continue;
        }
        for file in sorted_entries(&entry.path())? {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let path = file.path();
            if !file.file_type().is_ok_and(|t| t.is_file()) || !is_ova(&path) {
                continue;
            }
            // Vanished between listing and stat.
            let Ok(metadata) = file.metadata() else {
                continue;
            };
            appliances.push(appliance_info(&path, &metadata, ids, cancel)?);
        }
    }
    Ok(appliances)
}

/// GET /appliances
pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<ApplianceInfo>>, ApiError> {
    let cancel = state.request_token();
    let appliances = blocking(move || {
        list_appliances(&state.settings.catalog_path, &state.ids, &cancel)
    })
    .await?;
    Ok(Json(appliances))
}

/// POST /appliances
///
/// The stored file's mtime is set to the upload time minus the scanner's
/// quarantine window so that it is inventoried at once; `modified` in the
/// response and in `GET /appliances` reports that adjusted time.
pub async fn upload(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ApplianceInfo>, ApiError> {
    let mut multipart = multipart.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        if field.name() == Some(APPLIANCE_FIELD) {
            return receive(state, field).await.map(Json);
        }
    }
    Err(ApiError::BadRequest(format!(
        "request has no '{}' form field",
        APPLIANCE_FIELD
    )))
}

async fn receive(state: AppState, field: Field<'_>) -> Result<ApplianceInfo, ApiError> {
    let filename = field
        .file_name()
        .and_then(base_name)
        .ok_or_else(|| ApiError::BadRequest("upload has no filename".to_string()))?;
    if !filename.to_ascii_lowercase().ends_with(".ova") {
        return Err(ApiError::BadRequest(
            "filename must end with .ova extension".to_string(),
        ));
    }

    let target = appliance_path(&state.settings.catalog_path, &filename);
    let dir = target
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| ApiError::Internal("appliance path has no parent".to_string()))?;

    match tokio::fs::DirBuilder::new().mode(DIR_MODE).create(&dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(ApiError::Conflict(
                "a file by that name already exists".to_string(),
            ));
        }
        Err(e) => return Err(e.into()),
    }
    let lock = UploadDir::new(dir);

    let cancel = state.request_token();
    let result = store(field, &target, &cancel).await;
    let result = match result {
        Ok(()) => validate(&state, &target, cancel).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(info) => {
            lock.keep();
            info!(file = %filename, size = info.size, "appliance uploaded");
            Ok(info)
        }
        Err(e) => {
            warn!(file = %filename, error = %e, "rolling back appliance upload");
            Err(e)
        }
    }
}

/// Stream the field into a temporary file beside `target`, then publish it.
async fn store(
    mut field: Field<'_>,
    target: &Path,
    cancel: &CancellationToken,
) -> Result<(), ApiError> {
    let dir = target
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| ApiError::Internal("appliance path has no parent".to_string()))?;
    let temp = tokio::task::spawn_blocking(move || {
        tempfile::Builder::new()
            .prefix(".upload-")
            .tempfile_in(&dir)
    })
    .await??;

    let (file, temp_path) = temp.into_parts();
    let mut file = tokio::fs::File::from_std(file);
    loop {
        if cancel.is_cancelled() {
            return Err(ApiError::Unavailable);
        }
        let chunk = field
            .chunk()
            .await
            .map_err(|e| ApiError::BadRequest(format!("upload interrupted: {}", e.body_text())))?;
        match chunk {
            Some(chunk) => file.write_all(&chunk).await?,
            None => break,
        }
    }
    file.flush().await?;
    file.sync_all().await?;
    let file = file.into_std().await;

    let target = target.to_path_buf();
    tokio::task::spawn_blocking(move || publish(NamedTempFile::from_parts(file, temp_path), &target))
        .await??;
    Ok(())
}

/// Give the upload its final mode and mtime and rename it into place.
///
/// The file only becomes visible once complete, so its mtime is moved
/// outside the scanner's quarantine window.
fn publish(temp: NamedTempFile, target: &Path) -> io::Result<()> {
    temp.as_file()
        .set_permissions(Permissions::from_mode(FILE_MODE))?;
    let settled = SystemTime::now()
        .checked_sub(QUARANTINE)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    temp.as_file().set_modified(settled)?;
    temp.persist_noclobber(target).map_err(|e| e.error)?;
    Ok(())
}

async fn validate(
    state: &AppState,
    target: &Path,
    cancel: CancellationToken,
) -> Result<ApplianceInfo, ApiError> {
    let ids = state.ids.clone();
    let target = target.to_path_buf();
    let info = blocking(move || {
        let metadata = fs::metadata(&target).map_err(|e| Error::io(e, &target))?;
        appliance_info(&target, &metadata, &ids, &cancel)
    })
    .await?;
    match info.error {
        Some(reason) => Err(ApiError::BadRequest(reason)),
        None => Ok(info),
    }
}

/// DELETE /appliances/{filename}
///
/// Succeeds whether or not the appliance existed.
pub async fn delete(
    State(state): State<AppState>,
    filename: Result<UrlPath<String>, PathRejection>,
) -> Result<StatusCode, ApiError> {
    let UrlPath(filename) = filename.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let Some(filename) = base_name(&filename) else {
        return Ok(StatusCode::NO_CONTENT);
    };
    let target = appliance_path(&state.settings.catalog_path, &filename);
    let Some(dir) = target.parent() else {
        return Ok(StatusCode::NO_CONTENT);
    };
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => info!(file = %filename, "appliance deleted"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(StatusCode::NO_CONTENT)
}
