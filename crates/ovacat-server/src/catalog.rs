//! Remote-source catalog manager.
//!
//! Periodically reads a YAML list of appliance URLs and makes sure each one
//! is present in the catalog as `<sha256(url)>/appliance.ova`, downloading
//! the missing ones with bounded concurrency. Progress is kept per URL and
//! served at `GET /catalog`.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::appliance::DIRECTORY_PREFIX;
use crate::settings::Settings;
use crate::AppState;

pub const APPLIANCE_FILENAME: &str = "appliance.ova";
pub const DOWNLOAD_FILENAME: &str = "appliance.ova.download";

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("I/O error at '{}': {source}", path.display())]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    #[error("invalid sources file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response code: {0}")]
    Status(reqwest::StatusCode),

    #[error("download did not finish within {0:?}")]
    Timeout(Duration),

    #[error("download cancelled")]
    Cancelled,
}

impl CatalogError {
    fn io(source: io::Error, path: impl Into<PathBuf>) -> Self {
        CatalogError::Io {
            source,
            path: path.into(),
        }
    }
}

/// A configured appliance source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Pending,
    InProgress,
    Complete,
    Error,
}

/// Download state of one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplianceStatus {
    pub status: Status,
    pub url: String,
    /// Percent complete, when the size is known.
    pub progress: u64,
    /// Bytes on disk (or received so far).
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Seen during the current pass.
    #[serde(skip)]
    staged: bool,
}

impl ApplianceStatus {
    fn new(status: Status, url: &str) -> Self {
        Self {
            status,
            url: url.to_string(),
            progress: 0,
            size: 0,
            modified: None,
            error: None,
            staged: true,
        }
    }
}

fn url_digest(url: &str) -> String {
    format!("{:x}", Sha256::digest(url.as_bytes()))
}

/// Parse a sources file. An empty file configures no sources.
pub fn parse_sources(text: &str) -> Result<Vec<Source>, CatalogError> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_yaml::from_str(text)?)
}

/// Keeps the catalog in step with the configured sources.
pub struct CatalogManager {
    catalog_path: PathBuf,
    sources_path: PathBuf,
    interval: Duration,
    prune: bool,
    concurrent_downloads: usize,
    download_timeout: Duration,
    client: reqwest::Client,
    statuses: RwLock<HashMap<String, ApplianceStatus>>,
}

impl CatalogManager {
    pub fn new(settings: &Settings) -> Self {
        Self {
            catalog_path: settings.catalog_path.clone(),
            sources_path: settings.sources_path.clone(),
            interval: settings.scan_interval,
            prune: settings.prune_catalog,
            concurrent_downloads: settings.concurrent_downloads.max(1),
            download_timeout: settings.download_timeout,
            client: reqwest::Client::new(),
            statuses: RwLock::new(HashMap::new()),
        }
    }

    /// Directory a source's appliance is stored in.
    pub fn appliance_dir(&self, url: &str) -> PathBuf {
        self.catalog_path.join(url_digest(url))
    }

    /// Current statuses, sorted by URL.
    pub fn statuses(&self) -> Vec<ApplianceStatus> {
        let statuses = self.statuses.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<ApplianceStatus> = statuses.values().cloned().collect();
        list.sort_by(|a, b| a.url.cmp(&b.url));
        list
    }

    /// Reconcile every interval until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(sources = %self.sources_path.display(), interval = ?self.interval, "catalog manager started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => self.reconcile(&shutdown).await,
            }
        }
        info!("catalog manager stopped");
    }

    /// One pass: load sources, prune, download what is missing.
    pub async fn reconcile(self: &Arc<Self>, shutdown: &CancellationToken) {
        let sources = match self.load_sources().await {
            Ok(sources) => sources,
            Err(e) => {
                error!(path = %self.sources_path.display(), error = %e, "failed to load catalog sources");
                return;
            }
        };

        if self.prune {
            if let Err(e) = self.prune_unlisted(&sources).await {
                error!(path = %self.catalog_path.display(), error = %e, "failed to prune catalog");
                return;
            }
        }

        self.begin_staging();
        let permits = Arc::new(Semaphore::new(self.concurrent_downloads));
        let mut downloads = JoinSet::new();
        let mut seen = HashSet::new();
        for source in sources {
            let url = source.url;
            if !seen.insert(url.clone()) {
                continue;
            }
            if self.present(&url).await {
                self.mark_complete(&url).await;
                continue;
            }
            self.mark_pending(&url);

            let manager = Arc::clone(self);
            let permits = Arc::clone(&permits);
            let cancel = shutdown.child_token();
            downloads.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                if let Err(e) = manager.download(&url, &cancel).await {
                    error!(url = %url, error = %e, "failed to download appliance");
                    manager.mark_error(&url, &e);
                    let dir = manager.appliance_dir(&url);
                    if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                        if e.kind() != io::ErrorKind::NotFound {
                            warn!(dir = %dir.display(), error = %e, "unable to clean up after failed download");
                        }
                    }
                }
            });
        }
        while let Some(result) = downloads.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "download task failed");
            }
        }
        self.end_staging();
    }

    async fn load_sources(&self) -> Result<Vec<Source>, CatalogError> {
        let text = tokio::fs::read_to_string(&self.sources_path)
            .await
            .map_err(|e| CatalogError::io(e, &self.sources_path))?;
        parse_sources(&text)
    }

    /// Remove catalog directories that belong to no configured source.
    ///
    /// Hidden entries, plain files and uploaded appliances are left alone.
    async fn prune_unlisted(&self, sources: &[Source]) -> Result<(), CatalogError> {
        let wanted: HashSet<String> = sources.iter().map(|s| url_digest(&s.url)).collect();
        let mut entries = tokio::fs::read_dir(&self.catalog_path)
            .await
            .map_err(|e| CatalogError::io(e, &self.catalog_path))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CatalogError::io(e, &self.catalog_path))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || name.starts_with(DIRECTORY_PREFIX) || wanted.contains(&name) {
                continue;
            }
            if !entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                continue;
            }
            let dir = entry.path();
            info!(path = %dir.display(), "pruning appliance directory not found in sources");
            for file in [APPLIANCE_FILENAME, DOWNLOAD_FILENAME] {
                remove_quietly(&dir.join(file), tokio::fs::remove_file(dir.join(file)).await);
            }
            remove_quietly(&dir, tokio::fs::remove_dir(&dir).await);
        }
        Ok(())
    }

    async fn present(&self, url: &str) -> bool {
        tokio::fs::try_exists(self.appliance_dir(url).join(APPLIANCE_FILENAME))
            .await
            .unwrap_or(false)
    }

    async fn download(&self, url: &str, cancel: &CancellationToken) -> Result<(), CatalogError> {
        let dir = self.appliance_dir(url);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CatalogError::io(e, &dir))?;
        let partial = dir.join(DOWNLOAD_FILENAME);

        let transfer = self.transfer(url, &partial, cancel);
        match tokio::time::timeout(self.download_timeout, transfer).await {
            Ok(result) => result?,
            Err(_) => return Err(CatalogError::Timeout(self.download_timeout)),
        }

        let target = dir.join(APPLIANCE_FILENAME);
        tokio::fs::rename(&partial, &target)
            .await
            .map_err(|e| CatalogError::io(e, &target))?;
        info!(url = %url, path = %target.display(), "appliance downloaded");
        self.mark_complete(url).await;
        Ok(())
    }

    async fn transfer(
        &self,
        url: &str,
        partial: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), CatalogError> {
        let mut file = tokio::fs::File::create(partial)
            .await
            .map_err(|e| CatalogError::io(e, partial))?;

        let response = self.client.get(url).send().await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(CatalogError::Status(response.status()));
        }

        let length = response.content_length();
        self.mark_in_progress(url, length, 0);
        let mut received: u64 = 0;
        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(CatalogError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| CatalogError::io(e, partial))?;
            received += chunk.len() as u64;
            self.mark_in_progress(url, length, received);
        }
        file.sync_all()
            .await
            .map_err(|e| CatalogError::io(e, partial))?;
        debug!(url = %url, bytes = received, "transfer finished");
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut HashMap<String, ApplianceStatus>)) {
        let mut statuses = self.statuses.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut statuses);
    }

    fn begin_staging(&self) {
        self.update(|statuses| {
            for status in statuses.values_mut() {
                status.staged = false;
            }
        });
    }

    /// Drop statuses of sources no longer configured.
    fn end_staging(&self) {
        self.update(|statuses| statuses.retain(|_, status| status.staged));
    }

    fn mark_pending(&self, url: &str) {
        self.update(|statuses| {
            statuses
                .entry(url.to_string())
                .and_modify(|status| status.staged = true)
                .or_insert_with(|| ApplianceStatus::new(Status::Pending, url));
        });
    }

    fn mark_in_progress(&self, url: &str, length: Option<u64>, received: u64) {
        let progress = match length {
            Some(length) if length > 0 => received.saturating_mul(100) / length,
            _ => 0,
        };
        self.update(|statuses| {
            let mut status = ApplianceStatus::new(Status::InProgress, url);
            status.progress = progress;
            status.size = received;
            statuses.insert(url.to_string(), status);
        });
    }

    async fn mark_complete(&self, url: &str) {
        let path = self.appliance_dir(url).join(APPLIANCE_FILENAME);
        match tokio::fs::metadata(&path).await {
            Ok(metadata) => self.update(|statuses| {
                let mut status = ApplianceStatus::new(Status::Complete, url);
                status.progress = 100;
                status.size = metadata.len();
                status.modified = metadata.modified().ok().map(DateTime::<Utc>::from);
                statuses.insert(url.to_string(), status);
            }),
            Err(e) => self.mark_error(url, &CatalogError::io(e, path)),
        }
    }

    fn mark_error(&self, url: &str, error: &CatalogError) {
        self.update(|statuses| {
            let mut status = ApplianceStatus::new(Status::Error, url);
            status.error = Some(error.to_string());
            statuses.insert(url.to_string(), status);
        });
    }
}

fn remove_quietly(path: &Path, result: io::Result<()>) {
    if let Err(e) = result {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "unable to prune");
        }
    }
}

/// GET /catalog
pub async fn statuses(State(state): State<AppState>) -> Json<Vec<ApplianceStatus>> {
    Json(state.catalog.statuses())
}
