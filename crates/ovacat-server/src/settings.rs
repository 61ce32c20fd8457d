//! Process-wide settings read once from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_SOURCES_PATH: &str = "/provider/sources";
pub const DEFAULT_CATALOG_PATH: &str = "/ova";
pub const DEFAULT_CONCURRENT_DOWNLOADS: usize = 3;
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Service configuration. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// How often the remote-source catalog is reconciled.
    pub scan_interval: Duration,
    /// YAML list of remote appliance sources.
    pub sources_path: PathBuf,
    /// Root of the appliance catalog.
    pub catalog_path: PathBuf,
    /// Remove catalog directories that match no configured source.
    pub prune_catalog: bool,
    pub concurrent_downloads: usize,
    pub download_timeout: Duration,
    pub port: u16,
    pub auth_required: bool,
    /// Shared bearer secret accepted when `auth_required` is set.
    pub auth_token: String,
    /// Deadline for in-flight requests after a shutdown signal.
    pub shutdown_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scan_interval: DEFAULT_SCAN_INTERVAL,
            sources_path: PathBuf::from(DEFAULT_SOURCES_PATH),
            catalog_path: PathBuf::from(DEFAULT_CATALOG_PATH),
            prune_catalog: false,
            concurrent_downloads: DEFAULT_CONCURRENT_DOWNLOADS,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            port: DEFAULT_PORT,
            auth_required: false,
            auth_token: String::new(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through `lookup`, falling back to the default for every
    /// variable that is missing or does not parse.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let positive = |key: &str| parse::<u64>(&lookup, key).filter(|n| *n > 0);

        Self {
            scan_interval: positive("SCAN_INTERVAL")
                .map(Duration::from_secs)
                .unwrap_or(defaults.scan_interval),
            sources_path: path(&lookup, "SOURCES_PATH").unwrap_or(defaults.sources_path),
            catalog_path: path(&lookup, "CATALOG_PATH").unwrap_or(defaults.catalog_path),
            prune_catalog: flag(&lookup, "PRUNE_CATALOG").unwrap_or(defaults.prune_catalog),
            concurrent_downloads: positive("CONCURRENT_DOWNLOADS")
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or(defaults.concurrent_downloads),
            download_timeout: positive("DOWNLOAD_TIMEOUT")
                .map(|minutes| Duration::from_secs(minutes.saturating_mul(60)))
                .unwrap_or(defaults.download_timeout),
            port: parse::<u16>(&lookup, "PORT").unwrap_or(defaults.port),
            auth_required: flag(&lookup, "AUTH_REQUIRED").unwrap_or(defaults.auth_required),
            auth_token: lookup("AUTH_TOKEN").unwrap_or(defaults.auth_token),
            shutdown_timeout: parse::<u64>(&lookup, "SHUTDOWN_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
        }
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key)?.trim().parse().ok()
}

fn path(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<PathBuf> {
    lookup(key)
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    match lookup(key)?.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
