//! HTTP inventory service for the OVA appliance catalog.
//!
//! Routes:
//!
//! | Method   | Path                      | Handler                          |
//! |----------|---------------------------|----------------------------------|
//! | `GET`    | `/appliances`             | [`api::appliance::list`]         |
//! | `POST`   | `/appliances`             | [`api::appliance::upload`]       |
//! | `DELETE` | `/appliances/{filename}`  | [`api::appliance::delete`]       |
//! | `GET`    | `/vms`                    | [`api::inventory::vms`]          |
//! | `GET`    | `/disks`                  | [`api::inventory::disks`]        |
//! | `GET`    | `/networks`               | [`api::inventory::networks`]     |
//! | `GET`    | `/test_connection`        | [`api::inventory::test_connection`] |
//! | `GET`    | `/catalog`                | [`catalog::statuses`]            |
//!
//! Every route sits behind [`auth::require_token`].

pub mod api;
pub mod auth;
pub mod catalog;
pub mod settings;

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::os::unix::fs::DirBuilderExt;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get};
use axum::{middleware, Router};
use ovacat_core::{IdMaps, Scanner};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::appliance::DIR_MODE;
use crate::catalog::CatalogManager;
use crate::settings::Settings;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub ids: Arc<IdMaps>,
    pub scanner: Arc<Scanner>,
    pub catalog: Arc<CatalogManager>,
    /// Cancelled when the server begins shutting down.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(settings: Arc<Settings>) -> Self {
        let catalog = Arc::new(CatalogManager::new(&settings));
        Self {
            settings,
            ids: Arc::new(IdMaps::new()),
            scanner: Arc::new(Scanner::new()),
            catalog,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token for one request's work, cancelled on shutdown.
    pub fn request_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/appliances",
            get(api::appliance::list)
                .post(api::appliance::upload)
                .layer(DefaultBodyLimit::disable()),
        )
        .route("/appliances/{filename}", delete(api::appliance::delete))
        .route("/vms", get(api::inventory::vms))
        .route("/disks", get(api::inventory::disks))
        .route("/networks", get(api::inventory::networks))
        .route("/test_connection", get(api::inventory::test_connection))
        .route("/catalog", get(catalog::statuses))
        .fallback(api::not_found)
        .method_not_allowed_fallback(api::method_not_allowed)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_token,
        ))
        .with_state(state)
}

/// Create the catalog root if needed.
pub fn prepare_catalog(settings: &Settings) -> anyhow::Result<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(&settings.catalog_path)
        .with_context(|| {
            format!(
                "Failed to create catalog directory {}",
                settings.catalog_path.display()
            )
        })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C");
    };

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Run the service until a shutdown signal arrives.
///
/// On a signal the listener stops accepting, every request's cancellation
/// token fires, and in-flight requests get `shutdown_timeout` to finish.
pub async fn run(settings: Arc<Settings>) -> anyhow::Result<()> {
    prepare_catalog(&settings)?;

    let state = AppState::new(Arc::clone(&settings));
    let shutdown = state.shutdown.clone();

    let manager = tokio::spawn(Arc::clone(&state.catalog).run(shutdown.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(
        addr = %listener.local_addr().context("Failed to get local address")?,
        catalog = %settings.catalog_path.display(),
        auth = settings.auth_required,
        "OVA catalog server listening"
    );

    let trigger = shutdown.clone();
    let server = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutting down");
            trigger.cancel();
        })
        .into_future();

    let deadline = async {
        shutdown.cancelled().await;
        tokio::time::sleep(settings.shutdown_timeout).await;
    };

    tokio::select! {
        result = server => result.context("Server error")?,
        _ = deadline => warn!(
            timeout = ?settings.shutdown_timeout,
            "in-flight requests did not finish before the shutdown deadline"
        ),
    }

    shutdown.cancel();
    if let Err(e) = manager.await {
        error!("Catalog manager task failed: {}", e);
    }
    info!("Shutdown complete");
    Ok(())
}
