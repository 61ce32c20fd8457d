//! Inventory routes: each request rescans the catalog and projects it.

use axum::extract::State;
use axum::Json;
use ovacat_core::inventory::{project_disks, project_networks, project_vms};
use ovacat_core::{Vm, VmDisk, VmNetwork};

use super::{blocking, ApiError};
use crate::AppState;

pub const TEST_CONNECTION_MESSAGE: &str = "Test connection successful";

/// GET /vms
pub async fn vms(State(state): State<AppState>) -> Result<Json<Vec<Vm>>, ApiError> {
    let cancel = state.request_token();
    let vms = blocking(move || {
        let appliances = state.scanner.scan(&state.settings.catalog_path, &cancel)?;
        project_vms(&appliances, &state.ids)
    })
    .await?;
    Ok(Json(vms))
}

/// GET /disks
pub async fn disks(State(state): State<AppState>) -> Result<Json<Vec<VmDisk>>, ApiError> {
    let cancel = state.request_token();
    let disks = blocking(move || {
        let appliances = state.scanner.scan(&state.settings.catalog_path, &cancel)?;
        project_disks(&appliances, &state.ids)
    })
    .await?;
    Ok(Json(disks))
}

/// GET /networks
pub async fn networks(State(state): State<AppState>) -> Result<Json<Vec<VmNetwork>>, ApiError> {
    let cancel = state.request_token();
    let networks = blocking(move || {
        let appliances = state.scanner.scan(&state.settings.catalog_path, &cancel)?;
        project_networks(&appliances, &state.ids)
    })
    .await?;
    Ok(Json(networks))
}

/// GET /test_connection
pub async fn test_connection() -> Json<&'static str> {
    Json(TEST_CONNECTION_MESSAGE)
}
