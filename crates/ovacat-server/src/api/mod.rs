//! HTTP handlers.
//!
//! Handlers are thin: filesystem and parsing work runs on the blocking pool
//! with a cancellation token derived from the server's shutdown token.

pub mod appliance;
pub mod error;
pub mod inventory;

pub use error::ApiError;

use axum::http::{Method, Uri};

/// Run catalog work on the blocking pool.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> ovacat_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(work).await??)
}

/// Fallback for unknown routes.
pub async fn not_found(uri: Uri) -> ApiError {
    ApiError::NotFound(format!("no route for {}", uri.path()))
}

/// Fallback for known routes called with an unsupported method.
pub async fn method_not_allowed(method: Method, uri: Uri) -> ApiError {
    ApiError::MethodNotAllowed(format!("{} is not allowed on {}", method, uri.path()))
}
