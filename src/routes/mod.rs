pub mod labels;
pub mod videos;

use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use crate::AppState;

/// Build all routes for the API
pub fn build_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(videos::routes())
        .merge(labels::routes())
}

/// Route-level rejection with the same `{"detail": ...}` body shape the
/// domain errors use.
pub(crate) fn reject(status: StatusCode, detail: &str) -> Response {
    (status, Json(serde_json::json!({ "detail": detail }))).into_response()
}

/// Path traversal protection for caller-supplied ids and file names that
/// get joined into storage paths.
pub(crate) fn unsafe_path_component(value: &str) -> bool {
    value.is_empty()
        || value.contains("..")
        || value.contains('/')
        || value.contains('\\')
        || value.contains('\0')
}
