//! Label and export endpoints.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use super::reject;
use crate::AppState;
use crate::models::{DetectionPayload, LabelSummary};
use crate::services::error::AnnotationError;
use crate::services::export;
use crate::services::labels::{self, PoseSubmission};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/labels/{session_id}/frame/{frame_name}",
            post(submit_pose_label),
        )
        .route(
            "/api/labels/{session_id}/frame/{frame_name}/detections",
            post(submit_detections),
        )
        .route("/api/labels/{session_id}", get(get_summary))
        .route("/api/labels/{session_id}/reset", post(reset_labels))
        .route("/api/export/{session_id}", post(export_classification))
        .route(
            "/api/export/{session_id}/download",
            get(download_classification),
        )
        .route(
            "/api/export/detections/{session_id}",
            post(export_detections),
        )
        .route(
            "/api/export/detections/{session_id}/download",
            get(download_detections),
        )
}

#[derive(Serialize)]
struct PoseLabelResponse {
    success: bool,
    crop_image: String,
}

/// POST /api/labels/:sid/frame/:name - attach a pose label
async fn submit_pose_label(
    State(state): State<Arc<AppState>>,
    Path((session_id, frame_name)): Path<(String, String)>,
    Json(payload): Json<PoseSubmission>,
) -> Result<Json<PoseLabelResponse>, AnnotationError> {
    let outcome =
        labels::set_pose_label(&state.storage, &session_id, &frame_name, &payload).await?;
    Ok(Json(PoseLabelResponse {
        success: true,
        crop_image: outcome.crop_name,
    }))
}

#[derive(Deserialize)]
struct DetectionRequest {
    detections: Vec<DetectionPayload>,
    #[serde(default)]
    saved: bool,
}

#[derive(Serialize)]
struct DetectionResponse {
    success: bool,
    valid_count: usize,
    saved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

/// POST /api/labels/:sid/frame/:name/detections - replace a frame's
/// detection list
async fn submit_detections(
    State(state): State<Arc<AppState>>,
    Path((session_id, frame_name)): Path<(String, String)>,
    Json(payload): Json<DetectionRequest>,
) -> Result<Json<DetectionResponse>, AnnotationError> {
    let outcome = labels::set_detections(
        &state.storage,
        &session_id,
        &frame_name,
        &payload.detections,
        payload.saved,
    )
    .await?;
    Ok(Json(DetectionResponse {
        success: true,
        valid_count: outcome.valid_count,
        saved: outcome.saved,
        message: outcome.message,
    }))
}

/// GET /api/labels/:sid - labeling progress summary
async fn get_summary(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<LabelSummary>, AnnotationError> {
    Ok(Json(labels::get_summary(&state.storage, &session_id).await?))
}

#[derive(Serialize)]
struct SuccessResponse {
    success: bool,
}

/// POST /api/labels/:sid/reset - clear all labels, keep the frames
async fn reset_labels(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SuccessResponse>, AnnotationError> {
    labels::reset_labels(&state.storage, &session_id).await?;
    Ok(Json(SuccessResponse { success: true }))
}

#[derive(Serialize)]
struct ExportResponse {
    success: bool,
    download_url: String,
}

/// POST /api/export/:sid - build the classification dataset archive
async fn export_classification(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<ExportResponse>, AnnotationError> {
    export::export_classification(&state.storage, &session_id).await?;
    Ok(Json(ExportResponse {
        success: true,
        download_url: format!("/api/export/{}/download", session_id),
    }))
}

/// GET /api/export/:sid/download
async fn download_classification(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Response {
    serve_archive(state.storage.export_path(&session_id)).await
}

/// POST /api/export/detections/:sid - build the YOLO dataset archive
async fn export_detections(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<ExportResponse>, AnnotationError> {
    export::export_detections(&state.storage, &session_id).await?;
    Ok(Json(ExportResponse {
        success: true,
        download_url: format!("/api/export/detections/{}/download", session_id),
    }))
}

/// GET /api/export/detections/:sid/download
async fn download_detections(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Response {
    serve_archive(state.storage.det_export_path(&session_id)).await
}

async fn serve_archive(path: PathBuf) -> Response {
    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "application/zip")], bytes).into_response(),
        Err(_) => reject(StatusCode::NOT_FOUND, "Export not found"),
    }
}
