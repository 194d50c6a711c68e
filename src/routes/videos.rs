//! Video endpoints: upload, extraction status, frame listing/retrieval,
//! and session cleanup.

use axum::{
    Json, Router,
    extract::{Multipart, Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Serialize;
use std::sync::Arc;

use super::{reject, unsafe_path_component};
use crate::AppState;
use crate::constants::MAX_VIDEO_UPLOAD_SIZE;
use crate::models::StatusRecord;
use crate::services::error::{AnnotationError, LogErr};
use crate::services::labels as label_service;
use crate::services::session::{self, VideoWriter};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/videos/upload", post(upload_video))
        .route("/api/videos/{session_id}/status", get(get_status))
        .route("/api/videos/{session_id}/frames", get(list_frames))
        .route(
            "/api/videos/{session_id}/frames/{frame_name}",
            get(fetch_frame),
        )
        .route("/api/videos/{session_id}", delete(cleanup))
}

#[derive(Serialize)]
struct UploadResponse {
    session_id: String,
    message: &'static str,
}

/// POST /api/videos/upload - multipart form with a `file` part and an `fps`
/// part. Responds as soon as the video is stored; extraction continues in
/// the background and is observable via the status document.
async fn upload_video(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, Response> {
    let session_id = session::generate_session_id();
    state
        .storage
        .ensure_session_dirs(&session_id)
        .await
        .map_err(|e| AnnotationError::storage(e).into_response())?;

    let mut fps: Option<i64> = None;
    let mut stored = false;

    while let Some(mut field) = multipart.next_field().await.map_err(|e| {
        reject(
            StatusCode::BAD_REQUEST,
            &format!("malformed multipart body: {}", e),
        )
    })? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "fps" => {
                let text = field.text().await.map_err(|e| {
                    reject(StatusCode::BAD_REQUEST, &format!("unreadable fps field: {}", e))
                })?;
                match text.trim().parse::<i64>() {
                    Ok(value) => fps = Some(value),
                    Err(_) => return Err(AnnotationError::InvalidRate.into_response()),
                }
            }
            "file" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let content_type = field.content_type().unwrap_or_default().to_string();
                if !session::is_video_upload(&filename, &content_type) {
                    return Err(reject(
                        StatusCode::UNSUPPORTED_MEDIA_TYPE,
                        "only video uploads are supported",
                    ));
                }
                let mut writer =
                    VideoWriter::create(&state.storage, &session_id, MAX_VIDEO_UPLOAD_SIZE)
                        .await
                        .map_err(IntoResponse::into_response)?;
                loop {
                    match field.chunk().await {
                        Ok(Some(chunk)) => {
                            // The writer removes the partial file itself when
                            // the ceiling is hit or a write fails.
                            if let Err(e) = writer.write_chunk(&chunk).await {
                                return Err(e.into_response());
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            writer.discard().await;
                            return Err(reject(
                                StatusCode::BAD_REQUEST,
                                &format!("upload interrupted: {}", e),
                            ));
                        }
                    }
                }
                writer.finish().await.map_err(IntoResponse::into_response)?;
                stored = true;
            }
            _ => {}
        }
    }

    let Some(fps) = fps else {
        return Err(reject(StatusCode::BAD_REQUEST, "missing fps field"));
    };
    if !stored {
        return Err(reject(StatusCode::BAD_REQUEST, "missing file field"));
    }

    session::initialize_session(&state.storage, &session_id, fps)
        .await
        .map_err(IntoResponse::into_response)?;

    let storage = state.storage.clone();
    let extractor = state.extractor.clone();
    let sid = session_id.clone();
    tokio::spawn(async move {
        match extractor.extract(&sid, fps).await {
            Ok(frames) => {
                if let Err(e) =
                    label_service::register_frames(&storage, &sid, fps as u32, &frames).await
                {
                    eprintln!("[extract] Failed to register frames for {}: {}", sid, e);
                }
            }
            Err(e) => eprintln!("[extract] Extraction failed for {}: {}", sid, e),
        }
    });

    Ok(Json(UploadResponse {
        session_id,
        message: "video uploaded, extracting frames",
    }))
}

/// GET /api/videos/:sid/status - extraction progress, `pending` until the
/// first run writes something.
async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<StatusRecord> {
    Json(state.storage.read_status(&session_id).await)
}

#[derive(Serialize)]
struct FramesResponse {
    frames: Vec<String>,
}

/// GET /api/videos/:sid/frames - extracted frame names in order
async fn list_frames(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<FramesResponse>, StatusCode> {
    let frames = state
        .storage
        .list_frames(&session_id)
        .await
        .log_500("List frames error")?;
    Ok(Json(FramesResponse { frames }))
}

/// GET /api/videos/:sid/frames/:name - one frame as JPEG bytes
async fn fetch_frame(
    State(state): State<Arc<AppState>>,
    Path((session_id, frame_name)): Path<(String, String)>,
) -> Result<impl IntoResponse, AnnotationError> {
    if unsafe_path_component(&session_id) || unsafe_path_component(&frame_name) {
        return Err(AnnotationError::FrameNotFound);
    }
    let path = state.storage.frame_path(&session_id, &frame_name);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| AnnotationError::FrameNotFound)?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], bytes))
}

#[derive(Serialize)]
struct SuccessResponse {
    success: bool,
}

/// DELETE /api/videos/:sid - remove every artifact of the session
async fn cleanup(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SuccessResponse>, AnnotationError> {
    if unsafe_path_component(&session_id) {
        return Err(AnnotationError::SessionNotFound);
    }
    session::cleanup_session(&state.storage, &session_id).await?;
    Ok(Json(SuccessResponse { success: true }))
}
