//! Domain error taxonomy and route-level error helpers.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Everything that can go wrong in the annotation domain.
#[derive(Debug)]
pub enum AnnotationError {
    SessionNotFound,
    FrameNotFound,
    InvalidRate,
    InvalidLabel(String),
    InvalidBox(String),
    SourceMissing,
    SourceUnreadable(String),
    EncodeFailure(String),
    SizeLimitExceeded,
    Storage(String),
}

impl std::fmt::Display for AnnotationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnnotationError::SessionNotFound => write!(f, "Session not found"),
            AnnotationError::FrameNotFound => write!(f, "Frame not found in session"),
            AnnotationError::InvalidRate => write!(f, "fps must be a positive integer"),
            AnnotationError::InvalidLabel(s) => write!(f, "Invalid label: {}", s),
            AnnotationError::InvalidBox(s) => write!(f, "Invalid box: {}", s),
            AnnotationError::SourceMissing => write!(f, "No uploaded video for this session"),
            AnnotationError::SourceUnreadable(s) => write!(f, "Cannot decode video: {}", s),
            AnnotationError::EncodeFailure(s) => write!(f, "Image processing failed: {}", s),
            AnnotationError::SizeLimitExceeded => write!(f, "Upload exceeds the size limit"),
            AnnotationError::Storage(s) => write!(f, "Storage error: {}", s),
        }
    }
}

impl std::error::Error for AnnotationError {}

impl AnnotationError {
    /// Fold an opaque storage failure into the taxonomy.
    pub fn storage(e: impl std::fmt::Display) -> Self {
        AnnotationError::Storage(e.to_string())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AnnotationError::SessionNotFound
            | AnnotationError::FrameNotFound
            | AnnotationError::SourceMissing => StatusCode::NOT_FOUND,
            AnnotationError::InvalidRate
            | AnnotationError::InvalidLabel(_)
            | AnnotationError::InvalidBox(_) => StatusCode::BAD_REQUEST,
            AnnotationError::SizeLimitExceeded => StatusCode::PAYLOAD_TOO_LARGE,
            AnnotationError::SourceUnreadable(_)
            | AnnotationError::EncodeFailure(_)
            | AnnotationError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for AnnotationError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            eprintln!("[api] {}", self);
        }
        (
            status,
            Json(ErrorBody {
                detail: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Extension trait for logging errors and converting to StatusCode
pub trait LogErr<T> {
    /// Log error with context and return INTERNAL_SERVER_ERROR
    fn log_500(self, context: &str) -> Result<T, StatusCode>;
}

impl<T, E: std::fmt::Display> LogErr<T> for Result<T, E> {
    fn log_500(self, context: &str) -> Result<T, StatusCode> {
        self.map_err(|e| {
            eprintln!("{}: {}", context, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
    }
}
