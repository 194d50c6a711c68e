//! Session lifecycle: creation, video intake, status, and cleanup.

use std::path::PathBuf;

use chrono::Utc;
use tokio::io::AsyncWriteExt;

use crate::models::{SessionDocument, StatusRecord};
use crate::services::error::AnnotationError;
use crate::storage::Storage;

/// Opaque session id: millisecond timestamp plus a random suffix.
pub fn generate_session_id() -> String {
    format!(
        "{}_{:08x}",
        Utc::now().timestamp_millis(),
        rand::random::<u32>()
    )
}

/// Bootstrap a session: its directories, a `pending` status, and the
/// initial (frameless) label document. Paired with [`generate_session_id`]
/// this is session creation; the upload route runs the two around the
/// multipart stream because the `fps` field can arrive after the file.
pub async fn initialize_session(
    storage: &Storage,
    session_id: &str,
    fps: i64,
) -> Result<u32, AnnotationError> {
    if fps <= 0 {
        return Err(AnnotationError::InvalidRate);
    }
    let fps = fps as u32;
    storage
        .ensure_session_dirs(session_id)
        .await
        .map_err(AnnotationError::storage)?;
    storage
        .write_status(session_id, &StatusRecord::pending())
        .await
        .map_err(AnnotationError::storage)?;
    storage
        .write_session(&SessionDocument::new(session_id, fps))
        .await
        .map_err(AnnotationError::storage)?;
    Ok(fps)
}

/// Uploads must look like a video: a `.mp4` filename or any `video/*` type.
pub fn is_video_upload(filename: &str, content_type: &str) -> bool {
    filename.to_ascii_lowercase().ends_with(".mp4")
        || content_type.to_ascii_lowercase().starts_with("video/")
}

/// Streams an upload into `videos/{sid}/raw.mp4` under a byte ceiling.
/// Exceeding the ceiling (or failing mid-write) aborts the transfer and
/// deletes the partial file.
pub struct VideoWriter {
    file: Option<tokio::fs::File>,
    path: PathBuf,
    limit: usize,
    written: usize,
}

impl VideoWriter {
    pub async fn create(
        storage: &Storage,
        session_id: &str,
        limit: usize,
    ) -> Result<Self, AnnotationError> {
        let path = storage.video_path(session_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(AnnotationError::storage)?;
        }
        let file = tokio::fs::File::create(&path)
            .await
            .map_err(AnnotationError::storage)?;
        Ok(VideoWriter {
            file: Some(file),
            path,
            limit,
            written: 0,
        })
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), AnnotationError> {
        self.written += chunk.len();
        if self.written > self.limit {
            self.discard().await;
            return Err(AnnotationError::SizeLimitExceeded);
        }
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_all(chunk).await {
                self.discard().await;
                return Err(AnnotationError::storage(e));
            }
        }
        Ok(())
    }

    pub async fn finish(mut self) -> Result<PathBuf, AnnotationError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await.map_err(AnnotationError::storage)?;
        }
        println!(
            "[session] Stored {} byte video at {:?}",
            self.written, self.path
        );
        Ok(self.path)
    }

    /// Drop the partial file after an aborted transfer.
    pub async fn discard(&mut self) {
        self.file = None;
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                eprintln!(
                    "[session] Failed to remove partial upload {:?}: {}",
                    self.path, e
                );
            }
        }
    }
}

/// Remove every artifact of a session.
pub async fn cleanup_session(storage: &Storage, session_id: &str) -> Result<(), AnnotationError> {
    storage
        .remove_session(session_id)
        .await
        .map_err(AnnotationError::storage)?;
    println!("[session] Cleaned up session {}", session_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExtractionState;

    fn scratch_storage() -> Storage {
        let root = std::env::temp_dir().join(format!("vidlabel_session_{}", rand::random::<u64>()));
        Storage::new(root)
    }

    async fn new_session(storage: &Storage, fps: i64) -> Result<String, AnnotationError> {
        let sid = generate_session_id();
        initialize_session(storage, &sid, fps).await?;
        Ok(sid)
    }

    #[test]
    fn video_uploads_are_recognized() {
        assert!(is_video_upload("clip.MP4", "application/octet-stream"));
        assert!(is_video_upload("clip.webm", "video/webm"));
        assert!(!is_video_upload("notes.txt", "text/plain"));
    }

    #[tokio::test]
    async fn session_creation_rejects_non_positive_rates() {
        let storage = scratch_storage();
        assert!(matches!(
            new_session(&storage, 0).await,
            Err(AnnotationError::InvalidRate)
        ));
        assert!(matches!(
            new_session(&storage, -3).await,
            Err(AnnotationError::InvalidRate)
        ));
    }

    #[tokio::test]
    async fn session_creation_bootstraps_documents() {
        let storage = scratch_storage();
        let sid = new_session(&storage, 5).await.unwrap();

        let status = storage.read_status(&sid).await;
        assert_eq!(status.status, ExtractionState::Pending);
        let doc = storage.read_session(&sid).await.unwrap().unwrap();
        assert_eq!(doc.fps, 5);
        assert!(doc.frames.is_empty());

        cleanup_session(&storage, &sid).await.unwrap();
        assert!(storage.read_session(&sid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_uploads_abort_and_delete_the_partial_file() {
        let storage = scratch_storage();
        let sid = new_session(&storage, 5).await.unwrap();

        let mut writer = VideoWriter::create(&storage, &sid, 10).await.unwrap();
        writer.write_chunk(b"12345").await.unwrap();
        let result = writer.write_chunk(b"6789012345").await;
        assert!(matches!(result, Err(AnnotationError::SizeLimitExceeded)));
        assert!(
            !tokio::fs::try_exists(storage.video_path(&sid))
                .await
                .unwrap()
        );

        storage.remove_session(&sid).await.unwrap();
    }

    #[tokio::test]
    async fn completed_uploads_survive() {
        let storage = scratch_storage();
        let sid = new_session(&storage, 5).await.unwrap();

        let mut writer = VideoWriter::create(&storage, &sid, 1024).await.unwrap();
        writer.write_chunk(b"header").await.unwrap();
        writer.write_chunk(b"frames").await.unwrap();
        let path = writer.finish().await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"headerframes");

        storage.remove_session(&sid).await.unwrap();
    }
}
