//! Frame extraction pipeline.
//!
//! Decodes an uploaded session video into sequentially numbered JPEG stills
//! at a caller-chosen sampling rate, publishing progress into the session's
//! status document. A fixed number of extractions decode at once; later
//! requests publish a `queued` status and wait for a slot.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::Semaphore;

use crate::constants::{FRAME_JPEG_QSCALE, FRAME_PREFIX, STATUS_WRITE_INTERVAL};
use crate::models::{ExtractionState, StatusRecord};
use crate::services::error::AnnotationError;
use crate::storage::Storage;

const DEFAULT_CONCURRENCY: usize = 2;
const DEFAULT_FFMPEG_THREADS: usize = 1;

#[derive(Clone)]
pub struct Extractor {
    storage: Arc<Storage>,
    permits: Arc<Semaphore>,
}

struct VideoProbe {
    fps: f64,
    frame_count: u64,
}

struct RunProgress {
    saved: Vec<String>,
    processed: u64,
    total: u64,
}

impl Extractor {
    pub fn new(storage: Arc<Storage>) -> Self {
        Extractor {
            storage,
            permits: Arc::new(Semaphore::new(extract_concurrency())),
        }
    }

    /// Decode the session's video once and keep every `interval`-th frame,
    /// writing kept frames as `frame_00001.jpg`, `frame_00002.jpg`, ...
    /// (numbered by kept frames, so the saved names never have gaps).
    /// Returns the saved names in decode order.
    pub async fn extract(
        &self,
        session_id: &str,
        fps: i64,
    ) -> Result<Vec<String>, AnnotationError> {
        if fps <= 0 {
            return Err(AnnotationError::InvalidRate);
        }
        let video_path = self.storage.video_path(session_id);
        if !tokio::fs::try_exists(&video_path).await.unwrap_or(false) {
            return Err(AnnotationError::SourceMissing);
        }

        let probe = probe_video(&video_path).await?;
        let interval = compute_interval(probe.fps, fps as f64);

        // Admission control. Latecomers announce themselves as queued
        // before blocking on a slot.
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.write_status(
                    session_id,
                    ExtractionState::Queued,
                    probe.frame_count,
                    0,
                    "waiting for an extraction slot",
                )
                .await;
                self.permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(AnnotationError::storage)?
            }
        };

        self.write_status(
            session_id,
            ExtractionState::Processing,
            probe.frame_count,
            0,
            "",
        )
        .await;

        let scratch = env::temp_dir().join(format!("vidlabel_extract_{}", rand::random::<u64>()));
        let mut progress = RunProgress {
            saved: Vec::new(),
            processed: 0,
            total: probe.frame_count,
        };
        let result = self
            .run_extraction(session_id, &video_path, &scratch, interval, &mut progress)
            .await;
        cleanup_scratch_dir(&scratch).await;
        drop(permit);

        match result {
            Ok(()) => {
                self.write_status(
                    session_id,
                    ExtractionState::Done,
                    progress.total,
                    progress.processed,
                    "",
                )
                .await;
                println!(
                    "[extract] Session {}: {} raw frames decoded, {} kept (interval {})",
                    session_id,
                    progress.processed,
                    progress.saved.len(),
                    interval
                );
                Ok(progress.saved)
            }
            Err(e) => {
                self.write_status(
                    session_id,
                    ExtractionState::Error,
                    progress.total,
                    progress.processed,
                    &e.to_string(),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn run_extraction(
        &self,
        session_id: &str,
        video_path: &Path,
        scratch: &Path,
        interval: u64,
        progress: &mut RunProgress,
    ) -> Result<(), AnnotationError> {
        decode_all_frames(video_path, scratch).await?;
        let raw_frames = list_raw_frames(scratch).await?;
        if progress.total == 0 {
            progress.total = raw_frames.len() as u64;
        }
        self.subsample_frames(session_id, &raw_frames, interval, progress)
            .await
    }

    /// Walk the decoded stills in order, keeping every `interval`-th one.
    /// Progress is persisted every `STATUS_WRITE_INTERVAL` raw frames to
    /// bound write amplification.
    async fn subsample_frames(
        &self,
        session_id: &str,
        raw_frames: &[PathBuf],
        interval: u64,
        progress: &mut RunProgress,
    ) -> Result<(), AnnotationError> {
        let frames_dir = self.storage.frames_dir(session_id);
        tokio::fs::create_dir_all(&frames_dir)
            .await
            .map_err(AnnotationError::storage)?;

        for (index, raw_path) in raw_frames.iter().enumerate() {
            if index as u64 % interval == 0 {
                let name = frame_file_name(progress.saved.len() + 1);
                tokio::fs::copy(raw_path, frames_dir.join(&name))
                    .await
                    .map_err(AnnotationError::storage)?;
                progress.saved.push(name);
            }
            progress.processed += 1;
            if progress.processed % STATUS_WRITE_INTERVAL == 0 {
                self.write_status(
                    session_id,
                    ExtractionState::Processing,
                    progress.total,
                    progress.processed,
                    "",
                )
                .await;
            }
        }
        Ok(())
    }

    /// Status writes are advisory; a failed write never aborts extraction.
    async fn write_status(
        &self,
        session_id: &str,
        status: ExtractionState,
        total_frames: u64,
        processed_frames: u64,
        message: &str,
    ) {
        let record = StatusRecord {
            status,
            total_frames,
            processed_frames,
            message: message.to_string(),
        };
        if let Err(e) = self.storage.write_status(session_id, &record).await {
            eprintln!("[extract] Failed to write status for {}: {}", session_id, e);
        }
    }
}

/// One ffmpeg pass dumping every raw frame of the video as a numbered JPEG.
async fn decode_all_frames(video_path: &Path, scratch: &Path) -> Result<(), AnnotationError> {
    tokio::fs::create_dir_all(scratch)
        .await
        .map_err(AnnotationError::storage)?;
    let threads = ffmpeg_threads().to_string();
    let pattern = scratch.join("raw_%06d.jpg");

    let output = Command::new("ffmpeg")
        .args(["-hide_banner", "-loglevel", "error", "-nostdin"])
        .args(["-threads", &threads])
        .args(["-i", video_path.to_str().unwrap()])
        .args(["-an", "-sn"])
        .args(["-q:v", &FRAME_JPEG_QSCALE.to_string()])
        .args(["-y", pattern.to_str().unwrap()])
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| AnnotationError::SourceUnreadable(format!("failed to spawn ffmpeg: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AnnotationError::SourceUnreadable(
            stderr.trim().to_string(),
        ));
    }
    Ok(())
}

/// Best-effort probe of the native frame rate and total frame count.
/// Values ffprobe cannot report read as 0.
async fn probe_video(video_path: &Path) -> Result<VideoProbe, AnnotationError> {
    let output = Command::new("ffprobe")
        .args(["-v", "error"])
        .args(["-select_streams", "v:0"])
        .args(["-show_entries", "stream=r_frame_rate,nb_frames"])
        .args(["-of", "default=noprint_wrappers=1"])
        .arg(video_path.to_str().unwrap())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| {
            AnnotationError::SourceUnreadable(format!("failed to spawn ffprobe: {}", e))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AnnotationError::SourceUnreadable(
            stderr.trim().to_string(),
        ));
    }
    Ok(parse_probe_output(&String::from_utf8_lossy(&output.stdout)))
}

fn parse_probe_output(stdout: &str) -> VideoProbe {
    let mut fps = 0.0;
    let mut frame_count = 0u64;
    for line in stdout.lines() {
        if let Some(value) = line.strip_prefix("r_frame_rate=") {
            fps = parse_frame_rate(value.trim()).unwrap_or(0.0);
        } else if let Some(value) = line.strip_prefix("nb_frames=") {
            frame_count = value.trim().parse().unwrap_or(0);
        }
    }
    VideoProbe { fps, frame_count }
}

/// ffprobe reports the rate as a fraction, e.g. `30000/1001`.
fn parse_frame_rate(value: &str) -> Option<f64> {
    match value.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            (num > 0.0 && den > 0.0).then(|| num / den)
        }
        None => value.trim().parse().ok().filter(|v: &f64| *v > 0.0),
    }
}

/// `max(1, round(native / requested))` when the native rate is known,
/// else keep every frame.
fn compute_interval(native_fps: f64, requested_fps: f64) -> u64 {
    if native_fps > 0.0 {
        ((native_fps / requested_fps).round() as u64).max(1)
    } else {
        1
    }
}

fn frame_file_name(kept_index: usize) -> String {
    format!("{}{:05}.jpg", FRAME_PREFIX, kept_index)
}

async fn list_raw_frames(scratch: &Path) -> Result<Vec<PathBuf>, AnnotationError> {
    let mut frames = Vec::new();
    let mut entries = tokio::fs::read_dir(scratch)
        .await
        .map_err(AnnotationError::storage)?;
    while let Some(entry) = entries.next_entry().await.map_err(AnnotationError::storage)? {
        let path = entry.path();
        if path.extension().map(|e| e == "jpg").unwrap_or(false)
            && path
                .file_name()
                .map(|n| n.to_string_lossy().starts_with("raw_"))
                .unwrap_or(false)
        {
            frames.push(path);
        }
    }
    frames.sort();
    Ok(frames)
}

async fn cleanup_scratch_dir(scratch: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(scratch).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            eprintln!("[extract] Failed to clean scratch dir {:?}: {}", scratch, e);
        }
    }
}

fn extract_concurrency() -> usize {
    env::var("EXTRACT_CONCURRENCY")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_CONCURRENCY)
}

fn ffmpeg_threads() -> usize {
    env::var("FFMPEG_THREADS")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_FFMPEG_THREADS)
}
