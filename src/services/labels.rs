//! Label engine: validates pose and detection submissions, derives the
//! geometry stored with each frame, and keeps the session document current.
//!
//! Pose labels and detection labels are orthogonal: a frame can carry either
//! or both, and neither operation touches the other's fields.

use std::collections::HashMap;

use image::imageops::FilterType;
use serde::Deserialize;

use crate::constants::{CROP_PREFIX, CROP_SIZE, LABEL_MAX, LABEL_MIN};
use crate::models::{
    BoundingBox, BoxPayload, Detection, DetectionPayload, FrameRecord, LabelSummary, Point,
    PosePoints, SessionDocument,
};
use crate::services::crops;
use crate::services::error::AnnotationError;
use crate::storage::Storage;

/// One pose-label submission for a single frame.
#[derive(Debug, Clone, Deserialize)]
pub struct PoseSubmission {
    pub head_box: BoxPayload,
    pub left_hand_box: BoxPayload,
    pub right_hand_box: BoxPayload,
    pub label: i64,
    pub hand_label: Option<i64>,
}

struct ValidatedPose {
    label: u8,
    hand_label: Option<u8>,
    head: BoundingBox,
    left: BoundingBox,
    right: BoundingBox,
}

impl PoseSubmission {
    /// Single validation pass, evaluated before any stored state changes.
    fn validate(&self) -> Result<ValidatedPose, AnnotationError> {
        let label = validate_label(self.label)?;
        let hand_label = self.hand_label.map(validate_label).transpose()?;
        let head = validate_box(&self.head_box, "head_box")?;
        let left = validate_box(&self.left_hand_box, "left_hand_box")?;
        let right = validate_box(&self.right_hand_box, "right_hand_box")?;
        Ok(ValidatedPose {
            label,
            hand_label,
            head,
            left,
            right,
        })
    }
}

fn validate_label(value: i64) -> Result<u8, AnnotationError> {
    if (LABEL_MIN as i64..=LABEL_MAX as i64).contains(&value) {
        Ok(value as u8)
    } else {
        Err(AnnotationError::InvalidLabel(format!(
            "label must be an integer between {} and {}",
            LABEL_MIN, LABEL_MAX
        )))
    }
}

fn validate_box(bbox: &BoxPayload, name: &str) -> Result<BoundingBox, AnnotationError> {
    if ![bbox.x, bbox.y, bbox.width, bbox.height]
        .iter()
        .all(|v| v.is_finite())
    {
        return Err(AnnotationError::InvalidBox(format!(
            "{} values must be finite numbers",
            name
        )));
    }
    let cast = BoundingBox {
        x: bbox.x as i64,
        y: bbox.y as i64,
        width: bbox.width as i64,
        height: bbox.height as i64,
    };
    if cast.width <= 0 || cast.height <= 0 {
        return Err(AnnotationError::InvalidBox(format!(
            "{} width and height must be positive",
            name
        )));
    }
    Ok(cast)
}

fn box_center(bbox: &BoundingBox) -> Point {
    Point {
        x: bbox.x as f64 + bbox.width as f64 / 2.0,
        y: bbox.y as f64 + bbox.height as f64 / 2.0,
    }
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

fn round6(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}

/// Express a keypoint in head-box units, clamped into [0,1] and rounded to
/// 6 decimal places.
fn relative_to_head(point: Point, head: &BoundingBox) -> Result<Point, AnnotationError> {
    if head.width <= 0 || head.height <= 0 {
        return Err(AnnotationError::InvalidBox(
            "head_box must have positive extent".to_string(),
        ));
    }
    Ok(Point {
        x: round6(clamp01((point.x - head.x as f64) / head.width as f64)),
        y: round6(clamp01((point.y - head.y as f64) / head.height as f64)),
    })
}

pub struct PoseLabelOutcome {
    pub crop_name: String,
}

/// Attach a pose label to a frame: the three boxes, the classification
/// labels, derived keypoints and relative pose, and a head-crop preview.
/// All derived fields are written together in one document replace.
pub async fn set_pose_label(
    storage: &Storage,
    session_id: &str,
    frame_name: &str,
    submission: &PoseSubmission,
) -> Result<PoseLabelOutcome, AnnotationError> {
    let validated = submission.validate()?;

    let lock = storage.session_lock(session_id);
    let _guard = lock.lock().await;

    let mut doc = storage
        .read_session(session_id)
        .await
        .map_err(AnnotationError::storage)?
        .ok_or(AnnotationError::SessionNotFound)?;
    let index = doc
        .frame_index(frame_name)
        .ok_or(AnnotationError::FrameNotFound)?;

    // Head-crop preview for the annotation UI.
    let frame_path = storage.frame_path(session_id, frame_name);
    let data = match tokio::fs::read(&frame_path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AnnotationError::FrameNotFound);
        }
        Err(e) => return Err(AnnotationError::storage(e)),
    };
    let img = crops::decode(&data)?;
    let fitted = crops::fit_box(&validated.head, img.width(), img.height())?;
    let preview = crops::crop(&img, &fitted).resize_exact(CROP_SIZE, CROP_SIZE, FilterType::Triangle);
    let crop_name = doc.frames[index]
        .crop_name
        .clone()
        .unwrap_or_else(|| format!("{}{:05}.jpg", CROP_PREFIX, index + 1));
    let crop_bytes = crops::encode_jpeg(&preview)?;
    let crop_path = storage.crop_path(session_id, &crop_name);
    if let Some(parent) = crop_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(AnnotationError::storage)?;
    }
    tokio::fs::write(&crop_path, &crop_bytes)
        .await
        .map_err(AnnotationError::storage)?;

    let keypoints = PosePoints {
        head: box_center(&validated.head),
        left_hand: box_center(&validated.left),
        right_hand: box_center(&validated.right),
    };
    let relative_pose = PosePoints {
        head: relative_to_head(keypoints.head, &validated.head)?,
        left_hand: relative_to_head(keypoints.left_hand, &validated.head)?,
        right_hand: relative_to_head(keypoints.right_hand, &validated.head)?,
    };

    let frame = &mut doc.frames[index];
    frame.labeled = true;
    frame.label = Some(validated.label);
    frame.hand_label = validated.hand_label;
    frame.head_box = Some(validated.head);
    frame.left_hand_box = Some(validated.left);
    frame.right_hand_box = Some(validated.right);
    frame.keypoints = Some(keypoints);
    frame.relative_pose = Some(relative_pose);
    frame.crop_name = Some(crop_name.clone());

    storage
        .write_session(&doc)
        .await
        .map_err(AnnotationError::storage)?;

    println!(
        "[labels] Pose label saved for {}/{}",
        session_id, frame_name
    );
    Ok(PoseLabelOutcome { crop_name })
}

pub struct DetectionOutcome {
    pub valid_count: usize,
    pub saved: bool,
    pub message: Option<String>,
}

/// Normalize one raw detection, or drop it when any value is non-finite or
/// any of box_size/image_width/image_height is non-positive.
fn normalize_detection(payload: &DetectionPayload) -> Option<Detection> {
    let raw = [
        payload.x,
        payload.y,
        payload.box_size,
        payload.image_width,
        payload.image_height,
    ];
    if raw.iter().any(|v| !v.is_finite()) {
        return None;
    }
    if payload.box_size <= 0.0 || payload.image_width <= 0.0 || payload.image_height <= 0.0 {
        return None;
    }
    Some(Detection {
        x: payload.x,
        y: payload.y,
        box_size: payload.box_size,
        image_width: payload.image_width,
        image_height: payload.image_height,
        x_center: payload.x / payload.image_width,
        y_center: payload.y / payload.image_height,
        width: payload.box_size / payload.image_width,
        height: payload.box_size / payload.image_height,
    })
}

/// Replace a frame's detection list with the valid subset of `detections`.
/// Invalid detections are dropped and counted, never fatal. The frame is
/// marked save-worthy only when `saved` was requested and at least one
/// detection survived. Unseen frame names register lazily.
pub async fn set_detections(
    storage: &Storage,
    session_id: &str,
    frame_name: &str,
    detections: &[DetectionPayload],
    saved: bool,
) -> Result<DetectionOutcome, AnnotationError> {
    let lock = storage.session_lock(session_id);
    let _guard = lock.lock().await;

    let mut doc = storage
        .read_session(session_id)
        .await
        .map_err(AnnotationError::storage)?
        .ok_or(AnnotationError::SessionNotFound)?;

    let survivors: Vec<Detection> = detections.iter().filter_map(normalize_detection).collect();
    let skipped = detections.len() - survivors.len();
    let saved_flag = saved && !survivors.is_empty();

    let index = match doc.frame_index(frame_name) {
        Some(index) => index,
        None => {
            doc.frames.push(FrameRecord::new(frame_name));
            doc.frames.len() - 1
        }
    };
    let valid_count = survivors.len();
    let frame = &mut doc.frames[index];
    frame.detections = Some(survivors);
    frame.detection_saved = Some(saved_flag);

    storage
        .write_session(&doc)
        .await
        .map_err(AnnotationError::storage)?;

    let message = if valid_count == 0 && saved {
        Some("no valid detections, frame not marked for export".to_string())
    } else if skipped > 0 {
        Some(format!("{} invalid detections ignored", skipped))
    } else {
        None
    };

    Ok(DetectionOutcome {
        valid_count,
        saved: saved_flag,
        message,
    })
}

/// Labeling progress for a session.
pub async fn get_summary(
    storage: &Storage,
    session_id: &str,
) -> Result<LabelSummary, AnnotationError> {
    let doc = storage
        .read_session(session_id)
        .await
        .map_err(AnnotationError::storage)?
        .ok_or(AnnotationError::SessionNotFound)?;
    let labeled_frames = doc.frames.iter().filter(|f| f.labeled).count();
    Ok(LabelSummary {
        total_frames: doc.frames.len(),
        labeled_frames,
        detail: doc.frames,
    })
}

/// Strip every label field from every frame and delete the crop previews
/// and export archives. Frame files and the frame list itself survive.
pub async fn reset_labels(storage: &Storage, session_id: &str) -> Result<(), AnnotationError> {
    let lock = storage.session_lock(session_id);
    let _guard = lock.lock().await;

    let mut doc = storage
        .read_session(session_id)
        .await
        .map_err(AnnotationError::storage)?
        .ok_or(AnnotationError::SessionNotFound)?;
    for frame in &mut doc.frames {
        frame.clear_labels();
    }
    storage
        .remove_label_artifacts(session_id)
        .await
        .map_err(AnnotationError::storage)?;
    storage
        .write_session(&doc)
        .await
        .map_err(AnnotationError::storage)?;

    println!("[labels] Labels reset for {}", session_id);
    Ok(())
}

/// Record the extractor's frame list in the session document, in extraction
/// order. Records whose names survive keep their labels.
pub async fn register_frames(
    storage: &Storage,
    session_id: &str,
    fps: u32,
    frames: &[String],
) -> Result<(), AnnotationError> {
    let lock = storage.session_lock(session_id);
    let _guard = lock.lock().await;

    let mut doc = storage
        .read_session(session_id)
        .await
        .map_err(AnnotationError::storage)?
        .unwrap_or_else(|| SessionDocument::new(session_id, fps));
    let mut existing: HashMap<String, FrameRecord> = doc
        .frames
        .drain(..)
        .map(|f| (f.frame_name.clone(), f))
        .collect();
    doc.frames = frames
        .iter()
        .map(|name| {
            existing
                .remove(name)
                .unwrap_or_else(|| FrameRecord::new(name.clone()))
        })
        .collect();
    doc.fps = fps;
    storage
        .write_session(&doc)
        .await
        .map_err(AnnotationError::storage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbImage};

    async fn storage_with_session(fps: u32, frames: &[&str]) -> (Storage, String) {
        let root = std::env::temp_dir().join(format!("vidlabel_labels_{}", rand::random::<u64>()));
        let storage = Storage::new(root);
        let session_id = "test_session".to_string();
        let mut doc = SessionDocument::new(&session_id, fps);
        doc.frames = frames.iter().map(|name| FrameRecord::new(*name)).collect();
        storage.write_session(&doc).await.unwrap();
        (storage, session_id)
    }

    fn payload(x: f64, y: f64, width: f64, height: f64) -> BoxPayload {
        BoxPayload {
            x,
            y,
            width,
            height,
        }
    }

    fn submission(label: i64) -> PoseSubmission {
        PoseSubmission {
            head_box: payload(10.0, 10.0, 20.0, 20.0),
            left_hand_box: payload(0.0, 30.0, 10.0, 10.0),
            right_hand_box: payload(40.0, 30.0, 10.0, 10.0),
            label,
            hand_label: Some(2),
        }
    }

    #[test]
    fn label_out_of_range_is_rejected_first() {
        let mut sub = submission(6);
        sub.head_box = payload(0.0, 0.0, -5.0, 1.0);
        match sub.validate() {
            Err(AnnotationError::InvalidLabel(_)) => {}
            other => panic!("expected InvalidLabel, got {:?}", other.err()),
        }
    }

    #[test]
    fn zero_size_box_is_rejected() {
        let mut sub = submission(3);
        sub.left_hand_box = payload(0.0, 0.0, 0.4, 10.0);
        match sub.validate() {
            Err(AnnotationError::InvalidBox(msg)) => assert!(msg.contains("left_hand_box")),
            other => panic!("expected InvalidBox, got {:?}", other.err()),
        }
    }

    #[test]
    fn relative_pose_is_clamped_and_rounded() {
        let head = BoundingBox {
            x: 0,
            y: 0,
            width: 3,
            height: 3,
        };
        // Point far left of the head box clamps to 0; inside divides exactly.
        let clamped = relative_to_head(Point { x: -50.0, y: 1.0 }, &head).unwrap();
        assert_eq!(clamped.x, 0.0);
        assert_eq!(clamped.y, 0.333333);
        let above = relative_to_head(Point { x: 9.0, y: 2.0 }, &head).unwrap();
        assert_eq!(above.x, 1.0);
        assert_eq!(above.y, 0.666667);
    }

    #[test]
    fn detection_normalization_matches_dimensions() {
        let det = normalize_detection(&DetectionPayload {
            x: 100.0,
            y: 50.0,
            box_size: 20.0,
            image_width: 200.0,
            image_height: 100.0,
        })
        .unwrap();
        assert_eq!(det.x_center, 0.5);
        assert_eq!(det.y_center, 0.5);
        assert_eq!(det.width, 0.1);
        assert_eq!(det.height, 0.2);
    }

    #[test]
    fn malformed_detections_are_dropped() {
        assert!(
            normalize_detection(&DetectionPayload {
                x: f64::NAN,
                y: 1.0,
                box_size: 5.0,
                image_width: 100.0,
                image_height: 100.0,
            })
            .is_none()
        );
        assert!(
            normalize_detection(&DetectionPayload {
                x: 1.0,
                y: 1.0,
                box_size: 0.0,
                image_width: 100.0,
                image_height: 100.0,
            })
            .is_none()
        );
        assert!(
            normalize_detection(&DetectionPayload {
                x: 1.0,
                y: 1.0,
                box_size: 5.0,
                image_width: -10.0,
                image_height: 100.0,
            })
            .is_none()
        );
    }

    #[tokio::test]
    async fn set_detections_is_idempotent_and_guards_the_saved_flag() {
        let (storage, sid) = storage_with_session(5, &["frame_00001.jpg"]).await;
        let detections = vec![
            DetectionPayload {
                x: 100.0,
                y: 50.0,
                box_size: 20.0,
                image_width: 200.0,
                image_height: 100.0,
            },
            DetectionPayload {
                x: 1.0,
                y: 1.0,
                box_size: -3.0,
                image_width: 200.0,
                image_height: 100.0,
            },
        ];

        let first = set_detections(&storage, &sid, "frame_00001.jpg", &detections, true)
            .await
            .unwrap();
        assert_eq!(first.valid_count, 1);
        assert!(first.saved);
        assert_eq!(first.message.as_deref(), Some("1 invalid detections ignored"));

        let second = set_detections(&storage, &sid, "frame_00001.jpg", &detections, true)
            .await
            .unwrap();
        assert_eq!(second.valid_count, 1);
        assert!(second.saved);

        let doc = storage.read_session(&sid).await.unwrap().unwrap();
        let frame = doc.frame("frame_00001.jpg").unwrap();
        assert_eq!(frame.detections.as_ref().unwrap().len(), 1);
        assert_eq!(frame.detection_saved, Some(true));

        // A save request with zero valid detections never marks the frame.
        let none = set_detections(&storage, &sid, "frame_00001.jpg", &detections[1..], true)
            .await
            .unwrap();
        assert_eq!(none.valid_count, 0);
        assert!(!none.saved);
        assert_eq!(
            none.message.as_deref(),
            Some("no valid detections, frame not marked for export")
        );
        let doc = storage.read_session(&sid).await.unwrap().unwrap();
        assert_eq!(
            doc.frame("frame_00001.jpg").unwrap().detection_saved,
            Some(false)
        );

        storage.remove_session(&sid).await.unwrap();
    }

    #[tokio::test]
    async fn detections_register_unseen_frames() {
        let (storage, sid) = storage_with_session(5, &[]).await;
        let outcome = set_detections(
            &storage,
            &sid,
            "frame_00009.jpg",
            &[DetectionPayload {
                x: 10.0,
                y: 10.0,
                box_size: 4.0,
                image_width: 100.0,
                image_height: 100.0,
            }],
            false,
        )
        .await
        .unwrap();
        assert_eq!(outcome.valid_count, 1);
        assert!(!outcome.saved);

        let doc = storage.read_session(&sid).await.unwrap().unwrap();
        assert!(doc.frame("frame_00009.jpg").is_some());
        storage.remove_session(&sid).await.unwrap();
    }

    #[tokio::test]
    async fn pose_label_derives_geometry_and_writes_a_preview() {
        let (storage, sid) = storage_with_session(5, &["frame_00001.jpg"]).await;
        let frame_path = storage.frame_path(&sid, "frame_00001.jpg");
        tokio::fs::create_dir_all(frame_path.parent().unwrap())
            .await
            .unwrap();
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 48, image::Rgb([90, 90, 90])));
        let encoded = crops::encode_jpeg(&img).unwrap();
        tokio::fs::write(&frame_path, &encoded).await.unwrap();

        let outcome = set_pose_label(&storage, &sid, "frame_00001.jpg", &submission(4))
            .await
            .unwrap();
        assert_eq!(outcome.crop_name, "head_00001.jpg");
        assert!(
            tokio::fs::try_exists(storage.crop_path(&sid, &outcome.crop_name))
                .await
                .unwrap()
        );

        let doc = storage.read_session(&sid).await.unwrap().unwrap();
        let frame = doc.frame("frame_00001.jpg").unwrap();
        assert!(frame.labeled);
        assert_eq!(frame.label, Some(4));
        assert_eq!(frame.hand_label, Some(2));
        let keypoints = frame.keypoints.unwrap();
        assert_eq!(keypoints.head, Point { x: 20.0, y: 20.0 });
        let relative = frame.relative_pose.unwrap();
        assert_eq!(relative.head, Point { x: 0.5, y: 0.5 });
        // Left hand center (5, 35) relative to head box at (10,10) 20x20:
        // x clamps to 0, y = 25/20 clamps to 1.
        assert_eq!(relative.left_hand, Point { x: 0.0, y: 1.0 });

        storage.remove_session(&sid).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_frame_fails_pose_labeling() {
        let (storage, sid) = storage_with_session(5, &["frame_00001.jpg"]).await;
        let result = set_pose_label(&storage, &sid, "frame_00042.jpg", &submission(1)).await;
        assert!(matches!(result, Err(AnnotationError::FrameNotFound)));
        storage.remove_session(&sid).await.unwrap();
    }

    #[tokio::test]
    async fn reset_clears_labels_and_artifacts_but_keeps_frames() {
        let (storage, sid) = storage_with_session(5, &["frame_00001.jpg", "frame_00002.jpg"]).await;
        {
            let mut doc = storage.read_session(&sid).await.unwrap().unwrap();
            for frame in &mut doc.frames {
                frame.labeled = true;
                frame.label = Some(1);
            }
            storage.write_session(&doc).await.unwrap();
        }
        tokio::fs::create_dir_all(storage.crops_dir(&sid))
            .await
            .unwrap();
        tokio::fs::write(storage.export_path(&sid), b"zip")
            .await
            .unwrap();
        tokio::fs::write(storage.det_export_path(&sid), b"zip")
            .await
            .unwrap();

        reset_labels(&storage, &sid).await.unwrap();

        let doc = storage.read_session(&sid).await.unwrap().unwrap();
        assert_eq!(doc.frames.len(), 2);
        assert!(doc.frames.iter().all(|f| !f.labeled && f.label.is_none()));
        assert!(!tokio::fs::try_exists(storage.crops_dir(&sid)).await.unwrap());
        assert!(!tokio::fs::try_exists(storage.export_path(&sid)).await.unwrap());
        assert!(
            !tokio::fs::try_exists(storage.det_export_path(&sid))
                .await
                .unwrap()
        );

        storage.remove_session(&sid).await.unwrap();
    }

    #[tokio::test]
    async fn register_frames_keeps_existing_labels() {
        let (storage, sid) = storage_with_session(5, &["frame_00001.jpg"]).await;
        {
            let mut doc = storage.read_session(&sid).await.unwrap().unwrap();
            doc.frames[0].labeled = true;
            doc.frames[0].label = Some(5);
            storage.write_session(&doc).await.unwrap();
        }
        register_frames(
            &storage,
            &sid,
            5,
            &["frame_00001.jpg".to_string(), "frame_00002.jpg".to_string()],
        )
        .await
        .unwrap();

        let doc = storage.read_session(&sid).await.unwrap().unwrap();
        assert_eq!(doc.frames.len(), 2);
        assert_eq!(doc.frames[0].label, Some(5));
        assert!(!doc.frames[1].labeled);
        storage.remove_session(&sid).await.unwrap();
    }
}
