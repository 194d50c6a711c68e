//! Shared data models: the per-session documents and the label payloads.

use serde::{Deserialize, Serialize};

/// Box as submitted by the annotator. Numeric but not yet validated.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BoxPayload {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Validated box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

/// A 2D point, either in pixels (keypoints) or head-box units (relative pose).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// The three derived pose points, one per box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PosePoints {
    pub head: Point,
    pub left_hand: Point,
    pub right_hand: Point,
}

/// Raw detection as submitted by the annotator.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DetectionPayload {
    pub x: f64,
    pub y: f64,
    pub box_size: f64,
    pub image_width: f64,
    pub image_height: f64,
}

/// A stored detection: the raw values plus YOLO-style normalized coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x: f64,
    pub y: f64,
    pub box_size: f64,
    pub image_width: f64,
    pub image_height: f64,
    pub x_center: f64,
    pub y_center: f64,
    pub width: f64,
    pub height: f64,
}

/// Per-extracted-frame label state. Pose fields and detection fields are
/// independent label kinds on the same frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameRecord {
    pub frame_name: String,
    pub labeled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hand_label: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_box: Option<BoundingBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left_hand_box: Option<BoundingBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right_hand_box: Option<BoundingBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keypoints: Option<PosePoints>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative_pose: Option<PosePoints>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crop_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detections: Option<Vec<Detection>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection_saved: Option<bool>,
}

impl FrameRecord {
    pub fn new(frame_name: impl Into<String>) -> Self {
        FrameRecord {
            frame_name: frame_name.into(),
            labeled: false,
            label: None,
            hand_label: None,
            head_box: None,
            left_hand_box: None,
            right_hand_box: None,
            keypoints: None,
            relative_pose: None,
            crop_name: None,
            detections: None,
            detection_saved: None,
        }
    }

    /// Strip every label field, pose and detection alike, keeping only the
    /// frame name.
    pub fn clear_labels(&mut self) {
        *self = FrameRecord::new(std::mem::take(&mut self.frame_name));
    }
}

/// The per-session label document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDocument {
    pub session_id: String,
    pub fps: u32,
    #[serde(default)]
    pub frames: Vec<FrameRecord>,
}

impl SessionDocument {
    pub fn new(session_id: impl Into<String>, fps: u32) -> Self {
        SessionDocument {
            session_id: session_id.into(),
            fps,
            frames: Vec::new(),
        }
    }

    pub fn frame(&self, name: &str) -> Option<&FrameRecord> {
        self.frames.iter().find(|f| f.frame_name == name)
    }

    pub fn frame_mut(&mut self, name: &str) -> Option<&mut FrameRecord> {
        self.frames.iter_mut().find(|f| f.frame_name == name)
    }

    pub fn frame_index(&self, name: &str) -> Option<usize> {
        self.frames.iter().position(|f| f.frame_name == name)
    }
}

/// Extraction lifecycle states. Monotonic within one run:
/// pending -> (queued)? -> processing -> done | error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionState {
    Pending,
    Queued,
    Processing,
    Done,
    Error,
}

/// The per-session status document polled by clients during extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: ExtractionState,
    pub total_frames: u64,
    pub processed_frames: u64,
    #[serde(default)]
    pub message: String,
}

impl StatusRecord {
    /// Fallback for sessions whose status document does not exist yet.
    pub fn pending() -> Self {
        StatusRecord {
            status: ExtractionState::Pending,
            total_frames: 0,
            processed_frames: 0,
            message: String::new(),
        }
    }
}

/// Labeling progress summary returned to the UI.
#[derive(Debug, Clone, Serialize)]
pub struct LabelSummary {
    pub total_frames: usize,
    pub labeled_frames: usize,
    pub detail: Vec<FrameRecord>,
}
