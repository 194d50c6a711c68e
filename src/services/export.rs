//! Export packagers: classification crops plus per-type manifests, and a
//! YOLO-style detection dataset. Each export streams into one zip archive
//! per session and is rebuilt from scratch on every run.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::models::{BoundingBox, Detection};
use crate::services::crops;
use crate::services::error::AnnotationError;
use crate::storage::Storage;

fn archive_options() -> SimpleFileOptions {
    // Fixed timestamp keeps re-exports reproducible.
    SimpleFileOptions::default().last_modified_time(zip::DateTime::default())
}

/// Package head crops and hand composites of every fully pose-labeled frame,
/// with one `[file_name, label]` manifest array per type. Frames missing a
/// required field or an unreadable source image are skipped, and each type
/// keeps its own gapless 1-based numbering.
pub async fn export_classification(
    storage: &Storage,
    session_id: &str,
) -> Result<PathBuf, AnnotationError> {
    let doc = storage
        .read_session(session_id)
        .await
        .map_err(AnnotationError::storage)?
        .ok_or(AnnotationError::SessionNotFound)?;

    let archive_path = storage.export_path(session_id);
    if let Some(parent) = archive_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(AnnotationError::storage)?;
    }
    let file = File::create(&archive_path).map_err(AnnotationError::storage)?;
    let mut archive = ZipWriter::new(file);
    let options = archive_options();

    let mut head_manifest: Vec<(String, u8)> = Vec::new();
    let mut hand_manifest: Vec<(String, u8)> = Vec::new();

    for frame in &doc.frames {
        if !frame.labeled {
            continue;
        }
        let (Some(head_box), Some(label)) = (frame.head_box, frame.label) else {
            continue;
        };
        let frame_bytes =
            match tokio::fs::read(storage.frame_path(session_id, &frame.frame_name)).await {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
        let img = match crops::decode(&frame_bytes) {
            Ok(img) => img,
            Err(e) => {
                eprintln!(
                    "[export] Skipping undecodable frame {}: {}",
                    frame.frame_name, e
                );
                continue;
            }
        };

        let Some(head_bytes) = single_crop(&img, &head_box) else {
            continue;
        };
        let head_name = format!("head_{:05}.jpg", head_manifest.len() + 1);
        archive
            .start_file(format!("head/{}", head_name), options)
            .map_err(AnnotationError::storage)?;
        archive
            .write_all(&head_bytes)
            .map_err(AnnotationError::storage)?;
        head_manifest.push((head_name, label));

        if let (Some(left), Some(right), Some(hand_label)) =
            (frame.left_hand_box, frame.right_hand_box, frame.hand_label)
        {
            if let Some(hand_bytes) = hand_composite(&img, &left, &right) {
                let hand_name = format!("hand_{:05}.jpg", hand_manifest.len() + 1);
                archive
                    .start_file(format!("hand/{}", hand_name), options)
                    .map_err(AnnotationError::storage)?;
                archive
                    .write_all(&hand_bytes)
                    .map_err(AnnotationError::storage)?;
                hand_manifest.push((hand_name, hand_label));
            }
        }
    }

    for (name, manifest) in [
        ("head/labels.json", &head_manifest),
        ("hand/labels.json", &hand_manifest),
    ] {
        archive
            .start_file(name, options)
            .map_err(AnnotationError::storage)?;
        let bytes = serde_json::to_vec(manifest).map_err(AnnotationError::storage)?;
        archive
            .write_all(&bytes)
            .map_err(AnnotationError::storage)?;
    }
    archive.finish().map_err(AnnotationError::storage)?;

    println!(
        "[export] Classification dataset for {}: {} head, {} hand crops",
        session_id,
        head_manifest.len(),
        hand_manifest.len()
    );
    Ok(archive_path)
}

fn single_crop(img: &image::DynamicImage, bbox: &BoundingBox) -> Option<Vec<u8>> {
    let fitted = crops::fit_box(bbox, img.width(), img.height()).ok()?;
    crops::encode_jpeg(&crops::crop(img, &fitted)).ok()
}

fn hand_composite(
    img: &image::DynamicImage,
    left: &BoundingBox,
    right: &BoundingBox,
) -> Option<Vec<u8>> {
    let left_fit = crops::fit_box(left, img.width(), img.height()).ok()?;
    let right_fit = crops::fit_box(right, img.width(), img.height()).ok()?;
    let composite =
        crops::compose_side_by_side(&crops::crop(img, &left_fit), &crops::crop(img, &right_fit));
    crops::encode_jpeg(&composite).ok()
}

/// One YOLO label line per detection, class 0, 6 decimal places.
fn detection_lines(detections: &[Detection]) -> String {
    let mut out = String::new();
    for det in detections {
        out.push_str(&format!(
            "0 {:.6} {:.6} {:.6} {:.6}\n",
            det.x_center, det.y_center, det.width, det.height
        ));
    }
    out
}

/// Package every frame marked `detection_saved` as a YOLO-style dataset:
/// the frame file copied verbatim under `images/`, its label lines under
/// `labels/`. Label files are written even when empty.
pub async fn export_detections(
    storage: &Storage,
    session_id: &str,
) -> Result<PathBuf, AnnotationError> {
    let doc = storage
        .read_session(session_id)
        .await
        .map_err(AnnotationError::storage)?
        .ok_or(AnnotationError::SessionNotFound)?;

    let archive_path = storage.det_export_path(session_id);
    if let Some(parent) = archive_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(AnnotationError::storage)?;
    }
    let file = File::create(&archive_path).map_err(AnnotationError::storage)?;
    let mut archive = ZipWriter::new(file);
    let options = archive_options();

    let mut included = 0usize;
    for frame in &doc.frames {
        if frame.detection_saved != Some(true) {
            continue;
        }
        let frame_bytes =
            match tokio::fs::read(storage.frame_path(session_id, &frame.frame_name)).await {
                Ok(bytes) => bytes,
                Err(_) => {
                    eprintln!(
                        "[export] Missing frame file {}, skipped",
                        frame.frame_name
                    );
                    continue;
                }
            };
        archive
            .start_file(format!("images/{}", frame.frame_name), options)
            .map_err(AnnotationError::storage)?;
        archive
            .write_all(&frame_bytes)
            .map_err(AnnotationError::storage)?;

        let stem = frame
            .frame_name
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(&frame.frame_name);
        let lines = detection_lines(frame.detections.as_deref().unwrap_or(&[]));
        archive
            .start_file(format!("labels/{}.txt", stem), options)
            .map_err(AnnotationError::storage)?;
        archive
            .write_all(lines.as_bytes())
            .map_err(AnnotationError::storage)?;
        included += 1;
    }
    archive.finish().map_err(AnnotationError::storage)?;

    println!(
        "[export] Detection dataset for {}: {} frames",
        session_id, included
    );
    Ok(archive_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FrameRecord, SessionDocument};
    use image::{DynamicImage, RgbImage};
    use std::io::Read;

    fn det(x: f64, y: f64, size: f64, w: f64, h: f64) -> Detection {
        Detection {
            x,
            y,
            box_size: size,
            image_width: w,
            image_height: h,
            x_center: x / w,
            y_center: y / h,
            width: size / w,
            height: size / h,
        }
    }

    #[test]
    fn label_lines_use_six_decimals() {
        let lines = detection_lines(&[det(100.0, 50.0, 20.0, 200.0, 100.0)]);
        assert_eq!(lines, "0 0.500000 0.500000 0.100000 0.200000\n");
        assert_eq!(detection_lines(&[]), "");
    }

    fn bbox(x: i64, y: i64, width: i64, height: i64) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width,
            height,
        }
    }

    async fn scratch_session(frames: Vec<FrameRecord>) -> (Storage, String) {
        let root = std::env::temp_dir().join(format!("vidlabel_export_{}", rand::random::<u64>()));
        let storage = Storage::new(root);
        let sid = "export_session".to_string();
        let mut doc = SessionDocument::new(&sid, 5);
        doc.frames = frames;
        storage.write_session(&doc).await.unwrap();
        (storage, sid)
    }

    async fn write_test_frame(storage: &Storage, sid: &str, name: &str) {
        let path = storage.frame_path(sid, name);
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 48, image::Rgb([50, 60, 70])));
        tokio::fs::write(&path, crops::encode_jpeg(&img).unwrap())
            .await
            .unwrap();
    }

    fn archive_names(path: &std::path::Path) -> Vec<String> {
        let archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        archive.file_names().map(String::from).collect()
    }

    fn archive_entry(path: &std::path::Path, name: &str) -> Vec<u8> {
        let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut entry = archive.by_name(name).unwrap();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).unwrap();
        bytes
    }

    fn pose_frame(name: &str, label: u8, with_hands: bool) -> FrameRecord {
        let mut frame = FrameRecord::new(name);
        frame.labeled = true;
        frame.label = Some(label);
        frame.head_box = Some(bbox(4, 4, 16, 16));
        if with_hands {
            frame.hand_label = Some(2);
            frame.left_hand_box = Some(bbox(0, 20, 10, 10));
            frame.right_hand_box = Some(bbox(30, 20, 10, 10));
        }
        frame
    }

    #[tokio::test]
    async fn classification_export_numbers_each_type_independently() {
        let frames = vec![
            pose_frame("frame_00001.jpg", 1, true),
            // Head-only frame: contributes to head numbering, not hand.
            pose_frame("frame_00002.jpg", 3, false),
            // Unlabeled frame: contributes to neither.
            FrameRecord::new("frame_00003.jpg"),
            pose_frame("frame_00004.jpg", 5, true),
        ];
        let (storage, sid) = scratch_session(frames).await;
        for name in ["frame_00001.jpg", "frame_00002.jpg", "frame_00004.jpg"] {
            write_test_frame(&storage, &sid, name).await;
        }

        let path = export_classification(&storage, &sid).await.unwrap();
        let mut names = archive_names(&path);
        names.sort();
        assert_eq!(
            names,
            vec![
                "hand/hand_00001.jpg",
                "hand/hand_00002.jpg",
                "hand/labels.json",
                "head/head_00001.jpg",
                "head/head_00002.jpg",
                "head/head_00003.jpg",
                "head/labels.json",
            ]
        );

        let head_manifest: Vec<(String, u8)> =
            serde_json::from_slice(&archive_entry(&path, "head/labels.json")).unwrap();
        assert_eq!(
            head_manifest,
            vec![
                ("head_00001.jpg".to_string(), 1),
                ("head_00002.jpg".to_string(), 3),
                ("head_00003.jpg".to_string(), 5),
            ]
        );
        let hand_manifest: Vec<(String, u8)> =
            serde_json::from_slice(&archive_entry(&path, "hand/labels.json")).unwrap();
        assert_eq!(
            hand_manifest,
            vec![
                ("hand_00001.jpg".to_string(), 2),
                ("hand_00002.jpg".to_string(), 2),
            ]
        );

        // Re-running with unchanged state reproduces the manifests exactly.
        let manifest_before = archive_entry(&path, "head/labels.json");
        let path = export_classification(&storage, &sid).await.unwrap();
        assert_eq!(archive_entry(&path, "head/labels.json"), manifest_before);

        storage.remove_session(&sid).await.unwrap();
    }

    #[tokio::test]
    async fn detection_export_includes_only_saved_frames() {
        let mut saved = FrameRecord::new("frame_00001.jpg");
        saved.detections = Some(vec![det(100.0, 50.0, 20.0, 200.0, 100.0)]);
        saved.detection_saved = Some(true);
        let mut unsaved = FrameRecord::new("frame_00002.jpg");
        unsaved.detections = Some(vec![det(10.0, 10.0, 5.0, 200.0, 100.0)]);
        unsaved.detection_saved = Some(false);

        let (storage, sid) = scratch_session(vec![saved, unsaved]).await;
        write_test_frame(&storage, &sid, "frame_00001.jpg").await;
        write_test_frame(&storage, &sid, "frame_00002.jpg").await;

        let path = export_detections(&storage, &sid).await.unwrap();
        let mut names = archive_names(&path);
        names.sort();
        assert_eq!(names, vec!["images/frame_00001.jpg", "labels/frame_00001.txt"]);
        assert_eq!(
            archive_entry(&path, "labels/frame_00001.txt"),
            b"0 0.500000 0.500000 0.100000 0.200000\n"
        );

        storage.remove_session(&sid).await.unwrap();
    }

    #[tokio::test]
    async fn exports_fail_for_unknown_sessions() {
        let root = std::env::temp_dir().join(format!("vidlabel_export_{}", rand::random::<u64>()));
        let storage = Storage::new(root);
        assert!(matches!(
            export_classification(&storage, "ghost").await,
            Err(AnnotationError::SessionNotFound)
        ));
        assert!(matches!(
            export_detections(&storage, "ghost").await,
            Err(AnnotationError::SessionNotFound)
        ));
    }
}
