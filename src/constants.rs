//! Application constants

/// Maximum upload size for session videos (5 GiB)
pub const MAX_VIDEO_UPLOAD_SIZE: usize = 5 * 1024 * 1024 * 1024;

/// File name the uploaded video is stored under inside its session dir
pub const RAW_VIDEO_NAME: &str = "raw.mp4";

/// Prefix for extracted frame files (`frame_00001.jpg`, ...)
pub const FRAME_PREFIX: &str = "frame_";

/// Prefix for head-crop preview files written at label time
pub const CROP_PREFIX: &str = "head_";

/// Suffix of the classification export archive, appended to the session id
pub const EXPORT_SUFFIX: &str = "_export.zip";

/// Suffix of the detection export archive, appended to the session id
pub const DET_EXPORT_SUFFIX: &str = "_det_export.zip";

/// Side length of the square head-crop preview
pub const CROP_SIZE: u32 = 128;

/// ffmpeg JPEG qscale for extracted frames (2 = highest quality)
pub const FRAME_JPEG_QSCALE: u8 = 2;

/// Inclusive range of classification label values
pub const LABEL_MIN: u8 = 1;
pub const LABEL_MAX: u8 = 5;

/// How often the status document is rewritten during extraction, in raw frames
pub const STATUS_WRITE_INTERVAL: u64 = 30;
