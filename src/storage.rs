//! Session storage: directory layout under the data root, JSON document
//! load/replace, and per-session write locks.
//!
//! Everything a session produces lives under four sibling trees:
//! `videos/{sid}/raw.mp4`, `frames/{sid}/` (stills + status document),
//! `crops/{sid}/` (label-time previews), and `labels/` (one label document
//! and up to two export archives per session).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::constants::{DET_EXPORT_SUFFIX, EXPORT_SUFFIX, FRAME_PREFIX, RAW_VIDEO_NAME};
use crate::models::{SessionDocument, StatusRecord};

type StorageError = Box<dyn std::error::Error + Send + Sync>;

pub struct Storage {
    root: PathBuf,
    // One async mutex per session id, handed to callers that read-modify-write
    // the session document. Last write wins at document granularity.
    session_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Storage {
            root,
            session_locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Storage rooted at `DATA_DIR` (default `./data`).
    pub fn from_env() -> Self {
        Storage::new(data_root())
    }

    // ============== Paths ==============

    pub fn videos_dir(&self, session_id: &str) -> PathBuf {
        self.root.join("videos").join(session_id)
    }

    pub fn frames_dir(&self, session_id: &str) -> PathBuf {
        self.root.join("frames").join(session_id)
    }

    pub fn crops_dir(&self, session_id: &str) -> PathBuf {
        self.root.join("crops").join(session_id)
    }

    pub fn labels_dir(&self) -> PathBuf {
        self.root.join("labels")
    }

    pub fn video_path(&self, session_id: &str) -> PathBuf {
        self.videos_dir(session_id).join(RAW_VIDEO_NAME)
    }

    pub fn frame_path(&self, session_id: &str, frame_name: &str) -> PathBuf {
        self.frames_dir(session_id).join(frame_name)
    }

    pub fn crop_path(&self, session_id: &str, crop_name: &str) -> PathBuf {
        self.crops_dir(session_id).join(crop_name)
    }

    pub fn status_path(&self, session_id: &str) -> PathBuf {
        self.frames_dir(session_id).join("status.json")
    }

    pub fn labels_path(&self, session_id: &str) -> PathBuf {
        self.labels_dir().join(format!("{}.json", session_id))
    }

    pub fn export_path(&self, session_id: &str) -> PathBuf {
        self.labels_dir()
            .join(format!("{}{}", session_id, EXPORT_SUFFIX))
    }

    pub fn det_export_path(&self, session_id: &str) -> PathBuf {
        self.labels_dir()
            .join(format!("{}{}", session_id, DET_EXPORT_SUFFIX))
    }

    // ============== Locks ==============

    /// The write lock for one session's label document. Hold it across every
    /// load-modify-replace so concurrent label requests cannot lose updates.
    pub fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().expect("session lock registry");
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn drop_session_lock(&self, session_id: &str) {
        let mut locks = self.session_locks.lock().expect("session lock registry");
        locks.remove(session_id);
    }

    // ============== Documents ==============

    /// Read a JSON document. `Ok(None)` means the document does not exist,
    /// which is a distinct outcome from an unreadable or malformed one.
    pub async fn read_json<T: DeserializeOwned>(
        &self,
        path: &Path,
    ) -> Result<Option<T>, StorageError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Replace a JSON document wholesale. Writes a sibling temp file and
    /// renames it over the target so readers never observe a partial write.
    pub async fn write_json<T: Serialize>(&self, path: &Path, doc: &T) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(doc)?;
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub async fn read_session(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionDocument>, StorageError> {
        self.read_json(&self.labels_path(session_id)).await
    }

    pub async fn write_session(&self, doc: &SessionDocument) -> Result<(), StorageError> {
        self.write_json(&self.labels_path(&doc.session_id), doc)
            .await
    }

    /// Read the status document, falling back to `pending` when it does not
    /// exist or cannot be parsed.
    pub async fn read_status(&self, session_id: &str) -> StatusRecord {
        match self
            .read_json::<StatusRecord>(&self.status_path(session_id))
            .await
        {
            Ok(Some(status)) => status,
            Ok(None) => StatusRecord::pending(),
            Err(e) => {
                eprintln!("[session] Unreadable status for {}: {}", session_id, e);
                StatusRecord::pending()
            }
        }
    }

    pub async fn write_status(
        &self,
        session_id: &str,
        status: &StatusRecord,
    ) -> Result<(), StorageError> {
        self.write_json(&self.status_path(session_id), status).await
    }

    // ============== Files ==============

    pub async fn ensure_session_dirs(&self, session_id: &str) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(self.videos_dir(session_id)).await?;
        tokio::fs::create_dir_all(self.frames_dir(session_id)).await?;
        tokio::fs::create_dir_all(self.crops_dir(session_id)).await?;
        tokio::fs::create_dir_all(self.labels_dir()).await?;
        Ok(())
    }

    /// Sorted names of the extracted frame files for a session. An absent
    /// frames dir lists as empty.
    pub async fn list_frames(&self, session_id: &str) -> Result<Vec<String>, StorageError> {
        let dir = self.frames_dir(session_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(FRAME_PREFIX) && name.ends_with(".jpg") {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete the crops dir and both export archives, used by label reset.
    pub async fn remove_label_artifacts(&self, session_id: &str) -> Result<(), StorageError> {
        remove_dir_if_present(&self.crops_dir(session_id)).await?;
        remove_file_if_present(&self.export_path(session_id)).await?;
        remove_file_if_present(&self.det_export_path(session_id)).await?;
        Ok(())
    }

    /// Remove every artifact of a session: the three per-session dirs, the
    /// label document, and both export archives.
    pub async fn remove_session(&self, session_id: &str) -> Result<(), StorageError> {
        remove_dir_if_present(&self.videos_dir(session_id)).await?;
        remove_dir_if_present(&self.frames_dir(session_id)).await?;
        remove_dir_if_present(&self.crops_dir(session_id)).await?;
        remove_file_if_present(&self.labels_path(session_id)).await?;
        remove_file_if_present(&self.export_path(session_id)).await?;
        remove_file_if_present(&self.det_export_path(session_id)).await?;
        self.drop_session_lock(session_id);
        Ok(())
    }
}

async fn remove_dir_if_present(dir: &Path) -> Result<(), std::io::Error> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

async fn remove_file_if_present(path: &Path) -> Result<(), std::io::Error> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn data_root() -> PathBuf {
    std::env::var("DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data"))
}
