use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Opaque token for a capture started by a `CaptureDevice`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureHandle {
    pub id: u64,
    pub path: PathBuf,
}

/// A capture that is currently running
#[derive(Debug)]
pub struct CapturedSession {
    pub handle: CaptureHandle,
    pub started_at: DateTime<Utc>,
}

impl CapturedSession {
    pub fn new(handle: CaptureHandle) -> Self {
        Self {
            handle,
            started_at: Utc::now(),
        }
    }
}

/// A finished recording waiting to be uploaded
///
/// The file lives in a temporary location and is removed when the recording
/// is dropped, unless it is explicitly kept.
#[derive(Debug)]
pub struct CompletedRecording {
    pub file: NamedTempFile,
    pub name: String,
    pub mime_type: String,
}

impl CompletedRecording {
    pub fn new(file: NamedTempFile, mime_type: impl Into<String>) -> Self {
        let name = file
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "recording".to_string());

        Self {
            file,
            name,
            mime_type: mime_type.into(),
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Drop the recording, optionally leaving the file on disk
    pub fn discard(self, keep: bool) {
        if keep {
            match self.file.keep() {
                Ok((_, path)) => tracing::info!("Kept recording at {:?}", path),
                Err(e) => tracing::warn!("Failed to keep recording {}: {}", self.name, e.error),
            }
        }
    }
}
