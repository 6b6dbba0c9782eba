use crate::error::CaptureError;
use crate::recording::{CaptureHandle, CompletedRecording};
use std::fmt;
use tokio::sync::oneshot;

/// Commands for the Recorder service
pub enum RecorderCommand {
    Begin(oneshot::Sender<Result<CaptureHandle, CaptureError>>),
    End {
        handle: CaptureHandle,
        reply: oneshot::Sender<Result<CompletedRecording, CaptureError>>,
    },
}

/// Commands issued by the operator console
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    Start,
    Stop,
    Status,
    Quit,
}

/// Whether audio capture is currently active
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CaptureState {
    #[default]
    Idle,
    Recording,
}

impl CaptureState {
    /// The state the remote flag asks for
    pub fn desired(recording: bool) -> Self {
        if recording {
            CaptureState::Recording
        } else {
            CaptureState::Idle
        }
    }
}

/// One-way status notification for whoever is watching the agent
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusReport {
    pub text: String,
}

impl StatusReport {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn recording() -> Self {
        Self::new("Recording")
    }

    pub fn stopped() -> Self {
        Self::new("Stopped")
    }

    pub fn capture_failed(err: &CaptureError) -> Self {
        Self::new(format!("Error: {}", err))
    }

    pub fn uploaded(name: &str) -> Self {
        Self::new(format!("Uploaded: {}", name))
    }

    pub fn upload_failed() -> Self {
        Self::new("Upload failed")
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
