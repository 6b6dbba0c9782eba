use thiserror::Error;

/// Device-level failure to start or stop a capture
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture {0} is already in progress")]
    Busy(u64),

    #[error("no input audio device available")]
    NoInputDevice,

    #[error("failed to start capture: {0}")]
    Start(String),

    #[error("recording file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to finalize recording: {0}")]
    Finalize(String),

    #[error("capture {0} is not active")]
    UnknownHandle(u64),

    #[error("recorder is not running")]
    RecorderGone,
}

/// Failure of either remote call: transport, non-success status or an
/// unreadable response body
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server responded with {0}")]
    Status(reqwest::StatusCode),

    #[error("malformed status response: {0}")]
    Malformed(String),

    #[error("failed to read recording: {0}")]
    Io(#[from] std::io::Error),
}
