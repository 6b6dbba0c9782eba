use crate::error::CaptureError;
use crate::recording::{CaptureHandle, CompletedRecording};
use async_trait::async_trait;

/// Something that can turn start/stop commands into a recording on disk
#[async_trait]
pub trait CaptureDevice: Send + Sync + 'static {
    async fn begin(&self) -> Result<CaptureHandle, CaptureError>;

    async fn end(&self, handle: &CaptureHandle) -> Result<CompletedRecording, CaptureError>;
}
