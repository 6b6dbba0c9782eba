use anyhow::Result;
use async_trait::async_trait;

/// Streaming encoder for captured audio
///
/// Samples are written as they arrive instead of being buffered for the whole
/// recording; `finalize` flushes headers and closes the file.
#[async_trait]
pub trait AudioSink: Send {
    /// Write one chunk of interleaved samples
    fn write_chunk(&mut self, samples: Vec<f32>) -> Result<()>;

    /// Finalize and close the sink
    async fn finalize(&mut self) -> Result<()>;
}
