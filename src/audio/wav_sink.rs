use super::format::AudioFormat;
use super::sink::AudioSink;
use anyhow::{Context, Result};
use async_trait::async_trait;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::path::Path;
use tokio::sync::{mpsc, oneshot};

/// Content type sent alongside uploaded WAV recordings
pub const WAV_MIME_TYPE: &str = "audio/wav";

enum WavCommand {
    WriteChunk(Vec<f32>),
    Finalize { reply: oneshot::Sender<Result<()>> },
}

/// WAV encoder running its file I/O on a dedicated thread
///
/// Chunks are handed to the writer thread over a channel so the recorder never
/// blocks on disk while audio keeps arriving. A write error is reported back
/// on `finalize`.
pub struct WavSink {
    tx: mpsc::UnboundedSender<WavCommand>,
}

impl WavSink {
    pub fn create(path: &Path, format: AudioFormat) -> Result<Self> {
        let spec = WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: AudioFormat::BITS_PER_SAMPLE,
            sample_format: SampleFormat::Int,
        };

        let mut writer = WavWriter::create(path, spec)
            .with_context(|| format!("Failed to create WAV writer at {:?}", path))?;

        let (tx, mut rx) = mpsc::unbounded_channel();

        std::thread::spawn(move || {
            let mut write_error: Option<hound::Error> = None;

            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    WavCommand::WriteChunk(samples) => {
                        if write_error.is_some() {
                            continue;
                        }
                        for sample in samples {
                            let amplitude = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                            if let Err(e) = writer.write_sample(amplitude) {
                                tracing::error!("Failed to write WAV sample: {}", e);
                                write_error = Some(e);
                                break;
                            }
                        }
                    }
                    WavCommand::Finalize { reply } => {
                        let result = match write_error.take() {
                            Some(e) => Err(anyhow::anyhow!("WAV write failed: {}", e)),
                            None => writer
                                .finalize()
                                .map_err(|e| anyhow::anyhow!("Failed to finalize WAV: {}", e)),
                        };
                        let _ = reply.send(result);
                        return;
                    }
                }
            }
        });

        Ok(Self { tx })
    }
}

#[async_trait]
impl AudioSink for WavSink {
    fn write_chunk(&mut self, samples: Vec<f32>) -> Result<()> {
        self.tx
            .send(WavCommand::WriteChunk(samples))
            .map_err(|e| anyhow::anyhow!("Failed to send write command: {}", e))
    }

    async fn finalize(&mut self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WavCommand::Finalize { reply })
            .map_err(|e| anyhow::anyhow!("Failed to send finalize command: {}", e))?;

        rx.await
            .map_err(|e| anyhow::anyhow!("Failed to receive finalize response: {}", e))?
    }
}
