use super::format::AudioFormat;
use crate::error::CaptureError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use ringbuf::{HeapRb, traits::*};
use std::sync::Arc;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Seconds of audio the ring buffer can hold before the bridge drains it
const RING_SECONDS: f32 = 60.0;

/// Seconds of audio per chunk handed to the recorder
const CHUNK_SECONDS: f32 = 0.5;

/// A running input stream and the task forwarding its samples
pub struct ActiveStream {
    stream: cpal::Stream,
    stop_tx: oneshot::Sender<()>,
    bridge: JoinHandle<()>,
}

impl ActiveStream {
    /// Stop the device and wait until every captured sample has been
    /// forwarded, including a final partial chunk
    pub async fn stop(self) {
        let ActiveStream {
            stream,
            stop_tx,
            bridge,
        } = self;

        drop(stream);
        let _ = stop_tx.send(());

        if let Err(e) = bridge.await {
            tracing::warn!("Capture bridge ended abnormally: {}", e);
        }
    }
}

pub struct AudioCapture;

impl AudioCapture {
    /// Open the default input device and start streaming
    ///
    /// Chunks arrive on `chunk_tx` until the returned stream is stopped or
    /// the receiver is dropped.
    pub fn start(
        format: AudioFormat,
        chunk_tx: mpsc::Sender<Vec<f32>>,
    ) -> Result<ActiveStream, CaptureError> {
        let ring = HeapRb::<f32>::new(format.samples_for_duration(RING_SECONDS));
        let (mut producer, consumer) = ring.split();

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(CaptureError::NoInputDevice)?;

        if let Ok(name) = device.name() {
            tracing::debug!("Using input device: {}", name);
        }

        let config = StreamConfig {
            channels: format.channels,
            sample_rate: SampleRate(format.sample_rate),
            buffer_size: BufferSize::Default,
        };

        let notify = Arc::new(Notify::new());
        let notify_callback = notify.clone();

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    producer.push_slice(data);
                    notify_callback.notify_one();
                },
                move |err| {
                    tracing::error!("Audio stream error: {}", err);
                },
                None,
            )
            .map_err(|e| CaptureError::Start(e.to_string()))?;

        stream
            .play()
            .map_err(|e| CaptureError::Start(e.to_string()))?;

        let chunk_size = format.samples_for_duration(CHUNK_SECONDS);
        let (stop_tx, stop_rx) = oneshot::channel();
        let bridge = tokio::task::spawn_local(Self::bridge_task(
            consumer, chunk_tx, chunk_size, notify, stop_rx,
        ));

        tracing::info!(
            "Audio capture started ({} Hz, {} ch)",
            format.sample_rate,
            format.channels
        );
        Ok(ActiveStream {
            stream,
            stop_tx,
            bridge,
        })
    }

    /// Move samples from the realtime ring buffer onto the tokio channel
    async fn bridge_task(
        mut consumer: impl Consumer<Item = f32>,
        tx: mpsc::Sender<Vec<f32>>,
        chunk_size: usize,
        notify: Arc<Notify>,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = notify.notified() => {
                    if !Self::forward_chunks(&mut consumer, &tx, chunk_size).await {
                        break;
                    }
                }
                _ = &mut stop_rx => {
                    // The device is stopped; whatever is left is the tail of
                    // the recording
                    if Self::forward_chunks(&mut consumer, &tx, chunk_size).await {
                        let rest = consumer.occupied_len();
                        if rest > 0 {
                            let mut chunk = vec![0.0f32; rest];
                            let n = consumer.pop_slice(&mut chunk);
                            chunk.truncate(n);
                            let _ = tx.send(chunk).await;
                        }
                    }
                    break;
                }
                _ = tx.closed() => {
                    tracing::debug!("Chunk receiver closed, stopping capture bridge");
                    break;
                }
            }
        }
    }

    /// Send every full chunk currently buffered; false once the receiver is gone
    async fn forward_chunks(
        consumer: &mut impl Consumer<Item = f32>,
        tx: &mpsc::Sender<Vec<f32>>,
        chunk_size: usize,
    ) -> bool {
        while consumer.occupied_len() >= chunk_size {
            let mut chunk = vec![0.0f32; chunk_size];
            let n = consumer.pop_slice(&mut chunk);
            chunk.truncate(n);

            if tx.send(chunk).await.is_err() {
                return false;
            }
        }
        true
    }
}
