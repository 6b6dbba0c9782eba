use super::device::CaptureDevice;
use crate::audio::capture::ActiveStream;
use crate::audio::wav_sink::WAV_MIME_TYPE;
use crate::audio::{AudioCapture, AudioFormat, AudioSink, WavSink};
use crate::error::CaptureError;
use crate::messages::RecorderCommand;
use crate::recording::{CaptureHandle, CompletedRecording};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::sync::{mpsc, oneshot};

const CHUNK_CHANNEL_CAPACITY: usize = 100;

/// Where the recorder gets its input stream and its encoder from
#[async_trait(?Send)]
pub trait CaptureBackend: 'static {
    type Stream: 'static;

    fn open_sink(&self, path: &Path, format: AudioFormat) -> anyhow::Result<Box<dyn AudioSink>>;

    /// Start delivering chunks on `chunk_tx`
    fn start_stream(
        &self,
        format: AudioFormat,
        chunk_tx: mpsc::Sender<Vec<f32>>,
    ) -> Result<Self::Stream, CaptureError>;

    /// Stop the stream once every captured sample has been sent
    async fn stop_stream(&self, stream: Self::Stream);
}

/// Default input device through cpal, WAV files through hound
pub struct CpalBackend;

#[async_trait(?Send)]
impl CaptureBackend for CpalBackend {
    type Stream = ActiveStream;

    fn open_sink(&self, path: &Path, format: AudioFormat) -> anyhow::Result<Box<dyn AudioSink>> {
        Ok(Box::new(WavSink::create(path, format)?))
    }

    fn start_stream(
        &self,
        format: AudioFormat,
        chunk_tx: mpsc::Sender<Vec<f32>>,
    ) -> Result<ActiveStream, CaptureError> {
        AudioCapture::start(format, chunk_tx)
    }

    async fn stop_stream(&self, stream: ActiveStream) {
        stream.stop().await;
    }
}

struct ActiveCapture<S> {
    handle: CaptureHandle,
    stream: S,
    sink: Box<dyn AudioSink>,
    file: NamedTempFile,
    writing: bool,
}

/// Owns the microphone stream and the file being recorded
///
/// This service:
/// - Starts and stops AudioCapture on request
/// - Receives audio chunks via channel
/// - Streams chunks to a WavSink while a capture is active
/// - Hands the finished file back on End
///
/// Note: This service holds cpal::Stream which is !Send, so it must be spawned
/// on a LocalSet using tokio::task::spawn_local.
pub struct Recorder<B: CaptureBackend = CpalBackend> {
    backend: B,
    format: AudioFormat,
    recordings_dir: PathBuf,
    cmd_rx: mpsc::Receiver<RecorderCommand>,
    audio_rx: mpsc::Receiver<Vec<f32>>,
    audio_tx: mpsc::Sender<Vec<f32>>,
    active: Option<ActiveCapture<B::Stream>>,
    next_id: u64,
}

impl Recorder<CpalBackend> {
    pub fn new(
        format: AudioFormat,
        recordings_dir: PathBuf,
        cmd_rx: mpsc::Receiver<RecorderCommand>,
    ) -> Self {
        Self::with_backend(CpalBackend, format, recordings_dir, cmd_rx)
    }
}

impl<B: CaptureBackend> Recorder<B> {
    pub fn with_backend(
        backend: B,
        format: AudioFormat,
        recordings_dir: PathBuf,
        cmd_rx: mpsc::Receiver<RecorderCommand>,
    ) -> Self {
        let (audio_tx, audio_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        Self {
            backend,
            format,
            recordings_dir,
            cmd_rx,
            audio_rx,
            audio_tx,
            active: None,
            next_id: 0,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },

                Some(chunk) = self.audio_rx.recv(), if self.is_writing() => {
                    self.write_chunk(chunk);
                }
            }
        }

        tracing::debug!("Recorder command channel closed, exiting");
    }

    fn is_writing(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.writing)
    }

    fn write_chunk(&mut self, chunk: Vec<f32>) {
        if let Some(active) = self.active.as_mut() {
            if let Err(e) = active.sink.write_chunk(chunk) {
                tracing::error!("Failed to write audio chunk: {}", e);
                active.writing = false;
            }
        }
    }

    async fn handle_command(&mut self, cmd: RecorderCommand) {
        match cmd {
            RecorderCommand::Begin(reply) => {
                let result = self.begin();
                let _ = reply.send(result);
            }
            RecorderCommand::End { handle, reply } => {
                let result = self.end(handle).await;
                let _ = reply.send(result);
            }
        }
    }

    fn begin(&mut self) -> Result<CaptureHandle, CaptureError> {
        if let Some(active) = &self.active {
            return Err(CaptureError::Busy(active.handle.id));
        }

        let capture = self.open_capture(self.next_id + 1)?;
        self.next_id = capture.handle.id;

        let handle = capture.handle.clone();
        tracing::info!("Recording {} started: {:?}", handle.id, handle.path);
        self.active = Some(capture);

        Ok(handle)
    }

    /// Create a fresh file and start the stream feeding it
    fn open_capture(&self, id: u64) -> Result<ActiveCapture<B::Stream>, CaptureError> {
        std::fs::create_dir_all(&self.recordings_dir)?;

        let prefix = format!("audio_{}_", chrono::Utc::now().timestamp_millis());
        let file = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".wav")
            .tempfile_in(&self.recordings_dir)?;

        let sink = self
            .backend
            .open_sink(file.path(), self.format)
            .map_err(|e| CaptureError::Start(format!("{:#}", e)))?;

        let stream = self
            .backend
            .start_stream(self.format, self.audio_tx.clone())?;

        Ok(ActiveCapture {
            handle: CaptureHandle {
                id,
                path: file.path().to_path_buf(),
            },
            stream,
            sink,
            file,
            writing: true,
        })
    }

    async fn end(&mut self, handle: CaptureHandle) -> Result<CompletedRecording, CaptureError> {
        // Matched by id: a capture restarted after a failed finalize keeps its
        // id but writes to a new file
        let ActiveCapture {
            handle: active_handle,
            stream,
            mut sink,
            file,
            mut writing,
        } = match self.active.take() {
            Some(active) if active.handle.id == handle.id => active,
            other => {
                self.active = other;
                return Err(CaptureError::UnknownHandle(handle.id));
            }
        };

        // Keep draining while the stream stops so the tail of the recording
        // never waits on a full channel
        {
            let stopping = self.backend.stop_stream(stream);
            tokio::pin!(stopping);

            loop {
                tokio::select! {
                    _ = &mut stopping => break,
                    Some(chunk) = self.audio_rx.recv() => {
                        if writing {
                            if let Err(e) = sink.write_chunk(chunk) {
                                tracing::error!("Failed to write audio chunk during drain: {}", e);
                                writing = false;
                            }
                        }
                    }
                }
            }
        }

        while let Ok(chunk) = self.audio_rx.try_recv() {
            if !writing {
                continue;
            }
            if let Err(e) = sink.write_chunk(chunk) {
                tracing::error!("Failed to write audio chunk during drain: {}", e);
                writing = false;
            }
        }

        // Fresh channel for the next capture
        let (audio_tx, audio_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        self.audio_tx = audio_tx;
        self.audio_rx = audio_rx;

        if let Err(e) = sink.finalize().await {
            let reason = format!("{:#}", e);
            tracing::error!(
                "Recording {} could not be finalized, discarding {:?}: {}",
                active_handle.id,
                active_handle.path,
                reason
            );
            drop(sink);
            drop(file);

            // Capture resumes under the same handle so a later end can still
            // hand back a recording
            match self.open_capture(active_handle.id) {
                Ok(capture) => {
                    tracing::warn!(
                        "Recording {} restarted: {:?}",
                        capture.handle.id,
                        capture.handle.path
                    );
                    self.active = Some(capture);
                }
                Err(e) => {
                    tracing::error!("Recording {} could not be restarted: {}", active_handle.id, e);
                }
            }

            return Err(CaptureError::Finalize(reason));
        }

        tracing::info!("Recording {} stopped", active_handle.id);
        Ok(CompletedRecording::new(file, WAV_MIME_TYPE))
    }
}

/// Handle for communicating with the Recorder
#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::Sender<RecorderCommand>,
}

impl RecorderHandle {
    pub fn new(tx: mpsc::Sender<RecorderCommand>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl CaptureDevice for RecorderHandle {
    async fn begin(&self) -> Result<CaptureHandle, CaptureError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RecorderCommand::Begin(reply))
            .await
            .map_err(|_| CaptureError::RecorderGone)?;

        rx.await.map_err(|_| CaptureError::RecorderGone)?
    }

    async fn end(&self, handle: &CaptureHandle) -> Result<CompletedRecording, CaptureError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RecorderCommand::End {
                handle: handle.clone(),
                reply,
            })
            .await
            .map_err(|_| CaptureError::RecorderGone)?;

        rx.await.map_err(|_| CaptureError::RecorderGone)?
    }
}
