//! In-memory collaborators for exercising the controller without a
//! microphone or a server

use super::device::CaptureDevice;
use crate::error::{CaptureError, NetworkError};
use crate::recording::{CaptureHandle, CompletedRecording};
use crate::remote::RemoteEndpoint;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

pub fn recording_named(prefix: &str) -> CompletedRecording {
    let file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".wav")
        .tempfile()
        .expect("temp recording");
    CompletedRecording::new(file, "audio/wav")
}

#[derive(Default)]
pub struct FakeDevice {
    begins: AtomicUsize,
    ends: AtomicUsize,
    next_id: AtomicU64,
    fail_begin: AtomicBool,
    fail_end: AtomicBool,
    lose_capture: AtomicBool,
    delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn ends(&self) -> usize {
        self.ends.load(Ordering::SeqCst)
    }

    pub fn fail_begin(&self, fail: bool) {
        self.fail_begin.store(fail, Ordering::SeqCst);
    }

    pub fn fail_end(&self, fail: bool) {
        self.fail_end.store(fail, Ordering::SeqCst);
    }

    /// Make `end` report that the device no longer knows the handle
    pub fn lose_capture(&self, lose: bool) {
        self.lose_capture.store(lose, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CaptureDevice for FakeDevice {
    async fn begin(&self) -> Result<CaptureHandle, CaptureError> {
        self.enter().await;
        self.begins.fetch_add(1, Ordering::SeqCst);
        let result = if self.fail_begin.load(Ordering::SeqCst) {
            Err(CaptureError::Start("microphone permission denied".to_string()))
        } else {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(CaptureHandle {
                id,
                path: std::env::temp_dir().join(format!("fake_{}.wav", id)),
            })
        };
        self.leave();
        result
    }

    async fn end(&self, handle: &CaptureHandle) -> Result<CompletedRecording, CaptureError> {
        self.enter().await;
        self.ends.fetch_add(1, Ordering::SeqCst);
        let result = if self.lose_capture.load(Ordering::SeqCst) {
            Err(CaptureError::UnknownHandle(handle.id))
        } else if self.fail_end.load(Ordering::SeqCst) {
            Err(CaptureError::Finalize("disk full".to_string()))
        } else {
            Ok(recording_named(&format!("audio_{}_", handle.id)))
        };
        self.leave();
        result
    }
}

#[derive(Default)]
pub struct FakeRemote {
    desired: Mutex<VecDeque<Result<bool, NetworkError>>>,
    fallback: Mutex<Option<bool>>,
    fetches: AtomicUsize,
    submitted: Mutex<Vec<String>>,
    submit_attempts: AtomicUsize,
    fail_uploads: AtomicBool,
    upload_delay: Mutex<Option<Duration>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next answers to `fetch_desired_state`
    pub fn push_desired(&self, answer: Result<bool, NetworkError>) {
        self.desired.lock().unwrap().push_back(answer);
    }

    /// Answer returned once the queue is empty; a malformed response if unset
    pub fn set_fallback(&self, desired: Option<bool>) {
        *self.fallback.lock().unwrap() = desired;
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn submit_attempts(&self) -> usize {
        self.submit_attempts.load(Ordering::SeqCst)
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn set_upload_delay(&self, delay: Duration) {
        *self.upload_delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl RemoteEndpoint for FakeRemote {
    async fn fetch_desired_state(&self) -> Result<bool, NetworkError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let queued = self.desired.lock().unwrap().pop_front();
        match queued {
            Some(answer) => answer,
            None => match *self.fallback.lock().unwrap() {
                Some(desired) => Ok(desired),
                None => Err(NetworkError::Malformed("no answer queued".to_string())),
            },
        }
    }

    async fn submit(&self, recording: &CompletedRecording) -> Result<(), NetworkError> {
        self.submit_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.upload_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(NetworkError::Status(
                reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            ));
        }

        self.submitted.lock().unwrap().push(recording.name.clone());
        Ok(())
    }
}
