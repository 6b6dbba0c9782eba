use super::device::CaptureDevice;
use super::poller::Poller;
use super::uploader::UploadDispatcher;
use crate::error::CaptureError;
use crate::messages::{CaptureState, StatusReport};
use crate::recording::CapturedSession;
use crate::remote::RemoteEndpoint;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const STATUS_CHANNEL_CAPACITY: usize = 32;

/// Capture state plus the session that only exists while recording
enum Slot {
    Idle,
    Recording(CapturedSession),
}

impl Slot {
    fn state(&self) -> CaptureState {
        match self {
            Slot::Idle => CaptureState::Idle,
            Slot::Recording(_) => CaptureState::Recording,
        }
    }
}

/// Reconciles local capture with what the operator and the remote ask for
///
/// Manual commands and poll results both go through `transition`, which holds
/// the slot lock for the whole device call, so two transitions never
/// interleave. Finished recordings are handed to the upload dispatcher and
/// never awaited here.
pub struct Controller<D, R> {
    device: Arc<D>,
    remote: Arc<R>,
    slot: Mutex<Slot>,
    uploads: UploadDispatcher<R>,
    status_tx: broadcast::Sender<StatusReport>,
    poll_interval: Duration,
    started: AtomicBool,
    shutdown: CancellationToken,
    poll_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<D: CaptureDevice, R: RemoteEndpoint> Controller<D, R> {
    pub fn new(
        device: Arc<D>,
        remote: Arc<R>,
        poll_interval: Duration,
        keep_recordings: bool,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let uploads = UploadDispatcher::new(remote.clone(), status_tx.clone(), keep_recordings);

        Self {
            device,
            remote,
            slot: Mutex::new(Slot::Idle),
            uploads,
            status_tx,
            poll_interval,
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            poll_task: std::sync::Mutex::new(None),
        }
    }

    /// Receive every status report issued from now on
    pub fn subscribe(&self) -> broadcast::Receiver<StatusReport> {
        self.status_tx.subscribe()
    }

    pub async fn state(&self) -> CaptureState {
        self.slot.lock().await.state()
    }

    /// Spawn the poll loop; returns false if it is already running
    pub fn start(self: &Arc<Self>) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::debug!("Poll loop already running, ignoring start");
            return false;
        }

        let poller = Poller::new(self.clone(), self.remote.clone(), self.poll_interval);
        let task = tokio::spawn(poller.run(self.shutdown.clone()));

        *self
            .poll_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
        true
    }

    pub async fn manual_start(&self) {
        tracing::info!("Manual start requested");
        self.transition(CaptureState::Recording).await;
    }

    pub async fn manual_stop(&self) {
        tracing::info!("Manual stop requested");
        self.transition(CaptureState::Idle).await;
    }

    /// Move capture towards `target`, at most one device call per invocation
    pub async fn transition(&self, target: CaptureState) {
        let mut slot = self.slot.lock().await;

        if slot.state() == target {
            tracing::debug!("Already {:?}, nothing to do", target);
            return;
        }

        match &*slot {
            Slot::Idle => match self.device.begin().await {
                Ok(handle) => {
                    tracing::info!("Capture {} started", handle.id);
                    *slot = Slot::Recording(CapturedSession::new(handle));
                    self.report(StatusReport::recording());
                }
                Err(e) => {
                    tracing::error!("Failed to start capture: {}", e);
                    self.report(StatusReport::capture_failed(&e));
                }
            },
            Slot::Recording(session) => {
                let started_at = session.started_at;
                let handle_id = session.handle.id;

                match self.device.end(&session.handle).await {
                    Ok(recording) => {
                        *slot = Slot::Idle;
                        tracing::info!(
                            "Capture {} stopped after {}s: {}",
                            handle_id,
                            (Utc::now() - started_at).num_seconds(),
                            recording.name
                        );
                        self.report(StatusReport::stopped());
                        self.uploads.dispatch(recording);
                    }
                    Err(e @ CaptureError::UnknownHandle(_)) => {
                        // The device no longer has this capture; nothing left to stop
                        *slot = Slot::Idle;
                        tracing::error!("Capture {} was lost: {}", handle_id, e);
                        self.report(StatusReport::capture_failed(&e));
                    }
                    Err(e) => {
                        // The device is presumed still capturing; keep the session
                        tracing::error!("Failed to stop capture {}: {}", handle_id, e);
                        self.report(StatusReport::capture_failed(&e));
                    }
                }
            }
        }
    }

    /// Stop polling, finish an active capture and give pending uploads
    /// `grace` to complete
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();

        let task = self
            .poll_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("Poll loop ended abnormally: {}", e);
            }
        }

        self.transition(CaptureState::Idle).await;

        let pending = self.uploads.in_flight();
        if pending > 0 {
            tracing::info!("Waiting up to {:?} for {} upload(s)", grace, pending);
        }
        if !self.uploads.wait(grace).await {
            tracing::warn!("Uploads still in flight after {:?}, abandoning them", grace);
        }
    }

    fn report(&self, report: StatusReport) {
        // No subscribers is fine; reports are fire-and-forget
        let _ = self.status_tx.send(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkError;
    use crate::services::testing::{FakeDevice, FakeRemote};

    fn controller(
        device: &Arc<FakeDevice>,
        remote: &Arc<FakeRemote>,
    ) -> Arc<Controller<FakeDevice, FakeRemote>> {
        Arc::new(Controller::new(
            device.clone(),
            remote.clone(),
            Duration::from_secs(30),
            false,
        ))
    }

    fn drain(rx: &mut broadcast::Receiver<StatusReport>) -> Vec<String> {
        let mut seen = Vec::new();
        while let Ok(report) = rx.try_recv() {
            seen.push(report.text);
        }
        seen
    }

    #[tokio::test]
    async fn test_starts_idle() {
        let device = Arc::new(FakeDevice::new());
        let remote = Arc::new(FakeRemote::new());
        let controller = controller(&device, &remote);

        assert_eq!(controller.state().await, CaptureState::Idle);
    }

    #[tokio::test]
    async fn test_manual_stop_while_idle_is_silent_noop() {
        let device = Arc::new(FakeDevice::new());
        let remote = Arc::new(FakeRemote::new());
        let controller = controller(&device, &remote);
        let mut status = controller.subscribe();

        controller.manual_stop().await;

        assert_eq!(controller.state().await, CaptureState::Idle);
        assert_eq!(device.ends(), 0);
        assert!(drain(&mut status).is_empty());
    }

    #[tokio::test]
    async fn test_repeated_start_begins_once() {
        let device = Arc::new(FakeDevice::new());
        let remote = Arc::new(FakeRemote::new());
        let controller = controller(&device, &remote);
        let mut status = controller.subscribe();

        controller.manual_start().await;
        controller.transition(CaptureState::Recording).await;

        assert_eq!(controller.state().await, CaptureState::Recording);
        assert_eq!(device.begins(), 1);
        assert_eq!(drain(&mut status), vec!["Recording"]);
    }

    #[tokio::test]
    async fn test_stop_dispatches_one_upload() {
        let device = Arc::new(FakeDevice::new());
        let remote = Arc::new(FakeRemote::new());
        let controller = controller(&device, &remote);
        let mut status = controller.subscribe();

        controller.manual_start().await;
        controller.manual_stop().await;
        assert_eq!(controller.state().await, CaptureState::Idle);

        assert!(controller.uploads.wait(Duration::from_secs(5)).await);
        assert_eq!(device.ends(), 1);
        assert_eq!(remote.submit_attempts(), 1);

        let submitted = remote.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(
            drain(&mut status),
            vec![
                "Recording".to_string(),
                "Stopped".to_string(),
                format!("Uploaded: {}", submitted[0]),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_upload_reports_and_stays_idle() {
        let device = Arc::new(FakeDevice::new());
        let remote = Arc::new(FakeRemote::new());
        remote.fail_uploads(true);
        let controller = controller(&device, &remote);
        let mut status = controller.subscribe();

        controller.manual_start().await;
        controller.manual_stop().await;
        assert!(controller.uploads.wait(Duration::from_secs(5)).await);

        assert_eq!(controller.state().await, CaptureState::Idle);
        assert_eq!(remote.submit_attempts(), 1);
        assert_eq!(
            drain(&mut status),
            vec!["Recording", "Stopped", "Upload failed"]
        );
    }

    #[tokio::test]
    async fn test_begin_failure_leaves_idle_and_can_retry() {
        let device = Arc::new(FakeDevice::new());
        let remote = Arc::new(FakeRemote::new());
        let controller = controller(&device, &remote);
        let mut status = controller.subscribe();

        device.fail_begin(true);
        controller.manual_start().await;
        assert_eq!(controller.state().await, CaptureState::Idle);
        assert_eq!(
            drain(&mut status),
            vec!["Error: failed to start capture: microphone permission denied"]
        );

        device.fail_begin(false);
        controller.manual_start().await;
        assert_eq!(controller.state().await, CaptureState::Recording);
        assert_eq!(device.begins(), 2);
    }

    #[tokio::test]
    async fn test_end_failure_keeps_recording_session() {
        let device = Arc::new(FakeDevice::new());
        let remote = Arc::new(FakeRemote::new());
        let controller = controller(&device, &remote);

        controller.manual_start().await;
        device.fail_end(true);
        controller.manual_stop().await;

        assert_eq!(controller.state().await, CaptureState::Recording);
        assert_eq!(remote.submit_attempts(), 0);

        // The kept session can still be stopped later
        device.fail_end(false);
        controller.manual_stop().await;
        assert_eq!(controller.state().await, CaptureState::Idle);
        assert_eq!(device.ends(), 2);
        assert!(controller.uploads.wait(Duration::from_secs(5)).await);
        assert_eq!(remote.submit_attempts(), 1);
    }

    #[tokio::test]
    async fn test_lost_capture_returns_to_idle() {
        let device = Arc::new(FakeDevice::new());
        let remote = Arc::new(FakeRemote::new());
        let controller = controller(&device, &remote);
        let mut status = controller.subscribe();

        controller.manual_start().await;
        device.lose_capture(true);
        controller.manual_stop().await;

        assert_eq!(controller.state().await, CaptureState::Idle);
        assert_eq!(remote.submit_attempts(), 0);
        assert_eq!(
            drain(&mut status),
            vec!["Recording", "Error: capture 1 is not active"]
        );

        device.lose_capture(false);
        controller.manual_start().await;
        assert_eq!(controller.state().await, CaptureState::Recording);
        assert_eq!(device.begins(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_transitions_never_overlap() {
        let device = Arc::new(FakeDevice::new());
        device.set_delay(Duration::from_millis(5));
        let remote = Arc::new(FakeRemote::new());
        let controller = controller(&device, &remote);

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let controller = controller.clone();
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        controller.manual_start().await;
                    } else {
                        controller.transition(CaptureState::Idle).await;
                    }
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            result.unwrap();
        }

        assert_eq!(device.max_in_flight(), 1);
        // Every stop that ran had a matching start before it
        assert!(device.begins() >= device.ends());
        assert!(device.begins() - device.ends() <= 1);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let device = Arc::new(FakeDevice::new());
        let remote = Arc::new(FakeRemote::new());
        remote.set_fallback(Some(false));
        let controller = controller(&device, &remote);

        assert!(controller.start());
        assert!(!controller.start());

        controller.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_start_survives_poisoned_task_slot() {
        let device = Arc::new(FakeDevice::new());
        let remote = Arc::new(FakeRemote::new());
        remote.set_fallback(Some(false));
        let controller = controller(&device, &remote);

        let holder = controller.clone();
        let _ = std::thread::spawn(move || {
            let _guard = holder.poll_task.lock().unwrap();
            panic!("panicked while holding the poll task slot");
        })
        .join();
        assert!(controller.poll_task.is_poisoned());

        assert!(controller.start());
        assert!(
            controller
                .poll_task
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some()
        );

        controller.shutdown(Duration::from_secs(1)).await;
        assert!(
            controller
                .poll_task
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_capture_and_waits_for_upload() {
        let device = Arc::new(FakeDevice::new());
        let remote = Arc::new(FakeRemote::new());
        remote.push_desired(Err(NetworkError::Malformed("offline".to_string())));
        let controller = controller(&device, &remote);
        let mut status = controller.subscribe();

        controller.start();
        controller.manual_start().await;
        controller.shutdown(Duration::from_secs(5)).await;

        assert_eq!(controller.state().await, CaptureState::Idle);
        assert_eq!(remote.submit_attempts(), 1);
        let seen = drain(&mut status);
        assert_eq!(seen[..2], ["Recording", "Stopped"]);
        assert!(seen[2].starts_with("Uploaded: "));
    }
}
