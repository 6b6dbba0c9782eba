use crate::messages::StatusReport;
use crate::recording::CompletedRecording;
use crate::remote::RemoteEndpoint;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;

/// Fire-and-forget uploads of finished recordings
///
/// Each recording gets its own task and exactly one attempt. The outcome is
/// only visible as a status report; nothing waits on it except shutdown.
pub struct UploadDispatcher<R> {
    remote: Arc<R>,
    status_tx: broadcast::Sender<StatusReport>,
    tracker: TaskTracker,
    keep_recordings: bool,
}

impl<R: RemoteEndpoint> UploadDispatcher<R> {
    pub fn new(
        remote: Arc<R>,
        status_tx: broadcast::Sender<StatusReport>,
        keep_recordings: bool,
    ) -> Self {
        Self {
            remote,
            status_tx,
            tracker: TaskTracker::new(),
            keep_recordings,
        }
    }

    pub fn dispatch(&self, recording: CompletedRecording) {
        let remote = self.remote.clone();
        let status_tx = self.status_tx.clone();
        let keep = self.keep_recordings;

        self.tracker.spawn(async move {
            let report = match remote.submit(&recording).await {
                Ok(()) => {
                    tracing::info!("Uploaded {}", recording.name);
                    StatusReport::uploaded(&recording.name)
                }
                Err(e) => {
                    tracing::warn!("Upload of {} failed: {}", recording.name, e);
                    StatusReport::upload_failed()
                }
            };

            let _ = status_tx.send(report);
            recording.discard(keep);
        });
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait up to `grace` for in-flight uploads; true when all finished
    pub async fn wait(&self, grace: Duration) -> bool {
        self.tracker.close();
        let finished = tokio::time::timeout(grace, self.tracker.wait())
            .await
            .is_ok();
        self.tracker.reopen();
        finished
    }
}
