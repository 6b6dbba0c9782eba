use super::controller::Controller;
use super::device::CaptureDevice;
use crate::error::NetworkError;
use crate::messages::CaptureState;
use crate::remote::RemoteEndpoint;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Fixed-cadence reconciliation against the remote desired state
///
/// No backoff and no jitter: a failed fetch is logged and the next poll
/// happens exactly one interval later.
pub struct Poller<D, R> {
    controller: Arc<Controller<D, R>>,
    remote: Arc<R>,
    interval: Duration,
}

impl<D: CaptureDevice, R: RemoteEndpoint> Poller<D, R> {
    pub fn new(controller: Arc<Controller<D, R>>, remote: Arc<R>, interval: Duration) -> Self {
        Self {
            controller,
            remote,
            interval,
        }
    }

    /// Apply one fetch result; a failed fetch leaves capture untouched
    pub async fn reconcile(
        &self,
        fetched: Result<bool, NetworkError>,
    ) -> Result<CaptureState, NetworkError> {
        let target = CaptureState::desired(fetched?);
        self.controller.transition(target).await;
        Ok(target)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!("Polling remote every {:?}", self.interval);

        loop {
            // Only the fetch is raced against shutdown; a transition that has
            // reached the device always runs to completion
            let fetched = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.remote.fetch_desired_state() => result,
            };

            if let Err(e) = self.reconcile(fetched).await {
                tracing::warn!("Skipping poll: {}", e);
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        tracing::info!("Poll loop stopped");
    }
}
