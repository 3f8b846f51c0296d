//! Status polling after dispatch.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use docflow_core::DocumentId;
use docflow_documents::DocumentStatus;

use super::result::RecoveryError;
use crate::store::DocumentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// A status that ends monitoring was observed.
    Terminal(DocumentStatus),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorReport {
    pub outcome: MonitorOutcome,
    pub last_status: Option<DocumentStatus>,
    pub polls: u32,
    pub elapsed: Duration,
}

/// Polls one document until it reaches a terminal status, the timeout
/// elapses, or the cancellation token fires.
///
/// Sleeps are `tokio::time` sleeps, never clipped past the deadline, so the
/// watch ends within `timeout` plus one store round-trip.
#[derive(Debug, Clone)]
pub struct StatusMonitor<S> {
    store: S,
    poll_interval: Duration,
    timeout: Duration,
}

impl<S> StatusMonitor<S>
where
    S: DocumentStore,
{
    pub fn new(store: S, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            store,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            timeout,
        }
    }

    pub async fn watch(
        &self,
        id: DocumentId,
        cancel: &CancellationToken,
    ) -> Result<MonitorReport, RecoveryError> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut polls = 0;
        let mut last_status = None;

        loop {
            if cancel.is_cancelled() {
                return Ok(self.report(MonitorOutcome::Cancelled, last_status, polls, started));
            }

            polls += 1;
            match self.store.get(id).await {
                Ok(Some(doc)) => {
                    if last_status != Some(doc.status) {
                        debug!(document_id = %id, status = %doc.status, poll = polls, "status observed");
                    }
                    last_status = Some(doc.status);
                    if doc.status.ends_monitoring() {
                        return Ok(self.report(
                            MonitorOutcome::Terminal(doc.status),
                            last_status,
                            polls,
                            started,
                        ));
                    }
                }
                Ok(None) => return Err(RecoveryError::NotFound(id)),
                // Keep polling; the store decorator already retried.
                Err(e) => warn!(document_id = %id, error = %e, "status poll failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(self.report(MonitorOutcome::TimedOut, last_status, polls, started));
            }
            let sleep_for = self.poll_interval.min(deadline - now);

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(self.report(MonitorOutcome::Cancelled, last_status, polls, started));
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    fn report(
        &self,
        outcome: MonitorOutcome,
        last_status: Option<DocumentStatus>,
        polls: u32,
        started: Instant,
    ) -> MonitorReport {
        MonitorReport {
            outcome,
            last_status,
            polls,
            elapsed: started.elapsed(),
        }
    }
}
