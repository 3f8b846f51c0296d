//! Recovery coordinator: analyze → reset → dispatch → monitor.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use docflow_core::DocumentId;
use docflow_documents::{
    Document, DocumentStatus, InvalidTransition, LeaseToken, LifecycleEvent, RecoveryAttempt,
    RecoveryOutcome, RecoveryStep, StatusUpdate,
};

use super::monitor::{MonitorOutcome, StatusMonitor};
use super::result::{Diagnostics, RecoveryError, RecoveryResult};
use crate::audit::{AuditEvent, AuditSink, TracingAuditSink};
use crate::clock::{Clock, SystemClock};
use crate::config::CoordinatorConfig;
use crate::detector::StaleThresholds;
use crate::gateway::{Capability, GatewayError, ProcessingGateway};
use crate::retry::retry_with_backoff;
use crate::store::{CasCondition, DocumentStore, LeaseAcquisition, LeaseRequest, StoreError};

/// Drives a single document (or a batch) through recovery.
///
/// Only one run per document can make progress at a time: a lease is taken
/// before the reset and released on every exit path. All writes are
/// compare-and-swaps guarded by the expected prior status and the lease token.
pub struct RecoveryCoordinator<S, G> {
    store: Arc<S>,
    gateway: Arc<G>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    thresholds: StaleThresholds,
    config: CoordinatorConfig,
}

impl<S, G> Clone for RecoveryCoordinator<S, G> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            gateway: Arc::clone(&self.gateway),
            audit: Arc::clone(&self.audit),
            clock: Arc::clone(&self.clock),
            thresholds: self.thresholds.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S, G> std::fmt::Debug for RecoveryCoordinator<S, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryCoordinator")
            .field("store_type", &std::any::type_name::<S>())
            .field("gateway_type", &std::any::type_name::<G>())
            .field("thresholds", &self.thresholds)
            .field("config", &self.config)
            .finish()
    }
}

/// State carried through the leased part of a run.
struct Run<'a> {
    attempt: &'a mut RecoveryAttempt,
    token: LeaseToken,
    doc: Document,
}

/// How the leased phases ended.
struct Conclusion {
    outcome: RecoveryOutcome,
    final_status: Option<DocumentStatus>,
    error: Option<RecoveryError>,
}

impl Conclusion {
    fn failed(status: Option<DocumentStatus>, error: RecoveryError) -> Self {
        Self {
            outcome: RecoveryOutcome::Failure,
            final_status: status,
            error: Some(error),
        }
    }
}

impl<S, G> RecoveryCoordinator<S, G>
where
    S: DocumentStore + 'static,
    G: ProcessingGateway + 'static,
{
    pub fn new(store: Arc<S>, gateway: Arc<G>, config: CoordinatorConfig) -> Self {
        Self {
            store,
            gateway,
            audit: Arc::new(TracingAuditSink),
            clock: Arc::new(SystemClock),
            thresholds: StaleThresholds::default(),
            config,
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Thresholds used to decide whether a non-`ERROR` document is stuck.
    pub fn with_thresholds(mut self, thresholds: StaleThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn recover(&self, id: DocumentId) -> RecoveryResult {
        self.recover_with_cancel(id, &CancellationToken::new()).await
    }

    /// Recover one document. Cancelling `cancel` stops dispatch retries and
    /// monitoring; the lease is still released.
    pub async fn recover_with_cancel(
        &self,
        id: DocumentId,
        cancel: &CancellationToken,
    ) -> RecoveryResult {
        let mut attempt = RecoveryAttempt::start(id, self.clock.now());
        self.audit.record(AuditEvent::RecoveryStarted {
            attempt_id: attempt.id,
            document_id: id,
            at: attempt.started_at,
        });

        let (diagnostics, conclusion) = self.run(&mut attempt, cancel).await;
        self.finish(attempt, diagnostics, conclusion)
    }

    /// Recover several documents with at most `max_concurrency` in flight.
    ///
    /// Duplicate ids are collapsed; results follow first-occurrence order.
    pub async fn recover_batch(
        &self,
        ids: &[DocumentId],
        max_concurrency: usize,
    ) -> Vec<RecoveryResult> {
        self.recover_batch_with_cancel(ids, max_concurrency, &CancellationToken::new())
            .await
    }

    pub async fn recover_batch_with_cancel(
        &self,
        ids: &[DocumentId],
        max_concurrency: usize,
        cancel: &CancellationToken,
    ) -> Vec<RecoveryResult> {
        let mut seen = HashSet::new();
        let unique: Vec<DocumentId> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();

        let permits = Arc::new(Semaphore::new(max_concurrency.max(1)));
        let mut handles = Vec::with_capacity(unique.len());
        for id in &unique {
            let id = *id;
            let this = self.clone();
            let permits = Arc::clone(&permits);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return RecoveryResult::aborted(
                        id,
                        RecoveryError::TaskFailed {
                            document_id: id,
                            reason: "concurrency limiter closed".to_string(),
                        },
                        this.clock.now(),
                    );
                };
                this.recover_with_cancel(id, &cancel).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (id, handle) in unique.into_iter().zip(handles) {
            match handle.await {
                Ok(result) => results.push(result),
                Err(join_err) => {
                    warn!(document_id = %id, error = %join_err, "recovery task failed");
                    results.push(RecoveryResult::aborted(
                        id,
                        RecoveryError::TaskFailed {
                            document_id: id,
                            reason: join_err.to_string(),
                        },
                        self.clock.now(),
                    ));
                }
            }
        }
        results
    }

    async fn run(
        &self,
        attempt: &mut RecoveryAttempt,
        cancel: &CancellationToken,
    ) -> (Option<Diagnostics>, Conclusion) {
        let id = attempt.document_id;
        if cancel.is_cancelled() {
            return (None, self.cancelled(None));
        }

        // Analyze
        let (doc, diagnostics) = match self.analyze(id).await {
            Ok(found) => found,
            Err((status, err)) => return (None, Conclusion::failed(status, err)),
        };
        let analyzed_status = doc.status;
        self.step(attempt, RecoveryStep::Analyze, Some(analyzed_status), None);

        // Lease
        let Ok(ttl) = chrono::Duration::from_std(self.config.lease_ttl()) else {
            let err = StoreError::InvalidRequest(format!(
                "lease TTL of {}s is out of range",
                self.config.lease_ttl_secs
            ));
            return (Some(diagnostics), Conclusion::failed(Some(analyzed_status), err.into()));
        };
        let token = LeaseToken::new();
        let request = LeaseRequest {
            token,
            holder: self.config.lease_holder.clone(),
            ttl,
        };
        match self.store.try_acquire_lease(id, &request).await {
            Ok(LeaseAcquisition::Acquired(lease)) => {
                attempt.lease_token = Some(token);
                self.audit.record(AuditEvent::LeaseAcquired {
                    attempt_id: attempt.id,
                    document_id: id,
                    token,
                    expires_at: lease.expires_at,
                });
            }
            Ok(LeaseAcquisition::Conflict(lease)) => {
                let err = RecoveryError::LeaseConflict {
                    document_id: id,
                    holder: lease.holder,
                    expires_at: lease.expires_at,
                };
                return (Some(diagnostics), Conclusion::failed(Some(analyzed_status), err));
            }
            Ok(LeaseAcquisition::NotFound) => {
                return (Some(diagnostics), Conclusion::failed(None, RecoveryError::NotFound(id)));
            }
            Err(e) => {
                return (Some(diagnostics), Conclusion::failed(Some(analyzed_status), e.into()));
            }
        }

        let mut run = Run {
            attempt,
            token,
            doc,
        };
        let conclusion = self.run_leased(&mut run, cancel).await;

        match self.store.release_lease(id, token).await {
            Ok(true) => self.audit.record(AuditEvent::LeaseReleased {
                attempt_id: run.attempt.id,
                document_id: id,
                token,
            }),
            Ok(false) => debug!(document_id = %id, "lease already gone at release"),
            // The TTL reclaims it.
            Err(e) => warn!(document_id = %id, error = %e, "failed to release lease"),
        }

        (Some(diagnostics), conclusion)
    }

    async fn analyze(
        &self,
        id: DocumentId,
    ) -> Result<(Document, Diagnostics), (Option<DocumentStatus>, RecoveryError)> {
        let doc = match self.store.get(id).await {
            Ok(Some(doc)) => doc,
            Ok(None) => return Err((None, RecoveryError::NotFound(id))),
            Err(e) => return Err((None, e.into())),
        };
        let now = self.store.now().await.map_err(|e| (Some(doc.status), RecoveryError::from(e)))?;
        let diagnostics = Diagnostics::from_document(&doc, now);

        let eligible = doc.status == DocumentStatus::Error || self.thresholds.is_stale(&doc, now);
        if !eligible {
            let err = RecoveryError::InvalidTransition {
                document_id: id,
                source: InvalidTransition {
                    from: doc.status,
                    event: LifecycleEvent::Restart,
                },
            };
            return Err((Some(doc.status), err));
        }

        debug!(
            document_id = %id,
            status = %doc.status,
            retry_count = doc.retry_count,
            modules = ?doc.trace.modules,
            last_error = ?doc.last_error.as_ref().map(|e| &e.kind),
            "analyzed document"
        );
        Ok((doc, diagnostics))
    }

    async fn run_leased(&self, run: &mut Run<'_>, cancel: &CancellationToken) -> Conclusion {
        let id = run.doc.id;
        let from = run.doc.status;

        // Reset
        if !run.doc.restart_allowed {
            return Conclusion::failed(Some(from), RecoveryError::RestartNotAllowed(id));
        }

        if run.doc.retry_count >= self.config.retry_ceiling {
            let update = match run.doc.exhaust_retries() {
                Ok(u) => u,
                Err(e) => return self.invalid(id, from, e),
            };
            if let Err(conclusion) = self.write(run, &update).await {
                return conclusion;
            }
            self.step(
                run.attempt,
                RecoveryStep::Reset,
                Some(update.status),
                Some("retry ceiling reached".to_string()),
            );
            return Conclusion::failed(
                Some(update.status),
                RecoveryError::RetryCeilingExceeded {
                    document_id: id,
                    retry_count: run.doc.retry_count,
                    ceiling: self.config.retry_ceiling,
                },
            );
        }

        let update = match run.doc.restart() {
            Ok(u) => u,
            Err(e) => return self.invalid(id, from, e),
        };
        if let Err(conclusion) = self.write(run, &update).await {
            return conclusion;
        }
        self.step(run.attempt, RecoveryStep::Reset, Some(update.status), None);

        // Dispatch
        let actor = run.doc.owner.unwrap_or(self.config.system_actor);
        let capability = Capability::new(run.doc.tenant_id, actor);
        let policy = self.config.dispatch_policy();
        let dispatch = retry_with_backoff(
            &policy,
            "gateway.dispatch",
            GatewayError::is_retryable,
            || self.gateway.dispatch(id, &capability),
        );
        let (result, calls) = tokio::select! {
            _ = cancel.cancelled() => return self.cancelled(Some(update.status)),
            r = dispatch => r,
        };
        match result {
            Ok(token) => {
                self.step(
                    run.attempt,
                    RecoveryStep::Dispatch,
                    Some(update.status),
                    Some(format!("attempt token {token}")),
                );
            }
            Err(source) => {
                return Conclusion::failed(
                    Some(update.status),
                    RecoveryError::DispatchFailed {
                        document_id: id,
                        attempts: calls,
                        source,
                    },
                );
            }
        }

        // Monitor
        let monitor = StatusMonitor::new(
            Arc::clone(&self.store),
            self.config.poll_interval(),
            self.config.monitor_timeout(),
        );
        let report = match monitor.watch(id, cancel).await {
            Ok(report) => report,
            Err(e) => return Conclusion::failed(None, e),
        };
        self.step(run.attempt, RecoveryStep::Monitor, report.last_status, None);

        let outcome = match report.outcome {
            MonitorOutcome::Terminal(status) if status.is_success() => RecoveryOutcome::Success,
            MonitorOutcome::Terminal(_) => RecoveryOutcome::Failure,
            MonitorOutcome::TimedOut => RecoveryOutcome::TimedOut,
            MonitorOutcome::Cancelled => RecoveryOutcome::Cancelled,
        };
        Conclusion {
            outcome,
            final_status: report.last_status,
            error: None,
        }
    }

    /// Leased compare-and-swap from the analyzed status.
    async fn write(&self, run: &mut Run<'_>, update: &StatusUpdate) -> Result<(), Conclusion> {
        let id = run.doc.id;
        let from = run.doc.status;
        let condition = CasCondition::leased(from, run.token);

        match self.store.cas_update(id, condition, update).await {
            Ok(true) => {
                let retry_count = update.retry_count.unwrap_or(run.doc.retry_count);
                self.audit.record(AuditEvent::Transition {
                    attempt_id: run.attempt.id,
                    document_id: id,
                    tenant_id: run.doc.tenant_id,
                    from,
                    to: update.status,
                    event: update.event,
                    retry_count,
                });
                info!(
                    document_id = %id,
                    from = %from,
                    to = %update.status,
                    retry_count,
                    "document reset"
                );
                Ok(())
            }
            Ok(false) => {
                let found = self.store.get(id).await.ok().flatten().map(|d| d.status);
                Err(Conclusion::failed(
                    found,
                    RecoveryError::StatusChanged {
                        document_id: id,
                        expected: from,
                        found,
                    },
                ))
            }
            Err(e) => Err(Conclusion::failed(Some(from), e.into())),
        }
    }

    fn invalid(&self, id: DocumentId, from: DocumentStatus, e: InvalidTransition) -> Conclusion {
        Conclusion::failed(
            Some(from),
            RecoveryError::InvalidTransition {
                document_id: id,
                source: e,
            },
        )
    }

    fn cancelled(&self, status: Option<DocumentStatus>) -> Conclusion {
        Conclusion {
            outcome: RecoveryOutcome::Cancelled,
            final_status: status,
            error: None,
        }
    }

    fn step(
        &self,
        attempt: &mut RecoveryAttempt,
        step: RecoveryStep,
        status: Option<DocumentStatus>,
        detail: Option<String>,
    ) {
        attempt.record_step(step, self.clock.now(), status, detail);
        self.audit.record(AuditEvent::StepCompleted {
            attempt_id: attempt.id,
            document_id: attempt.document_id,
            step,
            status,
        });
    }

    fn finish(
        &self,
        mut attempt: RecoveryAttempt,
        diagnostics: Option<Diagnostics>,
        conclusion: Conclusion,
    ) -> RecoveryResult {
        let at: DateTime<Utc> = self.clock.now();
        attempt.finish(conclusion.outcome, at);

        let document_id = attempt.document_id;
        match &conclusion.error {
            Some(err) => warn!(
                document_id = %document_id,
                attempt_id = %attempt.id,
                outcome = %conclusion.outcome,
                error_kind = err.kind(),
                error = %err,
                "recovery finished"
            ),
            None => info!(
                document_id = %document_id,
                attempt_id = %attempt.id,
                outcome = %conclusion.outcome,
                final_status = ?conclusion.final_status,
                "recovery finished"
            ),
        }

        self.audit.record(AuditEvent::RecoveryFinished {
            attempt_id: attempt.id,
            document_id,
            outcome: conclusion.outcome,
            final_status: conclusion.final_status,
            error: conclusion.error.as_ref().map(|e| e.to_string()),
            at,
        });

        RecoveryResult {
            document_id,
            attempt,
            outcome: conclusion.outcome,
            final_status: conclusion.final_status,
            error: conclusion.error,
            diagnostics,
        }
    }
}
