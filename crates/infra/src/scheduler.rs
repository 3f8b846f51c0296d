//! Batch trigger scheduler.
//!
//! Periodically asks the detector for stuck documents and hands them to the
//! coordinator. Ticks never overlap: the loop awaits each batch before it
//! waits for the next period. A tick can also be requested through
//! [`SchedulerHandle::trigger`]; requests made while a tick is running are
//! coalesced into one follow-up tick.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use docflow_core::DocumentId;
use docflow_documents::RecoveryOutcome;

use crate::config::SchedulerConfig;
use crate::detector::{StaleThresholds, StuckItemDetector};
use crate::gateway::ProcessingGateway;
use crate::recovery::{RecoveryCoordinator, RecoveryError, RecoveryResult};
use crate::store::{DocumentStore, StoreError, TenantScope};

/// What one tick found and did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub started_at: Option<DateTime<Utc>>,
    pub candidates_found: usize,
    /// Candidates already leased at scan time, plus lease races lost during the run.
    pub leases_skipped: usize,
    /// Candidates left for a later tick by the per-tick cap.
    pub deferred: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
    pub scan_error: Option<StoreError>,
    pub results: Vec<RecoveryResult>,
}

impl TickReport {
    fn tally(&mut self, result: &RecoveryResult) {
        match (result.outcome, &result.error) {
            (_, Some(RecoveryError::LeaseConflict { .. })) => self.leases_skipped += 1,
            (RecoveryOutcome::Success, _) => self.succeeded += 1,
            (RecoveryOutcome::Failure, _) => self.failed += 1,
            (RecoveryOutcome::TimedOut, _) => self.timed_out += 1,
            (RecoveryOutcome::Cancelled, _) => self.cancelled += 1,
        }
    }
}

/// Cumulative counters across ticks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub scan_failures: u64,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub leases_skipped: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
}

impl SchedulerStats {
    fn record(&mut self, report: &TickReport) {
        self.ticks += 1;
        if report.scan_error.is_some() {
            self.scan_failures += 1;
        }
        self.attempted += report.attempted as u64;
        self.succeeded += report.succeeded as u64;
        self.failed += report.failed as u64;
        self.timed_out += report.timed_out as u64;
        self.cancelled += report.cancelled as u64;
        self.leases_skipped += report.leases_skipped as u64;
        self.last_tick_at = report.started_at;
    }
}

pub struct BatchTriggerScheduler<S, G> {
    detector: StuckItemDetector<Arc<S>>,
    coordinator: RecoveryCoordinator<S, G>,
    config: SchedulerConfig,
}

impl<S, G> BatchTriggerScheduler<S, G>
where
    S: DocumentStore + 'static,
    G: ProcessingGateway + 'static,
{
    pub fn new(
        coordinator: RecoveryCoordinator<S, G>,
        thresholds: StaleThresholds,
        config: SchedulerConfig,
    ) -> Self {
        let detector = StuckItemDetector::new(Arc::clone(coordinator.store()), thresholds);
        Self {
            detector,
            coordinator,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &RecoveryCoordinator<S, G> {
        &self.coordinator
    }

    pub fn detector(&self) -> &StuckItemDetector<Arc<S>> {
        &self.detector
    }

    fn scope(&self) -> TenantScope {
        self.config.tenant.into()
    }

    /// Run one scan-and-recover pass.
    pub async fn tick(&self, cancel: &CancellationToken) -> TickReport {
        let mut report = TickReport {
            started_at: self.store_now().await,
            ..TickReport::default()
        };

        let candidates = match self.detector.find_candidates(self.scope(), None).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "stuck-item scan failed; skipping tick");
                report.scan_error = Some(e);
                return report;
            }
        };
        report.candidates_found = candidates.len();

        let mut ids: Vec<DocumentId> = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            if candidate.leased {
                report.leases_skipped += 1;
            } else {
                ids.push(candidate.id);
            }
        }
        if ids.len() > self.config.max_per_tick {
            report.deferred = ids.len() - self.config.max_per_tick;
            ids.truncate(self.config.max_per_tick);
        }
        report.attempted = ids.len();

        if !ids.is_empty() {
            let results = self
                .coordinator
                .recover_batch_with_cancel(&ids, self.config.max_concurrency, cancel)
                .await;
            for result in &results {
                report.tally(result);
            }
            report.results = results;
        }

        info!(
            candidates = report.candidates_found,
            leases_skipped = report.leases_skipped,
            deferred = report.deferred,
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            timed_out = report.timed_out,
            cancelled = report.cancelled,
            "recovery tick complete"
        );
        report
    }

    async fn store_now(&self) -> Option<DateTime<Utc>> {
        self.coordinator.store().now().await.ok()
    }

    /// Start the periodic loop on the current tokio runtime.
    pub fn spawn(self) -> SchedulerHandle {
        let cancel = CancellationToken::new();
        let trigger = Arc::new(Notify::new());
        let stats = Arc::new(Mutex::new(SchedulerStats::default()));

        let join = tokio::spawn(run_loop(
            self,
            cancel.clone(),
            Arc::clone(&trigger),
            Arc::clone(&stats),
        ));

        SchedulerHandle {
            cancel,
            trigger,
            join: Some(join),
            stats,
        }
    }
}

async fn run_loop<S, G>(
    scheduler: BatchTriggerScheduler<S, G>,
    cancel: CancellationToken,
    trigger: Arc<Notify>,
    stats: Arc<Mutex<SchedulerStats>>,
) where
    S: DocumentStore + 'static,
    G: ProcessingGateway + 'static,
{
    let mut interval = tokio::time::interval(scheduler.config.period());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(
        period_secs = scheduler.config.period_secs,
        max_per_tick = scheduler.config.max_per_tick,
        max_concurrency = scheduler.config.max_concurrency,
        "recovery scheduler started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
            _ = trigger.notified() => {}
        }
        let report = scheduler.tick(&cancel).await;
        stats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .record(&report);
    }
    info!("recovery scheduler stopped");
}

/// Handle for a running scheduler (shutdown + trigger hook).
#[derive(Debug)]
pub struct SchedulerHandle {
    cancel: CancellationToken,
    trigger: Arc<Notify>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl SchedulerHandle {
    /// Request a tick now. Coalesced with any pending request.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Stop the loop, cancelling in-flight recoveries, and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!(error = %e, "recovery scheduler task ended abnormally");
            }
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
