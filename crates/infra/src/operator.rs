//! Operator call points: manual triggers and read-only reports.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use docflow_core::DocumentId;
use docflow_documents::{Document, DocumentStatus};

use crate::config::{MAX_THRESHOLD_MINUTES, SchedulerConfig};
use crate::detector::StaleThresholds;
use crate::gateway::ProcessingGateway;
use crate::recovery::{RecoveryCoordinator, RecoveryResult};
use crate::scheduler::{BatchTriggerScheduler, TickReport};
use crate::store::{
    DocumentFilter, DocumentStore, StaleDocument, StatusCounts, StoreError, TenantScope,
};

const UNKNOWN: &str = "unknown";
const HAS_DATA: &str = "has_data";
const NO_DATA: &str = "no_data";

/// `ERROR` documents from a recent window grouped by where they came from.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub since: DateTime<Utc>,
    pub total: usize,
    pub by_doc_type: BTreeMap<String, u64>,
    pub by_source: BTreeMap<String, u64>,
    /// `has_data` when a payload was stored before the failure, `no_data` otherwise.
    pub by_data_status: BTreeMap<String, u64>,
    /// Newest first.
    pub recent: Vec<Document>,
}

/// How long the documents in one status have been sitting there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusAge {
    pub count: u64,
    pub avg_age_secs: i64,
    pub max_age_secs: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEntry {
    pub document_id: DocumentId,
    pub status: DocumentStatus,
    pub retry_count: u32,
    pub last_modified_at: DateTime<Utc>,
}

/// Where a known set of documents currently stands.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressionReport {
    /// In request order.
    pub entries: Vec<ProgressEntry>,
    pub distribution: BTreeMap<DocumentStatus, u64>,
    pub missing: Vec<DocumentId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentChanges {
    pub since: DateTime<Utc>,
    /// Over every document changed in the window, not only `entries`.
    pub distribution: BTreeMap<DocumentStatus, u64>,
    pub entries: Vec<Document>,
}

/// Per-status difference between two count snapshots. Zero deltas are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusDelta {
    pub changes: BTreeMap<DocumentStatus, i64>,
}

impl StatusDelta {
    pub fn between(before: &StatusCounts, after: &StatusCounts) -> Self {
        let changes = DocumentStatus::ALL
            .iter()
            .filter_map(|s| {
                let delta = after.get(*s) as i64 - before.get(*s) as i64;
                (delta != 0).then_some((*s, delta))
            })
            .collect();
        Self { changes }
    }

    pub fn get(&self, status: DocumentStatus) -> i64 {
        self.changes.get(&status).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

pub struct Operator<S, G> {
    store: Arc<S>,
    scheduler: BatchTriggerScheduler<S, G>,
}

impl<S, G> Operator<S, G>
where
    S: DocumentStore + 'static,
    G: ProcessingGateway + 'static,
{
    pub fn new(
        coordinator: RecoveryCoordinator<S, G>,
        thresholds: StaleThresholds,
        config: SchedulerConfig,
    ) -> Self {
        let store = Arc::clone(coordinator.store());
        Self {
            store,
            scheduler: BatchTriggerScheduler::new(coordinator, thresholds, config),
        }
    }

    pub async fn trigger_one(&self, id: DocumentId) -> RecoveryResult {
        info!(document_id = %id, "manual recovery requested");
        self.scheduler.coordinator().recover(id).await
    }

    /// Run one scheduler tick now.
    pub async fn trigger_batch(&self) -> TickReport {
        info!("manual batch recovery requested");
        self.scheduler.tick(&CancellationToken::new()).await
    }

    /// Run one tick and report how the status counts moved around it.
    pub async fn trigger_batch_with_delta(
        &self,
        scope: TenantScope,
    ) -> Result<(TickReport, StatusDelta), StoreError> {
        let before = self.status_counts(scope).await?;
        let report = self.trigger_batch().await;
        let after = self.status_counts(scope).await?;
        Ok((report, StatusDelta::between(&before, &after)))
    }

    pub async fn status_counts(&self, scope: TenantScope) -> Result<StatusCounts, StoreError> {
        self.store.status_counts(scope).await
    }

    /// Stuck documents, either under the configured thresholds or, when
    /// `threshold_minutes` is given, one threshold for every resumable status.
    pub async fn stuck_candidates(
        &self,
        threshold_minutes: Option<u64>,
        scope: TenantScope,
    ) -> Result<Vec<StaleDocument>, StoreError> {
        let detector = self.scheduler.detector();
        match threshold_minutes {
            Some(minutes) => {
                let threshold = StaleThresholds::minutes(minutes).ok_or_else(|| {
                    StoreError::InvalidRequest(format!(
                        "stuck threshold of {minutes} minutes is outside 1..={MAX_THRESHOLD_MINUTES}"
                    ))
                })?;
                detector.find_candidates_older_than(threshold, scope).await
            }
            None => detector.find_candidates(scope, None).await,
        }
    }

    pub async fn stuck_counts(
        &self,
        scope: TenantScope,
    ) -> Result<BTreeMap<DocumentStatus, usize>, StoreError> {
        self.scheduler.detector().counts_by_status(scope).await
    }

    /// Count, average and maximum age for `ERROR` and every resumable status,
    /// measured with the store clock. Statuses with no documents are omitted.
    pub async fn status_ages(
        &self,
        scope: TenantScope,
    ) -> Result<BTreeMap<DocumentStatus, StatusAge>, StoreError> {
        let now = self.store.now().await?;
        let filter = DocumentStatus::RESUMABLE
            .iter()
            .fold(DocumentFilter::scoped(scope).with_status(DocumentStatus::Error), |f, s| {
                f.with_status(*s)
            });

        let mut totals: BTreeMap<DocumentStatus, (u64, i64, i64)> = BTreeMap::new();
        for doc in self.store.list_documents(&filter).await? {
            let age = doc.age(now).num_seconds().max(0);
            let (count, sum, max) = totals.entry(doc.status).or_insert((0, 0, 0));
            *count += 1;
            *sum = sum.saturating_add(age);
            *max = (*max).max(age);
        }
        Ok(totals
            .into_iter()
            .map(|(status, (count, sum, max))| {
                let avg_age_secs = sum / i64::try_from(count).unwrap_or(i64::MAX);
                (
                    status,
                    StatusAge {
                        count,
                        avg_age_secs,
                        max_age_secs: max,
                    },
                )
            })
            .collect())
    }

    pub async fn restarted_documents(
        &self,
        scope: TenantScope,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        let filter = DocumentFilter::scoped(scope)
            .with_status(DocumentStatus::Restarted)
            .limit(limit);
        self.store.list_documents(&filter).await
    }

    /// `ERROR` documents that failed within the last `hours`, by the store clock.
    pub async fn error_report(
        &self,
        scope: TenantScope,
        hours: u32,
        limit: usize,
    ) -> Result<ErrorReport, StoreError> {
        let since = self.window_start(hours).await?;
        let filter = DocumentFilter::scoped(scope)
            .with_status(DocumentStatus::Error)
            .modified_since(since);
        let errored = self.store.list_documents(&filter).await?;

        let mut report = ErrorReport {
            since,
            total: errored.len(),
            by_doc_type: BTreeMap::new(),
            by_source: BTreeMap::new(),
            by_data_status: BTreeMap::new(),
            recent: Vec::new(),
        };
        for doc in &errored {
            let doc_type = doc.trace.doc_type.as_deref().unwrap_or(UNKNOWN);
            let source = doc.trace.source.as_deref().unwrap_or(UNKNOWN);
            let data = if doc.payload_ref.is_some() { HAS_DATA } else { NO_DATA };
            *report.by_doc_type.entry(doc_type.to_string()).or_insert(0) += 1;
            *report.by_source.entry(source.to_string()).or_insert(0) += 1;
            *report.by_data_status.entry(data.to_string()).or_insert(0) += 1;
        }
        report.recent = errored.into_iter().take(limit).collect();
        Ok(report)
    }

    pub async fn progression(&self, ids: &[DocumentId]) -> Result<ProgressionReport, StoreError> {
        let filter = DocumentFilter::default().with_ids(ids.to_vec());
        let found: BTreeMap<DocumentId, Document> = self
            .store
            .list_documents(&filter)
            .await?
            .into_iter()
            .map(|d| (d.id, d))
            .collect();

        let mut report = ProgressionReport::default();
        for id in ids {
            match found.get(id) {
                Some(doc) => {
                    *report.distribution.entry(doc.status).or_insert(0) += 1;
                    report.entries.push(ProgressEntry {
                        document_id: doc.id,
                        status: doc.status,
                        retry_count: doc.retry_count,
                        last_modified_at: doc.last_modified_at,
                    });
                }
                None => report.missing.push(*id),
            }
        }
        Ok(report)
    }

    /// Documents whose status changed in the last `hours`, by the store clock.
    pub async fn recent_changes(
        &self,
        hours: u32,
        scope: TenantScope,
        limit: usize,
    ) -> Result<RecentChanges, StoreError> {
        let since = self.window_start(hours).await?;
        let filter = DocumentFilter::scoped(scope).modified_since(since);
        let changed = self.store.list_documents(&filter).await?;

        let mut distribution = BTreeMap::new();
        for doc in &changed {
            *distribution.entry(doc.status).or_insert(0) += 1;
        }
        Ok(RecentChanges {
            since,
            distribution,
            entries: changed.into_iter().take(limit).collect(),
        })
    }

    async fn window_start(&self, hours: u32) -> Result<DateTime<Utc>, StoreError> {
        let now = self.store.now().await?;
        Duration::try_hours(i64::from(hours))
            .and_then(|window| now.checked_sub_signed(window))
            .ok_or_else(|| {
                StoreError::InvalidRequest(format!("window of {hours} hours is out of range"))
            })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::CoordinatorConfig;
    use crate::store::InMemoryDocumentStore;
    use crate::test_support::{Script, SimulatedGateway, seed};
    use docflow_core::TenantId;
    use docflow_documents::{LastError, PayloadRef, ProcessingTrace};

    fn operator(
        store: &Arc<InMemoryDocumentStore>,
        script: Script,
    ) -> Operator<InMemoryDocumentStore, SimulatedGateway> {
        let gateway = Arc::new(SimulatedGateway::new(store.clone(), script));
        let coordinator =
            RecoveryCoordinator::new(store.clone(), gateway, CoordinatorConfig::default());
        Operator::new(
            coordinator,
            StaleThresholds::default(),
            SchedulerConfig::default(),
        )
    }

    #[test]
    fn delta_reports_only_changed_statuses() {
        let before: StatusCounts = [(DocumentStatus::Error, 3), (DocumentStatus::Finished, 1)]
            .into_iter()
            .collect();
        let after: StatusCounts = [
            (DocumentStatus::Error, 1),
            (DocumentStatus::Restarted, 2),
            (DocumentStatus::Finished, 1),
        ]
        .into_iter()
        .collect();

        let delta = StatusDelta::between(&before, &after);
        assert_eq!(delta.get(DocumentStatus::Error), -2);
        assert_eq!(delta.get(DocumentStatus::Restarted), 2);
        assert_eq!(delta.get(DocumentStatus::Finished), 0);
        assert_eq!(delta.changes.len(), 2);
        assert!(StatusDelta::between(&after, &after).is_empty());
    }

    #[tokio::test]
    async fn error_report_groups_by_doc_type_and_source() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let tenant = TenantId::new();
        let now = Utc::now();
        for (i, (doc_type, source)) in [
            (Some("invoice"), Some("email")),
            (Some("invoice"), Some("upload")),
            (None, Some("email")),
        ]
        .into_iter()
        .enumerate()
        {
            let doc = Document::new(tenant, format!("{i}.pdf"), now - Duration::hours(1))
                .with_status(DocumentStatus::Error, now - Duration::minutes(i as i64))
                .with_error(LastError::new("ocr", "timeout", now))
                .with_trace(ProcessingTrace {
                    modules: vec!["ocr".to_string()],
                    doc_type: doc_type.map(str::to_string),
                    extraction_type: None,
                    source: source.map(str::to_string),
                });
            store.insert(doc).await.unwrap();
        }
        seed(&store, tenant, DocumentStatus::Finished, 5, 0).await;

        let op = operator(&store, Script::Silent);
        let report = op.error_report(TenantScope::Tenant(tenant), 24, 2).await.unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.by_doc_type.get("invoice"), Some(&2));
        assert_eq!(report.by_doc_type.get(UNKNOWN), Some(&1));
        assert_eq!(report.by_source.get("email"), Some(&2));
        assert_eq!(report.recent.len(), 2);
        assert_eq!(report.recent[0].filename, "0.pdf");
    }

    #[tokio::test]
    async fn error_report_covers_only_the_window_and_splits_by_payload() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(InMemoryDocumentStore::with_clock(clock.clone()));
        let tenant = TenantId::new();
        let now = clock.now();

        let mut with_payload = Document::new(tenant, "scanned.pdf", now - Duration::hours(3))
            .with_status(DocumentStatus::Error, now - Duration::hours(2));
        with_payload.payload_ref = Some(PayloadRef("s3://bucket/scanned.json".to_string()));
        store.insert(with_payload).await.unwrap();
        seed(&store, tenant, DocumentStatus::Error, 60 * 5, 0).await;
        seed(&store, tenant, DocumentStatus::Error, 60 * 30, 0).await;

        let op = operator(&store, Script::Silent);
        let report = op.error_report(TenantScope::Any, 24, 10).await.unwrap();

        assert_eq!(report.since, now - Duration::hours(24));
        assert_eq!(report.total, 2);
        assert_eq!(report.by_data_status.get(HAS_DATA), Some(&1));
        assert_eq!(report.by_data_status.get(NO_DATA), Some(&1));
        assert_eq!(report.recent[0].filename, "scanned.pdf");

        clock.advance(Duration::hours(20));
        let later = op.error_report(TenantScope::Any, 24, 10).await.unwrap();
        assert_eq!(later.total, 1);
        assert_eq!(later.by_data_status.get(HAS_DATA), Some(&1));
        assert_eq!(later.by_data_status.get(NO_DATA), None);

        let err = op.error_report(TenantScope::Any, u32::MAX, 10).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn status_ages_use_the_store_clock() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(InMemoryDocumentStore::with_clock(clock.clone()));
        let tenant = TenantId::new();
        seed(&store, tenant, DocumentStatus::Processing, 10, 0).await;
        seed(&store, tenant, DocumentStatus::Processing, 50, 0).await;
        seed(&store, tenant, DocumentStatus::Error, 120, 0).await;
        seed(&store, tenant, DocumentStatus::Finished, 600, 0).await;

        let op = operator(&store, Script::Silent);
        let ages = op.status_ages(TenantScope::Tenant(tenant)).await.unwrap();

        assert_eq!(
            ages.get(&DocumentStatus::Processing),
            Some(&StatusAge {
                count: 2,
                avg_age_secs: 30 * 60,
                max_age_secs: 50 * 60,
            })
        );
        assert_eq!(ages.get(&DocumentStatus::Error).map(|a| a.count), Some(1));
        assert!(!ages.contains_key(&DocumentStatus::Finished));
        assert!(!ages.contains_key(&DocumentStatus::Running));

        clock.advance(Duration::minutes(5));
        let later = op.status_ages(TenantScope::Tenant(tenant)).await.unwrap();
        assert_eq!(later[&DocumentStatus::Error].max_age_secs, 125 * 60);
    }

    #[tokio::test]
    async fn progression_reports_missing_ids_in_request_order() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let tenant = TenantId::new();
        let a = seed(&store, tenant, DocumentStatus::Processing, 5, 1).await;
        let b = seed(&store, tenant, DocumentStatus::Finished, 5, 0).await;
        let gone = seed(&store, tenant, DocumentStatus::Error, 5, 0).await;
        store.soft_delete(gone.id).unwrap();
        let unknown = DocumentId::new();

        let op = operator(&store, Script::Silent);
        let report = op.progression(&[b.id, unknown, a.id, gone.id]).await.unwrap();

        let ids: Vec<_> = report.entries.iter().map(|e| e.document_id).collect();
        assert_eq!(ids, vec![b.id, a.id]);
        assert_eq!(report.missing, vec![unknown, gone.id]);
        assert_eq!(report.distribution.get(&DocumentStatus::Processing), Some(&1));
        assert_eq!(report.entries[1].retry_count, 1);
    }

    #[tokio::test]
    async fn recent_changes_use_the_store_clock() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(InMemoryDocumentStore::with_clock(clock.clone()));
        let tenant = TenantId::new();
        seed(&store, tenant, DocumentStatus::Finished, 30, 0).await;
        seed(&store, tenant, DocumentStatus::Error, 90, 0).await;
        seed(&store, tenant, DocumentStatus::Restarted, 60 * 5, 0).await;

        let op = operator(&store, Script::Silent);
        let changes = op.recent_changes(2, TenantScope::Any, 1).await.unwrap();

        assert_eq!(changes.since, clock.now() - Duration::hours(2));
        assert_eq!(changes.distribution.values().sum::<u64>(), 2);
        assert_eq!(changes.entries.len(), 1);
        assert_eq!(changes.entries[0].status, DocumentStatus::Finished);
    }

    #[tokio::test]
    async fn stuck_views_share_the_detector() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let tenant = TenantId::new();
        seed(&store, tenant, DocumentStatus::Processing, 45, 0).await;
        seed(&store, tenant, DocumentStatus::Running, 15, 0).await;
        seed(&store, tenant, DocumentStatus::Error, 600, 0).await;

        let op = operator(&store, Script::Silent);
        let scope = TenantScope::Tenant(tenant);

        assert_eq!(op.stuck_candidates(None, scope).await.unwrap().len(), 1);
        assert_eq!(op.stuck_candidates(Some(10), scope).await.unwrap().len(), 2);
        assert!(op.stuck_candidates(Some(MAX_THRESHOLD_MINUTES), scope).await.unwrap().is_empty());
        let counts = op.stuck_counts(scope).await.unwrap();
        assert_eq!(counts.get(&DocumentStatus::Processing), Some(&1));

        let totals = op.status_counts(scope).await.unwrap();
        assert_eq!(totals.total(), 3);
    }

    #[tokio::test]
    async fn oversized_stuck_threshold_is_refused_not_wrapped() {
        let store = Arc::new(InMemoryDocumentStore::new());
        seed(&store, TenantId::new(), DocumentStatus::Processing, 1, 0).await;
        let op = operator(&store, Script::Silent);

        for minutes in [u64::MAX, 1 << 63, MAX_THRESHOLD_MINUTES + 1, 0] {
            let err = op.stuck_candidates(Some(minutes), TenantScope::Any).await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidRequest(_)), "{minutes}: {err:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn manual_batch_reports_the_status_delta() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let tenant = TenantId::new();
        let doc = seed(&store, tenant, DocumentStatus::Processing, 45, 0).await;
        seed(&store, tenant, DocumentStatus::Finished, 45, 0).await;

        let op = operator(&store, Script::Finish(StdDuration::from_secs(5)));
        let (report, delta) = op
            .trigger_batch_with_delta(TenantScope::Tenant(tenant))
            .await
            .unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(delta.get(DocumentStatus::Processing), -1);
        assert_eq!(delta.get(DocumentStatus::Finished), 1);

        let restarted = op
            .restarted_documents(TenantScope::Tenant(tenant), 10)
            .await
            .unwrap();
        assert!(restarted.is_empty());
        assert_eq!(store.raw(doc.id).unwrap().retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_one_runs_the_coordinator() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let doc = seed(&store, TenantId::new(), DocumentStatus::Error, 5, 0).await;
        let op = operator(&store, Script::Silent);

        let result = op.trigger_one(doc.id).await;
        assert_eq!(result.outcome, docflow_documents::RecoveryOutcome::TimedOut);

        let restarted = op.restarted_documents(TenantScope::Any, 10).await.unwrap();
        assert_eq!(restarted.len(), 1);
        assert_eq!(restarted[0].id, doc.id);
    }
}
