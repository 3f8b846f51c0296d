//! Stuck-item detector.
//!
//! Read-only scan for documents that have sat in a resumable status longer
//! than that status's threshold. Ages are measured with the store's clock.
//! A false positive is harmless: the recovery lease keeps a document from
//! being processed twice.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use docflow_documents::{Document, DocumentStatus};

use crate::config::{DetectorConfig, MAX_THRESHOLD_MINUTES};
use crate::store::{DocumentStore, StaleDocument, StaleQuery, StoreError, TenantScope};

/// Per-status staleness thresholds for the resumable statuses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleThresholds {
    thresholds: BTreeMap<DocumentStatus, Duration>,
}

impl StaleThresholds {
    /// Same threshold for every resumable status.
    pub fn uniform(threshold: Duration) -> Self {
        Self {
            thresholds: DocumentStatus::RESUMABLE
                .iter()
                .map(|s| (*s, threshold))
                .collect(),
        }
    }

    /// Thresholds from configuration. Values beyond [`MAX_THRESHOLD_MINUTES`]
    /// are clamped to it; `RecoveryConfig::validate` rejects them up front.
    pub fn from_config(config: &DetectorConfig) -> Self {
        let clamp = |minutes: u64| {
            Self::minutes(minutes.min(MAX_THRESHOLD_MINUTES)).unwrap_or(Duration::zero())
        };
        let mut out = Self::uniform(clamp(config.threshold_minutes));
        for (status, minutes) in &config.threshold_overrides_minutes {
            if status.is_resumable() {
                out.thresholds.insert(*status, clamp(*minutes));
            }
        }
        out
    }

    /// `minutes` as a threshold, or `None` outside `1..=MAX_THRESHOLD_MINUTES`.
    pub fn minutes(minutes: u64) -> Option<Duration> {
        if !(1..=MAX_THRESHOLD_MINUTES).contains(&minutes) {
            return None;
        }
        i64::try_from(minutes).ok().and_then(Duration::try_minutes)
    }

    /// `None` for statuses the detector never considers.
    pub fn for_status(&self, status: DocumentStatus) -> Option<Duration> {
        self.thresholds.get(&status).copied()
    }

    /// Whether `doc` has been in its current status strictly longer than its threshold.
    pub fn is_stale(&self, doc: &Document, now: DateTime<Utc>) -> bool {
        self.for_status(doc.status)
            .is_some_and(|threshold| doc.age(now) > threshold)
    }

    pub fn to_query(&self, scope: TenantScope, limit: Option<usize>) -> StaleQuery {
        StaleQuery {
            thresholds: self.thresholds.iter().map(|(s, d)| (*s, *d)).collect(),
            scope,
            limit,
        }
    }
}

impl Default for StaleThresholds {
    fn default() -> Self {
        Self::from_config(&DetectorConfig::default())
    }
}

pub struct StuckItemDetector<S> {
    store: S,
    thresholds: StaleThresholds,
}

impl<S> StuckItemDetector<S>
where
    S: DocumentStore,
{
    pub fn new(store: S, thresholds: StaleThresholds) -> Self {
        Self { store, thresholds }
    }

    pub fn thresholds(&self) -> &StaleThresholds {
        &self.thresholds
    }

    /// Restart candidates under the configured thresholds, oldest first.
    pub async fn find_candidates(
        &self,
        scope: TenantScope,
        limit: Option<usize>,
    ) -> Result<Vec<StaleDocument>, StoreError> {
        let query = self.thresholds.to_query(scope, limit);
        let hits = self.store.query_by_status_age(&query).await?;
        debug!(
            candidates = hits.len(),
            leased = hits.iter().filter(|h| h.leased).count(),
            "stuck-item scan"
        );
        Ok(hits)
    }

    /// Candidates using one ad-hoc threshold for every resumable status.
    pub async fn find_candidates_older_than(
        &self,
        threshold: Duration,
        scope: TenantScope,
    ) -> Result<Vec<StaleDocument>, StoreError> {
        let query = StaleThresholds::uniform(threshold).to_query(scope, None);
        self.store.query_by_status_age(&query).await
    }

    /// Number of stuck documents per status.
    pub async fn counts_by_status(
        &self,
        scope: TenantScope,
    ) -> Result<BTreeMap<DocumentStatus, usize>, StoreError> {
        let mut counts = BTreeMap::new();
        for hit in self.find_candidates(scope, None).await? {
            *counts.entry(hit.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Check a single document against the thresholds using the store clock.
    pub async fn is_stale(&self, doc: &Document) -> Result<bool, StoreError> {
        let now = self.store.now().await?;
        Ok(self.thresholds.is_stale(doc, now))
    }
}
