use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use docflow_core::{DocumentId, TenantId};
use docflow_documents::{Document, DocumentStatus, Lease, LeaseToken, StatusUpdate};

/// Document store operation error.
///
/// Only `Unavailable` is considered transient; `RetryingStore` retries it and
/// surfaces everything else immediately.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("document already exists: {0}")]
    Conflict(DocumentId),

    #[error("corrupt document row: {0}")]
    Corrupt(String),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("invalid store request: {0}")]
    InvalidRequest(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Tenant scope for scans and listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TenantScope {
    #[default]
    Any,
    Tenant(TenantId),
}

impl TenantScope {
    pub fn tenant(self) -> Option<TenantId> {
        match self {
            TenantScope::Any => None,
            TenantScope::Tenant(t) => Some(t),
        }
    }

    pub fn contains(self, tenant_id: TenantId) -> bool {
        match self {
            TenantScope::Any => true,
            TenantScope::Tenant(t) => t == tenant_id,
        }
    }
}

impl From<Option<TenantId>> for TenantScope {
    fn from(value: Option<TenantId>) -> Self {
        value.map_or(TenantScope::Any, TenantScope::Tenant)
    }
}

/// Guard for [`DocumentStore::cas_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CasCondition {
    pub expected_status: DocumentStatus,
    /// When set, the write also requires this token to hold an unexpired lease.
    pub lease_token: Option<LeaseToken>,
}

impl CasCondition {
    pub fn status(expected_status: DocumentStatus) -> Self {
        Self {
            expected_status,
            lease_token: None,
        }
    }

    pub fn leased(expected_status: DocumentStatus, token: LeaseToken) -> Self {
        Self {
            expected_status,
            lease_token: Some(token),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRequest {
    pub token: LeaseToken,
    pub holder: String,
    pub ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAcquisition {
    /// The lease is ours (freshly taken, or already held by the same token).
    Acquired(Lease),
    /// Someone else holds an unexpired lease.
    Conflict(Lease),
    NotFound,
}

/// Age-based scan: documents whose status has persisted past its threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleQuery {
    /// One entry per status to scan. Statuses not listed are ignored.
    pub thresholds: Vec<(DocumentStatus, Duration)>,
    pub scope: TenantScope,
    pub limit: Option<usize>,
}

/// A scan hit, ordered oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleDocument {
    pub id: DocumentId,
    pub tenant_id: TenantId,
    pub status: DocumentStatus,
    pub last_modified_at: DateTime<Utc>,
    /// Time in the current status, by the store's clock.
    pub age: Duration,
    /// True when an unexpired lease is present.
    pub leased: bool,
}

/// Filter for [`DocumentStore::list_documents`]; results are newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentFilter {
    pub scope: TenantScope,
    /// Empty means any status.
    pub statuses: Vec<DocumentStatus>,
    pub ids: Option<Vec<DocumentId>>,
    pub modified_since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl DocumentFilter {
    pub fn scoped(scope: TenantScope) -> Self {
        Self {
            scope,
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: DocumentStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_ids(mut self, ids: Vec<DocumentId>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn modified_since(mut self, since: DateTime<Utc>) -> Self {
        self.modified_since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        !doc.deleted
            && self.scope.contains(doc.tenant_id)
            && (self.statuses.is_empty() || self.statuses.contains(&doc.status))
            && self.ids.as_ref().is_none_or(|ids| ids.contains(&doc.id))
            && self.modified_since.is_none_or(|since| doc.last_modified_at >= since)
    }
}

/// Per-status document counts (soft-deleted rows excluded).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub counts: BTreeMap<DocumentStatus, u64>,
}

impl StatusCounts {
    pub fn get(&self, status: DocumentStatus) -> u64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

impl FromIterator<(DocumentStatus, u64)> for StatusCounts {
    fn from_iter<I: IntoIterator<Item = (DocumentStatus, u64)>>(iter: I) -> Self {
        let mut counts = BTreeMap::new();
        for (status, n) in iter {
            *counts.entry(status).or_insert(0) += n;
        }
        Self { counts }
    }
}

/// Storage primitives used by the recovery runtime.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// The store's wall clock. Ages are always measured against this.
    async fn now(&self) -> Result<DateTime<Utc>, StoreError>;

    async fn get(&self, id: DocumentId) -> Result<Option<Document>, StoreError>;

    /// Insert a new document (ingestion path and fixtures).
    async fn insert(&self, document: Document) -> Result<(), StoreError>;

    /// Apply `update` only if the condition still holds. Returns `false` when
    /// the document is missing or the condition failed; nothing is written.
    async fn cas_update(
        &self,
        id: DocumentId,
        condition: CasCondition,
        update: &StatusUpdate,
    ) -> Result<bool, StoreError>;

    async fn try_acquire_lease(
        &self,
        id: DocumentId,
        request: &LeaseRequest,
    ) -> Result<LeaseAcquisition, StoreError>;

    /// Clear the lease if `token` still owns it. Returns whether anything changed.
    async fn release_lease(&self, id: DocumentId, token: LeaseToken) -> Result<bool, StoreError>;

    async fn query_by_status_age(&self, query: &StaleQuery)
        -> Result<Vec<StaleDocument>, StoreError>;

    async fn status_counts(&self, scope: TenantScope) -> Result<StatusCounts, StoreError>;

    async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>, StoreError>;
}

#[async_trait::async_trait]
impl<S> DocumentStore for Arc<S>
where
    S: DocumentStore + ?Sized,
{
    async fn now(&self) -> Result<DateTime<Utc>, StoreError> {
        (**self).now().await
    }

    async fn get(&self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        (**self).get(id).await
    }

    async fn insert(&self, document: Document) -> Result<(), StoreError> {
        (**self).insert(document).await
    }

    async fn cas_update(
        &self,
        id: DocumentId,
        condition: CasCondition,
        update: &StatusUpdate,
    ) -> Result<bool, StoreError> {
        (**self).cas_update(id, condition, update).await
    }

    async fn try_acquire_lease(
        &self,
        id: DocumentId,
        request: &LeaseRequest,
    ) -> Result<LeaseAcquisition, StoreError> {
        (**self).try_acquire_lease(id, request).await
    }

    async fn release_lease(&self, id: DocumentId, token: LeaseToken) -> Result<bool, StoreError> {
        (**self).release_lease(id, token).await
    }

    async fn query_by_status_age(
        &self,
        query: &StaleQuery,
    ) -> Result<Vec<StaleDocument>, StoreError> {
        (**self).query_by_status_age(query).await
    }

    async fn status_counts(&self, scope: TenantScope) -> Result<StatusCounts, StoreError> {
        (**self).status_counts(scope).await
    }

    async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>, StoreError> {
        (**self).list_documents(filter).await
    }
}
