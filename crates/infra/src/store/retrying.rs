use chrono::{DateTime, Utc};

use docflow_core::DocumentId;
use docflow_documents::{Document, LeaseToken, StatusUpdate};

use super::r#trait::{
    CasCondition, DocumentFilter, DocumentStore, LeaseAcquisition, LeaseRequest, StaleDocument,
    StaleQuery, StatusCounts, StoreError, TenantScope,
};
use crate::retry::{RetryPolicy, retry_with_backoff};

/// Decorator that retries transient store failures with backoff.
///
/// Only `StoreError::Unavailable` is retried. Logical outcomes (a failed CAS,
/// a lease conflict) are successful calls and pass straight through, so the
/// coordinator never has to retry anything itself.
#[derive(Debug, Clone)]
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait::async_trait]
impl<S> DocumentStore for RetryingStore<S>
where
    S: DocumentStore,
{
    async fn now(&self) -> Result<DateTime<Utc>, StoreError> {
        retry_with_backoff(&self.policy, "store.now", StoreError::is_retryable, || {
            self.inner.now()
        })
        .await
        .0
    }

    async fn get(&self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        retry_with_backoff(&self.policy, "store.get", StoreError::is_retryable, || {
            self.inner.get(id)
        })
        .await
        .0
    }

    async fn insert(&self, document: Document) -> Result<(), StoreError> {
        retry_with_backoff(&self.policy, "store.insert", StoreError::is_retryable, || {
            self.inner.insert(document.clone())
        })
        .await
        .0
    }

    // A retried CAS whose first try landed will report `false`; callers
    // re-read and see the status already changed.
    async fn cas_update(
        &self,
        id: DocumentId,
        condition: CasCondition,
        update: &StatusUpdate,
    ) -> Result<bool, StoreError> {
        retry_with_backoff(&self.policy, "store.cas_update", StoreError::is_retryable, || {
            self.inner.cas_update(id, condition, update)
        })
        .await
        .0
    }

    async fn try_acquire_lease(
        &self,
        id: DocumentId,
        request: &LeaseRequest,
    ) -> Result<LeaseAcquisition, StoreError> {
        retry_with_backoff(
            &self.policy,
            "store.try_acquire_lease",
            StoreError::is_retryable,
            || self.inner.try_acquire_lease(id, request),
        )
        .await
        .0
    }

    async fn release_lease(&self, id: DocumentId, token: LeaseToken) -> Result<bool, StoreError> {
        retry_with_backoff(&self.policy, "store.release_lease", StoreError::is_retryable, || {
            self.inner.release_lease(id, token)
        })
        .await
        .0
    }

    async fn query_by_status_age(
        &self,
        query: &StaleQuery,
    ) -> Result<Vec<StaleDocument>, StoreError> {
        retry_with_backoff(
            &self.policy,
            "store.query_by_status_age",
            StoreError::is_retryable,
            || self.inner.query_by_status_age(query),
        )
        .await
        .0
    }

    async fn status_counts(&self, scope: TenantScope) -> Result<StatusCounts, StoreError> {
        retry_with_backoff(&self.policy, "store.status_counts", StoreError::is_retryable, || {
            self.inner.status_counts(scope)
        })
        .await
        .0
    }

    async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>, StoreError> {
        retry_with_backoff(&self.policy, "store.list_documents", StoreError::is_retryable, || {
            self.inner.list_documents(filter)
        })
        .await
        .0
    }
}
