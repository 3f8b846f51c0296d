use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use docflow_core::DocumentId;
use docflow_documents::{Document, Lease, LeaseToken, StatusUpdate};

use super::r#trait::{
    CasCondition, DocumentFilter, DocumentStore, LeaseAcquisition, LeaseRequest, StaleDocument,
    StaleQuery, StatusCounts, StoreError, TenantScope,
};
use crate::clock::{Clock, SystemClock};

/// In-memory document store.
///
/// Intended for tests/dev. The clock is injected so document ages can be
/// controlled without sleeping.
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<DocumentId, Document>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InMemoryDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.documents.read().map(|d| d.len()).unwrap_or_default();
        f.debug_struct("InMemoryDocumentStore")
            .field("documents", &len)
            .finish()
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Flag a document as soft-deleted, as the external cleanup process would.
    pub fn soft_delete(&self, id: DocumentId) -> Result<bool, StoreError> {
        let mut docs = self.write()?;
        Ok(docs.get_mut(&id).map(|d| d.deleted = true).is_some())
    }

    /// Snapshot of a document including soft-deleted ones (test inspection).
    pub fn raw(&self, id: DocumentId) -> Option<Document> {
        self.documents.read().ok()?.get(&id).cloned()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<DocumentId, Document>>, StoreError> {
        self.documents
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<DocumentId, Document>>, StoreError> {
        self.documents
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }

    fn stale_documents(
        docs: &HashMap<DocumentId, Document>,
        query: &StaleQuery,
        now: DateTime<Utc>,
    ) -> Vec<StaleDocument> {
        let mut hits: Vec<StaleDocument> = docs
            .values()
            .filter(|d| !d.deleted && query.scope.contains(d.tenant_id))
            .filter_map(|d| {
                let (_, threshold) = query.thresholds.iter().find(|(s, _)| *s == d.status)?;
                let age = d.age(now);
                (age > *threshold).then(|| StaleDocument {
                    id: d.id,
                    tenant_id: d.tenant_id,
                    status: d.status,
                    last_modified_at: d.last_modified_at,
                    age,
                    leased: d.is_leased(now),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            a.last_modified_at
                .cmp(&b.last_modified_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        if let Some(limit) = query.limit {
            hits.truncate(limit);
        }
        hits
    }
}

#[async_trait::async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn now(&self) -> Result<DateTime<Utc>, StoreError> {
        Ok(self.clock.now())
    }

    async fn get(&self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        let docs = self.read()?;
        Ok(docs.get(&id).filter(|d| !d.deleted).cloned())
    }

    async fn insert(&self, document: Document) -> Result<(), StoreError> {
        document
            .validate()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let mut docs = self.write()?;
        if docs.contains_key(&document.id) {
            return Err(StoreError::Conflict(document.id));
        }
        docs.insert(document.id, document);
        Ok(())
    }

    async fn cas_update(
        &self,
        id: DocumentId,
        condition: CasCondition,
        update: &StatusUpdate,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut docs = self.write()?;
        let Some(doc) = docs.get_mut(&id).filter(|d| !d.deleted) else {
            return Ok(false);
        };
        if doc.status != condition.expected_status {
            return Ok(false);
        }
        if let Some(token) = condition.lease_token {
            if !doc.is_lease_holder(token, now) {
                return Ok(false);
            }
        }
        doc.apply(update, now);
        Ok(true)
    }

    async fn try_acquire_lease(
        &self,
        id: DocumentId,
        request: &LeaseRequest,
    ) -> Result<LeaseAcquisition, StoreError> {
        let now = self.clock.now();
        let mut docs = self.write()?;
        let Some(doc) = docs.get_mut(&id).filter(|d| !d.deleted) else {
            return Ok(LeaseAcquisition::NotFound);
        };

        if let Some(current) = doc.active_lease(now) {
            if current.token == request.token {
                return Ok(LeaseAcquisition::Acquired(current.clone()));
            }
            return Ok(LeaseAcquisition::Conflict(current.clone()));
        }

        let expires_at = now.checked_add_signed(request.ttl).ok_or_else(|| {
            StoreError::InvalidRequest(format!("lease TTL {} is out of range", request.ttl))
        })?;
        let lease = Lease {
            token: request.token,
            holder: request.holder.clone(),
            acquired_at: now,
            expires_at,
        };
        doc.lease = Some(lease.clone());
        Ok(LeaseAcquisition::Acquired(lease))
    }

    async fn release_lease(&self, id: DocumentId, token: LeaseToken) -> Result<bool, StoreError> {
        let mut docs = self.write()?;
        let Some(doc) = docs.get_mut(&id) else {
            return Ok(false);
        };
        if doc.lease.as_ref().is_some_and(|l| l.token == token) {
            doc.lease = None;
            return Ok(true);
        }
        Ok(false)
    }

    async fn query_by_status_age(
        &self,
        query: &StaleQuery,
    ) -> Result<Vec<StaleDocument>, StoreError> {
        let now = self.clock.now();
        let docs = self.read()?;
        Ok(Self::stale_documents(&docs, query, now))
    }

    async fn status_counts(&self, scope: TenantScope) -> Result<StatusCounts, StoreError> {
        let docs = self.read()?;
        Ok(docs
            .values()
            .filter(|d| !d.deleted && scope.contains(d.tenant_id))
            .map(|d| (d.status, 1))
            .collect())
    }

    async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>, StoreError> {
        let docs = self.read()?;
        let mut out: Vec<Document> = docs.values().filter(|d| filter.matches(d)).cloned().collect();
        out.sort_by(|a, b| {
            b.last_modified_at
                .cmp(&a.last_modified_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }
}
