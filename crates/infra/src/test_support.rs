//! Shared fixtures for the recovery tests.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;

use docflow_core::{DocumentId, TenantId};
use docflow_documents::{Document, DocumentStatus, LifecycleEvent};

use crate::gateway::{AttemptToken, Capability, GatewayError, ProcessingGateway};
use crate::store::{CasCondition, DocumentStore, InMemoryDocumentStore};

/// What the simulated worker runtime does with a dispatched document.
#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// Walk the document to `FINISHED` after the delay.
    Finish(Duration),
    /// Stop at `READY_FOR_VALIDATION` after the delay.
    AwaitReview(Duration),
    /// Move the document to `ERROR` after the delay.
    Fail(Duration),
    /// Accept the dispatch and never touch the document.
    Silent,
    /// Refuse outright.
    Reject,
}

/// Gateway that drives the in-memory store the way a worker would.
pub struct SimulatedGateway {
    store: Arc<InMemoryDocumentStore>,
    script: Script,
    unavailable_first: AtomicU32,
    calls: AtomicU32,
    accepted: AtomicU32,
    capabilities: Mutex<Vec<(DocumentId, Capability)>>,
}

impl SimulatedGateway {
    pub fn new(store: Arc<InMemoryDocumentStore>, script: Script) -> Self {
        Self {
            store,
            script,
            unavailable_first: AtomicU32::new(0),
            calls: AtomicU32::new(0),
            accepted: AtomicU32::new(0),
            capabilities: Mutex::new(Vec::new()),
        }
    }

    /// Answer `Unavailable` to the first `n` calls.
    pub fn unavailable_first(self, n: u32) -> Self {
        self.unavailable_first.store(n, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn accepted(&self) -> u32 {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Capability presented with the most recent dispatch of `document_id`.
    pub fn capability_for(&self, document_id: DocumentId) -> Option<Capability> {
        self.capabilities
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .rev()
            .find(|(id, _)| *id == document_id)
            .map(|(_, c)| *c)
    }
}

#[async_trait::async_trait]
impl ProcessingGateway for SimulatedGateway {
    async fn dispatch(
        &self,
        document_id: DocumentId,
        capability: &Capability,
    ) -> Result<AttemptToken, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.capabilities
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((document_id, *capability));
        let remaining = self.unavailable_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.unavailable_first.store(remaining - 1, Ordering::SeqCst);
            return Err(GatewayError::Unavailable("queue full".to_string()));
        }

        let (delay, events): (Duration, &'static [LifecycleEvent]) = match self.script {
            Script::Finish(d) => (
                d,
                &[
                    LifecycleEvent::Start,
                    LifecycleEvent::BeginValidation,
                    LifecycleEvent::BeginProcessing,
                    LifecycleEvent::AwaitReview,
                    LifecycleEvent::Finish,
                ],
            ),
            Script::AwaitReview(d) => (
                d,
                &[
                    LifecycleEvent::Start,
                    LifecycleEvent::BeginValidation,
                    LifecycleEvent::BeginProcessing,
                    LifecycleEvent::AwaitReview,
                ],
            ),
            Script::Fail(d) => (d, &[LifecycleEvent::Start, LifecycleEvent::Fail]),
            Script::Silent => (Duration::ZERO, &[]),
            Script::Reject => return Err(GatewayError::Rejected("unsupported document".to_string())),
        };
        self.accepted.fetch_add(1, Ordering::SeqCst);

        if !events.is_empty() {
            let store = Arc::clone(&self.store);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                for event in events {
                    let Ok(Some(doc)) = store.get(document_id).await else {
                        return;
                    };
                    let Ok(update) = doc.transition(*event) else {
                        return;
                    };
                    let _ = store
                        .cas_update(document_id, CasCondition::status(doc.status), &update)
                        .await;
                }
            });
        }
        Ok(AttemptToken::new())
    }
}

/// Insert a document that has been in `status` for `minutes`.
pub async fn seed(
    store: &InMemoryDocumentStore,
    tenant: TenantId,
    status: DocumentStatus,
    minutes: i64,
    retry_count: u32,
) -> Document {
    let now = store.now().await.unwrap_or_else(|_| Utc::now());
    let doc = Document::new(tenant, "invoice.pdf", now - chrono::Duration::days(1))
        .with_status(status, now - chrono::Duration::minutes(minutes))
        .with_retry_count(retry_count);
    store
        .insert(doc.clone())
        .await
        .unwrap_or_else(|e| panic!("seed failed: {e}"));
    doc
}
