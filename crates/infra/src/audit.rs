//! Structured audit trail for recovery activity.
//!
//! Audit events are write-only facts about what the coordinator did. They are
//! kept separate from operational logs so they can be shipped elsewhere.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use docflow_core::{DocumentId, TenantId};
use docflow_documents::{
    AttemptId, DocumentStatus, LeaseToken, LifecycleEvent, RecoveryOutcome, RecoveryStep,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    RecoveryStarted {
        attempt_id: AttemptId,
        document_id: DocumentId,
        at: DateTime<Utc>,
    },
    LeaseAcquired {
        attempt_id: AttemptId,
        document_id: DocumentId,
        token: LeaseToken,
        expires_at: DateTime<Utc>,
    },
    LeaseReleased {
        attempt_id: AttemptId,
        document_id: DocumentId,
        token: LeaseToken,
    },
    Transition {
        attempt_id: AttemptId,
        document_id: DocumentId,
        tenant_id: TenantId,
        from: DocumentStatus,
        to: DocumentStatus,
        event: LifecycleEvent,
        retry_count: u32,
    },
    StepCompleted {
        attempt_id: AttemptId,
        document_id: DocumentId,
        step: RecoveryStep,
        status: Option<DocumentStatus>,
    },
    RecoveryFinished {
        attempt_id: AttemptId,
        document_id: DocumentId,
        outcome: RecoveryOutcome,
        final_status: Option<DocumentStatus>,
        error: Option<String>,
        at: DateTime<Utc>,
    },
}

impl AuditEvent {
    pub fn document_id(&self) -> DocumentId {
        match self {
            AuditEvent::RecoveryStarted { document_id, .. }
            | AuditEvent::LeaseAcquired { document_id, .. }
            | AuditEvent::LeaseReleased { document_id, .. }
            | AuditEvent::Transition { document_id, .. }
            | AuditEvent::StepCompleted { document_id, .. }
            | AuditEvent::RecoveryFinished { document_id, .. } => *document_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::RecoveryStarted { .. } => "recovery_started",
            AuditEvent::LeaseAcquired { .. } => "lease_acquired",
            AuditEvent::LeaseReleased { .. } => "lease_released",
            AuditEvent::Transition { .. } => "transition",
            AuditEvent::StepCompleted { .. } => "step_completed",
            AuditEvent::RecoveryFinished { .. } => "recovery_finished",
        }
    }
}

/// Sink for audit events. Implementations must not fail the caller.
pub trait AuditSink: Send + Sync + 'static {
    fn record(&self, event: AuditEvent);
}

impl<A> AuditSink for Arc<A>
where
    A: AuditSink + ?Sized,
{
    fn record(&self, event: AuditEvent) {
        (**self).record(event)
    }
}

/// Writes audit events as structured `tracing` events under `docflow::audit`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        info!(
            target: "docflow::audit",
            kind = event.kind(),
            document_id = %event.document_id(),
            event = %payload,
            "audit"
        );
    }
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    inner: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn for_document(&self, id: DocumentId) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.document_id() == id)
            .collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event);
    }
}
