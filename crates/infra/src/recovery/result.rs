use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use docflow_core::{DocumentId, UserId};
use docflow_documents::{
    Document, DocumentStatus, InvalidTransition, LastError, RecoveryAttempt, RecoveryOutcome,
};

use crate::gateway::GatewayError;
use crate::store::StoreError;

/// Why a recovery run could not complete normally.
///
/// `TimedOut` and `Cancelled` are outcomes, not errors; see [`RecoveryOutcome`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("document {0} not found")]
    NotFound(DocumentId),

    #[error("document {document_id}: {source}")]
    InvalidTransition {
        document_id: DocumentId,
        #[source]
        source: InvalidTransition,
    },

    #[error("document {document_id} is leased by {holder} until {expires_at}")]
    LeaseConflict {
        document_id: DocumentId,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    #[error("document {document_id} reached the retry ceiling ({retry_count}/{ceiling})")]
    RetryCeilingExceeded {
        document_id: DocumentId,
        retry_count: u32,
        ceiling: u32,
    },

    #[error("document {0} does not allow restarts")]
    RestartNotAllowed(DocumentId),

    #[error("document {document_id} changed concurrently (expected {expected}, found {found:?})")]
    StatusChanged {
        document_id: DocumentId,
        expected: DocumentStatus,
        found: Option<DocumentStatus>,
    },

    #[error("dispatch of document {document_id} failed after {attempts} attempt(s): {source}")]
    DispatchFailed {
        document_id: DocumentId,
        attempts: u32,
        #[source]
        source: GatewayError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("recovery task for document {document_id} failed: {reason}")]
    TaskFailed {
        document_id: DocumentId,
        reason: String,
    },
}

impl RecoveryError {
    pub fn kind(&self) -> &'static str {
        match self {
            RecoveryError::NotFound(_) => "not_found",
            RecoveryError::InvalidTransition { .. } => "invalid_transition",
            RecoveryError::LeaseConflict { .. } => "lease_conflict",
            RecoveryError::RetryCeilingExceeded { .. } => "retry_ceiling_exceeded",
            RecoveryError::RestartNotAllowed(_) => "restart_not_allowed",
            RecoveryError::StatusChanged { .. } => "status_changed",
            RecoveryError::DispatchFailed { .. } => "dispatch_failed",
            RecoveryError::Store(_) => "store",
            RecoveryError::TaskFailed { .. } => "task_failed",
        }
    }
}

/// What Analyze learned about the document before touching it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub filename: String,
    pub status: DocumentStatus,
    pub retry_count: u32,
    pub restart_allowed: bool,
    pub owner: Option<UserId>,
    pub processed_modules: Vec<String>,
    pub doc_type: Option<String>,
    pub extraction_type: Option<String>,
    pub source: Option<String>,
    pub last_error: Option<LastError>,
    pub last_modified_at: DateTime<Utc>,
    /// Time in the current status at analysis, by the store clock.
    pub seconds_in_status: i64,
}

impl Diagnostics {
    pub fn from_document(doc: &Document, now: DateTime<Utc>) -> Self {
        Self {
            filename: doc.filename.clone(),
            status: doc.status,
            retry_count: doc.retry_count,
            restart_allowed: doc.restart_allowed,
            owner: doc.owner,
            processed_modules: doc.trace.modules.clone(),
            doc_type: doc.trace.doc_type.clone(),
            extraction_type: doc.trace.extraction_type.clone(),
            source: doc.trace.source.clone(),
            last_error: doc.last_error.clone(),
            last_modified_at: doc.last_modified_at,
            seconds_in_status: doc.age(now).num_seconds().max(0),
        }
    }
}

/// Result of one `recover` call. Always returned, never thrown.
#[derive(Debug, Clone)]
pub struct RecoveryResult {
    pub document_id: DocumentId,
    pub attempt: RecoveryAttempt,
    pub outcome: RecoveryOutcome,
    /// Last status observed by the coordinator.
    pub final_status: Option<DocumentStatus>,
    pub error: Option<RecoveryError>,
    pub diagnostics: Option<Diagnostics>,
}

impl RecoveryResult {
    pub fn is_success(&self) -> bool {
        self.outcome == RecoveryOutcome::Success
    }

    /// Whether the gateway was handed the document during this run.
    pub fn dispatched(&self) -> bool {
        self.attempt
            .has_completed(docflow_documents::RecoveryStep::Dispatch)
    }

    /// A result for a run that never got to execute (e.g. a panicked task).
    pub fn aborted(document_id: DocumentId, error: RecoveryError, at: DateTime<Utc>) -> Self {
        let mut attempt = RecoveryAttempt::start(document_id, at);
        attempt.finish(RecoveryOutcome::Failure, at);
        Self {
            document_id,
            attempt,
            outcome: RecoveryOutcome::Failure,
            final_status: None,
            error: Some(error),
            diagnostics: None,
        }
    }
}
