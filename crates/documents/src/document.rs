//! The document record and the status updates applied to it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use docflow_core::{DocumentId, DomainError, DomainResult, TenantId, UserId};

use crate::lease::{Lease, LeaseToken};
use crate::status::{DocumentStatus, InvalidTransition, LifecycleEvent};

/// Opaque handle to extracted/processing data owned by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadRef(pub String);

/// Structured record of the most recent processing failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub kind: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl LastError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            occurred_at,
        }
    }
}

/// Processing breadcrumbs left by the gateway, surfaced during analysis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingTrace {
    /// Processing modules that completed, in order.
    #[serde(default)]
    pub modules: Vec<String>,
    pub doc_type: Option<String>,
    pub extraction_type: Option<String>,
    /// Ingestion channel (upload, email, API...).
    pub source: Option<String>,
}

/// A document tracked through the processing lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub tenant_id: TenantId,
    pub owner: Option<UserId>,
    pub filename: String,
    pub status: DocumentStatus,
    pub created_at: DateTime<Utc>,
    /// Non-decreasing; bumped on every status change.
    pub last_modified_at: DateTime<Utc>,
    pub restart_allowed: bool,
    pub retry_count: u32,
    pub payload_ref: Option<PayloadRef>,
    pub last_error: Option<LastError>,
    #[serde(default)]
    pub trace: ProcessingTrace,
    pub lease: Option<Lease>,
    /// Soft-deletion flag owned by an external process.
    #[serde(default)]
    pub deleted: bool,
}

impl Document {
    /// Create a freshly ingested document in `CREATED`.
    pub fn new(tenant_id: TenantId, filename: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: DocumentId::new(),
            tenant_id,
            owner: None,
            filename: filename.into(),
            status: DocumentStatus::Created,
            created_at: now,
            last_modified_at: now,
            restart_allowed: true,
            retry_count: 0,
            payload_ref: None,
            last_error: None,
            trace: ProcessingTrace::default(),
            lease: None,
            deleted: false,
        }
    }

    pub fn with_id(mut self, id: DocumentId) -> Self {
        self.id = id;
        self
    }

    pub fn with_owner(mut self, owner: UserId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Place the document in an arbitrary state, e.g. when loading fixtures.
    pub fn with_status(mut self, status: DocumentStatus, last_modified_at: DateTime<Utc>) -> Self {
        self.status = status;
        self.last_modified_at = last_modified_at;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_restart_allowed(mut self, restart_allowed: bool) -> Self {
        self.restart_allowed = restart_allowed;
        self
    }

    pub fn with_error(mut self, error: LastError) -> Self {
        self.last_error = Some(error);
        self
    }

    pub fn with_trace(mut self, trace: ProcessingTrace) -> Self {
        self.trace = trace;
        self
    }

    /// Check record-level invariants before the document enters a store.
    pub fn validate(&self) -> DomainResult<()> {
        if self.filename.trim().is_empty() {
            return Err(DomainError::validation("filename must not be empty"));
        }
        if self.last_modified_at < self.created_at {
            return Err(DomainError::invariant(format!(
                "document {} was modified ({}) before it was created ({})",
                self.id, self.last_modified_at, self.created_at
            )));
        }
        Ok(())
    }

    /// Time spent in the current status, measured against `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_modified_at
    }

    /// The lease, if one is present and not yet expired.
    pub fn active_lease(&self, now: DateTime<Utc>) -> Option<&Lease> {
        self.lease.as_ref().filter(|l| l.is_active(now))
    }

    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.active_lease(now).is_some()
    }

    pub fn is_lease_holder(&self, token: LeaseToken, now: DateTime<Utc>) -> bool {
        self.lease
            .as_ref()
            .is_some_and(|l| l.is_held_by(token, now))
    }

    /// Plan a plain status transition driven by `event`.
    pub fn transition(&self, event: LifecycleEvent) -> Result<StatusUpdate, InvalidTransition> {
        let next = self.status.apply(event)?;
        Ok(StatusUpdate::new(next, event))
    }

    /// Plan a recovery reset: `RESTARTED`, one more retry, gate left open.
    pub fn restart(&self) -> Result<StatusUpdate, InvalidTransition> {
        Ok(self
            .transition(LifecycleEvent::Restart)?
            .with_retry_count(self.retry_count.saturating_add(1))
            .with_restart_allowed(true))
    }

    /// Plan the terminal write used when the retry ceiling is reached.
    ///
    /// Validated as `Restart` then `ExhaustRetries` but written as a single
    /// update, so no `RESTARTED` row without an incremented counter is ever
    /// visible. Only the status changes.
    pub fn exhaust_retries(&self) -> Result<StatusUpdate, InvalidTransition> {
        let next = self
            .status
            .apply_all([LifecycleEvent::Restart, LifecycleEvent::ExhaustRetries])?;
        Ok(StatusUpdate::new(next, LifecycleEvent::ExhaustRetries))
    }

    /// Plan a failure transition recording `error`.
    pub fn fail(&self, error: LastError) -> Result<StatusUpdate, InvalidTransition> {
        Ok(self.transition(LifecycleEvent::Fail)?.with_error(error))
    }

    /// Apply an update in place. `last_modified_at` never moves backwards.
    pub fn apply(&mut self, update: &StatusUpdate, now: DateTime<Utc>) {
        self.status = update.status;
        if let Some(retry_count) = update.retry_count {
            self.retry_count = retry_count;
        }
        if let Some(restart_allowed) = update.restart_allowed {
            self.restart_allowed = restart_allowed;
        }
        match &update.last_error {
            ErrorUpdate::Keep => {}
            ErrorUpdate::Set(error) => self.last_error = Some(error.clone()),
        }
        if now > self.last_modified_at {
            self.last_modified_at = now;
        }
    }
}

/// What happens to `last_error` when an update is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "error", rename_all = "snake_case")]
pub enum ErrorUpdate {
    #[default]
    Keep,
    Set(LastError),
}

/// New field values written by a compare-and-swap on `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: DocumentStatus,
    /// The lifecycle event that justified the change (for audit).
    pub event: LifecycleEvent,
    pub retry_count: Option<u32>,
    pub restart_allowed: Option<bool>,
    #[serde(default)]
    pub last_error: ErrorUpdate,
}

impl StatusUpdate {
    pub fn new(status: DocumentStatus, event: LifecycleEvent) -> Self {
        Self {
            status,
            event,
            retry_count: None,
            restart_allowed: None,
            last_error: ErrorUpdate::Keep,
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_restart_allowed(mut self, restart_allowed: bool) -> Self {
        self.restart_allowed = Some(restart_allowed);
        self
    }

    pub fn with_error(mut self, error: LastError) -> Self {
        self.last_error = ErrorUpdate::Set(error);
        self
    }
}
