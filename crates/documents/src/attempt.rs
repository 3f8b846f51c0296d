//! Per-run recovery attempt record.
//!
//! One `RecoveryAttempt` is created for every coordinator run against a
//! document. It is never shared between runs; the retry counter on the
//! document is what survives across attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use docflow_core::DocumentId;

use crate::lease::LeaseToken;
use crate::status::DocumentStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(Uuid);

impl AttemptId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for AttemptId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// The four phases a recovery run moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStep {
    Analyze,
    Reset,
    Dispatch,
    Monitor,
}

impl RecoveryStep {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryStep::Analyze => "analyze",
            RecoveryStep::Reset => "reset",
            RecoveryStep::Dispatch => "dispatch",
            RecoveryStep::Monitor => "monitor",
        }
    }
}

impl core::fmt::Display for RecoveryStep {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// The document reached a success status while monitored.
    Success,
    /// Recovery could not proceed, or the document landed in a failure status.
    Failure,
    /// The monitor window elapsed without a terminal status.
    TimedOut,
    /// The run was cancelled; the document may still be processing.
    Cancelled,
}

impl RecoveryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryOutcome::Success => "success",
            RecoveryOutcome::Failure => "failure",
            RecoveryOutcome::TimedOut => "timed_out",
            RecoveryOutcome::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for RecoveryOutcome {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timestamped note recorded when a step finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: RecoveryStep,
    pub at: DateTime<Utc>,
    /// Status observed when the step completed.
    pub status: Option<DocumentStatus>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub id: AttemptId,
    pub document_id: DocumentId,
    pub lease_token: Option<LeaseToken>,
    pub started_at: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
    pub outcome: Option<RecoveryOutcome>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RecoveryAttempt {
    pub fn start(document_id: DocumentId, now: DateTime<Utc>) -> Self {
        Self {
            id: AttemptId::new(),
            document_id,
            lease_token: None,
            started_at: now,
            steps: Vec::new(),
            outcome: None,
            finished_at: None,
        }
    }

    pub fn record_step(
        &mut self,
        step: RecoveryStep,
        at: DateTime<Utc>,
        status: Option<DocumentStatus>,
        detail: Option<String>,
    ) {
        self.steps.push(StepRecord {
            step,
            at,
            status,
            detail,
        });
    }

    pub fn has_completed(&self, step: RecoveryStep) -> bool {
        self.steps.iter().any(|s| s.step == step)
    }

    /// The furthest step reached so far.
    pub fn last_step(&self) -> Option<RecoveryStep> {
        self.steps.iter().map(|s| s.step).max()
    }

    /// Record the final outcome. The first call wins.
    pub fn finish(&mut self, outcome: RecoveryOutcome, at: DateTime<Utc>) {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
            self.finished_at = Some(at);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }
}
