//! Document status model: lifecycle states and the transition allow-list.
//!
//! Every status change goes through [`DocumentStatus::apply`], which looks the
//! `(current, event)` pair up in a single explicit table. Anything not in the
//! table is an [`InvalidTransition`] and the caller must leave the document
//! untouched.
//!
//! Status names are canonical upper snake case (`READY_FOR_VALIDATION`).
//! Parsing is case-insensitive so rows written by older tooling
//! (`'restarted'`, `'error'`) map onto the same variants.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use docflow_core::DomainError;

/// Lifecycle state of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DocumentStatus {
    Created,
    Running,
    Validating,
    Processing,
    ReadyForValidation,
    Finished,
    Error,
    Restarted,
    PermanentlyFailed,
}

impl DocumentStatus {
    pub const ALL: [DocumentStatus; 9] = [
        DocumentStatus::Created,
        DocumentStatus::Running,
        DocumentStatus::Validating,
        DocumentStatus::Processing,
        DocumentStatus::ReadyForValidation,
        DocumentStatus::Finished,
        DocumentStatus::Error,
        DocumentStatus::Restarted,
        DocumentStatus::PermanentlyFailed,
    ];

    /// States the stuck-item detector treats as resumable.
    pub const RESUMABLE: [DocumentStatus; 4] = [
        DocumentStatus::Restarted,
        DocumentStatus::Running,
        DocumentStatus::Validating,
        DocumentStatus::Processing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Created => "CREATED",
            DocumentStatus::Running => "RUNNING",
            DocumentStatus::Validating => "VALIDATING",
            DocumentStatus::Processing => "PROCESSING",
            DocumentStatus::ReadyForValidation => "READY_FOR_VALIDATION",
            DocumentStatus::Finished => "FINISHED",
            DocumentStatus::Error => "ERROR",
            DocumentStatus::Restarted => "RESTARTED",
            DocumentStatus::PermanentlyFailed => "PERMANENTLY_FAILED",
        }
    }

    /// States at which a recovery monitor stops polling.
    pub fn ends_monitoring(self) -> bool {
        matches!(
            self,
            DocumentStatus::ReadyForValidation
                | DocumentStatus::Finished
                | DocumentStatus::Error
                | DocumentStatus::PermanentlyFailed
        )
    }

    /// Monitor end states that count as a successful recovery.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            DocumentStatus::ReadyForValidation | DocumentStatus::Finished
        )
    }

    /// Intermediate states that may be reset once they have gone stale.
    pub fn is_resumable(self) -> bool {
        Self::RESUMABLE.contains(&self)
    }

    /// Look up the allow-list entry for `(self, event)`.
    pub fn apply(self, event: LifecycleEvent) -> Result<DocumentStatus, InvalidTransition> {
        use DocumentStatus as S;
        use LifecycleEvent as E;

        let next = match (self, event) {
            (S::Created | S::Restarted, E::Start) => S::Running,
            (S::Running, E::BeginValidation) => S::Validating,
            (S::Validating, E::BeginProcessing) => S::Processing,
            (S::Processing, E::AwaitReview) => S::ReadyForValidation,
            (S::ReadyForValidation, E::Finish) => S::Finished,
            (S::Created | S::Running | S::Validating | S::Processing | S::Restarted, E::Fail) => {
                S::Error
            }
            (S::Error | S::Running | S::Validating | S::Processing | S::Restarted, E::Restart) => {
                S::Restarted
            }
            (S::Restarted, E::ExhaustRetries) => S::PermanentlyFailed,
            (from, event) => return Err(InvalidTransition { from, event }),
        };
        Ok(next)
    }

    /// Apply several events in order, failing on the first illegal step.
    ///
    /// Used when one atomic write covers more than one logical transition
    /// (e.g. `Restart` followed by `ExhaustRetries`).
    pub fn apply_all(
        self,
        events: impl IntoIterator<Item = LifecycleEvent>,
    ) -> Result<DocumentStatus, InvalidTransition> {
        events
            .into_iter()
            .try_fold(self, |status, event| status.apply(event))
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        let status = match normalized.as_str() {
            "CREATED" | "PENDING" => DocumentStatus::Created,
            "RUNNING" => DocumentStatus::Running,
            "VALIDATING" => DocumentStatus::Validating,
            "PROCESSING" => DocumentStatus::Processing,
            "READY_FOR_VALIDATION" => DocumentStatus::ReadyForValidation,
            "FINISHED" => DocumentStatus::Finished,
            "ERROR" => DocumentStatus::Error,
            "RESTARTED" => DocumentStatus::Restarted,
            "PERMANENTLY_FAILED" => DocumentStatus::PermanentlyFailed,
            _ => {
                return Err(DomainError::validation(format!(
                    "unknown document status '{s}'"
                )));
            }
        };
        Ok(status)
    }
}

impl TryFrom<String> for DocumentStatus {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, DomainError> {
        value.parse()
    }
}

impl From<DocumentStatus> for String {
    fn from(value: DocumentStatus) -> Self {
        value.as_str().to_string()
    }
}

/// Events that drive status transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Worker picked the document up.
    Start,
    BeginValidation,
    BeginProcessing,
    /// Extraction done; waiting for a human review.
    AwaitReview,
    Finish,
    Fail,
    /// Recovery reset.
    Restart,
    /// Retry ceiling reached.
    ExhaustRetries,
}

impl LifecycleEvent {
    pub const ALL: [LifecycleEvent; 8] = [
        LifecycleEvent::Start,
        LifecycleEvent::BeginValidation,
        LifecycleEvent::BeginProcessing,
        LifecycleEvent::AwaitReview,
        LifecycleEvent::Finish,
        LifecycleEvent::Fail,
        LifecycleEvent::Restart,
        LifecycleEvent::ExhaustRetries,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleEvent::Start => "start",
            LifecycleEvent::BeginValidation => "begin_validation",
            LifecycleEvent::BeginProcessing => "begin_processing",
            LifecycleEvent::AwaitReview => "await_review",
            LifecycleEvent::Finish => "finish",
            LifecycleEvent::Fail => "fail",
            LifecycleEvent::Restart => "restart",
            LifecycleEvent::ExhaustRetries => "exhaust_retries",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(state, event)` pair that is not in the allow-list.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[error("invalid transition: {event} is not allowed from {from}")]
pub struct InvalidTransition {
    pub from: DocumentStatus,
    pub event: LifecycleEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn happy_path_reaches_finished() {
        let finished = DocumentStatus::Created
            .apply_all([
                LifecycleEvent::Start,
                LifecycleEvent::BeginValidation,
                LifecycleEvent::BeginProcessing,
                LifecycleEvent::AwaitReview,
                LifecycleEvent::Finish,
            ])
            .unwrap();
        assert_eq!(finished, DocumentStatus::Finished);
    }

    #[test]
    fn restarted_documents_run_again() {
        assert_eq!(
            DocumentStatus::Restarted.apply(LifecycleEvent::Start),
            Ok(DocumentStatus::Running)
        );
    }

    #[test]
    fn finished_documents_cannot_be_restarted() {
        let err = DocumentStatus::Finished
            .apply(LifecycleEvent::Restart)
            .unwrap_err();
        assert_eq!(err.from, DocumentStatus::Finished);
        assert_eq!(err.event, LifecycleEvent::Restart);
    }

    #[test]
    fn permanently_failed_is_only_reachable_through_restarted() {
        assert!(DocumentStatus::Error.apply(LifecycleEvent::ExhaustRetries).is_err());
        assert_eq!(
            DocumentStatus::Error
                .apply_all([LifecycleEvent::Restart, LifecycleEvent::ExhaustRetries]),
            Ok(DocumentStatus::PermanentlyFailed)
        );
    }

    #[test]
    fn permanently_failed_is_a_dead_end() {
        for event in LifecycleEvent::ALL {
            assert!(DocumentStatus::PermanentlyFailed.apply(event).is_err());
        }
    }

    #[test]
    fn parsing_ignores_case_and_legacy_spellings() {
        assert_eq!("restarted".parse(), Ok(DocumentStatus::Restarted));
        assert_eq!("RESTARTED".parse(), Ok(DocumentStatus::Restarted));
        assert_eq!("error".parse(), Ok(DocumentStatus::Error));
        assert_eq!(
            "ready_for_validation".parse(),
            Ok(DocumentStatus::ReadyForValidation)
        );
        assert_eq!("pending".parse(), Ok(DocumentStatus::Created));
        assert!("exploded".parse::<DocumentStatus>().is_err());
    }

    #[test]
    fn serde_uses_canonical_names_and_accepts_lowercase() {
        let json = serde_json::to_string(&DocumentStatus::ReadyForValidation).unwrap();
        assert_eq!(json, "\"READY_FOR_VALIDATION\"");

        let parsed: DocumentStatus = serde_json::from_str("\"processing\"").unwrap();
        assert_eq!(parsed, DocumentStatus::Processing);
    }

    fn any_status() -> impl Strategy<Value = DocumentStatus> {
        prop::sample::select(DocumentStatus::ALL.to_vec())
    }

    fn any_event() -> impl Strategy<Value = LifecycleEvent> {
        prop::sample::select(LifecycleEvent::ALL.to_vec())
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: RESTARTED is entered only from ERROR or a resumable state.
        #[test]
        fn restarted_has_restricted_predecessors(from in any_status(), event in any_event()) {
            if let Ok(DocumentStatus::Restarted) = from.apply(event) {
                prop_assert!(from == DocumentStatus::Error || from.is_resumable());
            }
        }

        /// Property: PERMANENTLY_FAILED is entered only from RESTARTED.
        #[test]
        fn permanently_failed_has_one_predecessor(from in any_status(), event in any_event()) {
            if let Ok(DocumentStatus::PermanentlyFailed) = from.apply(event) {
                prop_assert_eq!(from, DocumentStatus::Restarted);
            }
        }

        /// Property: rejected transitions report the exact pair that was attempted.
        #[test]
        fn rejections_echo_the_request(from in any_status(), event in any_event()) {
            if let Err(err) = from.apply(event) {
                prop_assert_eq!(err, InvalidTransition { from, event });
            }
        }

        /// Property: any event sequence from CREATED stays inside the allow-list
        /// and never leaves FINISHED or PERMANENTLY_FAILED once entered.
        #[test]
        fn terminal_states_are_sticky(events in prop::collection::vec(any_event(), 1..20)) {
            let mut status = DocumentStatus::Created;
            for event in events {
                let was_terminal = matches!(
                    status,
                    DocumentStatus::Finished | DocumentStatus::PermanentlyFailed
                );
                if let Ok(next) = status.apply(event) {
                    prop_assert!(!was_terminal);
                    status = next;
                }
            }
        }
    }
}
