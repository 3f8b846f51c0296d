//! Processing gateway boundary.
//!
//! The gateway performs the actual extraction/validation work. The
//! coordinator only hands it a document and a capability; progress is
//! observed afterwards through the document store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use docflow_core::{DocumentId, TenantId, UserId};

/// Authorization handed to the gateway: which tenant, acting as whom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capability {
    pub tenant_id: TenantId,
    pub actor: UserId,
}

impl Capability {
    pub fn new(tenant_id: TenantId, actor: UserId) -> Self {
        Self { tenant_id, actor }
    }
}

/// Gateway-issued acknowledgement of an accepted dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptToken(Uuid);

impl AttemptToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AttemptToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AttemptToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Transient: the gateway could not accept work right now.
    #[error("processing gateway unavailable: {0}")]
    Unavailable(String),

    /// Permanent: the gateway refused this request.
    #[error("processing gateway rejected dispatch: {0}")]
    Rejected(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

/// Accepts documents for processing. Fire-and-forget: `dispatch` returns as
/// soon as the work is acknowledged, not when processing completes.
#[async_trait::async_trait]
pub trait ProcessingGateway: Send + Sync {
    async fn dispatch(
        &self,
        document_id: DocumentId,
        capability: &Capability,
    ) -> Result<AttemptToken, GatewayError>;
}

#[async_trait::async_trait]
impl<G> ProcessingGateway for Arc<G>
where
    G: ProcessingGateway + ?Sized,
{
    async fn dispatch(
        &self,
        document_id: DocumentId,
        capability: &Capability,
    ) -> Result<AttemptToken, GatewayError> {
        (**self).dispatch(document_id, capability).await
    }
}

/// A unit of work as seen by the external worker runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub attempt: AttemptToken,
    pub document_id: DocumentId,
    pub capability: Capability,
    pub enqueued_at: DateTime<Utc>,
}

/// Gateway backed by a bounded tokio channel.
///
/// The receiving half belongs to the worker runtime. A full queue is
/// reported as `Unavailable` so dispatch backoff applies; a closed queue
/// means the consumer is gone and is `Rejected`.
#[derive(Debug, Clone)]
pub struct QueueGateway {
    tx: mpsc::Sender<DispatchRequest>,
}

impl QueueGateway {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DispatchRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl ProcessingGateway for QueueGateway {
    async fn dispatch(
        &self,
        document_id: DocumentId,
        capability: &Capability,
    ) -> Result<AttemptToken, GatewayError> {
        let request = DispatchRequest {
            attempt: AttemptToken::new(),
            document_id,
            capability: *capability,
            enqueued_at: Utc::now(),
        };
        let attempt = request.attempt;

        self.tx.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                GatewayError::Unavailable("dispatch queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                GatewayError::Rejected("dispatch queue is closed".to_string())
            }
        })?;

        debug!(document_id = %document_id, attempt = %attempt, "document enqueued for processing");
        Ok(attempt)
    }
}
