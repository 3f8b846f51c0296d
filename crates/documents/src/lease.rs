//! Recovery leases: the per-document mutual-exclusion token.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque lease token written to the document row while a recovery runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Lease metadata stored alongside the document.
///
/// A lease whose `expires_at` has passed is treated as absent, so a crashed
/// coordinator never blocks a document for longer than the TTL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub token: LeaseToken,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(holder: impl Into<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            token: LeaseToken::new(),
            holder: holder.into(),
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.expires_at - self.acquired_at
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn is_held_by(&self, token: LeaseToken, now: DateTime<Utc>) -> bool {
        self.token == token && self.is_active(now)
    }
}
