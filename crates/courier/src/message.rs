//! Persisted rows: outbox messages, inbox records and the lease marker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::Envelope;

/// Lifecycle state of an outbox row, derived from its columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutboxStatus {
    /// Unsent and eligible for lease acquisition.
    Pending,
    /// Held by a dispatcher (in flight or waiting out a retry backoff).
    Leased,
    /// Published. Terminal.
    Sent,
    /// Retries exhausted or rejected by the broker. Terminal until requeued by an operator.
    Dead,
}

/// Time-bounded ownership claim on an outbox row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }
}

/// A message recorded for publication.
///
/// `sent_at` transitions from `None` to `Some` at most once. A row with
/// `sent_at` or `dead_at` set is never leased again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub endpoint: String,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub dead_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl OutboxMessage {
    /// A fresh, unsent row with a generated id.
    pub fn new(
        endpoint: impl Into<String>,
        message_type: impl Into<String>,
        payload: Vec<u8>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint: endpoint.into(),
            message_type: message_type.into(),
            payload,
            created_at,
            sent_at: None,
            dead_at: None,
            attempt_count: 0,
            lease_owner: None,
            lease_expires_at: None,
            last_error: None,
        }
    }

    pub fn status(&self, now: DateTime<Utc>) -> OutboxStatus {
        if self.dead_at.is_some() {
            OutboxStatus::Dead
        } else if self.sent_at.is_some() {
            OutboxStatus::Sent
        } else if self.lease().is_some_and(|lease| lease.is_active(now)) {
            OutboxStatus::Leased
        } else {
            OutboxStatus::Pending
        }
    }

    pub fn lease(&self) -> Option<Lease> {
        match (&self.lease_owner, self.lease_expires_at) {
            (Some(owner), Some(expires_at)) => Some(Lease {
                owner: owner.clone(),
                expires_at,
            }),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.sent_at.is_some() || self.dead_at.is_some()
    }

    /// Eligible for selection: unsent, not dead, and unleased or lease expired.
    pub fn is_leasable(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal() && self.lease().is_none_or(|lease| !lease.is_active(now))
    }

    /// Whether `owner` still holds the lease and the row awaits an outcome.
    pub fn is_owned_by(&self, owner: &str) -> bool {
        !self.is_terminal() && self.lease_owner.as_deref() == Some(owner)
    }

    pub(crate) fn take_lease(&mut self, owner: &str, expires_at: DateTime<Utc>) {
        self.lease_owner = Some(owner.to_string());
        self.lease_expires_at = Some(expires_at);
    }

    pub(crate) fn clear_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }

    pub(crate) fn record_sent(&mut self, sent_at: DateTime<Utc>) {
        self.attempt_count += 1;
        self.sent_at = Some(sent_at);
        self.last_error = None;
        self.clear_lease();
    }

    /// Keeps the lease but pushes its expiry out to `retry_at` so no instance
    /// picks the row up before the backoff elapses.
    pub(crate) fn record_retry(&mut self, retry_at: DateTime<Utc>, error: &str) {
        self.attempt_count += 1;
        self.lease_expires_at = Some(retry_at);
        self.last_error = Some(error.to_string());
    }

    pub(crate) fn record_dead(&mut self, dead_at: DateTime<Utc>, error: &str) {
        self.attempt_count += 1;
        self.dead_at = Some(dead_at);
        self.last_error = Some(error.to_string());
        self.clear_lease();
    }

    pub(crate) fn requeue(&mut self) {
        self.dead_at = None;
        self.attempt_count = 0;
        self.clear_lease();
    }

    /// The logical envelope handed to the broker.
    pub fn envelope(&self) -> Envelope {
        Envelope {
            id: self.id,
            message_type: self.message_type.clone(),
            payload: self.payload.clone(),
            occurred_at: self.created_at,
        }
    }
}

/// Marker that a message id has been handled on an endpoint.
///
/// At most one record exists per `(endpoint, message_id)`; its presence is
/// the only authority for "already handled".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxRecord {
    pub endpoint: String,
    pub message_id: Uuid,
    pub consumed_at: DateTime<Utc>,
}

impl InboxRecord {
    pub fn new(endpoint: impl Into<String>, message_id: Uuid, consumed_at: DateTime<Utc>) -> Self {
        Self {
            endpoint: endpoint.into(),
            message_id,
            consumed_at,
        }
    }
}
