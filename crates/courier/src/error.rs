//! Error taxonomy.
//!
//! Storage failures always propagate and abort the operation in progress.
//! Broker failures carry a [`FailureKind`] so the dispatcher can choose between
//! scheduling a retry and dead-lettering. Handler failures roll back the
//! consumer's transaction and are surfaced to the broker for redelivery.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Failure reported by an outbox/inbox store or its transaction.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {reason}")]
    Unavailable { reason: String },

    /// A uniqueness constraint rejected the write.
    ///
    /// For the inbox table this means another delivery of the same message
    /// committed first.
    #[error("duplicate key in {table}: {key}")]
    Duplicate { table: &'static str, key: String },

    #[error("storage lock poisoned during {0}")]
    LockPoisoned(&'static str),

    #[error("database error: {reason}")]
    Database { reason: String },

    #[error("not found: {reason}")]
    NotFound { reason: String },
}

impl StorageError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn database(reason: impl Into<String>) -> Self {
        Self::Database {
            reason: reason.into(),
        }
    }

    /// Whether the error came from a uniqueness constraint.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// How a failed publish should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient failure: schedule a retry with backoff.
    Retryable,
    /// The broker will never accept this message: dead-letter it.
    NonRetryable,
}

/// Failure reported by a [`BrokerClient`](crate::BrokerClient) or
/// [`BrokerReceiver`](crate::BrokerReceiver).
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("transient broker failure: {reason}")]
    Transient { reason: String },

    #[error("broker rejected message: {reason}")]
    Permanent { reason: String },

    #[error("send timed out after {0:?}")]
    Timeout(Duration),
}

impl BrokerError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }

    /// Timeouts are ambiguous (the send may have landed) and are retried.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transient { .. } | Self::Timeout(_) => FailureKind::Retryable,
            Self::Permanent { .. } => FailureKind::NonRetryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == FailureKind::Retryable
    }
}

/// Umbrella error for writer, guard, dispatcher and consumer operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CourierError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("handler failed for message {message_id}: {source}")]
    Handler {
        message_id: Uuid,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {reason}")]
    Config { reason: String },
}

impl CourierError {
    pub fn invalid_message(reason: impl Into<String>) -> Self {
        Self::InvalidMessage {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(err) => !err.is_duplicate(),
            Self::Broker(err) => err.is_retryable(),
            Self::Handler { .. } => true,
            Self::InvalidMessage { .. } | Self::Serialization(_) | Self::Config { .. } => false,
        }
    }
}

pub type Result<T, E = CourierError> = std::result::Result<T, E>;
