//! Storage capabilities: transactions, the outbox table and the inbox table.
//!
//! Stores are pure data access. Every policy decision (when to retry, when to
//! dead-letter, what counts as a duplicate) lives in the dispatcher and the
//! inbox guard. A store instance is scoped to one logical endpoint, so several
//! independent outboxes and inboxes can share one storage engine.
//!
//! An outbox store and an inbox store built over the same backend share a
//! transaction type. That is what lets a consumer handler append outbound
//! messages in the same transaction that records the inbound one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;
use crate::message::{InboxRecord, OutboxMessage};

/// An open unit of work. Commit is all-or-nothing; rollback (or drop) leaves
/// no partial effect.
#[async_trait]
pub trait Transaction: Send + Sized + 'static {
    async fn commit(self) -> Result<(), StorageError>;

    async fn rollback(self) -> Result<(), StorageError>;
}

/// A source of transactions.
#[async_trait]
pub trait Storage: Send + Sync {
    type Tx: Transaction;

    async fn begin(&self) -> Result<Self::Tx, StorageError>;
}

/// Parameters for one atomic lease acquisition.
#[derive(Debug, Clone)]
pub struct LeaseRequest<'a> {
    pub owner: &'a str,
    pub now: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub limit: usize,
}

/// Row counts by lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub leased: u64,
    pub sent: u64,
    pub dead: u64,
}

#[async_trait]
pub trait OutboxStore: Storage {
    /// The logical endpoint this store is scoped to.
    fn endpoint(&self) -> &str;

    /// Stage a new row inside the caller's transaction.
    async fn insert(&self, tx: &mut Self::Tx, message: &OutboxMessage) -> Result<(), StorageError>;

    /// Atomically select up to `limit` leasable rows, oldest first, and stamp
    /// them with the caller's lease.
    ///
    /// This is the only mutual-exclusion point between dispatcher instances:
    /// two concurrent calls never return the same row while its lease is active.
    async fn acquire_leases(
        &self,
        request: LeaseRequest<'_>,
    ) -> Result<Vec<OutboxMessage>, StorageError>;

    /// Record a successful publish. Returns `false` if `owner` no longer holds
    /// the lease or the row is already terminal.
    async fn mark_sent(
        &self,
        id: Uuid,
        owner: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    /// Record a retryable failure: bump the attempt count and hold the lease
    /// until `retry_at`.
    async fn record_failure(
        &self,
        id: Uuid,
        owner: &str,
        retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, StorageError>;

    /// Record a final failure and move the row to the dead state.
    async fn mark_dead(
        &self,
        id: Uuid,
        owner: &str,
        dead_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, StorageError>;

    /// Clear leases still held by `owner` on the given unsent rows.
    async fn release(&self, ids: &[Uuid], owner: &str) -> Result<u64, StorageError>;

    async fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>, StorageError>;

    async fn stats(&self, now: DateTime<Utc>) -> Result<OutboxStats, StorageError>;

    /// Dead rows, oldest first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<OutboxMessage>, StorageError>;

    /// Return a dead row to pending with a fresh attempt budget.
    async fn requeue_dead(&self, id: Uuid) -> Result<bool, StorageError>;

    /// Delete sent rows published before `older_than`. Dead rows are kept.
    async fn prune_sent(&self, older_than: DateTime<Utc>) -> Result<u64, StorageError>;
}

/// Result of inserting an inbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record for this message id already exists.
    AlreadyExists,
}

#[async_trait]
pub trait InboxStore: Storage {
    fn endpoint(&self) -> &str;

    async fn contains(&self, tx: &mut Self::Tx, message_id: Uuid) -> Result<bool, StorageError>;

    async fn insert(
        &self,
        tx: &mut Self::Tx,
        record: &InboxRecord,
    ) -> Result<InsertOutcome, StorageError>;

    /// Delete records consumed before `older_than`.
    async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64, StorageError>;
}
