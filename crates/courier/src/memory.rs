//! In-memory storage backend.
//!
//! One [`MemoryBackend`] holds the outbox, inbox and generic business tables
//! for every endpoint behind a single lock. A [`MemoryTx`] stages writes and
//! applies them all at once on commit, after checking uniqueness, so a commit
//! either lands completely or not at all. Dropping a transaction discards it,
//! which is how a crash before commit looks to this backend.
//!
//! Useful for tests, demos, and for the in-process variant of the pattern
//! where durability is not required but "record before declaring success" is.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StorageError;
use crate::message::{InboxRecord, OutboxMessage, OutboxStatus};
use crate::store::{
    InboxStore, InsertOutcome, LeaseRequest, OutboxStats, OutboxStore, Storage, Transaction,
};

/// An operation that can be made to fail once, for exercising error paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Begin,
    Commit,
    OutboxInsert,
    AcquireLeases,
    MarkSent,
    RecordFailure,
    MarkDead,
    InboxInsert,
}

#[derive(Debug, Default)]
struct Tables {
    outbox: Vec<OutboxMessage>,
    inbox: HashMap<(String, Uuid), InboxRecord>,
    rows: HashMap<(String, String), serde_json::Value>,
    faults: Vec<FaultPoint>,
}

impl Tables {
    fn trip(&mut self, point: FaultPoint) -> Result<(), StorageError> {
        match self.faults.iter().position(|fault| *fault == point) {
            Some(index) => {
                self.faults.remove(index);
                let reason = format!("injected fault at {point:?}");
                Err(StorageError::unavailable(reason))
            }
            None => Ok(()),
        }
    }

    fn outbox_row_mut(&mut self, endpoint: &str, id: Uuid) -> Option<&mut OutboxMessage> {
        self.outbox
            .iter_mut()
            .find(|row| row.id == id && row.endpoint == endpoint)
    }

    fn owned_row_mut(
        &mut self,
        endpoint: &str,
        id: Uuid,
        owner: &str,
    ) -> Option<&mut OutboxMessage> {
        self.outbox_row_mut(endpoint, id)
            .filter(|row| row.is_owned_by(owner))
    }

    fn rows_for<'a>(&'a self, endpoint: &'a str) -> impl Iterator<Item = &'a OutboxMessage> {
        self.outbox
            .iter()
            .filter(move |row| row.endpoint == endpoint)
    }
}

#[derive(Debug, Clone)]
enum Staged {
    Outbox(OutboxMessage),
    Inbox(InboxRecord),
    Row {
        table: String,
        key: String,
        value: serde_json::Value,
    },
}

/// Shared in-memory storage engine.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// An outbox store scoped to `endpoint`.
    pub fn outbox(&self, endpoint: impl Into<String>) -> MemoryOutboxStore {
        MemoryOutboxStore {
            backend: self.clone(),
            endpoint: endpoint.into(),
        }
    }

    /// An inbox store scoped to `endpoint`.
    pub fn inbox(&self, endpoint: impl Into<String>) -> MemoryInboxStore {
        MemoryInboxStore {
            backend: self.clone(),
            endpoint: endpoint.into(),
        }
    }

    pub async fn begin(&self) -> Result<MemoryTx, StorageError> {
        self.lock("begin")?.trip(FaultPoint::Begin)?;
        Ok(MemoryTx {
            backend: self.clone(),
            staged: Vec::new(),
        })
    }

    /// Make the next operation at `point` fail with [`StorageError::Unavailable`].
    pub fn inject_fault(&self, point: FaultPoint) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.faults.push(point);
        }
    }

    /// Read a committed business row.
    pub fn get(&self, table: &str, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        let tables = self.lock("get")?;
        let key = (table.to_string(), key.to_string());
        Ok(tables.rows.get(&key).cloned())
    }

    /// Number of committed business rows in `table`.
    pub fn count(&self, table: &str) -> Result<usize, StorageError> {
        let tables = self.lock("count")?;
        Ok(tables.rows.keys().filter(|(t, _)| t == table).count())
    }

    /// Every committed outbox row for `endpoint`, in insertion order.
    pub fn outbox_rows(&self, endpoint: &str) -> Result<Vec<OutboxMessage>, StorageError> {
        let tables = self.lock("outbox_rows")?;
        Ok(tables.rows_for(endpoint).cloned().collect())
    }

    /// Number of committed inbox records for `endpoint`.
    pub fn inbox_len(&self, endpoint: &str) -> Result<usize, StorageError> {
        let tables = self.lock("inbox_len")?;
        Ok(tables.inbox.keys().filter(|(e, _)| e == endpoint).count())
    }

    fn lock(&self, operation: &'static str) -> Result<MutexGuard<'_, Tables>, StorageError> {
        self.tables
            .lock()
            .map_err(|_| StorageError::LockPoisoned(operation))
    }
}

/// A staged unit of work against a [`MemoryBackend`].
#[derive(Debug)]
pub struct MemoryTx {
    backend: MemoryBackend,
    staged: Vec<Staged>,
}

impl MemoryTx {
    /// Stage a business row write.
    pub fn put(
        &mut self,
        table: impl Into<String>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) {
        self.staged.push(Staged::Row {
            table: table.into(),
            key: key.into(),
            value,
        });
    }

    /// Read a business row, seeing this transaction's own staged writes.
    pub fn get(&self, table: &str, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        let staged = self.staged.iter().rev().find_map(|op| match op {
            Staged::Row { table: t, key: k, value } if t == table && k == key => {
                Some(value.clone())
            }
            _ => None,
        });
        match staged {
            Some(value) => Ok(Some(value)),
            None => self.backend.get(table, key),
        }
    }

    /// Number of writes waiting for commit.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    fn stages_inbox(&self, endpoint: &str, message_id: Uuid) -> bool {
        self.staged.iter().any(|op| match op {
            Staged::Inbox(record) => {
                record.endpoint == endpoint && record.message_id == message_id
            }
            _ => false,
        })
    }
}

#[async_trait]
impl Transaction for MemoryTx {
    async fn commit(self) -> Result<(), StorageError> {
        let mut tables = self.backend.lock("commit")?;
        tables.trip(FaultPoint::Commit)?;

        // Validate everything before touching anything.
        for op in &self.staged {
            match op {
                Staged::Outbox(message) => {
                    if tables.outbox.iter().any(|row| row.id == message.id) {
                        return Err(StorageError::Duplicate {
                            table: "outbox",
                            key: message.id.to_string(),
                        });
                    }
                }
                Staged::Inbox(record) => {
                    let key = (record.endpoint.clone(), record.message_id);
                    if tables.inbox.contains_key(&key) {
                        return Err(StorageError::Duplicate {
                            table: "inbox",
                            key: format!("{}/{}", record.endpoint, record.message_id),
                        });
                    }
                }
                Staged::Row { .. } => {}
            }
        }

        for op in self.staged {
            match op {
                Staged::Outbox(message) => tables.outbox.push(message),
                Staged::Inbox(record) => {
                    tables
                        .inbox
                        .insert((record.endpoint.clone(), record.message_id), record);
                }
                Staged::Row { table, key, value } => {
                    tables.rows.insert((table, key), value);
                }
            }
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Outbox table view over a [`MemoryBackend`].
#[derive(Debug, Clone)]
pub struct MemoryOutboxStore {
    backend: MemoryBackend,
    endpoint: String,
}

#[async_trait]
impl Storage for MemoryOutboxStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StorageError> {
        self.backend.begin().await
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn insert(&self, tx: &mut MemoryTx, message: &OutboxMessage) -> Result<(), StorageError> {
        self.backend
            .lock("outbox insert")?
            .trip(FaultPoint::OutboxInsert)?;
        let mut message = message.clone();
        message.endpoint = self.endpoint.clone();
        tx.staged.push(Staged::Outbox(message));
        Ok(())
    }

    async fn acquire_leases(
        &self,
        request: LeaseRequest<'_>,
    ) -> Result<Vec<OutboxMessage>, StorageError> {
        let mut tables = self.backend.lock("acquire leases")?;
        tables.trip(FaultPoint::AcquireLeases)?;

        let endpoint = self.endpoint.as_str();
        let now = request.now;
        let mut eligible: Vec<usize> = tables
            .outbox
            .iter()
            .enumerate()
            .filter(|(_, row)| row.endpoint == endpoint && row.is_leasable(now))
            .map(|(index, _)| index)
            .collect();
        eligible.sort_by_key(|&index| tables.outbox[index].created_at);
        eligible.truncate(request.limit);

        Ok(eligible
            .into_iter()
            .map(|index| {
                let row = &mut tables.outbox[index];
                row.take_lease(request.owner, request.expires_at);
                row.clone()
            })
            .collect())
    }

    async fn mark_sent(
        &self,
        id: Uuid,
        owner: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut tables = self.backend.lock("mark sent")?;
        tables.trip(FaultPoint::MarkSent)?;
        Ok(match tables.owned_row_mut(&self.endpoint, id, owner) {
            Some(row) => {
                row.record_sent(sent_at);
                true
            }
            None => false,
        })
    }

    async fn record_failure(
        &self,
        id: Uuid,
        owner: &str,
        retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, StorageError> {
        let mut tables = self.backend.lock("record failure")?;
        tables.trip(FaultPoint::RecordFailure)?;
        Ok(match tables.owned_row_mut(&self.endpoint, id, owner) {
            Some(row) => {
                row.record_retry(retry_at, error);
                true
            }
            None => false,
        })
    }

    async fn mark_dead(
        &self,
        id: Uuid,
        owner: &str,
        dead_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, StorageError> {
        let mut tables = self.backend.lock("mark dead")?;
        tables.trip(FaultPoint::MarkDead)?;
        Ok(match tables.owned_row_mut(&self.endpoint, id, owner) {
            Some(row) => {
                row.record_dead(dead_at, error);
                true
            }
            None => false,
        })
    }

    async fn release(&self, ids: &[Uuid], owner: &str) -> Result<u64, StorageError> {
        let mut tables = self.backend.lock("release")?;
        let mut released = 0;
        for &id in ids {
            if let Some(row) = tables.owned_row_mut(&self.endpoint, id, owner) {
                row.clear_lease();
                released += 1;
            }
        }
        Ok(released)
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>, StorageError> {
        let tables = self.backend.lock("get")?;
        let mut rows = tables.rows_for(&self.endpoint);
        Ok(rows.find(|row| row.id == id).cloned())
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<OutboxStats, StorageError> {
        let tables = self.backend.lock("stats")?;
        let mut stats = OutboxStats::default();
        for row in tables.rows_for(&self.endpoint) {
            match row.status(now) {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::Leased => stats.leased += 1,
                OutboxStatus::Sent => stats.sent += 1,
                OutboxStatus::Dead => stats.dead += 1,
            }
        }
        Ok(stats)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<OutboxMessage>, StorageError> {
        let tables = self.backend.lock("dead letters")?;
        let mut dead: Vec<OutboxMessage> = tables
            .rows_for(&self.endpoint)
            .filter(|row| row.dead_at.is_some())
            .cloned()
            .collect();
        dead.sort_by_key(|row| row.created_at);
        dead.truncate(limit);
        Ok(dead)
    }

    async fn requeue_dead(&self, id: Uuid) -> Result<bool, StorageError> {
        let mut tables = self.backend.lock("requeue dead")?;
        Ok(match tables.outbox_row_mut(&self.endpoint, id) {
            Some(row) if row.dead_at.is_some() => {
                row.requeue();
                true
            }
            _ => false,
        })
    }

    async fn prune_sent(&self, older_than: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut tables = self.backend.lock("prune sent")?;
        let before = tables.outbox.len();
        let endpoint = &self.endpoint;
        tables.outbox.retain(|row| {
            let expired = row.sent_at.is_some_and(|sent| sent < older_than);
            !(row.endpoint == *endpoint && expired)
        });
        Ok((before - tables.outbox.len()) as u64)
    }
}

/// Inbox table view over a [`MemoryBackend`].
#[derive(Debug, Clone)]
pub struct MemoryInboxStore {
    backend: MemoryBackend,
    endpoint: String,
}

#[async_trait]
impl Storage for MemoryInboxStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StorageError> {
        self.backend.begin().await
    }
}

#[async_trait]
impl InboxStore for MemoryInboxStore {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn contains(&self, tx: &mut MemoryTx, message_id: Uuid) -> Result<bool, StorageError> {
        if tx.stages_inbox(&self.endpoint, message_id) {
            return Ok(true);
        }
        let tables = self.backend.lock("inbox contains")?;
        let key = (self.endpoint.clone(), message_id);
        Ok(tables.inbox.contains_key(&key))
    }

    /// Checks committed state eagerly; a racing transaction that commits the
    /// same id first is caught again at commit time as
    /// [`StorageError::Duplicate`].
    async fn insert(
        &self,
        tx: &mut MemoryTx,
        record: &InboxRecord,
    ) -> Result<InsertOutcome, StorageError> {
        {
            let mut tables = self.backend.lock("inbox insert")?;
            tables.trip(FaultPoint::InboxInsert)?;
            let key = (self.endpoint.clone(), record.message_id);
            if tables.inbox.contains_key(&key) {
                return Ok(InsertOutcome::AlreadyExists);
            }
        }
        if tx.stages_inbox(&self.endpoint, record.message_id) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        let mut record = record.clone();
        record.endpoint = self.endpoint.clone();
        tx.staged.push(Staged::Inbox(record));
        Ok(InsertOutcome::Inserted)
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut tables = self.backend.lock("inbox prune")?;
        let before = tables.inbox.len();
        let endpoint = &self.endpoint;
        tables
            .inbox
            .retain(|(e, _), record| e != endpoint || record.consumed_at >= cutoff);
        Ok((before - tables.inbox.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn message(at: DateTime<Utc>) -> OutboxMessage {
        OutboxMessage::new("orders", "OrderPlaced", b"{}".to_vec(), at)
    }

    async fn seed(store: &MemoryOutboxStore, rows: &[OutboxMessage]) {
        let mut tx = store.begin().await.unwrap();
        for row in rows {
            store.insert(&mut tx, row).await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn commit_applies_business_row_and_outbox_row_together() {
        let backend = MemoryBackend::new();
        let store = backend.outbox("orders");
        let now = Utc::now();

        let mut tx = store.begin().await.unwrap();
        tx.put("orders", "o-1", json!({"total": 42}));
        store.insert(&mut tx, &message(now)).await.unwrap();
        let staged = tx.get("orders", "o-1").unwrap();
        assert_eq!(staged, Some(json!({"total": 42})));
        assert_eq!(backend.get("orders", "o-1").unwrap(), None);

        tx.commit().await.unwrap();
        assert_eq!(backend.count("orders").unwrap(), 1);
        assert_eq!(backend.outbox_rows("orders").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_nothing_behind() {
        let backend = MemoryBackend::new();
        let store = backend.outbox("orders");

        {
            let mut tx = store.begin().await.unwrap();
            tx.put("orders", "o-1", json!({}));
            store.insert(&mut tx, &message(Utc::now())).await.unwrap();
        }

        assert_eq!(backend.count("orders").unwrap(), 0);
        assert!(backend.outbox_rows("orders").unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_commit_applies_nothing() {
        let backend = MemoryBackend::new();
        let store = backend.outbox("orders");

        let mut tx = store.begin().await.unwrap();
        tx.put("orders", "o-1", json!({}));
        store.insert(&mut tx, &message(Utc::now())).await.unwrap();
        backend.inject_fault(FaultPoint::Commit);

        assert!(matches!(
            tx.commit().await,
            Err(StorageError::Unavailable { .. })
        ));
        assert_eq!(backend.count("orders").unwrap(), 0);
        assert!(backend.outbox_rows("orders").unwrap().is_empty());
    }

    #[tokio::test]
    async fn leases_are_taken_oldest_first_and_exclusively() {
        let backend = MemoryBackend::new();
        let store = backend.outbox("orders");
        let base = Utc::now();
        let rows: Vec<_> = (0..4)
            .map(|i| message(base + Duration::milliseconds(10 - i)))
            .collect();
        seed(&store, &rows).await;

        let now = base + Duration::seconds(1);
        let first = store
            .acquire_leases(LeaseRequest {
                owner: "a",
                now,
                expires_at: now + Duration::seconds(30),
                limit: 3,
            })
            .await
            .unwrap();
        assert_eq!(first.len(), 3);
        assert!(first.is_sorted_by_key(|row| row.created_at));
        assert_eq!(first[0].id, rows[3].id);

        let second = store
            .acquire_leases(LeaseRequest {
                owner: "b",
                now,
                expires_at: now + Duration::seconds(30),
                limit: 3,
            })
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, rows[0].id);
        assert_eq!(second[0].lease_owner.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn expired_leases_can_be_reacquired() {
        let backend = MemoryBackend::new();
        let store = backend.outbox("orders");
        let now = Utc::now();
        seed(&store, &[message(now)]).await;

        let lease = |owner, at: DateTime<Utc>| LeaseRequest {
            owner,
            now: at,
            expires_at: at + Duration::seconds(30),
            limit: 10,
        };

        let leased = store.acquire_leases(lease("a", now)).await.unwrap();
        assert_eq!(leased.len(), 1);
        let early = store
            .acquire_leases(lease("b", now + Duration::seconds(10)))
            .await
            .unwrap();
        assert!(early.is_empty());

        let taken = store
            .acquire_leases(lease("b", now + Duration::seconds(31)))
            .await
            .unwrap();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].lease_owner.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn outcomes_require_lease_ownership() {
        let backend = MemoryBackend::new();
        let store = backend.outbox("orders");
        let now = Utc::now();
        let row = message(now);
        seed(&store, std::slice::from_ref(&row)).await;
        store
            .acquire_leases(LeaseRequest {
                owner: "a",
                now,
                expires_at: now + Duration::seconds(30),
                limit: 1,
            })
            .await
            .unwrap();

        assert!(!store.mark_sent(row.id, "b", now).await.unwrap());
        assert!(store.mark_sent(row.id, "a", now).await.unwrap());
        assert!(!store.mark_sent(row.id, "a", now).await.unwrap());

        let stored = store.get(row.id).await.unwrap().unwrap();
        assert_eq!(stored.sent_at, Some(now));
        assert_eq!(stored.attempt_count, 1);
    }

    #[tokio::test]
    async fn release_only_touches_own_unsent_rows() {
        let backend = MemoryBackend::new();
        let store = backend.outbox("orders");
        let now = Utc::now();
        let rows = vec![message(now), message(now)];
        seed(&store, &rows).await;
        store
            .acquire_leases(LeaseRequest {
                owner: "a",
                now,
                expires_at: now + Duration::seconds(30),
                limit: 2,
            })
            .await
            .unwrap();
        store.mark_sent(rows[0].id, "a", now).await.unwrap();

        let ids = [rows[0].id, rows[1].id];
        assert_eq!(store.release(&ids, "b").await.unwrap(), 0);
        assert_eq!(store.release(&ids, "a").await.unwrap(), 1);
        assert_eq!(store.stats(now).await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn dead_rows_are_listed_requeued_and_survive_pruning() {
        let backend = MemoryBackend::new();
        let store = backend.outbox("orders");
        let now = Utc::now();
        let rows = vec![message(now), message(now)];
        seed(&store, &rows).await;
        store
            .acquire_leases(LeaseRequest {
                owner: "a",
                now,
                expires_at: now + Duration::seconds(30),
                limit: 2,
            })
            .await
            .unwrap();
        store.mark_sent(rows[0].id, "a", now).await.unwrap();
        store
            .mark_dead(rows[1].id, "a", now, "rejected")
            .await
            .unwrap();

        let stats = store.stats(now).await.unwrap();
        assert_eq!((stats.sent, stats.dead), (1, 1));

        assert_eq!(
            store.prune_sent(now + Duration::seconds(1)).await.unwrap(),
            1
        );
        let dead = store.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error.as_deref(), Some("rejected"));

        assert!(store.requeue_dead(rows[1].id).await.unwrap());
        assert!(!store.requeue_dead(rows[1].id).await.unwrap());
        assert_eq!(store.stats(now).await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn endpoints_are_isolated() {
        let backend = MemoryBackend::new();
        let orders = backend.outbox("orders");
        let billing = backend.outbox("billing");
        let now = Utc::now();
        seed(&orders, &[message(now)]).await;

        let leased = billing
            .acquire_leases(LeaseRequest {
                owner: "a",
                now,
                expires_at: now + Duration::seconds(30),
                limit: 10,
            })
            .await
            .unwrap();
        assert!(leased.is_empty());
        assert_eq!(orders.stats(now).await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn inbox_duplicates_are_detected_eagerly_and_at_commit() {
        let backend = MemoryBackend::new();
        let inbox = backend.inbox("consumer");
        let id = Uuid::new_v4();
        let record = InboxRecord::new("consumer", id, Utc::now());

        let mut first = inbox.begin().await.unwrap();
        let mut second = inbox.begin().await.unwrap();
        assert_eq!(
            inbox.insert(&mut first, &record).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            inbox.insert(&mut first, &record).await.unwrap(),
            InsertOutcome::AlreadyExists
        );
        assert_eq!(
            inbox.insert(&mut second, &record).await.unwrap(),
            InsertOutcome::Inserted
        );

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(err.is_duplicate());
        assert_eq!(backend.inbox_len("consumer").unwrap(), 1);

        let mut third = inbox.begin().await.unwrap();
        assert!(inbox.contains(&mut third, id).await.unwrap());
        assert_eq!(
            inbox.insert(&mut third, &record).await.unwrap(),
            InsertOutcome::AlreadyExists
        );
    }

    #[tokio::test]
    async fn inbox_prune_respects_retention_horizon() {
        let backend = MemoryBackend::new();
        let inbox = backend.inbox("consumer");
        let now = Utc::now();

        let old = InboxRecord::new("consumer", Uuid::new_v4(), now - Duration::days(8));
        let fresh = InboxRecord::new("consumer", Uuid::new_v4(), now);

        let mut tx = inbox.begin().await.unwrap();
        inbox.insert(&mut tx, &old).await.unwrap();
        inbox.insert(&mut tx, &fresh).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(inbox.prune(now - Duration::days(7)).await.unwrap(), 1);
        assert_eq!(backend.inbox_len("consumer").unwrap(), 1);
    }
}
