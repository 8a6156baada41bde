//! Consumer-side deduplication.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{CourierError, Result};
use crate::message::InboxRecord;
use crate::store::{InboxStore, InsertOutcome, Transaction};

/// Result of [`InboxGuard::handle_once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// The handler ran and its effects committed together with the inbox record.
    Processed,
    /// The message id was already recorded; the handler did not run (or its
    /// effects were rolled back because a concurrent delivery won).
    Skipped,
}

impl Outcome {
    pub fn is_processed(self) -> bool {
        self == Self::Processed
    }
}

/// Makes message handling idempotent under at-least-once delivery.
///
/// Handler effects and the inbox record commit in one transaction, so either
/// both exist or neither does. Both `Processed` and `Skipped` mean the
/// delivery can be acknowledged.
#[derive(Clone)]
pub struct InboxGuard<S> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: InboxStore> InboxGuard<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run `handler` inside `tx` unless `message_id` was already handled on
    /// this endpoint, then commit.
    ///
    /// The guard owns `tx` from here on and commits or rolls it back on every
    /// path. A handler error rolls back and comes back as
    /// [`CourierError::Handler`] so the broker can redeliver.
    ///
    /// ```ignore
    /// let counter = counter.clone();
    /// guard
    ///     .handle_once(tx, id, move |tx| Box::pin(async move {
    ///         tx.put("counters", "hits", json!(1));
    ///         Ok(())
    ///     }))
    ///     .await?;
    /// ```
    pub async fn handle_once<F>(
        &self,
        mut tx: S::Tx,
        message_id: Uuid,
        handler: F,
    ) -> Result<Outcome>
    where
        F: for<'a> FnOnce(&'a mut S::Tx) -> BoxFuture<'a, anyhow::Result<()>> + Send,
    {
        if self.store.contains(&mut tx, message_id).await? {
            tx.rollback().await?;
            debug!(%message_id, endpoint = self.store.endpoint(), "duplicate delivery skipped");
            return Ok(Outcome::Skipped);
        }

        if let Err(source) = handler(&mut tx).await {
            if let Err(err) = tx.rollback().await {
                warn!(%message_id, error = %err, "rollback after handler failure failed");
            }
            return Err(CourierError::Handler { message_id, source });
        }

        let record = InboxRecord::new(self.store.endpoint(), message_id, self.clock.now());
        if self.store.insert(&mut tx, &record).await? == InsertOutcome::AlreadyExists {
            tx.rollback().await?;
            debug!(%message_id, "concurrent delivery recorded first, handler effects discarded");
            return Ok(Outcome::Skipped);
        }

        match tx.commit().await {
            Ok(()) => Ok(Outcome::Processed),
            Err(err) if err.is_duplicate() => {
                debug!(%message_id, "inbox record conflict at commit, delivery skipped");
                Ok(Outcome::Skipped)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// [`handle_once`](Self::handle_once) in a fresh transaction.
    pub async fn run<F>(&self, message_id: Uuid, handler: F) -> Result<Outcome>
    where
        F: for<'a> FnOnce(&'a mut S::Tx) -> BoxFuture<'a, anyhow::Result<()>> + Send,
    {
        let tx = self.store.begin().await?;
        self.handle_once(tx, message_id, handler).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::memory::{FaultPoint, MemoryBackend, MemoryInboxStore, MemoryTx};
    use crate::store::Storage;
    use serde_json::json;

    fn bump(tx: &mut MemoryTx) -> anyhow::Result<()> {
        let current = tx
            .get("counters", "hits")?
            .and_then(|value| value.as_u64())
            .unwrap_or(0);
        tx.put("counters", "hits", json!(current + 1));
        Ok(())
    }

    fn hits(backend: &MemoryBackend) -> u64 {
        backend
            .get("counters", "hits")
            .unwrap()
            .and_then(|value| value.as_u64())
            .unwrap_or(0)
    }

    fn guard(backend: &MemoryBackend) -> InboxGuard<MemoryInboxStore> {
        InboxGuard::new(backend.inbox("billing"))
    }

    #[tokio::test]
    async fn first_delivery_processes_and_records() {
        let backend = MemoryBackend::new();
        let guard = guard(&backend);
        let id = Uuid::new_v4();

        let outcome = guard
            .run(id, |tx| Box::pin(async move { bump(tx) }))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Processed);
        assert_eq!(hits(&backend), 1);
        assert_eq!(backend.inbox_len("billing").unwrap(), 1);
    }

    #[tokio::test]
    async fn repeated_delivery_runs_handler_once() {
        let backend = MemoryBackend::new();
        let guard = guard(&backend);
        let id = Uuid::new_v4();

        let mut outcomes = Vec::new();
        for _ in 0..4 {
            let outcome = guard
                .run(id, |tx| Box::pin(async move { bump(tx) }))
                .await
                .unwrap();
            outcomes.push(outcome);
        }

        assert_eq!(outcomes[0], Outcome::Processed);
        assert!(outcomes[1..].iter().all(|o| *o == Outcome::Skipped));
        assert_eq!(hits(&backend), 1);
    }

    #[tokio::test]
    async fn handler_failure_rolls_back_and_leaves_no_record() {
        let backend = MemoryBackend::new();
        let guard = guard(&backend);
        let id = Uuid::new_v4();

        let err = guard
            .run(id, |tx| {
                Box::pin(async move {
                    bump(tx)?;
                    anyhow::bail!("downstream unavailable")
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CourierError::Handler { message_id, .. } if message_id == id));
        assert_eq!(hits(&backend), 0);
        assert_eq!(backend.inbox_len("billing").unwrap(), 0);

        let retry = guard
            .run(id, |tx| Box::pin(async move { bump(tx) }))
            .await
            .unwrap();
        assert_eq!(retry, Outcome::Processed);
        assert_eq!(hits(&backend), 1);
    }

    #[tokio::test]
    async fn endpoints_deduplicate_independently() {
        let backend = MemoryBackend::new();
        let id = Uuid::new_v4();

        let billing = InboxGuard::new(backend.inbox("billing"));
        let shipping = InboxGuard::new(backend.inbox("shipping"));

        let a = billing
            .run(id, |_| Box::pin(async { Ok(()) }))
            .await
            .unwrap();
        let b = shipping
            .run(id, |_| Box::pin(async { Ok(()) }))
            .await
            .unwrap();
        assert_eq!((a, b), (Outcome::Processed, Outcome::Processed));
    }

    #[tokio::test]
    async fn concurrent_winner_discards_loser_effects() {
        let backend = MemoryBackend::new();
        let guard = guard(&backend);
        let id = Uuid::new_v4();

        // Both transactions pass the membership check before either commits.
        let first = guard.store().begin().await.unwrap();
        let mut second = guard.store().begin().await.unwrap();
        assert!(!guard.store().contains(&mut second, id).await.unwrap());

        let outcome = guard
            .handle_once(first, id, |tx| Box::pin(async move { bump(tx) }))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Processed);

        bump(&mut second).unwrap();
        let record = InboxRecord::new("billing", id, chrono::Utc::now());
        assert_eq!(
            guard.store().insert(&mut second, &record).await.unwrap(),
            InsertOutcome::AlreadyExists
        );
        drop(second);
        assert_eq!(hits(&backend), 1);
    }

    #[tokio::test]
    async fn storage_failure_propagates() {
        let backend = MemoryBackend::new();
        let guard = guard(&backend);
        backend.inject_fault(FaultPoint::InboxInsert);

        let err = guard
            .run(Uuid::new_v4(), |tx| Box::pin(async move { bump(tx) }))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CourierError::Storage(StorageError::Unavailable { .. })
        ));
        assert_eq!(hits(&backend), 0);
    }
}
