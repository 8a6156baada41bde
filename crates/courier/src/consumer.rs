//! Broker consumer that routes every delivery through an [`InboxGuard`].
//!
//! ```text
//! BrokerReceiver::receive ──► permit (concurrency) ──► spawn
//!                                                        │
//!                                   InboxGuard::run(envelope.id, handler)
//!                                                        │
//!                        Processed | Skipped ──► ack     └─► Err ──► nack(requeue)
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerReceiver, Delivery};
use crate::clock::Clock;
use crate::config::ConsumerConfig;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::inbox::InboxGuard;
use crate::store::{InboxStore, Storage};

/// Application logic for one inbound message.
///
/// `tx` is the guard's transaction: anything written through it (business rows,
/// outbox appends on the same backend) commits together with the inbox record,
/// or not at all.
#[async_trait]
pub trait MessageHandler<Tx: Send>: Send + Sync + 'static {
    async fn handle(&self, tx: &mut Tx, envelope: &Envelope) -> anyhow::Result<()>;
}

type SharedHandler<S> = Arc<dyn MessageHandler<<S as Storage>::Tx>>;

/// Receive loop with a bounded worker pool.
pub struct Consumer<S: InboxStore> {
    guard: InboxGuard<S>,
    receiver: Arc<dyn BrokerReceiver>,
    handler: SharedHandler<S>,
    config: ConsumerConfig,
    shutdown: CancellationToken,
}

impl<S> Consumer<S>
where
    S: InboxStore + Clone + 'static,
{
    pub fn new(
        store: S,
        receiver: Arc<dyn BrokerReceiver>,
        handler: SharedHandler<S>,
        config: ConsumerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            guard: InboxGuard::new(store),
            receiver,
            handler,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.guard = self.guard.with_clock(clock);
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn start(self) -> ConsumerHandle {
        let token = self.shutdown.clone();
        let task = tokio::spawn(self.run());
        ConsumerHandle {
            token,
            task: Some(task),
        }
    }

    async fn run(self) {
        info!(
            endpoint = self.guard.store().endpoint(),
            concurrency = self.config.concurrency,
            "consumer started"
        );

        let permits = Arc::new(Semaphore::new(self.config.concurrency));
        let mut workers = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let delivery = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                delivery = self.receiver.receive() => match delivery {
                    Some(delivery) => delivery,
                    None => {
                        info!("broker closed, consumer stopping");
                        break;
                    }
                },
            };

            let guard = self.guard.clone();
            let receiver = self.receiver.clone();
            let handler = self.handler.clone();
            workers.spawn(async move {
                process(&guard, receiver.as_ref(), handler, delivery).await;
                drop(permit);
            });

            while workers.try_join_next().is_some() {}
        }

        let grace = self.config.shutdown_grace;
        let drained = time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                in_flight = workers.len(),
                ?grace,
                "in-flight deliveries did not finish in time, aborting"
            );
            workers.abort_all();
        }

        info!("consumer stopped");
    }
}

async fn process<S>(
    guard: &InboxGuard<S>,
    receiver: &dyn BrokerReceiver,
    handler: SharedHandler<S>,
    delivery: Delivery,
) where
    S: InboxStore,
{
    let message_id = delivery.envelope.id;
    let envelope = delivery.envelope.clone();

    let result = guard
        .run(message_id, move |tx| {
            Box::pin(async move { handler.handle(tx, &envelope).await })
        })
        .await;

    let settled = match result {
        Ok(outcome) => {
            debug!(
                %message_id,
                processed = outcome.is_processed(),
                redelivered = delivery.redelivered,
                "delivery acknowledged"
            );
            receiver.ack(&delivery).await
        }
        Err(err) => {
            warn!(%message_id, error = %err, "delivery failed, requeueing");
            receiver.nack(&delivery, true).await
        }
    };

    if let Err(err) = settled {
        error!(%message_id, tag = delivery.tag, error = %err, "could not settle delivery");
    }
}

/// Handle to a running consumer. Dropping it requests shutdown.
pub struct ConsumerHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ConsumerHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|task| task.is_finished())
    }

    /// Wait for the receive loop to end (broker closed or shutdown requested).
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Stop receiving and wait for in-flight deliveries, bounded by the
    /// configured grace period.
    pub async fn shutdown_and_wait(self) {
        self.shutdown();
        self.join().await;
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerClient, MemoryBroker};
    use crate::memory::{MemoryBackend, MemoryTx};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts handled messages in a business row; fails the first `failures` calls.
    struct Tally {
        failures: AtomicUsize,
        calls: AtomicUsize,
    }

    impl Tally {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MessageHandler<MemoryTx> for Tally {
        async fn handle(&self, tx: &mut MemoryTx, envelope: &Envelope) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let current = tx
                .get("tally", "handled")?
                .and_then(|value| value.as_u64())
                .unwrap_or(0);
            tx.put("tally", "handled", json!(current + 1));
            tx.put("seen", envelope.id.to_string(), json!(true));

            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                anyhow::bail!("simulated handler failure");
            }
            Ok(())
        }
    }

    fn handled(backend: &MemoryBackend) -> u64 {
        backend
            .get("tally", "handled")
            .unwrap()
            .and_then(|value| value.as_u64())
            .unwrap_or(0)
    }

    async fn settle(broker: &MemoryBroker) {
        time::timeout(Duration::from_secs(2), async {
            while broker.ready_len() > 0 || broker.unacked_len() > 0 {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn handles_each_message_once_and_skips_redeliveries() {
        let backend = MemoryBackend::new();
        let broker = MemoryBroker::new();
        let tally = Tally::new(0);

        let envelopes: Vec<Envelope> = (0..3)
            .map(|_| Envelope::new("Event", Vec::new(), Utc::now()))
            .collect();
        for envelope in &envelopes {
            broker.send(envelope).await.unwrap();
        }

        let consumer = Consumer::new(
            backend.inbox("reports"),
            Arc::new(broker.clone()),
            tally.clone(),
            ConsumerConfig::default().with_concurrency(2),
        )
        .unwrap();
        let handle = consumer.start();

        settle(&broker).await;
        assert_eq!(handled(&backend), 3);

        broker.redeliver(envelopes[0].clone());
        broker.redeliver(envelopes[1].clone());
        settle(&broker).await;

        assert_eq!(handled(&backend), 3);
        assert_eq!(tally.calls.load(Ordering::SeqCst), 3);
        assert_eq!(backend.inbox_len("reports").unwrap(), 3);

        handle.shutdown_and_wait().await;
    }

    #[tokio::test]
    async fn failed_delivery_is_requeued_and_retried() {
        let backend = MemoryBackend::new();
        let broker = MemoryBroker::new();
        let tally = Tally::new(1);
        broker
            .send(&Envelope::new("Event", Vec::new(), Utc::now()))
            .await
            .unwrap();

        let handle = Consumer::new(
            backend.inbox("reports"),
            Arc::new(broker.clone()),
            tally.clone(),
            ConsumerConfig::default(),
        )
        .unwrap()
        .start();

        settle(&broker).await;
        assert_eq!(tally.calls.load(Ordering::SeqCst), 2);
        assert_eq!(handled(&backend), 1);

        broker.close();
        handle.join().await;
    }

    #[tokio::test]
    async fn closing_the_broker_stops_the_loop() {
        let backend = MemoryBackend::new();
        let broker = MemoryBroker::new();
        let handle = Consumer::new(
            backend.inbox("reports"),
            Arc::new(broker.clone()),
            Tally::new(0),
            ConsumerConfig::default(),
        )
        .unwrap()
        .start();

        broker.close();
        time::timeout(Duration::from_secs(1), handle.join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancelling_the_token_stops_the_loop() {
        let backend = MemoryBackend::new();
        let broker = MemoryBroker::new();
        let consumer = Consumer::new(
            backend.inbox("reports"),
            Arc::new(broker.clone()),
            Tally::new(0),
            ConsumerConfig::default(),
        )
        .unwrap();

        let token = consumer.shutdown_token();
        let handle = consumer.start();
        assert!(!handle.is_finished());

        token.cancel();
        time::timeout(Duration::from_secs(1), handle.join())
            .await
            .unwrap();
    }

    #[test]
    fn rejects_zero_concurrency() {
        let backend = MemoryBackend::new();
        let result = Consumer::new(
            backend.inbox("reports"),
            Arc::new(MemoryBroker::new()),
            Tally::new(0),
            ConsumerConfig::default().with_concurrency(0),
        );
        assert!(result.is_err());
    }
}
