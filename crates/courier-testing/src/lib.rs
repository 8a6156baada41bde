//! Testing utilities for courier.
//!
//! - [`ScriptedBroker`]: a [`BrokerClient`] that plays back a script of
//!   successes, failures and stalls, and records what it accepted
//! - [`CountingHandler`]: a [`MessageHandler`] that counts calls and can fail
//!   the first few
//! - [`seed_outbox`] and [`wait_until`] for arranging and awaiting scenarios

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use courier_core::{
    BrokerClient, BrokerError, Envelope, MessageHandler, OutboxStore, OutboxWriter, Transaction,
};
use uuid::Uuid;

/// One scripted reaction to a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Succeed,
    Transient(String),
    Permanent(String),
    /// Sleep this long, then succeed. Longer than the dispatcher's
    /// `send_timeout` makes the attempt time out.
    Stall(Duration),
}

#[derive(Debug, Default)]
struct Recorded {
    script: VecDeque<Step>,
    sent: Vec<Envelope>,
    attempts: HashMap<Uuid, usize>,
}

/// A broker that follows a script, then succeeds forever.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBroker {
    inner: Arc<Mutex<Recorded>>,
}

impl ScriptedBroker {
    /// Accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(steps: impl IntoIterator<Item = Step>) -> Self {
        let broker = Self::new();
        broker.inner.lock().unwrap().script.extend(steps);
        broker
    }

    /// Fail the next `count` sends with a transient error.
    pub fn failing_transiently(count: usize) -> Self {
        let broker = Self::new();
        for n in 1..=count {
            broker.push(Step::Transient(format!("scripted failure {n}")));
        }
        broker
    }

    /// Append a step to the end of the script.
    pub fn push(&self, step: Step) {
        self.inner.lock().unwrap().script.push_back(step);
    }

    /// Envelopes accepted, in order.
    pub fn get_sent(&self) -> Vec<Envelope> {
        self.inner.lock().unwrap().sent.clone()
    }

    pub fn sent_ids(&self) -> Vec<Uuid> {
        let sent = self.get_sent();
        sent.iter().map(|envelope| envelope.id).collect()
    }

    /// Send calls for `id`, successful or not.
    pub fn attempts(&self, id: Uuid) -> usize {
        self.inner
            .lock()
            .unwrap()
            .attempts
            .get(&id)
            .copied()
            .unwrap_or(0)
    }

    /// Send calls across all ids.
    pub fn total_attempts(&self) -> usize {
        self.inner.lock().unwrap().attempts.values().sum()
    }
}

#[async_trait]
impl BrokerClient for ScriptedBroker {
    async fn send(&self, envelope: &Envelope) -> Result<(), BrokerError> {
        let step = {
            let mut inner = self.inner.lock().unwrap();
            *inner.attempts.entry(envelope.id).or_default() += 1;
            inner.script.pop_front().unwrap_or(Step::Succeed)
        };

        match step {
            Step::Succeed => {}
            Step::Transient(reason) => return Err(BrokerError::transient(reason)),
            Step::Permanent(reason) => return Err(BrokerError::permanent(reason)),
            Step::Stall(delay) => tokio::time::sleep(delay).await,
        }

        self.inner.lock().unwrap().sent.push(envelope.clone());
        Ok(())
    }
}

/// Counts handler invocations; optionally fails the first `failures` of them.
#[derive(Debug, Default)]
pub struct CountingHandler {
    calls: AtomicUsize,
    failures: AtomicUsize,
    handled: Mutex<Vec<Uuid>>,
}

impl CountingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_first(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicUsize::new(failures),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Ids of envelopes the handler returned `Ok` for.
    pub fn get_handled(&self) -> Vec<Uuid> {
        self.handled.lock().unwrap().clone()
    }
}

#[async_trait]
impl<Tx: Send> MessageHandler<Tx> for CountingHandler {
    async fn handle(&self, _tx: &mut Tx, envelope: &Envelope) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("scripted handler failure for {}", envelope.id);
        }
        self.handled.lock().unwrap().push(envelope.id);
        Ok(())
    }
}

/// Commit `count` messages of `message_type` to `store` in one transaction.
pub async fn seed_outbox<S: OutboxStore>(
    store: S,
    message_type: &str,
    count: usize,
) -> courier_core::Result<Vec<Uuid>> {
    let writer = OutboxWriter::new(store);
    let mut tx = writer.store().begin().await?;
    let mut ids = Vec::with_capacity(count);
    for n in 0..count {
        let payload = format!("{{\"n\":{n}}}").into_bytes();
        ids.push(writer.append(&mut tx, message_type, payload).await?);
    }
    tx.commit().await?;
    Ok(ids)
}

/// A standalone envelope, as a broker would deliver it.
pub fn envelope(message_type: &str) -> Envelope {
    Envelope::new(message_type, b"{}".to_vec(), Utc::now())
}

/// Poll `condition` every few milliseconds until it holds. Returns `false` on
/// timeout.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}
