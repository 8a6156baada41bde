use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{BrokerClient, BrokerReceiver, Delivery};
use crate::envelope::Envelope;
use crate::error::BrokerError;

#[derive(Debug, Default)]
struct Queue {
    ready: VecDeque<(Envelope, bool)>,
    unacked: HashMap<u64, Envelope>,
    next_tag: u64,
    published: u64,
    closed: bool,
}

/// Single-queue in-process broker with at-least-once semantics.
///
/// Unacknowledged deliveries stay tracked until acked or nacked;
/// [`recover_unacked`](Self::recover_unacked) puts them back on the queue the
/// way a real broker does when a consumer connection drops.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    queue: Arc<Mutex<Queue>>,
    notify: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requeue every delivery that was handed out but never settled.
    pub fn recover_unacked(&self) -> usize {
        let mut queue = self.lock();
        let mut tags: Vec<u64> = queue.unacked.keys().copied().collect();
        tags.sort_unstable();
        let count = tags.len();
        for tag in tags {
            if let Some(envelope) = queue.unacked.remove(&tag) {
                queue.ready.push_back((envelope, true));
            }
        }
        drop(queue);
        self.notify.notify_waiters();
        count
    }

    /// Push an envelope straight onto the queue again, flagged as a redelivery.
    pub fn redeliver(&self, envelope: Envelope) {
        self.lock().ready.push_back((envelope, true));
        self.notify.notify_one();
    }

    /// Stop handing out deliveries; pending receivers get `None`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Deliveries waiting to be received.
    pub fn ready_len(&self) -> usize {
        self.lock().ready.len()
    }

    /// Deliveries received but not yet settled.
    pub fn unacked_len(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Total envelopes accepted through [`BrokerClient::send`].
    pub fn published(&self) -> u64 {
        self.lock().published
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        // The queue holds no invariants a panicking holder could break halfway.
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_take(&self) -> Option<Option<Delivery>> {
        let mut queue = self.lock();
        if let Some((envelope, redelivered)) = queue.ready.pop_front() {
            queue.next_tag += 1;
            let tag = queue.next_tag;
            queue.unacked.insert(tag, envelope.clone());
            return Some(Some(Delivery {
                tag,
                envelope,
                redelivered,
            }));
        }
        if queue.closed {
            return Some(None);
        }
        None
    }

    fn take_unacked(&self, tag: u64) -> Result<Envelope, BrokerError> {
        match self.lock().unacked.remove(&tag) {
            Some(envelope) => Ok(envelope),
            None => Err(BrokerError::permanent(format!("unknown tag {tag}"))),
        }
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn send(&self, envelope: &Envelope) -> Result<(), BrokerError> {
        {
            let mut queue = self.lock();
            if queue.closed {
                return Err(BrokerError::transient("broker closed"));
            }
            queue.ready.push_back((envelope.clone(), false));
            queue.published += 1;
        }
        self.notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl BrokerReceiver for MemoryBroker {
    async fn receive(&self) -> Option<Delivery> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_take() {
                return result;
            }
            notified.await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.take_unacked(delivery.tag)?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        let envelope = self.take_unacked(delivery.tag)?;
        if requeue {
            self.lock().ready.push_back((envelope, true));
            self.notify.notify_one();
        }
        Ok(())
    }
}
