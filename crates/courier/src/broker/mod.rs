//! Broker capabilities.
//!
//! The transport itself (connections, channels, exchange and queue topology)
//! lives behind these traits. The dispatcher only needs [`BrokerClient::send`]
//! and a failure it can classify; the consumer needs receive/ack/nack.

mod memory;

pub use memory::MemoryBroker;

use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::error::BrokerError;

/// Publishing side of the broker.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Publish one envelope.
    ///
    /// Failures must say whether they are worth retrying
    /// ([`BrokerError::kind`]).
    async fn send(&self, envelope: &Envelope) -> Result<(), BrokerError>;
}

/// A message handed to a consumer, awaiting acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned handle used for ack/nack.
    pub tag: u64,
    pub envelope: Envelope,
    /// Set when the broker has delivered this envelope before.
    pub redelivered: bool,
}

/// Consuming side of the broker.
#[async_trait]
pub trait BrokerReceiver: Send + Sync {
    /// Wait for the next delivery. `None` once the broker is closed.
    async fn receive(&self) -> Option<Delivery>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Reject a delivery; with `requeue` the broker delivers it again later.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError>;
}
