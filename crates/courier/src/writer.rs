//! Producer-side outbox appends.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::envelope::Message;
use crate::error::{CourierError, Result};
use crate::message::OutboxMessage;
use crate::store::OutboxStore;

/// Records intent-to-publish inside the caller's transaction.
///
/// The writer never begins or commits anything itself. If an append fails,
/// the caller must abandon the whole transaction so business state and the
/// message are never split.
#[derive(Clone)]
pub struct OutboxWriter<S> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: OutboxStore> OutboxWriter<S> {
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

    /// Append a raw payload and return the generated message id.
    pub async fn append(
        &self,
        tx: &mut S::Tx,
        message_type: &str,
        payload: Vec<u8>,
    ) -> Result<Uuid> {
        if message_type.trim().is_empty() {
            return Err(CourierError::invalid_message("empty message type"));
        }

        let message = OutboxMessage::new(
            self.store.endpoint(),
            message_type,
            payload,
            self.clock.now(),
        );
        self.store.insert(tx, &message).await?;

        debug!(
            message_id = %message.id,
            message_type,
            endpoint = self.store.endpoint(),
            "outbox message appended"
        );
        Ok(message.id)
    }

    /// JSON-encode a typed message and append it.
    pub async fn append_message<M: Message>(&self, tx: &mut S::Tx, message: &M) -> Result<Uuid> {
        let payload = message.encode()?;
        self.append(tx, M::message_type(), payload).await
    }
}
