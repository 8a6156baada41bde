//! # Courier
//!
//! Transactional outbox and inbox for services that write to a database and
//! talk to a message broker.
//!
//! ## Core Concepts
//!
//! Courier separates **recording** from **delivering**:
//! - [`OutboxWriter`] records intent-to-publish in the producer's own transaction
//! - [`OutboxDispatcher`] delivers recorded messages to the broker, later, with retries
//! - [`InboxGuard`] records what a consumer has already handled, in the handler's transaction
//!
//! The key principle: **Record before declaring success.**
//! A message exists if and only if the business change that caused it committed.
//! A consumer's side effects exist if and only if its inbox record committed.
//!
//! ## Architecture
//!
//! ```text
//! Producer                                Consumer
//!     │                                       ▲
//!     ▼ begin()                               │ receive()
//! Transaction ─────────┐                  BrokerReceiver
//!     │                │                      │
//!     ├─► business rows│                      ▼
//!     │                │               InboxGuard::handle_once
//!     └─► OutboxWriter.append                 │
//!                      │                      ├─► seen? ──► Skipped ──► ack
//!                      ▼ commit()             │
//!                OutboxStore                  └─► handler(tx) + inbox record
//!                      │                               │ commit()
//!                      ▼ acquire_leases()              ▼
//!               OutboxDispatcher ──► BrokerClient::send ──► Processed ──► ack
//!                      │
//!                      └─► mark_sent | record_failure (backoff) | mark_dead
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Atomic append** - Outbox row and business rows commit together or not at all
//! 2. **Sent once** - `sent_at` goes from unset to set at most once and never back
//! 3. **Exclusive leases** - At most one dispatcher holds an unexpired lease on a row
//! 4. **Dead is terminal** - Dead-lettered rows are never leased again unless requeued
//! 5. **One record per id** - At most one inbox record per `(endpoint, message_id)`
//!
//! ## Guarantees
//!
//! - **At-least-once publishing**: a crash between send and `mark_sent` resends
//!   once the lease expires, unless the duplicate-detection window suppresses it
//! - **Exactly-once effects**: handler effects commit at most once per message id
//! - **Approximate FIFO**: rows are leased oldest first; no ordering across instances
//!
//! ## Example
//!
//! ```ignore
//! use courier_core::{
//!     message_type, DispatcherConfig, InboxGuard, MemoryBackend, MemoryBroker, Message,
//!     OutboxDispatcher, OutboxWriter, Storage, Transaction,
//! };
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct OrderPlaced {
//!     order_id: Uuid,
//! }
//!
//! impl Message for OrderPlaced {
//!     message_type!("orders.placed");
//! }
//!
//! let backend = MemoryBackend::new();
//! let broker = MemoryBroker::new();
//!
//! // 1. Record the message with the business change
//! let writer = OutboxWriter::new(backend.outbox("orders"));
//! let mut tx = writer.store().begin().await?;
//! tx.put("orders", order_id.to_string(), json!({ "status": "placed" }));
//! writer.append_message(&mut tx, &OrderPlaced { order_id }).await?;
//! tx.commit().await?;
//!
//! // 2. Drain the outbox in the background
//! let handle = OutboxDispatcher::new(
//!     backend.outbox("orders"),
//!     Arc::new(broker.clone()),
//!     DispatcherConfig::default(),
//! )?
//! .start();
//!
//! // 3. Handle each delivery once
//! let guard = InboxGuard::new(backend.inbox("billing"));
//! let delivery = broker.receive().await.unwrap();
//! guard
//!     .run(delivery.envelope.id, |tx| Box::pin(async move {
//!         tx.put("invoices", "i-1", json!({ "paid": false }));
//!         Ok(())
//!     }))
//!     .await?;
//! ```
//!
//! ## What This Is Not
//!
//! Courier is **not**:
//! - A broker client (transport lives behind [`BrokerClient`] / [`BrokerReceiver`])
//! - An ordering guarantee
//! - A distributed transaction
//!
//! Courier **is**:
//! > Atomic intent-to-publish, lease-coordinated dispatch, and idempotent
//! > consumption.

mod broker;
mod clock;
mod config;
mod consumer;
mod dispatcher;
mod envelope;
mod error;
mod inbox;
mod message;
mod message_macro;
mod store;
mod writer;

// In-memory backend, for tests, demos and non-durable pipelines
pub mod memory;

// Re-export message types
pub use envelope::{Envelope, Message};
pub use message::{InboxRecord, Lease, OutboxMessage, OutboxStatus};

// Re-export storage capabilities
pub use store::{
    InboxStore, InsertOutcome, LeaseRequest, OutboxStats, OutboxStore, Storage, Transaction,
};

// Re-export broker capabilities
pub use broker::{BrokerClient, BrokerReceiver, Delivery, MemoryBroker};

// Re-export producer, dispatcher and consumer types
pub use consumer::{Consumer, ConsumerHandle, MessageHandler};
pub use dispatcher::{
    CycleReport, DispatcherHandle, DuplicateWindow, OutboxDispatcher, RetryPolicy,
};
pub use inbox::{InboxGuard, Outcome};
pub use writer::OutboxWriter;

// Re-export configuration
pub use config::{ConnectionConfig, ConsumerConfig, DispatcherConfig};

// Re-export time sources
pub use clock::{Clock, ManualClock, SystemClock};

// Re-export error types
pub use error::{BrokerError, CourierError, FailureKind, Result, StorageError};

pub use memory::{MemoryBackend, MemoryInboxStore, MemoryOutboxStore, MemoryTx};

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use futures::future::BoxFuture;
