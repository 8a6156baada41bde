//! # Outbox Demo
//!
//! A producer records `SomethingHappened` facts together with an outbox
//! message, a dispatcher drains the outbox to an in-process broker, and a
//! consumer handles each message once. At the end every message is delivered
//! a second time to show the inbox skipping duplicates.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{
    message_type, Consumer, ConsumerConfig, DispatcherConfig, Envelope, MemoryBackend,
    MemoryBroker, MemoryTx, Message, MessageHandler, OutboxDispatcher, OutboxWriter, Storage,
    Transaction,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SomethingHappened {
    id: Uuid,
    source: String,
    occurred_at: DateTime<Utc>,
}

impl Message for SomethingHappened {
    message_type!("demo.something-happened");
}

// ============================================================================
// Consumer
// ============================================================================

#[derive(Default)]
struct LogHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl MessageHandler<MemoryTx> for LogHandler {
    async fn handle(&self, tx: &mut MemoryTx, envelope: &Envelope) -> Result<()> {
        let event: SomethingHappened = envelope.decode()?;
        self.calls.fetch_add(1, Ordering::SeqCst);

        println!(
            "Consumed: {} from {} at {}",
            event.id, event.source, event.occurred_at
        );
        let id = event.id.to_string();
        tx.put("consumed", id, json!({ "source": event.source }));
        Ok(())
    }
}

// ============================================================================
// Main
// ============================================================================

const TICKS: usize = 5;

#[tokio::main]
async fn main() -> Result<()> {
    let backend = MemoryBackend::new();
    let broker = MemoryBroker::new();

    let config = DispatcherConfig::from_env()?
        .with_poll_interval(Duration::from_millis(100));
    let dispatcher = OutboxDispatcher::new(
        backend.outbox("demo"),
        Arc::new(broker.clone()),
        config,
    )?
    .start();

    let handler = Arc::new(LogHandler::default());
    let consumer = Consumer::new(
        backend.inbox("demo-consumer"),
        Arc::new(broker.clone()),
        handler.clone(),
        ConsumerConfig::default(),
    )?
    .start();

    // Producer: one business row plus one outbox message per tick, committed together.
    let writer = OutboxWriter::new(backend.outbox("demo"));
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    for _ in 0..TICKS {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {}
        }

        let event = SomethingHappened {
            id: Uuid::new_v4(),
            source: "outbox-demo".to_string(),
            occurred_at: Utc::now(),
        };

        let mut tx = writer.store().begin().await?;
        let row = serde_json::to_value(&event)?;
        tx.put("events", event.id.to_string(), row);
        writer.append_message(&mut tx, &event).await?;
        tx.commit().await?;

        println!("Produced: {}", event.id);
    }

    wait_for_quiet(&backend, &broker).await;

    println!("Redelivering everything...");
    for row in backend.outbox_rows("demo")? {
        broker.redeliver(row.envelope());
    }
    wait_for_quiet(&backend, &broker).await;

    println!(
        "Handler ran {} times for {} messages ({} inbox records)",
        handler.calls.load(Ordering::SeqCst),
        backend.outbox_rows("demo")?.len(),
        backend.inbox_len("demo-consumer")?,
    );

    dispatcher.shutdown_and_wait().await;
    consumer.shutdown_and_wait().await;

    Ok(())
}

/// Wait until the outbox is drained and the broker holds nothing in flight.
async fn wait_for_quiet(backend: &MemoryBackend, broker: &MemoryBroker) {
    loop {
        let unsent = backend
            .outbox_rows("demo")
            .map(|rows| rows.iter().filter(|row| !row.is_terminal()).count())
            .unwrap_or(0);
        if unsent == 0 && broker.ready_len() == 0 && broker.unacked_len() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
