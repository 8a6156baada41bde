//! Outbox dispatcher.
//!
//! Each cycle leases a batch of unsent rows, publishes them one by one and
//! records the outcome of every attempt:
//!
//! ```text
//! acquire_leases(owner, now, now + lease_duration, batch_size)
//!     │
//!     ├─► recently published? ──► mark_sent (no resend)
//!     │
//!     └─► BrokerClient::send (bounded by send_timeout)
//!             ├─ Ok ─────────────────────► mark_sent
//!             ├─ Retryable, budget left ─► record_failure(retry_at = now + backoff)
//!             └─ NonRetryable / budget spent ─► mark_dead
//! ```
//!
//! Lease acquisition is the only point where instances exclude each other.
//! Sending and recording run without further coordination because a leased row
//! is invisible to other instances until the lease expires.

mod backoff;
mod dedup;

pub use backoff::RetryPolicy;
pub use dedup::DuplicateWindow;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::BrokerClient;
use crate::clock::{offset, Clock, SystemClock};
use crate::config::DispatcherConfig;
use crate::error::{BrokerError, FailureKind, Result, StorageError};
use crate::message::OutboxMessage;
use crate::store::{LeaseRequest, OutboxStore};

/// What one dispatch cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub leased: usize,
    pub sent: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Marked sent without publishing again (duplicate-detection window hit).
    pub suppressed: usize,
    /// Leases handed back unattempted because shutdown was requested.
    pub released: usize,
    /// Outcomes that could not be recorded because the lease had moved on.
    pub lease_lost: usize,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.leased == 0
    }
}

enum Attempt {
    Published,
    Suppressed,
    Failed(BrokerError),
}

/// Drains one endpoint's outbox to a broker.
pub struct OutboxDispatcher<S> {
    store: S,
    broker: Arc<dyn BrokerClient>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    retry: RetryPolicy,
    owner: String,
    recent: DuplicateWindow,
    shutdown: CancellationToken,
}

impl<S: OutboxStore> OutboxDispatcher<S> {
    /// Build a dispatcher with a random owner token. Fails if `config` does
    /// not validate.
    pub fn new(store: S, broker: Arc<dyn BrokerClient>, config: DispatcherConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            broker,
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::from_config(&config),
            owner: format!("dispatcher-{}", Uuid::new_v4().simple()),
            recent: DuplicateWindow::new(config.duplicate_detection_window),
            shutdown: CancellationToken::new(),
            config,
        })
    }

    /// Use a stable owner token instead of a random one.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Token that stops the loop; cancelling it mid-cycle releases the rest
    /// of the batch.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run one lease → send → record pass.
    ///
    /// A storage error aborts the cycle. The rows not yet attempted are
    /// released on a best-effort basis first; the row whose outcome could not
    /// be recorded stays leased until its lease expires.
    pub async fn run_cycle(&self) -> Result<CycleReport, StorageError> {
        let now = self.clock.now();
        self.recent.purge(now);

        let batch = self
            .store
            .acquire_leases(LeaseRequest {
                owner: &self.owner,
                now,
                expires_at: offset(now, self.config.lease_duration),
                limit: self.config.batch_size,
            })
            .await?;

        let mut report = CycleReport {
            leased: batch.len(),
            ..Default::default()
        };

        for (index, message) in batch.iter().enumerate() {
            if self.shutdown.is_cancelled() {
                report.released = self.release(&batch[index..]).await?;
                info!(
                    owner = %self.owner,
                    released = report.released,
                    "shutdown requested, released unattempted leases"
                );
                break;
            }

            if let Err(err) = self.dispatch(message, &mut report).await {
                match self.release(&batch[index + 1..]).await {
                    Ok(released) => warn!(
                        owner = %self.owner,
                        released,
                        error = %err,
                        "dispatch cycle aborted, released unattempted leases"
                    ),
                    Err(release_err) => warn!(
                        owner = %self.owner,
                        error = %release_err,
                        "could not release leases after aborted cycle"
                    ),
                }
                return Err(err);
            }
        }

        Ok(report)
    }

    /// Hand leases on `rows` back so any instance can pick them up now.
    async fn release(&self, rows: &[OutboxMessage]) -> Result<usize, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
        let released = self.store.release(&ids, &self.owner).await?;
        Ok(released as usize)
    }

    async fn dispatch(
        &self,
        message: &OutboxMessage,
        report: &mut CycleReport,
    ) -> Result<(), StorageError> {
        let attempt = if self.recent.contains(message.id, self.clock.now()) {
            debug!(message_id = %message.id, "message published recently, skipping resend");
            Attempt::Suppressed
        } else {
            match self.send(message).await {
                Ok(()) => Attempt::Published,
                Err(err) => Attempt::Failed(err),
            }
        };

        let recorded = match attempt {
            Attempt::Published => {
                let sent_at = self.clock.now();
                self.recent.record(message.id, sent_at);
                let recorded = self
                    .store
                    .mark_sent(message.id, &self.owner, sent_at)
                    .await?;
                report.sent += usize::from(recorded);
                recorded
            }
            Attempt::Suppressed => {
                let recorded = self
                    .store
                    .mark_sent(message.id, &self.owner, self.clock.now())
                    .await?;
                report.suppressed += usize::from(recorded);
                recorded
            }
            Attempt::Failed(err) => self.record_failure(message, err, report).await?,
        };

        if !recorded {
            report.lease_lost += 1;
            warn!(
                message_id = %message.id,
                owner = %self.owner,
                "lease lost before outcome could be recorded"
            );
        }
        Ok(())
    }

    async fn send(&self, message: &OutboxMessage) -> Result<(), BrokerError> {
        let envelope = message.envelope();
        let timeout = self.config.send_timeout;
        match time::timeout(timeout, self.broker.send(&envelope)).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout(timeout)),
        }
    }

    async fn record_failure(
        &self,
        message: &OutboxMessage,
        err: BrokerError,
        report: &mut CycleReport,
    ) -> Result<bool, StorageError> {
        let attempt = message.attempt_count + 1;
        let failed_at = self.clock.now();
        let reason = err.to_string();
        let exhausted = attempt >= self.config.max_attempts;

        if err.kind() == FailureKind::NonRetryable || exhausted {
            let recorded = self
                .store
                .mark_dead(message.id, &self.owner, failed_at, &reason)
                .await?;
            if recorded {
                report.dead_lettered += 1;
                error!(
                    message_id = %message.id,
                    message_type = %message.message_type,
                    endpoint = self.store.endpoint(),
                    attempt,
                    error = %reason,
                    "outbox message dead-lettered"
                );
            }
            return Ok(recorded);
        }

        let delay = self.retry.delay(attempt);
        let recorded = self
            .store
            .record_failure(message.id, &self.owner, offset(failed_at, delay), &reason)
            .await?;
        if recorded {
            report.retried += 1;
            warn!(
                message_id = %message.id,
                attempt,
                retry_in = ?delay,
                error = %reason,
                "publish failed, retry scheduled"
            );
        }
        Ok(recorded)
    }

    /// Cycle until a batch comes back short or shutdown is requested.
    async fn drain(&self) {
        loop {
            match self.run_cycle().await {
                Ok(report) => {
                    if !report.is_idle() {
                        debug!(owner = %self.owner, ?report, "dispatch cycle finished");
                    }
                    if report.leased < self.config.batch_size || self.shutdown.is_cancelled() {
                        break;
                    }
                }
                Err(err) => {
                    error!(owner = %self.owner, error = %err, "dispatch cycle failed");
                    break;
                }
            }
        }
    }

    async fn run(self: Arc<Self>) {
        info!(
            owner = %self.owner,
            endpoint = self.store.endpoint(),
            "outbox dispatcher started"
        );

        let mut ticker = time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.drain().await,
            }
        }

        info!(owner = %self.owner, "outbox dispatcher stopped");
    }

    /// Spawn the poll loop.
    pub fn start(self) -> DispatcherHandle
    where
        S: 'static,
    {
        let token = self.shutdown.clone();
        let grace = self.config.shutdown_grace;
        let task = tokio::spawn(Arc::new(self).run());
        DispatcherHandle {
            token,
            task: Some(task),
            grace,
        }
    }
}

/// Handle to a running dispatcher. Dropping it requests shutdown.
pub struct DispatcherHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
    grace: Duration,
}

impl DispatcherHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|task| task.is_finished())
    }

    /// Wait for the loop to exit on its own.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Request shutdown and wait up to the configured grace period. Returns
    /// `false` if the loop had to be aborted; leases it held will expire.
    pub async fn shutdown_and_wait(mut self) -> bool {
        self.shutdown();
        let Some(mut task) = self.task.take() else {
            return true;
        };
        match time::timeout(self.grace, &mut task).await {
            Ok(_) => true,
            Err(_) => {
                warn!(grace = ?self.grace, "dispatcher did not stop in time, aborting");
                task.abort();
                false
            }
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
