//! PostgreSQL implementation of the courier outbox and inbox stores.
//!
//! This crate provides the durable backend for `courier-core`: the
//! [`OutboxStore`] and [`InboxStore`] traits over two tables, sharing one
//! transaction type so a consumer can append outbound messages in the same
//! transaction that records the inbound one.
//!
//! # Features
//!
//! - Lease acquisition with `FOR UPDATE SKIP LOCKED`
//! - Conditional updates keyed on the lease owner, so a stale dispatcher
//!   cannot overwrite a newer outcome
//! - `ON CONFLICT DO NOTHING` inbox inserts
//! - Unique violations surface as [`StorageError::Duplicate`]
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE courier_outbox (
//!     id UUID PRIMARY KEY,
//!     endpoint TEXT NOT NULL,
//!     message_type TEXT NOT NULL,
//!     payload BYTEA NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL,
//!
//!     -- Terminal states
//!     sent_at TIMESTAMPTZ,
//!     dead_at TIMESTAMPTZ,
//!
//!     -- Dispatch tracking
//!     attempt_count INTEGER NOT NULL DEFAULT 0,
//!     lease_owner TEXT,
//!     lease_expires_at TIMESTAMPTZ,
//!     last_error TEXT
//! );
//!
//! CREATE TABLE courier_inbox (
//!     endpoint TEXT NOT NULL,
//!     message_id UUID NOT NULL,
//!     consumed_at TIMESTAMPTZ NOT NULL,
//!     PRIMARY KEY (endpoint, message_id)
//! );
//! ```
//!
//! [`PgBackend::migrate`] creates both tables and their indexes idempotently.
//!
//! # Usage
//!
//! ```rust,ignore
//! use courier_core::{OutboxWriter, Storage, Transaction};
//! use courier_postgres::PgBackend;
//!
//! let backend = PgBackend::connect("postgres://localhost/mydb").await?;
//! backend.migrate().await?;
//!
//! let writer = OutboxWriter::new(backend.outbox("orders"));
//! let mut tx = writer.store().begin().await?;
//! sqlx::query("UPDATE orders SET status = 'placed' WHERE id = $1")
//!     .bind(order_id)
//!     .execute(tx.connection())
//!     .await?;
//! writer.append(&mut tx, "orders.placed", payload).await?;
//! tx.commit().await?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{
    InboxRecord, InboxStore, InsertOutcome, LeaseRequest, OutboxMessage, OutboxStats, OutboxStore,
    Storage, StorageError, Transaction,
};
use std::num::TryFromIntError;

use sqlx::postgres::{PgPool, PgRow};
use sqlx::{PgConnection, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

const MIGRATION: &str = include_str!("../migrations/0001_courier.sql");

const OUTBOX: &str = "courier_outbox";
const INBOX: &str = "courier_inbox";
const SCHEMA: &str = "courier schema";
const TRANSACTION: &str = "transaction";

const OUTBOX_COLUMNS: &str = "id, endpoint, message_type, payload, created_at, sent_at, dead_at, \
     attempt_count, lease_owner, lease_expires_at, last_error";

/// Connection pool plus factories for endpoint-scoped stores.
#[derive(Debug, Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let pool = PgPool::connect(url)
            .await
            .map_err(|err| db_error(err, SCHEMA))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the outbox and inbox tables if they do not exist.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&self.pool)
            .await
            .map_err(|err| db_error(err, SCHEMA))?;
        debug!("courier schema migrated");
        Ok(())
    }

    pub fn outbox(&self, endpoint: impl Into<String>) -> PgOutboxStore {
        PgOutboxStore {
            pool: self.pool.clone(),
            endpoint: endpoint.into(),
        }
    }

    pub fn inbox(&self, endpoint: impl Into<String>) -> PgInboxStore {
        PgInboxStore {
            pool: self.pool.clone(),
            endpoint: endpoint.into(),
        }
    }
}

/// An open PostgreSQL transaction.
///
/// Dropping it without committing rolls back.
pub struct PgTransaction {
    inner: sqlx::Transaction<'static, Postgres>,
}

impl PgTransaction {
    /// The connection the transaction runs on, for business SQL that must
    /// commit together with outbox or inbox rows.
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut *self.inner
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn commit(self) -> Result<(), StorageError> {
        self.inner.commit().await.map_err(tx_error)
    }

    async fn rollback(self) -> Result<(), StorageError> {
        self.inner.rollback().await.map_err(tx_error)
    }
}

async fn begin(pool: &PgPool) -> Result<PgTransaction, StorageError> {
    let inner = pool.begin().await.map_err(tx_error)?;
    Ok(PgTransaction { inner })
}

/// Transaction control spans both tables, so conflicts raised here (deferred
/// constraints at commit) name no table.
fn tx_error(err: sqlx::Error) -> StorageError {
    db_error(err, TRANSACTION)
}

/// Map a driver error, reporting unique violations against `table`.
fn db_error(err: sqlx::Error, table: &'static str) -> StorageError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StorageError::Duplicate {
            table,
            key: db.constraint().unwrap_or("primary key").to_string(),
        },
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StorageError::unavailable(err.to_string())
        }
        _ => StorageError::database(err.to_string()),
    }
}

fn outbox_row(row: &PgRow) -> Result<OutboxMessage, sqlx::Error> {
    let attempt_count: i32 = row.try_get("attempt_count")?;
    Ok(OutboxMessage {
        id: row.try_get("id")?,
        endpoint: row.try_get("endpoint")?,
        message_type: row.try_get("message_type")?,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
        sent_at: row.try_get("sent_at")?,
        dead_at: row.try_get("dead_at")?,
        attempt_count: unsigned(attempt_count, "attempt_count")?,
        lease_owner: row.try_get("lease_owner")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        last_error: row.try_get("last_error")?,
    })
}

fn outbox_rows(rows: &[PgRow]) -> Result<Vec<OutboxMessage>, StorageError> {
    rows.iter()
        .map(outbox_row)
        .collect::<Result<_, _>>()
        .map_err(|err| db_error(err, OUTBOX))
}

fn count(row: &PgRow, column: &str) -> Result<u64, StorageError> {
    row.try_get::<i64, _>(column)
        .and_then(|value| unsigned(value, column))
        .map_err(|err| db_error(err, OUTBOX))
}

/// Narrow a signed column to the unsigned type the model uses. A negative
/// value is a decode error, not zero.
fn unsigned<T, U>(value: T, column: &str) -> Result<U, sqlx::Error>
where
    U: TryFrom<T, Error = TryFromIntError>,
{
    U::try_from(value).map_err(|err| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(err),
    })
}

/// Outbox table scoped to one endpoint.
#[derive(Debug, Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
    endpoint: String,
}

impl PgOutboxStore {
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Storage for PgOutboxStore {
    type Tx = PgTransaction;

    async fn begin(&self) -> Result<PgTransaction, StorageError> {
        begin(&self.pool).await
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn insert(
        &self,
        tx: &mut PgTransaction,
        message: &OutboxMessage,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO courier_outbox
                (id, endpoint, message_type, payload, created_at, attempt_count)
            VALUES ($1, $2, $3, $4, $5, 0)
            "#,
        )
        .bind(message.id)
        .bind(&self.endpoint)
        .bind(&message.message_type)
        .bind(&message.payload)
        .bind(message.created_at)
        .execute(tx.connection())
        .await
        .map_err(|err| db_error(err, OUTBOX))?;

        Ok(())
    }

    /// Select and stamp in one statement; `SKIP LOCKED` keeps concurrent
    /// dispatchers from blocking on, or double-leasing, the same rows.
    async fn acquire_leases(
        &self,
        request: LeaseRequest<'_>,
    ) -> Result<Vec<OutboxMessage>, StorageError> {
        let limit = i64::try_from(request.limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            r#"
            WITH leasable AS (
                SELECT id
                FROM courier_outbox
                WHERE endpoint = $1
                  AND sent_at IS NULL
                  AND dead_at IS NULL
                  AND (lease_expires_at IS NULL OR lease_expires_at < $2)
                ORDER BY created_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE courier_outbox
            SET lease_owner = $4,
                lease_expires_at = $5
            WHERE id IN (SELECT id FROM leasable)
            RETURNING {OUTBOX_COLUMNS}
            "#
        ))
        .bind(&self.endpoint)
        .bind(request.now)
        .bind(limit)
        .bind(request.owner)
        .bind(request.expires_at)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| db_error(err, OUTBOX))?;

        let mut leased = outbox_rows(&rows)?;
        leased.sort_by_key(|row| row.created_at);
        Ok(leased)
    }

    async fn mark_sent(
        &self,
        id: Uuid,
        owner: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE courier_outbox
            SET sent_at = $1,
                attempt_count = attempt_count + 1,
                last_error = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE id = $2
              AND endpoint = $3
              AND lease_owner = $4
              AND sent_at IS NULL
              AND dead_at IS NULL
            "#,
        )
        .bind(sent_at)
        .bind(id)
        .bind(&self.endpoint)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(|err| db_error(err, OUTBOX))?;

        Ok(result.rows_affected() == 1)
    }

    /// Keeps the lease and moves its expiry to `retry_at`.
    async fn record_failure(
        &self,
        id: Uuid,
        owner: &str,
        retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE courier_outbox
            SET attempt_count = attempt_count + 1,
                lease_expires_at = $1,
                last_error = $2
            WHERE id = $3
              AND endpoint = $4
              AND lease_owner = $5
              AND sent_at IS NULL
              AND dead_at IS NULL
            "#,
        )
        .bind(retry_at)
        .bind(error)
        .bind(id)
        .bind(&self.endpoint)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(|err| db_error(err, OUTBOX))?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_dead(
        &self,
        id: Uuid,
        owner: &str,
        dead_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE courier_outbox
            SET dead_at = $1,
                attempt_count = attempt_count + 1,
                last_error = $2,
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE id = $3
              AND endpoint = $4
              AND lease_owner = $5
              AND sent_at IS NULL
              AND dead_at IS NULL
            "#,
        )
        .bind(dead_at)
        .bind(error)
        .bind(id)
        .bind(&self.endpoint)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(|err| db_error(err, OUTBOX))?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, ids: &[Uuid], owner: &str) -> Result<u64, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE courier_outbox
            SET lease_owner = NULL,
                lease_expires_at = NULL
            WHERE endpoint = $1
              AND lease_owner = $2
              AND id = ANY($3)
              AND sent_at IS NULL
              AND dead_at IS NULL
            "#,
        )
        .bind(&self.endpoint)
        .bind(owner)
        .bind(ids)
        .execute(&self.pool)
        .await
        .map_err(|err| db_error(err, OUTBOX))?;

        Ok(result.rows_affected())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM courier_outbox WHERE id = $1 AND endpoint = $2"
        ))
        .bind(id)
        .bind(&self.endpoint)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| db_error(err, OUTBOX))?;

        row.as_ref()
            .map(outbox_row)
            .transpose()
            .map_err(|err| db_error(err, OUTBOX))
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<OutboxStats, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (
                    WHERE sent_at IS NULL AND dead_at IS NULL
                      AND (lease_expires_at IS NULL OR lease_expires_at < $2)
                ) AS pending,
                COUNT(*) FILTER (
                    WHERE sent_at IS NULL AND dead_at IS NULL
                      AND lease_expires_at >= $2
                ) AS leased,
                COUNT(*) FILTER (WHERE sent_at IS NOT NULL AND dead_at IS NULL) AS sent,
                COUNT(*) FILTER (WHERE dead_at IS NOT NULL) AS dead
            FROM courier_outbox
            WHERE endpoint = $1
            "#,
        )
        .bind(&self.endpoint)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| db_error(err, OUTBOX))?;

        Ok(OutboxStats {
            pending: count(&row, "pending")?,
            leased: count(&row, "leased")?,
            sent: count(&row, "sent")?,
            dead: count(&row, "dead")?,
        })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<OutboxMessage>, StorageError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM courier_outbox
            WHERE endpoint = $1 AND dead_at IS NOT NULL
            ORDER BY created_at ASC
            LIMIT $2
            "#
        ))
        .bind(&self.endpoint)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|err| db_error(err, OUTBOX))?;

        outbox_rows(&rows)
    }

    async fn requeue_dead(&self, id: Uuid) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE courier_outbox
            SET dead_at = NULL,
                attempt_count = 0,
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE id = $1
              AND endpoint = $2
              AND dead_at IS NOT NULL
            "#,
        )
        .bind(id)
        .bind(&self.endpoint)
        .execute(&self.pool)
        .await
        .map_err(|err| db_error(err, OUTBOX))?;

        Ok(result.rows_affected() == 1)
    }

    async fn prune_sent(&self, older_than: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query(
            r#"
            DELETE FROM courier_outbox
            WHERE endpoint = $1
              AND sent_at < $2
            "#,
        )
        .bind(&self.endpoint)
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(|err| db_error(err, OUTBOX))?;

        Ok(result.rows_affected())
    }
}

/// Inbox table scoped to one endpoint.
#[derive(Debug, Clone)]
pub struct PgInboxStore {
    pool: PgPool,
    endpoint: String,
}

impl PgInboxStore {
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Storage for PgInboxStore {
    type Tx = PgTransaction;

    async fn begin(&self) -> Result<PgTransaction, StorageError> {
        begin(&self.pool).await
    }
}

#[async_trait]
impl InboxStore for PgInboxStore {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn contains(
        &self,
        tx: &mut PgTransaction,
        message_id: Uuid,
    ) -> Result<bool, StorageError> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM courier_inbox WHERE endpoint = $1 AND message_id = $2
            )
            "#,
        )
        .bind(&self.endpoint)
        .bind(message_id)
        .fetch_one(tx.connection())
        .await
        .map_err(|err| db_error(err, INBOX))
    }

    /// A concurrent uncommitted insert of the same key blocks here until it
    /// resolves; if it committed, this reports `AlreadyExists`.
    async fn insert(
        &self,
        tx: &mut PgTransaction,
        record: &InboxRecord,
    ) -> Result<InsertOutcome, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO courier_inbox (endpoint, message_id, consumed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (endpoint, message_id) DO NOTHING
            "#,
        )
        .bind(&self.endpoint)
        .bind(record.message_id)
        .bind(record.consumed_at)
        .execute(tx.connection())
        .await
        .map_err(|err| db_error(err, INBOX))?;

        Ok(if result.rows_affected() == 1 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::AlreadyExists
        })
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query(
            r#"
            DELETE FROM courier_inbox
            WHERE endpoint = $1
              AND consumed_at < $2
            "#,
        )
        .bind(&self.endpoint)
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(|err| db_error(err, INBOX))?;

        Ok(result.rows_affected())
    }
}
