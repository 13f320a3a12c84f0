use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, SqlitePool};
use thiserror::Error;

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for operating on the entitlements table.
    pub fn entitlements(&self) -> EntitlementRepository {
        EntitlementRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for appending to the event log.
    pub fn event_log(&self) -> EventLogRepository {
        EventLogRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository responsible for the `entitlements` table.
#[derive(Clone)]
pub struct EntitlementRepository {
    pool: SqlitePool,
}

impl EntitlementRepository {
    /// Applies one reconciliation write as a merge-upsert keyed by `uid`.
    ///
    /// Flags, email and the event pointer are always overwritten; descriptive
    /// fields only when the change carries a value. `welcome_email_sent_at`
    /// is never touched here, so the returned row reflects whether a welcome
    /// email was already sent before this write.
    pub async fn apply(
        &self,
        change: EntitlementChange<'_>,
    ) -> Result<EntitlementRecord, EntitlementError> {
        let record = sqlx::query_as::<_, EntitlementRecord>(
            "INSERT INTO entitlements \
             (uid, email, active, pending, source, product_id, product_title, \
              invoice_id, invoice_status, last_event_id, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(uid) DO UPDATE \
             SET email = excluded.email, \
                 active = excluded.active, \
                 pending = excluded.pending, \
                 product_id = COALESCE(excluded.product_id, product_id), \
                 product_title = COALESCE(excluded.product_title, product_title), \
                 invoice_id = COALESCE(excluded.invoice_id, invoice_id), \
                 invoice_status = COALESCE(excluded.invoice_status, invoice_status), \
                 last_event_id = excluded.last_event_id, \
                 updated_at = excluded.updated_at \
             RETURNING uid, email, active, pending, source, product_id, product_title, \
                       invoice_id, invoice_status, last_event_id, updated_at, \
                       welcome_email_sent_at",
        )
        .bind(change.uid)
        .bind(change.email)
        .bind(change.active)
        .bind(change.pending)
        .bind(change.source)
        .bind(change.product_id)
        .bind(change.product_title)
        .bind(change.invoice_id)
        .bind(change.invoice_status)
        .bind(change.last_event_id)
        .bind(to_rfc3339(change.updated_at))
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    /// Loads a single entitlement row.
    pub async fn fetch(&self, uid: &str) -> Result<Option<EntitlementRecord>, EntitlementError> {
        let record = sqlx::query_as::<_, EntitlementRecord>(
            "SELECT uid, email, active, pending, source, product_id, product_title, \
                    invoice_id, invoice_status, last_event_id, updated_at, \
                    welcome_email_sent_at \
             FROM entitlements WHERE uid = ?",
        )
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Stamps `welcome_email_sent_at` if it is still unset.
    ///
    /// Returns `false` when another writer stamped it first, which callers
    /// treat as "already sent".
    pub async fn mark_welcome_sent(
        &self,
        uid: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, EntitlementError> {
        let result = sqlx::query(
            "UPDATE entitlements SET welcome_email_sent_at = ? \
             WHERE uid = ? AND welcome_email_sent_at IS NULL",
        )
        .bind(to_rfc3339(at))
        .bind(uid)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

/// Data required to apply one reconciliation write.
#[derive(Clone)]
pub struct EntitlementChange<'a> {
    pub uid: &'a str,
    pub email: &'a str,
    pub active: bool,
    pub pending: bool,
    pub source: &'a str,
    pub product_id: Option<&'a str>,
    pub product_title: Option<&'a str>,
    pub invoice_id: Option<&'a str>,
    pub invoice_status: Option<&'a str>,
    pub last_event_id: &'a str,
    pub updated_at: DateTime<Utc>,
}

/// Entitlement row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EntitlementRecord {
    pub uid: String,
    pub email: String,
    pub active: bool,
    pub pending: bool,
    pub source: String,
    pub product_id: Option<String>,
    pub product_title: Option<String>,
    pub invoice_id: Option<String>,
    pub invoice_status: Option<String>,
    pub last_event_id: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub welcome_email_sent_at: Option<DateTime<Utc>>,
}

/// Errors that can occur while mutating entitlements.
#[derive(Debug, Error)]
pub enum EntitlementError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository responsible for the `event_log` table.
#[derive(Clone)]
pub struct EventLogRepository {
    pool: SqlitePool,
}

impl EventLogRepository {
    /// Records one inbound event, keyed by its deduplication id.
    ///
    /// A replayed event id leaves the original row untouched and reports
    /// [`EventLogOutcome::Replayed`].
    pub async fn record(&self, record: NewEventLog<'_>) -> Result<EventLogOutcome, EventLogError> {
        let result = sqlx::query(
            "INSERT INTO event_log \
             (event_id, received_at, event, email, invoice_id, invoice_status, \
              product_id, product_title, payload_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(event_id) DO NOTHING",
        )
        .bind(record.event_id)
        .bind(to_rfc3339(record.received_at))
        .bind(record.event)
        .bind(record.email)
        .bind(record.invoice_id)
        .bind(record.invoice_status)
        .bind(record.product_id)
        .bind(record.product_title)
        .bind(record.payload_json)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(EventLogOutcome::Replayed)
        } else {
            Ok(EventLogOutcome::Recorded)
        }
    }
}

/// Result of attempting to record an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLogOutcome {
    Recorded,
    Replayed,
}

impl EventLogOutcome {
    pub fn is_replay(self) -> bool {
        matches!(self, Self::Replayed)
    }
}

/// Data required to record an event.
#[derive(Clone)]
pub struct NewEventLog<'a> {
    pub event_id: &'a str,
    pub received_at: DateTime<Utc>,
    pub event: &'a str,
    pub email: Option<&'a str>,
    pub invoice_id: Option<&'a str>,
    pub invoice_status: Option<&'a str>,
    pub product_id: Option<&'a str>,
    pub product_title: Option<&'a str>,
    pub payload_json: &'a str,
}

/// Errors that can occur while appending to the event log.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
