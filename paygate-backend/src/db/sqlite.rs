//! SQLite connection pool and schema
//!
//! Table operations live in `tables/` as further `impl Database` blocks.
//! They are synchronous; async callers go through [`Database::run_blocking`].

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::time::Duration;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConn = PooledConnection<SqliteConnectionManager>;

const POOL_SIZE: u32 = 8;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS payment_nonces (
    nonce TEXT PRIMARY KEY,
    claimant TEXT NOT NULL,
    state TEXT NOT NULL,
    claimed_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_payment_nonces_state_updated
    ON payment_nonces(state, updated_at);

CREATE TABLE IF NOT EXISTS session_wallets (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    session_address TEXT NOT NULL UNIQUE,
    key_iv TEXT,
    key_ciphertext TEXT,
    spending_cap TEXT NOT NULL,
    spent TEXT NOT NULL,
    status TEXT NOT NULL,
    approval_tx TEXT,
    refund_token_tx TEXT,
    refund_token_amount TEXT NOT NULL DEFAULT '0',
    refund_token_path TEXT,
    refund_native_tx TEXT,
    refund_native_amount TEXT NOT NULL DEFAULT '0',
    refund_native_dust TEXT NOT NULL DEFAULT '0',
    refunded_at TEXT,
    last_error TEXT,
    in_doubt_payments TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_session_wallets_owner
    ON session_wallets(owner, created_at);
";

#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Open (creating if needed) the database at `database_url`.
    /// `:memory:` gives a private in-memory database.
    pub fn new(database_url: &str) -> Result<Self, String> {
        if database_url == ":memory:" {
            return Self::open_in_memory();
        }

        if let Some(parent) = Path::new(database_url).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("Failed to create database directory: {}", e))?;
            }
        }

        let manager = SqliteConnectionManager::file(database_url).with_init(|conn| {
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
        });
        let pool = Pool::builder()
            .max_size(POOL_SIZE)
            .build(manager)
            .map_err(|e| format!("Failed to open database {}: {}", database_url, e))?;

        let db = Self { pool };
        db.init_schema()?;
        log::info!("[DB] Opened {}", database_url);
        Ok(db)
    }

    /// Single-connection pool so every checkout sees the same in-memory database
    pub fn open_in_memory() -> Result<Self, String> {
        let pool = Pool::builder()
            .max_size(1)
            .min_idle(Some(1))
            .idle_timeout(None)
            .max_lifetime(None)
            .build(SqliteConnectionManager::memory())
            .map_err(|e| format!("Failed to open in-memory database: {}", e))?;

        let db = Self { pool };
        db.init_schema()?;
        Ok(db)
    }

    pub fn conn(&self) -> Result<DbConn, String> {
        self.pool
            .get()
            .map_err(|e| format!("Database pool error: {}", e))
    }

    fn init_schema(&self) -> Result<(), String> {
        self.conn()?
            .execute_batch(SCHEMA)
            .map_err(|e| format!("Failed to create schema: {}", e))
    }

    /// Run a synchronous table operation on the blocking pool
    pub async fn run_blocking<T, F>(&self, op: F) -> Result<T, String>
    where
        F: FnOnce(&Database) -> Result<T, String> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(|e| format!("Database task failed: {}", e))?
    }
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp '{}': {}", value, e)))
}

pub(crate) fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, message.into())
}
