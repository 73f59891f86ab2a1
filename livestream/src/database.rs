//! Persistence bootstrap.
//!
//! The live-stream path does not query the database; it only needs the schema
//! to exist before the rest of the application starts. `initialize` is run
//! once at startup and a failure there is fatal.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;

use crate::Result;

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

const DEFAULT_POOL_SIZE: u32 = 5;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Ordered, idempotent table creation. Later tables reference earlier ones.
const SCHEMA: &[(&str, &str)] = &[
    (
        "services",
        "CREATE TABLE IF NOT EXISTS services (
            id INTEGER PRIMARY KEY,
            service_id INTEGER NOT NULL,
            network_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            channel_type TEXT NOT NULL,
            channel TEXT NOT NULL,
            remote_control_key_id INTEGER
        )",
    ),
    (
        "programs",
        "CREATE TABLE IF NOT EXISTS programs (
            id INTEGER PRIMARY KEY,
            channel_id INTEGER NOT NULL REFERENCES services(id) ON DELETE CASCADE,
            start_at INTEGER NOT NULL,
            end_at INTEGER NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            genre1 INTEGER,
            genre2 INTEGER
        )",
    ),
    (
        "rules",
        "CREATE TABLE IF NOT EXISTS rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            keyword TEXT,
            ignore_keyword TEXT,
            channel_id INTEGER,
            enable INTEGER NOT NULL DEFAULT 1
        )",
    ),
    (
        "recorded",
        "CREATE TABLE IF NOT EXISTS recorded (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            program_id INTEGER NOT NULL,
            channel_id INTEGER NOT NULL,
            rule_id INTEGER REFERENCES rules(id) ON DELETE SET NULL,
            name TEXT NOT NULL,
            start_at INTEGER NOT NULL,
            end_at INTEGER NOT NULL,
            recorded_path TEXT,
            recording INTEGER NOT NULL DEFAULT 0
        )",
    ),
    (
        "encoded",
        "CREATE TABLE IF NOT EXISTS encoded (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            recorded_id INTEGER NOT NULL REFERENCES recorded(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            path TEXT NOT NULL,
            file_size INTEGER
        )",
    ),
    (
        "recorded_history",
        "CREATE TABLE IF NOT EXISTS recorded_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            end_at INTEGER NOT NULL
        )",
    ),
];

/// Storage bootstrap capability.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Create every table the application needs. Safe to call repeatedly.
    async fn initialize(&self) -> Result<()>;
}

pub struct SqliteDatastore {
    pool: DbPool,
}

impl SqliteDatastore {
    /// Open (creating if missing) the SQLite database at `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_POOL_SIZE)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(connect_options)
            .await?;

        tracing::info!("Database pool initialized, {} max connections", DEFAULT_POOL_SIZE);

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl Datastore for SqliteDatastore {
    async fn initialize(&self) -> Result<()> {
        tracing::info!("Creating database tables...");
        for (table, statement) in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
            tracing::debug!(table, "Table ready");
        }
        tracing::info!("Database tables ready");
        Ok(())
    }
}
