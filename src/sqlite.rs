//! SQLite key-value store implementation.
//!
//! Each key is one row holding the JSON-encoded value and an integer CAS
//! counter:
//!
//! - `set` upserts and bumps the counter (`kv_casid = kv_casid + 1`)
//! - `cas` with a token is a row-level conditional `UPDATE ... AND kv_casid = ?`
//! - `cas` without a token is `INSERT ... ON CONFLICT DO NOTHING`
//!
//! In both conditional cases zero affected rows means a CAS mismatch.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{parse_settings, Settings};
use crate::error::{KvError, Result};
use crate::proxy::ConnectionProxy;
use crate::registry::Backend;
use crate::store::{decode_value, encode_value, validate_key, CasId, KvStore, Record};

const MEMORY_PATH: &str = ":memory:";

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS kvstore (
        kv_key TEXT PRIMARY KEY NOT NULL,
        kv_value TEXT NOT NULL,
        kv_casid INTEGER NOT NULL
    )
"#;

const GET_ITEM: &str = "SELECT kv_value, kv_casid FROM kvstore WHERE kv_key = ?";

const SET_ITEM: &str = r#"
    INSERT INTO kvstore (kv_key, kv_value, kv_casid)
    VALUES (?, ?, 0)
    ON CONFLICT(kv_key) DO UPDATE SET
        kv_value = excluded.kv_value,
        kv_casid = kv_casid + 1
"#;

const ADD_ITEM: &str = r#"
    INSERT INTO kvstore (kv_key, kv_value, kv_casid)
    VALUES (?, ?, 0)
    ON CONFLICT(kv_key) DO NOTHING
"#;

const CAS_ITEM: &str =
    "UPDATE kvstore SET kv_value = ?, kv_casid = kv_casid + 1 WHERE kv_key = ? AND kv_casid = ?";

const DEL_ITEM: &str = "DELETE FROM kvstore WHERE kv_key = ?";

/// Options recognized by the sqlite backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteOptions {
    /// Database file, or `:memory:`.
    pub path: String,
    /// Connection pool size. Forced to 1 for in-memory databases.
    pub max_connections: u32,
    /// Create the database file and table if missing.
    pub create_schema: bool,
    /// How long to wait on a locked database.
    pub busy_timeout_ms: u64,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            path: MEMORY_PATH.to_string(),
            max_connections: 5,
            create_schema: true,
            busy_timeout_ms: 30_000,
        }
    }
}

impl SqliteOptions {
    fn is_memory(&self) -> bool {
        self.path == MEMORY_PATH
    }
}

/// SQLite implementation of KvStore.
///
/// Uses WAL mode for file-backed databases.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open or create a SQLite store at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(SqliteOptions {
            path: path.as_ref().display().to_string(),
            ..SqliteOptions::default()
        })
        .await
    }

    /// Create an in-memory SQLite store (for testing).
    pub async fn in_memory() -> Result<Self> {
        Self::open_with(SqliteOptions::default()).await
    }

    /// Open a store with explicit options.
    pub async fn open_with(options: SqliteOptions) -> Result<Self> {
        info!("Opening SQLite store at {:?}", options.path);

        let busy_timeout = Duration::from_millis(options.busy_timeout_ms);
        let (connect_options, pool_options) = if options.is_memory() {
            let connect = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| KvError::ConnectionError(e.to_string()))?;
            // Every pooled connection would otherwise see its own database.
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
            (connect, pool)
        } else {
            let connect = SqliteConnectOptions::new()
                .filename(&options.path)
                .create_if_missing(options.create_schema)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
            let pool = SqlitePoolOptions::new().max_connections(options.max_connections.max(1));
            (connect, pool)
        };

        let pool = pool_options
            .connect_with(connect_options.busy_timeout(busy_timeout))
            .await
            .map_err(|e| KvError::ConnectionError(e.to_string()))?;

        let store = Self { pool };
        if options.create_schema {
            store.init_schema().await?;
        }
        Ok(store)
    }

    /// Start opening a store in the background and return a proxy for it.
    pub fn connect(options: SqliteOptions) -> ConnectionProxy {
        ConnectionProxy::connecting(async move {
            let store = Self::open_with(options).await?;
            Ok(Arc::new(store) as Arc<dyn KvStore>)
        })
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;

        debug!("SQLite schema initialized");
        Ok(())
    }

    /// Drop the table and close the pool.
    pub async fn close_and_remove(&self) -> Result<()> {
        sqlx::query("DROP TABLE IF EXISTS kvstore")
            .execute(&self.pool)
            .await?;
        self.pool.close().await;
        Ok(())
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Record>> {
        validate_key(key)?;

        let row: Option<(String, i64)> = sqlx::query_as(GET_ITEM)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some((text, casid)) => {
                let value = decode_value(&text)?;
                Ok(Some(Record::new(value, CasId::new(casid as u64))))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        validate_key(key)?;
        let text = encode_value(&value)?;

        sqlx::query(SET_ITEM)
            .bind(key)
            .bind(&text)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cas(&self, key: &str, value: Value, casid: Option<CasId>) -> Result<()> {
        validate_key(key)?;
        let text = encode_value(&value)?;

        let result = match casid {
            None => {
                sqlx::query(ADD_ITEM)
                    .bind(key)
                    .bind(&text)
                    .execute(&self.pool)
                    .await?
            }
            Some(casid) => {
                sqlx::query(CAS_ITEM)
                    .bind(&text)
                    .bind(key)
                    .bind(casid.as_u64() as i64)
                    .execute(&self.pool)
                    .await?
            }
        };

        if result.rows_affected() == 0 {
            return Err(KvError::cas_mismatch(key));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;

        sqlx::query(DEL_ITEM).bind(key).execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        debug!("SQLite store closed");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Backend factory for [`SqliteStore`].
pub struct SqliteBackend;

impl Backend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn connect(&self, settings: Settings) -> Result<Arc<dyn KvStore>> {
        let options: SqliteOptions = parse_settings(self.name(), settings)?;
        Ok(Arc::new(SqliteStore::connect(options)))
    }
}
