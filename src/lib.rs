//! # univrs-kv
//!
//! Uniform key-value access layer for the Univrs ecosystem.
//!
//! Application code issues `get`/`set`/`cas`/`delete` against a
//! [`KvStore`] without knowing which backend is behind it:
//!
//! - **Deferred connections**: handles are usable before the backend
//!   connection exists; calls are queued and replayed in order once it
//!   resolves, or failed together if it does not.
//! - **Cross-backend CAS**: `get` returns an opaque [`CasId`], `cas`
//!   consumes it, whatever token scheme the backend uses.
//! - **Layered configuration**: global, per-backend and per-call settings.
//!
//! ## Backends
//!
//! - [`MemoryStore`]: in-process store with selectable token strategies
//! - [`SqliteStore`]: embedded SQLite database with a per-row CAS counter
//! - [`MemcachedStore`]: memcached text protocol with native CAS uniques
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use univrs_kv::{ConnectOptions, Connector, KvConfig, KvStore};
//!
//! #[tokio::main]
//! async fn main() -> univrs_kv::Result<()> {
//!     let config = KvConfig::new()
//!         .with_backend("sqlite")
//!         .with_backend_setting("sqlite", "path", "/tmp/kv.db");
//!     let connector = Connector::new(config);
//!
//!     // Usable immediately; calls wait for the connection.
//!     let db = connector.connect(ConnectOptions::new())?;
//!     db.set("mydata", json!("hello")).await?;
//!
//!     let record = db.get("mydata").await?.unwrap();
//!     db.cas("mydata", json!("hello world"), Some(record.casid)).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Retrying on conflict
//!
//! ```rust,no_run
//! use univrs_kv::{KvStore, KvStoreExt};
//!
//! async fn increment(db: &dyn KvStore, key: &str) -> univrs_kv::Result<u64> {
//!     loop {
//!         let (next, casid) = match db.get_as::<u64>(key).await? {
//!             Some((n, casid)) => (n + 1, Some(casid)),
//!             None => (1, None),
//!         };
//!         match db.cas_as(key, &next, casid).await {
//!             Ok(()) => return Ok(next),
//!             Err(e) if e.is_retryable() => continue,
//!             Err(e) => return Err(e),
//!         }
//!     }
//! }
//! ```

pub mod config;
pub mod connector;
pub mod error;
pub mod memcached;
pub mod memory;
pub mod proxy;
pub mod registry;
pub mod sqlite;
pub mod store;

#[cfg(test)]
mod testing;

// Re-export main types
pub use config::{ConnectOptions, KvConfig, Settings};
pub use connector::Connector;
pub use error::{KvError, Result};
pub use memcached::{MemcachedBackend, MemcachedOptions, MemcachedStore};
pub use memory::{MemoryBackend, MemoryOptions, MemoryStore, TokenStrategy};
pub use proxy::{ConnectionProxy, Operation, ProxyResolver};
pub use registry::{Backend, BackendRegistry};
pub use sqlite::{SqliteBackend, SqliteOptions, SqliteStore};
pub use store::{CasId, KvStore, KvStoreExt, Record, MAX_KEY_LENGTH};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::{ConnectOptions, KvConfig};
    pub use crate::connector::Connector;
    pub use crate::error::{KvError, Result};
    pub use crate::proxy::ConnectionProxy;
    pub use crate::store::{CasId, KvStore, KvStoreExt, Record};
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryStore::new();

        store.set("test", json!("value")).await.unwrap();
        let record = store.get("test").await.unwrap().unwrap();
        assert_eq!(record.value, json!("value"));
    }

    #[tokio::test]
    async fn test_stores_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}

        assert_send_sync::<MemoryStore>();
        assert_send_sync::<SqliteStore>();
        assert_send_sync::<MemcachedStore>();
        assert_send_sync::<ConnectionProxy>();
        assert_send_sync::<Connector>();
    }

    #[tokio::test]
    async fn test_typed_retry_loop() {
        let db: std::sync::Arc<dyn KvStore> = std::sync::Arc::new(MemoryStore::new());

        for expected in 1..=3u64 {
            let (next, casid) = match db.get_as::<u64>("counter").await.unwrap() {
                Some((n, casid)) => (n + 1, Some(casid)),
                None => (1, None),
            };
            db.cas_as("counter", &next, casid).await.unwrap();
            assert_eq!(next, expected);
        }
    }
}
