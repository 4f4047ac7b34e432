//! Backend registry.
//!
//! Maps backend names to factories. Each factory is loaded lazily, at most
//! once per registry, and shared by every later connection. Only the factory
//! is cached; every `connect` call still opens its own connection.

use once_cell::sync::OnceCell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::config::Settings;
use crate::error::Result;
use crate::store::KvStore;

/// Factory for connections to one storage engine.
pub trait Backend: Send + Sync {
    /// The name this backend is registered under.
    fn name(&self) -> &str;

    /// Start connecting with the merged settings.
    ///
    /// Backends that connect asynchronously return a
    /// [`ConnectionProxy`](crate::ConnectionProxy); instant backends return
    /// the store itself.
    fn connect(&self, settings: Settings) -> Result<Arc<dyn KvStore>>;
}

type Loader = Box<dyn Fn() -> Arc<dyn Backend> + Send + Sync>;

struct Entry {
    loader: Loader,
    loaded: OnceCell<Arc<dyn Backend>>,
}

/// Explicit name → backend table.
#[derive(Default)]
pub struct BackendRegistry {
    entries: BTreeMap<String, Entry>,
}

impl BackendRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the memory, sqlite and memcached backends.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("memory", || Arc::new(crate::memory::MemoryBackend));
        registry.register("sqlite", || Arc::new(crate::sqlite::SqliteBackend));
        registry.register("memcached", || Arc::new(crate::memcached::MemcachedBackend));
        registry
    }

    /// Register a backend loader under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, loader: F)
    where
        F: Fn() -> Arc<dyn Backend> + Send + Sync + 'static,
    {
        self.entries.insert(
            name.into(),
            Entry {
                loader: Box::new(loader),
                loaded: OnceCell::new(),
            },
        );
    }

    /// Get the backend for `name`, loading it on first use.
    pub fn load(&self, name: &str) -> Option<Arc<dyn Backend>> {
        let entry = self.entries.get(name)?;
        let backend = entry.loaded.get_or_init(|| {
            debug!(backend = name, "Loading backend");
            (entry.loader)()
        });
        Some(Arc::clone(backend))
    }

    /// Whether a backend is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Whether the backend for `name` has been loaded.
    pub fn is_loaded(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .is_some_and(|entry| entry.loaded.get().is_some())
    }

    /// Registered backend names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_builtin_names() {
        let registry = BackendRegistry::with_builtin();
        assert_eq!(registry.names(), vec!["memcached", "memory", "sqlite"]);
        assert!(registry.contains("sqlite"));
        assert!(!registry.contains("mysql"));
    }

    #[test]
    fn test_load_is_lazy_and_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);

        let mut registry = BackendRegistry::new();
        registry.register("memory", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(MemoryBackend)
        });

        assert!(!registry.is_loaded("memory"));
        assert_eq!(loads.load(Ordering::SeqCst), 0);

        let first = registry.load("memory").unwrap();
        let second = registry.load("memory").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(registry.is_loaded("memory"));
    }

    #[test]
    fn test_load_unknown() {
        let registry = BackendRegistry::with_builtin();
        assert!(registry.load("couchbase").is_none());
        assert!(!registry.is_loaded("couchbase"));
    }
}
