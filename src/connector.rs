//! Store facade: picks a backend by name and opens a handle to it.

use std::sync::Arc;
use tracing::info;

use crate::config::{ConnectOptions, KvConfig};
use crate::error::{KvError, Result};
use crate::registry::BackendRegistry;
use crate::store::KvStore;

/// Opens [`KvStore`] handles from layered configuration.
///
/// The returned handle is usable immediately. For backends that connect
/// asynchronously it is a [`ConnectionProxy`](crate::ConnectionProxy) that
/// queues calls until the connection resolves.
#[derive(Debug)]
pub struct Connector {
    config: KvConfig,
    registry: BackendRegistry,
}

impl Connector {
    /// Create a connector with the built-in backends.
    pub fn new(config: KvConfig) -> Self {
        Self::with_registry(config, BackendRegistry::with_builtin())
    }

    /// Create a connector over a custom registry.
    pub fn with_registry(config: KvConfig, registry: BackendRegistry) -> Self {
        Self { config, registry }
    }

    /// The default configuration.
    pub fn config(&self) -> &KvConfig {
        &self.config
    }

    /// The backend registry.
    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Open a handle using `options` over the configured defaults.
    ///
    /// Fails with [`KvError::UnknownBackend`] when the backend is not
    /// registered or not listed in `available_backends`.
    ///
    /// Backends that connect in the background (`sqlite`, `memcached`) need a
    /// tokio runtime. Called outside one, this still returns a handle, but
    /// every call on it fails with [`KvError::ConnectionError`].
    pub fn connect(&self, options: ConnectOptions) -> Result<Arc<dyn KvStore>> {
        let (name, settings) = self.config.resolve(&options)?;

        if let Some(available) = self.config.available_backends() {
            if !available.iter().any(|b| *b == name) {
                return Err(KvError::UnknownBackend(name));
            }
        }

        let backend = self
            .registry
            .load(&name)
            .ok_or_else(|| KvError::UnknownBackend(name.clone()))?;

        info!(backend = %name, "Connecting to kv store");
        backend.connect(settings)
    }
}

impl Default for Connector {
    fn default() -> Self {
        Self::new(KvConfig::default())
    }
}
