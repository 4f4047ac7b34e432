//! Layered configuration for backend connections.
//!
//! Settings come from three layers, lowest to highest precedence:
//!
//! 1. global defaults (the `[kvstore]` table),
//! 2. backend defaults (the `[<backend>]` table, e.g. `[sqlite]`),
//! 3. per-call overrides ([`ConnectOptions`]).
//!
//! Later layers win per key. Nested tables are merged one level deep.
//! Each backend deserializes the merged map into its own options type and
//! ignores fields it does not recognize.
//!
//! ```toml
//! [kvstore]
//! backend = "sqlite"
//!
//! [sqlite]
//! path = "/var/lib/app/kv.db"
//! create_schema = true
//! ```

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use crate::error::{KvError, Result};

/// A flat map of backend settings.
pub type Settings = Map<String, Value>;

/// Backend used when no layer names one.
pub const DEFAULT_BACKEND: &str = "memory";

/// Environment variables recognized by [`KvConfig::apply_env`]:
/// `(variable, table, field)`.
const ENV_OVERRIDES: &[(&str, &str, &str)] = &[
    ("KVSTORE_BACKEND", "kvstore", "backend"),
    ("SQLITE_PATH", "sqlite", "path"),
    ("MEMCACHED_HOSTS", "memcached", "hosts"),
    ("MEMCACHED_LIFETIME", "memcached", "lifetime"),
];

/// Default settings for every connection made by a [`Connector`](crate::Connector).
#[derive(Debug, Clone, Default)]
pub struct KvConfig {
    /// Global layer, applied to every backend.
    pub defaults: Settings,
    /// Backend-specific layers keyed by backend name.
    pub backends: BTreeMap<String, Settings>,
}

impl KvConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse configuration from TOML text.
    ///
    /// The `[kvstore]` table becomes the global layer; every other table
    /// becomes the layer for the backend of the same name.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(text)?;
        let mut config = Self::new();

        for (name, section) in table {
            let section = match serde_json::to_value(section)? {
                Value::Object(map) => map,
                other => {
                    return Err(KvError::ConfigError(format!(
                        "expected table for `{name}`, found {other}"
                    )))
                }
            };
            if name == "kvstore" {
                config.defaults = section;
            } else {
                config.backends.insert(name, section);
            }
        }
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading kv configuration from {:?}", path);
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Set the default backend.
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.defaults
            .insert("backend".to_string(), Value::String(backend.into()));
        self
    }

    /// Set a field in a backend's layer.
    pub fn with_backend_setting(
        mut self,
        backend: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.backends
            .entry(backend.into())
            .or_default()
            .insert(field.into(), value.into());
        self
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides using `lookup` to read variables.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for (variable, table, field) in ENV_OVERRIDES {
            let Some(raw) = lookup(variable) else {
                continue;
            };
            let value = raw
                .parse::<u64>()
                .map(Value::from)
                .unwrap_or(Value::String(raw));
            let layer = if *table == "kvstore" {
                &mut self.defaults
            } else {
                self.backends.entry(table.to_string()).or_default()
            };
            layer.insert(field.to_string(), value);
        }
    }

    /// Names of backends allowed by the global layer, if restricted.
    pub fn available_backends(&self) -> Option<Vec<String>> {
        let list = self.defaults.get("available_backends")?.as_array()?;
        Some(
            list.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        )
    }

    /// Pick the backend name and merge all three layers for it.
    pub fn resolve(&self, options: &ConnectOptions) -> Result<(String, Settings)> {
        let backend = match &options.backend {
            Some(name) => name.clone(),
            None => match self.defaults.get("backend") {
                Some(Value::String(name)) => name.clone(),
                Some(other) => {
                    return Err(KvError::ConfigError(format!(
                        "backend must be a string, found {other}"
                    )))
                }
                None => DEFAULT_BACKEND.to_string(),
            },
        };

        let mut settings = self.defaults.clone();
        if let Some(layer) = self.backends.get(&backend) {
            merge(&mut settings, layer);
        }
        merge(&mut settings, &options.settings);
        settings.insert("backend".to_string(), Value::String(backend.clone()));

        Ok((backend, settings))
    }
}

/// Per-call connection options, the highest-precedence layer.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Backend name; falls back to the configured default.
    pub backend: Option<String>,
    /// Backend-specific overrides.
    pub settings: Settings,
}

impl ConnectOptions {
    /// Options that use the configured defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Select a backend by name.
    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    /// Override a single field.
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.settings.insert(field.into(), value.into());
        self
    }
}

/// Overlay `layer` onto `base`. Objects present in both are merged one
/// level deep; everything else is replaced.
pub fn merge(base: &mut Settings, layer: &Settings) {
    for (field, value) in layer {
        match (base.get_mut(field), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                for (k, v) in incoming {
                    existing.insert(k.clone(), v.clone());
                }
            }
            _ => {
                base.insert(field.clone(), value.clone());
            }
        }
    }
}

/// Deserialize merged settings into a backend's options type.
pub fn parse_settings<T: DeserializeOwned>(backend: &str, settings: Settings) -> Result<T> {
    serde_json::from_value(Value::Object(settings))
        .map_err(|e| KvError::ConfigError(format!("invalid {backend} settings: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [kvstore]
        backend = "sqlite"
        available_backends = ["memory", "sqlite"]

        [sqlite]
        path = "/tmp/kv.db"
        max_connections = 2

        [memcached]
        hosts = "127.0.0.1:11211"
    "#;

    #[test]
    fn test_from_toml_str() {
        let config = KvConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.defaults["backend"], json!("sqlite"));
        assert_eq!(config.backends["sqlite"]["path"], json!("/tmp/kv.db"));
        assert_eq!(
            config.available_backends(),
            Some(vec!["memory".to_string(), "sqlite".to_string()])
        );
    }

    #[test]
    fn test_non_table_section_rejected() {
        let result = KvConfig::from_toml_str("backend = \"memory\"");
        assert!(matches!(result, Err(KvError::ConfigError(_))));
    }

    #[test]
    fn test_invalid_toml_rejected() {
        let result = KvConfig::from_toml_str("[kvstore");
        assert!(matches!(result, Err(KvError::ConfigError(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = KvConfig::from_file(file.path()).unwrap();
        assert_eq!(config.backends["memcached"]["hosts"], json!("127.0.0.1:11211"));
    }

    #[test]
    fn test_layer_precedence() {
        let mut config = KvConfig::new()
            .with_backend("sqlite")
            .with_backend_setting("sqlite", "path", "from-backend")
            .with_backend_setting("sqlite", "max_connections", 2);
        config.defaults.insert("path".to_string(), json!("from-global"));
        config.defaults.insert("create_schema".to_string(), json!(false));

        let options = ConnectOptions::new().set("max_connections", 9);
        let (backend, settings) = config.resolve(&options).unwrap();

        assert_eq!(backend, "sqlite");
        assert_eq!(settings["path"], json!("from-backend"));
        assert_eq!(settings["max_connections"], json!(9));
        assert_eq!(settings["create_schema"], json!(false));
    }

    #[test]
    fn test_caller_backend_wins() {
        let config = KvConfig::new()
            .with_backend("sqlite")
            .with_backend_setting("memory", "strategy", "native")
            .with_backend_setting("sqlite", "path", "unused");

        let (backend, settings) = config
            .resolve(&ConnectOptions::new().backend("memory"))
            .unwrap();
        assert_eq!(backend, "memory");
        assert_eq!(settings["strategy"], json!("native"));
        assert!(settings.get("path").is_none());
    }

    #[test]
    fn test_default_backend_is_memory() {
        let (backend, _) = KvConfig::new().resolve(&ConnectOptions::new()).unwrap();
        assert_eq!(backend, DEFAULT_BACKEND);
    }

    #[test]
    fn test_merge_is_one_level_deep() {
        let mut base = Settings::new();
        base.insert("pool".to_string(), json!({"min": 1, "max": 4, "inner": {"a": 1}}));

        let mut layer = Settings::new();
        layer.insert("pool".to_string(), json!({"max": 8, "inner": {"b": 2}}));
        merge(&mut base, &layer);

        assert_eq!(base["pool"], json!({"min": 1, "max": 8, "inner": {"b": 2}}));
    }

    #[test]
    fn test_apply_env_from() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("KVSTORE_BACKEND", "memcached"),
            ("MEMCACHED_HOSTS", "10.0.0.1:11211,10.0.0.2:11211"),
            ("MEMCACHED_LIFETIME", "60"),
        ]);

        let mut config = KvConfig::new().with_backend("memory");
        config.apply_env_from(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.defaults["backend"], json!("memcached"));
        assert_eq!(
            config.backends["memcached"]["hosts"],
            json!("10.0.0.1:11211,10.0.0.2:11211")
        );
        assert_eq!(config.backends["memcached"]["lifetime"], json!(60));
        assert!(config.backends.get("sqlite").is_none());
    }

    #[test]
    fn test_parse_settings_ignores_unknown_fields() {
        #[derive(serde::Deserialize)]
        #[serde(default)]
        struct Opts {
            size: u32,
        }
        impl Default for Opts {
            fn default() -> Self {
                Self { size: 3 }
            }
        }

        let mut settings = Settings::new();
        settings.insert("backend".to_string(), json!("x"));
        let opts: Opts = parse_settings("x", settings).unwrap();
        assert_eq!(opts.size, 3);
    }
}
