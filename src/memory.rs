//! In-memory key-value store implementation.
//!
//! This implementation is NOT durable - data is lost on process exit or
//! `close()`. Use for testing and development only.
//!
//! The store can issue CAS tokens with any of the supported strategies, so
//! the same contract can be exercised against each of them:
//!
//! - [`TokenStrategy::Counter`]: per-key counter, 1 on creation, +1 per write.
//! - [`TokenStrategy::Random`]: fresh random `u64` per write. Two successive
//!   writes collide with probability 2^-64, in which case a stale token would
//!   be accepted. This is accepted rather than corrected.
//! - [`TokenStrategy::AtomicAdd`]: the write primitive adds 1 to the stored
//!   counter in place while checking its condition, like an engine-side
//!   `ADD` attribute update. Absent keys start from 0.
//! - [`TokenStrategy::Native`]: store-wide unique sequence, the way memcached
//!   assigns CAS uniques.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::config::{parse_settings, Settings};
use crate::error::{KvError, Result};
use crate::registry::Backend;
use crate::store::{decode_value, encode_value, validate_key, CasId, KvStore, Record};

/// How the memory store generates CAS tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStrategy {
    /// Per-key strictly increasing counter.
    #[default]
    Counter,
    /// Independent random value on every write.
    Random,
    /// Counter incremented by the conditional update itself.
    AtomicAdd,
    /// Store-wide unique sequence.
    Native,
}

/// Options recognized by the memory backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MemoryOptions {
    /// Token strategy.
    pub strategy: TokenStrategy,
}

#[derive(Debug, Clone)]
struct Slot {
    text: String,
    casid: CasId,
}

/// Condition checked atomically before a write is applied.
#[derive(Debug, Clone, Copy)]
enum Expect {
    Any,
    Absent,
    Token(CasId),
}

impl Expect {
    fn from_casid(casid: Option<CasId>) -> Self {
        match casid {
            Some(token) => Expect::Token(token),
            None => Expect::Absent,
        }
    }

    fn holds(self, current: Option<CasId>) -> bool {
        match (self, current) {
            (Expect::Any, _) => true,
            (Expect::Absent, None) => true,
            (Expect::Token(expected), Some(current)) => expected == current,
            _ => false,
        }
    }
}

/// In-memory implementation of KvStore.
///
/// Values are kept in their encoded text form, so reads go through the same
/// decode path as the persistent backends.
pub struct MemoryStore {
    data: Arc<RwLock<BTreeMap<String, Slot>>>,
    strategy: TokenStrategy,
    sequence: AtomicU64,
}

impl MemoryStore {
    /// Create a new empty in-memory store using per-key counters.
    pub fn new() -> Self {
        Self::with_strategy(TokenStrategy::Counter)
    }

    /// Create a new empty in-memory store with the given token strategy.
    pub fn with_strategy(strategy: TokenStrategy) -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            strategy,
            sequence: AtomicU64::new(0),
        }
    }

    /// The token strategy in use.
    pub fn strategy(&self) -> TokenStrategy {
        self.strategy
    }

    /// Get the number of entries in the store.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Apply a write if `expect` holds for the key's current token.
    fn write(&self, key: &str, value: &Value, expect: Expect) -> Result<()> {
        validate_key(key)?;
        let text = encode_value(value)?;

        let mut data = self.data.write();
        let current = data.get(key).map(|slot| slot.casid);
        if !expect.holds(current) {
            return Err(KvError::cas_mismatch(key));
        }

        match self.strategy {
            TokenStrategy::AtomicAdd => {
                let slot = data.entry(key.to_string()).or_insert_with(|| Slot {
                    text: String::new(),
                    casid: CasId::new(0),
                });
                slot.text = text;
                slot.casid = CasId::new(slot.casid.as_u64() + 1);
            }
            strategy => {
                let casid = match strategy {
                    TokenStrategy::Random => CasId::new(rand::random()),
                    TokenStrategy::Native => {
                        CasId::new(self.sequence.fetch_add(1, Ordering::Relaxed) + 1)
                    }
                    _ => current.map_or(CasId::new(1), |c| CasId::new(c.as_u64() + 1)),
                };
                data.insert(key.to_string(), Slot { text, casid });
            }
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Record>> {
        validate_key(key)?;

        let slot = self.data.read().get(key).cloned();
        match slot {
            Some(slot) => {
                let value = decode_value(&slot.text)?;
                Ok(Some(Record::new(value, slot.casid)))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.write(key, &value, Expect::Any)
    }

    async fn cas(&self, key: &str, value: Value, casid: Option<CasId>) -> Result<()> {
        self.write(key, &value, Expect::from_casid(casid))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.data.write().remove(key);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.data.write().clear();
        debug!("Memory store closed");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Backend factory for [`MemoryStore`].
///
/// Connects instantly, so the store is returned directly without a proxy.
pub struct MemoryBackend;

impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn connect(&self, settings: Settings) -> Result<Arc<dyn KvStore>> {
        let options: MemoryOptions = parse_settings(self.name(), settings)?;
        debug!(strategy = ?options.strategy, "Creating memory store");
        Ok(Arc::new(MemoryStore::with_strategy(options.strategy)))
    }
}
