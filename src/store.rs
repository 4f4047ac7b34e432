//! KvStore trait - the operation surface shared by every backend.
//!
//! - Records: a JSON value plus an opaque CAS token
//! - Core operations: get, set, cas, delete
//! - Lifecycle: close, ping
//!
//! Values are stored in their JSON text encoding. A value that fails to
//! decode on read is reported as [`KvError::EncodingError`], never as a
//! missing key.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{KvError, Result};

/// Maximum key length in bytes.
pub const MAX_KEY_LENGTH: usize = 250;

/// Opaque version token returned by `get` and consumed by `cas`.
///
/// Tokens are only meaningful for the key they were read from. How they are
/// produced is up to the backend: counters, random stamps or native CAS
/// uniques all satisfy the same equality contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CasId(u64);

impl CasId {
    /// Wrap a raw token value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw token value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for CasId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for CasId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored value together with its current CAS token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// The decoded value.
    pub value: Value,
    /// Token identifying this version of the record.
    pub casid: CasId,
}

impl Record {
    /// Create a record.
    pub fn new(value: Value, casid: CasId) -> Self {
        Self { value, casid }
    }

    /// Deserialize the value into a concrete type.
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.value.clone()).map_err(Into::into)
    }
}

/// Encode a value to the textual form stored by backends.
pub fn encode_value(value: &Value) -> Result<String> {
    serde_json::to_string(value).map_err(Into::into)
}

/// Decode a stored textual value.
pub fn decode_value(text: &str) -> Result<Value> {
    serde_json::from_str(text).map_err(Into::into)
}

/// Validate that a key is accepted by every backend.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(KvError::InvalidKey("key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(KvError::InvalidKey(format!(
            "key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(KvError::InvalidKey(
            "key cannot contain whitespace or control characters".to_string(),
        ));
    }
    Ok(())
}

/// The core key-value trait.
///
/// All backends (memory, SQLite, memcached) and the connection proxy
/// implement this trait. Code should depend on this trait, not on specific
/// implementations.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get the record stored for a key.
    ///
    /// Returns `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Record>>;

    /// Unconditionally set the value for a key.
    ///
    /// Any token issued before this write is invalidated.
    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Check-and-set.
    ///
    /// With `casid = None` the write succeeds only if the key does not exist.
    /// Otherwise it succeeds only if the current token equals `casid`.
    /// On mismatch returns [`KvError::CasMismatch`] and leaves the record
    /// unchanged.
    async fn cas(&self, key: &str, value: Value, casid: Option<CasId>) -> Result<()>;

    /// Unconditionally delete a key.
    ///
    /// Returns `Ok(())` if the key was deleted or didn't exist.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Release the underlying connection.
    async fn close(&self) -> Result<()>;

    /// Check that the backend is reachable.
    async fn ping(&self) -> Result<()>;
}

/// Typed helpers available on every [`KvStore`], including trait objects.
#[async_trait]
pub trait KvStoreExt: KvStore {
    /// Get a value and deserialize it, together with its token.
    async fn get_as<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<(T, CasId)>> {
        match self.get(key).await? {
            Some(record) => {
                let value = record.value_as::<T>()?;
                Ok(Some((value, record.casid)))
            }
            None => Ok(None),
        }
    }

    /// Serialize a value and set it.
    async fn set_as<T: Serialize + Send + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, value).await
    }

    /// Serialize a value and check-and-set it.
    async fn cas_as<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        casid: Option<CasId>,
    ) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.cas(key, value, casid).await
    }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_key_valid() {
        assert!(validate_key("test").is_ok());
        assert!(validate_key("user:abc-123").is_ok());
        assert!(validate_key("/nodes/n1/containers/c1").is_ok());
    }

    #[test]
    fn test_validate_key_empty() {
        let err = validate_key("").unwrap_err();
        assert!(matches!(err, KvError::InvalidKey(_)));
    }

    #[test]
    fn test_validate_key_whitespace() {
        assert!(matches!(validate_key("a b"), Err(KvError::InvalidKey(_))));
        assert!(matches!(validate_key("a\r\nb"), Err(KvError::InvalidKey(_))));
    }

    #[test]
    fn test_validate_key_too_long() {
        let key = "a".repeat(MAX_KEY_LENGTH + 1);
        let err = validate_key(&key).unwrap_err();
        assert!(matches!(err, KvError::InvalidKey(_)));
        assert!(validate_key(&"a".repeat(MAX_KEY_LENGTH)).is_ok());
    }

    #[test]
    fn test_encode_decode() {
        let value = json!({"name": "test", "items": [1, 2]});
        let text = encode_value(&value).unwrap();
        assert_eq!(decode_value(&text).unwrap(), value);
    }

    #[test]
    fn test_decode_garbage_is_encoding_error() {
        let err = decode_value("not json at all").unwrap_err();
        assert!(matches!(err, KvError::EncodingError(_)));
    }

    #[test]
    fn test_empty_string_is_a_value() {
        let text = encode_value(&json!("")).unwrap();
        assert_eq!(text, "\"\"");
        assert_eq!(decode_value(&text).unwrap(), json!(""));
    }

    #[test]
    fn test_casid_serializes_transparently() {
        let json = serde_json::to_string(&CasId::new(42)).unwrap();
        assert_eq!(json, "42");
        assert_eq!(CasId::from(7).to_string(), "7");
    }

    #[test]
    fn test_record_value_as() {
        #[derive(Deserialize)]
        struct TestData {
            name: String,
        }

        let record = Record::new(json!({"name": "test"}), CasId::new(1));
        let data: TestData = record.value_as().unwrap();
        assert_eq!(data.name, "test");
    }
}
