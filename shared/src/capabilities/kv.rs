//! Persistent key-value storage.
//!
//! The core persists through the Crux [`KeyValue`](crux_kv::KeyValue)
//! effect. On native hosts a [`KeyValueStore`] backend answers those
//! effects through [`resolve_operation`].

use crux_kv::error::KeyValueError;
use crux_kv::value::Value;
use crux_kv::{KeyValueOperation, KeyValueResponse, KeyValueResult};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;
pub const MAX_PREFIX_LENGTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    /// For compile-time keys that are covered by the validation tests.
    pub(crate) fn new_unchecked(namespace: KeyNamespace, key: &str) -> Self {
        Self {
            namespace,
            key: key.to_string(),
        }
    }

    /// Parses the `namespace:key` form produced by [`KvKey::raw`].
    pub fn parse(raw: &str) -> Result<Self, KvError> {
        let Some((prefix, key)) = raw.split_once(':') else {
            return Err(KvError::InvalidKey {
                key: raw.to_string(),
                reason: "missing namespace prefix".to_string(),
            });
        };
        Self::new(KeyNamespace::from_prefix(prefix)?, key)
    }

    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {MAX_KEY_LENGTH} bytes"),
            });
        }

        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain path traversal sequences".to_string(),
            });
        }

        if key.chars().any(char::is_control) {
            return Err(KvError::InvalidKey {
                key: key.escape_default().to_string(),
                reason: "key contains control characters".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    UserData,
    Settings,
    Cache,
    Custom(String),
}

impl KeyNamespace {
    pub fn prefix(&self) -> &str {
        match self {
            KeyNamespace::UserData => "userdata",
            KeyNamespace::Settings => "settings",
            KeyNamespace::Cache => "cache",
            KeyNamespace::Custom(s) => s.as_str(),
        }
    }

    pub fn from_prefix(prefix: &str) -> Result<Self, KvError> {
        match prefix {
            "userdata" => Ok(KeyNamespace::UserData),
            "settings" => Ok(KeyNamespace::Settings),
            "cache" => Ok(KeyNamespace::Cache),
            other => Self::custom(other),
        }
    }

    pub fn custom(prefix: impl Into<String>) -> Result<Self, KvError> {
        let prefix = prefix.into();
        if prefix.is_empty() || prefix.len() > MAX_PREFIX_LENGTH {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: format!("custom namespace must be 1..={MAX_PREFIX_LENGTH} bytes"),
            });
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: "custom namespace contains invalid characters".to_string(),
            });
        }
        Ok(KeyNamespace::Custom(prefix))
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?}, retryable: {retryable})")]
    Storage {
        code: StorageErrorCode,
        message: String,
        retryable: bool,
    },

    #[error("serialization error: {message}")]
    Serialization { message: String, key: Option<String> },
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Storage { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.is_retryable();
        Self::Storage {
            code,
            message: message.into(),
            retryable,
        }
    }

    pub fn serialization(err: &serde_json::Error, key: &KvKey) -> Self {
        Self::Serialization {
            message: err.to_string(),
            key: Some(key.raw()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    Corrupted,
    DiskFull,
    PermissionDenied,
    Busy,
    Locked,
    IoError,
}

impl StorageErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageErrorCode::Busy | StorageErrorCode::Locked)
    }
}

impl From<std::io::Error> for KvError {
    fn from(e: std::io::Error) -> Self {
        let code = match e.kind() {
            std::io::ErrorKind::PermissionDenied => StorageErrorCode::PermissionDenied,
            std::io::ErrorKind::WouldBlock => StorageErrorCode::Busy,
            _ => StorageErrorCode::IoError,
        };
        KvError::storage(code, e.to_string())
    }
}

/// Durable string-keyed store of textual (JSON) values, owned by the shell.
///
/// Writes are synchronous. Implementations use interior mutability so one
/// store can answer every key-value effect of a core.
pub trait KeyValueStore: Send + Sync {
    fn read(&self, key: &KvKey) -> Result<Option<String>, KvError>;
    fn write(&self, key: &KvKey, value: String) -> Result<(), KvError>;
    fn remove(&self, key: &KvKey) -> Result<bool, KvError>;
    /// Raw keys starting with `prefix`, in ascending order.
    fn keys(&self, prefix: &str) -> Result<Vec<String>, KvError>;
}

pub fn check_value_size(value: &str) -> Result<(), KvError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

/// Process-lifetime store; also the test double for write failures.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Raw write that bypasses failure injection, for seeding fixtures.
    pub fn insert_raw(&self, key: &KvKey, value: impl Into<String>) -> Result<(), KvError> {
        self.lock()?.insert(key.raw(), value.into());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, KvError> {
        self.entries
            .lock()
            .map_err(|_| KvError::storage(StorageErrorCode::Locked, "memory store poisoned"))
    }
}

impl KeyValueStore for MemoryKvStore {
    fn read(&self, key: &KvKey) -> Result<Option<String>, KvError> {
        Ok(self.lock()?.get(&key.raw()).cloned())
    }

    fn write(&self, key: &KvKey, value: String) -> Result<(), KvError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(KvError::storage(StorageErrorCode::IoError, "injected write failure"));
        }
        check_value_size(&value)?;
        self.lock()?.insert(key.raw(), value);
        Ok(())
    }

    fn remove(&self, key: &KvKey) -> Result<bool, KvError> {
        Ok(self.lock()?.remove(&key.raw()).is_some())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let mut keys: Vec<String> = self
            .lock()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// JSON bytes for a `KeyValue::set` request.
pub fn encode_json<T: Serialize>(key: &KvKey, value: &T) -> Result<Vec<u8>, KvError> {
    serde_json::to_vec(value).map_err(|e| KvError::serialization(&e, key))
}

/// Best-effort read: a missing key, a failed read or an unparsable value
/// all yield `None`. Failures are logged, never returned.
pub fn decode_json<T: DeserializeOwned>(
    key: &KvKey,
    read: Result<Option<Vec<u8>>, String>,
) -> Option<T> {
    let bytes = match read {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return None,
        Err(error) => {
            warn!(key = %key.raw(), %error, "store read failed, using default");
            return None;
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key = %key.raw(), error = %e, "stored value unparsable, using default");
            None
        }
    }
}

/// Answers one key-value effect from `store`.
pub fn resolve_operation(
    store: &dyn KeyValueStore,
    operation: &KeyValueOperation,
) -> KeyValueResult {
    match apply_operation(store, operation) {
        Ok(response) => KeyValueResult::Ok { response },
        Err(e) => {
            warn!(error = %e, "key-value operation failed");
            let message = e.to_string();
            let error = match e {
                KvError::Storage { .. } => KeyValueError::Io { message },
                KvError::InvalidKey { .. }
                | KvError::ValueTooLarge { .. }
                | KvError::Serialization { .. } => KeyValueError::Other { message },
            };
            KeyValueResult::Err { error }
        }
    }
}

fn apply_operation(
    store: &dyn KeyValueStore,
    operation: &KeyValueOperation,
) -> Result<KeyValueResponse, KvError> {
    match operation {
        KeyValueOperation::Get { key } => {
            let key = KvKey::parse(key)?;
            Ok(KeyValueResponse::Get {
                value: to_value(store.read(&key)?),
            })
        }
        KeyValueOperation::Set { key, value } => {
            let key = KvKey::parse(key)?;
            let text = String::from_utf8(value.clone()).map_err(|e| KvError::Serialization {
                message: e.to_string(),
                key: Some(key.raw()),
            })?;
            let previous = store.read(&key).unwrap_or_default();
            store.write(&key, text)?;
            debug!(key = %key.raw(), "value persisted");
            Ok(KeyValueResponse::Set {
                previous: to_value(previous),
            })
        }
        KeyValueOperation::Delete { key } => {
            let key = KvKey::parse(key)?;
            let previous = store.read(&key)?;
            store.remove(&key)?;
            Ok(KeyValueResponse::Delete {
                previous: to_value(previous),
            })
        }
        KeyValueOperation::Exists { key } => {
            let key = KvKey::parse(key)?;
            Ok(KeyValueResponse::Exists {
                is_present: store.read(&key)?.is_some(),
            })
        }
        // Every store returns its whole listing in one page.
        KeyValueOperation::ListKeys { prefix, .. } => Ok(KeyValueResponse::ListKeys {
            keys: store.keys(prefix)?,
            next_cursor: 0,
        }),
    }
}

fn to_value(raw: Option<String>) -> Value {
    raw.map_or(Value::None, |text| Value::Bytes(text.into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct TestData {
        name: String,
        count: u32,
    }

    fn key(name: &str) -> KvKey {
        KvKey::new(KeyNamespace::UserData, name).unwrap()
    }

    #[test]
    fn test_key_validation_empty() {
        assert!(matches!(
            KvKey::new(KeyNamespace::Cache, ""),
            Err(KvError::InvalidKey { .. })
        ));
        assert!(KvKey::new(KeyNamespace::Cache, "   ").is_err());
    }

    #[test]
    fn test_key_validation_rejects_unsafe() {
        assert!(KvKey::new(KeyNamespace::Cache, "key\0value").is_err());
        assert!(KvKey::new(KeyNamespace::Cache, "../etc/passwd").is_err());
        assert!(KvKey::new(KeyNamespace::Cache, "/root").is_err());
        assert!(KvKey::new(KeyNamespace::Cache, "key\x01value").is_err());
        assert!(KvKey::new(KeyNamespace::Cache, "a".repeat(MAX_KEY_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_key_validation_valid() {
        let key = key("offline-maps");
        assert_eq!(key.raw(), "userdata:offline-maps");
        assert_eq!(key.key(), "offline-maps");
    }

    #[test]
    fn test_key_parse_round_trips_raw_form() {
        let parsed = KvKey::parse("userdata:offline-maps").unwrap();
        assert_eq!(parsed, key("offline-maps"));

        let custom = KvKey::parse("tiles:z10").unwrap();
        assert_eq!(custom.namespace(), &KeyNamespace::Custom("tiles".into()));

        assert!(KvKey::parse("no-namespace").is_err());
        assert!(KvKey::parse("userdata:../escape").is_err());
        assert!(KvKey::parse("bad prefix!:x").is_err());
    }

    #[test]
    fn test_custom_namespace() {
        assert_eq!(KeyNamespace::custom("myapp").unwrap().prefix(), "myapp");
        assert!(KeyNamespace::custom("").is_err());
        assert!(KeyNamespace::custom("invalid namespace!").is_err());
    }

    #[test]
    fn test_error_retryable() {
        assert!(KvError::storage(StorageErrorCode::Busy, "busy").is_retryable());
        assert!(!KvError::storage(StorageErrorCode::Corrupted, "bad").is_retryable());
        assert!(!KvError::ValueTooLarge { size: 2, max: 1 }.is_retryable());
    }

    #[test]
    fn test_decode_treats_garbage_and_failures_as_absent() {
        let k = key("data");
        assert_eq!(decode_json::<TestData>(&k, Ok(None)), None);
        assert_eq!(
            decode_json::<TestData>(&k, Ok(Some(b"{not json".to_vec()))),
            None
        );
        assert_eq!(decode_json::<TestData>(&k, Err("disk gone".into())), None);

        let data = TestData {
            name: "test".into(),
            count: 42,
        };
        let bytes = encode_json(&k, &data).unwrap();
        assert_eq!(decode_json(&k, Ok(Some(bytes))), Some(data));
    }

    #[test]
    fn test_memory_store_rejects_oversized_value() {
        let store = MemoryKvStore::new();
        let result = store.write(&key("big"), "a".repeat(MAX_VALUE_SIZE + 1));
        assert!(matches!(result, Err(KvError::ValueTooLarge { .. })));
    }

    #[test]
    fn test_memory_store_remove_and_keys() {
        let store = MemoryKvStore::new();
        store.write(&key("b"), "1".into()).unwrap();
        store.write(&key("a"), "1".into()).unwrap();
        store
            .write(&KvKey::new(KeyNamespace::Cache, "c").unwrap(), "1".into())
            .unwrap();

        assert_eq!(
            store.keys("userdata:").unwrap(),
            vec!["userdata:a".to_string(), "userdata:b".to_string()]
        );
        assert!(store.remove(&key("a")).unwrap());
        assert!(!store.remove(&key("a")).unwrap());
        assert_eq!(store.read(&key("a")).unwrap(), None);
    }

    #[test]
    fn test_resolve_set_then_get() {
        let store = MemoryKvStore::new();

        let set = resolve_operation(
            &store,
            &KeyValueOperation::Set {
                key: "userdata:data".into(),
                value: b"[1,2]".to_vec(),
            },
        );
        assert!(matches!(
            set,
            KeyValueResult::Ok {
                response: KeyValueResponse::Set {
                    previous: Value::None
                }
            }
        ));

        let get = resolve_operation(
            &store,
            &KeyValueOperation::Get {
                key: "userdata:data".into(),
            },
        );
        let KeyValueResult::Ok {
            response: KeyValueResponse::Get {
                value: Value::Bytes(bytes),
            },
        } = get
        else {
            panic!("expected stored bytes, got {get:?}");
        };
        assert_eq!(bytes, b"[1,2]".to_vec());
    }

    #[test]
    fn test_resolve_reports_write_failure() {
        let store = MemoryKvStore::new();
        store.set_fail_writes(true);

        let result = resolve_operation(
            &store,
            &KeyValueOperation::Set {
                key: "userdata:data".into(),
                value: b"1".to_vec(),
            },
        );

        assert!(matches!(result, KeyValueResult::Err { .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn test_resolve_rejects_unsafe_key() {
        let store = MemoryKvStore::new();
        let result = resolve_operation(
            &store,
            &KeyValueOperation::Get {
                key: "userdata:../../etc".into(),
            },
        );
        assert!(matches!(result, KeyValueResult::Err { .. }));
    }

    #[test]
    fn test_resolve_exists_delete_and_list() {
        let store = MemoryKvStore::new();
        store.write(&key("a"), "1".into()).unwrap();

        let exists = resolve_operation(
            &store,
            &KeyValueOperation::Exists {
                key: "userdata:a".into(),
            },
        );
        assert!(matches!(
            exists,
            KeyValueResult::Ok {
                response: KeyValueResponse::Exists { is_present: true }
            }
        ));

        let listed = resolve_operation(
            &store,
            &KeyValueOperation::ListKeys {
                prefix: "userdata:".into(),
                cursor: 0,
            },
        );
        let KeyValueResult::Ok {
            response: KeyValueResponse::ListKeys { keys, next_cursor },
        } = listed
        else {
            panic!("expected a key listing, got {listed:?}");
        };
        assert_eq!(keys, vec!["userdata:a".to_string()]);
        assert_eq!(next_cursor, 0);

        resolve_operation(
            &store,
            &KeyValueOperation::Delete {
                key: "userdata:a".into(),
            },
        );
        assert!(store.is_empty());
    }
}
