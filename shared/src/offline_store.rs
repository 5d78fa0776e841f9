//! Durable [`KeyValueStore`] backends.
//!
//! `FileKvStore` keeps every key in one JSON document written atomically
//! (temp file, fsync, rename). `SqliteKvStore` keeps one row per key.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capabilities::{check_value_size, KeyValueStore, KvError, KvKey, StorageErrorCode};

const CURRENT_SCHEMA_VERSION: u32 = 1;
const STORE_MAGIC: &str = "OFMS";

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: String,
    schema_version: u32,
    checksum: String,
    payload: String,
}

type Entries = BTreeMap<String, String>;

fn corrupted(reason: impl Into<String>) -> KvError {
    KvError::storage(StorageErrorCode::Corrupted, reason)
}

fn encode_envelope(entries: &Entries) -> Result<Vec<u8>, KvError> {
    let payload = serde_json::to_string(entries).map_err(|e| KvError::Serialization {
        message: e.to_string(),
        key: None,
    })?;
    let envelope = StoreEnvelope {
        magic: STORE_MAGIC.to_string(),
        schema_version: CURRENT_SCHEMA_VERSION,
        checksum: blake3::hash(payload.as_bytes()).to_hex().to_string(),
        payload,
    };
    serde_json::to_vec_pretty(&envelope).map_err(|e| KvError::Serialization {
        message: e.to_string(),
        key: None,
    })
}

fn decode_envelope(bytes: &[u8]) -> Result<Entries, KvError> {
    if bytes.is_empty() {
        return Err(corrupted("empty file"));
    }

    let envelope: StoreEnvelope =
        serde_json::from_slice(bytes).map_err(|e| corrupted(format!("bad envelope: {e}")))?;

    if envelope.magic != STORE_MAGIC {
        return Err(corrupted("invalid magic"));
    }
    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(corrupted(format!(
            "schema version {} is newer than supported {}",
            envelope.schema_version, CURRENT_SCHEMA_VERSION
        )));
    }

    let actual = blake3::hash(envelope.payload.as_bytes());
    let expected = hex::decode(&envelope.checksum)
        .map_err(|e| corrupted(format!("bad checksum encoding: {e}")))?;
    if actual.as_bytes().as_slice() != expected.as_slice() {
        return Err(corrupted(format!(
            "integrity check failed: expected {}, got {}",
            envelope.checksum,
            actual.to_hex()
        )));
    }

    serde_json::from_str(&envelope.payload).map_err(|e| corrupted(format!("bad payload: {e}")))
}

#[derive(Debug)]
pub struct FileKvStore {
    path: PathBuf,
    entries: Mutex<Entries>,
}

impl FileKvStore {
    /// Opens (or creates on first write) the store at `path`.
    ///
    /// Never fails: a missing, unreadable or corrupted file leaves the store
    /// empty. Corrupted files are moved aside to `*.corrupt`; later writes
    /// report their own errors.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %e, "store directory not created");
            }
        }

        let entries = if path.exists() {
            Self::load(&path)
        } else {
            Entries::new()
        };

        info!(path = %path.display(), keys = entries.len(), "file store opened");
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn load(path: &Path) -> Entries {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "store file unreadable, starting empty");
                return Entries::new();
            }
        };

        match decode_envelope(&bytes) {
            Ok(entries) => entries,
            Err(e) => {
                let aside = path.with_extension("corrupt");
                warn!(
                    path = %path.display(),
                    aside = %aside.display(),
                    error = %e,
                    "store file corrupted, starting empty"
                );
                if let Err(e) = std::fs::rename(path, &aside) {
                    warn!(path = %path.display(), error = %e, "corrupted store not moved aside");
                }
                Entries::new()
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Entries>, KvError> {
        self.entries
            .lock()
            .map_err(|_| KvError::storage(StorageErrorCode::Locked, "file store poisoned"))
    }

    fn flush(&self, entries: &Entries) -> Result<(), KvError> {
        let bytes = encode_envelope(entries)?;
        let tmp_path = self.path.with_extension("tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;

        if let Err(e) = std::fs::rename(&tmp_path, &self.path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        debug!(path = %self.path.display(), bytes = bytes.len(), "file store flushed");
        Ok(())
    }
}

impl KeyValueStore for FileKvStore {
    fn read(&self, key: &KvKey) -> Result<Option<String>, KvError> {
        Ok(self.lock()?.get(&key.raw()).cloned())
    }

    /// The cached value is updated even when the flush to disk fails.
    fn write(&self, key: &KvKey, value: String) -> Result<(), KvError> {
        check_value_size(&value)?;
        let mut entries = self.lock()?;
        entries.insert(key.raw(), value);
        self.flush(&entries)
    }

    fn remove(&self, key: &KvKey) -> Result<bool, KvError> {
        let mut entries = self.lock()?;
        let existed = entries.remove(&key.raw()).is_some();
        if existed {
            self.flush(&entries)?;
        }
        Ok(existed)
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        Ok(self
            .lock()?
            .range(prefix.to_string()..)
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteKvStore;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite {
    use super::*;
    use rusqlite::{params, Connection, OptionalExtension};

    impl From<rusqlite::Error> for KvError {
        fn from(e: rusqlite::Error) -> Self {
            let code = match e.sqlite_error_code() {
                Some(rusqlite::ErrorCode::DatabaseBusy) => StorageErrorCode::Busy,
                Some(rusqlite::ErrorCode::DatabaseLocked) => StorageErrorCode::Locked,
                Some(rusqlite::ErrorCode::DiskFull) => StorageErrorCode::DiskFull,
                Some(rusqlite::ErrorCode::PermissionDenied)
                | Some(rusqlite::ErrorCode::ReadOnly) => StorageErrorCode::PermissionDenied,
                Some(rusqlite::ErrorCode::DatabaseCorrupt)
                | Some(rusqlite::ErrorCode::NotADatabase) => StorageErrorCode::Corrupted,
                _ => StorageErrorCode::Unknown,
            };
            KvError::storage(code, e.to_string())
        }
    }

    pub struct SqliteKvStore {
        conn: Mutex<Connection>,
    }

    impl SqliteKvStore {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
            let path = path.as_ref();
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(path)?;
            info!(path = %path.display(), "sqlite store opened");
            Self::with_connection(conn)
        }

        pub fn open_in_memory() -> Result<Self, KvError> {
            Self::with_connection(Connection::open_in_memory()?)
        }

        fn with_connection(conn: Connection) -> Result<Self, KvError> {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS kv_entries (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    version INTEGER NOT NULL DEFAULT 1,
                    updated_at INTEGER NOT NULL
                );
                "#,
            )?;
            Ok(Self {
                conn: Mutex::new(conn),
            })
        }

        fn lock(&self) -> Result<MutexGuard<'_, Connection>, KvError> {
            self.conn
                .lock()
                .map_err(|_| KvError::storage(StorageErrorCode::Locked, "sqlite store poisoned"))
        }

        /// Write counter for `key`; 0 if absent.
        pub fn version(&self, key: &KvKey) -> Result<u64, KvError> {
            let version: Option<i64> = self
                .lock()?
                .query_row(
                    "SELECT version FROM kv_entries WHERE key = ?1",
                    params![key.raw()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(version.and_then(|v| u64::try_from(v).ok()).unwrap_or(0))
        }
    }

    impl KeyValueStore for SqliteKvStore {
        fn read(&self, key: &KvKey) -> Result<Option<String>, KvError> {
            let value = self
                .lock()?
                .query_row(
                    "SELECT value FROM kv_entries WHERE key = ?1",
                    params![key.raw()],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(value)
        }

        fn write(&self, key: &KvKey, value: String) -> Result<(), KvError> {
            check_value_size(&value)?;
            let now = i64::try_from(crate::get_current_time_ms()).unwrap_or(i64::MAX);
            self.lock()?.execute(
                "INSERT INTO kv_entries (key, value, version, updated_at)
                 VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    version = kv_entries.version + 1,
                    updated_at = excluded.updated_at",
                params![key.raw(), value, now],
            )?;
            Ok(())
        }

        fn remove(&self, key: &KvKey) -> Result<bool, KvError> {
            let removed = self
                .lock()?
                .execute("DELETE FROM kv_entries WHERE key = ?1", params![key.raw()])?;
            Ok(removed > 0)
        }

        fn keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                "SELECT key FROM kv_entries
                 WHERE substr(key, 1, length(?1)) = ?1
                 ORDER BY key",
            )?;
            let keys = stmt
                .query_map(params![prefix], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::KeyNamespace;
    use tempfile::tempdir;

    fn key(name: &str) -> KvKey {
        KvKey::new(KeyNamespace::UserData, name).unwrap()
    }

    #[test]
    fn test_file_roundtrip_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = FileKvStore::open(&path);
        store.write(&key("a"), "[1,2,3]".into()).unwrap();
        drop(store);

        let reopened = FileKvStore::open(&path);
        assert_eq!(reopened.read(&key("a")).unwrap().as_deref(), Some("[1,2,3]"));
    }

    #[test]
    fn test_atomic_write_leaves_no_tmp_on_success() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = FileKvStore::open(&path);
        store.write(&key("a"), "1".into()).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_missing_file_opens_empty() {
        let dir = tempdir().unwrap();
        let store = FileKvStore::open(dir.path().join("nested/none.json"));
        assert_eq!(store.read(&key("a")).unwrap(), None);
    }

    #[test]
    fn test_corrupted_file_is_moved_aside() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, b"{ this is not a store").unwrap();

        let store = FileKvStore::open(&path);

        assert_eq!(store.read(&key("a")).unwrap(), None);
        assert!(path.with_extension("corrupt").exists());
        assert!(!path.exists());
    }

    #[test]
    fn test_directory_at_store_path_opens_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::create_dir(&path).unwrap();

        let store = FileKvStore::open(&path);

        assert_eq!(store.read(&key("a")).unwrap(), None);
        assert!(matches!(
            store.write(&key("a"), "1".into()),
            Err(KvError::Storage { .. })
        ));
        assert!(path.is_dir());
        assert!(!path.with_extension("corrupt").exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_file_keys_filter_by_prefix() {
        let dir = tempdir().unwrap();
        let store = FileKvStore::open(dir.path().join("store.json"));
        store.write(&key("b"), "1".into()).unwrap();
        store.write(&key("a"), "1".into()).unwrap();
        store
            .write(&KvKey::new(KeyNamespace::Settings, "z").unwrap(), "1".into())
            .unwrap();

        assert_eq!(
            store.keys("userdata:").unwrap(),
            vec!["userdata:a".to_string(), "userdata:b".to_string()]
        );
        assert_eq!(store.keys("").unwrap().len(), 3);
    }

    #[test]
    fn test_file_store_rejects_oversized_value() {
        let dir = tempdir().unwrap();
        let store = FileKvStore::open(dir.path().join("store.json"));

        let result = store.write(&key("big"), "a".repeat(crate::capabilities::MAX_VALUE_SIZE + 1));

        assert!(matches!(result, Err(KvError::ValueTooLarge { .. })));
        assert_eq!(store.read(&key("big")).unwrap(), None);
    }

    #[test]
    fn test_tampered_payload_fails_checksum() {
        let mut entries = Entries::new();
        entries.insert("userdata:a".into(), "1".into());
        let bytes = encode_envelope(&entries).unwrap();

        let mut envelope: StoreEnvelope = serde_json::from_slice(&bytes).unwrap();
        envelope.payload = envelope.payload.replace('1', "2");
        let tampered = serde_json::to_vec(&envelope).unwrap();

        assert!(matches!(
            decode_envelope(&tampered),
            Err(KvError::Storage {
                code: StorageErrorCode::Corrupted,
                ..
            })
        ));
    }

    #[test]
    fn test_future_schema_is_rejected() {
        let entries = Entries::new();
        let bytes = encode_envelope(&entries).unwrap();
        let mut envelope: StoreEnvelope = serde_json::from_slice(&bytes).unwrap();
        envelope.schema_version = CURRENT_SCHEMA_VERSION + 1;

        let result = decode_envelope(&serde_json::to_vec(&envelope).unwrap());
        assert!(result.is_err());
    }

    #[test]
    fn test_file_remove_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = FileKvStore::open(&path);
        store.write(&key("a"), "1".into()).unwrap();

        assert!(store.remove(&key("a")).unwrap());
        assert!(!store.remove(&key("a")).unwrap());

        let reopened = FileKvStore::open(&path);
        assert_eq!(reopened.read(&key("a")).unwrap(), None);
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn test_sqlite_upsert_bumps_version() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        let k = key("catalog");

        assert_eq!(store.version(&k).unwrap(), 0);
        store.write(&k, "[]".into()).unwrap();
        store.write(&k, "[1]".into()).unwrap();

        assert_eq!(store.read(&k).unwrap().as_deref(), Some("[1]"));
        assert_eq!(store.version(&k).unwrap(), 2);
        assert_eq!(store.keys("userdata:").unwrap(), vec![k.raw()]);
        assert!(store.keys("cache:").unwrap().is_empty());
        assert!(store.remove(&k).unwrap());
        assert_eq!(store.read(&k).unwrap(), None);
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn test_sqlite_file_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kv.db");

        SqliteKvStore::open(&path)
            .unwrap()
            .write(&key("a"), "\"x\"".into())
            .unwrap();

        let reopened = SqliteKvStore::open(&path).unwrap();
        assert_eq!(reopened.read(&key("a")).unwrap().as_deref(), Some("\"x\""));
    }
}
