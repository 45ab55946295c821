//! Pluggable key/value persistence for player snapshots.
//!
//! A `Storage` trait object, in the style of the `AcoustIdApi`/`MusicBrainz`
//! client traits other pipelines in this space define for swappable
//! backends, lets the player pool save and restore state without caring
//! whether the backend is an in-memory map or a JSON file.

pub mod memory;
pub mod snapshot;

pub use memory::InMemoryStorage;
pub use snapshot::Snapshot;

use async_trait::async_trait;
use serde_json::Value;
use std::fmt::{self, Display, Formatter};

/// A prefix sentinel marking a JSON-stringified snowflake. Applied to
/// guild/channel/user ids before persisting so round-tripping through a
/// JSON file's f64 number range never loses precision.
pub const BIGINT_PREFIX: &str = "BIGINT::";

/// Wraps a `u64` snowflake as a JSON string carrying [`BIGINT_PREFIX`].
pub fn encode_bigint(id: u64) -> Value {
    Value::String(format!("{}{}", BIGINT_PREFIX, id))
}

/// Reverses [`encode_bigint`]; `None` if the value isn't a tagged string.
pub fn decode_bigint(value: &Value) -> Option<u64> {
    value
        .as_str()
        .and_then(|s| s.strip_prefix(BIGINT_PREFIX))
        .and_then(|s| s.parse().ok())
}

#[derive(Debug)]
pub struct StorageError(pub String);

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "storage error: {}", self.0)
    }
}

impl std::error::Error for StorageError {}

/// A pluggable persistence backend.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
    /// All entries whose key starts with `prefix`.
    async fn all(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError>;
    async fn clear(&self, prefix: &str) -> Result<(), StorageError>;
}

pub mod file {
    //! Whole-file JSON storage: simple, and adequate for the write volume a
    //! save-on-mutation policy produces once coalesced.

    use super::{Storage, StorageError};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tokio::sync::Mutex;

    pub struct JsonFileStorage {
        path: PathBuf,
        // Guards read-modify-write of the whole file; the access pattern here
        // is low-frequency (save coalescing happens above this layer) so a
        // single mutex over the whole map is simpler than per-key locking.
        cache: Mutex<HashMap<String, Value>>,
    }

    impl JsonFileStorage {
        /// Opens (or, if absent, prepares to create) a JSON file at `path`.
        pub async fn open(path: impl Into<PathBuf>) -> Result<JsonFileStorage, StorageError> {
            let path = path.into();

            let cache = match tokio::fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice(&bytes)
                    .map_err(|err| StorageError(err.to_string()))?,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
                Err(err) => return Err(StorageError(err.to_string())),
            };

            Ok(JsonFileStorage {
                path,
                cache: Mutex::new(cache),
            })
        }

        async fn flush(&self, cache: &HashMap<String, Value>) -> Result<(), StorageError> {
            let bytes =
                serde_json::to_vec_pretty(cache).map_err(|err| StorageError(err.to_string()))?;
            tokio::fs::write(&self.path, bytes)
                .await
                .map_err(|err| StorageError(err.to_string()))
        }
    }

    #[async_trait]
    impl Storage for JsonFileStorage {
        async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
            Ok(self.cache.lock().await.get(key).cloned())
        }

        async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
            let mut cache = self.cache.lock().await;
            cache.insert(key.to_string(), value);
            self.flush(&cache).await
        }

        async fn delete(&self, key: &str) -> Result<(), StorageError> {
            let mut cache = self.cache.lock().await;
            cache.remove(key);
            self.flush(&cache).await
        }

        async fn all(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError> {
            let cache = self.cache.lock().await;
            Ok(cache
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        }

        async fn clear(&self, prefix: &str) -> Result<(), StorageError> {
            let mut cache = self.cache.lock().await;
            cache.retain(|k, _| !k.starts_with(prefix));
            self.flush(&cache).await
        }
    }
}

pub use file::JsonFileStorage;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bigint_round_trips() {
        let encoded = encode_bigint(123456789012345);
        assert_eq!(decode_bigint(&encoded), Some(123456789012345));
    }

    #[test]
    fn decode_bigint_rejects_untagged_values() {
        assert_eq!(decode_bigint(&Value::String("123".into())), None);
        assert_eq!(decode_bigint(&Value::Number(123.into())), None);
    }

    #[tokio::test]
    async fn memory_storage_round_trips_and_filters_by_prefix() {
        let storage = InMemoryStorage::new();
        storage
            .set("player:1", serde_json::json!({"a": 1}))
            .await
            .unwrap();
        storage
            .set("other:1", serde_json::json!({"b": 2}))
            .await
            .unwrap();

        let all = storage.all("player:").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "player:1");

        storage.delete("player:1").await.unwrap();
        assert!(storage.get("player:1").await.unwrap().is_none());
    }
}
