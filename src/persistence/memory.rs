//! In-memory `Storage` backend, for tests and for deployments that don't
//! need restart-durable state.

use super::{Storage, StorageError};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct InMemoryStorage {
    map: RwLock<HashMap<String, Value>>,
}

impl InMemoryStorage {
    pub fn new() -> InMemoryStorage {
        InMemoryStorage::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.map.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.map.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.map.write().await.remove(key);
        Ok(())
    }

    async fn all(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError> {
        Ok(self
            .map
            .read()
            .await
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn clear(&self, prefix: &str) -> Result<(), StorageError> {
        self.map.write().await.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}
