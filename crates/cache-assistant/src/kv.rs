//! Key-value persistence the store and migrations run against.
//!
//! Mirrors the extension storage area: async get/set/remove over string keys,
//! with `set` applying every entry of one call as a single write.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("quota exceeded: {used} of {quota} bytes")]
    QuotaExceeded { used: usize, quota: usize },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Backend(String),
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Values for the requested keys; absent keys are omitted from the result.
    async fn get(&self, keys: &[&str]) -> Result<Map<String, Value>, KvError>;

    async fn set(&self, entries: Map<String, Value>) -> Result<(), KvError>;

    async fn remove(&self, keys: &[&str]) -> Result<(), KvError>;
}

pub fn memory() -> Arc<dyn KeyValueStore> {
    Arc::new(MemoryKeyValueStore::default())
}

/// In-memory store that rejects writes once the encoded contents exceed `quota_bytes`.
pub fn memory_with_quota(quota_bytes: usize) -> Arc<dyn KeyValueStore> {
    Arc::new(MemoryKeyValueStore {
        entries: Mutex::new(HashMap::new()),
        quota_bytes: Some(quota_bytes),
    })
}

pub fn json_file(path: impl Into<PathBuf>) -> Arc<dyn KeyValueStore> {
    Arc::new(JsonFileKeyValueStore::new(path))
}

#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, Value>>,
    quota_bytes: Option<usize>,
}

impl MemoryKeyValueStore {
    fn check_quota(&self, entries: &HashMap<String, Value>) -> Result<(), KvError> {
        let Some(quota) = self.quota_bytes else {
            return Ok(());
        };
        let mut used = 0usize;
        for (key, value) in entries {
            used += key.len() + serde_json::to_vec(value)?.len();
        }
        if used > quota {
            return Err(KvError::QuotaExceeded { used, quota });
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, keys: &[&str]) -> Result<Map<String, Value>, KvError> {
        let entries = self.entries.lock().await;
        Ok(keys
            .iter()
            .filter_map(|key| {
                entries
                    .get(*key)
                    .map(|value| ((*key).to_string(), value.clone()))
            })
            .collect())
    }

    async fn set(&self, updates: Map<String, Value>) -> Result<(), KvError> {
        let mut entries = self.entries.lock().await;
        let mut next = entries.clone();
        next.extend(updates);
        self.check_quota(&next)?;
        *entries = next;
        Ok(())
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), KvError> {
        let mut entries = self.entries.lock().await;
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }
}

/// Store persisted as one JSON object on disk.
///
/// The file is re-read on every call so separate processes see each other's
/// writes; each mutation is written to a temp file and renamed into place.
pub struct JsonFileKeyValueStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileKeyValueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn load(&self) -> Result<Map<String, Value>, KvError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Map::new());
            }
            Err(error) => return Err(error.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Map::new());
        }
        match serde_json::from_slice::<Value>(&bytes)? {
            Value::Object(map) => Ok(map),
            _ => Err(KvError::Backend(format!(
                "store file {} does not hold a JSON object",
                self.path.display()
            ))),
        }
    }

    async fn persist(&self, snapshot: &Map<String, Value>) -> Result<(), KvError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let payload = serde_json::to_vec_pretty(snapshot)?;
        let temp_path = self
            .path
            .with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&temp_path, payload).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        debug!(path = %self.path.display(), keys = snapshot.len(), "persisted store file");
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for JsonFileKeyValueStore {
    async fn get(&self, keys: &[&str]) -> Result<Map<String, Value>, KvError> {
        let _guard = self.lock.lock().await;
        let mut contents = self.load().await?;
        Ok(keys
            .iter()
            .filter_map(|key| contents.remove(*key).map(|value| ((*key).to_string(), value)))
            .collect())
    }

    async fn set(&self, entries: Map<String, Value>) -> Result<(), KvError> {
        let _guard = self.lock.lock().await;
        let mut contents = self.load().await?;
        contents.extend(entries);
        self.persist(&contents).await
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), KvError> {
        let _guard = self.lock.lock().await;
        let mut contents = self.load().await?;
        let before = contents.len();
        for key in keys {
            contents.shift_remove(*key);
        }
        if contents.len() == before {
            return Ok(());
        }
        self.persist(&contents).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn entries(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn memory_store_get_omits_absent_keys() {
        let store = memory();
        store
            .set(entries(json!({"a": 1, "b": [1, 2]})))
            .await
            .expect("set");
        let found = store.get(&["a", "missing"]).await.expect("get");
        assert_eq!(Value::Object(found), json!({"a": 1}));

        store.remove(&["a"]).await.expect("remove");
        assert!(store.get(&["a"]).await.expect("get").is_empty());
    }

    #[tokio::test]
    async fn quota_rejects_write_and_keeps_previous_contents() {
        let store = memory_with_quota(32);
        store.set(entries(json!({"k": "small"}))).await.expect("set");

        let error = store
            .set(entries(json!({"big": "x".repeat(64)})))
            .await
            .expect_err("quota");
        assert!(matches!(error, KvError::QuotaExceeded { .. }));
        assert!(store.get(&["big"]).await.expect("get").is_empty());
        assert_eq!(
            Value::Object(store.get(&["k"]).await.expect("get")),
            json!({"k": "small"})
        );
    }

    #[tokio::test]
    async fn json_file_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("storage.json");

        let store = json_file(&path);
        assert!(store.get(&["a"]).await.expect("empty get").is_empty());
        store
            .set(entries(json!({"a": {"x": 1}, "b": "two"})))
            .await
            .expect("set");
        store.remove(&["b"]).await.expect("remove");

        let reopened = json_file(&path);
        let found = reopened.get(&["a", "b"]).await.expect("get");
        assert_eq!(Value::Object(found), json!({"a": {"x": 1}}));
    }

    #[tokio::test]
    async fn json_file_store_rejects_non_object_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("storage.json");
        std::fs::write(&path, b"[1,2,3]").expect("write");

        let error = json_file(&path).get(&["a"]).await.expect_err("corrupt");
        assert!(matches!(error, KvError::Backend(_)));
    }
}
