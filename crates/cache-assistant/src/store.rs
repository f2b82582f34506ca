use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::kv::{KeyValueStore, KvError};
use crate::migration::{ensure_configs_migrated, ensure_watched_keys_migrated};
use crate::normalize::normalize_watched_keys;
use crate::types::{StorageConfig, StorageData, StorageType, WatchedKeyItem, domain_key};

pub const WATCHED_KEYS_BY_DOMAIN_KEY: &str = "watchedKeysByDomain";
pub const CONFIGS_BY_DOMAIN_KEY: &str = "cacheAssistantConfigsByDomain";

pub type WatchedKeysByDomain = BTreeMap<String, Vec<WatchedKeyItem>>;
pub type DomainConfigs = BTreeMap<String, StorageConfig>;
pub type ConfigsByDomain = BTreeMap<String, DomainConfigs>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("配置不存在")]
    NotFound,
    #[error(transparent)]
    Persistence(#[from] KvError),
    #[error("corrupt {key} entry: {message}")]
    Corrupt { key: &'static str, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedKeys {
    pub items: Vec<WatchedKeyItem>,
    /// Set when this read performed the legacy migration.
    pub migrated: bool,
}

/// Per-domain watched keys and saved configs on top of a [`KeyValueStore`].
///
/// Every operation first runs the pending legacy migration for its namespace,
/// then reloads the whole partition map, mutates it, and writes it
/// back in one `set`; nothing is cached between calls. Two concurrent writers
/// to the same map race and the last full snapshot wins.
#[derive(Clone)]
pub struct DomainStore {
    kv: Arc<dyn KeyValueStore>,
}

impl DomainStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
        &self.kv
    }

    pub async fn get_watched_keys(&self, domain: &str) -> Result<WatchedKeys, StoreError> {
        let partition = domain_key(Some(domain));
        let migrated = ensure_watched_keys_migrated(self.kv.as_ref(), &partition)
            .await?
            .is_some();
        let mut by_domain = self.load_watched_keys().await?;
        Ok(WatchedKeys {
            items: by_domain.remove(&partition).unwrap_or_default(),
            migrated,
        })
    }

    /// Returns `false` when the key was already watched.
    pub async fn add_watched_key(
        &self,
        domain: &str,
        key: &str,
        storage_type: StorageType,
    ) -> Result<bool, StoreError> {
        let partition = domain_key(Some(domain));
        ensure_watched_keys_migrated(self.kv.as_ref(), &partition).await?;
        let mut by_domain = self.load_watched_keys().await?;
        let items = by_domain.entry(partition.clone()).or_default();
        if items.iter().any(|item| item.key == key) {
            return Ok(false);
        }
        items.push(WatchedKeyItem::new(key, storage_type));
        self.write(WATCHED_KEYS_BY_DOMAIN_KEY, &by_domain).await?;
        debug!(domain = %partition, key, "watched key added");
        Ok(true)
    }

    /// Returns `false` when the key was not watched.
    pub async fn remove_watched_key(&self, domain: &str, key: &str) -> Result<bool, StoreError> {
        let partition = domain_key(Some(domain));
        ensure_watched_keys_migrated(self.kv.as_ref(), &partition).await?;
        let mut by_domain = self.load_watched_keys().await?;
        let Some(items) = by_domain.get_mut(&partition) else {
            return Ok(false);
        };
        let before = items.len();
        items.retain(|item| item.key != key);
        if items.len() == before {
            return Ok(false);
        }
        self.write(WATCHED_KEYS_BY_DOMAIN_KEY, &by_domain).await?;
        debug!(domain = %partition, key, "watched key removed");
        Ok(true)
    }

    pub async fn get_all_configs(&self, domain: &str) -> Result<DomainConfigs, StoreError> {
        ensure_configs_migrated(self.kv.as_ref()).await?;
        let mut by_domain = self.load_configs().await?;
        Ok(by_domain
            .remove(&domain_key(Some(domain)))
            .unwrap_or_default())
    }

    pub async fn save_config(
        &self,
        domain: &str,
        name: &str,
        data: StorageData,
    ) -> Result<String, StoreError> {
        let partition = domain_key(Some(domain));
        ensure_configs_migrated(self.kv.as_ref()).await?;
        let mut by_domain = self.load_configs().await?;
        let created_at = Utc::now();
        let config_id = new_config_id(created_at);
        let hostname = domain.trim();
        let config = StorageConfig {
            id: config_id.clone(),
            name: name.to_string(),
            data,
            created_at,
            domain: (!hostname.is_empty()).then(|| hostname.to_string()),
        };
        by_domain
            .entry(partition.clone())
            .or_default()
            .insert(config_id.clone(), config);
        self.write(CONFIGS_BY_DOMAIN_KEY, &by_domain).await?;
        debug!(domain = %partition, config_id = %config_id, "config saved");
        Ok(config_id)
    }

    pub async fn load_config(&self, domain: &str, config_id: &str) -> Result<StorageData, StoreError> {
        ensure_configs_migrated(self.kv.as_ref()).await?;
        let mut by_domain = self.load_configs().await?;
        by_domain
            .get_mut(&domain_key(Some(domain)))
            .and_then(|configs| configs.remove(config_id))
            .map(|config| config.data)
            .ok_or(StoreError::NotFound)
    }

    pub async fn delete_config(&self, domain: &str, config_id: &str) -> Result<(), StoreError> {
        let partition = domain_key(Some(domain));
        ensure_configs_migrated(self.kv.as_ref()).await?;
        let mut by_domain = self.load_configs().await?;
        let removed = by_domain
            .get_mut(&partition)
            .and_then(|configs| configs.remove(config_id));
        if removed.is_none() {
            return Err(StoreError::NotFound);
        }
        self.write(CONFIGS_BY_DOMAIN_KEY, &by_domain).await?;
        debug!(domain = %partition, config_id, "config deleted");
        Ok(())
    }

    async fn load_watched_keys(&self) -> Result<WatchedKeysByDomain, StoreError> {
        let mut found = self.kv.get(&[WATCHED_KEYS_BY_DOMAIN_KEY]).await?;
        decode_watched_keys_by_domain(found.remove(WATCHED_KEYS_BY_DOMAIN_KEY).as_ref())
    }

    async fn load_configs(&self) -> Result<ConfigsByDomain, StoreError> {
        let mut found = self.kv.get(&[CONFIGS_BY_DOMAIN_KEY]).await?;
        decode_configs_by_domain(found.remove(CONFIGS_BY_DOMAIN_KEY).as_ref())
    }

    async fn write<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let mut entries = Map::new();
        entries.insert(key.to_string(), serde_json::to_value(value).map_err(KvError::from)?);
        self.kv.set(entries).await?;
        Ok(())
    }
}

/// `config_<unix-millis>_<uuid v7>`; the v7 counter keeps ids minted in the
/// same millisecond distinct.
pub fn new_config_id(now: DateTime<Utc>) -> String {
    format!(
        "config_{}_{}",
        now.timestamp_millis(),
        Uuid::now_v7().simple()
    )
}

pub(crate) fn decode_watched_keys_by_domain(
    raw: Option<&Value>,
) -> Result<WatchedKeysByDomain, StoreError> {
    match raw {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(Value::Object(partitions)) => Ok(partitions
            .iter()
            .map(|(domain, items)| (domain.clone(), normalize_watched_keys(Some(items))))
            .collect()),
        Some(other) => Err(StoreError::Corrupt {
            key: WATCHED_KEYS_BY_DOMAIN_KEY,
            message: format!("expected object, found {}", json_kind(other)),
        }),
    }
}

pub(crate) fn decode_configs_by_domain(raw: Option<&Value>) -> Result<ConfigsByDomain, StoreError> {
    match raw {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(value) => {
            serde_json::from_value(value.clone()).map_err(|error| StoreError::Corrupt {
                key: CONFIGS_BY_DOMAIN_KEY,
                message: error.to_string(),
            })
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
