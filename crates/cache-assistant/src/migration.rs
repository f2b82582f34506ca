//! One-shot upgrade from the flat storage layout to per-domain partitions.
//!
//! The transforms are pure; the `ensure_*` steps wrap them with I/O and run
//! before every read. Completion is recorded under [`MIGRATIONS_KEY`] in the
//! same write as the migrated partition map, so a crash before the legacy
//! entry is deleted only leaves a leftover to clean up, never a second
//! migration.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::kv::KeyValueStore;
use crate::normalize::normalize_watched_keys;
use crate::store::{
    CONFIGS_BY_DOMAIN_KEY, ConfigsByDomain, StoreError, WATCHED_KEYS_BY_DOMAIN_KEY,
    WatchedKeysByDomain, decode_configs_by_domain, decode_watched_keys_by_domain,
};
use crate::types::{DEFAULT_DOMAIN_KEY, StorageConfig, WatchedKeyItem, domain_key};

pub const LEGACY_WATCHED_KEYS_KEY: &str = "watchedKeys";
pub const LEGACY_CONFIGS_KEY: &str = "cacheAssistantConfigs";
pub const MIGRATIONS_KEY: &str = "storageMigrations";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    WatchedKeys,
    Configs,
}

impl Namespace {
    pub fn partition_key(self) -> &'static str {
        match self {
            Self::WatchedKeys => WATCHED_KEYS_BY_DOMAIN_KEY,
            Self::Configs => CONFIGS_BY_DOMAIN_KEY,
        }
    }

    pub fn legacy_key(self) -> &'static str {
        match self {
            Self::WatchedKeys => LEGACY_WATCHED_KEYS_KEY,
            Self::Configs => LEGACY_CONFIGS_KEY,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationMarkers {
    #[serde(default)]
    pub watched_keys: bool,
    #[serde(default)]
    pub configs: bool,
}

impl MigrationMarkers {
    pub fn from_value(value: Option<&Value>) -> Self {
        value
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }

    pub fn is_done(self, namespace: Namespace) -> bool {
        match namespace {
            Namespace::WatchedKeys => self.watched_keys,
            Namespace::Configs => self.configs,
        }
    }

    pub fn mark(mut self, namespace: Namespace) -> Self {
        match namespace {
            Namespace::WatchedKeys => self.watched_keys = true,
            Namespace::Configs => self.configs = true,
        }
        self
    }
}

/// Seed legacy (global) watched keys into the sentinel partition and into the
/// partition of the site whose read triggered the migration.
pub fn partition_legacy_watched_keys(
    legacy: &Value,
    requesting_domain_key: &str,
) -> WatchedKeysByDomain {
    let items = normalize_watched_keys(Some(legacy));
    let mut partitions = BTreeMap::new();
    partitions.insert(DEFAULT_DOMAIN_KEY.to_string(), items.clone());
    partitions.insert(requesting_domain_key.to_string(), items);
    partitions
}

#[derive(Debug, Default)]
pub struct LegacyConfigPartition {
    pub partitions: ConfigsByDomain,
    pub skipped: usize,
}

/// Route each legacy record to the partition named by its own `domain` field.
///
/// Records that no longer decode strictly are carried through field by field:
/// the map key stands in for a missing `id`, and a missing or unparsable
/// `createdAt` becomes `migrated_at`. Only non-object records are skipped.
pub fn partition_legacy_configs(
    legacy: &Map<String, Value>,
    migrated_at: DateTime<Utc>,
) -> LegacyConfigPartition {
    let mut outcome = LegacyConfigPartition::default();
    for (entry_key, record) in legacy {
        let Some(config) = serde_json::from_value::<StorageConfig>(record.clone())
            .ok()
            .or_else(|| salvage_legacy_config(entry_key, record, migrated_at))
        else {
            outcome.skipped += 1;
            continue;
        };
        outcome
            .partitions
            .entry(domain_key(config.domain.as_deref()))
            .or_default()
            .insert(config.id.clone(), config);
    }
    outcome
}

fn salvage_legacy_config(
    entry_key: &str,
    record: &Value,
    migrated_at: DateTime<Utc>,
) -> Option<StorageConfig> {
    let fields = record.as_object()?;
    let text = |name: &str| {
        fields
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    let id = text("id").unwrap_or_else(|| entry_key.to_string());
    let created_at = text("createdAt")
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map_or(migrated_at, |parsed| parsed.with_timezone(&Utc));
    let data = match fields.get("data") {
        Some(Value::Object(data)) => data.clone(),
        _ => Map::new(),
    };
    Some(StorageConfig {
        name: text("name").unwrap_or_else(|| id.clone()),
        id,
        data,
        created_at,
        domain: text("domain"),
    })
}

/// Run the watched-keys migration if it has not completed yet.
///
/// Returns the migrated items when this call performed the migration.
pub async fn ensure_watched_keys_migrated(
    kv: &dyn KeyValueStore,
    requesting_domain_key: &str,
) -> Result<Option<Vec<WatchedKeyItem>>, StoreError> {
    let namespace = Namespace::WatchedKeys;
    let snapshot = kv
        .get(&[namespace.partition_key(), namespace.legacy_key(), MIGRATIONS_KEY])
        .await?;
    let markers = MigrationMarkers::from_value(snapshot.get(MIGRATIONS_KEY));
    let legacy = snapshot.get(namespace.legacy_key());

    if markers.is_done(namespace) {
        if legacy.is_some() {
            kv.remove(&[namespace.legacy_key()]).await?;
        }
        return Ok(None);
    }

    let Some(legacy @ Value::Array(_)) = legacy else {
        return Ok(None);
    };

    let existing = decode_watched_keys_by_domain(snapshot.get(namespace.partition_key()))?;
    if !existing.is_empty() {
        warn!(
            partitions = existing.len(),
            "watched keys already partitioned; dropping legacy entry without merging"
        );
        complete(kv, namespace, markers, None).await?;
        return Ok(None);
    }

    let partitions = partition_legacy_watched_keys(legacy, requesting_domain_key);
    let migrated = partitions
        .get(requesting_domain_key)
        .cloned()
        .unwrap_or_default();
    complete(
        kv,
        namespace,
        markers,
        Some(serde_json::to_value(&partitions).map_err(crate::kv::KvError::from)?),
    )
    .await?;

    info!(
        domain = %requesting_domain_key,
        keys = migrated.len(),
        "migrated legacy watched keys"
    );
    Ok(Some(migrated))
}

/// Run the one-time global configs migration if it has not completed yet.
///
/// Returns `true` when this call performed the migration.
pub async fn ensure_configs_migrated(kv: &dyn KeyValueStore) -> Result<bool, StoreError> {
    let namespace = Namespace::Configs;
    let snapshot = kv
        .get(&[namespace.partition_key(), namespace.legacy_key(), MIGRATIONS_KEY])
        .await?;
    let markers = MigrationMarkers::from_value(snapshot.get(MIGRATIONS_KEY));
    let legacy = snapshot.get(namespace.legacy_key());

    if markers.is_done(namespace) {
        if legacy.is_some() {
            kv.remove(&[namespace.legacy_key()]).await?;
        }
        return Ok(false);
    }

    let Some(Value::Object(legacy)) = legacy else {
        return Ok(false);
    };
    if legacy.is_empty() {
        return Ok(false);
    }

    let existing = decode_configs_by_domain(snapshot.get(namespace.partition_key()))?;
    if !existing.is_empty() {
        warn!(
            partitions = existing.len(),
            "configs already partitioned; dropping legacy entry without merging"
        );
        complete(kv, namespace, markers, None).await?;
        return Ok(false);
    }

    let outcome = partition_legacy_configs(legacy, Utc::now());
    let migrated: usize = outcome.partitions.values().map(BTreeMap::len).sum();
    complete(
        kv,
        namespace,
        markers,
        Some(serde_json::to_value(&outcome.partitions).map_err(crate::kv::KvError::from)?),
    )
    .await?;

    if outcome.skipped > 0 {
        warn!(
            skipped = outcome.skipped,
            "dropped legacy config entries that are not objects"
        );
    }
    info!(
        partitions = outcome.partitions.len(),
        configs = migrated,
        skipped = outcome.skipped,
        "migrated legacy configs"
    );
    Ok(true)
}

async fn complete(
    kv: &dyn KeyValueStore,
    namespace: Namespace,
    markers: MigrationMarkers,
    partitions: Option<Value>,
) -> Result<(), StoreError> {
    let mut entries = Map::new();
    if let Some(partitions) = partitions {
        entries.insert(namespace.partition_key().to_string(), partitions);
    }
    entries.insert(
        MIGRATIONS_KEY.to_string(),
        serde_json::to_value(markers.mark(namespace)).map_err(crate::kv::KvError::from)?,
    );
    kv.set(entries).await?;
    kv.remove(&[namespace.legacy_key()]).await?;
    Ok(())
}
