use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Partition used when a tab has no resolvable hostname.
pub const DEFAULT_DOMAIN_KEY: &str = "_default";

/// Suffix of the provenance sidecar entry stored next to each value.
pub const SOURCE_SUFFIX: &str = "_source";

/// Page storage snapshot: logical keys plus their `<key>_source` sidecars.
pub type StorageData = Map<String, Value>;

pub type TabId = i64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum StorageType {
    #[default]
    #[serde(rename = "localStorage")]
    Local,
    #[serde(rename = "sessionStorage")]
    Session,
}

impl StorageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "localStorage",
            Self::Session => "sessionStorage",
        }
    }

    /// Lenient parse: anything that does not name session storage is local.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim() {
            "sessionStorage" | "session" => Self::Session,
            _ => Self::Local,
        }
    }
}

impl<'de> Deserialize<'de> for StorageType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw
            .as_deref()
            .map(Self::parse_lenient)
            .unwrap_or_default())
    }
}

/// Where a value read from the page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    #[serde(rename = "localStorage")]
    Local,
    #[serde(rename = "sessionStorage")]
    Session,
    #[serde(rename = "not_found")]
    NotFound,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "localStorage",
            Self::Session => "sessionStorage",
            Self::NotFound => "not_found",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "localStorage" => Some(Self::Local),
            "sessionStorage" => Some(Self::Session),
            "not_found" => Some(Self::NotFound),
            _ => None,
        }
    }
}

impl From<StorageType> for Provenance {
    fn from(value: StorageType) -> Self {
        match value {
            StorageType::Local => Self::Local,
            StorageType::Session => Self::Session,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchedKeyItem {
    pub key: String,
    #[serde(default)]
    pub storage_type: StorageType,
}

impl WatchedKeyItem {
    pub fn new(key: impl Into<String>, storage_type: StorageType) -> Self {
        Self {
            key: key.into(),
            storage_type,
        }
    }

    pub fn local(key: impl Into<String>) -> Self {
        Self::new(key, StorageType::Local)
    }
}

/// Named snapshot of page storage, owned by one domain partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub data: StorageData,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

pub fn source_key(key: &str) -> String {
    format!("{key}{SOURCE_SUFFIX}")
}

pub fn is_source_key(key: &str) -> bool {
    key.ends_with(SOURCE_SUFFIX)
}

/// Partition key for a hostname; blank hostnames fall into the sentinel partition.
pub fn domain_key(domain: Option<&str>) -> String {
    match domain.map(str::trim) {
        Some(host) if !host.is_empty() => host.to_string(),
        _ => DEFAULT_DOMAIN_KEY.to_string(),
    }
}
