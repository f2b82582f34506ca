use std::{env, path::PathBuf, sync::Arc};

use thiserror::Error;

use crate::channels::SIDEPANEL_PORT_NAME;
use crate::kv::{self, KeyValueStore};

pub const DEFAULT_CONTENT_SCRIPT: &str = "content-scripts/content.js";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// JSON file backing the key-value store; in-memory when unset.
    pub store_path: Option<PathBuf>,
    pub sidepanel_port: String,
    pub content_script: String,
    /// Byte quota for the in-memory store. Rejected together with
    /// `store_path`; the JSON file store has no quota.
    pub store_quota_bytes: Option<usize>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid CACHE_ASSISTANT_STORE_QUOTA_BYTES: {0}")]
    InvalidStoreQuotaBytes(String),
    #[error("invalid CACHE_ASSISTANT_SIDEPANEL_PORT: {0}")]
    InvalidSidepanelPort(String),
    #[error("invalid CACHE_ASSISTANT_CONTENT_SCRIPT: {0}")]
    InvalidContentScript(String),
    #[error(
        "CACHE_ASSISTANT_STORE_QUOTA_BYTES only applies to the in-memory store; unset it or CACHE_ASSISTANT_STORE_PATH"
    )]
    QuotaWithStorePath,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let store_path = non_empty("CACHE_ASSISTANT_STORE_PATH").map(PathBuf::from);
        let sidepanel_port = match lookup("CACHE_ASSISTANT_SIDEPANEL_PORT") {
            None => SIDEPANEL_PORT_NAME.to_string(),
            Some(value) if value.trim().is_empty() => {
                return Err(ConfigError::InvalidSidepanelPort(
                    "port name must not be empty".to_string(),
                ));
            }
            Some(value) => value.trim().to_string(),
        };
        let content_script = match lookup("CACHE_ASSISTANT_CONTENT_SCRIPT") {
            None => DEFAULT_CONTENT_SCRIPT.to_string(),
            Some(value) if value.trim().is_empty() => {
                return Err(ConfigError::InvalidContentScript(
                    "script path must not be empty".to_string(),
                ));
            }
            Some(value) => value.trim().to_string(),
        };
        let store_quota_bytes = non_empty("CACHE_ASSISTANT_STORE_QUOTA_BYTES")
            .map(|value| {
                value
                    .parse::<usize>()
                    .map_err(|error| ConfigError::InvalidStoreQuotaBytes(error.to_string()))
            })
            .transpose()?;
        if store_path.is_some() && store_quota_bytes.is_some() {
            return Err(ConfigError::QuotaWithStorePath);
        }

        Ok(Self {
            store_path,
            sidepanel_port,
            content_script,
            store_quota_bytes,
        })
    }

    pub fn for_tests() -> Self {
        Self {
            store_path: None,
            sidepanel_port: SIDEPANEL_PORT_NAME.to_string(),
            content_script: DEFAULT_CONTENT_SCRIPT.to_string(),
            store_quota_bytes: None,
        }
    }

    /// Build the key-value store this configuration describes.
    pub fn open_store(&self) -> Arc<dyn KeyValueStore> {
        match (&self.store_path, self.store_quota_bytes) {
            (Some(path), _) => kv::json_file(path.clone()),
            (None, Some(quota)) => kv::memory_with_quota(quota),
            (None, None) => kv::memory(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::for_tests()
    }
}
