//! Page-context side of the bridge: reads and writes a tab's local/session
//! storage on behalf of the extension.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock as StdRwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::bridge::{PageTransport, ScriptInjector, TransportError};
use crate::normalize::normalize_storage_items;
use crate::types::{
    Provenance, StorageData, StorageType, TabId, WatchedKeyItem, is_source_key, source_key,
};

/// Message the browser reports when a tab has no listener yet.
pub const RECEIVER_MISSING_MESSAGE: &str =
    "Could not establish connection. Receiving end does not exist.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageRequest {
    GetStorageData { items: Vec<WatchedKeyItem> },
    SetStorageData { data: StorageData },
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct StorageAccessError(pub String);

/// One of the page's `Storage` areas.
pub trait WebStorage: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageAccessError>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageAccessError>;
    fn remove_item(&self, key: &str) -> Result<(), StorageAccessError>;
}

#[derive(Default)]
pub struct MemoryWebStorage {
    items: StdRwLock<HashMap<String, String>>,
}

impl MemoryWebStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.read().map(|items| items.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StorageAccessError {
    StorageAccessError("storage lock poisoned".to_string())
}

impl WebStorage for MemoryWebStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageAccessError> {
        Ok(self.items.read().map_err(|_| poisoned())?.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageAccessError> {
        self.items
            .write()
            .map_err(|_| poisoned())?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageAccessError> {
        self.items.write().map_err(|_| poisoned())?.remove(key);
        Ok(())
    }
}

pub struct PageResponder {
    local: Arc<dyn WebStorage>,
    session: Arc<dyn WebStorage>,
}

impl PageResponder {
    pub fn new(local: Arc<dyn WebStorage>, session: Arc<dyn WebStorage>) -> Self {
        Self { local, session }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryWebStorage::new()),
            Arc::new(MemoryWebStorage::new()),
        )
    }

    pub fn local(&self) -> &Arc<dyn WebStorage> {
        &self.local
    }

    pub fn session(&self) -> &Arc<dyn WebStorage> {
        &self.session
    }

    fn area(&self, storage_type: StorageType) -> &dyn WebStorage {
        match storage_type {
            StorageType::Local => self.local.as_ref(),
            StorageType::Session => self.session.as_ref(),
        }
    }

    /// Handle a raw bridge message; unknown message types get no reply.
    pub fn handle(&self, message: &Value) -> Option<Value> {
        match message.get("type").and_then(Value::as_str)? {
            "GET_STORAGE_DATA" => {
                let items = normalize_storage_items(message.get("items"), message.get("keys"));
                Some(Value::Object(self.read(&items)))
            }
            "SET_STORAGE_DATA" => {
                let data = match message.get("data") {
                    Some(Value::Object(data)) => data.clone(),
                    _ => StorageData::new(),
                };
                Some(self.write(&data))
            }
            _ => None,
        }
    }

    pub fn handle_request(&self, request: &PageRequest) -> Value {
        match request {
            PageRequest::GetStorageData { items } => Value::Object(self.read(items)),
            PageRequest::SetStorageData { data } => self.write(data),
        }
    }

    /// Read each key strictly from its requested area, recording provenance in
    /// a `<key>_source` sidecar. Sidecar-shaped keys are not read.
    pub fn read(&self, items: &[WatchedKeyItem]) -> StorageData {
        match self.try_read(items) {
            Ok(results) => results,
            Err(error) => {
                error!(%error, "failed to read page storage");
                StorageData::new()
            }
        }
    }

    fn try_read(&self, items: &[WatchedKeyItem]) -> Result<StorageData, StorageAccessError> {
        let mut results = StorageData::new();
        for item in items {
            if is_source_key(&item.key) {
                debug!(key = %item.key, "skipping sidecar-shaped key");
                continue;
            }
            let (value, provenance) = match self.area(item.storage_type).get_item(&item.key)? {
                Some(raw) => (decode_stored(raw), Provenance::from(item.storage_type)),
                None => (Value::Null, Provenance::NotFound),
            };
            results.insert(item.key.clone(), value);
            results.insert(
                source_key(&item.key),
                Value::String(provenance.as_str().to_string()),
            );
        }
        Ok(results)
    }

    /// Write every non-sidecar key to the area named by its sidecar (local when
    /// absent). A null value removes the key from both areas.
    pub fn write(&self, data: &StorageData) -> Value {
        match self.try_write(data) {
            Ok(results) => json!({ "success": true, "data": results }),
            Err(error) => {
                error!(%error, "failed to write page storage");
                json!({ "success": false, "error": error.to_string() })
            }
        }
    }

    fn try_write(&self, data: &StorageData) -> Result<StorageData, StorageAccessError> {
        let mut results = StorageData::new();
        for (key, value) in data {
            if is_source_key(key) {
                continue;
            }
            if value.is_null() {
                self.local.remove_item(key)?;
                self.session.remove_item(key)?;
                results.insert(key.clone(), json!({ "success": true, "action": "removed" }));
                continue;
            }

            let destination = data
                .get(&source_key(key))
                .and_then(Value::as_str)
                .map(StorageType::parse_lenient)
                .unwrap_or_default();
            let encoded = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            self.area(destination).set_item(key, &encoded)?;
            results.insert(
                key.clone(),
                json!({ "success": true, "source": destination.as_str() }),
            );
        }
        Ok(results)
    }
}

fn decode_stored(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

struct HostedPage {
    responder: Arc<PageResponder>,
    listening: bool,
}

/// Pages hosted in-process behind the bridge seams.
///
/// A page opened without a listener rejects messages the way a browser tab
/// does before its content script runs, until [`ScriptInjector::inject`]
/// installs one.
#[derive(Default)]
pub struct InProcessPages {
    pages: RwLock<BTreeMap<TabId, HostedPage>>,
    injections: RwLock<Vec<(TabId, String)>>,
}

impl InProcessPages {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open(&self, tab_id: TabId, listening: bool) -> Arc<PageResponder> {
        let responder = Arc::new(PageResponder::in_memory());
        self.pages.write().await.insert(
            tab_id,
            HostedPage {
                responder: responder.clone(),
                listening,
            },
        );
        responder
    }

    pub async fn close(&self, tab_id: TabId) {
        self.pages.write().await.remove(&tab_id);
    }

    /// Scripts injected so far, in order.
    pub async fn injections(&self) -> Vec<(TabId, String)> {
        self.injections.read().await.clone()
    }
}

#[async_trait]
impl PageTransport for InProcessPages {
    async fn send(&self, tab_id: TabId, request: &PageRequest) -> Result<Value, TransportError> {
        let responder = {
            let pages = self.pages.read().await;
            match pages.get(&tab_id) {
                Some(page) if page.listening => page.responder.clone(),
                _ => {
                    return Err(TransportError::ReceiverMissing(
                        RECEIVER_MISSING_MESSAGE.to_string(),
                    ));
                }
            }
        };
        Ok(responder.handle_request(request))
    }
}

#[async_trait]
impl ScriptInjector for InProcessPages {
    async fn inject(&self, tab_id: TabId, script: &str) -> Result<(), TransportError> {
        self.injections
            .write()
            .await
            .push((tab_id, script.to_string()));
        let mut pages = self.pages.write().await;
        let page = pages
            .get_mut(&tab_id)
            .ok_or_else(|| TransportError::Failed(format!("No tab with id: {tab_id}.")))?;
        page.listening = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(value: Value) -> StorageData {
        match value {
            Value::Object(map) => map,
            _ => StorageData::new(),
        }
    }

    #[test]
    fn read_is_strict_about_storage_area() {
        let page = PageResponder::in_memory();
        page.session.set_item("x", "{\"a\":1}").expect("seed");

        let from_session = page.read(&[WatchedKeyItem::new("x", StorageType::Session)]);
        assert_eq!(
            Value::Object(from_session),
            json!({"x": {"a": 1}, "x_source": "sessionStorage"})
        );

        let from_local = page.read(&[WatchedKeyItem::local("x")]);
        assert_eq!(
            Value::Object(from_local),
            json!({"x": null, "x_source": "not_found"})
        );
    }

    #[test]
    fn read_keeps_non_json_strings_verbatim() {
        let page = PageResponder::in_memory();
        page.local.set_item("plain", "hello world").expect("seed");
        page.local.set_item("num", "42").expect("seed");

        let read = page.read(&[WatchedKeyItem::local("plain"), WatchedKeyItem::local("num")]);
        assert_eq!(read["plain"], json!("hello world"));
        assert_eq!(read["num"], json!(42));
    }

    #[test]
    fn sidecar_keys_never_get_sidecars() {
        let page = PageResponder::in_memory();
        page.local.set_item("x_source", "raw").expect("seed");
        let read = page.read(&[WatchedKeyItem::local("x_source")]);
        assert!(read.is_empty());
    }

    #[test]
    fn write_follows_sidecar_and_encodes_non_strings() {
        let page = PageResponder::in_memory();
        let result = page.write(&data(json!({
            "x": {"n": 1},
            "x_source": "sessionStorage",
            "y": "text",
            "z": 5,
            "z_source": "not_found"
        })));

        assert_eq!(
            result,
            json!({
                "success": true,
                "data": {
                    "x": {"success": true, "source": "sessionStorage"},
                    "y": {"success": true, "source": "localStorage"},
                    "z": {"success": true, "source": "localStorage"}
                }
            })
        );
        assert_eq!(page.session.get_item("x").expect("get"), Some("{\"n\":1}".to_string()));
        assert_eq!(page.local.get_item("y").expect("get"), Some("text".to_string()));
        assert_eq!(page.local.get_item("z").expect("get"), Some("5".to_string()));
        assert_eq!(page.local.get_item("x_source").expect("get"), None);
    }

    #[test]
    fn null_removes_from_both_areas() {
        let page = PageResponder::in_memory();
        page.session.set_item("y", "1").expect("seed");

        let result = page.write(&data(json!({"y": null, "y_source": "localStorage"})));
        assert_eq!(result["data"]["y"], json!({"success": true, "action": "removed"}));
        assert_eq!(page.local.get_item("y").expect("get"), None);
        assert_eq!(page.session.get_item("y").expect("get"), None);
    }

    #[test]
    fn raw_messages_accept_legacy_keys() {
        let page = PageResponder::in_memory();
        page.local.set_item("k", "\"v\"").expect("seed");

        let reply = page
            .handle(&json!({"type": "GET_STORAGE_DATA", "keys": ["k"]}))
            .expect("reply");
        assert_eq!(reply, json!({"k": "v", "k_source": "localStorage"}));
        assert!(page.handle(&json!({"type": "PING"})).is_none());
    }

    #[tokio::test]
    async fn injection_installs_listener() {
        let pages = InProcessPages::new();
        pages.open(7, false).await;
        let request = PageRequest::GetStorageData { items: Vec::new() };

        assert!(matches!(
            pages.send(7, &request).await,
            Err(TransportError::ReceiverMissing(_))
        ));
        pages.inject(7, "content-scripts/content.js").await.expect("inject");
        assert_eq!(pages.send(7, &request).await.expect("send"), json!({}));
        assert_eq!(
            pages.injections().await,
            vec![(7, "content-scripts/content.js".to_string())]
        );
        assert!(matches!(
            pages.inject(8, "content-scripts/content.js").await,
            Err(TransportError::Failed(_))
        ));
    }
}
