//! Request dispatch for messages arriving from the side panel.
//!
//! Each recognized request type maps to one handler. [`MessageRouter::route`]
//! decides synchronously whether a reply will follow and hands back the
//! future that produces it; unrecognized types get `None` and no reply.
//! Handlers never fail across the boundary: every error becomes a
//! `{"success": false, "error": ...}` envelope.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, error};

use crate::bridge::{BridgeError, PageBridge, PageTransport, ScriptInjector};
use crate::channels::{ChannelId, ChannelRegistry, Notification, NotificationChannel};
use crate::config::Config;
use crate::kv::KeyValueStore;
use crate::normalize::normalize_storage_items;
use crate::store::{DomainStore, StoreError};
use crate::tabs::{MessageSender, TabResolver, resolve_domain, resolve_tab_id, tab_url};
use crate::types::{StorageData, StorageType};

pub const REQUEST_TYPES: [&str; 10] = [
    "GET_STORAGE_DATA",
    "SET_STORAGE_DATA",
    "GET_WATCHED_KEYS",
    "ADD_WATCHED_KEY",
    "REMOVE_WATCHED_KEY",
    "GET_ALL_CONFIGS",
    "SAVE_CONFIG",
    "LOAD_CONFIG",
    "DELETE_CONFIG",
    "GET_CURRENT_TAB_URL",
];

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    GetStorageData {
        #[serde(default)]
        items: Option<Value>,
        #[serde(default)]
        keys: Option<Value>,
    },
    SetStorageData {
        #[serde(default)]
        data: StorageData,
    },
    GetWatchedKeys,
    AddWatchedKey {
        key: String,
        #[serde(default, rename = "storageType")]
        storage_type: StorageType,
    },
    RemoveWatchedKey {
        key: String,
    },
    GetAllConfigs,
    SaveConfig {
        name: String,
        #[serde(default)]
        data: StorageData,
    },
    LoadConfig {
        #[serde(rename = "configId")]
        config_id: String,
    },
    DeleteConfig {
        #[serde(rename = "configId")]
        config_id: String,
    },
    GetCurrentTabUrl,
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GetStorageData { .. } => "GET_STORAGE_DATA",
            Self::SetStorageData { .. } => "SET_STORAGE_DATA",
            Self::GetWatchedKeys => "GET_WATCHED_KEYS",
            Self::AddWatchedKey { .. } => "ADD_WATCHED_KEY",
            Self::RemoveWatchedKey { .. } => "REMOVE_WATCHED_KEY",
            Self::GetAllConfigs => "GET_ALL_CONFIGS",
            Self::SaveConfig { .. } => "SAVE_CONFIG",
            Self::LoadConfig { .. } => "LOAD_CONFIG",
            Self::DeleteConfig { .. } => "DELETE_CONFIG",
            Self::GetCurrentTabUrl => "GET_CURRENT_TAB_URL",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

#[derive(Clone)]
pub struct MessageRouter {
    store: DomainStore,
    bridge: PageBridge,
    tabs: Arc<dyn TabResolver>,
    channels: Arc<ChannelRegistry>,
}

impl MessageRouter {
    pub fn new(
        store: DomainStore,
        bridge: PageBridge,
        tabs: Arc<dyn TabResolver>,
        channels: Arc<ChannelRegistry>,
    ) -> Self {
        Self {
            store,
            bridge,
            tabs,
            channels,
        }
    }

    /// Wire a router from configuration and the host's browser seams.
    pub fn from_config(
        config: &Config,
        kv: Arc<dyn KeyValueStore>,
        tabs: Arc<dyn TabResolver>,
        transport: Arc<dyn PageTransport>,
        injector: Arc<dyn ScriptInjector>,
    ) -> Self {
        Self::new(
            DomainStore::new(kv),
            PageBridge::new(transport, injector, config.content_script.clone()),
            tabs,
            Arc::new(ChannelRegistry::new(config.sidepanel_port.clone())),
        )
    }

    pub fn store(&self) -> &DomainStore {
        &self.store
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    /// `None` when the message type is not recognized; no reply is owed then.
    pub fn route(&self, message: &Value, sender: MessageSender) -> Option<BoxFuture<'static, Value>> {
        let request_type = message.get("type").and_then(Value::as_str)?;
        if !REQUEST_TYPES.contains(&request_type) {
            debug!(request_type, "ignoring unrecognized message");
            return None;
        }
        let request_type = request_type.to_string();
        let decoded = serde_json::from_value::<Request>(message.clone());
        let router = self.clone();
        Some(
            async move {
                match decoded {
                    Ok(request) => router.dispatch(request, &sender).await,
                    Err(decode_error) => {
                        let error = RouteError::from(decode_error);
                        error!(request_type = %request_type, %error, "request rejected");
                        failure(&error)
                    }
                }
            }
            .boxed(),
        )
    }

    pub async fn handle(&self, message: &Value, sender: MessageSender) -> Option<Value> {
        Some(self.route(message, sender)?.await)
    }

    pub async fn dispatch(&self, request: Request, sender: &MessageSender) -> Value {
        let request_type = request.kind();
        debug!(request_type, "dispatching request");
        let outcome = match request {
            Request::GetStorageData { items, keys } => {
                self.get_storage_data(items.as_ref(), keys.as_ref(), sender)
                    .await
            }
            Request::SetStorageData { data } => self.set_storage_data(data, sender).await,
            Request::GetWatchedKeys => self.get_watched_keys(sender).await,
            Request::AddWatchedKey { key, storage_type } => {
                self.add_watched_key(&key, storage_type, sender).await
            }
            Request::RemoveWatchedKey { key } => self.remove_watched_key(&key, sender).await,
            Request::GetAllConfigs => self.get_all_configs(sender).await,
            Request::SaveConfig { name, data } => self.save_config(&name, data, sender).await,
            Request::LoadConfig { config_id } => self.load_config(&config_id, sender).await,
            Request::DeleteConfig { config_id } => self.delete_config(&config_id, sender).await,
            Request::GetCurrentTabUrl => Ok(self.current_tab_url(sender).await),
        };
        outcome.unwrap_or_else(|error| {
            error!(request_type, %error, "request failed");
            failure(&error)
        })
    }

    /// Register a side panel connecting on `port_name`.
    pub async fn connect(
        &self,
        port_name: &str,
        channel: Arc<dyn NotificationChannel>,
    ) -> Option<ChannelId> {
        self.channels.connect(port_name, channel).await
    }

    pub async fn disconnect(&self, id: ChannelId) -> bool {
        self.channels.disconnect(id).await
    }

    /// Tell every open side panel the active tab changed.
    pub async fn on_tab_activated(&self) -> usize {
        self.channels.broadcast(&Notification::TabActivated).await
    }

    async fn get_storage_data(
        &self,
        items: Option<&Value>,
        keys: Option<&Value>,
        sender: &MessageSender,
    ) -> Result<Value, RouteError> {
        let items = normalize_storage_items(items, keys);
        let tab_id = resolve_tab_id(self.tabs.as_ref(), sender).await;
        let data = self.bridge.read_from_page(tab_id, &items).await?;
        Ok(json!({ "success": true, "data": data }))
    }

    async fn set_storage_data(
        &self,
        data: StorageData,
        sender: &MessageSender,
    ) -> Result<Value, RouteError> {
        let tab_id = resolve_tab_id(self.tabs.as_ref(), sender).await;
        let report = self.bridge.write_to_page(tab_id, data).await?;
        Ok(json!({ "success": true, "data": report }))
    }

    async fn get_watched_keys(&self, sender: &MessageSender) -> Result<Value, RouteError> {
        let domain = self.domain(sender).await;
        let watched = self.store.get_watched_keys(&domain).await?;
        Ok(json!({ "success": true, "keys": watched.items }))
    }

    async fn add_watched_key(
        &self,
        key: &str,
        storage_type: StorageType,
        sender: &MessageSender,
    ) -> Result<Value, RouteError> {
        let domain = self.domain(sender).await;
        self.store.add_watched_key(&domain, key, storage_type).await?;
        Ok(json!({ "success": true }))
    }

    async fn remove_watched_key(
        &self,
        key: &str,
        sender: &MessageSender,
    ) -> Result<Value, RouteError> {
        let domain = self.domain(sender).await;
        self.store.remove_watched_key(&domain, key).await?;
        Ok(json!({ "success": true }))
    }

    async fn get_all_configs(&self, sender: &MessageSender) -> Result<Value, RouteError> {
        let domain = self.domain(sender).await;
        let configs = self.store.get_all_configs(&domain).await?;
        Ok(json!({ "success": true, "configs": configs }))
    }

    async fn save_config(
        &self,
        name: &str,
        data: StorageData,
        sender: &MessageSender,
    ) -> Result<Value, RouteError> {
        let domain = self.domain(sender).await;
        let config_id = self.store.save_config(&domain, name, data).await?;
        Ok(json!({ "success": true, "configId": config_id }))
    }

    async fn load_config(
        &self,
        config_id: &str,
        sender: &MessageSender,
    ) -> Result<Value, RouteError> {
        let domain = self.domain(sender).await;
        let data = self.store.load_config(&domain, config_id).await?;
        Ok(json!({ "success": true, "data": data }))
    }

    async fn delete_config(
        &self,
        config_id: &str,
        sender: &MessageSender,
    ) -> Result<Value, RouteError> {
        let domain = self.domain(sender).await;
        self.store.delete_config(&domain, config_id).await?;
        Ok(json!({ "success": true }))
    }

    async fn current_tab_url(&self, sender: &MessageSender) -> Value {
        let resolved = match resolve_tab_id(self.tabs.as_ref(), sender).await {
            Some(tab_id) => tab_url(self.tabs.as_ref(), tab_id).await,
            None => None,
        };
        match resolved {
            Some((url, hostname)) => json!({ "success": true, "url": url, "hostname": hostname }),
            None => json!({ "success": false, "url": "", "hostname": "" }),
        }
    }

    async fn domain(&self, sender: &MessageSender) -> String {
        resolve_domain(self.tabs.as_ref(), sender).await
    }
}

fn failure(error: &RouteError) -> Value {
    json!({ "success": false, "error": error.to_string() })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::kv;
    use crate::page::InProcessPages;
    use crate::tabs::InMemoryTabs;

    async fn router() -> (MessageRouter, Arc<InMemoryTabs>) {
        let tabs = Arc::new(InMemoryTabs::new());
        let pages = Arc::new(InProcessPages::new());
        let router = MessageRouter::from_config(
            &Config::for_tests(),
            kv::memory(),
            tabs.clone(),
            pages.clone(),
            pages,
        );
        (router, tabs)
    }

    #[test]
    fn requests_decode_with_wire_field_names() {
        let request: Request = serde_json::from_value(json!({
            "type": "ADD_WATCHED_KEY",
            "key": "token",
            "storageType": "sessionStorage",
        }))
        .expect("decode");
        assert_eq!(
            request,
            Request::AddWatchedKey {
                key: "token".to_string(),
                storage_type: StorageType::Session,
            }
        );

        let request: Request =
            serde_json::from_value(json!({"type": "LOAD_CONFIG", "configId": "config_1"}))
                .expect("decode");
        assert_eq!(request.kind(), "LOAD_CONFIG");
    }

    #[tokio::test]
    async fn unrecognized_types_get_no_reply() {
        let (router, _) = router().await;
        assert!(router.route(&json!({"type": "PING"}), MessageSender::side_panel()).is_none());
        assert!(router.route(&json!({"key": "x"}), MessageSender::side_panel()).is_none());
    }

    #[tokio::test]
    async fn malformed_requests_get_a_failure_envelope() {
        let (router, _) = router().await;
        let reply = router
            .handle(&json!({"type": "REMOVE_WATCHED_KEY"}), MessageSender::side_panel())
            .await
            .expect("reply");
        assert_eq!(reply["success"], json!(false));
        assert!(reply["error"].as_str().is_some_and(|error| error.contains("key")));
    }

    #[tokio::test]
    async fn current_tab_url_reports_failure_without_a_tab() {
        let (router, tabs) = router().await;
        let reply = router
            .handle(&json!({"type": "GET_CURRENT_TAB_URL"}), MessageSender::side_panel())
            .await
            .expect("reply");
        assert_eq!(reply, json!({"success": false, "url": "", "hostname": ""}));

        tabs.open(4, "https://docs.example.org/guide").await;
        tabs.activate(4).await;
        let reply = router
            .handle(&json!({"type": "GET_CURRENT_TAB_URL"}), MessageSender::side_panel())
            .await
            .expect("reply");
        assert_eq!(
            reply,
            json!({
                "success": true,
                "url": "https://docs.example.org/guide",
                "hostname": "docs.example.org",
            })
        );
    }
}
