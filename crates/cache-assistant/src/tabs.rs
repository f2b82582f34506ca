//! Active-tab resolution and hostname derivation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

use crate::types::TabId;

#[derive(Debug, thiserror::Error)]
pub enum TabError {
    #[error("tab query failed: {0}")]
    Query(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: TabId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderTab {
    #[serde(default)]
    pub id: Option<TabId>,
}

/// Origin of an inbound message. Side-panel messages carry no tab.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSender {
    #[serde(default)]
    pub tab: Option<SenderTab>,
}

impl MessageSender {
    pub fn side_panel() -> Self {
        Self::default()
    }

    pub fn from_tab(id: TabId) -> Self {
        Self {
            tab: Some(SenderTab { id: Some(id) }),
        }
    }

    fn attached_tab_id(&self) -> Option<TabId> {
        self.tab
            .as_ref()
            .and_then(|tab| tab.id)
            .filter(|id| *id > 0)
    }
}

#[async_trait]
pub trait TabResolver: Send + Sync {
    /// Active tab of the current window.
    async fn active_tab(&self) -> Result<Option<TabInfo>, TabError>;

    async fn get_tab(&self, tab_id: TabId) -> Result<Option<TabInfo>, TabError>;
}

/// Prefer the tab attached to the sender, else the active tab of the current window.
pub async fn resolve_tab_id(tabs: &dyn TabResolver, sender: &MessageSender) -> Option<TabId> {
    if let Some(id) = sender.attached_tab_id() {
        return Some(id);
    }
    match tabs.active_tab().await {
        Ok(tab) => tab.map(|tab| tab.id),
        Err(error) => {
            debug!(%error, "active tab query failed");
            None
        }
    }
}

/// Tab URL and hostname; `None` when the tab is gone or has no parsable URL.
pub async fn tab_url(tabs: &dyn TabResolver, tab_id: TabId) -> Option<(String, String)> {
    let tab = match tabs.get_tab(tab_id).await {
        Ok(Some(tab)) => tab,
        Ok(None) => return None,
        Err(error) => {
            debug!(tab_id, %error, "tab lookup failed");
            return None;
        }
    };
    let url = tab.url?;
    let hostname = hostname_of(&url)?;
    Some((url, hostname))
}

/// Hostname of the sender's tab, or an empty string when it cannot be resolved.
pub async fn resolve_domain(tabs: &dyn TabResolver, sender: &MessageSender) -> String {
    let Some(tab_id) = resolve_tab_id(tabs, sender).await else {
        return String::new();
    };
    tab_url(tabs, tab_id)
        .await
        .map(|(_, hostname)| hostname)
        .unwrap_or_default()
}

pub fn hostname_of(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    Some(url.host_str().unwrap_or_default().to_string())
}

/// Tab table kept in memory; used by hosts without a browser and by tests.
#[derive(Default)]
pub struct InMemoryTabs {
    state: RwLock<InMemoryTabsState>,
}

#[derive(Default)]
struct InMemoryTabsState {
    tabs: BTreeMap<TabId, TabInfo>,
    active: Option<TabId>,
}

impl InMemoryTabs {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open(&self, id: TabId, url: &str) {
        let mut state = self.state.write().await;
        state.tabs.insert(
            id,
            TabInfo {
                id,
                url: Some(url.to_string()),
            },
        );
    }

    pub async fn activate(&self, id: TabId) {
        self.state.write().await.active = Some(id);
    }

    pub async fn close(&self, id: TabId) {
        let mut state = self.state.write().await;
        state.tabs.remove(&id);
        if state.active == Some(id) {
            state.active = None;
        }
    }
}

#[async_trait]
impl TabResolver for InMemoryTabs {
    async fn active_tab(&self) -> Result<Option<TabInfo>, TabError> {
        let state = self.state.read().await;
        Ok(state.active.and_then(|id| state.tabs.get(&id).cloned()))
    }

    async fn get_tab(&self, tab_id: TabId) -> Result<Option<TabInfo>, TabError> {
        Ok(self.state.read().await.tabs.get(&tab_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_parsing() {
        assert_eq!(
            hostname_of("https://shop.example.com:8443/cart?x=1").as_deref(),
            Some("shop.example.com")
        );
        assert_eq!(hostname_of("file:///tmp/index.html").as_deref(), Some(""));
        assert_eq!(hostname_of("not a url"), None);
    }

    #[tokio::test]
    async fn sender_tab_wins_over_active_tab() {
        let tabs = InMemoryTabs::new();
        tabs.open(1, "https://a.com/").await;
        tabs.open(2, "https://b.com/").await;
        tabs.activate(2).await;

        assert_eq!(resolve_tab_id(&tabs, &MessageSender::from_tab(1)).await, Some(1));
        assert_eq!(resolve_tab_id(&tabs, &MessageSender::side_panel()).await, Some(2));
        assert_eq!(resolve_domain(&tabs, &MessageSender::side_panel()).await, "b.com");
    }

    #[tokio::test]
    async fn missing_tab_degrades_to_empty_domain() {
        let tabs = InMemoryTabs::new();
        assert_eq!(resolve_tab_id(&tabs, &MessageSender::side_panel()).await, None);
        assert_eq!(resolve_domain(&tabs, &MessageSender::side_panel()).await, "");

        tabs.open(3, "chrome://extensions").await;
        tabs.activate(3).await;
        assert_eq!(resolve_domain(&tabs, &MessageSender::side_panel()).await, "extensions");

        tabs.close(3).await;
        assert_eq!(resolve_tab_id(&tabs, &MessageSender::side_panel()).await, None);
    }
}
