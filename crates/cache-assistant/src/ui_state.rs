//! Last-used side-panel route, restored when the panel reopens.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::kv::KeyValueStore;

pub const LAST_TOOL_KEY: &str = "lastTool";
pub const HOME_ROUTE: &str = "/";

/// Routes of the registered tools; only these are remembered or restored.
pub const TOOL_ROUTES: [&str; 1] = ["/cache-assistant"];

pub fn is_tool_route(path: &str) -> bool {
    TOOL_ROUTES.contains(&path)
}

/// Stored last tool, if it is still a registered route. Read failures yield `None`.
pub async fn get_last_tool(kv: &dyn KeyValueStore) -> Option<String> {
    let mut found = match kv.get(&[LAST_TOOL_KEY]).await {
        Ok(found) => found,
        Err(error) => {
            debug!(%error, "last tool read failed");
            return None;
        }
    };
    match found.remove(LAST_TOOL_KEY) {
        Some(Value::String(path)) if is_tool_route(&path) => Some(path),
        _ => None,
    }
}

/// Write failures are logged and dropped.
pub async fn set_last_tool(kv: &dyn KeyValueStore, path: &str) {
    let mut entries = Map::new();
    entries.insert(LAST_TOOL_KEY.to_string(), Value::String(path.to_string()));
    if let Err(error) = kv.set(entries).await {
        warn!(%error, path, "failed to remember last tool");
    }
}

/// Route to open on first entry: the remembered tool, else home.
pub async fn initial_route(kv: &dyn KeyValueStore) -> String {
    get_last_tool(kv)
        .await
        .unwrap_or_else(|| HOME_ROUTE.to_string())
}

/// Remember `path` when it is a tool route. Returns whether it was recorded.
pub async fn record_navigation(kv: &dyn KeyValueStore, path: &str) -> bool {
    if !is_tool_route(path) {
        return false;
    }
    set_last_tool(kv, path).await;
    true
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::kv;

    #[tokio::test]
    async fn remembers_tool_routes_only() {
        let store = kv::memory();
        assert_eq!(initial_route(store.as_ref()).await, HOME_ROUTE);

        assert!(!record_navigation(store.as_ref(), "/").await);
        assert_eq!(get_last_tool(store.as_ref()).await, None);

        assert!(record_navigation(store.as_ref(), "/cache-assistant").await);
        assert_eq!(initial_route(store.as_ref()).await, "/cache-assistant");
    }

    #[tokio::test]
    async fn stale_or_malformed_values_are_ignored() {
        let store = kv::memory();
        set_last_tool(store.as_ref(), "/removed-tool").await;
        assert_eq!(get_last_tool(store.as_ref()).await, None);

        let mut entries = Map::new();
        entries.insert(LAST_TOOL_KEY.to_string(), json!(42));
        store.set(entries).await.expect("seed");
        assert_eq!(initial_route(store.as_ref()).await, HOME_ROUTE);
    }

    #[tokio::test]
    async fn write_failures_are_swallowed() {
        let store = kv::memory_with_quota(4);
        set_last_tool(store.as_ref(), "/cache-assistant").await;
        assert_eq!(get_last_tool(store.as_ref()).await, None);
    }
}
