//! Long-lived notification channels, one per open side panel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

pub const SIDEPANEL_PORT_NAME: &str = "cache-assistant-sidepanel";

pub type ChannelId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notification {
    TabActivated,
}

#[derive(Debug, thiserror::Error)]
#[error("notification channel closed")]
pub struct ChannelClosed;

pub trait NotificationChannel: Send + Sync {
    fn post(&self, notification: &Notification) -> Result<(), ChannelClosed>;
}

/// Channel backed by an unbounded tokio mpsc sender; closed once the
/// receiver is dropped.
pub struct MpscChannel {
    tx: mpsc::UnboundedSender<Notification>,
}

impl NotificationChannel for MpscChannel {
    fn post(&self, notification: &Notification) -> Result<(), ChannelClosed> {
        self.tx
            .send(notification.clone())
            .map_err(|_| ChannelClosed)
    }
}

pub fn mpsc_channel() -> (Arc<MpscChannel>, mpsc::UnboundedReceiver<Notification>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(MpscChannel { tx }), rx)
}

pub struct ChannelRegistry {
    port_name: String,
    next_id: AtomicU64,
    channels: Mutex<BTreeMap<ChannelId, Arc<dyn NotificationChannel>>>,
}

impl ChannelRegistry {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            next_id: AtomicU64::new(1),
            channels: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a channel connecting under `port_name`; other port names are ignored.
    pub async fn connect(
        &self,
        port_name: &str,
        channel: Arc<dyn NotificationChannel>,
    ) -> Option<ChannelId> {
        if port_name != self.port_name {
            debug!(port_name, "ignoring connection on unrelated port");
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.channels.lock().await.insert(id, channel);
        Some(id)
    }

    pub async fn disconnect(&self, id: ChannelId) -> bool {
        self.channels.lock().await.remove(&id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.channels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Deliver to every channel; a channel that fails is evicted, not retried.
    /// Returns the number of channels that accepted the notification.
    pub async fn broadcast(&self, notification: &Notification) -> usize {
        let mut channels = self.channels.lock().await;
        let mut delivered = 0usize;
        channels.retain(|id, channel| match channel.post(notification) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(error) => {
                debug!(channel_id = id, %error, "evicting closed notification channel");
                false
            }
        });
        delivered
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new(SIDEPANEL_PORT_NAME)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct BrokenChannel;

    impl NotificationChannel for BrokenChannel {
        fn post(&self, _notification: &Notification) -> Result<(), ChannelClosed> {
            Err(ChannelClosed)
        }
    }

    #[test]
    fn notification_wire_shape() {
        assert_eq!(
            serde_json::to_value(Notification::TabActivated).expect("encode"),
            json!({"type": "TAB_ACTIVATED"})
        );
    }

    #[tokio::test]
    async fn broadcast_evicts_failing_channels_and_reaches_the_rest() {
        let registry = ChannelRegistry::default();
        let (first, mut first_rx) = mpsc_channel();
        let (second, second_rx) = mpsc_channel();

        registry.connect(SIDEPANEL_PORT_NAME, first).await.expect("first");
        registry.connect(SIDEPANEL_PORT_NAME, Arc::new(BrokenChannel)).await.expect("broken");
        registry.connect(SIDEPANEL_PORT_NAME, second).await.expect("second");
        drop(second_rx);

        assert_eq!(registry.broadcast(&Notification::TabActivated).await, 1);
        assert_eq!(registry.len().await, 1);
        assert_eq!(first_rx.recv().await, Some(Notification::TabActivated));
    }

    #[tokio::test]
    async fn unrelated_ports_and_disconnects() {
        let registry = ChannelRegistry::default();
        let (channel, _rx) = mpsc_channel();

        assert!(registry.connect("devtools", channel.clone()).await.is_none());
        let id = registry
            .connect(SIDEPANEL_PORT_NAME, channel)
            .await
            .expect("connect");
        assert!(registry.disconnect(id).await);
        assert!(!registry.disconnect(id).await);
        assert!(registry.is_empty().await);
    }
}
