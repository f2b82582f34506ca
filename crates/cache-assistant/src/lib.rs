//! Storage inspector core for a browser side panel.
//!
//! The side panel talks to [`router::MessageRouter`], which keeps per-site
//! watched keys and saved snapshots in a [`store::DomainStore`] and relays
//! storage reads and writes into the page through a [`bridge::PageBridge`].
//! Browser facilities (tabs, page messaging, script injection, persistent
//! storage) sit behind traits so hosts and tests can supply their own.

#![forbid(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod bridge;
pub mod channels;
pub mod config;
pub mod format;
pub mod kv;
pub mod migration;
pub mod normalize;
pub mod page;
pub mod router;
pub mod store;
pub mod tabs;
pub mod types;
pub mod ui_state;

pub use bridge::{BridgeError, PageBridge, PageTransport, ScriptInjector, TransportError};
pub use channels::{ChannelRegistry, Notification, NotificationChannel};
pub use config::{Config, ConfigError};
pub use kv::{KeyValueStore, KvError};
pub use page::{InProcessPages, PageResponder};
pub use router::{MessageRouter, Request};
pub use store::{DomainStore, StoreError};
pub use tabs::{InMemoryTabs, MessageSender, TabResolver};
pub use types::{Provenance, StorageConfig, StorageData, StorageType, WatchedKeyItem};
