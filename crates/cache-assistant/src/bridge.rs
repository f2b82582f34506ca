//! Relay between the extension context and a tab's page context.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::page::PageRequest;
use crate::types::{StorageData, TabId, WatchedKeyItem};

pub const NO_TAB_MESSAGE: &str = "请先打开要操作的网页标签页";
pub const CONNECTION_REFUSED_MESSAGE: &str = "无法连接页面，请刷新目标网页后重试";

const RECEIVER_MISSING_MARKERS: [&str; 2] = [
    "Receiving end does not exist",
    "Could not establish connection",
];

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// No listener in the target tab.
    #[error("{0}")]
    ReceiverMissing(String),
    #[error("{0}")]
    Failed(String),
}

impl TransportError {
    /// Classify a browser error message.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if RECEIVER_MISSING_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
        {
            Self::ReceiverMissing(message)
        } else {
            Self::Failed(message)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("{}", NO_TAB_MESSAGE)]
    NoTab,
    #[error("{}", CONNECTION_REFUSED_MESSAGE)]
    ConnectionRefused { cause: String },
    #[error("{0}")]
    Failed(String),
}

impl From<TransportError> for BridgeError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::ReceiverMissing(cause) => Self::ConnectionRefused { cause },
            TransportError::Failed(message) => match TransportError::from_message(message) {
                TransportError::ReceiverMissing(cause) => Self::ConnectionRefused { cause },
                TransportError::Failed(message) => Self::Failed(message),
            },
        }
    }
}

#[async_trait]
pub trait PageTransport: Send + Sync {
    async fn send(&self, tab_id: TabId, request: &PageRequest) -> Result<Value, TransportError>;
}

#[async_trait]
pub trait ScriptInjector: Send + Sync {
    /// Install the page-context listener. Injecting twice is harmless.
    async fn inject(&self, tab_id: TabId, script: &str) -> Result<(), TransportError>;
}

#[derive(Clone)]
pub struct PageBridge {
    transport: Arc<dyn PageTransport>,
    injector: Arc<dyn ScriptInjector>,
    content_script: String,
}

impl PageBridge {
    pub fn new(
        transport: Arc<dyn PageTransport>,
        injector: Arc<dyn ScriptInjector>,
        content_script: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            injector,
            content_script: content_script.into(),
        }
    }

    pub async fn read_from_page(
        &self,
        tab_id: Option<TabId>,
        items: &[WatchedKeyItem],
    ) -> Result<StorageData, BridgeError> {
        let tab_id = tab_id.ok_or(BridgeError::NoTab)?;
        let request = PageRequest::GetStorageData {
            items: items.to_vec(),
        };
        match self.send_with_recovery(tab_id, &request).await? {
            Value::Object(data) => Ok(data),
            Value::Null => Ok(StorageData::new()),
            other => Err(BridgeError::Failed(format!(
                "unexpected page response: {other}"
            ))),
        }
    }

    /// Returns the page's per-key write report.
    pub async fn write_to_page(
        &self,
        tab_id: Option<TabId>,
        data: StorageData,
    ) -> Result<Value, BridgeError> {
        let tab_id = tab_id.ok_or(BridgeError::NoTab)?;
        let request = PageRequest::SetStorageData { data };
        self.send_with_recovery(tab_id, &request).await
    }

    /// Send once; on a missing listener inject the content script and retry
    /// exactly once more.
    async fn send_with_recovery(
        &self,
        tab_id: TabId,
        request: &PageRequest,
    ) -> Result<Value, BridgeError> {
        let cause = match self.transport.send(tab_id, request).await {
            Ok(response) => return Ok(response),
            Err(TransportError::ReceiverMissing(cause)) => cause,
            Err(error) => return Err(error.into()),
        };

        debug!(tab_id, %cause, "page listener missing; injecting content script");
        self.injector
            .inject(tab_id, &self.content_script)
            .await
            .map_err(|error| {
                warn!(tab_id, %error, "content script injection failed");
                BridgeError::from(error)
            })?;

        self.transport
            .send(tab_id, request)
            .await
            .map_err(|error| {
                warn!(tab_id, %error, "page still unreachable after injection");
                BridgeError::from(error)
            })
    }
}
