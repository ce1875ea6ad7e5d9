//! Backend for the native build, where the host process sits behind an
//! in-process command/event bridge.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::TransportKind;
use crate::error::{SyncError, SyncResult};
use crate::events::EventHandler;
use crate::models::{
    content_uri_file_name, FileHandle, Message, Peer, Settings, ThemeInfo, UploadReceipt,
};

use super::http::decode_history;
use super::upload::{upload_to_peer, FileUpload};
use super::{Backend, ByteStream};

/// Releases a listener registered with [`HostBridge::listen`].
pub type Unlisten = Box<dyn FnOnce() + Send>;

/// Error messages the host uses while a file is still arriving. Older hosts
/// signal busy only through these phrases.
const BUSY_PHRASES: [&str; 3] = ["still downloading", "transfer in progress", "正在下载"];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    /// The bridge itself is not there (host not started, IPC torn down).
    #[error("host bridge unavailable: {0}")]
    Unavailable(String),
    /// The host ran the command and reported an error.
    #[error("{0}")]
    Command(String),
}

impl From<BridgeError> for SyncError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Unavailable(reason) => SyncError::Unreachable(reason),
            BridgeError::Command(message) => SyncError::Rejected(message),
        }
    }
}

/// Bytes plus the name the host reports for them, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeFile {
    pub data: Bytes,
    pub name: Option<String>,
}

/// What the client needs from the host process.
#[async_trait]
pub trait HostBridge: Send + Sync + 'static {
    async fn invoke(&self, command: &str, args: Value) -> Result<Value, BridgeError>;

    fn listen(&self, event: &str, handler: EventHandler) -> Unlisten;

    /// Capability-scoped read of a path or platform handle.
    async fn read_file(&self, handle: &str) -> Result<BridgeFile, BridgeError>;
}

pub fn is_busy_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    BUSY_PHRASES.iter().any(|phrase| lowered.contains(phrase))
}

pub struct NativeBackend {
    bridge: Arc<dyn HostBridge>,
    // Content URIs fall back to a direct peer upload.
    client: Client,
}

impl NativeBackend {
    pub fn new(bridge: Arc<dyn HostBridge>, timeout: Duration) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::Unreachable(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { bridge, client })
    }

    async fn call<T: DeserializeOwned>(&self, command: &str, args: Value) -> SyncResult<T> {
        let value = self.bridge.invoke(command, args).await?;
        serde_json::from_value(value).map_err(|err| {
            SyncError::Malformed(format!("{command} returned an unexpected shape: {err}"))
        })
    }

    async fn ack(&self, command: &str, args: Value) -> SyncResult<()> {
        self.bridge.invoke(command, args).await?;
        Ok(())
    }

    async fn upload_bytes(
        &self,
        peer_id: &str,
        peer_addr: &str,
        upload: FileUpload,
    ) -> SyncResult<UploadReceipt> {
        let sender_id = self.identity_id().await?;
        tracing::debug!(
            peer_id,
            file = %upload.file_name,
            "native host cannot send this handle, uploading directly"
        );
        upload_to_peer(&self.client, peer_addr, &sender_id, upload).await
    }
}

#[async_trait]
impl Backend for NativeBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::Native
    }

    async fn identity_name(&self) -> SyncResult<String> {
        self.call("get_my_name", Value::Null).await
    }

    async fn identity_id(&self) -> SyncResult<String> {
        self.call("get_my_id", Value::Null).await
    }

    async fn update_identity_name(&self, name: &str) -> SyncResult<String> {
        let value = self
            .bridge
            .invoke("update_my_name", json!({ "newName": name }))
            .await?;
        Ok(value.as_str().map(str::to_string).unwrap_or_else(|| name.to_string()))
    }

    async fn settings(&self) -> SyncResult<Settings> {
        self.call("get_settings", Value::Null).await
    }

    async fn update_settings(&self, download_path: &str) -> SyncResult<()> {
        self.ack("update_settings", json!({ "downloadPath": download_path }))
            .await
    }

    async fn default_download_path(&self) -> SyncResult<String> {
        self.call("get_default_download_path", Value::Null).await
    }

    async fn list_peers(&self) -> SyncResult<Vec<Peer>> {
        let peers: Option<Vec<Peer>> = self.call("get_peers", Value::Null).await?;
        Ok(peers.unwrap_or_default())
    }

    async fn send_message(&self, peer_id: &str, peer_addr: &str, content: &str) -> SyncResult<()> {
        self.ack(
            "send_message",
            json!({ "peerId": peer_id, "peerAddr": peer_addr, "content": content }),
        )
        .await
    }

    async fn history(&self, peer_id: &str) -> SyncResult<Vec<Message>> {
        let value = self
            .bridge
            .invoke("get_chat_history", json!({ "peerId": peer_id }))
            .await?;
        decode_history(value)
    }

    async fn send_file(
        &self,
        peer_id: &str,
        peer_addr: &str,
        file: FileHandle,
    ) -> SyncResult<UploadReceipt> {
        match file {
            FileHandle::Path(path) => {
                let file_name = FileHandle::Path(path.clone()).display_name();
                let value = self
                    .bridge
                    .invoke(
                        "send_file",
                        json!({
                            "peerId": peer_id,
                            "peerAddr": peer_addr,
                            "filePath": path.display().to_string(),
                        }),
                    )
                    .await?;
                receipt_from(value, file_name)
            }
            FileHandle::ContentUri(uri) => {
                let read = self.bridge.read_file(&uri).await?;
                let file_name = read
                    .name
                    .filter(|name| !name.trim().is_empty())
                    .unwrap_or_else(|| content_uri_file_name(&uri));
                let upload = FileUpload {
                    file_name,
                    data: read.data,
                };
                self.upload_bytes(peer_id, peer_addr, upload).await
            }
            bytes @ FileHandle::Bytes { .. } => {
                let upload = FileUpload::from_handle(bytes).await?;
                self.upload_bytes(peer_id, peer_addr, upload).await
            }
        }
    }

    async fn accept_file(&self, file_id: &str, save_path: Option<&str>) -> SyncResult<()> {
        let mut args = json!({ "fileId": file_id });
        if let Some(path) = save_path {
            args["savePath"] = Value::String(path.to_string());
        }
        match self.bridge.invoke("accept_file", args).await {
            Ok(_) => Ok(()),
            Err(BridgeError::Command(message)) if is_busy_message(&message) => {
                tracing::debug!(file_id, message = %message, "host reports file still arriving");
                Err(SyncError::Busy)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn download_file(&self, file_id: &str) -> SyncResult<ByteStream> {
        let path: String = self.call("get_file_path", json!({ "fileId": file_id })).await?;
        let read = self.bridge.read_file(&path).await?;
        let chunks: Vec<SyncResult<Bytes>> = vec![Ok(read.data)];
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    async fn list_themes(&self) -> SyncResult<Vec<ThemeInfo>> {
        self.call("get_theme_list", Value::Null).await
    }

    async fn theme_css(&self, name: &str) -> SyncResult<String> {
        self.call("get_theme_css", json!({ "themeName": name })).await
    }

    async fn save_current_theme(&self, name: &str) -> SyncResult<()> {
        self.ack("save_current_theme", json!({ "themeName": name }))
            .await
    }

    async fn current_theme(&self) -> SyncResult<String> {
        self.call("get_current_theme", Value::Null).await
    }
}

/// Hosts answer `send_file` with either a receipt object or just the new
/// file id.
fn receipt_from(value: Value, file_name: String) -> SyncResult<UploadReceipt> {
    match value {
        Value::String(file_id) => Ok(UploadReceipt {
            file_id,
            file_name,
            file_size: 0,
        }),
        other => {
            let mut receipt: UploadReceipt = serde_json::from_value(other).map_err(|err| {
                SyncError::Malformed(format!("unreadable send_file reply: {err}"))
            })?;
            if receipt.file_name.is_empty() {
                receipt.file_name = file_name;
            }
            Ok(receipt)
        }
    }
}
