//! Transport facade.
//!
//! Every capability the client needs goes through [`Facade`], which delegates
//! to one [`Backend`] chosen at startup and applies the fallback policy:
//! read-style calls degrade to an empty/default value, write-style calls
//! propagate a [`SyncError`].

pub mod http;
pub mod native;
pub mod upload;

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

use crate::config::{SyncConfig, TransportKind};
use crate::error::{SyncError, SyncResult};
use crate::events::{EventChannel, EventHandler, Subscription};
use crate::models::{FileHandle, Message, Peer, Settings, ThemeInfo, UploadReceipt};

pub use http::HttpBackend;
pub use native::{BridgeError, HostBridge, NativeBackend};

pub type ByteStream = Pin<Box<dyn Stream<Item = SyncResult<Bytes>> + Send>>;

/// Longest display name the hosts accept.
pub const MAX_NAME_LEN: usize = 50;
/// Shown in place of the local name when no backend answers.
pub const NAME_UNAVAILABLE: &str = "(unavailable)";
/// Used when neither the backend nor the platform yields a download folder.
pub const FALLBACK_DOWNLOAD_PATH: &str = "/tmp/lanchat";

/// Journal entry written before bytes leave the machine so an interrupted
/// upload stays observable in history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadIntent {
    pub receiver_id: String,
    pub file_name: String,
    pub timestamp: i64,
}

/// One implementation per backend. Implementations return raw results and map
/// their own failures into [`SyncError`]; fallback policy lives in [`Facade`].
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    async fn identity_name(&self) -> SyncResult<String>;
    async fn identity_id(&self) -> SyncResult<String>;
    async fn update_identity_name(&self, name: &str) -> SyncResult<String>;

    async fn settings(&self) -> SyncResult<Settings>;
    async fn update_settings(&self, download_path: &str) -> SyncResult<()>;
    async fn default_download_path(&self) -> SyncResult<String>;

    async fn list_peers(&self) -> SyncResult<Vec<Peer>>;

    async fn send_message(&self, peer_id: &str, peer_addr: &str, content: &str) -> SyncResult<()>;
    async fn history(&self, peer_id: &str) -> SyncResult<Vec<Message>>;

    async fn send_file(
        &self,
        peer_id: &str,
        peer_addr: &str,
        file: FileHandle,
    ) -> SyncResult<UploadReceipt>;
    /// `Err(SyncError::Busy)` while the host is still receiving the file.
    async fn accept_file(&self, file_id: &str, save_path: Option<&str>) -> SyncResult<()>;
    async fn download_file(&self, file_id: &str) -> SyncResult<ByteStream>;

    async fn list_themes(&self) -> SyncResult<Vec<ThemeInfo>>;
    async fn theme_css(&self, name: &str) -> SyncResult<String>;
    async fn save_current_theme(&self, name: &str) -> SyncResult<()>;
    async fn current_theme(&self) -> SyncResult<String>;

    /// Upload journal. Hosts that keep their own journal leave these as no-ops.
    async fn create_upload_record(&self, _intent: &UploadIntent) -> SyncResult<()> {
        Ok(())
    }

    async fn update_upload_status(&self, _intent: &UploadIntent, _status: &str) -> SyncResult<()> {
        Ok(())
    }

    async fn delete_upload_record(&self, _intent: &UploadIntent) -> SyncResult<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct Facade {
    backend: Arc<dyn Backend>,
    events: EventChannel,
}

impl Facade {
    pub fn new(backend: Arc<dyn Backend>, events: EventChannel) -> Self {
        Self { backend, events }
    }

    /// HTTP transport: polling only, inert event channel.
    pub fn http(config: &SyncConfig) -> SyncResult<Self> {
        let backend = HttpBackend::new(&config.server_url, config.request_timeout)?;
        Ok(Self::new(Arc::new(backend), EventChannel::inert()))
    }

    /// Native transport: commands and push events both go through `bridge`.
    pub fn native(bridge: Arc<dyn HostBridge>, config: &SyncConfig) -> SyncResult<Self> {
        let backend = NativeBackend::new(bridge.clone(), config.request_timeout)?;
        Ok(Self::new(Arc::new(backend), EventChannel::native(bridge)))
    }

    /// Picks the backend named by `config.transport`. The native transport
    /// needs the host's bridge.
    pub fn from_config(
        config: &SyncConfig,
        bridge: Option<Arc<dyn HostBridge>>,
    ) -> SyncResult<Self> {
        match (config.transport, bridge) {
            (TransportKind::Http, _) => Self::http(config),
            (TransportKind::Native, Some(bridge)) => Self::native(bridge, config),
            (TransportKind::Native, None) => Err(SyncError::Unreachable(
                "native transport selected but no host bridge is available".into(),
            )),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.backend.kind()
    }

    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    pub fn subscribe(&self, event: &str, handler: EventHandler) -> Subscription {
        self.events.subscribe(event, handler)
    }

    pub async fn identity_name(&self) -> String {
        match self.backend.identity_name().await {
            Ok(name) => name,
            Err(err) => {
                tracing::warn!(error = %err, "failed to load local name");
                NAME_UNAVAILABLE.to_string()
            }
        }
    }

    /// No fallback: uploads need a real sender id.
    pub async fn identity_id(&self) -> SyncResult<String> {
        self.backend.identity_id().await.inspect_err(|err| {
            tracing::error!(error = %err, "failed to load local id");
        })
    }

    pub async fn update_identity_name(&self, new_name: &str) -> SyncResult<String> {
        let name = validate_name(new_name)?;
        let updated = self.backend.update_identity_name(&name).await?;
        tracing::info!(name = %updated, "local name updated");
        Ok(updated)
    }

    pub async fn settings(&self) -> SyncResult<Settings> {
        self.backend.settings().await
    }

    pub async fn update_settings(&self, download_path: &str) -> SyncResult<()> {
        self.backend.update_settings(download_path).await?;
        tracing::info!(download_path, "settings saved");
        Ok(())
    }

    pub async fn default_download_path(&self) -> String {
        match self.backend.default_download_path().await {
            Ok(path) => path,
            Err(err) => {
                tracing::warn!(error = %err, "failed to load default download path");
                platform_download_path()
            }
        }
    }

    /// Roster snapshot, empty on failure.
    pub async fn list_peers(&self) -> Vec<Peer> {
        self.try_list_peers().await.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to load peers");
            Vec::new()
        })
    }

    /// Roster snapshot that keeps failures distinguishable from an empty
    /// roster. Removal decisions must only be made on `Ok`.
    pub async fn try_list_peers(&self) -> SyncResult<Vec<Peer>> {
        self.backend.list_peers().await
    }

    pub async fn send_message(
        &self,
        peer_id: &str,
        peer_addr: &str,
        content: &str,
    ) -> SyncResult<()> {
        self.backend
            .send_message(peer_id, peer_addr, content)
            .await
            .inspect_err(|err| tracing::warn!(peer_id, error = %err, "failed to send message"))
    }

    /// Conversation history in ascending timestamp order, empty on failure.
    pub async fn history(&self, peer_id: &str) -> Vec<Message> {
        self.try_history(peer_id).await.unwrap_or_else(|err| {
            tracing::warn!(peer_id, error = %err, "failed to load history");
            Vec::new()
        })
    }

    pub async fn try_history(&self, peer_id: &str) -> SyncResult<Vec<Message>> {
        self.backend.history(peer_id).await
    }

    pub async fn send_file(
        &self,
        peer_id: &str,
        peer_addr: &str,
        file: FileHandle,
    ) -> SyncResult<UploadReceipt> {
        let name = file.display_name();
        let receipt = self.backend.send_file(peer_id, peer_addr, file).await?;
        tracing::info!(peer_id, file = %name, file_id = %receipt.file_id, "file sent");
        Ok(receipt)
    }

    pub async fn accept_file(&self, file_id: &str, save_path: Option<&str>) -> SyncResult<()> {
        self.backend.accept_file(file_id, save_path).await
    }

    pub async fn download_file(&self, file_id: &str) -> SyncResult<ByteStream> {
        self.backend.download_file(file_id).await
    }

    /// Streams `file_id` into `dest` on a background task. The caller may
    /// drop the handle; failures are logged either way.
    pub fn save_download(&self, file_id: &str, dest: PathBuf) -> JoinHandle<SyncResult<u64>> {
        let facade = self.clone();
        let file_id = file_id.to_string();
        tokio::spawn(async move {
            let result = facade.write_download(&file_id, &dest).await;
            match &result {
                Ok(bytes) => {
                    tracing::info!(
                        file_id = %file_id,
                        dest = %dest.display(),
                        bytes,
                        "download saved"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        file_id = %file_id,
                        dest = %dest.display(),
                        error = %err,
                        "download failed"
                    );
                }
            }
            result
        })
    }

    async fn write_download(&self, file_id: &str, dest: &PathBuf) -> SyncResult<u64> {
        let mut stream = self.download_file(file_id).await?;
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|err| {
                SyncError::rejected(format!("cannot create {}: {err}", dest.display()))
            })?;
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|err| SyncError::rejected(format!("write failed: {err}")))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|err| SyncError::rejected(format!("write failed: {err}")))?;
        Ok(written)
    }

    pub async fn list_themes(&self) -> SyncResult<Vec<ThemeInfo>> {
        self.backend.list_themes().await
    }

    pub async fn theme_css(&self, name: &str) -> SyncResult<String> {
        self.backend.theme_css(name).await
    }

    pub async fn save_current_theme(&self, name: &str) -> SyncResult<()> {
        self.backend.save_current_theme(name).await
    }

    pub async fn current_theme(&self) -> SyncResult<String> {
        self.backend.current_theme().await
    }

    pub async fn create_upload_record(&self, intent: &UploadIntent) -> SyncResult<()> {
        self.backend.create_upload_record(intent).await
    }

    pub async fn update_upload_status(
        &self,
        intent: &UploadIntent,
        status: &str,
    ) -> SyncResult<()> {
        self.backend.update_upload_status(intent, status).await
    }

    pub async fn delete_upload_record(&self, intent: &UploadIntent) -> SyncResult<()> {
        self.backend.delete_upload_record(intent).await
    }
}

/// Trims and checks a display name before it is sent anywhere.
pub fn validate_name(raw: &str) -> SyncResult<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(SyncError::rejected("name may not be empty"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(SyncError::rejected(format!(
            "name too long (at most {MAX_NAME_LEN} characters)"
        )));
    }
    Ok(name.to_string())
}

fn platform_download_path() -> String {
    dirs::download_dir()
        .map(|dir| dir.join("LANChat").display().to_string())
        .unwrap_or_else(|| FALLBACK_DOWNLOAD_PATH.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;

    fn facade(backend: Arc<ScriptedBackend>) -> Facade {
        Facade::new(backend, EventChannel::inert())
    }

    #[test]
    fn name_validation_trims_and_bounds() {
        assert_eq!(validate_name("  neo  ").unwrap(), "neo");
        assert!(matches!(validate_name("   "), Err(SyncError::Rejected(_))));
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN)).is_ok());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
        // characters, not bytes
        assert!(validate_name(&"名".repeat(MAX_NAME_LEN)).is_ok());
    }

    #[tokio::test]
    async fn invalid_name_never_reaches_backend() {
        let backend = Arc::new(ScriptedBackend::default());
        let result = facade(backend.clone()).update_identity_name("").await;
        assert!(matches!(result, Err(SyncError::Rejected(_))));
        assert_eq!(backend.call_count("update_identity_name"), 0);
    }

    #[tokio::test]
    async fn read_calls_degrade_on_failure() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.set_offline(true);
        let facade = facade(backend);
        assert!(facade.list_peers().await.is_empty());
        assert!(facade.history("p1").await.is_empty());
        assert_eq!(facade.identity_name().await, NAME_UNAVAILABLE);
        assert!(!facade.default_download_path().await.is_empty());
    }

    #[tokio::test]
    async fn write_and_identity_calls_propagate() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.set_offline(true);
        let facade = facade(backend);
        assert!(matches!(facade.identity_id().await, Err(SyncError::Unreachable(_))));
        assert!(matches!(
            facade.send_message("p1", "10.0.0.2:9000", "hi").await,
            Err(SyncError::Unreachable(_))
        ));
        assert!(facade.try_list_peers().await.is_err());
    }

    #[tokio::test]
    async fn save_download_streams_to_disk() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.set_download("f1", b"hello bytes".to_vec());
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let written = facade(backend)
            .save_download("f1", dest.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(written, 11);
        assert_eq!(std::fs::read(dest).unwrap(), b"hello bytes");
    }
}
