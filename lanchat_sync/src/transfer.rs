//! Outbound sends and the inbound accept loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{AcceptPolicy, TransferConfig, TransportKind};
use crate::conversation::MessageSync;
use crate::error::{SyncError, SyncResult};
use crate::models::{FileHandle, FileMeta, FileStatus, Message, Peer, UploadReceipt, SELF_ID};
use crate::transport::{Facade, UploadIntent};
use crate::updates::{SyncUpdate, UpdateSink};
use crate::utils::now_secs;

/// Status written to the upload journal once the peer has the bytes.
pub const UPLOAD_SENT: &str = "sent";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferUpdate {
    UploadStarted { peer_id: String, file_name: String },
    UploadFinished { peer_id: String, receipt: UploadReceipt },
    UploadFailed { peer_id: String, file_name: String, reason: String },
    /// The host is still receiving the file; the accept can be cancelled.
    AcceptWaiting { file_id: String },
    AcceptFinished { file_id: String },
    AcceptCancelled { file_id: String },
    AcceptFailed { file_id: String, reason: String },
}

/// Modal save-location chooser. `None` means the user dismissed it.
#[async_trait]
pub trait SavePathPicker: Send + Sync {
    async fn pick_save_path(&self, file_name: &str) -> Option<String>;
}

pub struct TransferMachine {
    facade: Facade,
    messages: Arc<MessageSync>,
    updates: UpdateSink,
    config: TransferConfig,
    picker: Option<Arc<dyn SavePathPicker>>,
    active: Mutex<HashMap<String, CancellationToken>>,
    auto_started: Mutex<HashSet<String>>,
    /// Parent of every accept token.
    shutdown: CancellationToken,
    spawned: Mutex<Vec<JoinHandle<()>>>,
}

impl TransferMachine {
    pub fn new(
        facade: Facade,
        messages: Arc<MessageSync>,
        updates: UpdateSink,
        config: TransferConfig,
    ) -> Self {
        Self {
            facade,
            messages,
            updates,
            config,
            picker: None,
            active: Mutex::new(HashMap::new()),
            auto_started: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
            spawned: Mutex::new(Vec::new()),
        }
    }

    pub fn with_picker(mut self, picker: Arc<dyn SavePathPicker>) -> Self {
        self.picker = Some(picker);
        self
    }

    /// Sends `content` to `peer`. Blank input is ignored (`Ok(None)`); the
    /// local copy is appended only once the backend acknowledged it.
    pub async fn send_text(&self, peer: &Peer, content: &str) -> SyncResult<Option<Message>> {
        let content = content.trim();
        if content.is_empty() {
            return Ok(None);
        }
        self.facade
            .send_message(&peer.id, &peer.address, content)
            .await?;
        let message = Message::text(SELF_ID, now_secs(), content);
        self.messages.append_local(&peer.id, message.clone()).await;
        Ok(Some(message))
    }

    /// Uploads `file` to `peer` behind an `uploading` placeholder.
    pub async fn send_file(&self, peer: &Peer, file: FileHandle) -> SyncResult<UploadReceipt> {
        let file_name = file.display_name();
        let timestamp = now_secs();
        let placeholder = Message::file(
            SELF_ID,
            timestamp,
            FileMeta {
                file_id: format!("upload-{}", Uuid::new_v4()),
                file_name: file_name.clone(),
                file_size: file.known_size().unwrap_or(0),
                status: FileStatus::Uploading,
            },
        );
        let key = placeholder.key();
        self.messages.append_local(&peer.id, placeholder).await;
        self.updates.publish(SyncUpdate::Transfer(TransferUpdate::UploadStarted {
            peer_id: peer.id.clone(),
            file_name: file_name.clone(),
        }));

        let intent = UploadIntent {
            receiver_id: peer.id.clone(),
            file_name: file_name.clone(),
            timestamp,
        };
        let result = match self.facade.create_upload_record(&intent).await {
            Ok(()) => self.facade.send_file(&peer.id, &peer.address, file).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(receipt) => {
                if let Err(err) = self.facade.update_upload_status(&intent, UPLOAD_SENT).await {
                    tracing::warn!(
                        file = %file_name,
                        error = %err,
                        "failed to mark upload as sent"
                    );
                }
                self.messages.refresh().await;
                self.messages.resolve_local(&key).await;
                self.updates.publish(SyncUpdate::Transfer(TransferUpdate::UploadFinished {
                    peer_id: peer.id.clone(),
                    receipt: receipt.clone(),
                }));
                Ok(receipt)
            }
            Err(err) => {
                tracing::warn!(
                    peer_id = %peer.id,
                    file = %file_name,
                    error = %err,
                    "upload failed"
                );
                if let Err(cleanup) = self.facade.delete_upload_record(&intent).await {
                    tracing::warn!(
                        file = %file_name,
                        error = %cleanup,
                        "failed to delete upload record"
                    );
                }
                self.messages.resolve_local(&key).await;
                self.messages.refresh().await;
                self.updates.publish(SyncUpdate::Transfer(TransferUpdate::UploadFailed {
                    peer_id: peer.id.clone(),
                    file_name,
                    reason: err.to_string(),
                }));
                Err(err)
            }
        }
    }

    /// Accepts an inbound file, retrying while the host reports it busy.
    ///
    /// Ends on success, on any non-busy error, or with
    /// [`SyncError::UserCancelled`] once [`cancel_accept`](Self::cancel_accept)
    /// is called for `file_id`.
    pub async fn accept_file(&self, file_id: &str, save_path: Option<String>) -> SyncResult<()> {
        let save_path = match save_path {
            Some(path) => Some(path),
            None => self.pick_save_path(file_id).await?,
        };

        let token = {
            let mut active = self.active.lock().await;
            if active.contains_key(file_id) {
                return Err(SyncError::rejected(format!(
                    "already accepting {file_id}"
                )));
            }
            let token = self.shutdown.child_token();
            active.insert(file_id.to_string(), token.clone());
            token
        };

        let result = self.accept_loop(file_id, save_path.as_deref(), &token).await;
        self.active.lock().await.remove(file_id);

        let update = match &result {
            Ok(()) => {
                tracing::info!(file_id, "file accepted");
                self.messages.refresh().await;
                TransferUpdate::AcceptFinished {
                    file_id: file_id.to_string(),
                }
            }
            Err(SyncError::UserCancelled) => {
                tracing::info!(file_id, "accept cancelled by user");
                TransferUpdate::AcceptCancelled {
                    file_id: file_id.to_string(),
                }
            }
            Err(err) => {
                tracing::warn!(file_id, error = %err, "accept failed");
                TransferUpdate::AcceptFailed {
                    file_id: file_id.to_string(),
                    reason: err.to_string(),
                }
            }
        };
        self.updates.publish(SyncUpdate::Transfer(update));
        result
    }

    async fn accept_loop(
        &self,
        file_id: &str,
        save_path: Option<&str>,
        token: &CancellationToken,
    ) -> SyncResult<()> {
        let mut waits = 0u32;
        loop {
            if token.is_cancelled() {
                return Err(SyncError::UserCancelled);
            }
            match self.facade.accept_file(file_id, save_path).await {
                Ok(()) => return Ok(()),
                Err(SyncError::Busy) => {
                    if waits == 0 {
                        self.messages.refresh().await;
                        self.updates.publish(SyncUpdate::Transfer(TransferUpdate::AcceptWaiting {
                            file_id: file_id.to_string(),
                        }));
                    }
                    waits += 1;
                    tracing::debug!(file_id, waits, "file still arriving, retrying");
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(SyncError::UserCancelled),
                        _ = tokio::time::sleep(self.config.accept_backoff) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Stops a running accept loop. Returns false if none was running.
    pub async fn cancel_accept(&self, file_id: &str) -> bool {
        match self.active.lock().await.get(file_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn is_accepting(&self, file_id: &str) -> bool {
        self.active.lock().await.contains_key(file_id)
    }

    /// Cancels every running accept and refuses new ones.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    /// [`cancel_all`](Self::cancel_all), then waits for the accepts started
    /// by [`auto_accept`](Self::auto_accept) to wind down.
    pub async fn stop(&self) {
        self.cancel_all();
        let spawned: Vec<JoinHandle<()>> = self.spawned.lock().await.drain(..).collect();
        for handle in spawned {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "automatic accept ended abnormally");
            }
        }
    }

    /// Under [`AcceptPolicy::Automatic`], starts an accept for every pending
    /// inbound file of the open conversation, at most once per file id.
    pub async fn auto_accept(self: &Arc<Self>) -> usize {
        if self.config.accept_policy != AcceptPolicy::Automatic || self.shutdown.is_cancelled() {
            return 0;
        }
        let pending = self.messages.pending_inbound().await;
        let mut started = 0;
        for meta in pending {
            if !self.auto_started.lock().await.insert(meta.file_id.clone()) {
                continue;
            }
            started += 1;
            tracing::info!(
                file_id = %meta.file_id,
                file = %meta.file_name,
                "accepting file automatically"
            );
            let machine = Arc::clone(self);
            let handle = tokio::spawn(async move {
                // Outcome is published as a TransferUpdate.
                let _ = machine.accept_file(&meta.file_id, None).await;
            });
            let mut spawned = self.spawned.lock().await;
            spawned.retain(|handle| !handle.is_finished());
            spawned.push(handle);
        }
        started
    }

    async fn pick_save_path(&self, file_id: &str) -> SyncResult<Option<String>> {
        let Some(picker) = &self.picker else {
            return Ok(None);
        };
        if self.facade.kind() != TransportKind::Native {
            return Ok(None);
        }
        let file_name = self
            .messages
            .messages()
            .await
            .into_iter()
            .find(|message| message.file_id() == Some(file_id))
            .and_then(|message| message.file.map(|meta| meta.file_name))
            .unwrap_or_else(|| file_id.to_string());
        match picker.pick_save_path(&file_name).await {
            Some(path) => Ok(Some(path)),
            None => Err(SyncError::UserCancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventChannel;
    use crate::testing::{JournalEntry, ScriptedBackend};
    use std::time::Duration;
    use tokio::time::Instant;

    struct Fixture {
        backend: Arc<ScriptedBackend>,
        messages: Arc<MessageSync>,
        machine: Arc<TransferMachine>,
    }

    fn fixture(config: TransferConfig) -> Fixture {
        let backend = Arc::new(ScriptedBackend::default());
        let facade = Facade::new(backend.clone(), EventChannel::inert());
        let messages = Arc::new(MessageSync::new(facade.clone(), UpdateSink::discard()));
        let machine = Arc::new(TransferMachine::new(
            facade,
            messages.clone(),
            UpdateSink::discard(),
            config,
        ));
        Fixture {
            backend,
            messages,
            machine,
        }
    }

    fn alice() -> Peer {
        Peer::new("p1", "alice", "10.0.0.2:8080", true)
    }

    fn pending_file(file_id: &str) -> Message {
        Message::file(
            "p1",
            4,
            FileMeta {
                file_id: file_id.into(),
                file_name: "big.iso".into(),
                file_size: 1 << 30,
                status: FileStatus::Pending,
            },
        )
    }

    #[tokio::test]
    async fn blank_text_is_ignored() {
        let fx = fixture(TransferConfig::default());
        assert_eq!(fx.machine.send_text(&alice(), "   ").await.unwrap(), None);
        assert_eq!(fx.backend.call_count("send_message"), 0);
    }

    #[tokio::test]
    async fn failed_text_appends_nothing() {
        let fx = fixture(TransferConfig::default());
        fx.messages.open(&alice()).await;
        fx.backend
            .queue_error("send_message", SyncError::rejected("peer refused"));
        assert!(fx.machine.send_text(&alice(), "hi").await.is_err());
        assert!(fx.messages.messages().await.is_empty());

        let sent = fx.machine.send_text(&alice(), " hi ").await.unwrap().unwrap();
        assert_eq!(sent.content, "hi");
        assert_eq!(fx.messages.messages().await.len(), 1);
    }

    #[tokio::test]
    async fn upload_journal_is_marked_sent() {
        let fx = fixture(TransferConfig::default());
        fx.messages.open(&alice()).await;
        let file = FileHandle::Bytes {
            name: "notes.txt".into(),
            data: bytes::Bytes::from_static(b"abc"),
        };
        let receipt = fx.machine.send_file(&alice(), file).await.unwrap();
        assert_eq!(receipt.file_name, "notes.txt");

        let journal = fx.backend.journal();
        assert_eq!(journal.len(), 2);
        assert!(matches!(&journal[0], JournalEntry::Created(intent) if intent.receiver_id == "p1"));
        assert!(matches!(&journal[1], JournalEntry::Updated(_, status) if status == UPLOAD_SENT));
        // The placeholder is gone once the upload settled.
        assert!(fx.messages.messages().await.is_empty());
    }

    #[tokio::test]
    async fn failed_upload_deletes_record_and_placeholder() {
        let fx = fixture(TransferConfig::default());
        fx.messages.open(&alice()).await;
        fx.backend
            .queue_error("send_file", SyncError::Unreachable("peer gone".into()));
        let file = FileHandle::Bytes {
            name: "notes.txt".into(),
            data: bytes::Bytes::from_static(b"abc"),
        };
        assert!(fx.machine.send_file(&alice(), file).await.is_err());

        let journal = fx.backend.journal();
        assert!(matches!(journal.last(), Some(JournalEntry::Deleted(_))));
        assert!(fx.messages.messages().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn three_busies_then_success_waits_three_times() {
        let fx = fixture(TransferConfig::default());
        fx.backend.set_history("p1", vec![pending_file("f1")]);
        fx.messages.open(&alice()).await;
        for _ in 0..3 {
            fx.backend.queue_error("accept_file", SyncError::Busy);
        }

        let started = Instant::now();
        fx.machine.accept_file("f1", None).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(6));
        assert_eq!(fx.backend.call_count("accept_file"), 4);
        assert!(!fx.machine.is_accepting("f1").await);
        assert_eq!(
            fx.messages.messages().await[0].file_status(),
            Some(FileStatus::Accepted)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_busy_ends_within_one_interval() {
        let fx = fixture(TransferConfig::default());
        fx.backend.fail_always("accept_file", || SyncError::Busy);

        let machine = fx.machine.clone();
        let accept = tokio::spawn(async move { machine.accept_file("f1", None).await });
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert!(fx.machine.cancel_accept("f1").await);

        let cancelled_at = Instant::now();
        let result = accept.await.unwrap();
        assert!(matches!(result, Err(SyncError::UserCancelled)));
        assert!(cancelled_at.elapsed() < Duration::from_secs(2));
        // No further attempts after cancellation.
        assert_eq!(fx.backend.call_count("accept_file"), 3);
    }

    #[tokio::test]
    async fn non_busy_error_aborts_accept() {
        let fx = fixture(TransferConfig {
            accept_backoff: Duration::from_millis(1),
            ..TransferConfig::default()
        });
        fx.backend.queue_error("accept_file", SyncError::Busy);
        fx.backend
            .queue_error("accept_file", SyncError::rejected("file expired"));
        let result = fx.machine.accept_file("f1", None).await;
        assert!(matches!(result, Err(SyncError::Rejected(message)) if message == "file expired"));
        assert_eq!(fx.backend.call_count("accept_file"), 2);
    }

    #[tokio::test]
    async fn cancel_without_accept_is_noop() {
        let fx = fixture(TransferConfig::default());
        assert!(!fx.machine.cancel_accept("nope").await);
    }

    struct FixedPicker(Option<String>);

    #[async_trait]
    impl SavePathPicker for FixedPicker {
        async fn pick_save_path(&self, _file_name: &str) -> Option<String> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn native_accept_asks_for_save_path() {
        let backend = ScriptedBackend::with_kind(TransportKind::Native);
        let backend = Arc::new(backend);
        let facade = Facade::new(backend.clone(), EventChannel::inert());
        let messages = Arc::new(MessageSync::new(facade.clone(), UpdateSink::discard()));
        let picked = TransferMachine::new(
            facade.clone(),
            messages.clone(),
            UpdateSink::discard(),
            TransferConfig::default(),
        )
        .with_picker(Arc::new(FixedPicker(Some("/sdcard/Download".into()))));
        picked.accept_file("f1", None).await.unwrap();
        assert_eq!(
            backend.accepted(),
            vec![("f1".to_string(), Some("/sdcard/Download".to_string()))]
        );

        let dismissed = TransferMachine::new(
            facade,
            messages,
            UpdateSink::discard(),
            TransferConfig::default(),
        )
        .with_picker(Arc::new(FixedPicker(None)));
        assert!(matches!(
            dismissed.accept_file("f2", None).await,
            Err(SyncError::UserCancelled)
        ));
        assert_eq!(backend.call_count("accept_file"), 1);
    }

    #[tokio::test]
    async fn automatic_policy_accepts_each_file_once() {
        let config = TransferConfig {
            accept_policy: AcceptPolicy::Automatic,
            ..TransferConfig::default()
        };
        let fx = fixture(config);
        fx.backend.set_history("p1", vec![pending_file("f1")]);
        fx.messages.open(&alice()).await;

        assert_eq!(fx.machine.auto_accept().await, 1);
        assert_eq!(fx.machine.auto_accept().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_automatic_accepts_still_waiting() {
        let config = TransferConfig {
            accept_policy: AcceptPolicy::Automatic,
            ..TransferConfig::default()
        };
        let fx = fixture(config);
        fx.backend.fail_always("accept_file", || SyncError::Busy);
        fx.backend.set_history("p1", vec![pending_file("f1")]);
        fx.messages.open(&alice()).await;

        assert_eq!(fx.machine.auto_accept().await, 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.machine.is_accepting("f1").await);

        fx.machine.stop().await;
        let calls = fx.backend.call_count("accept_file");
        assert_eq!(calls, 1);
        assert!(!fx.machine.is_accepting("f1").await);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(fx.backend.call_count("accept_file"), calls);
        assert!(matches!(
            fx.machine.accept_file("f2", Some("/tmp".into())).await,
            Err(SyncError::UserCancelled)
        ));
        assert_eq!(fx.machine.auto_accept().await, 0);
    }
}
