//! In-memory stand-ins for the two external collaborators.
//!
//! [`ScriptedBackend`] plays the host behind the facade and [`ScriptedBridge`]
//! plays the native command/event bridge. Both record what they were asked
//! to do and can be scripted to fail, so the reconcilers and the transfer
//! machine can be driven without a network.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::config::TransportKind;
use crate::error::{SyncError, SyncResult};
use crate::events::EventHandler;
use crate::models::{
    FileHandle, FileStatus, Message, Peer, Settings, ThemeInfo, UploadReceipt, SELF_ID,
};
use crate::transport::native::{BridgeError, BridgeFile, HostBridge, Unlisten};
use crate::transport::{Backend, ByteStream, UploadIntent};
use crate::utils::now_secs;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type ErrorFactory = Arc<dyn Fn() -> SyncError + Send + Sync>;

/// One entry in the upload journal kept by [`ScriptedBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    Created(UploadIntent),
    Updated(UploadIntent, String),
    Deleted(UploadIntent),
}

struct BackendState {
    kind: TransportKind,
    offline: bool,
    calls: HashMap<String, usize>,
    queued_errors: HashMap<String, VecDeque<SyncError>>,
    persistent_errors: HashMap<String, ErrorFactory>,
    name: String,
    id: String,
    settings: Settings,
    peers: Vec<Peer>,
    histories: HashMap<String, Vec<Message>>,
    sent_messages: Vec<(String, String)>,
    sent_files: Vec<(String, String)>,
    accepted: Vec<(String, Option<String>)>,
    downloads: HashMap<String, Vec<u8>>,
    journal: Vec<JournalEntry>,
    current_theme: String,
    next_file: u64,
}

impl Default for BackendState {
    fn default() -> Self {
        Self {
            kind: TransportKind::Http,
            offline: false,
            calls: HashMap::new(),
            queued_errors: HashMap::new(),
            persistent_errors: HashMap::new(),
            name: "tester".into(),
            id: "self-id".into(),
            settings: Settings {
                download_path: "/tmp/lanchat".into(),
            },
            peers: Vec::new(),
            histories: HashMap::new(),
            sent_messages: Vec::new(),
            sent_files: Vec::new(),
            accepted: Vec::new(),
            downloads: HashMap::new(),
            journal: Vec::new(),
            current_theme: "default".into(),
            next_file: 1,
        }
    }
}

/// Scriptable [`Backend`] that keeps peers, histories and the upload journal
/// in memory.
#[derive(Default)]
pub struct ScriptedBackend {
    state: Mutex<BackendState>,
}

impl ScriptedBackend {
    pub fn with_kind(kind: TransportKind) -> Self {
        let backend = Self::default();
        lock(&backend.state).kind = kind;
        backend
    }

    /// Every call fails with `Unreachable` while offline.
    pub fn set_offline(&self, offline: bool) {
        lock(&self.state).offline = offline;
    }

    pub fn call_count(&self, op: &str) -> usize {
        lock(&self.state).calls.get(op).copied().unwrap_or(0)
    }

    /// The next call to `op` fails with `err`. Queued errors are consumed in
    /// order before any persistent failure applies.
    pub fn queue_error(&self, op: &str, err: SyncError) {
        lock(&self.state)
            .queued_errors
            .entry(op.to_string())
            .or_default()
            .push_back(err);
    }

    /// Every call to `op` fails with a fresh error from `make` until cleared.
    pub fn fail_always<F>(&self, op: &str, make: F)
    where
        F: Fn() -> SyncError + Send + Sync + 'static,
    {
        lock(&self.state)
            .persistent_errors
            .insert(op.to_string(), Arc::new(make));
    }

    pub fn clear_failure(&self, op: &str) {
        let mut state = lock(&self.state);
        state.persistent_errors.remove(op);
        state.queued_errors.remove(op);
    }

    pub fn set_peers(&self, peers: Vec<Peer>) {
        lock(&self.state).peers = peers;
    }

    pub fn set_history(&self, peer_id: &str, messages: Vec<Message>) {
        lock(&self.state)
            .histories
            .insert(peer_id.to_string(), messages);
    }

    pub fn push_history(&self, peer_id: &str, message: Message) {
        lock(&self.state)
            .histories
            .entry(peer_id.to_string())
            .or_default()
            .push(message);
    }

    /// Moves the file entry with `file_id` to `status` in every history.
    pub fn set_file_status(&self, file_id: &str, status: FileStatus) {
        let mut state = lock(&self.state);
        for message in state.histories.values_mut().flatten() {
            if let Some(meta) = message.file.as_mut() {
                if meta.file_id == file_id {
                    meta.status = status;
                }
            }
        }
    }

    pub fn set_download(&self, file_id: &str, data: Vec<u8>) {
        lock(&self.state)
            .downloads
            .insert(file_id.to_string(), data);
    }

    pub fn sent_messages(&self) -> Vec<(String, String)> {
        lock(&self.state).sent_messages.clone()
    }

    pub fn sent_files(&self) -> Vec<(String, String)> {
        lock(&self.state).sent_files.clone()
    }

    pub fn accepted(&self) -> Vec<(String, Option<String>)> {
        lock(&self.state).accepted.clone()
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        lock(&self.state).journal.clone()
    }

    pub fn name(&self) -> String {
        lock(&self.state).name.clone()
    }

    fn check(&self, op: &str) -> SyncResult<MutexGuard<'_, BackendState>> {
        let mut state = lock(&self.state);
        *state.calls.entry(op.to_string()).or_default() += 1;
        if state.offline {
            return Err(SyncError::Unreachable("scripted backend offline".into()));
        }
        if let Some(err) = state.queued_errors.get_mut(op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        if let Some(make) = state.persistent_errors.get(op) {
            return Err(make());
        }
        Ok(state)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn kind(&self) -> TransportKind {
        lock(&self.state).kind
    }

    async fn identity_name(&self) -> SyncResult<String> {
        Ok(self.check("identity_name")?.name.clone())
    }

    async fn identity_id(&self) -> SyncResult<String> {
        Ok(self.check("identity_id")?.id.clone())
    }

    async fn update_identity_name(&self, name: &str) -> SyncResult<String> {
        let mut state = self.check("update_identity_name")?;
        state.name = name.to_string();
        Ok(state.name.clone())
    }

    async fn settings(&self) -> SyncResult<Settings> {
        Ok(self.check("settings")?.settings.clone())
    }

    async fn update_settings(&self, download_path: &str) -> SyncResult<()> {
        self.check("update_settings")?.settings.download_path = download_path.to_string();
        Ok(())
    }

    async fn default_download_path(&self) -> SyncResult<String> {
        self.check("default_download_path")?;
        Ok("/tmp/lanchat".into())
    }

    async fn list_peers(&self) -> SyncResult<Vec<Peer>> {
        Ok(self.check("list_peers")?.peers.clone())
    }

    async fn send_message(&self, peer_id: &str, _peer_addr: &str, content: &str) -> SyncResult<()> {
        let mut state = self.check("send_message")?;
        state
            .sent_messages
            .push((peer_id.to_string(), content.to_string()));
        state
            .histories
            .entry(peer_id.to_string())
            .or_default()
            .push(Message::text(SELF_ID, now_secs(), content));
        Ok(())
    }

    async fn history(&self, peer_id: &str) -> SyncResult<Vec<Message>> {
        let state = self.check("history")?;
        let mut messages = state.histories.get(peer_id).cloned().unwrap_or_default();
        messages.sort_by_key(|message| message.timestamp);
        Ok(messages)
    }

    async fn send_file(
        &self,
        peer_id: &str,
        _peer_addr: &str,
        file: FileHandle,
    ) -> SyncResult<UploadReceipt> {
        let mut state = self.check("send_file")?;
        let file_name = file.display_name();
        let file_id = format!("file-{}", state.next_file);
        state.next_file += 1;
        state.sent_files.push((peer_id.to_string(), file_name.clone()));
        Ok(UploadReceipt {
            file_id,
            file_name,
            file_size: file.known_size().unwrap_or(0),
        })
    }

    async fn accept_file(&self, file_id: &str, save_path: Option<&str>) -> SyncResult<()> {
        let mut state = self.check("accept_file")?;
        state
            .accepted
            .push((file_id.to_string(), save_path.map(str::to_string)));
        drop(state);
        self.set_file_status(file_id, FileStatus::Accepted);
        Ok(())
    }

    async fn download_file(&self, file_id: &str) -> SyncResult<ByteStream> {
        let state = self.check("download_file")?;
        let data = state
            .downloads
            .get(file_id)
            .cloned()
            .ok_or_else(|| SyncError::rejected(format!("unknown file {file_id}")))?;
        // Two chunks so consumers exercise their streaming path.
        let split = data.len() / 2;
        let chunks: Vec<SyncResult<Bytes>> = vec![
            Ok(Bytes::copy_from_slice(&data[..split])),
            Ok(Bytes::copy_from_slice(&data[split..])),
        ];
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    async fn list_themes(&self) -> SyncResult<Vec<ThemeInfo>> {
        self.check("list_themes")?;
        Ok(vec![
            ThemeInfo {
                name: "default".into(),
                display_name: "Default".into(),
                is_custom: false,
            },
            ThemeInfo {
                name: "midnight".into(),
                display_name: "Midnight".into(),
                is_custom: true,
            },
        ])
    }

    async fn theme_css(&self, name: &str) -> SyncResult<String> {
        self.check("theme_css")?;
        Ok(format!("/* {name} */ body {{ }}"))
    }

    async fn save_current_theme(&self, name: &str) -> SyncResult<()> {
        self.check("save_current_theme")?.current_theme = name.to_string();
        Ok(())
    }

    async fn current_theme(&self) -> SyncResult<String> {
        Ok(self.check("current_theme")?.current_theme.clone())
    }

    async fn create_upload_record(&self, intent: &UploadIntent) -> SyncResult<()> {
        self.check("create_upload_record")?
            .journal
            .push(JournalEntry::Created(intent.clone()));
        Ok(())
    }

    async fn update_upload_status(&self, intent: &UploadIntent, status: &str) -> SyncResult<()> {
        self.check("update_upload_status")?
            .journal
            .push(JournalEntry::Updated(intent.clone(), status.to_string()));
        Ok(())
    }

    async fn delete_upload_record(&self, intent: &UploadIntent) -> SyncResult<()> {
        self.check("delete_upload_record")?
            .journal
            .push(JournalEntry::Deleted(intent.clone()));
        Ok(())
    }
}

#[derive(Default)]
struct BridgeState {
    sticky: HashMap<String, Result<Value, BridgeError>>,
    queued: HashMap<String, VecDeque<Result<Value, BridgeError>>>,
    invocations: Vec<(String, Value)>,
    listeners: HashMap<String, Vec<(u64, EventHandler)>>,
    next_listener: u64,
    files: HashMap<String, BridgeFile>,
}

/// Scriptable [`HostBridge`]. Unscripted commands answer `null`.
#[derive(Default)]
pub struct ScriptedBridge {
    state: Arc<Mutex<BridgeState>>,
}

impl ScriptedBridge {
    /// Every later `command` answers `value`.
    pub fn respond(&self, command: &str, value: Value) {
        lock(&self.state)
            .sticky
            .insert(command.to_string(), Ok(value));
    }

    /// Every later `command` fails with `err`.
    pub fn fail(&self, command: &str, err: BridgeError) {
        lock(&self.state)
            .sticky
            .insert(command.to_string(), Err(err));
    }

    /// The next `command` answers `result`, ahead of any sticky answer.
    pub fn queue(&self, command: &str, result: Result<Value, BridgeError>) {
        lock(&self.state)
            .queued
            .entry(command.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn set_file(&self, handle: &str, data: Vec<u8>, name: Option<&str>) {
        lock(&self.state).files.insert(
            handle.to_string(),
            BridgeFile {
                data: Bytes::from(data),
                name: name.map(str::to_string),
            },
        );
    }

    pub fn invocations(&self) -> Vec<(String, Value)> {
        lock(&self.state).invocations.clone()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        lock(&self.state)
            .listeners
            .get(event)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Delivers `payload` to every listener of `event`, synchronously.
    pub fn emit(&self, event: &str, payload: Value) {
        let handlers: Vec<EventHandler> = lock(&self.state)
            .listeners
            .get(event)
            .map(|entries| entries.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(payload.clone());
        }
    }
}

#[async_trait]
impl HostBridge for ScriptedBridge {
    async fn invoke(&self, command: &str, args: Value) -> Result<Value, BridgeError> {
        let mut state = lock(&self.state);
        state.invocations.push((command.to_string(), args));
        if let Some(result) = state.queued.get_mut(command).and_then(VecDeque::pop_front) {
            return result;
        }
        state
            .sticky
            .get(command)
            .cloned()
            .unwrap_or(Ok(Value::Null))
    }

    fn listen(&self, event: &str, handler: EventHandler) -> Unlisten {
        let id = {
            let mut state = lock(&self.state);
            let id = state.next_listener;
            state.next_listener += 1;
            state
                .listeners
                .entry(event.to_string())
                .or_default()
                .push((id, handler));
            id
        };
        let state = Arc::clone(&self.state);
        let event = event.to_string();
        Box::new(move || {
            if let Some(entries) = lock(&state).listeners.get_mut(&event) {
                entries.retain(|(listener, _)| *listener != id);
            }
        })
    }

    async fn read_file(&self, handle: &str) -> Result<BridgeFile, BridgeError> {
        lock(&self.state)
            .files
            .get(handle)
            .cloned()
            .ok_or_else(|| BridgeError::Command(format!("cannot read {handle}")))
    }
}
