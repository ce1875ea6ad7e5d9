//! One running client: facade, push subscriptions, pollers and the
//! reconcilers, publishing a single stream of [`SyncUpdate`]s.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::conversation::MessageSync;
use crate::error::{SyncError, SyncResult};
use crate::events::{Subscription, MESSAGE_RECEIVED, PEER_DISCOVERED};
use crate::models::{FileHandle, Message, MessageRecord, Peer, UploadReceipt};
use crate::poller::spawn_repeating;
use crate::presence::{PresenceDelta, PresenceSync, Roster};
use crate::transfer::{SavePathPicker, TransferMachine};
use crate::transport::{Facade, HostBridge};
use crate::updates::{SyncUpdate, UpdateSink};

pub struct Session {
    facade: Facade,
    presence: Arc<PresenceSync>,
    messages: Arc<MessageSync>,
    transfers: Arc<TransferMachine>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    subscriptions: Vec<Subscription>,
}

impl Session {
    /// Builds the facade named by `config` and starts a session on it.
    pub fn connect(
        config: &SyncConfig,
        bridge: Option<Arc<dyn HostBridge>>,
    ) -> SyncResult<(Self, mpsc::UnboundedReceiver<SyncUpdate>)> {
        let facade = Facade::from_config(config, bridge)?;
        Ok(Self::start(facade, config, None))
    }

    /// Subscribes to push events (when the transport has them) and starts
    /// both pollers. Must be called from within a tokio runtime.
    pub fn start(
        facade: Facade,
        config: &SyncConfig,
        picker: Option<Arc<dyn SavePathPicker>>,
    ) -> (Self, mpsc::UnboundedReceiver<SyncUpdate>) {
        let (updates, rx) = UpdateSink::channel();
        let presence = Arc::new(PresenceSync::new(facade.clone(), updates.clone()));
        let messages = Arc::new(MessageSync::new(facade.clone(), updates.clone()));
        let mut machine = TransferMachine::new(
            facade.clone(),
            messages.clone(),
            updates,
            config.transfer.clone(),
        );
        if let Some(picker) = picker {
            machine = machine.with_picker(picker);
        }
        let transfers = Arc::new(machine);

        let mut session = Self {
            facade,
            presence,
            messages,
            transfers,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
            subscriptions: Vec::new(),
        };
        session.listen_for_pushes();
        session.start_pollers(config);
        tracing::info!(transport = ?session.facade.kind(), "sync session started");
        (session, rx)
    }

    fn listen_for_pushes(&mut self) {
        if !self.facade.events().supports_push() {
            tracing::info!("transport has no push events, relying on polling");
            return;
        }

        let (subscription, mut peers) = self
            .facade
            .events()
            .subscribe_typed::<Peer>(PEER_DISCOVERED);
        self.subscriptions.push(subscription);
        let presence = self.presence.clone();
        let shutdown = self.shutdown.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    next = peers.recv() => match next {
                        Some(peer) => {
                            presence.on_discovered(peer).await;
                        }
                        None => break,
                    },
                }
            }
        }));

        let (subscription, mut records) = self
            .facade
            .events()
            .subscribe_typed::<MessageRecord>(MESSAGE_RECEIVED);
        self.subscriptions.push(subscription);
        let messages = self.messages.clone();
        let transfers = self.transfers.clone();
        let shutdown = self.shutdown.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                let record = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    next = records.recv() => match next {
                        Some(record) => record,
                        None => break,
                    },
                };
                match Message::try_from(record) {
                    Ok(message) => {
                        messages.on_pushed(message).await;
                        transfers.auto_accept().await;
                    }
                    Err(err) => tracing::warn!(error = %err, "dropping unreadable pushed message"),
                }
            }
        }));
    }

    fn start_pollers(&mut self, config: &SyncConfig) {
        let presence = self.presence.clone();
        self.tasks.push(spawn_repeating(
            "peers",
            config.polling.peer_interval,
            self.shutdown.clone(),
            move || {
                let presence = presence.clone();
                async move {
                    presence.refresh().await;
                }
            },
        ));

        let messages = self.messages.clone();
        let transfers = self.transfers.clone();
        self.tasks.push(spawn_repeating(
            "messages",
            config.polling.message_interval,
            self.shutdown.clone(),
            move || {
                let messages = messages.clone();
                let transfers = transfers.clone();
                async move {
                    if messages.poll().await {
                        transfers.auto_accept().await;
                    }
                }
            },
        ));
    }

    pub fn facade(&self) -> &Facade {
        &self.facade
    }

    pub fn presence(&self) -> &Arc<PresenceSync> {
        &self.presence
    }

    pub fn messages(&self) -> &Arc<MessageSync> {
        &self.messages
    }

    pub fn transfers(&self) -> &Arc<TransferMachine> {
        &self.transfers
    }

    pub async fn roster(&self) -> Roster {
        self.presence.roster().await
    }

    pub async fn refresh_peers(&self) -> Vec<PresenceDelta> {
        self.presence.refresh().await
    }

    pub async fn open_conversation(&self, peer_id: &str) -> SyncResult<Vec<Message>> {
        let peer = self
            .presence
            .peer(peer_id)
            .await
            .ok_or_else(|| SyncError::rejected(format!("unknown peer {peer_id}")))?;
        let messages = self.messages.open(&peer).await;
        self.transfers.auto_accept().await;
        Ok(messages)
    }

    pub async fn close_conversation(&self) {
        self.messages.close().await;
    }

    pub async fn send_text(&self, content: &str) -> SyncResult<Option<Message>> {
        let peer = self.open_target().await?;
        self.transfers.send_text(&peer, content).await
    }

    pub async fn send_file(&self, file: FileHandle) -> SyncResult<UploadReceipt> {
        let peer = self.open_target().await?;
        self.transfers.send_file(&peer, file).await
    }

    pub async fn accept_file(&self, file_id: &str, save_path: Option<String>) -> SyncResult<()> {
        self.transfers.accept_file(file_id, save_path).await
    }

    pub async fn cancel_accept(&self, file_id: &str) -> bool {
        self.transfers.cancel_accept(file_id).await
    }

    /// Stops pollers and push listeners and waits for them to finish.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        self.transfers.stop().await;
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "sync task ended abnormally");
            }
        }
        tracing::info!("sync session stopped");
    }

    async fn open_target(&self) -> SyncResult<Peer> {
        let context = self
            .messages
            .context()
            .await
            .ok_or_else(|| SyncError::rejected("no conversation is open"))?;
        self.presence.send_target(&context.peer_id).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.transfers.cancel_all();
    }
}
