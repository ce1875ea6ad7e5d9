//! Message reconciliation for the open conversation.

mod scroll;
mod state;

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::models::{FileMeta, Message, MessageKey, Peer};
use crate::transport::Facade;
use crate::updates::{SyncUpdate, UpdateSink};

pub use scroll::{ScrollAnchor, ScrollState, AT_BOTTOM_THRESHOLD};
pub use state::{Conversation, ConversationContext, PushOutcome, LOCAL_MATCH_WINDOW_SECS};

#[derive(Debug, Clone, PartialEq)]
pub enum ConversationUpdate {
    Opened { peer_id: String, messages: Vec<Message> },
    Appended { peer_id: String, message: Message },
    /// Full re-render; the UI restores its [`ScrollAnchor`] afterwards.
    Rerendered { peer_id: String, messages: Vec<Message> },
    Closed { peer_id: String },
}

pub struct MessageSync {
    facade: Facade,
    state: Mutex<Conversation>,
    unread: Mutex<HashMap<String, usize>>,
    updates: UpdateSink,
}

impl MessageSync {
    pub fn new(facade: Facade, updates: UpdateSink) -> Self {
        Self {
            facade,
            state: Mutex::new(Conversation::default()),
            unread: Mutex::new(HashMap::new()),
            updates,
        }
    }

    /// Opens `peer`'s conversation, replacing whatever was open, and renders
    /// its history once.
    pub async fn open(&self, peer: &Peer) -> Vec<Message> {
        let epoch = self.state.lock().await.open(&peer.id, &peer.address);
        self.unread.lock().await.remove(&peer.id);
        tracing::debug!(peer_id = %peer.id, "conversation opened");

        let fetched = self.facade.history(&peer.id).await;
        let mut state = self.state.lock().await;
        if state.epoch() != epoch {
            tracing::debug!(peer_id = %peer.id, "conversation switched during load");
            return state.messages();
        }
        let messages = state.load(fetched);
        self.updates.publish(SyncUpdate::Conversation(ConversationUpdate::Opened {
            peer_id: peer.id.clone(),
            messages: messages.clone(),
        }));
        messages
    }

    pub async fn close(&self) {
        if let Some(context) = self.state.lock().await.close() {
            tracing::debug!(peer_id = %context.peer_id, "conversation closed");
            self.updates.publish(SyncUpdate::Conversation(ConversationUpdate::Closed {
                peer_id: context.peer_id,
            }));
        }
    }

    pub async fn context(&self) -> Option<ConversationContext> {
        self.state.lock().await.context().cloned()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.state.lock().await.messages()
    }

    /// Poll tick. Re-renders only when the fetched history differs from the
    /// display; a failed fetch leaves everything as it is.
    pub async fn poll(&self) -> bool {
        let Some((peer_id, epoch)) = self.current().await else {
            return false;
        };
        let fetched = match self.facade.try_history(&peer_id).await {
            Ok(fetched) => fetched,
            Err(err) => {
                tracing::debug!(peer_id = %peer_id, error = %err, "history poll failed");
                return false;
            }
        };
        let mut state = self.state.lock().await;
        if state.epoch() != epoch {
            return false;
        }
        if !state.needs_rerender(&fetched) {
            tracing::trace!(peer_id = %peer_id, "history unchanged");
            return false;
        }
        let messages = state.load(fetched);
        self.publish_rerender(peer_id, messages);
        true
    }

    /// Unconditional re-fetch and re-render of the open conversation.
    pub async fn refresh(&self) -> Vec<Message> {
        let Some((peer_id, epoch)) = self.current().await else {
            return Vec::new();
        };
        let fetched = match self.facade.try_history(&peer_id).await {
            Ok(fetched) => fetched,
            Err(err) => {
                tracing::warn!(peer_id = %peer_id, error = %err, "failed to refresh conversation");
                return self.messages().await;
            }
        };
        let mut state = self.state.lock().await;
        if state.epoch() != epoch {
            return state.messages();
        }
        let messages = state.load(fetched);
        self.publish_rerender(peer_id, messages.clone());
        messages
    }

    /// Merges a pushed message. Pushes for other conversations only bump
    /// their unread count. Outgoing pushes name no receiver, so they are left
    /// to the next poll.
    pub async fn on_pushed(&self, message: Message) {
        let outcome = {
            let mut state = self.state.lock().await;
            if state.is_open_for(&message.from_id) {
                let peer_id = state.context().map(|context| context.peer_id.clone());
                Some((peer_id.unwrap_or_default(), state.apply_push(message.clone())))
            } else {
                None
            }
        };

        match outcome {
            Some((peer_id, PushOutcome::Appended(message))) => {
                self.updates.publish(SyncUpdate::Conversation(ConversationUpdate::Appended {
                    peer_id,
                    message,
                }));
            }
            Some((_, PushOutcome::Refetch)) => {
                self.refresh().await;
            }
            Some((peer_id, PushOutcome::Regression { file_id, shown, pushed })) => {
                tracing::warn!(
                    peer_id = %peer_id,
                    file_id = %file_id,
                    shown = %shown,
                    pushed = %pushed,
                    "ignoring pushed status that would move a transfer backwards"
                );
            }
            Some((_, PushOutcome::Duplicate)) => {
                tracing::trace!(from_id = %message.from_id, "duplicate push ignored");
            }
            None if message.is_outgoing() => {
                tracing::debug!("outgoing push ignored until the next poll");
            }
            None => {
                let count = {
                    let mut unread = self.unread.lock().await;
                    let count = unread.entry(message.from_id.clone()).or_default();
                    *count += 1;
                    *count
                };
                self.updates.publish(SyncUpdate::Unread {
                    peer_id: message.from_id,
                    count,
                });
            }
        }
    }

    /// Shows an entry the host has not confirmed yet. Ignored unless `peer_id`
    /// is the open conversation.
    pub async fn append_local(&self, peer_id: &str, message: Message) -> bool {
        let mut state = self.state.lock().await;
        if !state.is_open_for(peer_id) {
            return false;
        }
        state.append_local(message.clone());
        self.updates.publish(SyncUpdate::Conversation(ConversationUpdate::Appended {
            peer_id: peer_id.to_string(),
            message,
        }));
        true
    }

    pub async fn resolve_local(&self, key: &MessageKey) -> bool {
        self.state.lock().await.resolve_local(key)
    }

    pub async fn unread(&self, peer_id: &str) -> usize {
        self.unread.lock().await.get(peer_id).copied().unwrap_or(0)
    }

    pub async fn pending_inbound(&self) -> Vec<FileMeta> {
        self.state.lock().await.pending_inbound()
    }

    async fn current(&self) -> Option<(String, u64)> {
        let state = self.state.lock().await;
        state
            .context()
            .map(|context| (context.peer_id.clone(), state.epoch()))
    }

    fn publish_rerender(&self, peer_id: String, messages: Vec<Message>) {
        tracing::debug!(peer_id = %peer_id, count = messages.len(), "conversation re-rendered");
        self.updates.publish(SyncUpdate::Conversation(ConversationUpdate::Rerendered {
            peer_id,
            messages,
        }));
    }
}
