//! The single stream of deltas the UI layer consumes.

use tokio::sync::mpsc;

use crate::conversation::ConversationUpdate;
use crate::presence::PresenceDelta;
use crate::transfer::TransferUpdate;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncUpdate {
    Presence(PresenceDelta),
    Conversation(ConversationUpdate),
    Transfer(TransferUpdate),
    /// Something arrived for a conversation that is not open.
    Unread { peer_id: String, count: usize },
}

/// Sending half of the update stream. A sink without a receiver drops
/// everything, which is what tests and headless one-shot commands want.
#[derive(Clone, Default)]
pub struct UpdateSink {
    tx: Option<mpsc::UnboundedSender<SyncUpdate>>,
}

impl UpdateSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn discard() -> Self {
        Self::default()
    }

    pub fn publish(&self, update: SyncUpdate) {
        if let Some(tx) = &self.tx {
            if tx.send(update).is_err() {
                tracing::trace!("update receiver dropped");
            }
        }
    }
}
