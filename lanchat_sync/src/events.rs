//! Push notifications from the host.
//!
//! Only the native transport can push. On the HTTP transport every
//! subscription is inert and callers are expected to poll instead.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::transport::native::{HostBridge, Unlisten};

/// Fired by the host when discovery sees a peer announce itself.
pub const PEER_DISCOVERED: &str = "new-peer";
/// Fired by the host when a message (or a file status change) arrives.
pub const MESSAGE_RECEIVED: &str = "new-message";

pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Clone, Default)]
pub struct EventChannel {
    bridge: Option<Arc<dyn HostBridge>>,
}

impl EventChannel {
    pub fn native(bridge: Arc<dyn HostBridge>) -> Self {
        Self {
            bridge: Some(bridge),
        }
    }

    /// Channel for transports without push capability.
    pub fn inert() -> Self {
        Self { bridge: None }
    }

    pub fn supports_push(&self) -> bool {
        self.bridge.is_some()
    }

    pub fn subscribe(&self, event: &str, handler: EventHandler) -> Subscription {
        match &self.bridge {
            Some(bridge) => {
                tracing::debug!(event, "listening for host event");
                Subscription {
                    event: event.to_string(),
                    unlisten: Some(bridge.listen(event, handler)),
                }
            }
            None => {
                tracing::warn!(event, "transport has no push events, subscription is inert");
                Subscription {
                    event: event.to_string(),
                    unlisten: None,
                }
            }
        }
    }

    /// Subscribes and decodes each payload as `T`, forwarding it into a
    /// channel. Payloads that fail to decode are logged and dropped.
    pub fn subscribe_typed<T>(&self, event: &str) -> (Subscription, mpsc::UnboundedReceiver<T>)
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let name = event.to_string();
        let handler: EventHandler = Arc::new(move |payload: Value| {
            match serde_json::from_value::<T>(payload) {
                Ok(decoded) => {
                    if tx.send(decoded).is_err() {
                        tracing::debug!(event = %name, "event receiver dropped");
                    }
                }
                Err(err) => {
                    tracing::warn!(event = %name, error = %err, "failed to decode event payload");
                }
            }
        });
        (self.subscribe(event, handler), rx)
    }
}

/// Handle to an active subscription. Dropping it unsubscribes.
pub struct Subscription {
    event: String,
    unlisten: Option<Unlisten>,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn is_active(&self) -> bool {
        self.unlisten.is_some()
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(unlisten) = self.unlisten.take() {
            unlisten();
            tracing::debug!(event = %self.event, "stopped listening for host event");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
