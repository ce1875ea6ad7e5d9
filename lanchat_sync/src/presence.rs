//! Peer presence.
//!
//! [`Roster`] is the pure merge; [`PresenceSync`] feeds it from the facade
//! and from discovery pushes and publishes the resulting deltas.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::error::{SyncError, SyncResult};
use crate::models::Peer;
use crate::transport::Facade;
use crate::updates::{SyncUpdate, UpdateSink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceDelta {
    Added(Peer),
    Updated(Peer),
    Removed(String),
}

/// Deduplicated roster in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    peers: Vec<Peer>,
}

impl Roster {
    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn get(&self, id: &str) -> Option<&Peer> {
        self.peers.iter().find(|peer| peer.id == id)
    }

    /// Offline peers stay listed but cannot be sent to.
    pub fn selectable(&self, id: &str) -> Option<&Peer> {
        self.get(id).filter(|peer| peer.online)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Discovery push. Creates or refreshes the peer as online; never removes.
    pub fn apply_discovered(&mut self, mut peer: Peer) -> Option<PresenceDelta> {
        peer.online = true;
        self.upsert(peer)
    }

    /// Authoritative snapshot: ids missing from it are removed, the rest are
    /// created or refreshed in place.
    pub fn apply_snapshot(&mut self, snapshot: Vec<Peer>) -> Vec<PresenceDelta> {
        // A host listing the same id twice should not produce two rows.
        let mut latest: HashMap<String, Peer> = HashMap::with_capacity(snapshot.len());
        let mut order = Vec::with_capacity(snapshot.len());
        for peer in snapshot {
            if !latest.contains_key(&peer.id) {
                order.push(peer.id.clone());
            }
            latest.insert(peer.id.clone(), peer);
        }

        let mut deltas = Vec::new();
        self.peers.retain(|peer| {
            let keep = latest.contains_key(&peer.id);
            if !keep {
                deltas.push(PresenceDelta::Removed(peer.id.clone()));
            }
            keep
        });
        for id in order {
            if let Some(peer) = latest.remove(&id) {
                deltas.extend(self.upsert(peer));
            }
        }
        deltas
    }

    fn upsert(&mut self, peer: Peer) -> Option<PresenceDelta> {
        match self.peers.iter_mut().find(|known| known.id == peer.id) {
            Some(known) if *known == peer => None,
            Some(known) => {
                if known.online != peer.online {
                    tracing::info!(
                        peer_id = %peer.id,
                        name = %peer.display_name,
                        online = peer.online,
                        "peer presence changed"
                    );
                }
                known.display_name = peer.display_name;
                known.address = peer.address;
                known.online = peer.online;
                Some(PresenceDelta::Updated(known.clone()))
            }
            None => {
                tracing::info!(
                    peer_id = %peer.id,
                    name = %peer.display_name,
                    addr = %peer.address,
                    "peer added"
                );
                self.peers.push(peer.clone());
                Some(PresenceDelta::Added(peer))
            }
        }
    }
}

pub struct PresenceSync {
    facade: Facade,
    roster: Mutex<Roster>,
    updates: UpdateSink,
}

impl PresenceSync {
    pub fn new(facade: Facade, updates: UpdateSink) -> Self {
        Self {
            facade,
            roster: Mutex::new(Roster::default()),
            updates,
        }
    }

    /// Fetches the roster and merges it. A failed fetch changes nothing and
    /// is only logged; the next tick tries again.
    pub async fn refresh(&self) -> Vec<PresenceDelta> {
        let snapshot = match self.facade.try_list_peers().await {
            Ok(peers) => peers,
            Err(err) => {
                tracing::debug!(error = %err, "roster poll failed, keeping current roster");
                return Vec::new();
            }
        };
        let deltas = self.roster.lock().await.apply_snapshot(snapshot);
        if deltas.is_empty() {
            tracing::debug!("roster unchanged");
        }
        for delta in &deltas {
            if let PresenceDelta::Removed(id) = delta {
                tracing::info!(peer_id = %id, "peer removed");
            }
            self.updates.publish(SyncUpdate::Presence(delta.clone()));
        }
        deltas
    }

    pub async fn on_discovered(&self, peer: Peer) -> Option<PresenceDelta> {
        let delta = self.roster.lock().await.apply_discovered(peer);
        if let Some(delta) = &delta {
            self.updates.publish(SyncUpdate::Presence(delta.clone()));
        }
        delta
    }

    pub async fn roster(&self) -> Roster {
        self.roster.lock().await.clone()
    }

    pub async fn peer(&self, id: &str) -> Option<Peer> {
        self.roster.lock().await.get(id).cloned()
    }

    /// The peer if it can be sent to right now.
    pub async fn send_target(&self, id: &str) -> SyncResult<Peer> {
        let roster = self.roster.lock().await;
        match roster.get(id) {
            Some(peer) if peer.online => Ok(peer.clone()),
            Some(peer) => Err(SyncError::rejected(format!(
                "{} is offline",
                peer.display_name
            ))),
            None => Err(SyncError::rejected(format!("unknown peer {id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventChannel;
    use crate::testing::ScriptedBackend;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn alice(online: bool) -> Peer {
        Peer::new("a", "alice", "10.0.0.2:8080", online)
    }

    fn bob() -> Peer {
        Peer::new("b", "bob", "10.0.0.3:8080", true)
    }

    #[test]
    fn same_snapshot_twice_is_idempotent() {
        let mut roster = Roster::default();
        let first = roster.apply_snapshot(vec![alice(true), bob()]);
        assert_eq!(first.len(), 2);
        let before = roster.peers().to_vec();
        assert!(roster.apply_snapshot(vec![alice(true), bob()]).is_empty());
        assert_eq!(roster.peers(), &before[..]);
    }

    #[test]
    fn pushes_never_remove() {
        let mut roster = Roster::default();
        roster.apply_snapshot(vec![alice(true), bob()]);
        roster.apply_discovered(Peer::new("c", "carol", "10.0.0.4:8080", true));
        roster.apply_discovered(alice(false));
        assert_eq!(roster.len(), 3);
        assert!(roster.get("b").is_some());
    }

    #[test]
    fn discovered_peer_is_online_and_refreshed_in_place() {
        let mut roster = Roster::default();
        roster.apply_snapshot(vec![alice(false)]);
        let delta = roster.apply_discovered(Peer::new("a", "alice2", "10.0.0.9:8080", false));
        let expected = Peer::new("a", "alice2", "10.0.0.9:8080", true);
        assert_eq!(delta, Some(PresenceDelta::Updated(expected.clone())));
        assert_eq!(roster.peers(), &[expected][..]);
    }

    #[test]
    fn snapshot_removes_absent_and_toggles_online() {
        let mut roster = Roster::default();
        roster.apply_snapshot(vec![alice(true), bob()]);
        let deltas = roster.apply_snapshot(vec![alice(false)]);
        assert_eq!(
            deltas,
            vec![
                PresenceDelta::Removed("b".into()),
                PresenceDelta::Updated(alice(false)),
            ]
        );
        assert!(roster.selectable("a").is_none());
        assert!(roster.get("a").is_some());
    }

    #[test]
    fn duplicate_ids_in_snapshot_collapse() {
        let mut roster = Roster::default();
        let deltas = roster.apply_snapshot(vec![alice(true), alice(false)]);
        assert_eq!(deltas, vec![PresenceDelta::Added(alice(false))]);
        assert_eq!(roster.len(), 1);
    }

    #[tokio::test]
    async fn failed_fetch_keeps_roster() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.set_peers(vec![alice(true), bob()]);
        let sync = PresenceSync::new(
            Facade::new(backend.clone(), EventChannel::inert()),
            UpdateSink::discard(),
        );
        assert_eq!(sync.refresh().await.len(), 2);

        backend.set_offline(true);
        assert!(sync.refresh().await.is_empty());
        assert_eq!(sync.roster().await.len(), 2);
    }

    #[tokio::test]
    async fn offline_peer_is_not_a_send_target() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.set_peers(vec![alice(false), bob()]);
        let sync = PresenceSync::new(
            Facade::new(backend, EventChannel::inert()),
            UpdateSink::discard(),
        );
        sync.refresh().await;
        assert!(matches!(sync.send_target("a").await, Err(SyncError::Rejected(_))));
        assert_eq!(sync.send_target("b").await.unwrap().id, "b");
        assert!(sync.send_target("zz").await.is_err());
    }
}
