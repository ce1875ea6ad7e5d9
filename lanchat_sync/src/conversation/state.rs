use std::collections::{HashMap, HashSet};

use crate::models::{FileMeta, FileStatus, Message, MessageKey};

/// An optimistic entry and its confirmed copy may carry slightly different
/// timestamps when the host stamps the message itself.
pub const LOCAL_MATCH_WINDOW_SECS: i64 = 5;

/// The open conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationContext {
    pub peer_id: String,
    pub peer_addr: String,
    /// Newest timestamp rendered so far.
    pub last_seen: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Appended(Message),
    /// Already displayed; newer fields were taken over in place.
    Duplicate,
    /// A displayed file entry changed status; the whole history must be
    /// fetched again.
    Refetch,
    /// The push would move a displayed transfer backwards.
    Regression {
        file_id: String,
        shown: FileStatus,
        pushed: FileStatus,
    },
}

/// Display list of the open conversation: the last fetched history plus
/// local entries the host has not confirmed yet.
#[derive(Debug, Default)]
pub struct Conversation {
    context: Option<ConversationContext>,
    epoch: u64,
    confirmed: Vec<Message>,
    local: Vec<Message>,
}

impl Conversation {
    /// Starts a fresh context. The returned epoch identifies it so results of
    /// fetches started for an earlier context can be discarded.
    pub fn open(&mut self, peer_id: &str, peer_addr: &str) -> u64 {
        self.epoch += 1;
        self.context = Some(ConversationContext {
            peer_id: peer_id.to_string(),
            peer_addr: peer_addr.to_string(),
            last_seen: 0,
        });
        self.confirmed.clear();
        self.local.clear();
        self.epoch
    }

    pub fn close(&mut self) -> Option<ConversationContext> {
        self.epoch += 1;
        self.confirmed.clear();
        self.local.clear();
        self.context.take()
    }

    pub fn context(&self) -> Option<&ConversationContext> {
        self.context.as_ref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_open_for(&self, peer_id: &str) -> bool {
        self.context
            .as_ref()
            .is_some_and(|context| context.peer_id == peer_id)
    }

    /// Display order: ascending timestamp, fetch order within a second.
    pub fn messages(&self) -> Vec<Message> {
        let mut merged = self.confirmed.clone();
        merged.extend(self.local.iter().cloned());
        merged.sort_by_key(|message| message.timestamp);
        merged
    }

    pub fn displayed_status(&self, file_id: &str) -> Option<FileStatus> {
        self.confirmed
            .iter()
            .chain(self.local.iter())
            .filter(|message| message.file_id() == Some(file_id))
            .filter_map(Message::file_status)
            .max_by_key(|status| status.rank())
    }

    /// Replaces the confirmed history with `fetched` and returns the new
    /// display list.
    pub fn load(&mut self, fetched: Vec<Message>) -> Vec<Message> {
        let (deduped, held) = self.normalize(fetched);
        for (file_id, shown, fetched) in held {
            tracing::warn!(
                file_id = %file_id,
                shown = %shown,
                fetched = %fetched,
                "ignoring backwards transfer status"
            );
        }

        let confirmed = self.confirmed_locals(&deduped);
        let mut position = 0;
        self.local.retain(|_| {
            let keep = !confirmed.contains(&position);
            position += 1;
            keep
        });
        self.confirmed = deduped;
        self.bump_last_seen();
        self.messages()
    }

    /// Whether `fetched` differs from what is on screen: message count,
    /// in-flight transfer markers, or a local entry that is now confirmed.
    /// The comparison runs on the history as [`load`](Self::load) would store
    /// it, so a backwards status that is already being held back is not a
    /// change.
    pub fn needs_rerender(&self, fetched: &[Message]) -> bool {
        let (fetched, _) = self.normalize(fetched.to_vec());
        fetched.len() != self.confirmed.len()
            || in_flight(&fetched) != in_flight(&self.confirmed)
            || !self.confirmed_locals(&fetched).is_empty()
    }

    pub fn apply_push(&mut self, message: Message) -> PushOutcome {
        let key = message.key();
        let existing = self
            .confirmed
            .iter()
            .chain(self.local.iter())
            .find(|shown| shown.key() == key)
            .map(Message::file_status);
        if let Some(shown_status) = existing {
            if let (Some(shown), Some(pushed)) = (shown_status, message.file_status()) {
                if shown != pushed {
                    return status_change(&message, shown, pushed);
                }
            }
            self.take_over(message);
            return PushOutcome::Duplicate;
        }

        if let (Some(file_id), Some(pushed)) = (message.file_id(), message.file_status()) {
            if let Some(shown) = self.displayed_status(file_id) {
                if shown != pushed {
                    return status_change(&message, shown, pushed);
                }
                return PushOutcome::Duplicate;
            }
        }

        let confirmed = self.confirmed_locals(std::slice::from_ref(&message));
        if let Some(&slot) = confirmed.iter().next() {
            self.local.remove(slot);
        }
        let at = self
            .confirmed
            .partition_point(|shown| shown.timestamp <= message.timestamp);
        self.confirmed.insert(at, message.clone());
        self.bump_last_seen();
        PushOutcome::Appended(message)
    }

    pub fn append_local(&mut self, message: Message) {
        self.local.push(message);
        self.bump_last_seen();
    }

    pub fn resolve_local(&mut self, key: &MessageKey) -> bool {
        let before = self.local.len();
        self.local.retain(|message| &message.key() != key);
        before != self.local.len()
    }

    /// Inbound files still waiting for the user.
    pub fn pending_inbound(&self) -> Vec<FileMeta> {
        self.confirmed
            .iter()
            .filter(|message| !message.is_outgoing())
            .filter_map(|message| message.file.clone())
            .filter(|meta| meta.status == FileStatus::Pending)
            .collect()
    }

    /// Sorts `fetched`, keeps the newest copy of each key and holds every
    /// file status at or above what is displayed. Returns the held-back
    /// statuses as `(file_id, shown, fetched)`.
    fn normalize(
        &self,
        mut fetched: Vec<Message>,
    ) -> (Vec<Message>, Vec<(String, FileStatus, FileStatus)>) {
        fetched.sort_by_key(|message| message.timestamp);

        let mut index: HashMap<MessageKey, usize> = HashMap::with_capacity(fetched.len());
        let mut deduped: Vec<Message> = Vec::with_capacity(fetched.len());
        for message in fetched {
            match index.get(&message.key()) {
                Some(&slot) => deduped[slot] = message,
                None => {
                    index.insert(message.key(), deduped.len());
                    deduped.push(message);
                }
            }
        }

        let mut held = Vec::new();
        for message in deduped.iter_mut() {
            let Some(meta) = message.file.as_mut() else {
                continue;
            };
            if let Some(shown) = self.displayed_status(&meta.file_id) {
                if shown.regresses_to(meta.status) {
                    held.push((meta.file_id.clone(), shown, meta.status));
                    meta.status = shown;
                }
            }
        }
        (deduped, held)
    }

    fn take_over(&mut self, message: Message) {
        let key = message.key();
        if let Some(slot) = self.confirmed.iter().position(|shown| shown.key() == key) {
            self.confirmed[slot] = message;
        } else if let Some(slot) = self.local.iter().position(|shown| shown.key() == key) {
            self.local.remove(slot);
            let at = self
                .confirmed
                .partition_point(|shown| shown.timestamp <= message.timestamp);
            self.confirmed.insert(at, message);
        }
    }

    /// Positions in `self.local` that `fetched` confirms. Exact key matches
    /// win; otherwise a local entry matches one newly appearing fetched entry
    /// with the same sender, kind and content within the match window. Each
    /// fetched entry confirms at most one local entry.
    fn confirmed_locals(&self, fetched: &[Message]) -> HashSet<usize> {
        let known: HashSet<MessageKey> = self.confirmed.iter().map(Message::key).collect();
        let mut used: HashSet<usize> = HashSet::new();
        let mut confirmed = HashSet::new();

        for (position, local) in self.local.iter().enumerate() {
            if let Some(found) = fetched.iter().position(|entry| entry.key() == local.key()) {
                used.insert(found);
                confirmed.insert(position);
            }
        }
        for (position, local) in self.local.iter().enumerate() {
            if confirmed.contains(&position) {
                continue;
            }
            let found = fetched.iter().enumerate().position(|(slot, entry)| {
                !used.contains(&slot)
                    && !known.contains(&entry.key())
                    && entry.from_id == local.from_id
                    && entry.kind == local.kind
                    && entry.content == local.content
                    && (entry.timestamp - local.timestamp).abs() <= LOCAL_MATCH_WINDOW_SECS
            });
            if let Some(slot) = found {
                used.insert(slot);
                confirmed.insert(position);
            }
        }
        confirmed
    }

    fn bump_last_seen(&mut self) {
        let newest = self
            .confirmed
            .iter()
            .chain(self.local.iter())
            .map(|message| message.timestamp)
            .max()
            .unwrap_or(0);
        if let Some(context) = self.context.as_mut() {
            context.last_seen = context.last_seen.max(newest);
        }
    }
}

fn status_change(message: &Message, shown: FileStatus, pushed: FileStatus) -> PushOutcome {
    if shown.regresses_to(pushed) {
        PushOutcome::Regression {
            file_id: message.file_id().unwrap_or_default().to_string(),
            shown,
            pushed,
        }
    } else {
        PushOutcome::Refetch
    }
}

fn in_flight(messages: &[Message]) -> Vec<(String, FileStatus)> {
    let mut markers: Vec<(String, FileStatus)> = messages
        .iter()
        .filter_map(|message| message.file.as_ref())
        .filter(|meta| !meta.status.is_terminal())
        .map(|meta| (meta.file_id.clone(), meta.status))
        .collect();
    markers.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.rank().cmp(&b.1.rank())));
    markers
}
