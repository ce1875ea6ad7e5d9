use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Sender id the backends use for messages written by the local user.
pub const SELF_ID: &str = "me";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "PeerRecord")]
pub struct Peer {
    pub id: String,
    pub display_name: String,
    /// `host:port` the peer is directly dialable on.
    pub address: String,
    pub online: bool,
}

impl Peer {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        address: impl Into<String>,
        online: bool,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            address: address.into(),
            online,
        }
    }
}

/// Roster entry as both backends serialize it. Discovery pushes carry only
/// `id`, `name` and `addr`, which deserializes as an online peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    pub name: String,
    pub addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<u64>,
    #[serde(default)]
    pub is_offline: bool,
}

impl From<PeerRecord> for Peer {
    fn from(record: PeerRecord) -> Self {
        Self {
            id: record.id,
            display_name: record.name,
            address: record.addr,
            online: !record.is_offline,
        }
    }
}

impl From<&Peer> for PeerRecord {
    fn from(peer: &Peer) -> Self {
        Self {
            id: peer.id.clone(),
            name: peer.display_name.clone(),
            addr: peer.address.clone(),
            last_seen: None,
            is_offline: !peer.online,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileStatus {
    Uploading,
    Pending,
    Downloading,
    Accepted,
}

impl FileStatus {
    /// Position along a transfer's lifecycle. Outbound and inbound transfers
    /// share the scale: both start at 0 and end at `Accepted`.
    pub fn rank(self) -> u8 {
        match self {
            FileStatus::Uploading | FileStatus::Pending => 0,
            FileStatus::Downloading => 1,
            FileStatus::Accepted => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == FileStatus::Accepted
    }

    /// True if moving from `self` to `next` would walk the lifecycle backwards.
    pub fn regresses_to(self, next: FileStatus) -> bool {
        next.rank() < self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Uploading => "uploading",
            FileStatus::Pending => "pending",
            FileStatus::Downloading => "downloading",
            FileStatus::Accepted => "accepted",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "uploading" => Ok(FileStatus::Uploading),
            "pending" => Ok(FileStatus::Pending),
            "downloading" => Ok(FileStatus::Downloading),
            // Older hosts report terminal outbound/inbound states by these names.
            "accepted" | "sent" | "completed" => Ok(FileStatus::Accepted),
            other => Err(format!("unknown file status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub status: FileStatus,
}

/// Identity of a message inside one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKey {
    pub from_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub from_id: String,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    pub kind: MessageKind,
    pub content: String,
    pub file: Option<FileMeta>,
}

impl Message {
    pub fn text(from_id: impl Into<String>, timestamp: i64, content: impl Into<String>) -> Self {
        Self {
            from_id: from_id.into(),
            timestamp,
            kind: MessageKind::Text,
            content: content.into(),
            file: None,
        }
    }

    pub fn file(from_id: impl Into<String>, timestamp: i64, meta: FileMeta) -> Self {
        Self {
            from_id: from_id.into(),
            timestamp,
            kind: MessageKind::File,
            content: meta.file_name.clone(),
            file: Some(meta),
        }
    }

    pub fn key(&self) -> MessageKey {
        MessageKey {
            from_id: self.from_id.clone(),
            timestamp: self.timestamp,
        }
    }

    pub fn is_outgoing(&self) -> bool {
        self.from_id == SELF_ID
    }

    pub fn file_status(&self) -> Option<FileStatus> {
        self.file.as_ref().map(|meta| meta.status)
    }

    pub fn file_id(&self) -> Option<&str> {
        self.file.as_ref().map(|meta| meta.file_id.as_str())
    }

    pub fn is_downloading(&self) -> bool {
        self.file_status() == Some(FileStatus::Downloading)
    }
}

/// History entry / `new-message` payload as the backends serialize it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageRecord {
    pub from_id: String,
    #[serde(default)]
    pub content: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
}

impl TryFrom<MessageRecord> for Message {
    type Error = String;

    fn try_from(record: MessageRecord) -> Result<Self, Self::Error> {
        let is_file = record.msg_type.as_deref() == Some("file");
        if !is_file {
            return Ok(Message::text(record.from_id, record.timestamp, record.content));
        }
        // Records without a status were written before statuses existed and
        // are complete by definition.
        let status = match record.file_status.as_deref() {
            Some(raw) => raw.parse()?,
            None => FileStatus::Accepted,
        };
        // Upload intent records carry no file id until the host assigns one;
        // fall back to the message key so the entry stays addressable.
        let file_id = record
            .file_id
            .unwrap_or_else(|| format!("{}@{}", record.from_id, record.timestamp));
        let file_name = record.file_name.unwrap_or_else(|| record.content.clone());
        Ok(Message {
            from_id: record.from_id,
            timestamp: record.timestamp,
            kind: MessageKind::File,
            content: record.content,
            file: Some(FileMeta {
                file_id,
                file_name,
                file_size: record.file_size.unwrap_or(0),
                status,
            }),
        })
    }
}

impl From<&Message> for MessageRecord {
    fn from(message: &Message) -> Self {
        let mut record = MessageRecord {
            from_id: message.from_id.clone(),
            content: message.content.clone(),
            timestamp: message.timestamp,
            ..Default::default()
        };
        match &message.file {
            Some(meta) => {
                record.msg_type = Some("file".into());
                record.file_id = Some(meta.file_id.clone());
                record.file_name = Some(meta.file_name.clone());
                record.file_size = Some(meta.file_size);
                record.file_status = Some(meta.status.as_str().into());
            }
            None => record.msg_type = Some("text".into()),
        }
        record
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub download_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemeInfo {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub is_custom: bool,
}

/// What the receiving peer reports after an upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    #[serde(default)]
    pub file_id: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub file_size: u64,
}

/// A file chosen for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileHandle {
    /// Traversable filesystem path.
    Path(PathBuf),
    /// Platform handle with no traversable path (e.g. an Android
    /// `content://` URI); readable only through the host bridge.
    ContentUri(String),
    /// Bytes already in memory.
    Bytes { name: String, data: Bytes },
}

impl FileHandle {
    /// Classifies a handle returned by a file chooser.
    pub fn from_picked(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if raw.starts_with("content://") {
            FileHandle::ContentUri(raw)
        } else {
            FileHandle::Path(PathBuf::from(raw))
        }
    }

    /// Best-effort display name for the optimistic placeholder.
    pub fn display_name(&self) -> String {
        match self {
            FileHandle::Path(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            FileHandle::ContentUri(uri) => content_uri_file_name(uri),
            FileHandle::Bytes { name, .. } => name.clone(),
        }
    }

    pub fn known_size(&self) -> Option<u64> {
        match self {
            FileHandle::Bytes { data, .. } => Some(data.len() as u64),
            _ => None,
        }
    }
}

/// Last path segment of a content URI with percent escapes decoded and any
/// `primary:`-style document prefix stripped.
pub fn content_uri_file_name(uri: &str) -> String {
    let segment = uri.rsplit('/').next().unwrap_or(uri);
    let decoded = urlencoding::decode(segment)
        .map(Cow::into_owned)
        .unwrap_or_else(|_| segment.to_string());
    match decoded.rfind(':') {
        Some(idx) => decoded[idx + 1..].to_string(),
        None => decoded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn peer_record_maps_offline_flag() {
        let peer: Peer = serde_json::from_str(
            r#"{"id":"p1","name":"alice","addr":"10.0.0.2:8080","last_seen":12,"is_offline":true}"#,
        )
        .unwrap();
        assert_eq!(peer, Peer::new("p1", "alice", "10.0.0.2:8080", false));
    }

    #[test]
    fn discovery_payload_is_online() {
        let peer: Peer =
            serde_json::from_str(r#"{"id":"p2","name":"bob","addr":"10.0.0.3:8080"}"#).unwrap();
        assert!(peer.online);
    }

    #[test]
    fn file_record_without_status_is_accepted() {
        let record: MessageRecord = serde_json::from_str(
            r#"{"from_id":"p1","content":"a.txt","timestamp":5,"msg_type":"file","file_id":"f1","file_name":"a.txt"}"#,
        )
        .unwrap();
        let message = Message::try_from(record).unwrap();
        assert_eq!(message.file_status(), Some(FileStatus::Accepted));
        assert_eq!(message.file_id(), Some("f1"));
    }

    #[test]
    fn legacy_sent_status_is_terminal() {
        assert_eq!("sent".parse::<FileStatus>(), Ok(FileStatus::Accepted));
        assert!("exploded".parse::<FileStatus>().is_err());
    }

    #[test]
    fn upload_record_without_file_id_falls_back_to_key() {
        let record = MessageRecord {
            from_id: SELF_ID.into(),
            content: "a.txt".into(),
            timestamp: 77,
            msg_type: Some("file".into()),
            file_status: Some("uploading".into()),
            ..Default::default()
        };
        let message = Message::try_from(record).unwrap();
        assert_eq!(message.file_id(), Some("me@77"));
    }

    #[test]
    fn status_ranks_only_move_forward() {
        assert!(FileStatus::Accepted.regresses_to(FileStatus::Downloading));
        assert!(!FileStatus::Pending.regresses_to(FileStatus::Accepted));
        assert!(!FileStatus::Downloading.regresses_to(FileStatus::Downloading));
    }

    #[test]
    fn content_uri_names_are_decoded() {
        let handle = FileHandle::from_picked(
            "content://com.android.providers/document/primary%3ADownload%2Freport.pdf",
        );
        assert!(matches!(handle, FileHandle::ContentUri(_)));
        assert_eq!(handle.display_name(), "Download/report.pdf");
    }
}
