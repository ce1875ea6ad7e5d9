use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::TransportKind;
use crate::error::{SyncError, SyncResult};
use crate::models::{FileHandle, Message, MessageRecord, Peer, Settings, ThemeInfo, UploadReceipt};

use super::upload::{upload_to_peer, FileUpload};
use super::{Backend, ByteStream, UploadIntent, FALLBACK_DOWNLOAD_PATH};

/// Backend for the web build: a local HTTP server that can only be polled.
#[derive(Clone)]
pub struct HttpBackend {
    base_url: String,
    client: Client,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        let base = sanitize_base_url(base_url.into())?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::Unreachable(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            base_url: base,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn url(&self, path: &str) -> SyncResult<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|err| SyncError::rejected(format!("invalid base URL: {err}")))?;
        url.set_path(path.trim_start_matches('/'));
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> SyncResult<T> {
        let url = self.url(path)?;
        let response = self.client.get(url).send().await?;
        read_json(response).await
    }

    async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> SyncResult<T> {
        let url = self.url(path)?;
        let response = self.client.post(url).json(body).send().await?;
        read_json(response).await
    }

    async fn post_ack<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> SyncResult<()> {
        let _: Value = self.post_json(path, body).await?;
        Ok(())
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn identity_name(&self) -> SyncResult<String> {
        let value: Value = self.get_json("/api/get_my_name").await?;
        string_field(&value, "name")
    }

    async fn identity_id(&self) -> SyncResult<String> {
        let value: Value = self.get_json("/api/get_my_id").await?;
        string_field(&value, "id")
    }

    async fn update_identity_name(&self, name: &str) -> SyncResult<String> {
        let value: Value = self
            .post_json("/api/update_my_name", &json!({ "name": name }))
            .await?;
        // Older servers only acknowledge; the requested name is then authoritative.
        Ok(string_field(&value, "name").unwrap_or_else(|_| name.to_string()))
    }

    async fn settings(&self) -> SyncResult<Settings> {
        self.get_json("/api/get_settings").await
    }

    async fn update_settings(&self, download_path: &str) -> SyncResult<()> {
        self.post_ack(
            "/api/update_settings",
            &json!({ "download_path": download_path }),
        )
        .await
    }

    async fn default_download_path(&self) -> SyncResult<String> {
        // The server decides where files land; the browser-side default is fixed.
        Ok(FALLBACK_DOWNLOAD_PATH.to_string())
    }

    async fn list_peers(&self) -> SyncResult<Vec<Peer>> {
        let peers: Option<Vec<Peer>> = self.get_json("/api/get_peers").await?;
        Ok(peers.unwrap_or_default())
    }

    async fn send_message(&self, peer_id: &str, peer_addr: &str, content: &str) -> SyncResult<()> {
        self.post_ack(
            "/api/send_message",
            &json!({
                "peer_id": peer_id,
                "peer_addr": peer_addr,
                "content": content,
            }),
        )
        .await
    }

    async fn history(&self, peer_id: &str) -> SyncResult<Vec<Message>> {
        let value: Value = self
            .get_json(&format!("/api/chat_history/{peer_id}"))
            .await?;
        decode_history(value)
    }

    async fn send_file(
        &self,
        peer_id: &str,
        peer_addr: &str,
        file: FileHandle,
    ) -> SyncResult<UploadReceipt> {
        let upload = FileUpload::from_handle(file).await?;
        let sender_id = self.identity_id().await?;
        tracing::debug!(peer_id, peer_addr, sender_id = %sender_id, "sending file over HTTP");
        upload_to_peer(&self.client, peer_addr, &sender_id, upload).await
    }

    async fn accept_file(&self, file_id: &str, save_path: Option<&str>) -> SyncResult<()> {
        let url = self.url(&format!("/api/accept_file/{file_id}"))?;
        let body = match save_path {
            Some(path) => json!({ "save_path": path }),
            None => json!({}),
        };
        let response = self.client.post(url).json(&body).send().await?;
        if response.status() == StatusCode::ACCEPTED {
            return Err(SyncError::Busy);
        }
        let _: Option<Value> = read_json(response).await?;
        Ok(())
    }

    async fn download_file(&self, file_id: &str) -> SyncResult<ByteStream> {
        let url = self.url(&format!("/api/download/{file_id}"))?;
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(rejection(status, &text));
        }
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(SyncError::from));
        Ok(Box::pin(stream))
    }

    async fn list_themes(&self) -> SyncResult<Vec<ThemeInfo>> {
        self.get_json("/api/get_theme_list").await
    }

    async fn theme_css(&self, name: &str) -> SyncResult<String> {
        let url = self.url(&format!("/api/get_theme_css/{name}"))?;
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(rejection(status, &text));
        }
        Ok(text)
    }

    async fn save_current_theme(&self, name: &str) -> SyncResult<()> {
        self.post_ack("/api/save_current_theme", &json!({ "theme_name": name }))
            .await
    }

    async fn current_theme(&self) -> SyncResult<String> {
        let value: Value = self.get_json("/api/get_current_theme").await?;
        string_field(&value, "theme")
    }

    async fn create_upload_record(&self, intent: &UploadIntent) -> SyncResult<()> {
        self.post_ack(
            "/api/create_upload_record",
            &json!({
                "file_name": intent.file_name,
                "timestamp": intent.timestamp,
                "receiver_id": intent.receiver_id,
            }),
        )
        .await
    }

    async fn update_upload_status(&self, intent: &UploadIntent, status: &str) -> SyncResult<()> {
        self.post_ack(
            "/api/update_upload_status",
            &json!({
                "file_name": intent.file_name,
                "timestamp": intent.timestamp,
                "status": status,
            }),
        )
        .await
    }

    async fn delete_upload_record(&self, intent: &UploadIntent) -> SyncResult<()> {
        self.post_ack(
            "/api/delete_upload_record",
            &json!({
                "file_name": intent.file_name,
                "timestamp": intent.timestamp,
            }),
        )
        .await
    }
}

/// Decodes a response body, turning non-2xx statuses and `{"error": ..}`
/// payloads into [`SyncError::Rejected`]. An empty body decodes as JSON
/// `null`.
pub(crate) async fn read_json<T: DeserializeOwned>(response: Response) -> SyncResult<T> {
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        return Err(rejection(status, &text));
    }
    let value: Value = if text.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text)?
    };
    if let Some(message) = value.get("error").and_then(Value::as_str) {
        return Err(SyncError::rejected(message));
    }
    Ok(serde_json::from_value(value)?)
}

fn rejection(status: StatusCode, body: &str) -> SyncError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("error")
                .or_else(|| value.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("HTTP {}: {}", status.as_u16(), body.trim()));
    SyncError::Rejected(message)
}

fn string_field(value: &Value, field: &str) -> SyncResult<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SyncError::Malformed(format!("missing '{field}' in response")))
}

/// Converts raw history records, skipping any that do not parse so one bad
/// row cannot blank the whole conversation. Accepts both the bare array and
/// the `{"messages": [...]}` wrapper.
pub(crate) fn decode_history(records: Value) -> SyncResult<Vec<Message>> {
    let rows = match records {
        Value::Null => return Ok(Vec::new()),
        Value::Array(rows) => rows,
        Value::Object(mut map) if map.contains_key("messages") => {
            return decode_history(map.remove("messages").unwrap_or(Value::Null))
        }
        other => {
            return Err(SyncError::Malformed(format!(
                "expected a list of messages, got {other}"
            )))
        }
    };
    let mut messages = Vec::with_capacity(rows.len());
    for row in rows {
        let converted = serde_json::from_value::<MessageRecord>(row)
            .map_err(|err| err.to_string())
            .and_then(Message::try_from);
        match converted {
            Ok(message) => messages.push(message),
            Err(err) => tracing::warn!(error = %err, "skipping unreadable history record"),
        }
    }
    Ok(messages)
}

fn sanitize_base_url(mut base: String) -> SyncResult<String> {
    if !base.starts_with("http://") && !base.starts_with("https://") {
        base = format!("http://{base}");
    }
    // Remove trailing slash for consistency
    while base.ends_with('/') {
        base.pop();
    }
    Url::parse(&base).map_err(|err| SyncError::rejected(format!("invalid base URL: {err}")))?;
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileStatus;

    #[test]
    fn base_url_gets_scheme_and_loses_trailing_slash() {
        let backend = HttpBackend::new("127.0.0.1:8080//", Duration::from_secs(1)).unwrap();
        assert_eq!(backend.base_url(), "http://127.0.0.1:8080");
        assert_eq!(
            backend.url("/api/chat_history/p1").unwrap().as_str(),
            "http://127.0.0.1:8080/api/chat_history/p1"
        );
    }

    #[test]
    fn history_skips_bad_rows() {
        let records = json!([
            {"from_id": "p1", "content": "hi", "timestamp": 1, "msg_type": "text"},
            {"from_id": "p1", "content": "x", "timestamp": 2, "msg_type": "file", "file_status": "teleporting"},
            {"content": "no sender"},
            {"from_id": "me", "content": "a.txt", "timestamp": 3, "msg_type": "file", "file_id": "f1", "file_status": "downloading"}
        ]);
        let messages = decode_history(records).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].file_status(), Some(FileStatus::Downloading));
    }

    #[test]
    fn history_unwraps_messages_object() {
        let wrapped = json!({"messages": [{"from_id": "p1", "content": "hi", "timestamp": 1}]});
        assert_eq!(decode_history(wrapped).unwrap().len(), 1);
        assert!(decode_history(Value::Null).unwrap().is_empty());
        assert!(matches!(
            decode_history(json!("nope")),
            Err(SyncError::Malformed(_))
        ));
    }

    #[test]
    fn rejection_prefers_error_payload() {
        let err = rejection(StatusCode::BAD_REQUEST, r#"{"error":"name taken"}"#);
        assert_eq!(err.to_string(), "name taken");
        let err = rejection(StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert_eq!(err.to_string(), "HTTP 500: boom");
    }
}
