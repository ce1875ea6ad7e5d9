//! Peer-to-peer byte upload.
//!
//! Files always travel straight to the receiving peer's `/api/upload`, never
//! through a central server. The receiver's form parser reads fields in
//! order and needs the sender id before it starts consuming the file body.

use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::Client;

use crate::error::{SyncError, SyncResult};
use crate::models::{FileHandle, UploadReceipt};

use super::http::read_json;

pub const SENDER_FIELD: &str = "peer_id";
pub const FILE_FIELD: &str = "file";
/// Order the multipart fields are written in.
pub const UPLOAD_FIELD_ORDER: [&str; 2] = [SENDER_FIELD, FILE_FIELD];

#[derive(Debug, Clone)]
pub struct FileUpload {
    pub file_name: String,
    pub data: Bytes,
}

impl FileUpload {
    /// Reads a handle into memory. Content URIs cannot be read here; the
    /// native backend resolves them through the host bridge first.
    pub async fn from_handle(handle: FileHandle) -> SyncResult<Self> {
        match handle {
            FileHandle::Bytes { name, data } => Ok(Self {
                file_name: name,
                data,
            }),
            FileHandle::Path(path) => {
                let file_name = FileHandle::Path(path.clone()).display_name();
                let data = tokio::fs::read(&path).await.map_err(|err| {
                    SyncError::rejected(format!("cannot read {}: {err}", path.display()))
                })?;
                Ok(Self {
                    file_name,
                    data: Bytes::from(data),
                })
            }
            FileHandle::ContentUri(uri) => Err(SyncError::rejected(format!(
                "{uri} has no readable path on this transport"
            ))),
        }
    }
}

pub fn peer_upload_url(peer_addr: &str) -> String {
    let base = if peer_addr.starts_with("http://") || peer_addr.starts_with("https://") {
        peer_addr.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", peer_addr.trim_end_matches('/'))
    };
    format!("{base}/api/upload")
}

pub fn upload_form(sender_id: &str, upload: &FileUpload) -> Form {
    let part = Part::bytes(upload.data.to_vec()).file_name(upload.file_name.clone());
    Form::new()
        .text(SENDER_FIELD, sender_id.to_string())
        .part(FILE_FIELD, part)
}

pub async fn upload_to_peer(
    client: &Client,
    peer_addr: &str,
    sender_id: &str,
    upload: FileUpload,
) -> SyncResult<UploadReceipt> {
    let url = peer_upload_url(peer_addr);
    tracing::debug!(
        url = %url,
        file = %upload.file_name,
        size = upload.data.len(),
        "uploading file to peer"
    );
    let response = client
        .post(&url)
        .multipart(upload_form(sender_id, &upload))
        .send()
        .await?;
    let mut receipt: UploadReceipt = read_json(response).await?;
    if receipt.file_name.is_empty() {
        receipt.file_name = upload.file_name.clone();
    }
    if receipt.file_size == 0 {
        receipt.file_size = upload.data.len() as u64;
    }
    Ok(receipt)
}
