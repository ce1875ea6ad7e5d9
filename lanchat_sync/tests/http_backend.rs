use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use lanchat_sync::config::{SyncConfig, TransferConfig};
use lanchat_sync::models::{FileHandle, FileStatus};
use lanchat_sync::transport::upload::UPLOAD_FIELD_ORDER;
use lanchat_sync::testing::ScriptedBridge;
use lanchat_sync::transport::{Facade, NAME_UNAVAILABLE};
use lanchat_sync::{Session, SyncError};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::net::TcpListener;

#[derive(Default)]
struct Recorded {
    accept_calls: usize,
    busy_responses: usize,
    accept_bodies: Vec<Value>,
    upload_fields: Vec<(String, String)>,
    journal: Vec<(String, Value)>,
    file_status: String,
}

type Shared = Arc<Mutex<Recorded>>;

struct FakeServer {
    addr: SocketAddr,
    state: Shared,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeServer {
    fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn peer_addr(&self) -> String {
        self.addr.to_string()
    }

    fn facade(&self) -> Facade {
        Facade::http(&SyncConfig::http(self.base_url())).expect("facade")
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn spawn_server(busy_responses: usize) -> FakeServer {
    let state: Shared = Arc::new(Mutex::new(Recorded {
        busy_responses,
        file_status: "pending".into(),
        ..Recorded::default()
    }));
    let app = Router::new()
        .route("/api/get_my_name", get(|| async { Json(json!({"name": "neo"})) }))
        .route("/api/get_my_id", get(|| async { Json(json!({"id": "self-1"})) }))
        .route("/api/get_peers", get(peers))
        .route("/api/chat_history/:peer_id", get(history))
        .route("/api/send_message", post(send_message))
        .route("/api/update_my_name", post(|| async { Json(json!({"success": true})) }))
        .route("/api/accept_file/:file_id", post(accept_file))
        .route("/api/upload", post(upload))
        .route("/api/download/:file_id", get(download))
        .route("/api/create_upload_record", post(journal_create))
        .route("/api/update_upload_status", post(journal_update))
        .route("/api/delete_upload_record", post(journal_delete))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    FakeServer {
        addr,
        state,
        handle,
    }
}

async fn peers() -> Json<Value> {
    Json(json!([
        {"id": "p1", "name": "alice", "addr": "10.0.0.2:8080", "last_seen": 100, "is_offline": false},
        {"id": "p2", "name": "bob", "addr": "10.0.0.3:8080", "last_seen": 40, "is_offline": true}
    ]))
}

async fn history(State(state): State<Shared>, Path(peer_id): Path<String>) -> Json<Value> {
    let status = state.lock().unwrap().file_status.clone();
    if peer_id != "p1" {
        return Json(json!({"messages": []}));
    }
    Json(json!({"messages": [
        {"from_id": "p1", "content": "hello", "timestamp": 10, "msg_type": "text"},
        {"from_id": "p1", "content": "bad", "timestamp": 11, "msg_type": "file", "file_status": "???"},
        {"from_id": "p1", "content": "movie.mkv", "timestamp": 12, "msg_type": "file",
         "file_id": "f1", "file_name": "movie.mkv", "file_size": 900, "file_status": status}
    ]}))
}

async fn send_message(Json(body): Json<Value>) -> Response {
    if body["content"] == "boom" {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "peer unreachable"}))).into_response();
    }
    Json(json!({"success": true})).into_response()
}

async fn accept_file(
    State(state): State<Shared>,
    Path(_file_id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let mut state = state.lock().unwrap();
    state.accept_calls += 1;
    state.accept_bodies.push(body);
    if state.accept_calls <= state.busy_responses {
        return (StatusCode::ACCEPTED, Json(json!({"status": "downloading"}))).into_response();
    }
    state.file_status = "accepted".into();
    Json(json!({"success": true})).into_response()
}

async fn upload(State(state): State<Shared>, mut multipart: Multipart) -> Json<Value> {
    let mut file_name = String::new();
    let mut size = 0usize;
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        if let Some(original) = field.file_name() {
            file_name = original.to_string();
        }
        let data = field.bytes().await.unwrap();
        let value = if name == "file" {
            size = data.len();
            file_name.clone()
        } else {
            String::from_utf8_lossy(&data).into_owned()
        };
        state.lock().unwrap().upload_fields.push((name, value));
    }
    Json(json!({"file_id": "f-up-1", "file_name": file_name, "file_size": size}))
}

async fn download(Path(file_id): Path<String>) -> Response {
    if file_id == "missing" {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "file not found"}))).into_response();
    }
    vec![7u8; 4096].into_response()
}

async fn journal_create(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    state.lock().unwrap().journal.push(("create".into(), body));
    Json(json!({"success": true}))
}

async fn journal_update(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    state.lock().unwrap().journal.push(("update".into(), body));
    Json(json!({"success": true}))
}

async fn journal_delete(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    state.lock().unwrap().journal.push(("delete".into(), body));
    Json(json!({"success": true}))
}

#[tokio::test]
async fn identity_and_roster_round_trip() {
    let server = spawn_server(0).await;
    let facade = server.facade();
    assert_eq!(facade.identity_name().await, "neo");
    assert_eq!(facade.identity_id().await.unwrap(), "self-1");

    let peers = facade.list_peers().await;
    assert_eq!(peers.len(), 2);
    assert!(peers[0].online);
    assert!(!peers[1].online);
    assert_eq!(peers[1].address, "10.0.0.3:8080");

    assert_eq!(facade.update_identity_name(" trinity ").await.unwrap(), "trinity");
}

#[tokio::test]
async fn history_is_unwrapped_and_bad_records_skipped() {
    let server = spawn_server(0).await;
    let history = server.facade().history("p1").await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content, "hello");
    assert_eq!(history[1].file_id(), Some("f1"));
    assert_eq!(history[1].file_status(), Some(FileStatus::Pending));
}

#[tokio::test]
async fn error_payload_becomes_rejection() {
    let server = spawn_server(0).await;
    let err = server
        .facade()
        .send_message("p1", "10.0.0.2:8080", "boom")
        .await
        .unwrap_err();
    assert!(matches!(&err, SyncError::Rejected(message) if message == "peer unreachable"));
}

#[tokio::test]
async fn accepted_status_means_busy() {
    let server = spawn_server(1).await;
    let facade = server.facade();
    assert!(matches!(
        facade.accept_file("f1", Some("/srv/downloads")).await,
        Err(SyncError::Busy)
    ));
    facade.accept_file("f1", None).await.unwrap();

    let state = server.state.lock().unwrap();
    assert_eq!(state.accept_bodies[0], json!({"save_path": "/srv/downloads"}));
    assert_eq!(state.accept_bodies[1], json!({}));
}

#[tokio::test]
async fn upload_writes_sender_before_file() {
    let server = spawn_server(0).await;
    let receipt = server
        .facade()
        .send_file(
            "p1",
            &server.peer_addr(),
            FileHandle::Bytes {
                name: "report.pdf".into(),
                data: bytes::Bytes::from_static(b"%PDF-1.7 fake"),
            },
        )
        .await
        .unwrap();
    assert_eq!(receipt.file_id, "f-up-1");
    assert_eq!(receipt.file_name, "report.pdf");
    assert_eq!(receipt.file_size, 13);

    let fields = server.state.lock().unwrap().upload_fields.clone();
    let names: Vec<&str> = fields.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, UPLOAD_FIELD_ORDER.to_vec());
    assert_eq!(fields[0].1, "self-1");
}

#[tokio::test]
async fn native_content_uri_is_uploaded_directly_to_peer() {
    let server = spawn_server(0).await;
    let bridge = Arc::new(ScriptedBridge::default());
    bridge.respond("get_my_id", json!("native-7"));
    let uri = "content://com.android.providers.downloads.documents/document/primary%3Areport.pdf";
    bridge.set_file(uri, b"%PDF-1.7 from uri".to_vec(), None);
    let facade = Facade::native(bridge.clone(), &SyncConfig::default()).expect("facade");

    let receipt = facade
        .send_file("p1", &server.peer_addr(), FileHandle::from_picked(uri))
        .await
        .unwrap();
    assert_eq!(receipt.file_name, "report.pdf");
    assert_eq!(receipt.file_size, 17);

    let fields = server.state.lock().unwrap().upload_fields.clone();
    assert_eq!(
        fields,
        vec![
            ("peer_id".to_string(), "native-7".to_string()),
            ("file".to_string(), "report.pdf".to_string()),
        ]
    );
    let commands: Vec<String> = bridge
        .invocations()
        .into_iter()
        .map(|(command, _)| command)
        .collect();
    assert!(!commands.contains(&"send_file".to_string()));
}

#[tokio::test]
async fn download_is_streamed_to_disk() {
    let server = spawn_server(0).await;
    let facade = server.facade();
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("blob.bin");
    let written = facade.save_download("f1", dest.clone()).await.unwrap().unwrap();
    assert_eq!(written, 4096);
    assert_eq!(std::fs::metadata(&dest).unwrap().len(), 4096);

    let missing = facade
        .save_download("missing", dir.path().join("none.bin"))
        .await
        .unwrap();
    assert!(matches!(missing, Err(SyncError::Rejected(message)) if message == "file not found"));
}

#[tokio::test]
async fn unreachable_server_degrades_reads() {
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let mut config = SyncConfig::http(format!("http://127.0.0.1:{port}"));
    config.request_timeout = Duration::from_secs(2);
    let facade = Facade::http(&config).unwrap();

    assert!(facade.list_peers().await.is_empty());
    assert!(facade.history("p1").await.is_empty());
    assert_eq!(facade.identity_name().await, NAME_UNAVAILABLE);
    assert!(matches!(facade.identity_id().await, Err(SyncError::Unreachable(_))));
}

#[tokio::test]
async fn session_accepts_through_busy_server() {
    let server = spawn_server(2).await;
    let mut config = SyncConfig::http(server.base_url());
    config.transfer = TransferConfig {
        accept_backoff: Duration::from_millis(20),
        ..TransferConfig::default()
    };
    let (mut session, _updates) = Session::connect(&config, None).unwrap();

    session.refresh_peers().await;
    let opened = session.open_conversation("p1").await.unwrap();
    assert_eq!(opened[1].file_status(), Some(FileStatus::Pending));

    session.accept_file("f1", None).await.unwrap();
    assert_eq!(server.state.lock().unwrap().accept_calls, 3);

    let messages = session.messages().messages().await;
    assert_eq!(messages[1].file_status(), Some(FileStatus::Accepted));

    assert!(matches!(
        session.open_conversation("nobody").await,
        Err(SyncError::Rejected(_))
    ));
    session.shutdown().await;
}

#[tokio::test]
async fn session_upload_is_journalled() {
    let server = spawn_server(0).await;
    let config = SyncConfig::http(server.base_url());
    let (mut session, _updates) = Session::connect(&config, None).unwrap();

    // Route the "peer" upload back to the fake server.
    session.refresh_peers().await;
    session.open_conversation("p1").await.unwrap();
    let peer = lanchat_sync::models::Peer::new("p1", "alice", server.peer_addr(), true);
    let receipt = session
        .transfers()
        .send_file(
            &peer,
            FileHandle::Bytes {
                name: "a.txt".into(),
                data: bytes::Bytes::from_static(b"abc"),
            },
        )
        .await
        .unwrap();
    assert_eq!(receipt.file_id, "f-up-1");

    let journal = server.state.lock().unwrap().journal.clone();
    assert_eq!(journal.len(), 2);
    assert_eq!(journal[0].0, "create");
    assert_eq!(journal[0].1["receiver_id"], "p1");
    assert_eq!(journal[0].1["file_name"], "a.txt");
    assert_eq!(journal[1].0, "update");
    assert_eq!(journal[1].1["status"], "sent");
    session.shutdown().await;
}
