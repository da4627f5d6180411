//! Shared test harness: a fully wired in-process server over a temporary
//! database and an in-memory blob store.

#![allow(clippy::expect_used, reason = "test code")]
#![allow(clippy::unwrap_used, reason = "test code")]
#![allow(dead_code, reason = "not every test file uses every helper")]

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use http_body_util::BodyExt;
use tower::ServiceExt;

use traceline::api::http::{AppState, router};
use traceline::api::ws::{Broadcaster, WsConfig};
use traceline::blob::{BlobStore, MemoryBlobStore};
use traceline::config::Config;
use traceline::core::event::{Event, EventType};
use traceline::core::lifecycle::Lifecycle;
use traceline::ingest::EventProcessor;
use traceline::pipeline::{RecoveryConfig, RecoverySweeper, TranscriptPipeline};
use traceline::store::SqliteStore;
use traceline::stream::{SqliteStream, StreamTransport};

pub const API_KEY: &str = "test-key";

/// A minimal but realistic transcript blob.
pub const SAMPLE_TRANSCRIPT: &str = concat!(
    r#"{"type":"user","timestamp":"2026-08-01T10:00:00Z","message":{"role":"user","content":"fix the login bug"}}"#,
    "\n",
    r#"{"type":"assistant","timestamp":"2026-08-01T10:00:05Z","costUSD":0.01,"message":{"type":"message","id":"msg_1","role":"assistant","model":"claude-sonnet-4-5","usage":{"input_tokens":10,"output_tokens":5},"content":[{"type":"text","text":"Done."}]}}"#,
    "\n",
);

pub struct TestServer {
    pub store: Arc<SqliteStore>,
    pub transport: Arc<SqliteStream>,
    pub processor: Arc<EventProcessor>,
    pub pipeline: Arc<TranscriptPipeline>,
    pub sweeper: Arc<RecoverySweeper>,
    pub blobs: Arc<MemoryBlobStore>,
    pub app: Router,
    _dir: tempfile::TempDir,
}

pub async fn test_server() -> TestServer {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(
        SqliteStore::new(&dir.path().join("test.db"))
            .await
            .expect("store"),
    );
    let transport = Arc::new(SqliteStream::new(store.pool()));
    let blobs = Arc::new(MemoryBlobStore::new());
    let broadcaster = Arc::new(Broadcaster::new(WsConfig::default()));

    let pipeline = Arc::new(TranscriptPipeline::new(
        Arc::clone(&store),
        Arc::clone(&blobs) as Arc<dyn BlobStore>,
        None,
        Arc::clone(&broadcaster),
    ));
    let processor = Arc::new(EventProcessor::new(
        Arc::clone(&store),
        Arc::clone(&pipeline),
        Arc::clone(&broadcaster),
        chrono::Duration::hours(24),
    ));
    let sweeper = Arc::new(RecoverySweeper::new(
        Arc::clone(&store),
        Arc::clone(&pipeline),
        RecoveryConfig {
            sweep_interval: Duration::from_secs(300),
            stuck_threshold: Duration::from_secs(3600),
        },
    ));

    let config = Arc::new(Config {
        api_key: API_KEY.to_owned(),
        ..Default::default()
    });

    let state = AppState {
        store: Arc::clone(&store),
        transport: Arc::clone(&transport) as Arc<dyn StreamTransport>,
        broadcaster,
        blobs: Arc::clone(&blobs) as Arc<dyn BlobStore>,
        pipeline: Arc::clone(&pipeline),
        sweeper: Arc::clone(&sweeper),
        config,
        started_at: Instant::now(),
    };

    TestServer {
        store,
        transport,
        processor,
        pipeline,
        sweeper,
        blobs,
        app: router(state),
        _dir: dir,
    }
}

impl TestServer {
    /// Process everything currently published to the stream, acking as the
    /// consumer loop would.
    pub async fn drain_stream(&self) {
        loop {
            let entries = self
                .transport
                .read_group("test-consumer", 10, Duration::from_millis(20))
                .await
                .expect("read_group");
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                let event = entry.event().expect("decode entry");
                self.processor.process(&event).await.expect("process");
                self.transport.ack(&entry.stream_id).await.expect("ack");
            }
        }
    }

    /// Poll until the session reaches the wanted lifecycle (background
    /// pipeline runs are asynchronous).
    pub async fn wait_for_lifecycle(&self, session_id: &str, wanted: Lifecycle) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let session = self.store.get_session(session_id).await.expect("get");
            if let Some(session) = session {
                if session.lifecycle == wanted {
                    return;
                }
            }
            assert!(
                Instant::now() < deadline,
                "session {session_id} never reached {wanted}"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn request(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.expect("request")
    }

    /// Authorized JSON POST.
    pub async fn post_json(&self, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let response = self
            .request(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header(header::AUTHORIZATION, format!("Bearer {API_KEY}"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await;
        read_json(response).await
    }

    /// Authorized GET.
    pub async fn get(&self, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = self
            .request(
                Request::builder()
                    .uri(uri)
                    .header(header::AUTHORIZATION, format!("Bearer {API_KEY}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        read_json(response).await
    }

    /// Authorized PATCH with a JSON body.
    pub async fn patch_json(&self, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let response = self
            .request(
                Request::builder()
                    .method("PATCH")
                    .uri(uri)
                    .header(header::AUTHORIZATION, format!("Bearer {API_KEY}"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await;
        read_json(response).await
    }

    /// Authorized raw-body POST (transcript upload).
    pub async fn post_raw(&self, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let response = self
            .request(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header(header::AUTHORIZATION, format!("Bearer {API_KEY}"))
                    .body(Body::from(body.to_owned()))
                    .unwrap(),
            )
            .await;
        read_json(response).await
    }
}

pub async fn read_json(response: Response<Body>) -> (StatusCode, serde_json::Value) {
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

/// Wire-shaped session.start event.
pub fn session_start_event(event_id: &str, cc_session_id: &str, workspace: &str) -> Event {
    Event {
        id: event_id.to_owned(),
        event_type: EventType::SessionStart,
        timestamp: chrono::Utc::now(),
        device_id: "d1".to_owned(),
        workspace_id: workspace.to_owned(),
        session_id: Some(cc_session_id.to_owned()),
        data: serde_json::json!({
            "cc_session_id": cc_session_id,
            "cwd": "/r",
            "git_branch": "main",
            "source": "startup",
            "transcript_path": "/r/.claude/t.jsonl",
        }),
        ingested_at: None,
        blob_refs: vec![],
    }
}

/// Wire-shaped session.end event.
pub fn session_end_event(event_id: &str, cc_session_id: &str, workspace: &str) -> Event {
    Event {
        id: event_id.to_owned(),
        event_type: EventType::SessionEnd,
        timestamp: chrono::Utc::now(),
        device_id: "d1".to_owned(),
        workspace_id: workspace.to_owned(),
        session_id: Some(cc_session_id.to_owned()),
        data: serde_json::json!({
            "cc_session_id": cc_session_id,
            "duration_ms": 60_000,
            "end_reason": "exit",
        }),
        ingested_at: None,
        blob_refs: vec![],
    }
}
