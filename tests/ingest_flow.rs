//! End-to-end flows through ingest, the stream, the processor, and the
//! transcript pipeline.

#![allow(clippy::expect_used, reason = "test code")]
#![allow(clippy::unwrap_used, reason = "test code")]

mod common;

use axum::http::StatusCode;
use common::{SAMPLE_TRANSCRIPT, session_end_event, session_start_event, test_server};
use serde_json::json;
use traceline::blob::BlobStore;
use traceline::core::lifecycle::{Lifecycle, ParseStatus};

#[tokio::test]
async fn test_happy_path_start_upload_end_reaches_parsed() {
    let server = test_server().await;

    let (status, body) = server
        .post_json(
            "/api/events/ingest",
            json!({"events": [session_start_event("A", "cc-1", "github.com/u/r")]}),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["ingested"], 1);
    server.drain_stream().await;

    let session = server.store.get_session("cc-1").await.unwrap().unwrap();
    assert_eq!(session.lifecycle, Lifecycle::Detected);
    assert_eq!(session.git_branch.as_deref(), Some("main"));

    let (status, body) = server
        .post_raw("/api/sessions/cc-1/transcript/upload", SAMPLE_TRANSCRIPT)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "uploaded");
    assert_eq!(body["pipeline_triggered"], false, "session not ended yet");

    let (status, _body) = server
        .post_json(
            "/api/events/ingest",
            json!({"events": [session_end_event("B", "cc-1", "github.com/u/r")]}),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    server.drain_stream().await;

    server.wait_for_lifecycle("cc-1", Lifecycle::Parsed).await;

    let session = server.store.get_session("cc-1").await.unwrap().unwrap();
    assert_eq!(session.parse_status, ParseStatus::Completed);
    assert_eq!(session.total_messages, 2);
    assert_eq!(session.end_reason.as_deref(), Some("exit"));
    assert!(session.ended_at.is_some());

    let messages = server.store.list_transcript_messages("cc-1").await.unwrap();
    assert!(!messages.is_empty());
    let ordinals: Vec<i64> = messages.iter().map(|m| m.ordinal).collect();
    assert_eq!(ordinals, (1..=ordinals.len() as i64).collect::<Vec<_>>());

    let blocks = server.store.list_content_blocks("cc-1").await.unwrap();
    assert!(!blocks.is_empty());
}

#[tokio::test]
async fn test_no_transcript_stops_at_ended() {
    let server = test_server().await;

    server
        .post_json(
            "/api/events/ingest",
            json!({"events": [
                session_start_event("A", "cc-2", "github.com/u/r"),
                session_end_event("B", "cc-2", "github.com/u/r"),
            ]}),
        )
        .await;
    server.drain_stream().await;

    // Give any stray pipeline task a moment; none should run.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let session = server.store.get_session("cc-2").await.unwrap().unwrap();
    assert_eq!(session.lifecycle, Lifecycle::Ended);
    assert_eq!(session.parse_status, ParseStatus::Pending);
    assert!(server
        .store
        .list_transcript_messages("cc-2")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_duplicate_event_id_is_reported_and_stored_once() {
    let server = test_server().await;
    let event = session_start_event("A", "cc-3", "github.com/u/r");

    let (status, body) = server
        .post_json("/api/events/ingest", json!({"events": [event.clone()]}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["ingested"], 1);
    server.drain_stream().await;

    let (status, body) = server
        .post_json("/api/events/ingest", json!({"events": [event]}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["duplicates"], 1);
    assert_eq!(body["ingested"], 0);
    assert_eq!(body["results"][0]["status"], "duplicate");
    server.drain_stream().await;

    let (_, timeline) = server.get("/api/timeline?session_id=cc-3").await;
    assert_eq!(timeline["events"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_duplicate_surviving_to_the_stream_is_deduped_by_the_processor() {
    let server = test_server().await;
    let event = session_start_event("A", "cc-4", "github.com/u/r");

    // Publish twice without draining between: both reach the stream.
    server
        .post_json("/api/events/ingest", json!({"events": [event.clone()]}))
        .await;
    server
        .post_json("/api/events/ingest", json!({"events": [event]}))
        .await;
    server.drain_stream().await;

    let (_, timeline) = server.get("/api/timeline?session_id=cc-4").await;
    assert_eq!(timeline["events"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_git_commit_correlates_to_active_session() {
    let server = test_server().await;

    server
        .post_json(
            "/api/events/ingest",
            json!({"events": [session_start_event("A", "cc-5", "github.com/u/r")]}),
        )
        .await;
    server.drain_stream().await;

    let (status, _) = server
        .post_json(
            "/api/events/ingest",
            json!({"events": [{
                "id": "C",
                "type": "git.commit",
                "timestamp": chrono::Utc::now(),
                "device_id": "d1",
                "workspace_id": "github.com/u/r",
                "session_id": null,
                "data": {
                    "hash": "abc123",
                    "message": "fix login",
                    "branch": "main",
                    "files_changed": 2,
                    "insertions": 10,
                    "deletions": 3,
                },
            }]}),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    server.drain_stream().await;

    let (_, body) = server.get("/api/git?session_id=cc-5").await;
    let activity = body["activity"].as_array().unwrap();
    assert_eq!(activity.len(), 1);
    assert_eq!(activity[0]["commit_sha"], "abc123");
    assert_eq!(activity[0]["session_id"], "cc-5");
}

#[tokio::test]
async fn test_session_end_for_unknown_session_creates_nothing() {
    let server = test_server().await;

    let (status, _) = server
        .post_json(
            "/api/events/ingest",
            json!({"events": [session_end_event("B", "cc-ghost", "github.com/u/r")]}),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    server.drain_stream().await;

    assert!(server.store.get_session("cc-ghost").await.unwrap().is_none());
}

#[tokio::test]
async fn test_stuck_recovery_reruns_the_pipeline() {
    let server = test_server().await;

    // A session that ended with a transcript but whose pipeline never ran.
    server
        .post_json(
            "/api/events/ingest",
            json!({"events": [session_start_event("A", "cc-6", "github.com/u/r")]}),
        )
        .await;
    server.drain_stream().await;
    server
        .post_raw("/api/sessions/cc-6/transcript/upload", SAMPLE_TRANSCRIPT)
        .await;
    server
        .post_json(
            "/api/events/ingest",
            json!({"events": [session_end_event("B", "cc-6", "github.com/u/r")]}),
        )
        .await;
    server.drain_stream().await;
    server.wait_for_lifecycle("cc-6", Lifecycle::Parsed).await;

    // Second session: stuck at ended for 48h with a transcript.
    server
        .post_json(
            "/api/events/ingest",
            json!({"events": [session_start_event("C", "cc-7", "github.com/u/r")]}),
        )
        .await;
    server.drain_stream().await;
    let key = traceline::blob::transcript_key("github.com/u/r", "cc-7");
    server
        .blobs
        .put(&key, SAMPLE_TRANSCRIPT.as_bytes())
        .await
        .unwrap();
    server.store.set_transcript_key("cc-7", &key).await.unwrap();
    server
        .store
        .transition(
            "cc-7",
            Lifecycle::Ended,
            &[Lifecycle::Detected],
            traceline::store::TransitionUpdates::default(),
        )
        .await
        .unwrap();
    sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = 'cc-7'")
        .bind((chrono::Utc::now() - chrono::Duration::hours(48)).to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
        .execute(&server.store.pool())
        .await
        .unwrap();

    // Dry run reports without mutating.
    let report = server.sweeper.run_once(true).await.unwrap();
    assert_eq!(report.candidates.len(), 1);
    assert!(report.retriggered.is_empty());
    let still = server.store.get_session("cc-7").await.unwrap().unwrap();
    assert_eq!(still.lifecycle, Lifecycle::Ended);

    // Real sweep advances the session past ended.
    let report = server.sweeper.run_once(false).await.unwrap();
    assert_eq!(report.retriggered, vec!["cc-7".to_owned()]);
    let session = server.store.get_session("cc-7").await.unwrap().unwrap();
    assert_eq!(session.lifecycle, Lifecycle::Parsed);
}

#[tokio::test]
async fn test_stuck_session_without_transcript_is_failed() {
    let server = test_server().await;

    server
        .post_json(
            "/api/events/ingest",
            json!({"events": [
                session_start_event("A", "cc-8", "github.com/u/r"),
                session_end_event("B", "cc-8", "github.com/u/r"),
            ]}),
        )
        .await;
    server.drain_stream().await;
    sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = 'cc-8'")
        .bind((chrono::Utc::now() - chrono::Duration::hours(48)).to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
        .execute(&server.store.pool())
        .await
        .unwrap();

    let report = server.sweeper.run_once(false).await.unwrap();
    assert_eq!(report.failed, vec!["cc-8".to_owned()]);

    let session = server.store.get_session("cc-8").await.unwrap().unwrap();
    assert_eq!(session.lifecycle, Lifecycle::Failed);
    assert_eq!(session.parse_status, ParseStatus::Failed);
    assert_eq!(session.parse_error.as_deref(), Some("no transcript_s3_key"));
}

#[tokio::test]
async fn test_concurrent_pipeline_runs_converge_to_one_result() {
    let server = test_server().await;

    server
        .post_json(
            "/api/events/ingest",
            json!({"events": [session_start_event("A", "cc-9", "github.com/u/r")]}),
        )
        .await;
    server.drain_stream().await;
    server
        .post_raw("/api/sessions/cc-9/transcript/upload", SAMPLE_TRANSCRIPT)
        .await;
    server
        .store
        .transition(
            "cc-9",
            Lifecycle::Ended,
            &[Lifecycle::Detected],
            traceline::store::TransitionUpdates::default(),
        )
        .await
        .unwrap();

    let first = server.pipeline.run("cc-9");
    let second = server.pipeline.run("cc-9");
    let (first, second) = tokio::join!(first, second);
    first.unwrap();
    second.unwrap();

    let session = server.store.get_session("cc-9").await.unwrap().unwrap();
    assert_eq!(session.lifecycle, Lifecycle::Parsed);
    assert_eq!(session.total_messages, 2);

    // Exactly one copy of each message row.
    let messages = server.store.list_transcript_messages("cc-9").await.unwrap();
    assert_eq!(messages.len(), 2);

    // Running again after completion is a clean no-op.
    server.pipeline.run("cc-9").await.unwrap();
    let session_after = server.store.get_session("cc-9").await.unwrap().unwrap();
    assert_eq!(session_after.total_messages, 2);
    assert_eq!(session_after.lifecycle, Lifecycle::Parsed);
}
