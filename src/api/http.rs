//! HTTP surface: ingest, transcript upload, reads, session patching,
//! prompts, and recovery administration.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::middleware::{AuthState, auth_middleware};
use super::protocol::{
    DismissPromptRequest, HealthChecks, HealthResponse, IngestErrorDetail, IngestRequest,
    IngestResponse, IngestResult, IngestStatus, MessageWithBlocks, PatchSessionRequest,
    PendingPromptsQuery, PromptAction, SessionsQuery, SessionsResponse, SweepRequest,
    TimelineQuery, UploadResponse,
};
use super::ws::{Broadcaster, ws_handler};
use crate::blob::{self, BlobStore};
use crate::config::Config;
use crate::core::lifecycle::Lifecycle;
use crate::pipeline::{RecoverySweeper, TranscriptPipeline};
use crate::store::{Cursor, SessionFilter, SqliteStore, TimelineFilter, sqlite::TagMutation};
use crate::stream::StreamTransport;

/// Dependency timeout for health checks.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(3);
/// Default and maximum page sizes for list endpoints.
const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 200;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteStore>,
    pub transport: Arc<dyn StreamTransport>,
    pub broadcaster: Arc<Broadcaster>,
    pub blobs: Arc<dyn BlobStore>,
    pub pipeline: Arc<TranscriptPipeline>,
    pub sweeper: Arc<RecoverySweeper>,
    pub config: Arc<Config>,
    pub started_at: Instant,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

/// Build the full router. Everything under `/api/*` except `/api/health`
/// requires the shared bearer key; `/ws` authenticates via its token query
/// parameter.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let auth = AuthState {
        api_key: Arc::from(state.config.api_key.as_str()),
    };

    let protected = Router::new()
        .route(
            "/api/events/ingest",
            post(ingest_events).layer(DefaultBodyLimit::max(state.config.ingest_max_bytes)),
        )
        .route(
            "/api/sessions/{id}/transcript/upload",
            post(upload_transcript).layer(DefaultBodyLimit::max(state.config.upload_max_bytes)),
        )
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", get(get_session).patch(patch_session))
        .route("/api/sessions/{id}/messages", get(get_session_messages))
        .route("/api/sessions/{id}/reparse", post(reparse_session))
        .route("/api/workspaces", get(list_workspaces))
        .route("/api/devices", get(list_devices))
        .route("/api/timeline", get(get_timeline))
        .route("/api/git", get(get_git_activity))
        .route("/api/prompts/pending", get(pending_prompts))
        .route("/api/prompts/dismiss", post(dismiss_prompt))
        .route("/api/recovery/sweep", post(recovery_sweep))
        .route_layer(from_fn_with_state(auth, auth_middleware));

    Router::new()
        .route("/api/health", get(health))
        .merge(protected)
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Error type for HTTP handlers, mapping the error taxonomy onto status
/// codes. Unknown errors are logged and never leak internals.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unavailable { retry_after_seconds: u64 },
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(json!({"error": message}))).into_response()
            }
            Self::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
            }
            Self::Conflict(message) => {
                (StatusCode::CONFLICT, Json(json!({"error": message}))).into_response()
            }
            Self::Unavailable {
                retry_after_seconds,
            } => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "error": "temporarily unavailable",
                    "retry_after_seconds": retry_after_seconds,
                })),
            )
                .into_response(),
            Self::Internal(err) => {
                tracing::error!(error = ?err, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "internal error"})),
                )
                    .into_response()
            }
        }
    }
}

/// GET /api/health
async fn health(State(state): State<AppState>) -> Response {
    let db_ok = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, state.store.ping())
        .await
        .map(|result| result.is_ok())
        .unwrap_or(false);
    let stream_ok = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, state.transport.ping())
        .await
        .map(|result| result.is_ok())
        .unwrap_or(false);

    let status = if !db_ok {
        "unhealthy"
    } else if !stream_ok {
        "degraded"
    } else {
        "ok"
    };
    let code = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = HealthResponse {
        status,
        checks: HealthChecks {
            db: if db_ok { "ok" } else { "down" },
            stream: if stream_ok { "ok" } else { "down" },
        },
        ws_clients: state.broadcaster.client_count(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION"),
    };

    (code, Json(body)).into_response()
}

/// POST /api/events/ingest
async fn ingest_events(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> Result<Response, ApiError> {
    if request.events.is_empty() {
        return Err(ApiError::BadRequest("event batch is empty".to_owned()));
    }
    if request.events.len() > state.config.ingest_max_batch {
        return Err(ApiError::BadRequest(format!(
            "event batch of {} exceeds maximum of {}",
            request.events.len(),
            state.config.ingest_max_batch
        )));
    }

    let ingested_at = Utc::now();
    let mut results = Vec::with_capacity(request.events.len());
    let mut errors = Vec::new();
    let mut ingested = 0usize;
    let mut duplicates = 0usize;
    let mut rejected = 0usize;
    let mut publish_attempts = 0usize;
    let mut publish_failures = 0usize;

    for (index, event) in request.events.iter().enumerate() {
        if let Err(e) = event.validate() {
            rejected += 1;
            results.push(IngestResult {
                index,
                status: IngestStatus::Rejected,
            });
            errors.push(IngestErrorDetail {
                index,
                error: e.to_string(),
            });
            continue;
        }

        // Known ids short-circuit so the response can report duplicates
        // immediately; the processor's conflict-free insert remains the
        // authoritative guard.
        if state.store.event_exists(&event.id).await? {
            duplicates += 1;
            results.push(IngestResult {
                index,
                status: IngestStatus::Duplicate,
            });
            continue;
        }

        let mut stamped = event.clone();
        stamped.ingested_at = Some(ingested_at);

        publish_attempts += 1;
        match state.transport.publish(&stamped).await {
            Ok(_) => {
                ingested += 1;
                results.push(IngestResult {
                    index,
                    status: IngestStatus::Accepted,
                });
            }
            Err(e) => {
                tracing::warn!(event_id = %event.id, error = %e, "Stream publish failed");
                publish_failures += 1;
                rejected += 1;
                results.push(IngestResult {
                    index,
                    status: IngestStatus::Rejected,
                });
                errors.push(IngestErrorDetail {
                    index,
                    error: "stream publish failed".to_owned(),
                });
            }
        }
    }

    // Total outage: nothing could be published at all.
    if publish_attempts > 0 && publish_failures == publish_attempts {
        return Err(ApiError::Unavailable {
            retry_after_seconds: 5,
        });
    }

    let body = IngestResponse {
        ingested,
        duplicates,
        rejected,
        results,
        errors: if errors.is_empty() { None } else { Some(errors) },
    };
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

/// POST /api/sessions/:id/transcript/upload
async fn upload_transcript(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let session = state
        .store
        .get_session(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Session not found: {id}")))?;

    if let Some(key) = session.transcript_s3_key {
        return Ok((
            StatusCode::OK,
            Json(UploadResponse {
                status: "already_uploaded",
                s3_key: key,
                pipeline_triggered: None,
            }),
        )
            .into_response());
    }

    let canonical = state
        .store
        .get_workspace(&session.workspace_id)
        .await?
        .map_or_else(|| session.workspace_id.clone(), |w| w.canonical_id);
    let key = blob::transcript_key(&canonical, &id);

    state
        .blobs
        .put(&key, &body)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("blob store write failed: {e}")))?;

    if !state.store.set_transcript_key(&id, &key).await? {
        // Lost an upload race; report the key that won.
        let existing = state
            .store
            .get_session(&id)
            .await?
            .and_then(|s| s.transcript_s3_key)
            .unwrap_or(key);
        return Ok((
            StatusCode::OK,
            Json(UploadResponse {
                status: "already_uploaded",
                s3_key: existing,
                pipeline_triggered: None,
            }),
        )
            .into_response());
    }

    let pipeline_triggered = session.lifecycle == Lifecycle::Ended;
    if pipeline_triggered {
        state.pipeline.spawn(id);
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            status: "uploaded",
            s3_key: key,
            pipeline_triggered: Some(pipeline_triggered),
        }),
    )
        .into_response())
}

/// GET /api/sessions
async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<SessionsQuery>,
) -> Result<Json<SessionsResponse>, ApiError> {
    let lifecycles = match &query.lifecycle {
        Some(raw) => raw
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                s.trim()
                    .parse::<Lifecycle>()
                    .map_err(|e| ApiError::BadRequest(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };

    let filter = SessionFilter {
        workspace_id: query.workspace_id,
        device_id: query.device_id,
        lifecycles,
        since: query.from,
        until: query.to,
        tag: query.tag,
    };
    let cursor = decode_cursor(query.cursor.as_deref())?;
    let limit = page_limit(query.limit);

    let page = state
        .store
        .list_sessions(&filter, cursor.as_ref(), limit)
        .await?;

    Ok(Json(SessionsResponse {
        sessions: page.items,
        has_more: page.has_more,
        next_cursor: page.next_cursor,
    }))
}

/// GET /api/sessions/:id
async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .store
        .get_session(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Session not found: {id}")))?;
    Ok(Json(json!({ "session": session })))
}

/// GET /api/sessions/:id/messages
async fn get_session_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.store.get_session(&id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Session not found: {id}")));
    }

    let messages = state.store.list_transcript_messages(&id).await?;
    let mut blocks_by_message: HashMap<String, Vec<_>> = HashMap::new();
    for block in state.store.list_content_blocks(&id).await? {
        blocks_by_message
            .entry(block.message_id.clone())
            .or_default()
            .push(block);
    }

    let messages: Vec<MessageWithBlocks> = messages
        .into_iter()
        .map(|message| {
            let mut blocks = blocks_by_message.remove(&message.id).unwrap_or_default();
            blocks.sort_by_key(|block| block.block_order);
            MessageWithBlocks { message, blocks }
        })
        .collect();

    Ok(Json(json!({ "messages": messages })))
}

/// PATCH /api/sessions/:id
async fn patch_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<PatchSessionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let tag_fields = usize::from(request.tags.is_some())
        + usize::from(request.add_tags.is_some())
        + usize::from(request.remove_tags.is_some());
    if tag_fields > 1 {
        return Err(ApiError::BadRequest(
            "provide at most one of tags, add_tags, remove_tags".to_owned(),
        ));
    }
    if tag_fields == 0 && request.summary.is_none() {
        return Err(ApiError::BadRequest("nothing to update".to_owned()));
    }

    if let Some(summary) = &request.summary {
        if !state.store.update_session_summary(&id, summary).await? {
            return Err(ApiError::NotFound(format!("Session not found: {id}")));
        }
    }

    let mutation = if let Some(tags) = request.tags {
        Some(TagMutation::Replace(tags))
    } else if let Some(tags) = request.add_tags {
        Some(TagMutation::Add(tags))
    } else {
        request.remove_tags.map(TagMutation::Remove)
    };

    if let Some(mutation) = mutation {
        if state
            .store
            .update_session_tags(&id, &mutation)
            .await?
            .is_none()
        {
            return Err(ApiError::NotFound(format!("Session not found: {id}")));
        }
    }

    let session = state
        .store
        .get_session(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Session not found: {id}")))?;
    Ok(Json(json!({ "session": session })))
}

/// POST /api/sessions/:id/reparse
async fn reparse_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let session = state
        .store
        .get_session(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Session not found: {id}")))?;

    if !state.store.reset_for_reparse(&id).await? {
        return Err(ApiError::Conflict(format!(
            "session {id} has no transcript to reparse (lifecycle: {})",
            session.lifecycle
        )));
    }

    state.pipeline.spawn(id);
    Ok((StatusCode::ACCEPTED, Json(json!({"status": "reparse_triggered"}))).into_response())
}

/// GET /api/workspaces
async fn list_workspaces(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let workspaces = state.store.list_workspaces().await?;
    Ok(Json(json!({ "workspaces": workspaces })))
}

/// GET /api/devices
async fn list_devices(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let devices = state.store.list_devices().await?;
    Ok(Json(json!({ "devices": devices })))
}

/// GET /api/timeline
async fn get_timeline(
    State(state): State<AppState>,
    Query(query): Query<TimelineQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let filter = TimelineFilter {
        workspace_id: query.workspace_id,
        session_id: query.session_id,
        since: query.from,
        until: query.to,
    };
    let cursor = decode_cursor(query.cursor.as_deref())?;
    let page = state
        .store
        .list_events(&filter, cursor.as_ref(), page_limit(query.limit))
        .await?;
    Ok(Json(json!({
        "events": page.items,
        "has_more": page.has_more,
        "next_cursor": page.next_cursor,
    })))
}

/// GET /api/git
async fn get_git_activity(
    State(state): State<AppState>,
    Query(query): Query<TimelineQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let filter = TimelineFilter {
        workspace_id: query.workspace_id,
        session_id: query.session_id,
        since: query.from,
        until: query.to,
    };
    let cursor = decode_cursor(query.cursor.as_deref())?;
    let page = state
        .store
        .list_git_activity(&filter, cursor.as_ref(), page_limit(query.limit))
        .await?;
    Ok(Json(json!({
        "activity": page.items,
        "has_more": page.has_more,
        "next_cursor": page.next_cursor,
    })))
}

/// GET /api/prompts/pending
async fn pending_prompts(
    State(state): State<AppState>,
    Query(query): Query<PendingPromptsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let prompts = state
        .store
        .pending_git_hooks_prompts(&query.device_id)
        .await?;
    Ok(Json(json!({ "prompts": prompts })))
}

/// POST /api/prompts/dismiss
async fn dismiss_prompt(
    State(state): State<AppState>,
    Json(request): Json<DismissPromptRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let accepted = request.action == PromptAction::Accepted;
    let dismissed = state
        .store
        .dismiss_git_hooks_prompt(&request.workspace_id, &request.device_id, accepted)
        .await?;
    if !dismissed {
        return Err(ApiError::NotFound(format!(
            "No workspace-device link for ({}, {})",
            request.workspace_id, request.device_id
        )));
    }
    Ok(Json(json!({"status": "dismissed"})))
}

/// POST /api/recovery/sweep
async fn recovery_sweep(
    State(state): State<AppState>,
    Json(request): Json<SweepRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let report = state.sweeper.run_once(request.dry_run).await?;
    Ok(Json(json!({ "report": report })))
}

fn decode_cursor(raw: Option<&str>) -> Result<Option<Cursor>, ApiError> {
    raw.map(Cursor::decode)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}

fn page_limit(requested: Option<usize>) -> usize {
    requested
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE)
}
