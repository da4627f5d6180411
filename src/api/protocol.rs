//! Request/response types for the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::event::Event;
use crate::core::session::{ContentBlock, Session, TranscriptMessage};

/// Body of `POST /api/events/ingest`.
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub events: Vec<Event>,
}

/// Per-event ingest outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Accepted,
    Duplicate,
    Rejected,
}

/// Per-event ingest result, indexed into the submitted batch.
#[derive(Debug, Serialize)]
pub struct IngestResult {
    pub index: usize,
    pub status: IngestStatus,
}

/// Per-event rejection detail.
#[derive(Debug, Serialize)]
pub struct IngestErrorDetail {
    pub index: usize,
    pub error: String,
}

/// Response of `POST /api/events/ingest`.
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub ingested: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub results: Vec<IngestResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<IngestErrorDetail>>,
}

/// Response of `POST /api/sessions/:id/transcript/upload`.
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub status: &'static str,
    pub s3_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_triggered: Option<bool>,
}

/// One dependency check inside the health response.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub db: &'static str,
    pub stream: &'static str,
}

/// Response of `GET /api/health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub checks: HealthChecks,
    pub ws_clients: usize,
    pub uptime_seconds: u64,
    pub version: &'static str,
}

/// Query parameters of `GET /api/sessions`.
#[derive(Debug, Default, Deserialize)]
pub struct SessionsQuery {
    pub workspace_id: Option<String>,
    pub device_id: Option<String>,
    /// Comma-separated lifecycle set.
    pub lifecycle: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub tag: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

/// Response of `GET /api/sessions`.
#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<Session>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Query parameters of the timeline and git endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct TimelineQuery {
    pub workspace_id: Option<String>,
    pub session_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

/// One message with its content blocks, for the transcript read surface.
#[derive(Debug, Serialize)]
pub struct MessageWithBlocks {
    #[serde(flatten)]
    pub message: TranscriptMessage,
    pub blocks: Vec<ContentBlock>,
}

/// Body of `PATCH /api/sessions/:id`. At most one tag-mutation field.
#[derive(Debug, Default, Deserialize)]
pub struct PatchSessionRequest {
    pub summary: Option<String>,
    pub tags: Option<Vec<String>>,
    pub add_tags: Option<Vec<String>>,
    pub remove_tags: Option<Vec<String>>,
}

/// Prompt dismissal action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptAction {
    Accepted,
    Declined,
}

/// Body of `POST /api/prompts/dismiss`.
#[derive(Debug, Deserialize)]
pub struct DismissPromptRequest {
    pub workspace_id: String,
    pub device_id: String,
    pub action: PromptAction,
}

/// Query parameters of `GET /api/prompts/pending`.
#[derive(Debug, Deserialize)]
pub struct PendingPromptsQuery {
    pub device_id: String,
}

/// Body of `POST /api/recovery/sweep`.
#[derive(Debug, Default, Deserialize)]
pub struct SweepRequest {
    #[serde(default)]
    pub dry_run: bool,
}
