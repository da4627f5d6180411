//! Domain rows owned by the server: workspaces, devices, sessions,
//! transcript messages, content blocks, and git activity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::EventType;
use super::lifecycle::{Lifecycle, ParseStatus};

/// Stable identity for a code-project context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    /// Opaque, lexicographically sortable id (UUIDv7).
    pub id: String,

    /// Normalized git remote, `local:<hash>`, or `_unassociated`.
    /// Unique; the first insert wins.
    pub canonical_id: String,

    /// Human-friendly name, derived from the canonical id on first insert.
    pub display_name: String,

    /// Default branch hint from the first session.start that referenced it.
    pub default_branch: Option<String>,

    pub first_seen_at: DateTime<Utc>,
}

/// Where a client installation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Local,
    Remote,
    Ci,
}

impl DeviceType {
    /// Stable string form for the device row.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Ci => "ci",
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            "ci" => Ok(Self::Ci),
            _ => anyhow::bail!("unknown device type: {s}"),
        }
    }
}

/// A physical client installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Client-chosen id, unique.
    pub id: String,
    pub name: String,
    pub device_type: DeviceType,
    pub first_seen_at: DateTime<Utc>,
    /// Monotonic; bumped on every resolution.
    pub last_active_at: DateTime<Utc>,
}

/// Per-(workspace, device) state, keyed on the pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceDeviceLink {
    pub workspace_id: String,
    pub device_id: String,
    /// Filesystem cwd last observed for this pair.
    pub local_path: String,
    pub last_active_at: DateTime<Utc>,
    pub git_hooks_installed: bool,
    pub git_hooks_prompted: bool,
    pub pending_git_hooks_prompt: bool,
}

/// One AI-coding-assistant run. The id is the client-assigned session id,
/// unchanged, which is what makes end-to-end idempotency work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub workspace_id: String,
    pub device_id: String,
    pub lifecycle: Lifecycle,
    pub parse_status: ParseStatus,
    pub parse_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub end_reason: Option<String>,
    pub git_branch: Option<String>,
    pub model: Option<String>,
    pub source: Option<String>,
    /// Blob key of the uploaded transcript, once present.
    pub transcript_s3_key: Option<String>,
    pub summary: Option<String>,
    /// Set of tags, stored as a JSON array.
    pub tags: Vec<String>,
    pub total_messages: i64,
    pub cost_estimate_usd: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

/// One parsed message inside a session transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptMessage {
    /// Deterministic: `<session_id>:<ordinal>`.
    pub id: String,
    pub session_id: String,
    /// 1-based, contiguous within a session.
    pub ordinal: i64,
    pub role: MessageRole,
    pub timestamp: Option<DateTime<Utc>>,
    pub model: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cache_creation_tokens: Option<i64>,
    pub cache_read_tokens: Option<i64>,
    pub cost_usd: Option<f64>,
    pub is_compacted: bool,
    pub compact_sequence: i64,
}

/// Author of a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    /// Stable string form for the message row.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            _ => anyhow::bail!("unknown message role: {s}"),
        }
    }
}

/// Kind of a content block inside a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Text,
    Thinking,
    ToolUse,
    ToolResult,
}

impl BlockType {
    /// Stable string form for the block row.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Thinking => "thinking",
            Self::ToolUse => "tool_use",
            Self::ToolResult => "tool_result",
        }
    }
}

impl std::str::FromStr for BlockType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "thinking" => Ok(Self::Thinking),
            "tool_use" => Ok(Self::ToolUse),
            "tool_result" => Ok(Self::ToolResult),
            _ => anyhow::bail!("unknown block type: {s}"),
        }
    }
}

/// One structured piece of a transcript message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    pub message_id: String,
    pub session_id: String,
    pub block_order: i64,
    pub block_type: BlockType,
    pub content_text: Option<String>,
    pub thinking_text: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Option<serde_json::Value>,
    pub tool_result_id: Option<String>,
    pub is_error: Option<bool>,
    pub result_text: Option<String>,
}

/// Normalized record of a git operation, optionally correlated to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitActivity {
    pub id: String,
    pub activity_type: EventType,
    pub workspace_id: String,
    pub device_id: String,
    pub session_id: Option<String>,
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
    pub message: Option<String>,
    pub files_changed: Option<i64>,
    pub insertions: Option<i64>,
    pub deletions: Option<i64>,
    pub timestamp: DateTime<Utc>,
    /// Raw event payload, retained verbatim.
    pub data: serde_json::Value,
}

/// Confidence of a git-session correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationConfidence {
    /// An active session on the same workspace+device was found.
    Active,
    /// No active session matched.
    None,
}
