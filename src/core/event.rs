//! Wire event envelope and per-type payload schemas.
//!
//! Clients submit events in the envelope shape below; the ingest endpoint
//! validates the envelope and the type-specific payload before anything is
//! published to the stream. On persisted rows `workspace_id` holds the
//! resolved internal id, never the raw canonical string.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ValidationError;

/// Closed set of event types the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "session.start")]
    SessionStart,
    #[serde(rename = "session.end")]
    SessionEnd,
    #[serde(rename = "git.commit")]
    GitCommit,
    #[serde(rename = "git.push")]
    GitPush,
    #[serde(rename = "git.checkout")]
    GitCheckout,
    #[serde(rename = "git.merge")]
    GitMerge,
    #[serde(rename = "system.heartbeat")]
    SystemHeartbeat,
}

impl EventType {
    /// Stable string form used in the database and on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionStart => "session.start",
            Self::SessionEnd => "session.end",
            Self::GitCommit => "git.commit",
            Self::GitPush => "git.push",
            Self::GitCheckout => "git.checkout",
            Self::GitMerge => "git.merge",
            Self::SystemHeartbeat => "system.heartbeat",
        }
    }

    /// Whether this is one of the git activity event types.
    #[must_use]
    pub fn is_git(self) -> bool {
        matches!(
            self,
            Self::GitCommit | Self::GitPush | Self::GitCheckout | Self::GitMerge
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session.start" => Ok(Self::SessionStart),
            "session.end" => Ok(Self::SessionEnd),
            "git.commit" => Ok(Self::GitCommit),
            "git.push" => Ok(Self::GitPush),
            "git.checkout" => Ok(Self::GitCheckout),
            "git.merge" => Ok(Self::GitMerge),
            "system.heartbeat" => Ok(Self::SystemHeartbeat),
            _ => anyhow::bail!("unknown event type: {s}"),
        }
    }
}

/// One immutable observation submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Client-generated, unique, lexicographically sortable.
    pub id: String,

    /// Event type from the closed set.
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// When the event occurred on the client.
    pub timestamp: DateTime<Utc>,

    /// Emitting device.
    pub device_id: String,

    /// Canonical workspace id on ingress; resolved internal id on rows.
    pub workspace_id: String,

    /// Session the event belongs to, when known.
    #[serde(default)]
    pub session_id: Option<String>,

    /// Type-specific payload; validated against the schemas below.
    #[serde(default)]
    pub data: serde_json::Value,

    /// Server-stamped at ingest; null until then.
    #[serde(default)]
    pub ingested_at: Option<DateTime<Utc>>,

    /// Keys of blobs uploaded alongside this event.
    #[serde(default)]
    pub blob_refs: Vec<String>,
}

impl Event {
    /// Validate the envelope and the type-specific payload.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] naming the offending field. Envelope
    /// failures reject the whole batch at the HTTP layer; payload failures
    /// reject only this event.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "id" });
        }
        if self.device_id.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "device_id" });
        }
        if self.workspace_id.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                field: "workspace_id",
            });
        }
        self.validate_payload()
    }

    /// Validate only the type-specific `data` payload.
    fn validate_payload(&self) -> Result<(), ValidationError> {
        let invalid = |source: serde_json::Error| ValidationError::InvalidPayload {
            event_type: self.event_type,
            reason: source.to_string(),
        };

        match self.event_type {
            EventType::SessionStart => {
                let data: SessionStartData =
                    serde_json::from_value(self.data.clone()).map_err(invalid)?;
                if data.cc_session_id.trim().is_empty() {
                    return Err(ValidationError::EmptyField {
                        field: "data.cc_session_id",
                    });
                }
            }
            EventType::SessionEnd => {
                let data: SessionEndData =
                    serde_json::from_value(self.data.clone()).map_err(invalid)?;
                if data.cc_session_id.trim().is_empty() {
                    return Err(ValidationError::EmptyField {
                        field: "data.cc_session_id",
                    });
                }
            }
            EventType::GitCommit => {
                serde_json::from_value::<GitCommitData>(self.data.clone()).map_err(invalid)?;
            }
            EventType::GitPush => {
                serde_json::from_value::<GitPushData>(self.data.clone()).map_err(invalid)?;
            }
            EventType::GitCheckout => {
                serde_json::from_value::<GitCheckoutData>(self.data.clone()).map_err(invalid)?;
            }
            EventType::GitMerge => {
                serde_json::from_value::<GitMergeData>(self.data.clone()).map_err(invalid)?;
            }
            EventType::SystemHeartbeat => {}
        }
        Ok(())
    }

    /// Best-effort read of `data.cwd`, used for the workspace-device link.
    #[must_use]
    pub fn cwd(&self) -> String {
        self.data
            .get("cwd")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_owned()
    }
}

/// How a session came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionSource {
    Startup,
    Resume,
    Backfill,
}

impl SessionSource {
    /// Stable string form for the session row.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Resume => "resume",
            Self::Backfill => "backfill",
        }
    }
}

/// Payload of `session.start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartData {
    /// Client-assigned session id; becomes the session primary key.
    pub cc_session_id: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
    #[serde(default)]
    pub git_remote: Option<String>,
    #[serde(default)]
    pub cc_version: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub source: Option<SessionSource>,
    #[serde(default)]
    pub transcript_path: Option<String>,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    Exit,
    Clear,
    Logout,
}

impl EndReason {
    /// Stable string form for the session row.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exit => "exit",
            Self::Clear => "clear",
            Self::Logout => "logout",
        }
    }
}

/// Payload of `session.end`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEndData {
    pub cc_session_id: String,
    pub duration_ms: i64,
    #[serde(default)]
    pub end_reason: Option<EndReason>,
    #[serde(default)]
    pub transcript_path: Option<String>,
}

/// Payload of `git.commit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCommitData {
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub files_changed: Option<i64>,
    #[serde(default)]
    pub insertions: Option<i64>,
    #[serde(default)]
    pub deletions: Option<i64>,
    #[serde(default)]
    pub file_list: Option<Vec<String>>,
}

/// Payload of `git.push`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitPushData {
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub remote: Option<String>,
    #[serde(default)]
    pub commit_count: Option<i64>,
    #[serde(default)]
    pub commits: Option<Vec<String>>,
}

/// Payload of `git.checkout`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCheckoutData {
    #[serde(default)]
    pub from_ref: Option<String>,
    #[serde(default)]
    pub to_ref: Option<String>,
    #[serde(default)]
    pub from_branch: Option<String>,
    #[serde(default)]
    pub to_branch: Option<String>,
}

/// Payload of `git.merge`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitMergeData {
    #[serde(default)]
    pub merge_commit: Option<String>,
    #[serde(default)]
    pub into_branch: Option<String>,
    #[serde(default)]
    pub files_changed: Option<i64>,
    #[serde(default)]
    pub had_conflicts: Option<bool>,
}
