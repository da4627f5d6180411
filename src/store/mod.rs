//! Persistent storage (SQLite): schema, identity upserts, the conditional
//! transition primitive, and cursor-paginated reads.

pub mod sqlite;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::lifecycle::Lifecycle;

pub use sqlite::SqliteStore;

/// Hints applied only when a workspace row is first inserted.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceHints {
    pub display_name: Option<String>,
    pub default_branch: Option<String>,
}

/// Result of the guarded conditional transition primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// Exactly one row moved to the target state.
    Applied,
    /// No row matched; `current` is the state observed by the follow-up
    /// read (None when the session does not exist).
    NoMatch { current: Option<Lifecycle> },
}

impl TransitionOutcome {
    /// Whether the transition was applied.
    #[must_use]
    pub fn applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Column updates applied atomically with a lifecycle transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdates {
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub end_reason: Option<String>,
    pub parse_status: Option<crate::core::lifecycle::ParseStatus>,
    pub parse_error: Option<String>,
    pub total_messages: Option<i64>,
    pub cost_estimate_usd: Option<f64>,
    pub summary: Option<String>,
}

/// Filters for session list queries; predicates compose with AND.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub workspace_id: Option<String>,
    pub device_id: Option<String>,
    pub lifecycles: Vec<Lifecycle>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub tag: Option<String>,
}

/// Filters for event and git-activity timeline queries.
#[derive(Debug, Clone, Default)]
pub struct TimelineFilter {
    pub workspace_id: Option<String>,
    pub session_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// One page of a keyset-paginated read.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

/// Opaque keyset cursor: base64 of `{s: <sort timestamp>, i: <id>}`.
/// Results are ordered `(s DESC, i DESC)`; the cursor points at the last
/// row of the previous page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub s: String,
    pub i: String,
}

impl Cursor {
    /// Encode to the opaque wire form.
    #[must_use]
    pub fn encode(&self) -> String {
        // Serializing two plain strings cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
    }

    /// Decode the opaque wire form.
    ///
    /// # Errors
    ///
    /// Fails when the token is not base64-encoded cursor JSON.
    pub fn decode(token: &str) -> anyhow::Result<Self> {
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(token.as_bytes())
            .map_err(|e| anyhow::anyhow!("invalid cursor encoding: {e}"))?;
        serde_json::from_slice(&bytes).map_err(|e| anyhow::anyhow!("invalid cursor: {e}"))
    }
}

/// A session the recovery sweep considers stalled.
#[derive(Debug, Clone, Serialize)]
pub struct StuckSession {
    pub session_id: String,
    pub lifecycle: Lifecycle,
    pub parse_status: crate::core::lifecycle::ParseStatus,
    pub has_transcript: bool,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_round_trip() {
        let cursor = Cursor {
            s: "2026-08-01T10:00:00Z".to_owned(),
            i: "cc-42".to_owned(),
        };
        let token = cursor.encode();
        assert_eq!(Cursor::decode(&token).unwrap(), cursor);
    }

    #[test]
    fn test_cursor_rejects_garbage() {
        assert!(Cursor::decode("not base64!!!").is_err());
        let not_json = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"hello");
        assert!(Cursor::decode(&not_json).is_err());
    }
}
