//! Session lifecycle state machine.
//!
//! Lifecycle advances monotonically along a fixed DAG; the only way to
//! change a session's lifecycle is the conditional transition primitive in
//! the store, which callers gate with [`Lifecycle::can_transition`].

use serde::{Deserialize, Serialize};

/// Position of a session in its lifecycle DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    /// Session observed via session.start; no end event yet.
    Detected,

    /// Session is actively streaming activity.
    Capturing,

    /// session.end received; transcript not yet parsed.
    Ended,

    /// Transcript parsed into messages and content blocks.
    Parsed,

    /// Summary generated from the parsed transcript.
    Summarized,

    /// Retained but closed out; terminal.
    Archived,

    /// Unrecoverable processing failure; terminal.
    Failed,
}

impl Lifecycle {
    /// All states, in DAG order.
    pub const ALL: [Self; 7] = [
        Self::Detected,
        Self::Capturing,
        Self::Ended,
        Self::Parsed,
        Self::Summarized,
        Self::Archived,
        Self::Failed,
    ];

    /// Whether `self -> to` is an edge of the lifecycle DAG.
    #[must_use]
    pub fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Detected, Self::Capturing | Self::Ended | Self::Failed)
                | (Self::Capturing, Self::Ended | Self::Failed)
                | (Self::Ended, Self::Parsed | Self::Failed)
                | (Self::Parsed, Self::Summarized | Self::Archived | Self::Failed)
                | (Self::Summarized, Self::Archived | Self::Failed)
        )
    }

    /// Terminal states admit no outgoing edges.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Archived | Self::Failed)
    }

    /// Stable string form used in the database and on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::Capturing => "capturing",
            Self::Ended => "ended",
            Self::Parsed => "parsed",
            Self::Summarized => "summarized",
            Self::Archived => "archived",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Lifecycle {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "detected" => Ok(Self::Detected),
            "capturing" => Ok(Self::Capturing),
            "ended" => Ok(Self::Ended),
            "parsed" => Ok(Self::Parsed),
            "summarized" => Ok(Self::Summarized),
            "archived" => Ok(Self::Archived),
            "failed" => Ok(Self::Failed),
            _ => anyhow::bail!("unknown lifecycle: {s}"),
        }
    }
}

/// Progress of transcript parsing, independent of lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParseStatus {
    /// No parse attempted yet.
    #[default]
    Pending,

    /// A pipeline worker holds the claim.
    Parsing,

    /// Parse finished; messages and blocks persisted.
    Completed,

    /// Parse failed; see `parse_error` on the session.
    Failed,
}

impl ParseStatus {
    /// Stable string form used in the database.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Parsing => "parsing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ParseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ParseStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "parsing" => Ok(Self::Parsing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => anyhow::bail!("unknown parse status: {s}"),
        }
    }
}
