//! Domain error types with context for debugging.

use thiserror::Error;

use super::event::EventType;
use super::lifecycle::Lifecycle;

/// Rejections produced while validating an event envelope or payload.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required envelope or payload field is empty or missing.
    #[error("required field '{field}' is empty")]
    EmptyField {
        /// The offending field.
        field: &'static str,
    },

    /// The type-specific payload did not match its schema.
    #[error("invalid {event_type} payload: {reason}")]
    InvalidPayload {
        /// The event type whose schema was violated.
        event_type: EventType,
        /// Decoder error text.
        reason: String,
    },

    /// The ingest batch was empty.
    #[error("event batch is empty")]
    EmptyBatch,

    /// The ingest batch exceeded the configured maximum.
    #[error("event batch of {len} exceeds maximum of {max}")]
    BatchTooLarge {
        /// Submitted batch length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },
}

/// Failures of the durable stream transport.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The backing store is unavailable.
    #[error("stream storage unavailable: {source}")]
    Storage {
        /// The underlying database error.
        #[source]
        source: sqlx::Error,
    },

    /// An entry payload could not be encoded or decoded.
    #[error("stream entry {stream_id} payload error: {source}")]
    Payload {
        /// The entry's stream id.
        stream_id: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

impl From<sqlx::Error> for StreamError {
    fn from(source: sqlx::Error) -> Self {
        Self::Storage { source }
    }
}

/// Failures while processing one stream entry.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Identity resolution or a row write hit the store.
    #[error("storage failure processing event {event_id}: {source}")]
    Storage {
        /// The event being processed.
        event_id: String,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// The stream entry did not decode into an event.
    #[error("undecodable stream entry: {source}")]
    Decode {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Failures of the transcript processing pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The session does not exist.
    #[error("session {session_id} not found")]
    SessionNotFound {
        /// The missing session.
        session_id: String,
    },

    /// The transcript blob is missing from the blob store.
    #[error("transcript blob '{key}' for session {session_id} is missing")]
    BlobMissing {
        /// The affected session.
        session_id: String,
        /// The blob key that was not found.
        key: String,
    },

    /// The transcript blob exists but could not be read.
    #[error("transcript blob '{key}' for session {session_id} is unreadable: {source}")]
    BlobUnreadable {
        /// The affected session.
        session_id: String,
        /// The blob key.
        key: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A store operation failed mid-pipeline.
    #[error("storage failure in pipeline for session {session_id}: {source}")]
    Storage {
        /// The affected session.
        session_id: String,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },
}

/// Outcome of a guarded conditional transition that did not match.
#[derive(Debug, Error)]
#[error("session {session_id} cannot move to {to}: current lifecycle is {current:?}")]
pub struct TransitionRefused {
    /// The session whose transition was refused.
    pub session_id: String,
    /// The requested target state.
    pub to: Lifecycle,
    /// The lifecycle observed by the follow-up read, if the row exists.
    pub current: Option<Lifecycle>,
}
