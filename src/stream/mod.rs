//! Durable event stream: at-least-once transport with per-entry ack and
//! reclamation of entries idle beyond a threshold.

pub mod consumer;
pub mod sqlite;

use async_trait::async_trait;
use std::time::Duration;

use crate::core::errors::StreamError;
use crate::core::event::Event;

pub use consumer::{Consumer, ConsumerConfig};
pub use sqlite::SqliteStream;

/// One entry read from the stream.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Transport-assigned id, used for ack.
    pub stream_id: String,
    payload: String,
}

impl StreamEntry {
    /// Create an entry from its raw payload (transport internal).
    #[must_use]
    pub fn new(stream_id: String, payload: String) -> Self {
        Self { stream_id, payload }
    }

    /// Decode the carried event.
    ///
    /// # Errors
    ///
    /// Returns the decode error for a corrupt payload; such entries can
    /// never process successfully and should be acked away.
    pub fn event(&self) -> Result<Event, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// Durable at-least-once event transport with consumer-group semantics.
///
/// Entries are delivered to exactly one claimer until their pending time
/// exceeds the idle threshold, at which point another consumer may claim
/// them. Ack removes the entry.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Publish one event. Ordered per producer, not globally.
    async fn publish(&self, event: &Event) -> Result<String, StreamError>;

    /// Publish a batch, reporting a per-event result.
    async fn publish_batch(&self, events: &[Event]) -> Vec<Result<String, StreamError>>;

    /// Read up to `count` entries for `consumer`, blocking up to `block`
    /// when the stream is empty.
    async fn read_group(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    /// Acknowledge (and remove) a delivered entry.
    async fn ack(&self, stream_id: &str) -> Result<(), StreamError>;

    /// Claim entries whose pending time exceeds `min_idle` for `consumer`.
    async fn claim_idle(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<(), StreamError>;

    /// Number of delivered-but-unacked entries (the PEL).
    async fn pending_count(&self) -> Result<u64, StreamError>;
}
