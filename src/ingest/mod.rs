//! Event ingestion: the processor invoked by the consumer loop and the
//! per-event-type handlers it dispatches to.

/// Per-event-type handlers.
pub mod handlers;
/// Event processor: identity resolution, idempotent event insert, dispatch.
pub mod processor;

pub use processor::{EventProcessor, HandlerResult, ProcessOutcome};
