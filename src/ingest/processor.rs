//! Event processor.
//!
//! For every stream entry, in this exact order: resolve the workspace
//! (with session.start hints), resolve the device, ensure the
//! workspace-device link, insert the event row with the resolved workspace
//! id (duplicates return early), dispatch the type-specific handler with
//! its failures isolated, and broadcast the event.

use std::sync::Arc;

use super::handlers;
use crate::api::ws::Broadcaster;
use crate::core::errors::ProcessError;
use crate::core::event::{Event, EventType, SessionStartData};
use crate::core::session::DeviceType;
use crate::pipeline::TranscriptPipeline;
use crate::store::{SqliteStore, WorkspaceHints};

/// What happened to one event.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// The event row was written; the handler outcome (when one ran) rides
    /// along.
    Processed { handler: Option<HandlerResult> },
    /// An event with this id already existed; nothing else ran.
    Duplicate,
}

/// Outcome of one handler invocation. Failures are recorded, never raised:
/// the event row persists regardless.
#[derive(Debug)]
pub struct HandlerResult {
    pub event_type: EventType,
    pub success: bool,
    pub error: Option<String>,
}

/// Resolves identities, persists events, and dispatches handlers.
pub struct EventProcessor {
    store: Arc<SqliteStore>,
    pipeline: Arc<TranscriptPipeline>,
    broadcaster: Arc<Broadcaster>,
    correlation_lookback: chrono::Duration,
}

impl EventProcessor {
    /// Wire the processor. `correlation_lookback` caps how far back the
    /// git-session correlator will reach.
    #[must_use]
    pub fn new(
        store: Arc<SqliteStore>,
        pipeline: Arc<TranscriptPipeline>,
        broadcaster: Arc<Broadcaster>,
        correlation_lookback: chrono::Duration,
    ) -> Self {
        Self {
            store,
            pipeline,
            broadcaster,
            correlation_lookback,
        }
    }

    /// Process one event.
    ///
    /// # Errors
    ///
    /// Returns an error only for storage failures before the event row is
    /// written; the caller must not ack so the entry is re-delivered.
    /// Handler failures are captured in the outcome instead.
    pub async fn process(&self, event: &Event) -> Result<ProcessOutcome, ProcessError> {
        let storage = |source: anyhow::Error| ProcessError::Storage {
            event_id: event.id.clone(),
            source,
        };

        let hints = workspace_hints(event);
        let workspace_id = self
            .store
            .resolve_workspace(&event.workspace_id, &hints)
            .await
            .map_err(storage)?;

        self.store
            .resolve_device(&event.device_id, &event.device_id, DeviceType::Local)
            .await
            .map_err(storage)?;

        self.store
            .ensure_workspace_device_link(&workspace_id, &event.device_id, &event.cwd())
            .await
            .map_err(storage)?;

        // The persisted row carries the resolved internal workspace id,
        // never the raw canonical string.
        let mut resolved = event.clone();
        resolved.workspace_id = workspace_id;

        let inserted = self.store.insert_event(&resolved).await.map_err(storage)?;
        if !inserted {
            tracing::debug!(event_id = %event.id, "Duplicate event, skipping handler");
            return Ok(ProcessOutcome::Duplicate);
        }

        let handler = self.dispatch(&resolved).await;
        if let Some(result) = &handler {
            if !result.success {
                tracing::warn!(
                    event_id = %resolved.id,
                    event_type = %result.event_type,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "Handler failed; event row retained"
                );
            }
        }

        self.broadcaster.broadcast_event(&resolved);

        Ok(ProcessOutcome::Processed { handler })
    }

    /// Look up and run the handler for this event type, catching any error.
    async fn dispatch(&self, event: &Event) -> Option<HandlerResult> {
        let result = match event.event_type {
            EventType::SessionStart => {
                handlers::handle_session_start(&self.store, event).await
            }
            EventType::SessionEnd => {
                handlers::handle_session_end(&self.store, &self.pipeline, event).await
            }
            EventType::GitCommit
            | EventType::GitPush
            | EventType::GitCheckout
            | EventType::GitMerge => {
                handlers::handle_git_event(&self.store, event, self.correlation_lookback).await
            }
            EventType::SystemHeartbeat => {
                tracing::debug!(event_id = %event.id, "No handler for event type");
                return None;
            }
        };

        Some(match result {
            Ok(()) => HandlerResult {
                event_type: event.event_type,
                success: true,
                error: None,
            },
            Err(e) => HandlerResult {
                event_type: event.event_type,
                success: false,
                error: Some(e.to_string()),
            },
        })
    }
}

impl std::fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProcessor").finish_non_exhaustive()
    }
}

/// session.start carries first-insert hints for the workspace row.
fn workspace_hints(event: &Event) -> WorkspaceHints {
    if event.event_type == EventType::SessionStart {
        if let Ok(data) = serde_json::from_value::<SessionStartData>(event.data.clone()) {
            return WorkspaceHints {
                display_name: None,
                default_branch: data.git_branch,
            };
        }
    }
    WorkspaceHints::default()
}
