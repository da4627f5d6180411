//! Transcript processing pipeline.
//!
//! `run` is safe to call repeatedly and concurrently: ownership is taken
//! through `parse_status`, persistence uses deterministic keys, and every
//! lifecycle change goes through the guarded conditional transition, so
//! two workers can never advance the same session twice.

pub mod parser;
pub mod recovery;

use std::sync::Arc;

use crate::api::ws::{Broadcaster, SessionStats};
use crate::blob::BlobStore;
use crate::core::errors::PipelineError;
use crate::core::lifecycle::{Lifecycle, ParseStatus};
use crate::store::{SqliteStore, TransitionUpdates};
use crate::summary::Summarizer;

pub use recovery::{RecoveryConfig, RecoverySweeper, SweepReport};

/// Background processor for uploaded transcripts.
pub struct TranscriptPipeline {
    store: Arc<SqliteStore>,
    blobs: Arc<dyn BlobStore>,
    summarizer: Option<Arc<dyn Summarizer>>,
    broadcaster: Arc<Broadcaster>,
}

impl TranscriptPipeline {
    /// Wire the pipeline to its dependencies. The summarizer is optional;
    /// without one, sessions stop at `parsed`.
    #[must_use]
    pub fn new(
        store: Arc<SqliteStore>,
        blobs: Arc<dyn BlobStore>,
        summarizer: Option<Arc<dyn Summarizer>>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            store,
            blobs,
            summarizer,
            broadcaster,
        }
    }

    /// Fire-and-forget entry point used by handlers: the run happens in a
    /// detached task with its own error scope, observable only through the
    /// session row and broadcasts.
    pub fn spawn(self: &Arc<Self>, session_id: String) {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = pipeline.run(&session_id).await {
                tracing::warn!(session_id, error = %e, "Transcript pipeline run failed");
            }
        });
    }

    /// Run the pipeline for one session: claim, download, parse, persist,
    /// advance, summarize.
    ///
    /// # Errors
    ///
    /// Returns an error for storage failures (retryable; the session keeps
    /// its claim and the stuck sweep will retrigger it). Data problems
    /// (missing/unreadable blob) mark the session `failed` and return Ok.
    pub async fn run(&self, session_id: &str) -> Result<(), PipelineError> {
        let storage = |source: anyhow::Error| PipelineError::Storage {
            session_id: session_id.to_owned(),
            source,
        };

        let session = self
            .store
            .get_session(session_id)
            .await
            .map_err(storage)?
            .ok_or_else(|| PipelineError::SessionNotFound {
                session_id: session_id.to_owned(),
            })?;

        // Claim: only sessions still at `ended` are workable. A losing
        // racer exits here because another worker already advanced it.
        if !self
            .store
            .claim_for_parse(session_id)
            .await
            .map_err(storage)?
        {
            tracing::debug!(
                session_id,
                lifecycle = %session.lifecycle,
                "Session not claimable, skipping pipeline run"
            );
            return Ok(());
        }

        let Some(key) = session.transcript_s3_key.clone() else {
            self.fail_session(session_id, "no transcript_s3_key")
                .await
                .map_err(storage)?;
            return Ok(());
        };

        let blob = match self.blobs.get(&key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::warn!(session_id, key, "Transcript blob missing");
                self.fail_session(session_id, &format!("transcript blob '{key}' not found"))
                    .await
                    .map_err(storage)?;
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(session_id, key, error = %e, "Transcript blob unreadable");
                self.fail_session(session_id, &format!("transcript blob '{key}' unreadable: {e}"))
                    .await
                    .map_err(storage)?;
                return Ok(());
            }
        };

        let parsed = parser::parse_transcript(session_id, &blob);
        if parsed.skipped_lines > 0 {
            tracing::warn!(
                session_id,
                skipped = parsed.skipped_lines,
                "Transcript had undecodable lines"
            );
        }

        self.store
            .insert_transcript_batch(&parsed.messages, &parsed.blocks)
            .await
            .map_err(storage)?;

        let total_messages = parsed.messages.len() as i64;
        let outcome = self
            .store
            .transition(
                session_id,
                Lifecycle::Parsed,
                &[Lifecycle::Ended],
                TransitionUpdates {
                    parse_status: Some(ParseStatus::Completed),
                    total_messages: Some(total_messages),
                    cost_estimate_usd: parsed.cost_estimate_usd,
                    ..Default::default()
                },
            )
            .await
            .map_err(storage)?;

        if !outcome.applied() {
            // Another worker advanced the session between claim and here;
            // everything we wrote was idempotent.
            tracing::debug!(session_id, ?outcome, "Parse advancement lost the race");
            return Ok(());
        }

        tracing::info!(session_id, total_messages, "Transcript parsed");
        self.broadcaster.broadcast_session_update(
            session_id,
            &session.workspace_id,
            Lifecycle::Parsed,
            None,
            Some(SessionStats {
                total_messages,
                cost_estimate_usd: parsed.cost_estimate_usd,
            }),
        );

        if total_messages >= 1 {
            if let Some(summarizer) = &self.summarizer {
                self.summarize(session_id, &session.workspace_id, summarizer.as_ref(), &parsed)
                    .await
                    .map_err(storage)?;
            }
        }

        Ok(())
    }

    /// Summarization failure is not terminal: log and leave at `parsed`.
    async fn summarize(
        &self,
        session_id: &str,
        workspace_id: &str,
        summarizer: &dyn Summarizer,
        parsed: &parser::ParsedTranscript,
    ) -> anyhow::Result<()> {
        let summary = match summarizer.summarize(&parsed.excerpt()).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "Summarization failed, leaving session at parsed");
                return Ok(());
            }
        };

        let outcome = self
            .store
            .transition(
                session_id,
                Lifecycle::Summarized,
                &[Lifecycle::Parsed],
                TransitionUpdates {
                    summary: Some(summary.clone()),
                    ..Default::default()
                },
            )
            .await?;

        if outcome.applied() {
            self.broadcaster.broadcast_session_update(
                session_id,
                workspace_id,
                Lifecycle::Summarized,
                Some(summary),
                None,
            );
        }
        Ok(())
    }

    /// Mark a session failed with a parse error. Used for data problems the
    /// pipeline cannot recover from; the sweeper uses it for transcriptless
    /// stragglers.
    pub async fn fail_session(&self, session_id: &str, reason: &str) -> anyhow::Result<()> {
        let outcome = self
            .store
            .transition(
                session_id,
                Lifecycle::Failed,
                &[Lifecycle::Ended, Lifecycle::Parsed],
                TransitionUpdates {
                    parse_status: Some(ParseStatus::Failed),
                    parse_error: Some(reason.to_owned()),
                    ..Default::default()
                },
            )
            .await?;

        if outcome.applied() {
            if let Some(session) = self.store.get_session(session_id).await? {
                self.broadcaster.broadcast_session_update(
                    session_id,
                    &session.workspace_id,
                    Lifecycle::Failed,
                    None,
                    None,
                );
            }
        } else {
            tracing::warn!(session_id, ?outcome, "Could not mark session failed");
        }
        Ok(())
    }
}

impl std::fmt::Debug for TranscriptPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptPipeline").finish_non_exhaustive()
    }
}
