//! Stuck-session recovery.
//!
//! A periodic sweep finds sessions stalled below a terminal parse state for
//! longer than the threshold and retriggers the pipeline, or fails them
//! when no transcript will ever arrive. Dry-run reports without mutating.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::TranscriptPipeline;
use crate::store::{SqliteStore, StuckSession};

/// Recovery tunables.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryConfig {
    /// Sweep cadence.
    pub sweep_interval: Duration,
    /// A session untouched for this long counts as stuck.
    pub stuck_threshold: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(300),
            stuck_threshold: Duration::from_secs(3600),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Serialize)]
pub struct SweepReport {
    pub dry_run: bool,
    pub candidates: Vec<StuckSession>,
    /// Sessions whose pipeline was re-run.
    pub retriggered: Vec<String>,
    /// Sessions failed for having no transcript.
    pub failed: Vec<String>,
}

/// Periodic sweeper over stalled sessions.
pub struct RecoverySweeper {
    store: Arc<SqliteStore>,
    pipeline: Arc<TranscriptPipeline>,
    config: RecoveryConfig,
}

impl RecoverySweeper {
    /// Wire the sweeper.
    #[must_use]
    pub fn new(
        store: Arc<SqliteStore>,
        pipeline: Arc<TranscriptPipeline>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            store,
            pipeline,
            config,
        }
    }

    /// Run one sweep. With `dry_run`, candidates are reported and nothing
    /// is retriggered or mutated.
    ///
    /// # Errors
    ///
    /// Returns an error when the candidate query fails; per-session
    /// retrigger failures are logged and skipped.
    pub async fn run_once(&self, dry_run: bool) -> anyhow::Result<SweepReport> {
        let threshold_ms =
            i64::try_from(self.config.stuck_threshold.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now() - chrono::Duration::milliseconds(threshold_ms);
        let candidates = self.store.find_stuck_sessions(cutoff).await?;

        let mut report = SweepReport {
            dry_run,
            candidates,
            retriggered: Vec::new(),
            failed: Vec::new(),
        };

        if dry_run || report.candidates.is_empty() {
            return Ok(report);
        }

        tracing::info!(count = report.candidates.len(), "Recovering stuck sessions");

        for candidate in &report.candidates {
            let session_id = candidate.session_id.clone();
            if candidate.has_transcript {
                // The pipeline's guarded transitions make this safe even if
                // another worker is mid-flight on the same session.
                match self.pipeline.run(&session_id).await {
                    Ok(()) => report.retriggered.push(session_id),
                    Err(e) => {
                        tracing::warn!(
                            session_id = %candidate.session_id,
                            error = %e,
                            "Stuck-session retrigger failed"
                        );
                    }
                }
            } else {
                match self
                    .pipeline
                    .fail_session(&session_id, "no transcript_s3_key")
                    .await
                {
                    Ok(()) => report.failed.push(session_id),
                    Err(e) => {
                        tracing::warn!(
                            session_id = %candidate.session_id,
                            error = %e,
                            "Could not fail transcriptless stuck session"
                        );
                    }
                }
            }
        }

        Ok(report)
    }

    /// Drive periodic sweeps until shutdown.
    pub async fn run_ticker(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // skip the immediate first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once(false).await {
                        Ok(report) => {
                            if !report.candidates.is_empty() {
                                tracing::info!(
                                    candidates = report.candidates.len(),
                                    retriggered = report.retriggered.len(),
                                    failed = report.failed.len(),
                                    "Recovery sweep complete"
                                );
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Recovery sweep failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("Recovery sweeper stopped");
    }
}

impl std::fmt::Debug for RecoverySweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoverySweeper")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
