//! Per-event-type handlers. Handlers write rows and drive session
//! transitions; they never fail the surrounding event processing.

use std::sync::Arc;

use crate::core::event::{
    Event, EventType, GitCheckoutData, GitCommitData, GitMergeData, GitPushData, SessionEndData,
    SessionSource, SessionStartData,
};
use crate::core::identity::UNASSOCIATED;
use crate::core::lifecycle::Lifecycle;
use crate::core::session::GitActivity;
use crate::pipeline::TranscriptPipeline;
use crate::store::{SqliteStore, TransitionOutcome, TransitionUpdates};

/// session.start: create the session row in `detected` state and, for
/// git-associated workspaces that were never prompted, flag the git-hooks
/// prompt. Idempotent end to end.
pub async fn handle_session_start(store: &SqliteStore, event: &Event) -> anyhow::Result<()> {
    let data: SessionStartData = serde_json::from_value(event.data.clone())?;

    let created = store
        .create_session(
            &data.cc_session_id,
            &event.workspace_id,
            &event.device_id,
            event.timestamp,
            data.git_branch.as_deref(),
            data.model.as_deref(),
            data.source.map(SessionSource::as_str),
        )
        .await?;

    if created {
        tracing::info!(
            session_id = %data.cc_session_id,
            workspace_id = %event.workspace_id,
            "Session detected"
        );
    }

    let workspace = store.get_workspace(&event.workspace_id).await?;
    if let Some(workspace) = workspace {
        if workspace.canonical_id != UNASSOCIATED {
            store
                .mark_pending_git_hooks_prompt(&event.workspace_id, &event.device_id)
                .await?;
        }
    }

    Ok(())
}

/// session.end: transition to `ended` and, when a transcript is already
/// uploaded, fire the pipeline without awaiting it.
pub async fn handle_session_end(
    store: &SqliteStore,
    pipeline: &Arc<TranscriptPipeline>,
    event: &Event,
) -> anyhow::Result<()> {
    let data: SessionEndData = serde_json::from_value(event.data.clone())?;
    let session_id = data.cc_session_id.clone();

    let outcome = store
        .transition(
            &session_id,
            Lifecycle::Ended,
            &[Lifecycle::Detected, Lifecycle::Capturing],
            TransitionUpdates {
                ended_at: Some(event.timestamp),
                duration_ms: Some(data.duration_ms),
                end_reason: data.end_reason.map(|reason| reason.as_str().to_owned()),
                ..Default::default()
            },
        )
        .await?;

    if let TransitionOutcome::NoMatch { current } = outcome {
        tracing::warn!(
            session_id = %session_id,
            ?current,
            "session.end did not transition; session missing or already past capturing"
        );
        return Ok(());
    }

    let session = store.get_session(&session_id).await?;
    if session.and_then(|s| s.transcript_s3_key).is_some() {
        pipeline.spawn(session_id);
    }

    Ok(())
}

/// git.*: write a git_activity row, correlated to the most recent active
/// session on the same workspace+device within the lookback ceiling. The
/// session row itself is never touched.
pub async fn handle_git_event(
    store: &SqliteStore,
    event: &Event,
    lookback: chrono::Duration,
) -> anyhow::Result<()> {
    let session_id = match &event.session_id {
        Some(id) => Some(id.clone()),
        None => {
            store
                .correlate_session(&event.workspace_id, &event.device_id, event.timestamp, lookback)
                .await?
        }
    };

    if session_id.is_none() {
        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            "No active session correlates with git activity"
        );
    }

    let mut activity = GitActivity {
        id: event.id.clone(),
        activity_type: event.event_type,
        workspace_id: event.workspace_id.clone(),
        device_id: event.device_id.clone(),
        session_id,
        branch: None,
        commit_sha: None,
        message: None,
        files_changed: None,
        insertions: None,
        deletions: None,
        timestamp: event.timestamp,
        data: event.data.clone(),
    };

    match event.event_type {
        EventType::GitCommit => {
            let data: GitCommitData = serde_json::from_value(event.data.clone())?;
            activity.branch = data.branch;
            activity.commit_sha = data.hash;
            activity.message = data.message;
            activity.files_changed = data.files_changed;
            activity.insertions = data.insertions;
            activity.deletions = data.deletions;
        }
        EventType::GitPush => {
            let data: GitPushData = serde_json::from_value(event.data.clone())?;
            activity.branch = data.branch;
        }
        EventType::GitCheckout => {
            let data: GitCheckoutData = serde_json::from_value(event.data.clone())?;
            activity.branch = data.to_branch.or(data.to_ref);
        }
        EventType::GitMerge => {
            let data: GitMergeData = serde_json::from_value(event.data.clone())?;
            activity.branch = data.into_branch;
            activity.commit_sha = data.merge_commit;
            activity.files_changed = data.files_changed;
        }
        EventType::SessionStart | EventType::SessionEnd | EventType::SystemHeartbeat => {
            anyhow::bail!("not a git event: {}", event.event_type);
        }
    }

    store.insert_git_activity(&activity).await?;
    Ok(())
}
