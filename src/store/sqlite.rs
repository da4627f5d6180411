use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use std::path::Path;
use std::str::FromStr;
use tracing::instrument;
use uuid::Uuid;

use super::{
    Cursor, Page, SessionFilter, StuckSession, TimelineFilter, TransitionOutcome,
    TransitionUpdates, WorkspaceHints,
};
use crate::core::event::{Event, EventType};
use crate::core::identity;
use crate::core::lifecycle::{Lifecycle, ParseStatus};
use crate::core::session::{
    ContentBlock, Device, DeviceType, GitActivity, Session, TranscriptMessage, Workspace,
    WorkspaceDeviceLink,
};

/// Tag mutation applied by `PATCH /api/sessions/:id`. Tags behave as a set.
#[derive(Debug, Clone)]
pub enum TagMutation {
    Replace(Vec<String>),
    Add(Vec<String>),
    Remove(Vec<String>),
}

/// SQLite-backed store for all server-owned rows.
pub struct SqliteStore {
    pool: SqlitePool,
}

/// Fixed-width RFC 3339 UTC, so string comparison orders chronologically.
pub(crate) fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> anyhow::Result<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(Into::into)
        .map_err(|e| anyhow::anyhow!("invalid timestamp '{s}': {e}"))
}

fn parse_ts_opt(s: Option<&str>) -> anyhow::Result<Option<DateTime<Utc>>> {
    s.map(parse_ts).transpose()
}

impl SqliteStore {
    /// Open (or create) the database at the given path and apply migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created or migrations fail.
    pub async fn new(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite:{display}",
            display = db_path.display()
        ))?
        .create_if_missing(true)
        .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory database for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created or migrations fail.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // A single connection so the in-memory database is shared.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Clone of the underlying pool, for components that share the database
    /// (the stream transport lives in the same file).
    #[must_use]
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    /// Cheap liveness probe.
    ///
    /// # Errors
    ///
    /// Returns an error when the database is unreachable.
    pub async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )
            ",
        )
        .execute(pool)
        .await?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_optional(pool)
                .await?
                .flatten();

        let current_version = current_version.unwrap_or(0);

        if current_version < 1 {
            Self::migrate_to_v1(pool).await?;
        }

        if current_version < 2 {
            Self::migrate_to_v2(pool).await?;
        }

        Ok(())
    }

    /// Migration v1: initial schema.
    async fn migrate_to_v1(pool: &SqlitePool) -> anyhow::Result<()> {
        tracing::info!("Applying migration v1: Initial schema");

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS workspaces (
                id TEXT PRIMARY KEY,
                canonical_id TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                default_branch TEXT,
                first_seen_at TEXT NOT NULL
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS devices (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                device_type TEXT NOT NULL,
                first_seen_at TEXT NOT NULL,
                last_active_at TEXT NOT NULL
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS workspace_devices (
                workspace_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                local_path TEXT NOT NULL,
                last_active_at TEXT NOT NULL,
                PRIMARY KEY (workspace_id, device_id)
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                lifecycle TEXT NOT NULL,
                parse_status TEXT NOT NULL DEFAULT 'pending',
                parse_error TEXT,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                duration_ms INTEGER,
                end_reason TEXT,
                git_branch TEXT,
                model TEXT,
                source TEXT,
                transcript_s3_key TEXT,
                summary TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                total_messages INTEGER NOT NULL DEFAULT 0,
                cost_estimate_usd REAL,
                updated_at TEXT NOT NULL
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_workspace_started
             ON sessions(workspace_id, started_at DESC)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_device_started
             ON sessions(device_id, started_at DESC)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                device_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                session_id TEXT,
                data TEXT NOT NULL,
                ingested_at TEXT,
                blob_refs TEXT NOT NULL DEFAULT '[]'
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_session_ts ON events(session_id, timestamp)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_workspace_ts ON events(workspace_id, timestamp)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS transcript_messages (
                id TEXT NOT NULL UNIQUE,
                session_id TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                role TEXT NOT NULL,
                timestamp TEXT,
                model TEXT,
                input_tokens INTEGER,
                output_tokens INTEGER,
                cache_creation_tokens INTEGER,
                cache_read_tokens INTEGER,
                cost_usd REAL,
                is_compacted INTEGER NOT NULL DEFAULT 0,
                compact_sequence INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (session_id, ordinal),
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS content_blocks (
                message_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                block_order INTEGER NOT NULL,
                block_type TEXT NOT NULL,
                content_text TEXT,
                thinking_text TEXT,
                tool_name TEXT,
                tool_input TEXT,
                tool_result_id TEXT,
                is_error INTEGER,
                result_text TEXT,
                PRIMARY KEY (message_id, block_order),
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_content_blocks_session ON content_blocks(session_id)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS git_activity (
                id TEXT PRIMARY KEY,
                activity_type TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                session_id TEXT,
                branch TEXT,
                commit_sha TEXT,
                message TEXT,
                files_changed INTEGER,
                insertions INTEGER,
                deletions INTEGER,
                timestamp TEXT NOT NULL,
                data TEXT NOT NULL
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_git_session_ts ON git_activity(session_id, timestamp)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_git_workspace_ts
             ON git_activity(workspace_id, timestamp)",
        )
        .execute(pool)
        .await?;

        // Events and git activity are written before their session row can
        // exist, so the cascade from sessions is a trigger rather than a
        // foreign key.
        sqlx::query(
            r"
            CREATE TRIGGER IF NOT EXISTS trg_sessions_cascade
            AFTER DELETE ON sessions
            BEGIN
                DELETE FROM events WHERE session_id = OLD.id;
                DELETE FROM git_activity WHERE session_id = OLD.id;
            END
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS stream_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payload TEXT NOT NULL,
                published_at TEXT NOT NULL,
                consumer TEXT,
                delivered_at TEXT,
                delivery_count INTEGER NOT NULL DEFAULT 0
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_stream_pending
             ON stream_entries(consumer, delivered_at)",
        )
        .execute(pool)
        .await?;

        let now = Utc::now();
        sqlx::query("INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(1)
            .bind(now.to_rfc3339())
            .execute(pool)
            .await?;

        tracing::info!("Migration v1 complete");
        Ok(())
    }

    /// Migration v2: git hooks prompt flags on workspace_devices.
    async fn migrate_to_v2(pool: &SqlitePool) -> anyhow::Result<()> {
        tracing::info!("Applying migration v2: Git hooks prompt flags");

        for column in [
            "git_hooks_installed",
            "git_hooks_prompted",
            "pending_git_hooks_prompt",
        ] {
            let exists: bool = sqlx::query_scalar(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('workspace_devices') WHERE name = ?",
            )
            .bind(column)
            .fetch_one(pool)
            .await?;

            if !exists {
                sqlx::query(&format!(
                    "ALTER TABLE workspace_devices ADD COLUMN {column} INTEGER NOT NULL DEFAULT 0"
                ))
                .execute(pool)
                .await?;
                tracing::debug!("Added {column} column to workspace_devices table");
            }
        }

        let now = Utc::now();
        sqlx::query("INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(2)
            .bind(now.to_rfc3339())
            .execute(pool)
            .await?;

        tracing::info!("Migration v2 complete");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Identity resolution
    // ---------------------------------------------------------------------

    /// Resolve a canonical workspace id to the internal workspace id,
    /// creating the row if needed. The first insert wins; hints are only
    /// applied on first insert.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    #[instrument(skip(self, hints))]
    pub async fn resolve_workspace(
        &self,
        canonical_id: &str,
        hints: &WorkspaceHints,
    ) -> anyhow::Result<String> {
        let id = Uuid::now_v7().to_string();
        let display_name = hints
            .display_name
            .clone()
            .unwrap_or_else(|| identity::display_name_for(canonical_id));

        let inserted: Option<String> = sqlx::query_scalar(
            r"
            INSERT INTO workspaces (id, canonical_id, display_name, default_branch, first_seen_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(canonical_id) DO NOTHING
            RETURNING id
            ",
        )
        .bind(&id)
        .bind(canonical_id)
        .bind(&display_name)
        .bind(&hints.default_branch)
        .bind(fmt_ts(Utc::now()))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = inserted {
            tracing::debug!(workspace_id = %id, canonical_id, "Created workspace");
            return Ok(id);
        }

        let existing: String = sqlx::query_scalar("SELECT id FROM workspaces WHERE canonical_id = ?")
            .bind(canonical_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(existing)
    }

    /// Upsert a device row and bump `last_active_at` (monotonic).
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    #[instrument(skip(self, name))]
    pub async fn resolve_device(
        &self,
        device_id: &str,
        name: &str,
        device_type: DeviceType,
    ) -> anyhow::Result<()> {
        let now = fmt_ts(Utc::now());
        sqlx::query(
            r"
            INSERT INTO devices (id, name, device_type, first_seen_at, last_active_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                last_active_at = MAX(devices.last_active_at, excluded.last_active_at)
            ",
        )
        .bind(device_id)
        .bind(name)
        .bind(device_type.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert the (workspace, device) link. Updates `local_path` and
    /// `last_active_at`; never resets the hook flags.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    #[instrument(skip(self, local_path))]
    pub async fn ensure_workspace_device_link(
        &self,
        workspace_id: &str,
        device_id: &str,
        local_path: &str,
    ) -> anyhow::Result<()> {
        let now = fmt_ts(Utc::now());
        sqlx::query(
            r"
            INSERT INTO workspace_devices (workspace_id, device_id, local_path, last_active_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(workspace_id, device_id) DO UPDATE SET
                local_path = excluded.local_path,
                last_active_at = MAX(workspace_devices.last_active_at, excluded.last_active_at)
            ",
        )
        .bind(workspace_id)
        .bind(device_id)
        .bind(local_path)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get a workspace by internal id.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    pub async fn get_workspace(&self, id: &str) -> anyhow::Result<Option<Workspace>> {
        let row = sqlx::query_as::<_, WorkspaceRow>("SELECT * FROM workspaces WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// List all workspaces, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    pub async fn list_workspaces(&self) -> anyhow::Result<Vec<Workspace>> {
        let rows = sqlx::query_as::<_, WorkspaceRow>(
            "SELECT * FROM workspaces ORDER BY first_seen_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// List all devices, most recently active first.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    pub async fn list_devices(&self) -> anyhow::Result<Vec<Device>> {
        let rows =
            sqlx::query_as::<_, DeviceRow>("SELECT * FROM devices ORDER BY last_active_at DESC")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    /// Insert an event row; the caller passes the event with the resolved
    /// workspace id already in place. Returns false when the id already
    /// existed (duplicate).
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn insert_event(&self, event: &Event) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO events (
                id, event_type, timestamp, device_id, workspace_id,
                session_id, data, ingested_at, blob_refs
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            ",
        )
        .bind(&event.id)
        .bind(event.event_type.as_str())
        .bind(fmt_ts(event.timestamp))
        .bind(&event.device_id)
        .bind(&event.workspace_id)
        .bind(&event.session_id)
        .bind(event.data.to_string())
        .bind(event.ingested_at.map(fmt_ts))
        .bind(serde_json::to_string(&event.blob_refs)?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Whether an event with this id has already been persisted.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    pub async fn event_exists(&self, id: &str) -> anyhow::Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    /// Cursor-paginated event timeline, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    pub async fn list_events(
        &self,
        filter: &TimelineFilter,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> anyhow::Result<Page<Event>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM events WHERE 1=1");
        if let Some(ws) = &filter.workspace_id {
            qb.push(" AND workspace_id = ").push_bind(ws);
        }
        if let Some(sid) = &filter.session_id {
            qb.push(" AND session_id = ").push_bind(sid);
        }
        if let Some(t) = filter.since {
            qb.push(" AND timestamp >= ").push_bind(fmt_ts(t));
        }
        if let Some(t) = filter.until {
            qb.push(" AND timestamp <= ").push_bind(fmt_ts(t));
        }
        if let Some(cur) = cursor {
            qb.push(" AND (timestamp < ")
                .push_bind(cur.s.clone())
                .push(" OR (timestamp = ")
                .push_bind(cur.s.clone())
                .push(" AND id < ")
                .push_bind(cur.i.clone())
                .push("))");
        }
        qb.push(" ORDER BY timestamp DESC, id DESC LIMIT ");
        qb.push_bind(limit as i64 + 1);

        let rows: Vec<EventRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        page_of(rows, limit, |row| {
            (row.timestamp.clone(), row.id.clone())
        })
    }

    // ---------------------------------------------------------------------
    // Sessions
    // ---------------------------------------------------------------------

    /// Insert a session in `detected` state. Returns false when the row
    /// already existed (idempotent on the client-assigned id).
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn create_session(
        &self,
        id: &str,
        workspace_id: &str,
        device_id: &str,
        started_at: DateTime<Utc>,
        git_branch: Option<&str>,
        model: Option<&str>,
        source: Option<&str>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO sessions (
                id, workspace_id, device_id, lifecycle, parse_status,
                started_at, git_branch, model, source, updated_at
            ) VALUES (?, ?, ?, 'detected', 'pending', ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            ",
        )
        .bind(id)
        .bind(workspace_id)
        .bind(device_id)
        .bind(fmt_ts(started_at))
        .bind(git_branch)
        .bind(model)
        .bind(source)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Get a session by id.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    pub async fn get_session(&self, id: &str) -> anyhow::Result<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// The conditional transition primitive: move `session_id` to `to` iff
    /// its current lifecycle is in `allowed_from`, applying `updates` in the
    /// same statement. This is the only way lifecycle changes.
    ///
    /// Edges not in the lifecycle DAG are rejected before touching the
    /// store; a non-matching row is surfaced with its actual current state.
    ///
    /// # Errors
    ///
    /// Returns an error when the requested edge set is entirely illegal or
    /// the backing store is unavailable.
    #[instrument(skip(self, updates), fields(session_id = %session_id, to = %to))]
    pub async fn transition(
        &self,
        session_id: &str,
        to: Lifecycle,
        allowed_from: &[Lifecycle],
        updates: TransitionUpdates,
    ) -> anyhow::Result<TransitionOutcome> {
        let legal: Vec<Lifecycle> = allowed_from
            .iter()
            .copied()
            .filter(|from| from.can_transition(to))
            .collect();
        if legal.is_empty() {
            anyhow::bail!(
                "no legal edge from {allowed_from:?} to {to} in the lifecycle DAG"
            );
        }

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE sessions SET lifecycle = ");
        qb.push_bind(to.as_str());
        qb.push(", updated_at = ").push_bind(fmt_ts(Utc::now()));
        if let Some(v) = updates.ended_at {
            qb.push(", ended_at = ").push_bind(fmt_ts(v));
        }
        if let Some(v) = updates.duration_ms {
            qb.push(", duration_ms = ").push_bind(v);
        }
        if let Some(v) = updates.end_reason {
            qb.push(", end_reason = ").push_bind(v);
        }
        if let Some(v) = updates.parse_status {
            qb.push(", parse_status = ").push_bind(v.as_str());
        }
        if let Some(v) = updates.parse_error {
            qb.push(", parse_error = ").push_bind(v);
        }
        if let Some(v) = updates.total_messages {
            qb.push(", total_messages = ").push_bind(v);
        }
        if let Some(v) = updates.cost_estimate_usd {
            qb.push(", cost_estimate_usd = ").push_bind(v);
        }
        if let Some(v) = updates.summary {
            qb.push(", summary = ").push_bind(v);
        }
        qb.push(" WHERE id = ").push_bind(session_id);
        qb.push(" AND lifecycle IN (");
        {
            let mut sep = qb.separated(", ");
            for from in &legal {
                sep.push_bind(from.as_str());
            }
        }
        qb.push(")");

        let result = qb.build().execute(&self.pool).await?;
        if result.rows_affected() == 1 {
            return Ok(TransitionOutcome::Applied);
        }

        // Diagnose: report the state the row is actually in.
        let current: Option<String> =
            sqlx::query_scalar("SELECT lifecycle FROM sessions WHERE id = ?")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?;
        let current = current.as_deref().map(Lifecycle::from_str).transpose()?;
        Ok(TransitionOutcome::NoMatch { current })
    }

    /// Take the parse claim: set `parse_status = parsing` iff the session is
    /// still `ended`. Lifecycle itself does not move; concurrent claimers
    /// are later serialized by the `ended -> parsed` transition.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    pub async fn claim_for_parse(&self, session_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE sessions SET parse_status = 'parsing', updated_at = ?
             WHERE id = ? AND lifecycle = 'ended'",
        )
        .bind(fmt_ts(Utc::now()))
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Record the transcript blob key. Returns false if a key was already
    /// present (the existing key wins).
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    pub async fn set_transcript_key(&self, session_id: &str, key: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE sessions SET transcript_s3_key = ?, updated_at = ?
             WHERE id = ? AND transcript_s3_key IS NULL",
        )
        .bind(key)
        .bind(fmt_ts(Utc::now()))
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Update the session summary outside a lifecycle transition (operator
    /// PATCH). Returns false if the session does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    pub async fn update_session_summary(
        &self,
        session_id: &str,
        summary: &str,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE sessions SET summary = ?, updated_at = ? WHERE id = ?")
            .bind(summary)
            .bind(fmt_ts(Utc::now()))
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Apply a tag mutation with set semantics. Returns the resulting tags,
    /// or None if the session does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    pub async fn update_session_tags(
        &self,
        session_id: &str,
        mutation: &TagMutation,
    ) -> anyhow::Result<Option<Vec<String>>> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT tags FROM sessions WHERE id = ?")
                .bind(session_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(current) = current else {
            return Ok(None);
        };
        let mut tags: Vec<String> = serde_json::from_str(&current).unwrap_or_default();

        match mutation {
            TagMutation::Replace(new) => {
                tags.clear();
                for tag in new {
                    if !tags.contains(tag) {
                        tags.push(tag.clone());
                    }
                }
            }
            TagMutation::Add(add) => {
                for tag in add {
                    if !tags.contains(tag) {
                        tags.push(tag.clone());
                    }
                }
            }
            TagMutation::Remove(remove) => {
                tags.retain(|t| !remove.contains(t));
            }
        }

        sqlx::query("UPDATE sessions SET tags = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(&tags)?)
            .bind(fmt_ts(Utc::now()))
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(tags))
    }

    /// Operator escape hatch for explicit reparse: reset the session to
    /// `(ended, pending)` iff a transcript key exists. Bypasses the
    /// lifecycle engine on purpose; nothing else may do this.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    pub async fn reset_for_reparse(&self, session_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE sessions
             SET lifecycle = 'ended', parse_status = 'pending', parse_error = NULL, updated_at = ?
             WHERE id = ? AND transcript_s3_key IS NOT NULL",
        )
        .bind(fmt_ts(Utc::now()))
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Cursor-paginated session list, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    pub async fn list_sessions(
        &self,
        filter: &SessionFilter,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> anyhow::Result<Page<Session>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM sessions WHERE 1=1");
        if let Some(ws) = &filter.workspace_id {
            qb.push(" AND workspace_id = ").push_bind(ws);
        }
        if let Some(dev) = &filter.device_id {
            qb.push(" AND device_id = ").push_bind(dev);
        }
        if !filter.lifecycles.is_empty() {
            qb.push(" AND lifecycle IN (");
            {
                let mut sep = qb.separated(", ");
                for state in &filter.lifecycles {
                    sep.push_bind(state.as_str());
                }
            }
            qb.push(")");
        }
        if let Some(t) = filter.since {
            qb.push(" AND started_at >= ").push_bind(fmt_ts(t));
        }
        if let Some(t) = filter.until {
            qb.push(" AND started_at <= ").push_bind(fmt_ts(t));
        }
        if let Some(tag) = &filter.tag {
            qb.push(" AND EXISTS (SELECT 1 FROM json_each(sessions.tags) WHERE json_each.value = ")
                .push_bind(tag)
                .push(")");
        }
        if let Some(cur) = cursor {
            qb.push(" AND (started_at < ")
                .push_bind(cur.s.clone())
                .push(" OR (started_at = ")
                .push_bind(cur.s.clone())
                .push(" AND id < ")
                .push_bind(cur.i.clone())
                .push("))");
        }
        qb.push(" ORDER BY started_at DESC, id DESC LIMIT ");
        qb.push_bind(limit as i64 + 1);

        let rows: Vec<SessionRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        page_of(rows, limit, |row| {
            (row.started_at.clone(), row.id.clone())
        })
    }

    /// Most recently started active session on (workspace, device) at or
    /// before `at`, within the lookback ceiling.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    pub async fn correlate_session(
        &self,
        workspace_id: &str,
        device_id: &str,
        at: DateTime<Utc>,
        lookback: chrono::Duration,
    ) -> anyhow::Result<Option<String>> {
        let floor = at - lookback;
        let id: Option<String> = sqlx::query_scalar(
            r"
            SELECT id FROM sessions
            WHERE workspace_id = ? AND device_id = ?
              AND lifecycle IN ('detected', 'capturing')
              AND started_at <= ? AND started_at >= ?
            ORDER BY started_at DESC
            LIMIT 1
            ",
        )
        .bind(workspace_id)
        .bind(device_id)
        .bind(fmt_ts(at))
        .bind(fmt_ts(floor))
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    /// Sessions stalled below a terminal parse state for longer than the
    /// threshold.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    pub async fn find_stuck_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<Vec<StuckSession>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r"
            SELECT * FROM sessions
            WHERE lifecycle IN ('ended', 'parsed')
              AND parse_status IN ('pending', 'parsing')
              AND updated_at < ?
            ORDER BY updated_at ASC
            ",
        )
        .bind(fmt_ts(cutoff))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let session: Session = row.try_into()?;
                Ok(StuckSession {
                    session_id: session.id,
                    lifecycle: session.lifecycle,
                    parse_status: session.parse_status,
                    has_transcript: session.transcript_s3_key.is_some(),
                    updated_at: session.updated_at,
                })
            })
            .collect()
    }

    // ---------------------------------------------------------------------
    // Transcripts
    // ---------------------------------------------------------------------

    /// Insert parsed messages and content blocks in one transaction.
    /// Keys are deterministic, so a re-run of the same blob is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    #[instrument(skip(self, messages, blocks), fields(messages = messages.len(), blocks = blocks.len()))]
    pub async fn insert_transcript_batch(
        &self,
        messages: &[TranscriptMessage],
        blocks: &[ContentBlock],
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        for message in messages {
            sqlx::query(
                r"
                INSERT INTO transcript_messages (
                    id, session_id, ordinal, role, timestamp, model,
                    input_tokens, output_tokens, cache_creation_tokens,
                    cache_read_tokens, cost_usd, is_compacted, compact_sequence
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(session_id, ordinal) DO NOTHING
                ",
            )
            .bind(&message.id)
            .bind(&message.session_id)
            .bind(message.ordinal)
            .bind(message.role.as_str())
            .bind(message.timestamp.map(fmt_ts))
            .bind(&message.model)
            .bind(message.input_tokens)
            .bind(message.output_tokens)
            .bind(message.cache_creation_tokens)
            .bind(message.cache_read_tokens)
            .bind(message.cost_usd)
            .bind(message.is_compacted)
            .bind(message.compact_sequence)
            .execute(&mut *tx)
            .await?;
        }

        for block in blocks {
            sqlx::query(
                r"
                INSERT INTO content_blocks (
                    message_id, session_id, block_order, block_type,
                    content_text, thinking_text, tool_name, tool_input,
                    tool_result_id, is_error, result_text
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(message_id, block_order) DO NOTHING
                ",
            )
            .bind(&block.message_id)
            .bind(&block.session_id)
            .bind(block.block_order)
            .bind(block.block_type.as_str())
            .bind(&block.content_text)
            .bind(&block.thinking_text)
            .bind(&block.tool_name)
            .bind(block.tool_input.as_ref().map(ToString::to_string))
            .bind(&block.tool_result_id)
            .bind(block.is_error)
            .bind(&block.result_text)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// All transcript messages of a session, in ordinal order.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    pub async fn list_transcript_messages(
        &self,
        session_id: &str,
    ) -> anyhow::Result<Vec<TranscriptMessage>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM transcript_messages WHERE session_id = ? ORDER BY ordinal ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// All content blocks of a session; callers group by message id.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    pub async fn list_content_blocks(
        &self,
        session_id: &str,
    ) -> anyhow::Result<Vec<ContentBlock>> {
        let rows = sqlx::query_as::<_, BlockRow>(
            "SELECT * FROM content_blocks WHERE session_id = ? ORDER BY message_id, block_order",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    // ---------------------------------------------------------------------
    // Git activity
    // ---------------------------------------------------------------------

    /// Insert a git activity row, idempotent on id.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    #[instrument(skip(self, activity), fields(activity_id = %activity.id))]
    pub async fn insert_git_activity(&self, activity: &GitActivity) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO git_activity (
                id, activity_type, workspace_id, device_id, session_id,
                branch, commit_sha, message, files_changed, insertions,
                deletions, timestamp, data
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            ",
        )
        .bind(&activity.id)
        .bind(activity.activity_type.as_str())
        .bind(&activity.workspace_id)
        .bind(&activity.device_id)
        .bind(&activity.session_id)
        .bind(&activity.branch)
        .bind(&activity.commit_sha)
        .bind(&activity.message)
        .bind(activity.files_changed)
        .bind(activity.insertions)
        .bind(activity.deletions)
        .bind(fmt_ts(activity.timestamp))
        .bind(activity.data.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Cursor-paginated git activity, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    pub async fn list_git_activity(
        &self,
        filter: &TimelineFilter,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> anyhow::Result<Page<GitActivity>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM git_activity WHERE 1=1");
        if let Some(ws) = &filter.workspace_id {
            qb.push(" AND workspace_id = ").push_bind(ws);
        }
        if let Some(sid) = &filter.session_id {
            qb.push(" AND session_id = ").push_bind(sid);
        }
        if let Some(t) = filter.since {
            qb.push(" AND timestamp >= ").push_bind(fmt_ts(t));
        }
        if let Some(t) = filter.until {
            qb.push(" AND timestamp <= ").push_bind(fmt_ts(t));
        }
        if let Some(cur) = cursor {
            qb.push(" AND (timestamp < ")
                .push_bind(cur.s.clone())
                .push(" OR (timestamp = ")
                .push_bind(cur.s.clone())
                .push(" AND id < ")
                .push_bind(cur.i.clone())
                .push("))");
        }
        qb.push(" ORDER BY timestamp DESC, id DESC LIMIT ");
        qb.push_bind(limit as i64 + 1);

        let rows: Vec<GitActivityRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        page_of(rows, limit, |row| {
            (row.timestamp.clone(), row.id.clone())
        })
    }

    // ---------------------------------------------------------------------
    // Git hooks prompts
    // ---------------------------------------------------------------------

    /// Flag the (workspace, device) pair for a git-hooks prompt, iff hooks
    /// are neither installed nor previously prompted. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    pub async fn mark_pending_git_hooks_prompt(
        &self,
        workspace_id: &str,
        device_id: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r"
            UPDATE workspace_devices SET pending_git_hooks_prompt = 1
            WHERE workspace_id = ? AND device_id = ?
              AND git_hooks_installed = 0 AND git_hooks_prompted = 0
            ",
        )
        .bind(workspace_id)
        .bind(device_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Links with an outstanding git-hooks prompt for a device.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    pub async fn pending_git_hooks_prompts(
        &self,
        device_id: &str,
    ) -> anyhow::Result<Vec<WorkspaceDeviceLink>> {
        let rows = sqlx::query_as::<_, LinkRow>(
            r"
            SELECT * FROM workspace_devices
            WHERE device_id = ? AND pending_git_hooks_prompt = 1
              AND git_hooks_installed = 0 AND git_hooks_prompted = 0
            ",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Dismiss a git-hooks prompt. Both actions clear the pending flag and
    /// mark the pair prompted; accepting also marks hooks installed.
    /// Returns false when the link does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable.
    pub async fn dismiss_git_hooks_prompt(
        &self,
        workspace_id: &str,
        device_id: &str,
        accepted: bool,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE workspace_devices SET
                pending_git_hooks_prompt = 0,
                git_hooks_prompted = 1,
                git_hooks_installed = CASE WHEN ? THEN 1 ELSE git_hooks_installed END
            WHERE workspace_id = ? AND device_id = ?
            ",
        )
        .bind(accepted)
        .bind(workspace_id)
        .bind(device_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

/// Trim a limit+1 row fetch into a page with a next cursor.
fn page_of<R, T>(
    mut rows: Vec<R>,
    limit: usize,
    cursor_key: impl Fn(&R) -> (String, String),
) -> anyhow::Result<Page<T>>
where
    R: TryInto<T, Error = anyhow::Error>,
{
    let has_more = rows.len() > limit;
    rows.truncate(limit);
    let next_cursor = if has_more {
        rows.last().map(|row| {
            let (s, i) = cursor_key(row);
            Cursor { s, i }.encode()
        })
    } else {
        None
    };
    let items = rows
        .into_iter()
        .map(TryInto::try_into)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Page {
        items,
        has_more,
        next_cursor,
    })
}

/// Row type for the workspaces table.
#[derive(sqlx::FromRow)]
struct WorkspaceRow {
    id: String,
    canonical_id: String,
    display_name: String,
    default_branch: Option<String>,
    first_seen_at: String,
}

impl TryFrom<WorkspaceRow> for Workspace {
    type Error = anyhow::Error;

    fn try_from(row: WorkspaceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            canonical_id: row.canonical_id,
            display_name: row.display_name,
            default_branch: row.default_branch,
            first_seen_at: parse_ts(&row.first_seen_at)?,
        })
    }
}

/// Row type for the devices table.
#[derive(sqlx::FromRow)]
struct DeviceRow {
    id: String,
    name: String,
    device_type: String,
    first_seen_at: String,
    last_active_at: String,
}

impl TryFrom<DeviceRow> for Device {
    type Error = anyhow::Error;

    fn try_from(row: DeviceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            name: row.name,
            device_type: row.device_type.parse()?,
            first_seen_at: parse_ts(&row.first_seen_at)?,
            last_active_at: parse_ts(&row.last_active_at)?,
        })
    }
}

/// Row type for the workspace_devices table.
#[derive(sqlx::FromRow)]
struct LinkRow {
    workspace_id: String,
    device_id: String,
    local_path: String,
    last_active_at: String,
    git_hooks_installed: bool,
    git_hooks_prompted: bool,
    pending_git_hooks_prompt: bool,
}

impl TryFrom<LinkRow> for WorkspaceDeviceLink {
    type Error = anyhow::Error;

    fn try_from(row: LinkRow) -> Result<Self, Self::Error> {
        Ok(Self {
            workspace_id: row.workspace_id,
            device_id: row.device_id,
            local_path: row.local_path,
            last_active_at: parse_ts(&row.last_active_at)?,
            git_hooks_installed: row.git_hooks_installed,
            git_hooks_prompted: row.git_hooks_prompted,
            pending_git_hooks_prompt: row.pending_git_hooks_prompt,
        })
    }
}

/// Row type for the sessions table.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    workspace_id: String,
    device_id: String,
    lifecycle: String,
    parse_status: String,
    parse_error: Option<String>,
    started_at: String,
    ended_at: Option<String>,
    duration_ms: Option<i64>,
    end_reason: Option<String>,
    git_branch: Option<String>,
    model: Option<String>,
    source: Option<String>,
    transcript_s3_key: Option<String>,
    summary: Option<String>,
    tags: String,
    total_messages: i64,
    cost_estimate_usd: Option<f64>,
    updated_at: String,
}

impl TryFrom<SessionRow> for Session {
    type Error = anyhow::Error;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let lifecycle: Lifecycle = row.lifecycle.parse().map_err(|e| {
            anyhow::anyhow!("session '{}': invalid lifecycle '{}': {e}", row.id, row.lifecycle)
        })?;
        let parse_status: ParseStatus = row.parse_status.parse().map_err(|e| {
            anyhow::anyhow!(
                "session '{}': invalid parse_status '{}': {e}",
                row.id,
                row.parse_status
            )
        })?;
        let tags: Vec<String> = serde_json::from_str(&row.tags)
            .map_err(|e| anyhow::anyhow!("session '{}': invalid tags '{}': {e}", row.id, row.tags))?;

        Ok(Self {
            id: row.id.clone(),
            workspace_id: row.workspace_id,
            device_id: row.device_id,
            lifecycle,
            parse_status,
            parse_error: row.parse_error,
            started_at: parse_ts(&row.started_at)?,
            ended_at: parse_ts_opt(row.ended_at.as_deref())?,
            duration_ms: row.duration_ms,
            end_reason: row.end_reason,
            git_branch: row.git_branch,
            model: row.model,
            source: row.source,
            transcript_s3_key: row.transcript_s3_key,
            summary: row.summary,
            tags,
            total_messages: row.total_messages,
            cost_estimate_usd: row.cost_estimate_usd,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}

/// Row type for the events table.
#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    event_type: String,
    timestamp: String,
    device_id: String,
    workspace_id: String,
    session_id: Option<String>,
    data: String,
    ingested_at: Option<String>,
    blob_refs: String,
}

impl TryFrom<EventRow> for Event {
    type Error = anyhow::Error;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            event_type: row.event_type.parse()?,
            timestamp: parse_ts(&row.timestamp)?,
            device_id: row.device_id,
            workspace_id: row.workspace_id,
            session_id: row.session_id,
            data: serde_json::from_str(&row.data)?,
            ingested_at: parse_ts_opt(row.ingested_at.as_deref())?,
            blob_refs: serde_json::from_str(&row.blob_refs)?,
        })
    }
}

/// Row type for the transcript_messages table.
#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    session_id: String,
    ordinal: i64,
    role: String,
    timestamp: Option<String>,
    model: Option<String>,
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
    cache_creation_tokens: Option<i64>,
    cache_read_tokens: Option<i64>,
    cost_usd: Option<f64>,
    is_compacted: bool,
    compact_sequence: i64,
}

impl TryFrom<MessageRow> for TranscriptMessage {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            session_id: row.session_id,
            ordinal: row.ordinal,
            role: row.role.parse()?,
            timestamp: parse_ts_opt(row.timestamp.as_deref())?,
            model: row.model,
            input_tokens: row.input_tokens,
            output_tokens: row.output_tokens,
            cache_creation_tokens: row.cache_creation_tokens,
            cache_read_tokens: row.cache_read_tokens,
            cost_usd: row.cost_usd,
            is_compacted: row.is_compacted,
            compact_sequence: row.compact_sequence,
        })
    }
}

/// Row type for the content_blocks table.
#[derive(sqlx::FromRow)]
struct BlockRow {
    message_id: String,
    session_id: String,
    block_order: i64,
    block_type: String,
    content_text: Option<String>,
    thinking_text: Option<String>,
    tool_name: Option<String>,
    tool_input: Option<String>,
    tool_result_id: Option<String>,
    is_error: Option<bool>,
    result_text: Option<String>,
}

impl TryFrom<BlockRow> for ContentBlock {
    type Error = anyhow::Error;

    fn try_from(row: BlockRow) -> Result<Self, Self::Error> {
        Ok(Self {
            message_id: row.message_id,
            session_id: row.session_id,
            block_order: row.block_order,
            block_type: row.block_type.parse()?,
            content_text: row.content_text,
            thinking_text: row.thinking_text,
            tool_name: row.tool_name,
            tool_input: row
                .tool_input
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            tool_result_id: row.tool_result_id,
            is_error: row.is_error,
            result_text: row.result_text,
        })
    }
}

/// Row type for the git_activity table.
#[derive(sqlx::FromRow)]
struct GitActivityRow {
    id: String,
    activity_type: String,
    workspace_id: String,
    device_id: String,
    session_id: Option<String>,
    branch: Option<String>,
    commit_sha: Option<String>,
    message: Option<String>,
    files_changed: Option<i64>,
    insertions: Option<i64>,
    deletions: Option<i64>,
    timestamp: String,
    data: String,
}

impl TryFrom<GitActivityRow> for GitActivity {
    type Error = anyhow::Error;

    fn try_from(row: GitActivityRow) -> Result<Self, Self::Error> {
        let activity_type: EventType = row.activity_type.parse()?;
        Ok(Self {
            id: row.id,
            activity_type,
            workspace_id: row.workspace_id,
            device_id: row.device_id,
            session_id: row.session_id,
            branch: row.branch,
            commit_sha: row.commit_sha,
            message: row.message,
            files_changed: row.files_changed,
            insertions: row.insertions,
            deletions: row.deletions,
            timestamp: parse_ts(&row.timestamp)?,
            data: serde_json::from_str(&row.data)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn test_store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(&dir.path().join("test.db")).await.unwrap();
        (store, dir)
    }

    async fn seed_session(store: &SqliteStore, id: &str) -> (String, String) {
        let workspace_id = store
            .resolve_workspace("github.com/u/r", &WorkspaceHints::default())
            .await
            .unwrap();
        store
            .resolve_device("d1", "laptop", DeviceType::Local)
            .await
            .unwrap();
        store
            .create_session(id, &workspace_id, "d1", Utc::now(), Some("main"), None, Some("startup"))
            .await
            .unwrap();
        (workspace_id, "d1".to_owned())
    }

    #[tokio::test]
    async fn test_resolve_workspace_is_get_or_create() {
        let (store, _dir) = test_store().await;
        let first = store
            .resolve_workspace("github.com/u/r", &WorkspaceHints::default())
            .await
            .unwrap();
        let second = store
            .resolve_workspace("github.com/u/r", &WorkspaceHints::default())
            .await
            .unwrap();
        assert_eq!(first, second);

        let workspaces = store.list_workspaces().await.unwrap();
        assert_eq!(workspaces.len(), 1);
        assert_eq!(workspaces[0].display_name, "r");
    }

    #[tokio::test]
    async fn test_concurrent_workspace_resolution_yields_one_row() {
        let (store, _dir) = test_store().await;
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .resolve_workspace("github.com/x/y", &WorkspaceHints::default())
                    .await
                    .unwrap()
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1, "all resolvers must agree on one id");

        let workspaces = store.list_workspaces().await.unwrap();
        assert_eq!(workspaces.len(), 1);
    }

    #[tokio::test]
    async fn test_device_last_active_is_monotonic() {
        let (store, _dir) = test_store().await;
        store
            .resolve_device("d1", "laptop", DeviceType::Local)
            .await
            .unwrap();
        let first = store.list_devices().await.unwrap()[0].last_active_at;

        store
            .resolve_device("d1", "laptop", DeviceType::Local)
            .await
            .unwrap();
        let second = store.list_devices().await.unwrap()[0].last_active_at;
        assert!(second >= first);
    }

    #[tokio::test]
    async fn test_event_insert_is_idempotent() {
        let (store, _dir) = test_store().await;
        let event = Event {
            id: "evt-1".to_owned(),
            event_type: EventType::SystemHeartbeat,
            timestamp: Utc::now(),
            device_id: "d1".to_owned(),
            workspace_id: "ws-1".to_owned(),
            session_id: None,
            data: serde_json::json!({}),
            ingested_at: Some(Utc::now()),
            blob_refs: vec![],
        };

        assert!(store.insert_event(&event).await.unwrap());
        assert!(!store.insert_event(&event).await.unwrap(), "duplicate id must be a no-op");
        assert!(store.event_exists("evt-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_transition_applies_and_reports_no_match() {
        let (store, _dir) = test_store().await;
        seed_session(&store, "cc-1").await;

        let outcome = store
            .transition(
                "cc-1",
                Lifecycle::Ended,
                &[Lifecycle::Detected, Lifecycle::Capturing],
                TransitionUpdates {
                    ended_at: Some(Utc::now()),
                    duration_ms: Some(60_000),
                    end_reason: Some("exit".to_owned()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(outcome.applied());

        // A second attempt reports the actual state instead of applying.
        let outcome = store
            .transition(
                "cc-1",
                Lifecycle::Ended,
                &[Lifecycle::Detected, Lifecycle::Capturing],
                TransitionUpdates::default(),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TransitionOutcome::NoMatch {
                current: Some(Lifecycle::Ended)
            }
        );

        let session = store.get_session("cc-1").await.unwrap().unwrap();
        assert_eq!(session.lifecycle, Lifecycle::Ended);
        assert_eq!(session.duration_ms, Some(60_000));
        assert_eq!(session.end_reason.as_deref(), Some("exit"));
    }

    #[tokio::test]
    async fn test_transition_unknown_session_reports_none() {
        let (store, _dir) = test_store().await;
        let outcome = store
            .transition(
                "ghost",
                Lifecycle::Ended,
                &[Lifecycle::Detected],
                TransitionUpdates::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::NoMatch { current: None });
    }

    #[tokio::test]
    async fn test_transition_rejects_illegal_edges() {
        let (store, _dir) = test_store().await;
        seed_session(&store, "cc-1").await;
        let result = store
            .transition(
                "cc-1",
                Lifecycle::Detected,
                &[Lifecycle::Ended],
                TransitionUpdates::default(),
            )
            .await;
        assert!(result.is_err(), "ended -> detected is not an edge");
    }

    #[tokio::test]
    async fn test_claim_for_parse_requires_ended() {
        let (store, _dir) = test_store().await;
        seed_session(&store, "cc-1").await;
        assert!(!store.claim_for_parse("cc-1").await.unwrap());

        store
            .transition(
                "cc-1",
                Lifecycle::Ended,
                &[Lifecycle::Detected],
                TransitionUpdates::default(),
            )
            .await
            .unwrap();
        assert!(store.claim_for_parse("cc-1").await.unwrap());

        let session = store.get_session("cc-1").await.unwrap().unwrap();
        assert_eq!(session.parse_status, ParseStatus::Parsing);
        assert_eq!(session.lifecycle, Lifecycle::Ended);
    }

    #[tokio::test]
    async fn test_transcript_key_first_write_wins() {
        let (store, _dir) = test_store().await;
        seed_session(&store, "cc-1").await;
        assert!(store.set_transcript_key("cc-1", "k1").await.unwrap());
        assert!(!store.set_transcript_key("cc-1", "k2").await.unwrap());
        let session = store.get_session("cc-1").await.unwrap().unwrap();
        assert_eq!(session.transcript_s3_key.as_deref(), Some("k1"));
    }

    #[tokio::test]
    async fn test_tag_mutations_have_set_semantics() {
        let (store, _dir) = test_store().await;
        seed_session(&store, "cc-1").await;

        let tags = store
            .update_session_tags("cc-1", &TagMutation::Add(vec!["x".to_owned()]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tags, vec!["x"]);

        // Adding the same tag again keeps a single occurrence.
        let tags = store
            .update_session_tags("cc-1", &TagMutation::Add(vec!["x".to_owned()]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tags, vec!["x"]);

        let tags = store
            .update_session_tags(
                "cc-1",
                &TagMutation::Replace(vec!["a".to_owned(), "b".to_owned(), "a".to_owned()]),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tags, vec!["a", "b"]);

        let tags = store
            .update_session_tags("cc-1", &TagMutation::Remove(vec!["a".to_owned()]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tags, vec!["b"]);

        assert!(store
            .update_session_tags("ghost", &TagMutation::Add(vec!["x".to_owned()]))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_list_sessions_filters_by_tag_and_lifecycle() {
        let (store, _dir) = test_store().await;
        seed_session(&store, "cc-1").await;
        seed_session(&store, "cc-2").await;
        store
            .update_session_tags("cc-1", &TagMutation::Add(vec!["urgent".to_owned()]))
            .await
            .unwrap();

        let filter = SessionFilter {
            tag: Some("urgent".to_owned()),
            ..Default::default()
        };
        let page = store.list_sessions(&filter, None, 50).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, "cc-1");

        let filter = SessionFilter {
            lifecycles: vec![Lifecycle::Detected],
            ..Default::default()
        };
        let page = store.list_sessions(&filter, None, 50).await.unwrap();
        assert_eq!(page.items.len(), 2);
    }

    #[tokio::test]
    async fn test_keyset_pagination_walks_to_an_empty_tail() {
        let (store, _dir) = test_store().await;
        for i in 0..5 {
            seed_session(&store, &format!("cc-{i}")).await;
        }

        let filter = SessionFilter::default();
        let first = store.list_sessions(&filter, None, 3).await.unwrap();
        assert_eq!(first.items.len(), 3);
        assert!(first.has_more);
        let cursor = Cursor::decode(first.next_cursor.as_deref().unwrap()).unwrap();

        let second = store
            .list_sessions(&filter, Some(&cursor), 3)
            .await
            .unwrap();
        assert_eq!(second.items.len(), 2);
        assert!(!second.has_more);
        assert!(second.next_cursor.is_none());

        // Page sizes exactly consuming the rows: the following page is empty.
        let exact = store.list_sessions(&filter, None, 5).await.unwrap();
        assert!(!exact.has_more);

        let mut seen: Vec<String> = first
            .items
            .iter()
            .chain(second.items.iter())
            .map(|session| session.id.clone())
            .collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 5, "pages must not overlap or skip");
    }

    #[tokio::test]
    async fn test_correlate_prefers_latest_active_session_within_lookback() {
        let (store, _dir) = test_store().await;
        let (workspace_id, device_id) = seed_session(&store, "cc-old").await;
        seed_session(&store, "cc-new").await;

        // Push cc-old far into the past by re-creating it with an old start.
        sqlx::query("UPDATE sessions SET started_at = ? WHERE id = 'cc-old'")
            .bind(fmt_ts(Utc::now() - chrono::Duration::days(3)))
            .execute(&store.pool)
            .await
            .unwrap();

        let hit = store
            .correlate_session(&workspace_id, &device_id, Utc::now(), chrono::Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(hit.as_deref(), Some("cc-new"));

        // An ended session is not an active correlation target.
        store
            .transition(
                "cc-new",
                Lifecycle::Ended,
                &[Lifecycle::Detected],
                TransitionUpdates::default(),
            )
            .await
            .unwrap();
        let hit = store
            .correlate_session(&workspace_id, &device_id, Utc::now(), chrono::Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(hit, None, "cc-old is outside the lookback ceiling");
    }

    #[tokio::test]
    async fn test_find_stuck_sessions_honors_cutoff() {
        let (store, _dir) = test_store().await;
        seed_session(&store, "cc-1").await;
        store
            .transition(
                "cc-1",
                Lifecycle::Ended,
                &[Lifecycle::Detected],
                TransitionUpdates::default(),
            )
            .await
            .unwrap();
        sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = 'cc-1'")
            .bind(fmt_ts(Utc::now() - chrono::Duration::hours(48)))
            .execute(&store.pool)
            .await
            .unwrap();

        let stuck = store
            .find_stuck_sessions(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].session_id, "cc-1");
        assert!(!stuck[0].has_transcript);
    }

    #[tokio::test]
    async fn test_transcript_batch_is_rerunnable() {
        let (store, _dir) = test_store().await;
        seed_session(&store, "cc-1").await;

        let message = TranscriptMessage {
            id: "cc-1:1".to_owned(),
            session_id: "cc-1".to_owned(),
            ordinal: 1,
            role: crate::core::MessageRole::User,
            timestamp: Some(Utc::now()),
            model: None,
            input_tokens: None,
            output_tokens: None,
            cache_creation_tokens: None,
            cache_read_tokens: None,
            cost_usd: None,
            is_compacted: false,
            compact_sequence: 0,
        };
        let block = ContentBlock {
            message_id: "cc-1:1".to_owned(),
            session_id: "cc-1".to_owned(),
            block_order: 0,
            block_type: crate::core::BlockType::Text,
            content_text: Some("hello".to_owned()),
            thinking_text: None,
            tool_name: None,
            tool_input: None,
            tool_result_id: None,
            is_error: None,
            result_text: None,
        };

        store
            .insert_transcript_batch(std::slice::from_ref(&message), std::slice::from_ref(&block))
            .await
            .unwrap();
        store
            .insert_transcript_batch(&[message], &[block])
            .await
            .unwrap();

        assert_eq!(store.list_transcript_messages("cc-1").await.unwrap().len(), 1);
        assert_eq!(store.list_content_blocks("cc-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_git_hooks_prompt_flow() {
        let (store, _dir) = test_store().await;
        let (workspace_id, device_id) = seed_session(&store, "cc-1").await;
        store
            .ensure_workspace_device_link(&workspace_id, &device_id, "/r")
            .await
            .unwrap();

        store
            .mark_pending_git_hooks_prompt(&workspace_id, &device_id)
            .await
            .unwrap();
        let pending = store.pending_git_hooks_prompts(&device_id).await.unwrap();
        assert_eq!(pending.len(), 1);

        assert!(store
            .dismiss_git_hooks_prompt(&workspace_id, &device_id, true)
            .await
            .unwrap());
        let pending = store.pending_git_hooks_prompts(&device_id).await.unwrap();
        assert!(pending.is_empty());

        // Marking again after a prompt was answered is a no-op.
        store
            .mark_pending_git_hooks_prompt(&workspace_id, &device_id)
            .await
            .unwrap();
        assert!(store.pending_git_hooks_prompts(&device_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_for_reparse_requires_transcript() {
        let (store, _dir) = test_store().await;
        seed_session(&store, "cc-1").await;
        assert!(!store.reset_for_reparse("cc-1").await.unwrap());

        store.set_transcript_key("cc-1", "k").await.unwrap();
        store
            .transition(
                "cc-1",
                Lifecycle::Failed,
                &[Lifecycle::Detected],
                TransitionUpdates::default(),
            )
            .await
            .unwrap();
        assert!(store.reset_for_reparse("cc-1").await.unwrap());
        let session = store.get_session("cc-1").await.unwrap().unwrap();
        assert_eq!(session.lifecycle, Lifecycle::Ended);
        assert_eq!(session.parse_status, ParseStatus::Pending);
        assert!(session.parse_error.is_none());
    }
}
