// SQLite persistence for threads, messages, artifacts, jobs, approvals,
// ledger, deployments, tool approvals, memory, and tasks.
//
// One connection behind an async mutex; WAL journal mode. Every read-then-
// write transition runs inside an immediate transaction with a status guard,
// so a row can never be claimed or resolved twice.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use tokio::sync::Mutex;

use adjutant_types::{
    AgentTask, Approval, ApprovalStatus, Artifact, ArtifactKind, ArtifactStatus, ChatThread,
    Classification, Deployment, DeploymentStatus, Goal, JobMode, JobStatus, LedgerEntry,
    LedgerScope, MemoryNote, MessageRole, ReactiveJob, StoredMessage, TaskSource, TaskStatus,
    ToolApproval, ToolApprovalStatus,
};

use crate::error::{is_unique_violation, StoreError, StoreResult};

/// Outcome of an idempotent message insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageInsert {
    Inserted,
    Duplicate,
}

/// Reaper sweep summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaperReport {
    pub requeued: usize,
    pub failed: usize,
}

pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path`.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn).await
    }

    /// In-memory database, used by tests.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn).await
    }

    async fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(Duration::from_secs(10))?;
        // PRAGMA journal_mode returns a row, so query_row and ignore it.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS threads (
                id TEXT PRIMARY KEY,
                platform TEXT NOT NULL,
                external_chat_id TEXT NOT NULL,
                chat_type TEXT NOT NULL,
                title TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                metadata TEXT,
                UNIQUE(platform, external_chat_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL REFERENCES threads(id),
                external_message_id TEXT,
                role TEXT NOT NULL CHECK(role IN ('user','assistant','system')),
                author_id TEXT,
                text TEXT,
                created_at TEXT NOT NULL,
                edited_at TEXT,
                raw_payload TEXT,
                UNIQUE(thread_id, external_message_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS artifacts (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL REFERENCES messages(id),
                kind TEXT NOT NULL CHECK(kind IN
                    ('voice_transcript','image_struct','ocr_text','file_meta','tool_result')),
                content TEXT,
                uri TEXT,
                status TEXT NOT NULL CHECK(status IN ('pending','processing','done','failed')),
                attempt_count INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL REFERENCES threads(id),
                trigger_message_id TEXT NOT NULL,
                mode TEXT NOT NULL CHECK(mode IN ('classify','execute','answer')),
                status TEXT NOT NULL CHECK(status IN
                    ('queued','running','awaiting_approval','done','failed','canceled','superseded')),
                payload TEXT,
                classification TEXT,
                approval_id TEXT,
                result TEXT,
                error TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                claimed_by TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS approvals (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL REFERENCES threads(id),
                job_id TEXT NOT NULL UNIQUE,
                proposal_text TEXT NOT NULL,
                control_message_id TEXT,
                status TEXT NOT NULL CHECK(status IN
                    ('pending','approved','rejected','superseded','expired')),
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                resolved_at TEXT,
                resolver_id TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS ledger (
                id TEXT PRIMARY KEY,
                scope TEXT NOT NULL CHECK(scope IN ('reactive','proactive')),
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                tokens_in INTEGER NOT NULL,
                tokens_out INTEGER NOT NULL,
                tokens_total INTEGER NOT NULL,
                cost REAL NOT NULL,
                created_at TEXT NOT NULL,
                meta TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                commit_id TEXT NOT NULL,
                branch TEXT NOT NULL,
                status TEXT NOT NULL CHECK(status IN
                    ('building','testing','deploying','healthy','rolled_back','failed')),
                started_at TEXT NOT NULL,
                finished_at TEXT,
                report TEXT,
                rollback_reason TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tool_approvals (
                id TEXT PRIMARY KEY,
                tool_name TEXT NOT NULL,
                input TEXT NOT NULL,
                reasoning TEXT,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                status TEXT NOT NULL CHECK(status IN ('pending','approved','rejected','expired')),
                response TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS agent_memory (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                category TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                metadata TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                parent_id TEXT,
                goal_id TEXT,
                title TEXT NOT NULL,
                detail TEXT,
                source TEXT NOT NULL CHECK(source IN ('master','agent')),
                priority INTEGER NOT NULL DEFAULT 0,
                order_index INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL CHECK(status IN ('pending','in_progress','done','failed')),
                created_at TEXT NOT NULL,
                completed_at TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS goals (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                detail TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id, created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_artifacts_message ON artifacts(message_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_jobs_queue ON jobs(status, created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_ledger_scope ON ledger(scope, created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, source, priority)",
            [],
        )?;
        // At most one pending approval per thread, enforced at the schema
        // level so the invariant survives any caller bug.
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_approvals_pending_thread
             ON approvals(thread_id) WHERE status = 'pending'",
            [],
        )?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------

    /// Insert or refresh the thread for `(platform, external_chat_id)` and
    /// return the stored row.
    pub async fn upsert_thread(
        &self,
        platform: &str,
        external_chat_id: &str,
        chat_type: &str,
        title: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<ChatThread> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO threads (id, platform, external_chat_id, chat_type, title, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(platform, external_chat_id) DO UPDATE SET
                 updated_at = excluded.updated_at,
                 title = COALESCE(excluded.title, threads.title)",
            params![
                uuid::Uuid::new_v4().to_string(),
                platform,
                external_chat_id,
                chat_type,
                title,
                at.to_rfc3339(),
            ],
        )?;
        let thread = conn.query_row(
            "SELECT id, platform, external_chat_id, chat_type, title, created_at, updated_at, metadata
             FROM threads WHERE platform = ?1 AND external_chat_id = ?2",
            params![platform, external_chat_id],
            thread_from_row,
        )?;
        Ok(thread)
    }

    pub async fn get_thread(&self, thread_id: &str) -> StoreResult<ChatThread> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, platform, external_chat_id, chat_type, title, created_at, updated_at, metadata
             FROM threads WHERE id = ?1",
            params![thread_id],
            thread_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("thread {thread_id}")))
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Insert under the `(thread_id, external_message_id)` unique guard.
    /// A replayed event maps to `Duplicate` and is not an error.
    pub async fn insert_message(&self, msg: &StoredMessage) -> StoreResult<MessageInsert> {
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT INTO messages
                 (id, thread_id, external_message_id, role, author_id, text, created_at, raw_payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                msg.id,
                msg.thread_id,
                msg.external_message_id,
                msg.role.as_str(),
                msg.author_id,
                msg.text,
                msg.created_at.to_rfc3339(),
                msg.raw_payload.as_ref().map(|v| v.to_string()),
            ],
        );
        match result {
            Ok(_) => Ok(MessageInsert::Inserted),
            Err(err) if is_unique_violation(&err) => Ok(MessageInsert::Duplicate),
            Err(err) => Err(err.into()),
        }
    }

    /// Record an edit: refresh the raw payload and set `edited_at`. Returns
    /// false when the original message is unknown.
    pub async fn mark_message_edited(
        &self,
        thread_id: &str,
        external_message_id: &str,
        text: Option<&str>,
        raw_payload: Option<&Value>,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE messages SET edited_at = ?1, text = COALESCE(?2, text),
                 raw_payload = COALESCE(?3, raw_payload)
             WHERE thread_id = ?4 AND external_message_id = ?5",
            params![
                at.to_rfc3339(),
                text,
                raw_payload.map(|v| v.to_string()),
                thread_id,
                external_message_id,
            ],
        )?;
        Ok(changed > 0)
    }

    pub async fn get_message(&self, message_id: &str) -> StoreResult<StoredMessage> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, thread_id, external_message_id, role, author_id, text, created_at, edited_at, raw_payload
             FROM messages WHERE id = ?1",
            params![message_id],
            message_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))
    }

    /// Last `limit` messages of a thread in chronological order.
    pub async fn recent_messages(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<StoredMessage>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, thread_id, external_message_id, role, author_id, text, created_at, edited_at, raw_payload
             FROM messages WHERE thread_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let mut rows = stmt
            .query_map(params![thread_id, limit as i64], message_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Artifacts
    // ------------------------------------------------------------------

    pub async fn insert_artifact(&self, artifact: &Artifact) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO artifacts
                 (id, message_id, kind, content, uri, status, attempt_count, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                artifact.id,
                artifact.message_id,
                artifact.kind.as_str(),
                artifact.content.as_ref().map(|v| v.to_string()),
                artifact.uri,
                artifact.status.as_str(),
                artifact.attempt_count,
                artifact.error,
                artifact.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Guarded artifact transition. Transitions are monotone except the
    /// failed → pending retry, which bumps the attempt counter. `content` is
    /// required when moving to `done`.
    pub async fn advance_artifact(
        &self,
        artifact_id: &str,
        expected: ArtifactStatus,
        next: ArtifactStatus,
        content: Option<&Value>,
        error: Option<&str>,
    ) -> StoreResult<()> {
        if next == ArtifactStatus::Done && content.is_none() {
            return Err(StoreError::Conflict(
                "artifact cannot be done without content".to_string(),
            ));
        }
        let retry = expected == ArtifactStatus::Failed && next == ArtifactStatus::Pending;
        let legal = retry
            || matches!(
                (expected, next),
                (ArtifactStatus::Pending, ArtifactStatus::Processing)
                    | (ArtifactStatus::Pending, ArtifactStatus::Done)
                    | (ArtifactStatus::Pending, ArtifactStatus::Failed)
                    | (ArtifactStatus::Processing, ArtifactStatus::Done)
                    | (ArtifactStatus::Processing, ArtifactStatus::Failed)
            );
        if !legal {
            return Err(StoreError::Conflict(format!(
                "illegal artifact transition {} -> {}",
                expected.as_str(),
                next.as_str()
            )));
        }
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE artifacts SET status = ?1,
                 content = COALESCE(?2, content),
                 error = ?3,
                 attempt_count = attempt_count + ?4
             WHERE id = ?5 AND status = ?6",
            params![
                next.as_str(),
                content.map(|v| v.to_string()),
                error,
                if retry { 1 } else { 0 },
                artifact_id,
                expected.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::StaleGuard(format!(
                "artifact {artifact_id} is not {}",
                expected.as_str()
            )));
        }
        Ok(())
    }

    /// Completed artifacts for one message.
    pub async fn done_artifacts_for_message(
        &self,
        message_id: &str,
    ) -> StoreResult<Vec<Artifact>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, message_id, kind, content, uri, status, attempt_count, error, created_at
             FROM artifacts WHERE message_id = ?1 AND status = 'done'
             ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![message_id], artifact_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Clear blob content of done artifacts older than the cutoff. Rows are
    /// kept so history stays navigable.
    pub async fn prune_artifacts(&self, older_than: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE artifacts SET content = NULL, uri = NULL
             WHERE status = 'done' AND created_at < ?1
               AND (content IS NOT NULL OR uri IS NOT NULL)",
            params![older_than.to_rfc3339()],
        )?;
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    pub async fn enqueue_job(&self, job: &ReactiveJob) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO jobs
                 (id, thread_id, trigger_message_id, mode, status, payload, classification,
                  approval_id, attempts, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                job.id,
                job.thread_id,
                job.trigger_message_id,
                job.mode.as_str(),
                job.status.as_str(),
                job.payload.as_ref().map(|v| v.to_string()),
                job.classification
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                job.approval_id,
                job.attempts,
                job.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Atomically claim the oldest queued job whose mode is in `modes`.
    /// The select and the guarded update run in one immediate transaction,
    /// so no job is ever returned to two workers.
    pub async fn claim_next_job(
        &self,
        modes: &[JobMode],
        worker_id: &str,
    ) -> StoreResult<Option<ReactiveJob>> {
        if modes.is_empty() {
            return Ok(None);
        }
        // Mode names come from a closed enum, safe to inline.
        let mode_list = modes
            .iter()
            .map(|m| format!("'{}'", m.as_str()))
            .collect::<Vec<_>>()
            .join(", ");

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let sql = format!(
            "SELECT id FROM jobs WHERE status = 'queued' AND mode IN ({mode_list})
             ORDER BY created_at ASC, id ASC LIMIT 1"
        );
        let candidate: Option<String> = tx.query_row(&sql, [], |row| row.get(0)).optional()?;
        let Some(job_id) = candidate else {
            tx.commit()?;
            return Ok(None);
        };

        let now = Utc::now();
        let changed = tx.execute(
            "UPDATE jobs SET status = 'running', started_at = ?1, claimed_by = ?2,
                 attempts = attempts + 1
             WHERE id = ?3 AND status = 'queued'",
            params![now.to_rfc3339(), worker_id, job_id],
        )?;
        if changed == 0 {
            tx.commit()?;
            return Ok(None);
        }

        let job = tx.query_row(JOB_SELECT_BY_ID, params![job_id], job_from_row)?;
        tx.commit()?;
        Ok(Some(job))
    }

    pub async fn get_job(&self, job_id: &str) -> StoreResult<ReactiveJob> {
        let conn = self.conn.lock().await;
        conn.query_row(JOB_SELECT_BY_ID, params![job_id], job_from_row)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))
    }

    /// Guarded status move. Fails with `StaleGuard` when the row left the
    /// expected state, and refuses to leave a terminal state.
    pub async fn update_job_status(
        &self,
        job_id: &str,
        expected: JobStatus,
        next: JobStatus,
    ) -> StoreResult<()> {
        if expected.is_terminal() {
            return Err(StoreError::StaleGuard(format!(
                "job {job_id} already terminal ({})",
                expected.as_str()
            )));
        }
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE jobs SET status = ?1 WHERE id = ?2 AND status = ?3",
            params![next.as_str(), job_id, expected.as_str()],
        )?;
        if changed == 0 {
            return Err(StoreError::StaleGuard(format!(
                "job {job_id} is not {}",
                expected.as_str()
            )));
        }
        Ok(())
    }

    pub async fn set_job_classification(
        &self,
        job_id: &str,
        classification: &Classification,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE jobs SET classification = ?1 WHERE id = ?2",
            params![serde_json::to_string(classification)?, job_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("job {job_id}")));
        }
        Ok(())
    }

    pub async fn link_job_approval(&self, job_id: &str, approval_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE jobs SET approval_id = ?1 WHERE id = ?2",
            params![approval_id, job_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("job {job_id}")));
        }
        Ok(())
    }

    /// Terminal transition with result or error. Guarded on the current
    /// status like `update_job_status`.
    pub async fn finish_job(
        &self,
        job_id: &str,
        expected: JobStatus,
        next: JobStatus,
        result: Option<&Value>,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE jobs SET status = ?1, result = ?2, error = ?3, finished_at = ?4
             WHERE id = ?5 AND status = ?6",
            params![
                next.as_str(),
                result.map(|v| v.to_string()),
                error,
                at.to_rfc3339(),
                job_id,
                expected.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::StaleGuard(format!(
                "job {job_id} is not {}",
                expected.as_str()
            )));
        }
        Ok(())
    }

    /// Reaper: requeue crash-suspect running jobs, fail the ones out of
    /// attempts. `older_than` is `started_at + D_e + grace` computed by the
    /// caller.
    pub async fn requeue_stale_running(
        &self,
        older_than: DateTime<Utc>,
        max_attempts: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<ReaperReport> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let requeued = tx.execute(
            "UPDATE jobs SET status = 'queued', started_at = NULL, claimed_by = NULL
             WHERE status = 'running' AND started_at < ?1 AND attempts < ?2",
            params![older_than.to_rfc3339(), max_attempts],
        )?;
        let failed = tx.execute(
            "UPDATE jobs SET status = 'failed', error = 'max attempts exceeded', finished_at = ?1
             WHERE status = 'running' AND started_at < ?2 AND attempts >= ?3",
            params![now.to_rfc3339(), older_than.to_rfc3339(), max_attempts],
        )?;
        tx.commit()?;
        if requeued > 0 || failed > 0 {
            tracing::debug!(requeued, failed, "swept stale running jobs");
        }
        Ok(ReaperReport { requeued, failed })
    }

    pub async fn queued_depth(&self) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        let depth = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = 'queued'",
            [],
            |row| row.get(0),
        )?;
        Ok(depth)
    }

    // ------------------------------------------------------------------
    // Approvals
    // ------------------------------------------------------------------

    /// Insert a pending approval. The partial unique index turns a second
    /// pending approval on the same thread into `Conflict`.
    pub async fn create_approval(&self, approval: &Approval) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT INTO approvals
                 (id, thread_id, job_id, proposal_text, control_message_id, status,
                  created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                approval.id,
                approval.thread_id,
                approval.job_id,
                approval.proposal_text,
                approval.control_message_id,
                approval.status.as_str(),
                approval.created_at.to_rfc3339(),
                approval.expires_at.to_rfc3339(),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(StoreError::Conflict(format!(
                "pending approval already exists for thread {}",
                approval.thread_id
            ))),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_approval(&self, approval_id: &str) -> StoreResult<Approval> {
        let conn = self.conn.lock().await;
        conn.query_row(APPROVAL_SELECT_BY_ID, params![approval_id], approval_from_row)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("approval {approval_id}")))
    }

    pub async fn set_approval_control_message(
        &self,
        approval_id: &str,
        control_message_id: &str,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE approvals SET control_message_id = ?1 WHERE id = ?2",
            params![control_message_id, approval_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("approval {approval_id}")));
        }
        Ok(())
    }

    /// Transition pending → `outcome` iff still pending and return the prior
    /// status. A repeat of the same resolution is a no-op returning the
    /// (already terminal) prior status; a different outcome is `StaleGuard`.
    pub async fn resolve_approval(
        &self,
        approval_id: &str,
        outcome: ApprovalStatus,
        resolver_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<ApprovalStatus> {
        if outcome == ApprovalStatus::Pending {
            return Err(StoreError::Conflict(
                "cannot resolve an approval back to pending".to_string(),
            ));
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let prior: Option<String> = tx
            .query_row(
                "SELECT status FROM approvals WHERE id = ?1",
                params![approval_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(prior) = prior else {
            return Err(StoreError::NotFound(format!("approval {approval_id}")));
        };
        let prior = ApprovalStatus::parse(&prior)
            .ok_or_else(|| StoreError::Conflict(format!("bad approval status {prior}")))?;

        if prior == ApprovalStatus::Pending {
            tx.execute(
                "UPDATE approvals SET status = ?1, resolved_at = ?2, resolver_id = ?3
                 WHERE id = ?4 AND status = 'pending'",
                params![outcome.as_str(), at.to_rfc3339(), resolver_id, approval_id],
            )?;
            tx.commit()?;
            Ok(ApprovalStatus::Pending)
        } else if prior == outcome {
            // Duplicate callback: idempotent.
            Ok(prior)
        } else {
            Err(StoreError::StaleGuard(format!(
                "approval {approval_id} already {}",
                prior.as_str()
            )))
        }
    }

    pub async fn pending_approval_for_thread(
        &self,
        thread_id: &str,
    ) -> StoreResult<Option<Approval>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT id, thread_id, job_id, proposal_text, control_message_id, status,
                        created_at, expires_at, resolved_at, resolver_id
                 FROM approvals WHERE thread_id = ?1 AND status = 'pending'",
                params![thread_id],
                approval_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Supersede every pending approval on a thread and cancel the owning
    /// jobs, all in one transaction. Returns the superseded approvals.
    pub async fn supersede_pending_for_thread(
        &self,
        thread_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Vec<Approval>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let pending = {
            let mut stmt = tx.prepare(
                "SELECT id, thread_id, job_id, proposal_text, control_message_id, status,
                        created_at, expires_at, resolved_at, resolver_id
                 FROM approvals WHERE thread_id = ?1 AND status = 'pending'",
            )?;
            let rows = stmt
                .query_map(params![thread_id], approval_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for approval in &pending {
            tx.execute(
                "UPDATE approvals SET status = 'superseded', resolved_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![at.to_rfc3339(), approval.id],
            )?;
            tx.execute(
                "UPDATE jobs SET status = 'canceled', finished_at = ?1,
                     error = 'superseded by newer message'
                 WHERE id = ?2 AND status IN ('queued', 'awaiting_approval')",
                params![at.to_rfc3339(), approval.job_id],
            )?;
        }
        tx.commit()?;
        Ok(pending)
    }

    /// Expire overdue pending approvals and fail their jobs. Returns the
    /// expired approvals so the coordinator can notify the thread.
    pub async fn expire_due_approvals(&self, now: DateTime<Utc>) -> StoreResult<Vec<Approval>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let due = {
            let mut stmt = tx.prepare(
                "SELECT id, thread_id, job_id, proposal_text, control_message_id, status,
                        created_at, expires_at, resolved_at, resolver_id
                 FROM approvals WHERE status = 'pending' AND expires_at < ?1",
            )?;
            let rows = stmt
                .query_map(params![now.to_rfc3339()], approval_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for approval in &due {
            tx.execute(
                "UPDATE approvals SET status = 'expired', resolved_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![now.to_rfc3339(), approval.id],
            )?;
            tx.execute(
                "UPDATE jobs SET status = 'failed', error = 'approval_expired', finished_at = ?1
                 WHERE id = ?2 AND status IN ('queued', 'awaiting_approval')",
                params![now.to_rfc3339(), approval.job_id],
            )?;
        }
        tx.commit()?;
        Ok(due)
    }

    // ------------------------------------------------------------------
    // Ledger
    // ------------------------------------------------------------------

    pub async fn record_ledger(&self, entry: &LedgerEntry) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO ledger
                 (id, scope, provider, model, tokens_in, tokens_out, tokens_total, cost,
                  created_at, meta)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.id,
                entry.scope.as_str(),
                entry.provider,
                entry.model,
                entry.tokens_in,
                entry.tokens_out,
                entry.tokens_total,
                entry.cost,
                entry.created_at.to_rfc3339(),
                entry.meta.as_ref().map(|v| v.to_string()),
            ],
        )?;
        Ok(())
    }

    /// Sum of proactive `tokens_total` for a `YYYY-MM-DD` UTC day.
    /// RFC3339 timestamps sort textually, so the day prefix is enough.
    pub async fn proactive_tokens_for_day(&self, day: &str) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        let used: i64 = conn.query_row(
            "SELECT COALESCE(SUM(tokens_total), 0) FROM ledger
             WHERE scope = 'proactive' AND substr(created_at, 1, 10) = ?1",
            params![day],
            |row| row.get(0),
        )?;
        Ok(used)
    }

    pub async fn ledger_count(&self, scope: LedgerScope, day: &str) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ledger
             WHERE scope = ?1 AND substr(created_at, 1, 10) = ?2",
            params![scope.as_str(), day],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Deployments
    // ------------------------------------------------------------------

    /// Create a deployment in `building`. Rejected while another deployment
    /// is still in flight.
    pub async fn create_deployment(&self, deployment: &Deployment) -> StoreResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let in_flight: i64 = tx.query_row(
            "SELECT COUNT(*) FROM deployments
             WHERE status NOT IN ('healthy', 'rolled_back', 'failed')",
            [],
            |row| row.get(0),
        )?;
        if in_flight > 0 {
            return Err(StoreError::Conflict(
                "another deployment is already in flight".to_string(),
            ));
        }
        tx.execute(
            "INSERT INTO deployments (id, commit_id, branch, status, started_at, report)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                deployment.id,
                deployment.commit_id,
                deployment.branch,
                deployment.status.as_str(),
                deployment.started_at.to_rfc3339(),
                deployment.report.as_ref().map(|v| v.to_string()),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn get_deployment(&self, deployment_id: &str) -> StoreResult<Deployment> {
        let conn = self.conn.lock().await;
        conn.query_row(
            DEPLOYMENT_SELECT_BY_ID,
            params![deployment_id],
            deployment_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("deployment {deployment_id}")))
    }

    /// Guarded forward/terminal transition. `report_delta` is shallow-merged
    /// into the stored report object.
    pub async fn advance_deployment(
        &self,
        deployment_id: &str,
        expected: DeploymentStatus,
        next: DeploymentStatus,
        report_delta: Option<&Value>,
        rollback_reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        if expected.is_terminal() {
            return Err(StoreError::StaleGuard(format!(
                "deployment {deployment_id} already terminal ({})",
                expected.as_str()
            )));
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let report: Option<String> = tx
            .query_row(
                "SELECT report FROM deployments WHERE id = ?1 AND status = ?2",
                params![deployment_id, expected.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        let merged = merge_report(report.as_deref(), report_delta)?;
        let finished_at = next.is_terminal().then(|| at.to_rfc3339());
        let changed = tx.execute(
            "UPDATE deployments SET status = ?1, report = ?2, rollback_reason = ?3,
                 finished_at = COALESCE(?4, finished_at)
             WHERE id = ?5 AND status = ?6",
            params![
                next.as_str(),
                merged,
                rollback_reason,
                finished_at,
                deployment_id,
                expected.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::StaleGuard(format!(
                "deployment {deployment_id} is not {}",
                expected.as_str()
            )));
        }
        tx.commit()?;
        Ok(())
    }

    /// Most recent healthy deployment, the rollback target.
    pub async fn latest_healthy(&self) -> StoreResult<Option<Deployment>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT id, commit_id, branch, status, started_at, finished_at, report, rollback_reason
                 FROM deployments WHERE status = 'healthy'
                 ORDER BY finished_at DESC LIMIT 1",
                [],
                deployment_from_row,
            )
            .optional()?;
        Ok(row)
    }

    // ------------------------------------------------------------------
    // Tool approvals
    // ------------------------------------------------------------------

    pub async fn create_tool_approval(&self, request: &ToolApproval) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tool_approvals
                 (id, tool_name, input, reasoning, created_at, expires_at, status, response)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                request.id,
                request.tool_name,
                request.input.to_string(),
                request.reasoning,
                request.created_at.to_rfc3339(),
                request.expires_at.to_rfc3339(),
                request.status.as_str(),
                request.response,
            ],
        )?;
        Ok(())
    }

    pub async fn get_tool_approval(&self, request_id: &str) -> StoreResult<ToolApproval> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, tool_name, input, reasoning, created_at, expires_at, status, response
             FROM tool_approvals WHERE id = ?1",
            params![request_id],
            tool_approval_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("tool approval {request_id}")))
    }

    /// Same guarded semantics as `resolve_approval`.
    pub async fn resolve_tool_approval(
        &self,
        request_id: &str,
        outcome: ToolApprovalStatus,
        response: Option<&str>,
    ) -> StoreResult<ToolApprovalStatus> {
        if outcome == ToolApprovalStatus::Pending {
            return Err(StoreError::Conflict(
                "cannot resolve a tool approval back to pending".to_string(),
            ));
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let prior: Option<String> = tx
            .query_row(
                "SELECT status FROM tool_approvals WHERE id = ?1",
                params![request_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(prior) = prior else {
            return Err(StoreError::NotFound(format!("tool approval {request_id}")));
        };
        let prior = ToolApprovalStatus::parse(&prior)
            .ok_or_else(|| StoreError::Conflict(format!("bad tool approval status {prior}")))?;

        if prior == ToolApprovalStatus::Pending {
            tx.execute(
                "UPDATE tool_approvals SET status = ?1, response = ?2
                 WHERE id = ?3 AND status = 'pending'",
                params![outcome.as_str(), response, request_id],
            )?;
            tx.commit()?;
            Ok(ToolApprovalStatus::Pending)
        } else if prior == outcome {
            Ok(prior)
        } else {
            Err(StoreError::StaleGuard(format!(
                "tool approval {request_id} already {}",
                prior.as_str()
            )))
        }
    }

    pub async fn expire_due_tool_approvals(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE tool_approvals SET status = 'expired'
             WHERE status = 'pending' AND expires_at < ?1",
            params![now.to_rfc3339()],
        )?;
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Agent memory
    // ------------------------------------------------------------------

    pub async fn upsert_memory(
        &self,
        key: &str,
        value: &str,
        category: Option<&str>,
        metadata: Option<&Value>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO agent_memory (key, value, category, created_at, updated_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 category = COALESCE(excluded.category, agent_memory.category),
                 updated_at = excluded.updated_at,
                 metadata = COALESCE(excluded.metadata, agent_memory.metadata)",
            params![
                key,
                value,
                category,
                at.to_rfc3339(),
                metadata.map(|v| v.to_string()),
            ],
        )?;
        Ok(())
    }

    pub async fn get_memory(&self, key: &str) -> StoreResult<Option<MemoryNote>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT key, value, category, created_at, updated_at, metadata
                 FROM agent_memory WHERE key = ?1",
                params![key],
                memory_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub async fn list_memory(
        &self,
        category: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<MemoryNote>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT key, value, category, created_at, updated_at, metadata
             FROM agent_memory
             WHERE (?1 IS NULL OR category = ?1)
             ORDER BY updated_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![category, limit as i64], memory_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Tasks and goals
    // ------------------------------------------------------------------

    pub async fn insert_task(&self, task: &AgentTask) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        insert_task_row(&conn, task)?;
        Ok(())
    }

    /// Insert decomposition children in order. The parent stays pending.
    pub async fn insert_subtasks(&self, children: &[AgentTask]) -> StoreResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for child in children {
            insert_task_row(&tx, child)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> StoreResult<AgentTask> {
        let conn = self.conn.lock().await;
        conn.query_row(TASK_SELECT_BY_ID, params![task_id], task_from_row)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))
    }

    /// Next workable task: pending, no unfinished children, master-sourced
    /// first, then priority, order_index, and age.
    pub async fn next_pending_task(&self) -> StoreResult<Option<AgentTask>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT t.id, t.parent_id, t.goal_id, t.title, t.detail, t.source, t.priority,
                        t.order_index, t.status, t.created_at, t.completed_at
                 FROM tasks t
                 WHERE t.status = 'pending'
                   AND NOT EXISTS (
                       SELECT 1 FROM tasks c
                       WHERE c.parent_id = t.id AND c.status IN ('pending', 'in_progress'))
                 ORDER BY CASE t.source WHEN 'master' THEN 0 ELSE 1 END,
                          t.priority ASC, t.order_index ASC, t.created_at ASC
                 LIMIT 1",
                [],
                task_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub async fn pending_tasks(&self, limit: usize) -> StoreResult<Vec<AgentTask>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, parent_id, goal_id, title, detail, source, priority, order_index,
                    status, created_at, completed_at
             FROM tasks WHERE status IN ('pending', 'in_progress')
             ORDER BY CASE source WHEN 'master' THEN 0 ELSE 1 END,
                      priority ASC, order_index ASC, created_at ASC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn set_task_status(
        &self,
        task_id: &str,
        expected: TaskStatus,
        next: TaskStatus,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE tasks SET status = ?1 WHERE id = ?2 AND status = ?3",
            params![next.as_str(), task_id, expected.as_str()],
        )?;
        if changed == 0 {
            return Err(StoreError::StaleGuard(format!(
                "task {task_id} is not {}",
                expected.as_str()
            )));
        }
        Ok(())
    }

    /// Complete a task; when it was the last unfinished child of a parent,
    /// complete the parent too, cascading upward. Returns the ids of
    /// auto-completed ancestors.
    pub async fn complete_task(
        &self,
        task_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE tasks SET status = 'done', completed_at = ?1
             WHERE id = ?2 AND status IN ('pending', 'in_progress')",
            params![at.to_rfc3339(), task_id],
        )?;
        if changed == 0 {
            return Err(StoreError::StaleGuard(format!(
                "task {task_id} is not completable"
            )));
        }

        let mut completed_parents = Vec::new();
        let mut cursor: Option<String> = tx
            .query_row(
                "SELECT parent_id FROM tasks WHERE id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        while let Some(parent_id) = cursor {
            let open_children: i64 = tx.query_row(
                "SELECT COUNT(*) FROM tasks
                 WHERE parent_id = ?1 AND status IN ('pending', 'in_progress')",
                params![parent_id],
                |row| row.get(0),
            )?;
            if open_children > 0 {
                break;
            }
            let changed = tx.execute(
                "UPDATE tasks SET status = 'done', completed_at = ?1
                 WHERE id = ?2 AND status IN ('pending', 'in_progress')",
                params![at.to_rfc3339(), parent_id],
            )?;
            if changed == 0 {
                break;
            }
            completed_parents.push(parent_id.clone());
            cursor = tx
                .query_row(
                    "SELECT parent_id FROM tasks WHERE id = ?1",
                    params![parent_id],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
        }
        tx.commit()?;
        Ok(completed_parents)
    }

    pub async fn insert_goal(&self, goal: &Goal) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO goals (id, title, detail, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                goal.id,
                goal.title,
                goal.detail,
                goal.active as i64,
                goal.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn active_goals(&self) -> StoreResult<Vec<Goal>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, title, detail, active, created_at
             FROM goals WHERE active = 1 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([], goal_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// ----------------------------------------------------------------------
// Row mapping
// ----------------------------------------------------------------------

const JOB_SELECT_BY_ID: &str = "SELECT id, thread_id, trigger_message_id, mode, status, payload, classification,
        approval_id, result, error, attempts, claimed_by, created_at, started_at, finished_at
 FROM jobs WHERE id = ?1";

const APPROVAL_SELECT_BY_ID: &str = "SELECT id, thread_id, job_id, proposal_text, control_message_id, status,
        created_at, expires_at, resolved_at, resolver_id
 FROM approvals WHERE id = ?1";

const DEPLOYMENT_SELECT_BY_ID: &str = "SELECT id, commit_id, branch, status, started_at, finished_at, report, rollback_reason
 FROM deployments WHERE id = ?1";

const TASK_SELECT_BY_ID: &str = "SELECT id, parent_id, goal_id, title, detail, source, priority, order_index,
        status, created_at, completed_at
 FROM tasks WHERE id = ?1";

fn conversion_err(msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::<dyn std::error::Error + Send + Sync>::from(msg),
    )
}

fn parse_dt(raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(format!("bad timestamp {raw}: {e}")))
}

fn parse_opt_dt(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(parse_dt).transpose()
}

fn parse_opt_json(raw: Option<String>) -> rusqlite::Result<Option<Value>> {
    raw.map(|s| serde_json::from_str(&s).map_err(|e| conversion_err(format!("bad json: {e}"))))
        .transpose()
}

fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<ChatThread> {
    Ok(ChatThread {
        id: row.get(0)?,
        platform: row.get(1)?,
        external_chat_id: row.get(2)?,
        chat_type: row.get(3)?,
        title: row.get(4)?,
        created_at: parse_dt(row.get(5)?)?,
        updated_at: parse_dt(row.get(6)?)?,
        metadata: parse_opt_json(row.get(7)?)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let role: String = row.get(3)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        external_message_id: row.get(2)?,
        role: MessageRole::parse(&role)
            .ok_or_else(|| conversion_err(format!("bad role {role}")))?,
        author_id: row.get(4)?,
        text: row.get(5)?,
        created_at: parse_dt(row.get(6)?)?,
        edited_at: parse_opt_dt(row.get(7)?)?,
        raw_payload: parse_opt_json(row.get(8)?)?,
    })
}

fn artifact_from_row(row: &Row<'_>) -> rusqlite::Result<Artifact> {
    let kind: String = row.get(2)?;
    let status: String = row.get(5)?;
    Ok(Artifact {
        id: row.get(0)?,
        message_id: row.get(1)?,
        kind: ArtifactKind::parse(&kind)
            .ok_or_else(|| conversion_err(format!("bad artifact kind {kind}")))?,
        content: parse_opt_json(row.get(3)?)?,
        uri: row.get(4)?,
        status: ArtifactStatus::parse(&status)
            .ok_or_else(|| conversion_err(format!("bad artifact status {status}")))?,
        attempt_count: row.get(6)?,
        error: row.get(7)?,
        created_at: parse_dt(row.get(8)?)?,
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<ReactiveJob> {
    let mode: String = row.get(3)?;
    let status: String = row.get(4)?;
    let classification: Option<String> = row.get(6)?;
    Ok(ReactiveJob {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        trigger_message_id: row.get(2)?,
        mode: JobMode::parse(&mode)
            .ok_or_else(|| conversion_err(format!("bad job mode {mode}")))?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| conversion_err(format!("bad job status {status}")))?,
        payload: parse_opt_json(row.get(5)?)?,
        classification: classification
            .map(|s| {
                serde_json::from_str::<Classification>(&s)
                    .map_err(|e| conversion_err(format!("bad classification: {e}")))
            })
            .transpose()?,
        approval_id: row.get(7)?,
        result: parse_opt_json(row.get(8)?)?,
        error: row.get(9)?,
        attempts: row.get(10)?,
        claimed_by: row.get(11)?,
        created_at: parse_dt(row.get(12)?)?,
        started_at: parse_opt_dt(row.get(13)?)?,
        finished_at: parse_opt_dt(row.get(14)?)?,
    })
}

fn approval_from_row(row: &Row<'_>) -> rusqlite::Result<Approval> {
    let status: String = row.get(5)?;
    Ok(Approval {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        job_id: row.get(2)?,
        proposal_text: row.get(3)?,
        control_message_id: row.get(4)?,
        status: ApprovalStatus::parse(&status)
            .ok_or_else(|| conversion_err(format!("bad approval status {status}")))?,
        created_at: parse_dt(row.get(6)?)?,
        expires_at: parse_dt(row.get(7)?)?,
        resolved_at: parse_opt_dt(row.get(8)?)?,
        resolver_id: row.get(9)?,
    })
}

fn deployment_from_row(row: &Row<'_>) -> rusqlite::Result<Deployment> {
    let status: String = row.get(3)?;
    Ok(Deployment {
        id: row.get(0)?,
        commit_id: row.get(1)?,
        branch: row.get(2)?,
        status: DeploymentStatus::parse(&status)
            .ok_or_else(|| conversion_err(format!("bad deployment status {status}")))?,
        started_at: parse_dt(row.get(4)?)?,
        finished_at: parse_opt_dt(row.get(5)?)?,
        report: parse_opt_json(row.get(6)?)?,
        rollback_reason: row.get(7)?,
    })
}

fn tool_approval_from_row(row: &Row<'_>) -> rusqlite::Result<ToolApproval> {
    let status: String = row.get(6)?;
    let input: String = row.get(2)?;
    Ok(ToolApproval {
        id: row.get(0)?,
        tool_name: row.get(1)?,
        input: serde_json::from_str(&input)
            .map_err(|e| conversion_err(format!("bad tool input: {e}")))?,
        reasoning: row.get(3)?,
        created_at: parse_dt(row.get(4)?)?,
        expires_at: parse_dt(row.get(5)?)?,
        status: ToolApprovalStatus::parse(&status)
            .ok_or_else(|| conversion_err(format!("bad tool approval status {status}")))?,
        response: row.get(7)?,
    })
}

fn memory_from_row(row: &Row<'_>) -> rusqlite::Result<MemoryNote> {
    Ok(MemoryNote {
        key: row.get(0)?,
        value: row.get(1)?,
        category: row.get(2)?,
        created_at: parse_dt(row.get(3)?)?,
        updated_at: parse_dt(row.get(4)?)?,
        metadata: parse_opt_json(row.get(5)?)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<AgentTask> {
    let source: String = row.get(5)?;
    let status: String = row.get(8)?;
    Ok(AgentTask {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        goal_id: row.get(2)?,
        title: row.get(3)?,
        detail: row.get(4)?,
        source: TaskSource::parse(&source)
            .ok_or_else(|| conversion_err(format!("bad task source {source}")))?,
        priority: row.get(6)?,
        order_index: row.get(7)?,
        status: TaskStatus::parse(&status)
            .ok_or_else(|| conversion_err(format!("bad task status {status}")))?,
        created_at: parse_dt(row.get(9)?)?,
        completed_at: parse_opt_dt(row.get(10)?)?,
    })
}

fn goal_from_row(row: &Row<'_>) -> rusqlite::Result<Goal> {
    let active: i64 = row.get(3)?;
    Ok(Goal {
        id: row.get(0)?,
        title: row.get(1)?,
        detail: row.get(2)?,
        active: active != 0,
        created_at: parse_dt(row.get(4)?)?,
    })
}

fn insert_task_row(conn: &Connection, task: &AgentTask) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO tasks
             (id, parent_id, goal_id, title, detail, source, priority, order_index, status,
              created_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            task.id,
            task.parent_id,
            task.goal_id,
            task.title,
            task.detail,
            task.source.as_str(),
            task.priority,
            task.order_index,
            task.status.as_str(),
            task.created_at.to_rfc3339(),
            task.completed_at.map(|dt| dt.to_rfc3339()),
        ],
    )?;
    Ok(())
}

fn merge_report(current: Option<&str>, delta: Option<&Value>) -> StoreResult<Option<String>> {
    let Some(delta) = delta else {
        return Ok(current.map(ToString::to_string));
    };
    let mut base: Value = match current {
        Some(raw) => serde_json::from_str(raw)?,
        None => Value::Object(serde_json::Map::new()),
    };
    if let (Some(base_map), Some(delta_map)) = (base.as_object_mut(), delta.as_object()) {
        for (key, value) in delta_map {
            base_map.insert(key.clone(), value.clone());
        }
        Ok(Some(base.to_string()))
    } else {
        Ok(Some(delta.to_string()))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    async fn test_store() -> Store {
        Store::open_in_memory().await.unwrap()
    }

    async fn seed_thread(store: &Store) -> ChatThread {
        store
            .upsert_thread("telegram", "42", "private", Some("owner"), Utc::now())
            .await
            .unwrap()
    }

    async fn seed_message(store: &Store, thread_id: &str, external_id: &str) -> StoredMessage {
        let msg = StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            external_message_id: Some(external_id.to_string()),
            role: MessageRole::User,
            author_id: Some("u1".to_string()),
            text: Some("check db status".to_string()),
            created_at: Utc::now(),
            edited_at: None,
            raw_payload: None,
        };
        store.insert_message(&msg).await.unwrap();
        msg
    }

    fn make_job(thread_id: &str, message_id: &str, mode: JobMode) -> ReactiveJob {
        ReactiveJob {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            trigger_message_id: message_id.to_string(),
            mode,
            status: JobStatus::Queued,
            payload: None,
            classification: None,
            approval_id: None,
            result: None,
            error: None,
            attempts: 0,
            claimed_by: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    fn make_approval(thread_id: &str, job_id: &str, ttl_secs: i64) -> Approval {
        let now = Utc::now();
        Approval {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            job_id: job_id.to_string(),
            proposal_text: "run it?".to_string(),
            control_message_id: None,
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: now + ChronoDuration::seconds(ttl_secs),
            resolved_at: None,
            resolver_id: None,
        }
    }

    #[tokio::test]
    async fn thread_upsert_is_idempotent() {
        let store = test_store().await;
        let first = seed_thread(&store).await;
        let second = seed_thread(&store).await;
        assert_eq!(first.id, second.id);
        assert!(second.updated_at >= first.updated_at);
    }

    #[tokio::test]
    async fn duplicate_message_insert_is_silent() {
        let store = test_store().await;
        let thread = seed_thread(&store).await;
        let msg = seed_message(&store, &thread.id, "100").await;

        let replay = StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            ..msg
        };
        let outcome = store.insert_message(&replay).await.unwrap();
        assert_eq!(outcome, MessageInsert::Duplicate);

        let messages = store.recent_messages(&thread.id, 10).await.unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn claim_next_job_returns_oldest_once() {
        let store = test_store().await;
        let thread = seed_thread(&store).await;
        let msg = seed_message(&store, &thread.id, "100").await;

        let first = make_job(&thread.id, &msg.id, JobMode::Classify);
        let second = make_job(&thread.id, &msg.id, JobMode::Classify);
        store.enqueue_job(&first).await.unwrap();
        store.enqueue_job(&second).await.unwrap();

        let a = store
            .claim_next_job(&[JobMode::Classify], "w1")
            .await
            .unwrap()
            .unwrap();
        let b = store
            .claim_next_job(&[JobMode::Classify], "w2")
            .await
            .unwrap()
            .unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.status, JobStatus::Running);
        assert_eq!(a.attempts, 1);
        assert!(a.started_at.is_some());

        let none = store
            .claim_next_job(&[JobMode::Classify], "w3")
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn claim_filters_by_mode() {
        let store = test_store().await;
        let thread = seed_thread(&store).await;
        let msg = seed_message(&store, &thread.id, "100").await;
        store
            .enqueue_job(&make_job(&thread.id, &msg.id, JobMode::Execute))
            .await
            .unwrap();

        assert!(store
            .claim_next_job(&[JobMode::Classify], "w1")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .claim_next_job(&[JobMode::Execute], "w1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_job() {
        let store = Arc::new(test_store().await);
        let thread = seed_thread(&store).await;
        let msg = seed_message(&store, &thread.id, "100").await;
        for _ in 0..8 {
            store
                .enqueue_job(&make_job(&thread.id, &msg.id, JobMode::Classify))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for worker in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = store
                    .claim_next_job(&[JobMode::Classify], &format!("w{worker}"))
                    .await
                    .unwrap()
                {
                    claimed.push(job.id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 8);
    }

    #[tokio::test]
    async fn job_status_guard_rejects_stale_transition() {
        let store = test_store().await;
        let thread = seed_thread(&store).await;
        let msg = seed_message(&store, &thread.id, "100").await;
        let job = make_job(&thread.id, &msg.id, JobMode::Classify);
        store.enqueue_job(&job).await.unwrap();

        store
            .update_job_status(&job.id, JobStatus::Queued, JobStatus::Canceled)
            .await
            .unwrap();
        let err = store
            .update_job_status(&job.id, JobStatus::Queued, JobStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleGuard(_)));
    }

    #[tokio::test]
    async fn resolve_approval_is_idempotent_per_outcome() {
        let store = test_store().await;
        let thread = seed_thread(&store).await;
        let msg = seed_message(&store, &thread.id, "100").await;
        let job = make_job(&thread.id, &msg.id, JobMode::Execute);
        store.enqueue_job(&job).await.unwrap();
        let approval = make_approval(&thread.id, &job.id, 3600);
        store.create_approval(&approval).await.unwrap();

        let prior = store
            .resolve_approval(&approval.id, ApprovalStatus::Approved, Some("u1"), Utc::now())
            .await
            .unwrap();
        assert_eq!(prior, ApprovalStatus::Pending);

        // Duplicate callback with the same outcome.
        let prior = store
            .resolve_approval(&approval.id, ApprovalStatus::Approved, Some("u1"), Utc::now())
            .await
            .unwrap();
        assert_eq!(prior, ApprovalStatus::Approved);

        // Conflicting outcome after resolution.
        let err = store
            .resolve_approval(&approval.id, ApprovalStatus::Rejected, Some("u1"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleGuard(_)));
    }

    #[tokio::test]
    async fn second_pending_approval_on_thread_conflicts() {
        let store = test_store().await;
        let thread = seed_thread(&store).await;
        let msg = seed_message(&store, &thread.id, "100").await;
        let job_a = make_job(&thread.id, &msg.id, JobMode::Execute);
        let job_b = make_job(&thread.id, &msg.id, JobMode::Execute);
        store.enqueue_job(&job_a).await.unwrap();
        store.enqueue_job(&job_b).await.unwrap();

        store
            .create_approval(&make_approval(&thread.id, &job_a.id, 3600))
            .await
            .unwrap();
        let err = store
            .create_approval(&make_approval(&thread.id, &job_b.id, 3600))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn supersession_cancels_owning_job() {
        let store = test_store().await;
        let thread = seed_thread(&store).await;
        let msg = seed_message(&store, &thread.id, "100").await;
        let job = make_job(&thread.id, &msg.id, JobMode::Execute);
        store.enqueue_job(&job).await.unwrap();
        store
            .update_job_status(&job.id, JobStatus::Queued, JobStatus::AwaitingApproval)
            .await
            .unwrap();
        let approval = make_approval(&thread.id, &job.id, 3600);
        store.create_approval(&approval).await.unwrap();

        let superseded = store
            .supersede_pending_for_thread(&thread.id, Utc::now())
            .await
            .unwrap();
        assert_eq!(superseded.len(), 1);
        assert_eq!(superseded[0].id, approval.id);

        let approval = store.get_approval(&approval.id).await.unwrap();
        assert_eq!(approval.status, ApprovalStatus::Superseded);
        let job = store.get_job(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        assert!(store
            .pending_approval_for_thread(&thread.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn expiry_sweep_fails_job_with_reason() {
        let store = test_store().await;
        let thread = seed_thread(&store).await;
        let msg = seed_message(&store, &thread.id, "100").await;
        let job = make_job(&thread.id, &msg.id, JobMode::Execute);
        store.enqueue_job(&job).await.unwrap();
        store
            .update_job_status(&job.id, JobStatus::Queued, JobStatus::AwaitingApproval)
            .await
            .unwrap();
        store
            .create_approval(&make_approval(&thread.id, &job.id, 60))
            .await
            .unwrap();

        let expired = store
            .expire_due_approvals(Utc::now() + ChronoDuration::seconds(61))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);

        let job = store.get_job(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("approval_expired"));
    }

    #[tokio::test]
    async fn reaper_requeues_then_fails() {
        let store = test_store().await;
        let thread = seed_thread(&store).await;
        let msg = seed_message(&store, &thread.id, "100").await;
        let job = make_job(&thread.id, &msg.id, JobMode::Classify);
        store.enqueue_job(&job).await.unwrap();

        // Claim and pretend the worker died.
        store
            .claim_next_job(&[JobMode::Classify], "w1")
            .await
            .unwrap()
            .unwrap();
        let future = Utc::now() + ChronoDuration::seconds(600);
        let report = store.requeue_stale_running(future, 3, future).await.unwrap();
        assert_eq!(report, ReaperReport { requeued: 1, failed: 0 });

        // Burn through the remaining attempts.
        for _ in 0..2 {
            store
                .claim_next_job(&[JobMode::Classify], "w1")
                .await
                .unwrap()
                .unwrap();
            store.requeue_stale_running(future, 3, future).await.unwrap();
        }
        let job = store.get_job(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn ledger_sums_only_proactive_for_day() {
        let store = test_store().await;
        let now = Utc::now();
        let day = now.format("%Y-%m-%d").to_string();
        for (scope, total) in [
            (LedgerScope::Proactive, 1_000_000),
            (LedgerScope::Proactive, 2_500_000),
            (LedgerScope::Reactive, 9_000_000),
        ] {
            store
                .record_ledger(&LedgerEntry {
                    id: uuid::Uuid::new_v4().to_string(),
                    scope,
                    provider: "openrouter".to_string(),
                    model: "gpt-4o-mini".to_string(),
                    tokens_in: total / 2,
                    tokens_out: total - total / 2,
                    tokens_total: total,
                    cost: 0.0,
                    created_at: now,
                    meta: None,
                })
                .await
                .unwrap();
        }
        assert_eq!(
            store.proactive_tokens_for_day(&day).await.unwrap(),
            3_500_000
        );
    }

    #[tokio::test]
    async fn single_in_flight_deployment() {
        let store = test_store().await;
        let deployment = Deployment {
            id: uuid::Uuid::new_v4().to_string(),
            commit_id: "abc123".to_string(),
            branch: "main".to_string(),
            status: DeploymentStatus::Building,
            started_at: Utc::now(),
            finished_at: None,
            report: None,
            rollback_reason: None,
        };
        store.create_deployment(&deployment).await.unwrap();

        let second = Deployment {
            id: uuid::Uuid::new_v4().to_string(),
            commit_id: "def456".to_string(),
            ..deployment.clone()
        };
        let err = store.create_deployment(&second).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn deployment_rollback_preserves_latest_healthy() {
        let store = test_store().await;
        let now = Utc::now();
        let healthy = Deployment {
            id: uuid::Uuid::new_v4().to_string(),
            commit_id: "aaa111".to_string(),
            branch: "main".to_string(),
            status: DeploymentStatus::Building,
            started_at: now,
            finished_at: None,
            report: None,
            rollback_reason: None,
        };
        store.create_deployment(&healthy).await.unwrap();
        for (from, to) in [
            (DeploymentStatus::Building, DeploymentStatus::Testing),
            (DeploymentStatus::Testing, DeploymentStatus::Deploying),
            (DeploymentStatus::Deploying, DeploymentStatus::Healthy),
        ] {
            store
                .advance_deployment(&healthy.id, from, to, None, None, Utc::now())
                .await
                .unwrap();
        }

        let doomed = Deployment {
            id: uuid::Uuid::new_v4().to_string(),
            commit_id: "abc123".to_string(),
            branch: "main".to_string(),
            status: DeploymentStatus::Building,
            started_at: Utc::now(),
            finished_at: None,
            report: None,
            rollback_reason: None,
        };
        store.create_deployment(&doomed).await.unwrap();
        for (from, to) in [
            (DeploymentStatus::Building, DeploymentStatus::Testing),
            (DeploymentStatus::Testing, DeploymentStatus::Deploying),
        ] {
            store
                .advance_deployment(&doomed.id, from, to, None, None, Utc::now())
                .await
                .unwrap();
        }
        store
            .advance_deployment(
                &doomed.id,
                DeploymentStatus::Deploying,
                DeploymentStatus::RolledBack,
                Some(&json!({"verify": "health probe failed"})),
                Some("health probe failed"),
                Utc::now(),
            )
            .await
            .unwrap();

        let rolled = store.get_deployment(&doomed.id).await.unwrap();
        assert_eq!(rolled.status, DeploymentStatus::RolledBack);
        assert_eq!(rolled.rollback_reason.as_deref(), Some("health probe failed"));

        let latest = store.latest_healthy().await.unwrap().unwrap();
        assert_eq!(latest.id, healthy.id);
    }

    #[tokio::test]
    async fn completing_last_child_completes_parent() {
        let store = test_store().await;
        let now = Utc::now();
        let parent = AgentTask {
            id: "parent".to_string(),
            parent_id: None,
            goal_id: None,
            title: "ship feature".to_string(),
            detail: None,
            source: TaskSource::Master,
            priority: 0,
            order_index: 0,
            status: TaskStatus::Pending,
            created_at: now,
            completed_at: None,
        };
        store.insert_task(&parent).await.unwrap();
        let children: Vec<AgentTask> = (0..2)
            .map(|i| AgentTask {
                id: format!("child-{i}"),
                parent_id: Some("parent".to_string()),
                order_index: i,
                title: format!("step {i}"),
                ..parent.clone()
            })
            .collect();
        store.insert_subtasks(&children).await.unwrap();

        // Parent has open children, so a child is selected first, in order.
        let next = store.next_pending_task().await.unwrap().unwrap();
        assert_eq!(next.id, "child-0");

        let completed = store.complete_task("child-0", Utc::now()).await.unwrap();
        assert!(completed.is_empty());
        let completed = store.complete_task("child-1", Utc::now()).await.unwrap();
        assert_eq!(completed, vec!["parent".to_string()]);
        assert_eq!(
            store.get_task("parent").await.unwrap().status,
            TaskStatus::Done
        );
    }

    #[tokio::test]
    async fn master_tasks_outrank_agent_priority() {
        let store = test_store().await;
        let now = Utc::now();
        let base = AgentTask {
            id: String::new(),
            parent_id: None,
            goal_id: None,
            title: String::new(),
            detail: None,
            source: TaskSource::Agent,
            priority: 0,
            order_index: 0,
            status: TaskStatus::Pending,
            created_at: now,
            completed_at: None,
        };
        store
            .insert_task(&AgentTask {
                id: "self-urgent".to_string(),
                title: "self urgent".to_string(),
                priority: 0,
                ..base.clone()
            })
            .await
            .unwrap();
        store
            .insert_task(&AgentTask {
                id: "master-low".to_string(),
                title: "master low".to_string(),
                source: TaskSource::Master,
                priority: 9,
                ..base
            })
            .await
            .unwrap();

        let next = store.next_pending_task().await.unwrap().unwrap();
        assert_eq!(next.id, "master-low");
    }

    #[tokio::test]
    async fn memory_upsert_overwrites_value() {
        let store = test_store().await;
        store
            .upsert_memory("last_cycle", "checked inbox", Some("cycle"), None, Utc::now())
            .await
            .unwrap();
        store
            .upsert_memory("last_cycle", "wrote summary", None, None, Utc::now())
            .await
            .unwrap();
        let note = store.get_memory("last_cycle").await.unwrap().unwrap();
        assert_eq!(note.value, "wrote summary");
        assert_eq!(note.category.as_deref(), Some("cycle"));
    }

    #[tokio::test]
    async fn tool_approval_resolution_is_guarded() {
        let store = test_store().await;
        let now = Utc::now();
        let request = ToolApproval {
            id: uuid::Uuid::new_v4().to_string(),
            tool_name: "shell".to_string(),
            input: json!({"command": "systemctl restart app"}),
            reasoning: Some("restart requested".to_string()),
            created_at: now,
            expires_at: now + ChronoDuration::seconds(3600),
            status: ToolApprovalStatus::Pending,
            response: None,
        };
        store.create_tool_approval(&request).await.unwrap();

        let prior = store
            .resolve_tool_approval(&request.id, ToolApprovalStatus::Approved, Some("ok"))
            .await
            .unwrap();
        assert_eq!(prior, ToolApprovalStatus::Pending);
        let err = store
            .resolve_tool_approval(&request.id, ToolApprovalStatus::Rejected, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleGuard(_)));
    }

    #[tokio::test]
    async fn artifact_done_requires_content() {
        let store = test_store().await;
        let thread = seed_thread(&store).await;
        let msg = seed_message(&store, &thread.id, "100").await;
        let artifact = Artifact {
            id: uuid::Uuid::new_v4().to_string(),
            message_id: msg.id.clone(),
            kind: ArtifactKind::VoiceTranscript,
            content: None,
            uri: Some("media/2026-08-01/msg.ogg".to_string()),
            status: ArtifactStatus::Pending,
            attempt_count: 0,
            error: None,
            created_at: Utc::now(),
        };
        store.insert_artifact(&artifact).await.unwrap();

        let err = store
            .advance_artifact(
                &artifact.id,
                ArtifactStatus::Pending,
                ArtifactStatus::Done,
                None,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        store
            .advance_artifact(
                &artifact.id,
                ArtifactStatus::Pending,
                ArtifactStatus::Done,
                Some(&json!({"transcript": "hello"})),
                None,
            )
            .await
            .unwrap();
        let done = store.done_artifacts_for_message(&msg.id).await.unwrap();
        assert_eq!(done.len(), 1);
    }
}
