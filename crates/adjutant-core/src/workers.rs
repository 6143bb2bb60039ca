// Reactive worker pool: N cooperative loops contending on the store's job
// queue, plus the reaper that rescues jobs from crashed workers.
//
// The dispatch state machine has three arms. `classify` decides intent and
// routes to `answer` or `execute`; `execute` runs the executor with tool
// access, parking on an approval when confirmation is needed; `answer` is
// the fast path with no tools and no approvals.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use futures::FutureExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use adjutant_channels::ChatPlatform;
use adjutant_providers::{ChatTurn, Classifier, Executor};
use adjutant_store::Store;
use adjutant_types::{
    Artifact, ArtifactKind, ArtifactStatus, Classification, EngineConfig, Intent, JobMode,
    JobStatus, LedgerScope, MessageRole, ReactiveJob, StoredMessage,
};

use crate::approvals::ApprovalCoordinator;
use crate::context::build_thread_context;
use crate::error::{EngineError, EngineResult};
use crate::ledger::TokenLedger;
use crate::tool_gateway::{tool_result_turn, ToolGateway};

/// Bound on executor tool-use iterations per job.
const TOOL_LOOP_LIMIT: usize = 8;

/// Cadence of the crash-suspect sweep.
const REAPER_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct WorkerPool {
    store: Arc<Store>,
    platform: Arc<dyn ChatPlatform>,
    classifier: Arc<dyn Classifier>,
    executor: Arc<dyn Executor>,
    tools: ToolGateway,
    approvals: ApprovalCoordinator,
    ledger: TokenLedger,
    config: EngineConfig,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        platform: Arc<dyn ChatPlatform>,
        classifier: Arc<dyn Classifier>,
        executor: Arc<dyn Executor>,
        tools: ToolGateway,
        approvals: ApprovalCoordinator,
        ledger: TokenLedger,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            platform,
            classifier,
            executor,
            tools,
            approvals,
            ledger,
            config,
        }
    }

    /// One worker loop. Exits within a poll interval of cancellation.
    pub async fn run_worker(&self, worker_id: String, cancel: CancellationToken) {
        let poll = Duration::from_millis(self.config.worker_poll_interval_ms);
        info!(worker = %worker_id, "worker started");

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if !self.run_once(&worker_id, &cancel).await {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }
        info!(worker = %worker_id, "worker stopped");
    }

    /// Claim and dispatch at most one job. Returns whether a job was
    /// handled; false means the queue was empty (or the claim failed).
    pub async fn run_once(&self, worker_id: &str, cancel: &CancellationToken) -> bool {
        let modes = [JobMode::Classify, JobMode::Execute, JobMode::Answer];
        match self.store.claim_next_job(&modes, worker_id).await {
            Ok(Some(job)) => {
                // A panic must not take the pool down; the job stays
                // `running` and the reaper will requeue it.
                let outcome = AssertUnwindSafe(self.dispatch(&job, cancel))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        warn!(job = %job.id, "job failed: {err}");
                        self.fail_job(&job, &err.to_string()).await;
                    }
                    Err(_) => {
                        error!(job = %job.id, worker = %worker_id, "worker panicked");
                    }
                }
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!(worker = %worker_id, "claim failed: {err}");
                false
            }
        }
    }

    /// Requeue `running` jobs whose worker is presumed dead. Jobs out of
    /// attempts are failed instead.
    pub async fn run_reaper(&self, cancel: CancellationToken) {
        let stale_after = ChronoDuration::seconds(
            (self.config.executor_deadline_seconds + self.config.reaper_grace_seconds) as i64,
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(REAPER_INTERVAL) => {}
            }
            let now = Utc::now();
            match self
                .store
                .requeue_stale_running(now - stale_after, self.config.max_job_attempts, now)
                .await
            {
                Ok(report) if report.requeued > 0 || report.failed > 0 => {
                    warn!(
                        requeued = report.requeued,
                        failed = report.failed,
                        "reaper swept crash-suspect jobs"
                    );
                }
                Ok(_) => {}
                Err(err) => warn!("reaper sweep failed: {err}"),
            }
        }
    }

    async fn dispatch(&self, job: &ReactiveJob, cancel: &CancellationToken) -> EngineResult<()> {
        match job.mode {
            JobMode::Classify => self.run_classify(job).await,
            JobMode::Execute => self.run_execute(job, cancel).await,
            JobMode::Answer => self.run_answer(job).await,
        }
    }

    // ------------------------------------------------------------------
    // classify arm
    // ------------------------------------------------------------------

    async fn run_classify(&self, job: &ReactiveJob) -> EngineResult<()> {
        let turns = build_thread_context(&self.store, &job.thread_id, self.config.context_window)
            .await?;
        let deadline = Duration::from_secs(self.config.classifier_deadline_seconds);

        // Transient classifier errors retry with exponential backoff; this
        // is the only arm with automatic retries.
        let mut attempt: u32 = 0;
        let output = loop {
            match self.classifier.classify(&turns, deadline).await {
                Ok(output) => break output,
                Err(err) => {
                    attempt += 1;
                    if i64::from(attempt) >= self.config.max_job_attempts {
                        return Err(err.into());
                    }
                    let backoff = Duration::from_millis(500 * 2u64.pow(attempt.min(6)));
                    warn!(job = %job.id, attempt, "classifier failed, retrying: {err}");
                    tokio::time::sleep(backoff).await;
                }
            }
        };

        self.ledger
            .record(
                LedgerScope::Reactive,
                self.classifier.provider(),
                self.classifier.model(),
                output.usage,
                Some(json!({ "job_id": job.id, "thread_id": job.thread_id, "call": "classify" })),
            )
            .await?;

        let classification = output.classification;
        self.store
            .set_job_classification(&job.id, &classification)
            .await?;

        let next_mode =
            if !classification.needs_confirmation && classification.intent == Intent::Chat {
                JobMode::Answer
            } else {
                JobMode::Execute
            };

        let next = ReactiveJob {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: job.thread_id.clone(),
            trigger_message_id: job.trigger_message_id.clone(),
            mode: next_mode,
            status: JobStatus::Queued,
            payload: Some(json!({ "confirmed": false })),
            classification: Some(classification),
            approval_id: None,
            result: None,
            error: None,
            attempts: 0,
            claimed_by: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        self.store.enqueue_job(&next).await?;
        self.store
            .finish_job(
                &job.id,
                JobStatus::Running,
                JobStatus::Done,
                Some(&json!({ "next_job": next.id, "routed": next_mode.as_str() })),
                None,
                Utc::now(),
            )
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // execute arm
    // ------------------------------------------------------------------

    async fn run_execute(&self, job: &ReactiveJob, cancel: &CancellationToken) -> EngineResult<()> {
        let classification = job
            .classification
            .clone()
            .ok_or_else(|| EngineError::MissingClassification(job.id.clone()))?;
        let confirmed = job
            .payload
            .as_ref()
            .and_then(|p| p.get("confirmed"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if classification.needs_confirmation && !confirmed {
            // Park the job; the approval callback re-enters with a confirmed
            // execute job and this one resolves to done.
            self.approvals.request_approval(job).await?;
            return Ok(());
        }

        let reply = self.run_executor_loop(job, &classification, cancel).await?;
        self.deliver_reply(job, &reply).await
    }

    // ------------------------------------------------------------------
    // answer arm
    // ------------------------------------------------------------------

    /// Fast path for trivial replies: executor with no tools and no
    /// approval gate.
    async fn run_answer(&self, job: &ReactiveJob) -> EngineResult<()> {
        let classification = job
            .classification
            .clone()
            .ok_or_else(|| EngineError::MissingClassification(job.id.clone()))?;
        let turns = self.executor_turns(job, &classification).await?;
        let deadline = Duration::from_secs(self.config.executor_deadline_seconds);

        let turn = self.executor.step(&turns, &[], deadline).await?;
        self.ledger
            .record(
                LedgerScope::Reactive,
                self.executor.provider(),
                self.executor.model(),
                turn.usage,
                Some(json!({ "job_id": job.id, "thread_id": job.thread_id, "call": "answer" })),
            )
            .await?;

        let reply = turn.text.unwrap_or_default();
        self.deliver_reply(job, &reply).await
    }

    // ------------------------------------------------------------------
    // shared pieces
    // ------------------------------------------------------------------

    async fn executor_turns(
        &self,
        job: &ReactiveJob,
        classification: &Classification,
    ) -> EngineResult<Vec<ChatTurn>> {
        let mut turns = vec![ChatTurn::new(
            "system",
            format!(
                "You are handling a {} request. Summary: {}.{}",
                match classification.intent {
                    Intent::Question => "question",
                    Intent::Command => "command",
                    Intent::Chat => "chat",
                    Intent::Other => "general",
                },
                classification.summary,
                classification
                    .plan
                    .as_deref()
                    .map(|plan| format!(" Plan: {plan}"))
                    .unwrap_or_default(),
            ),
        )];
        turns.extend(
            build_thread_context(&self.store, &job.thread_id, self.config.context_window).await?,
        );
        Ok(turns)
    }

    /// Executor tool-use loop. No automatic retries: a failed executor call
    /// fails the job to avoid duplicated side effects.
    async fn run_executor_loop(
        &self,
        job: &ReactiveJob,
        classification: &Classification,
        cancel: &CancellationToken,
    ) -> EngineResult<String> {
        let mut turns = self.executor_turns(job, classification).await?;
        let tools = self.tools.schemas().await;
        let deadline = Duration::from_secs(self.config.executor_deadline_seconds);

        for _ in 0..TOOL_LOOP_LIMIT {
            let turn = self.executor.step(&turns, &tools, deadline).await?;
            self.ledger
                .record(
                    LedgerScope::Reactive,
                    self.executor.provider(),
                    self.executor.model(),
                    turn.usage,
                    Some(json!({ "job_id": job.id, "thread_id": job.thread_id, "call": "execute" })),
                )
                .await?;

            if let Some(text) = turn.text.as_deref() {
                turns.push(ChatTurn::new("assistant", text));
            }
            if turn.is_final() {
                return Ok(turn.text.unwrap_or_default());
            }

            for call in &turn.tool_calls {
                let result = self
                    .tools
                    .invoke(call, Some(&classification.summary), cancel.clone())
                    .await?;
                self.store
                    .insert_artifact(&Artifact {
                        id: uuid::Uuid::new_v4().to_string(),
                        message_id: job.trigger_message_id.clone(),
                        kind: ArtifactKind::ToolResult,
                        content: Some(json!({
                            "tool": call.name,
                            "output": result.output,
                            "metadata": result.metadata,
                        })),
                        uri: None,
                        status: ArtifactStatus::Done,
                        attempt_count: 1,
                        error: None,
                        created_at: Utc::now(),
                    })
                    .await?;
                turns.push(tool_result_turn(call, &result));
            }
        }
        Ok("I hit the tool-use limit before finishing; stopping here.".to_string())
    }

    /// Send the final text, persist it as an assistant message, and close
    /// the job.
    async fn deliver_reply(&self, job: &ReactiveJob, reply: &str) -> EngineResult<()> {
        let reply = if reply.trim().is_empty() {
            "(no response)"
        } else {
            reply
        };
        let thread = self.store.get_thread(&job.thread_id).await?;
        let external_id = self
            .platform
            .send_message(&thread.external_chat_id, reply, None)
            .await?;

        self.store
            .insert_message(&StoredMessage {
                id: uuid::Uuid::new_v4().to_string(),
                thread_id: job.thread_id.clone(),
                external_message_id: Some(external_id.clone()),
                role: MessageRole::Assistant,
                author_id: None,
                text: Some(reply.to_string()),
                created_at: Utc::now(),
                edited_at: None,
                raw_payload: None,
            })
            .await?;

        self.store
            .finish_job(
                &job.id,
                JobStatus::Running,
                JobStatus::Done,
                Some(&json!({ "response_message_id": external_id })),
                None,
                Utc::now(),
            )
            .await?;
        Ok(())
    }

    /// Mark a job failed and, for user-facing arms, tell the thread in one
    /// short message.
    async fn fail_job(&self, job: &ReactiveJob, error: &str) {
        let summary: String = error.chars().take(300).collect();
        if let Err(err) = self
            .store
            .finish_job(
                &job.id,
                JobStatus::Running,
                JobStatus::Failed,
                None,
                Some(summary.as_str()),
                Utc::now(),
            )
            .await
        {
            // Guard may be stale (e.g. the job moved to awaiting_approval);
            // nothing more to record.
            warn!(job = %job.id, "could not mark job failed: {err}");
            return;
        }

        if matches!(job.mode, JobMode::Execute | JobMode::Answer) {
            if let Ok(thread) = self.store.get_thread(&job.thread_id).await {
                let _ = self
                    .platform
                    .send_message(
                        &thread.external_chat_id,
                        "Sorry — that didn't work. I've noted the failure.",
                        None,
                    )
                    .await;
            }
        }
    }
}
