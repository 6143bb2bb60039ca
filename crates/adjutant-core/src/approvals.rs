// Approval coordinator: at most one pending confirmation per thread, and a
// guaranteed terminal resolution for every approval (callback, supersession,
// or expiry).
//
// Workers never wait in-process for a button press. The job is parked in
// `awaiting_approval` and the callback re-enters through ingest, which
// enqueues a fresh confirmed execute job.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tracing::{info, warn};

use adjutant_channels::{ChatPlatform, ControlSpec};
use adjutant_store::{Store, StoreError};
use adjutant_types::{
    Approval, ApprovalStatus, Classification, EngineConfig, Event, JobMode, JobStatus, ReactiveJob,
};

use crate::error::{EngineError, EngineResult};

pub const APPROVAL_TAG_PREFIX: &str = "approval:";

/// What a callback ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// This callback resolved the approval; for approvals, carries the id of
    /// the confirmed execute job.
    Resolved { approved: bool, resumed_as: Option<String> },
    /// Duplicate or late press; acknowledged and ignored.
    Ignored,
}

#[derive(Clone)]
pub struct ApprovalCoordinator {
    store: Arc<Store>,
    platform: Arc<dyn ChatPlatform>,
    config: EngineConfig,
}

impl ApprovalCoordinator {
    pub fn new(store: Arc<Store>, platform: Arc<dyn ChatPlatform>, config: EngineConfig) -> Self {
        Self {
            store,
            platform,
            config,
        }
    }

    /// Open a confirmation handshake for an execute job the worker just
    /// released. The job moves to `awaiting_approval` only after the control
    /// is actually out on the platform.
    pub async fn request_approval(&self, job: &ReactiveJob) -> EngineResult<Approval> {
        let classification = job
            .classification
            .as_ref()
            .ok_or_else(|| EngineError::MissingClassification(job.id.clone()))?;
        let thread = self.store.get_thread(&job.thread_id).await?;

        let now = Utc::now();
        let approval = Approval {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: job.thread_id.clone(),
            job_id: job.id.clone(),
            proposal_text: render_proposal(classification),
            control_message_id: None,
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: now + ChronoDuration::seconds(self.config.approval_timeout_seconds as i64),
            resolved_at: None,
            resolver_id: None,
        };
        self.store.create_approval(&approval).await?;

        let control = ControlSpec {
            label: "✅ Approve".to_string(),
            tag: format!("{APPROVAL_TAG_PREFIX}{}", approval.id),
        };
        let send_result = self
            .platform
            .send_message_with_control(&thread.external_chat_id, &approval.proposal_text, &control)
            .await;

        let control_message_id = match send_result {
            Ok(id) => id,
            Err(err) => {
                // The control never reached the user; retire the handshake so
                // the thread is free for the next message.
                let _ = self
                    .store
                    .resolve_approval(&approval.id, ApprovalStatus::Expired, None, Utc::now())
                    .await;
                return Err(EngineError::Platform(err));
            }
        };

        self.store
            .set_approval_control_message(&approval.id, &control_message_id)
            .await?;
        self.store.link_job_approval(&job.id, &approval.id).await?;
        self.store
            .update_job_status(&job.id, JobStatus::Running, JobStatus::AwaitingApproval)
            .await?;

        info!(approval = %approval.id, job = %job.id, "approval requested");
        Ok(Approval {
            control_message_id: Some(control_message_id),
            ..approval
        })
    }

    /// Resolve an approval from a control callback. Duplicate and late
    /// presses are acknowledged and ignored; an approval spawns the confirmed
    /// execute job.
    pub async fn handle_callback(&self, event: &Event) -> EngineResult<CallbackOutcome> {
        let Some(callback) = event.callback.as_ref() else {
            return Ok(CallbackOutcome::Ignored);
        };
        let Some(approval_id) = callback.tag.strip_prefix(APPROVAL_TAG_PREFIX) else {
            return Ok(CallbackOutcome::Ignored);
        };
        let approved = callback.data.as_deref() != Some("reject");
        let outcome = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        let resolver_id = event.author.as_ref().map(|a| a.id.clone());

        let prior = match self
            .store
            .resolve_approval(approval_id, outcome, resolver_id.as_deref(), Utc::now())
            .await
        {
            Ok(prior) => prior,
            Err(StoreError::StaleGuard(_)) | Err(StoreError::NotFound(_)) => {
                return Ok(CallbackOutcome::Ignored);
            }
            Err(err) => return Err(err.into()),
        };
        if prior != ApprovalStatus::Pending {
            return Ok(CallbackOutcome::Ignored);
        }

        let approval = self.store.get_approval(approval_id).await?;
        let job = self.store.get_job(&approval.job_id).await?;

        let resumed_as = if approved {
            let confirmed = ReactiveJob {
                id: uuid::Uuid::new_v4().to_string(),
                thread_id: job.thread_id.clone(),
                trigger_message_id: job.trigger_message_id.clone(),
                mode: JobMode::Execute,
                status: JobStatus::Queued,
                payload: Some(json!({ "confirmed": true })),
                classification: job.classification.clone(),
                approval_id: Some(approval.id.clone()),
                result: None,
                error: None,
                attempts: 0,
                claimed_by: None,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
            };
            self.store.enqueue_job(&confirmed).await?;
            self.store
                .finish_job(
                    &job.id,
                    JobStatus::AwaitingApproval,
                    JobStatus::Done,
                    Some(&json!({ "resumed_as": confirmed.id })),
                    None,
                    Utc::now(),
                )
                .await?;
            Some(confirmed.id)
        } else {
            self.store
                .finish_job(
                    &job.id,
                    JobStatus::AwaitingApproval,
                    JobStatus::Canceled,
                    None,
                    Some("approval_rejected"),
                    Utc::now(),
                )
                .await?;
            None
        };

        self.annotate_control(
            &approval,
            if approved {
                "Approved ✔"
            } else {
                "Rejected ✖"
            },
        )
        .await;

        info!(approval = %approval.id, approved, "approval resolved by callback");
        Ok(CallbackOutcome::Resolved {
            approved,
            resumed_as,
        })
    }

    /// Atomically supersede every pending approval on the thread; called by
    /// ingest before the new message's classify job is enqueued, so the
    /// newer message owns the next approval.
    pub async fn supersede_for_thread(&self, thread_id: &str) -> EngineResult<Vec<Approval>> {
        let superseded = self
            .store
            .supersede_pending_for_thread(thread_id, Utc::now())
            .await?;
        if superseded.is_empty() {
            return Ok(superseded);
        }
        for approval in &superseded {
            self.annotate_control(approval, "Superseded by your newer message").await;
        }
        if let Ok(thread) = self.store.get_thread(thread_id).await {
            let _ = self
                .platform
                .send_message(
                    &thread.external_chat_id,
                    "Dropped the earlier pending confirmation — looking at your new message instead.",
                    None,
                )
                .await;
        }
        info!(thread = thread_id, count = superseded.len(), "approvals superseded");
        Ok(superseded)
    }

    /// Timer sweep: expire overdue approvals and tell the user. Runs at
    /// least once a minute.
    pub async fn expire_due(&self) -> EngineResult<usize> {
        let expired = self.store.expire_due_approvals(Utc::now()).await?;
        for approval in &expired {
            self.annotate_control(approval, "Expired ⏱").await;
            if let Ok(thread) = self.store.get_thread(&approval.thread_id).await {
                let _ = self
                    .platform
                    .send_message(
                        &thread.external_chat_id,
                        "That confirmation expired, so I dropped the action.",
                        None,
                    )
                    .await;
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "approvals expired");
        }
        Ok(expired.len())
    }

    async fn annotate_control(&self, approval: &Approval, note: &str) {
        let Some(control_message_id) = approval.control_message_id.as_deref() else {
            return;
        };
        let Ok(thread) = self.store.get_thread(&approval.thread_id).await else {
            return;
        };
        let text = format!("{}\n\n{note}", approval.proposal_text);
        if let Err(err) = self
            .platform
            .edit_or_annotate(&thread.external_chat_id, control_message_id, &text)
            .await
        {
            warn!("failed to annotate approval control: {err}");
        }
    }
}

fn render_proposal(classification: &Classification) -> String {
    let mut text = format!("I'd like to: {}", classification.summary);
    if let Some(plan) = classification.plan.as_deref() {
        if !plan.is_empty() {
            text.push_str(&format!("\n\nPlan:\n{plan}"));
        }
    }
    text.push_str("\n\nOK to proceed?");
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use adjutant_types::Intent;

    #[test]
    fn proposal_includes_summary_and_plan() {
        let classification = Classification {
            intent: Intent::Command,
            summary: "restart the api service".to_string(),
            plan: Some("1. check status\n2. restart".to_string()),
            needs_confirmation: true,
            confidence: 0.9,
        };
        let text = render_proposal(&classification);
        assert!(text.contains("restart the api service"));
        assert!(text.contains("1. check status"));
        assert!(text.ends_with("OK to proceed?"));
    }
}
