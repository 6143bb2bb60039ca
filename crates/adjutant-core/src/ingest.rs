// Ingest normalizer: the single entry point for platform events.
//
// Signature check, thread upsert, idempotent message insert, artifact rows
// for attachments, callback routing, and supersession of pending approvals —
// strictly before the new classify job is enqueued.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use adjutant_channels::verify_event_signature;
use adjutant_store::{MessageInsert, Store};
use adjutant_types::{
    Artifact, ArtifactKind, ArtifactStatus, Attachment, AttachmentKind, EngineConfig, Event,
    EventKind, JobMode, JobStatus, MessageRole, ReactiveJob, StoredMessage,
};

use crate::approvals::{ApprovalCoordinator, CallbackOutcome, APPROVAL_TAG_PREFIX};
use crate::error::{EngineError, EngineResult};
use crate::tool_gateway::{ToolGateway, TOOL_APPROVAL_TAG_PREFIX};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// New user message stored and a classify job enqueued.
    Queued { job_id: String, message_id: String },
    /// Replayed event; nothing new was created.
    Duplicate,
    /// Edit recorded on the original message; no new job.
    Edited,
    /// System event (membership change etc.) stored without a job.
    SystemStored,
    /// Control callback routed to its coordinator.
    Callback(CallbackOutcome),
    /// Event carried nothing actionable.
    Ignored,
}

#[derive(Clone)]
pub struct IngestNormalizer {
    store: Arc<Store>,
    approvals: ApprovalCoordinator,
    tools: ToolGateway,
    config: EngineConfig,
}

impl IngestNormalizer {
    pub fn new(
        store: Arc<Store>,
        approvals: ApprovalCoordinator,
        tools: ToolGateway,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            approvals,
            tools,
            config,
        }
    }

    pub async fn ingest(&self, event: &Event) -> EngineResult<IngestOutcome> {
        if !verify_event_signature(event, &self.config.platform_secret) {
            warn!(chat = %event.chat_key(), "dropping event with bad signature");
            return Err(EngineError::Unauthorized);
        }

        match event.kind {
            EventKind::Callback => self.handle_callback(event).await,
            EventKind::EditedMessage => self.handle_edit(event).await,
            EventKind::Message => self.handle_message(event).await,
        }
    }

    async fn handle_callback(&self, event: &Event) -> EngineResult<IngestOutcome> {
        let Some(callback) = event.callback.as_ref() else {
            return Ok(IngestOutcome::Ignored);
        };
        if callback.tag.starts_with(APPROVAL_TAG_PREFIX) {
            let outcome = self.approvals.handle_callback(event).await?;
            return Ok(IngestOutcome::Callback(outcome));
        }
        if callback.tag.starts_with(TOOL_APPROVAL_TAG_PREFIX) {
            let outcome = self.tools.handle_callback(event).await?;
            return Ok(IngestOutcome::Callback(outcome));
        }
        debug!(tag = %callback.tag, "callback with unknown tag ignored");
        Ok(IngestOutcome::Ignored)
    }

    async fn handle_edit(&self, event: &Event) -> EngineResult<IngestOutcome> {
        let Some(message) = event.message.as_ref() else {
            return Ok(IngestOutcome::Ignored);
        };
        let thread = self
            .store
            .upsert_thread(
                &event.platform,
                &event.chat.id,
                &event.chat.chat_type,
                event.chat.title.as_deref(),
                Utc::now(),
            )
            .await?;
        let known = self
            .store
            .mark_message_edited(
                &thread.id,
                &message.external_id,
                message.text.as_deref(),
                event.raw.as_ref(),
                Utc::now(),
            )
            .await?;
        if !known {
            debug!(external_id = %message.external_id, "edit for unknown message ignored");
            return Ok(IngestOutcome::Ignored);
        }
        Ok(IngestOutcome::Edited)
    }

    async fn handle_message(&self, event: &Event) -> EngineResult<IngestOutcome> {
        let Some(message) = event.message.as_ref() else {
            return Ok(IngestOutcome::Ignored);
        };
        let thread = self
            .store
            .upsert_thread(
                &event.platform,
                &event.chat.id,
                &event.chat.chat_type,
                event.chat.title.as_deref(),
                Utc::now(),
            )
            .await?;

        // Events without an author are platform/system notices; they are
        // stored for context but never scheduled.
        let role = if event.author.is_some() {
            MessageRole::User
        } else {
            MessageRole::System
        };

        let stored = StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: thread.id.clone(),
            external_message_id: Some(message.external_id.clone()),
            role,
            author_id: event
                .author
                .as_ref()
                .filter(|_| role == MessageRole::User)
                .map(|a| a.id.clone()),
            text: message.text.clone(),
            created_at: message.timestamp,
            edited_at: None,
            raw_payload: event.raw.clone(),
        };

        if self.store.insert_message(&stored).await? == MessageInsert::Duplicate {
            debug!(external_id = %message.external_id, "duplicate event replayed");
            return Ok(IngestOutcome::Duplicate);
        }

        for attachment in &message.attachments {
            let artifact = pending_artifact(&stored, attachment);
            self.store.insert_artifact(&artifact).await?;
        }

        if role == MessageRole::System {
            return Ok(IngestOutcome::SystemStored);
        }

        // A newer user message takes over the thread: retire any pending
        // confirmation before its own classify job becomes visible.
        self.approvals.supersede_for_thread(&thread.id).await?;

        let job = ReactiveJob {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: thread.id.clone(),
            trigger_message_id: stored.id.clone(),
            mode: JobMode::Classify,
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
        };
        self.store.enqueue_job(&job).await?;

        Ok(IngestOutcome::Queued {
            job_id: job.id,
            message_id: stored.id,
        })
    }
}

/// Build the pending artifact row for one attachment. The content carries
/// what the out-of-process processor needs to fetch the blob; the uri is the
/// time-bucketed location the blob will land at.
fn pending_artifact(message: &StoredMessage, attachment: &Attachment) -> Artifact {
    let kind = match attachment.kind {
        AttachmentKind::Voice => ArtifactKind::VoiceTranscript,
        AttachmentKind::Image => ArtifactKind::ImageStruct,
        AttachmentKind::Document => ArtifactKind::FileMeta,
    };
    let ext = extension_for(attachment);
    Artifact {
        id: uuid::Uuid::new_v4().to_string(),
        message_id: message.id.clone(),
        kind,
        content: Some(json!({
            "external_blob_id": attachment.external_blob_id,
            "mime": attachment.mime,
            "size": attachment.size,
            "duration_secs": attachment.duration_secs,
        })),
        uri: Some(format!(
            "media/{}/{}.{ext}",
            message.created_at.format("%Y-%m-%d"),
            message.id,
        )),
        status: ArtifactStatus::Pending,
        attempt_count: 0,
        error: None,
        created_at: Utc::now(),
    }
}

fn extension_for(attachment: &Attachment) -> &'static str {
    match attachment.kind {
        AttachmentKind::Voice => "ogg",
        AttachmentKind::Image => "jpg",
        AttachmentKind::Document => match attachment.mime.as_deref() {
            Some("application/pdf") => "pdf",
            Some("text/plain") => "txt",
            _ => "bin",
        },
    }
}
