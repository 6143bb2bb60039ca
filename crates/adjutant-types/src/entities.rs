// Entity types persisted by the store.
// Status enums carry their transition rules (`is_terminal`) so callers never
// hardcode state names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A conversation scope. `(platform, external_chat_id)` is the natural key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatThread {
    pub id: String,
    pub platform: String,
    pub external_chat_id: String,
    pub chat_type: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            _ => None,
        }
    }
}

/// One turn in a thread. Immutable after insert except for `edited_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub thread_id: String,
    pub external_message_id: Option<String>,
    pub role: MessageRole,
    pub author_id: Option<String>,
    pub text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub raw_payload: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    VoiceTranscript,
    ImageStruct,
    OcrText,
    FileMeta,
    ToolResult,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::VoiceTranscript => "voice_transcript",
            ArtifactKind::ImageStruct => "image_struct",
            ArtifactKind::OcrText => "ocr_text",
            ArtifactKind::FileMeta => "file_meta",
            ArtifactKind::ToolResult => "tool_result",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "voice_transcript" => Some(ArtifactKind::VoiceTranscript),
            "image_struct" => Some(ArtifactKind::ImageStruct),
            "ocr_text" => Some(ArtifactKind::OcrText),
            "file_meta" => Some(ArtifactKind::FileMeta),
            "tool_result" => Some(ArtifactKind::ToolResult),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Pending => "pending",
            ArtifactStatus::Processing => "processing",
            ArtifactStatus::Done => "done",
            ArtifactStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ArtifactStatus::Pending),
            "processing" => Some(ArtifactStatus::Processing),
            "done" => Some(ArtifactStatus::Done),
            "failed" => Some(ArtifactStatus::Failed),
            _ => None,
        }
    }
}

/// Structured derivative of a media message, produced by out-of-process
/// artifact processors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub message_id: String,
    pub kind: ArtifactKind,
    pub content: Option<Value>,
    pub uri: Option<String>,
    pub status: ArtifactStatus,
    pub attempt_count: i64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    Classify,
    Execute,
    Answer,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::Classify => "classify",
            JobMode::Execute => "execute",
            JobMode::Answer => "answer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "classify" => Some(JobMode::Classify),
            "execute" => Some(JobMode::Execute),
            "answer" => Some(JobMode::Answer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    AwaitingApproval,
    Done,
    Failed,
    Canceled,
    Superseded,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::AwaitingApproval => "awaiting_approval",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
            JobStatus::Superseded => "superseded",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "awaiting_approval" => Some(JobStatus::AwaitingApproval),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            "canceled" => Some(JobStatus::Canceled),
            "superseded" => Some(JobStatus::Superseded),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Failed | JobStatus::Canceled | JobStatus::Superseded
        )
    }
}

/// Classifier verdict for one trigger message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Question,
    Command,
    Chat,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub intent: Intent,
    pub summary: String,
    pub plan: Option<String>,
    pub needs_confirmation: bool,
    pub confidence: f64,
}

/// Unit of scheduled reactive work attached to a trigger message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactiveJob {
    pub id: String,
    pub thread_id: String,
    pub trigger_message_id: String,
    pub mode: JobMode,
    pub status: JobStatus,
    pub payload: Option<Value>,
    pub classification: Option<Classification>,
    pub approval_id: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub attempts: i64,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Superseded,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Superseded => "superseded",
            ApprovalStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ApprovalStatus::Pending),
            "approved" => Some(ApprovalStatus::Approved),
            "rejected" => Some(ApprovalStatus::Rejected),
            "superseded" => Some(ApprovalStatus::Superseded),
            "expired" => Some(ApprovalStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

/// A confirmation handshake with the owner. 1:1 with its job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub thread_id: String,
    pub job_id: String,
    pub proposal_text: String,
    pub control_message_id: Option<String>,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolver_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerScope {
    Reactive,
    Proactive,
}

impl LedgerScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerScope::Reactive => "reactive",
            LedgerScope::Proactive => "proactive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "reactive" => Some(LedgerScope::Reactive),
            "proactive" => Some(LedgerScope::Proactive),
            _ => None,
        }
    }
}

/// Append-only token accounting row. `tokens_total` is always
/// `tokens_in + tokens_out`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub scope: LedgerScope,
    pub provider: String,
    pub model: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub tokens_total: i64,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Building,
    Testing,
    Deploying,
    Healthy,
    RolledBack,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Building => "building",
            DeploymentStatus::Testing => "testing",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Healthy => "healthy",
            DeploymentStatus::RolledBack => "rolled_back",
            DeploymentStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "building" => Some(DeploymentStatus::Building),
            "testing" => Some(DeploymentStatus::Testing),
            "deploying" => Some(DeploymentStatus::Deploying),
            "healthy" => Some(DeploymentStatus::Healthy),
            "rolled_back" => Some(DeploymentStatus::RolledBack),
            "failed" => Some(DeploymentStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Healthy | DeploymentStatus::RolledBack | DeploymentStatus::Failed
        )
    }

    /// Forward steps of the promotion pipeline. Rollback and failure are
    /// handled separately.
    pub fn next_forward(&self) -> Option<DeploymentStatus> {
        match self {
            DeploymentStatus::Building => Some(DeploymentStatus::Testing),
            DeploymentStatus::Testing => Some(DeploymentStatus::Deploying),
            DeploymentStatus::Deploying => Some(DeploymentStatus::Healthy),
            _ => None,
        }
    }
}

/// One attempt to promote a commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub commit_id: String,
    pub branch: String,
    pub status: DeploymentStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub report: Option<Value>,
    pub rollback_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ToolApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolApprovalStatus::Pending => "pending",
            ToolApprovalStatus::Approved => "approved",
            ToolApprovalStatus::Rejected => "rejected",
            ToolApprovalStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ToolApprovalStatus::Pending),
            "approved" => Some(ToolApprovalStatus::Approved),
            "rejected" => Some(ToolApprovalStatus::Rejected),
            "expired" => Some(ToolApprovalStatus::Expired),
            _ => None,
        }
    }
}

/// A gated tool-use request awaiting owner confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolApproval {
    pub id: String,
    pub tool_name: String,
    pub input: Value,
    pub reasoning: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ToolApprovalStatus,
    pub response: Option<String>,
}

/// Long-term key/value note written by the autonomous loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryNote {
    pub key: String,
    pub value: String,
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    Master,
    Agent,
}

impl TaskSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskSource::Master => "master",
            TaskSource::Agent => "agent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "master" => Some(TaskSource::Master),
            "agent" => Some(TaskSource::Agent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "done" => Some(TaskStatus::Done),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// Backlog item for the autonomous loop. Master-sourced tasks always outrank
/// agent-sourced ones; within a source, lower `priority` wins, then age.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    pub parent_id: Option<String>,
    pub goal_id: Option<String>,
    pub title: String,
    pub detail: Option<String>,
    pub source: TaskSource,
    pub priority: i64,
    pub order_index: i64,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub title: String,
    pub detail: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}
