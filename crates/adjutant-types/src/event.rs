//! Inbound platform event model.
//!
//! Adapters translate provider-specific updates into this shape before any
//! core processing. The `signature` field carries the shared secret the
//! ingest layer verifies byte-exact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    EditedMessage,
    Callback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatInfo {
    pub id: String,
    pub chat_type: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorInfo {
    pub id: String,
    pub username: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Voice,
    Image,
    Document,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub external_blob_id: String,
    pub mime: Option<String>,
    pub size: Option<i64>,
    pub duration_secs: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub external_id: String,
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub timestamp: DateTime<Utc>,
}

/// Echo of an actionable control press. `tag` is the opaque string the core
/// attached when it sent the control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackInfo {
    pub tag: String,
    pub data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub platform: String,
    pub chat: ChatInfo,
    pub author: Option<AuthorInfo>,
    pub message: Option<InboundMessage>,
    pub callback: Option<CallbackInfo>,
    pub signature: Option<String>,
    #[serde(default)]
    pub raw: Option<Value>,
}

impl Event {
    /// Natural sort/debug label: `platform:chat_id`.
    pub fn chat_key(&self) -> String {
        format!("{}:{}", self.platform, self.chat.id)
    }
}
