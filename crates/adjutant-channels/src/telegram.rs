//! Telegram adapter.
//!
//! Long-polls the Bot API (`getUpdates` with `timeout=25`) and translates
//! updates into the internal event model. Outbound messages are chunked at
//! Telegram's 4096-character limit; a confirmation control is rendered as a
//! single inline-keyboard button whose `callback_data` carries the opaque
//! tag the core attached.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use adjutant_types::{
    Attachment, AttachmentKind, AuthorInfo, CallbackInfo, ChatInfo, Event, EventKind,
    InboundMessage,
};

use crate::chunk::chunk_message;
use crate::config::{is_user_allowed, TelegramConfig};
use crate::traits::{ChatPlatform, ControlSpec};

const MAX_MESSAGE_LEN: usize = 4096;
const TELEGRAM_API: &str = "https://api.telegram.org/bot";

pub struct TelegramAdapter {
    bot_token: String,
    allowed_users: Vec<String>,
    shared_secret: String,
    client: Client,
}

impl TelegramAdapter {
    pub fn new(config: TelegramConfig) -> anyhow::Result<Self> {
        Ok(Self {
            bot_token: config.bot_token,
            allowed_users: config.allowed_users,
            shared_secret: config.shared_secret,
            client: Client::builder()
                .timeout(Duration::from_secs(35))
                .build()
                .context("failed to create reqwest client")?,
        })
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}{}/{}", TELEGRAM_API, self.bot_token, method)
    }

    async fn post_message(&self, body: Value) -> anyhow::Result<String> {
        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("telegram sendMessage failed: {text}");
        }
        let json: Value = resp.json().await?;
        let message_id = json["result"]["message_id"]
            .as_i64()
            .context("sendMessage response missing message_id")?;
        Ok(message_id.to_string())
    }

    /// Long-poll loop. Translated events are pushed to `tx`; returning `Ok`
    /// means the receiver was dropped (shutdown).
    pub async fn listen(&self, tx: mpsc::Sender<Event>) -> anyhow::Result<()> {
        let mut offset: i64 = 0;
        loop {
            let resp = self
                .client
                .get(self.api_url("getUpdates"))
                .query(&[
                    ("timeout", "25"),
                    ("offset", &offset.to_string()),
                    (
                        "allowed_updates",
                        r#"["message","edited_message","callback_query"]"#,
                    ),
                ])
                .send()
                .await;

            let resp = match resp {
                Ok(r) => r,
                Err(e) => {
                    warn!("telegram poll error: {e:?}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            if !resp.status().is_success() {
                let status = resp.status();
                warn!("telegram getUpdates failed ({status})");
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }

            let json: Value = match resp.json().await {
                Ok(v) => v,
                Err(e) => {
                    warn!("telegram json parse error: {e}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            let updates = match json.get("result").and_then(|r| r.as_array()) {
                Some(u) => u.clone(),
                None => continue,
            };

            for update in &updates {
                let update_id = update["update_id"].as_i64().unwrap_or(0);
                offset = offset.max(update_id + 1);

                let Some(event) = self.translate_update(update).await else {
                    continue;
                };
                if tx.send(event).await.is_err() {
                    return Ok(()); // receiver dropped — shutdown
                }
            }
        }
    }

    async fn translate_update(&self, update: &Value) -> Option<Event> {
        if let Some(cb) = update.get("callback_query") {
            return self.translate_callback(cb).await;
        }
        if let Some(msg) = update.get("message") {
            return self.translate_message(msg, EventKind::Message);
        }
        if let Some(msg) = update.get("edited_message") {
            return self.translate_message(msg, EventKind::EditedMessage);
        }
        None
    }

    async fn translate_callback(&self, cb: &Value) -> Option<Event> {
        // Acknowledge the press right away so the client stops its spinner.
        if let Some(id) = cb["id"].as_str() {
            let _ = self
                .client
                .post(self.api_url("answerCallbackQuery"))
                .json(&json!({ "callback_query_id": id }))
                .send()
                .await;
        }

        let author = self.author_from(cb.get("from"))?;
        if !self.sender_allowed(&author) {
            debug!("telegram: ignoring callback from {} (not allowed)", author.id);
            return None;
        }
        let chat = cb["message"]["chat"].clone();
        let raw_data = cb["data"].as_str()?;
        // `tag|data` encoding; a bare tag means the single control was pressed.
        let (tag, data) = match raw_data.split_once('|') {
            Some((tag, data)) => (tag.to_string(), Some(data.to_string())),
            None => (raw_data.to_string(), None),
        };
        Some(Event {
            kind: EventKind::Callback,
            platform: "telegram".to_string(),
            chat: chat_info(&chat)?,
            author: Some(author),
            message: None,
            callback: Some(CallbackInfo { tag, data }),
            signature: self.signature(),
            raw: Some(cb.clone()),
        })
    }

    fn translate_message(&self, msg: &Value, kind: EventKind) -> Option<Event> {
        let author = self.author_from(msg.get("from"))?;
        if !self.sender_allowed(&author) {
            debug!("telegram: ignoring message from {} (not allowed)", author.id);
            return None;
        }
        let external_id = msg["message_id"].as_i64()?.to_string();
        let timestamp = msg["date"]
            .as_i64()
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(chrono::Utc::now);

        Some(Event {
            kind,
            platform: "telegram".to_string(),
            chat: chat_info(&msg["chat"])?,
            author: Some(author),
            message: Some(InboundMessage {
                external_id,
                text: msg["text"]
                    .as_str()
                    .or_else(|| msg["caption"].as_str())
                    .map(ToString::to_string),
                attachments: attachments_from(msg),
                timestamp,
            }),
            callback: None,
            signature: self.signature(),
            raw: Some(msg.clone()),
        })
    }

    fn author_from(&self, from: Option<&Value>) -> Option<AuthorInfo> {
        let from = from?;
        Some(AuthorInfo {
            id: from["id"].as_i64()?.to_string(),
            username: from["username"].as_str().map(ToString::to_string),
            display_name: from["first_name"].as_str().map(ToString::to_string),
        })
    }

    fn sender_allowed(&self, author: &AuthorInfo) -> bool {
        if self.allowed_users.iter().any(|a| a == "*") {
            return true;
        }
        let candidates = [author.username.as_deref(), Some(author.id.as_str())];
        candidates
            .iter()
            .flatten()
            .any(|candidate| is_user_allowed(candidate, &self.allowed_users))
    }

    fn signature(&self) -> Option<String> {
        if self.shared_secret.is_empty() {
            None
        } else {
            Some(self.shared_secret.clone())
        }
    }
}

fn chat_info(chat: &Value) -> Option<ChatInfo> {
    Some(ChatInfo {
        id: chat["id"].as_i64()?.to_string(),
        chat_type: chat["type"].as_str().unwrap_or("private").to_string(),
        title: chat["title"].as_str().map(ToString::to_string),
    })
}

fn attachments_from(msg: &Value) -> Vec<Attachment> {
    let mut out = Vec::new();
    if let Some(voice) = msg.get("voice") {
        if let Some(file_id) = voice["file_id"].as_str() {
            out.push(Attachment {
                kind: AttachmentKind::Voice,
                external_blob_id: file_id.to_string(),
                mime: voice["mime_type"].as_str().map(ToString::to_string),
                size: voice["file_size"].as_i64(),
                duration_secs: voice["duration"].as_i64(),
            });
        }
    }
    // Telegram sends photos as a size ladder; the last entry is the largest.
    if let Some(photos) = msg.get("photo").and_then(|p| p.as_array()) {
        if let Some(largest) = photos.last() {
            if let Some(file_id) = largest["file_id"].as_str() {
                out.push(Attachment {
                    kind: AttachmentKind::Image,
                    external_blob_id: file_id.to_string(),
                    mime: Some("image/jpeg".to_string()),
                    size: largest["file_size"].as_i64(),
                    duration_secs: None,
                });
            }
        }
    }
    if let Some(doc) = msg.get("document") {
        if let Some(file_id) = doc["file_id"].as_str() {
            out.push(Attachment {
                kind: AttachmentKind::Document,
                external_blob_id: file_id.to_string(),
                mime: doc["mime_type"].as_str().map(ToString::to_string),
                size: doc["file_size"].as_i64(),
                duration_secs: None,
            });
        }
    }
    out
}

#[async_trait]
impl ChatPlatform for TelegramAdapter {
    fn name(&self) -> &str {
        "telegram"
    }

    fn message_limit(&self) -> usize {
        MAX_MESSAGE_LEN
    }

    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> anyhow::Result<String> {
        let mut first_id = None;
        for chunk in chunk_message(text, MAX_MESSAGE_LEN) {
            let mut body = json!({
                "chat_id": chat_id,
                "text": chunk,
            });
            if first_id.is_none() {
                if let Some(reply_to) = reply_to {
                    body["reply_to_message_id"] = json!(reply_to.parse::<i64>().unwrap_or(0));
                }
            }
            let id = self.post_message(body).await?;
            first_id.get_or_insert(id);
        }
        first_id.context("empty outbound message")
    }

    async fn send_message_with_control(
        &self,
        chat_id: &str,
        text: &str,
        control: &ControlSpec,
    ) -> anyhow::Result<String> {
        let chunks = chunk_message(text, MAX_MESSAGE_LEN);
        let (last, head) = chunks.split_last().context("empty outbound message")?;
        for chunk in head {
            self.post_message(json!({ "chat_id": chat_id, "text": chunk }))
                .await?;
        }
        // The control rides on the final chunk so it sits under the proposal.
        self.post_message(json!({
            "chat_id": chat_id,
            "text": last,
            "reply_markup": {
                "inline_keyboard": [[{
                    "text": control.label,
                    "callback_data": control.tag,
                }]]
            }
        }))
        .await
    }

    async fn edit_or_annotate(
        &self,
        chat_id: &str,
        message_id: &str,
        text: &str,
    ) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(self.api_url("editMessageText"))
            .json(&json!({
                "chat_id": chat_id,
                "message_id": message_id.parse::<i64>().unwrap_or(0),
                "text": text,
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            // Message may be too old to edit; annotation is best effort.
            warn!("telegram editMessageText failed: {}", resp.status());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachments_extract_voice_photo_document() {
        let msg = json!({
            "voice": {"file_id": "v1", "mime_type": "audio/ogg", "duration": 4, "file_size": 2048},
            "photo": [
                {"file_id": "small", "file_size": 100},
                {"file_id": "large", "file_size": 900}
            ],
            "document": {"file_id": "d1", "mime_type": "application/pdf", "file_size": 4096}
        });
        let attachments = attachments_from(&msg);
        assert_eq!(attachments.len(), 3);
        assert_eq!(attachments[0].kind, AttachmentKind::Voice);
        assert_eq!(attachments[1].external_blob_id, "large");
        assert_eq!(attachments[2].mime.as_deref(), Some("application/pdf"));
    }

    #[test]
    fn callback_data_splits_tag_and_data() {
        let raw = "approval:abc|approve";
        let (tag, data) = raw.split_once('|').unwrap();
        assert_eq!(tag, "approval:abc");
        assert_eq!(data, "approve");
    }
}
