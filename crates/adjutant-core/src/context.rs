// Conversation window assembly for model calls. The last K messages are
// loaded with their completed artifacts inlined, so a voice note or image
// shows up to the model as its transcript or structured description.

use std::sync::Arc;

use adjutant_providers::ChatTurn;
use adjutant_store::{Store, StoreResult};
use adjutant_types::{ArtifactKind, MessageRole};

pub async fn build_thread_context(
    store: &Arc<Store>,
    thread_id: &str,
    window: usize,
) -> StoreResult<Vec<ChatTurn>> {
    let messages = store.recent_messages(thread_id, window).await?;
    let mut turns = Vec::with_capacity(messages.len());

    for message in messages {
        let mut content = message.text.clone().unwrap_or_default();
        let artifacts = store.done_artifacts_for_message(&message.id).await?;
        for artifact in artifacts {
            let Some(value) = artifact.content.as_ref() else {
                continue;
            };
            let rendered = value
                .as_str()
                .map(ToString::to_string)
                .unwrap_or_else(|| value.to_string());
            let label = match artifact.kind {
                ArtifactKind::VoiceTranscript => "voice transcript",
                ArtifactKind::ImageStruct => "image description",
                ArtifactKind::OcrText => "ocr text",
                ArtifactKind::FileMeta => "file",
                ArtifactKind::ToolResult => "tool result",
            };
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str(&format!("[{label}] {rendered}"));
        }
        if content.is_empty() {
            continue;
        }
        let role = match message.role {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        };
        turns.push(ChatTurn::new(role, content));
    }
    Ok(turns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use adjutant_store::Store;
    use adjutant_types::{Artifact, ArtifactStatus, StoredMessage};
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn window_inlines_done_artifacts() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let thread = store
            .upsert_thread("telegram", "42", "private", None, Utc::now())
            .await
            .unwrap();

        let msg = StoredMessage {
            id: "m1".to_string(),
            thread_id: thread.id.clone(),
            external_message_id: Some("100".to_string()),
            role: MessageRole::User,
            author_id: Some("u1".to_string()),
            text: None,
            created_at: Utc::now(),
            edited_at: None,
            raw_payload: None,
        };
        store.insert_message(&msg).await.unwrap();
        store
            .insert_artifact(&Artifact {
                id: "a1".to_string(),
                message_id: "m1".to_string(),
                kind: ArtifactKind::VoiceTranscript,
                content: Some(json!("please check the db")),
                uri: None,
                status: ArtifactStatus::Done,
                attempt_count: 1,
                error: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let turns = build_thread_context(&store, &thread.id, 30).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, "user");
        assert!(turns[0].content.contains("voice transcript"));
        assert!(turns[0].content.contains("please check the db"));
    }

    #[tokio::test]
    async fn pending_artifacts_are_not_inlined() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let thread = store
            .upsert_thread("telegram", "42", "private", None, Utc::now())
            .await
            .unwrap();
        let msg = StoredMessage {
            id: "m1".to_string(),
            thread_id: thread.id.clone(),
            external_message_id: Some("100".to_string()),
            role: MessageRole::User,
            author_id: Some("u1".to_string()),
            text: Some("see attached".to_string()),
            created_at: Utc::now(),
            edited_at: None,
            raw_payload: None,
        };
        store.insert_message(&msg).await.unwrap();
        store
            .insert_artifact(&Artifact {
                id: "a1".to_string(),
                message_id: "m1".to_string(),
                kind: ArtifactKind::OcrText,
                content: None,
                uri: None,
                status: ArtifactStatus::Pending,
                attempt_count: 0,
                error: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let turns = build_thread_context(&store, &thread.id, 30).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].content, "see attached");
    }
}
