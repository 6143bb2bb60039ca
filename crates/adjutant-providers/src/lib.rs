//! Model ports: the cheap classifier that decides intent, and the executor
//! that produces the final action or response and may request tool calls.
//!
//! Both ports are turn-based. Streaming is deliberately not modeled; the
//! engine records token usage per completed call.

pub mod openai;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use adjutant_types::{Classification, ToolSchema};

pub use openai::{OpenAiClassifier, OpenAiConfig, OpenAiExecutor};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider error: {0}")]
    Failed(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// One message of model conversation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub tokens_in: i64,
    pub tokens_out: i64,
}

impl TokenUsage {
    pub fn total(&self) -> i64 {
        self.tokens_in + self.tokens_out
    }
}

/// Classifier verdict plus the usage of the call that produced it.
#[derive(Debug, Clone)]
pub struct ClassifierOutput {
    pub classification: Classification,
    pub usage: TokenUsage,
}

/// A tool invocation requested by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// One executor turn: optional assistant text and zero or more tool calls.
/// A turn with no tool calls ends the tool-use loop.
#[derive(Debug, Clone, Default)]
pub struct ModelTurn {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: TokenUsage,
}

impl ModelTurn {
    pub fn is_final(&self) -> bool {
        self.tool_calls.is_empty()
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    fn provider(&self) -> &str;
    fn model(&self) -> &str;

    /// Classify the conversation window within `deadline`.
    async fn classify(
        &self,
        messages: &[ChatTurn],
        deadline: Duration,
    ) -> ProviderResult<ClassifierOutput>;
}

#[async_trait]
pub trait Executor: Send + Sync {
    fn provider(&self) -> &str;
    fn model(&self) -> &str;

    /// Produce the next turn given the conversation so far. Tool results are
    /// appended to `messages` by the caller between turns.
    async fn step(
        &self,
        messages: &[ChatTurn],
        tools: &[ToolSchema],
        deadline: Duration,
    ) -> ProviderResult<ModelTurn>;
}

/// Enforce a call deadline, mapping elapsed timers to `ProviderError::Timeout`.
/// Adapters wrap their transport futures with this.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> ProviderResult<T>
where
    F: Future<Output = ProviderResult<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(deadline)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_deadline_times_out() {
        let result: ProviderResult<()> = with_deadline(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(ProviderError::Timeout(_))));
    }

    #[tokio::test]
    async fn with_deadline_passes_result_through() {
        let result = with_deadline(Duration::from_secs(1), async { Ok(42u32) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn turn_without_tool_calls_is_final() {
        let turn = ModelTurn {
            text: Some("done".to_string()),
            ..Default::default()
        };
        assert!(turn.is_final());
    }
}
