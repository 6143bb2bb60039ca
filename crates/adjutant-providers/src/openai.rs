//! OpenAI-compatible chat-completions adapter, usable against OpenAI,
//! OpenRouter, Groq, Ollama, and the other drop-in endpoints.
//!
//! The classifier asks for a single JSON object and parses it; the executor
//! maps the endpoint's `tool_calls` onto the turn model. Both report token
//! usage from the response's `usage` block.

use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use tracing::warn;

use adjutant_types::{Classification, Intent, ToolSchema};

use crate::{
    with_deadline, ChatTurn, Classifier, ClassifierOutput, Executor, ModelTurn, ProviderError,
    ProviderResult, TokenUsage, ToolCallRequest,
};

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl OpenAiConfig {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

async fn chat_completion(
    client: &Client,
    config: &OpenAiConfig,
    body: Value,
) -> ProviderResult<Value> {
    let response = client
        .post(format!("{}/chat/completions", config.base_url))
        .bearer_auth(&config.api_key)
        .json(&body)
        .send()
        .await
        .map_err(|e| ProviderError::Failed(format!("request failed: {e}")))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(ProviderError::Failed(format!(
            "endpoint returned {status}: {}",
            text.chars().take(300).collect::<String>()
        )));
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| ProviderError::Failed(format!("bad response body: {e}")))
}

fn usage_from(response: &Value) -> TokenUsage {
    TokenUsage {
        tokens_in: response["usage"]["prompt_tokens"].as_i64().unwrap_or(0),
        tokens_out: response["usage"]["completion_tokens"].as_i64().unwrap_or(0),
    }
}

fn wire_messages(messages: &[ChatTurn]) -> Vec<Value> {
    messages
        .iter()
        .map(|turn| {
            // Endpoints without a tool role take tool output as user turns.
            let role = match turn.role.as_str() {
                "tool" => "user",
                other => other,
            };
            json!({ "role": role, "content": turn.content })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

const CLASSIFIER_INSTRUCTION: &str = "Classify the conversation's latest user message. Reply with ONLY a JSON object: \
{\"intent\": \"question\"|\"command\"|\"chat\"|\"other\", \"summary\": \"...\", \
\"plan\": \"...\" or null, \"needs_confirmation\": true|false, \"confidence\": 0.0-1.0}. \
Set needs_confirmation=true for anything with side effects.";

pub struct OpenAiClassifier {
    client: Client,
    config: OpenAiConfig,
    provider_id: String,
}

impl OpenAiClassifier {
    pub fn new(provider_id: &str, config: OpenAiConfig) -> Self {
        Self {
            client: Client::new(),
            config,
            provider_id: provider_id.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Classifier for OpenAiClassifier {
    fn provider(&self) -> &str {
        &self.provider_id
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn classify(
        &self,
        messages: &[ChatTurn],
        deadline: Duration,
    ) -> ProviderResult<ClassifierOutput> {
        let mut wire = vec![json!({ "role": "system", "content": CLASSIFIER_INSTRUCTION })];
        wire.extend(wire_messages(messages));
        let body = json!({
            "model": self.config.model,
            "messages": wire,
            "temperature": 0.0,
        });

        let response =
            with_deadline(deadline, chat_completion(&self.client, &self.config, body)).await?;
        let usage = usage_from(&response);
        let content = response["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("");
        let classification = parse_classification(content).ok_or_else(|| {
            ProviderError::Failed(format!(
                "classifier returned unparseable content: {}",
                content.chars().take(200).collect::<String>()
            ))
        })?;
        Ok(ClassifierOutput {
            classification,
            usage,
        })
    }
}

fn parse_classification(content: &str) -> Option<Classification> {
    // Models sometimes wrap JSON in a code fence; strip it.
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let value: Value = serde_json::from_str(trimmed).ok()?;
    let intent = match value["intent"].as_str()? {
        "question" => Intent::Question,
        "command" => Intent::Command,
        "chat" => Intent::Chat,
        _ => Intent::Other,
    };
    Some(Classification {
        intent,
        summary: value["summary"].as_str().unwrap_or("").to_string(),
        plan: value["plan"].as_str().map(ToString::to_string),
        needs_confirmation: value["needs_confirmation"].as_bool().unwrap_or(true),
        confidence: value["confidence"].as_f64().unwrap_or(0.5).clamp(0.0, 1.0),
    })
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct OpenAiExecutor {
    client: Client,
    config: OpenAiConfig,
    provider_id: String,
}

impl OpenAiExecutor {
    pub fn new(provider_id: &str, config: OpenAiConfig) -> Self {
        Self {
            client: Client::new(),
            config,
            provider_id: provider_id.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Executor for OpenAiExecutor {
    fn provider(&self) -> &str {
        &self.provider_id
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn step(
        &self,
        messages: &[ChatTurn],
        tools: &[ToolSchema],
        deadline: Duration,
    ) -> ProviderResult<ModelTurn> {
        let mut body = json!({
            "model": self.config.model,
            "messages": wire_messages(messages),
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": tool.name,
                                "description": tool.description,
                                "parameters": tool.input_schema,
                            }
                        })
                    })
                    .collect(),
            );
        }

        let response =
            with_deadline(deadline, chat_completion(&self.client, &self.config, body)).await?;
        let usage = usage_from(&response);
        let message = &response["choices"][0]["message"];

        let mut tool_calls = Vec::new();
        if let Some(calls) = message["tool_calls"].as_array() {
            for call in calls {
                let name = call["function"]["name"].as_str().unwrap_or("").to_string();
                if name.is_empty() {
                    continue;
                }
                let raw_args = call["function"]["arguments"].as_str().unwrap_or("{}");
                let input = serde_json::from_str(raw_args).unwrap_or_else(|e| {
                    warn!("tool call arguments were not valid JSON: {e}");
                    json!({})
                });
                tool_calls.push(ToolCallRequest {
                    id: call["id"].as_str().unwrap_or("").to_string(),
                    name,
                    input,
                });
            }
        }

        Ok(ModelTurn {
            text: message["content"].as_str().map(ToString::to_string),
            tool_calls,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_fenced_classification() {
        let plain = r#"{"intent": "command", "summary": "restart api", "plan": null,
                        "needs_confirmation": true, "confidence": 0.93}"#;
        let parsed = parse_classification(plain).unwrap();
        assert_eq!(parsed.intent, Intent::Command);
        assert!(parsed.needs_confirmation);
        assert!((parsed.confidence - 0.93).abs() < 1e-9);

        let fenced = format!("```json\n{plain}\n```");
        assert!(parse_classification(&fenced).is_some());
    }

    #[test]
    fn unparseable_content_is_none() {
        assert!(parse_classification("sure, I'll help!").is_none());
    }

    #[test]
    fn missing_confirmation_defaults_to_true() {
        let parsed =
            parse_classification(r#"{"intent": "command", "summary": "x"}"#).unwrap();
        assert!(parsed.needs_confirmation);
    }
}
