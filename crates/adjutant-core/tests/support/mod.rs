// Shared harness for the end-to-end engine tests: an in-memory platform
// that records outbound traffic, and scripted classifier/executor mocks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use adjutant_channels::{ChatPlatform, ControlSpec};
use adjutant_core::{AlwaysHealthy, Engine};
use adjutant_providers::{
    ChatTurn, Classifier, ClassifierOutput, Executor, ModelTurn, ProviderError, ProviderResult,
    TokenUsage, ToolCallRequest,
};
use adjutant_store::Store;
use adjutant_tools::ToolRegistry;
use adjutant_types::{
    AuthorInfo, CallbackInfo, ChatInfo, Classification, EngineConfig, Event, EventKind,
    InboundMessage, Intent, ToolSchema,
};

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub chat_id: String,
    pub text: String,
    pub control_tag: Option<String>,
    pub external_id: String,
}

/// Records everything the engine sends; external ids are monotonically
/// increasing integers like a real platform would hand back.
#[derive(Default)]
pub struct MockPlatform {
    pub sent: Mutex<Vec<SentMessage>>,
    counter: AtomicI64,
}

impl MockPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            counter: AtomicI64::new(1000),
        })
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().iter().map(|m| m.text.clone()).collect()
    }

    pub fn last_control_tag(&self) -> Option<String> {
        self.sent
            .lock()
            .iter()
            .rev()
            .find_map(|m| m.control_tag.clone())
    }

    fn next_id(&self) -> String {
        self.counter.fetch_add(1, Ordering::SeqCst).to_string()
    }
}

#[async_trait]
impl ChatPlatform for MockPlatform {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        _reply_to: Option<&str>,
    ) -> anyhow::Result<String> {
        let id = self.next_id();
        self.sent.lock().push(SentMessage {
            chat_id: chat_id.to_string(),
            text: text.to_string(),
            control_tag: None,
            external_id: id.clone(),
        });
        Ok(id)
    }

    async fn send_message_with_control(
        &self,
        chat_id: &str,
        text: &str,
        control: &ControlSpec,
    ) -> anyhow::Result<String> {
        let id = self.next_id();
        self.sent.lock().push(SentMessage {
            chat_id: chat_id.to_string(),
            text: text.to_string(),
            control_tag: Some(control.tag.clone()),
            external_id: id.clone(),
        });
        Ok(id)
    }
}

pub struct ScriptedClassifier {
    script: Mutex<VecDeque<ClassifierOutput>>,
}

impl ScriptedClassifier {
    pub fn new(outputs: Vec<ClassifierOutput>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(outputs.into()),
        })
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    fn provider(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-classifier"
    }

    async fn classify(
        &self,
        _messages: &[ChatTurn],
        _deadline: Duration,
    ) -> ProviderResult<ClassifierOutput> {
        self.script
            .lock()
            .pop_front()
            .ok_or_else(|| ProviderError::Failed("classifier script exhausted".to_string()))
    }
}

pub struct ScriptedExecutor {
    script: Mutex<VecDeque<ModelTurn>>,
}

impl ScriptedExecutor {
    pub fn new(turns: Vec<ModelTurn>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(turns.into()),
        })
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn provider(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-executor"
    }

    async fn step(
        &self,
        _messages: &[ChatTurn],
        _tools: &[ToolSchema],
        _deadline: Duration,
    ) -> ProviderResult<ModelTurn> {
        self.script
            .lock()
            .pop_front()
            .ok_or_else(|| ProviderError::Failed("executor script exhausted".to_string()))
    }
}

pub fn classification(intent: Intent, needs_confirmation: bool, summary: &str) -> ClassifierOutput {
    ClassifierOutput {
        classification: Classification {
            intent,
            summary: summary.to_string(),
            plan: None,
            needs_confirmation,
            confidence: 0.9,
        },
        usage: TokenUsage {
            tokens_in: 120,
            tokens_out: 40,
        },
    }
}

pub fn final_turn(text: &str) -> ModelTurn {
    ModelTurn {
        text: Some(text.to_string()),
        tool_calls: Vec::new(),
        usage: TokenUsage {
            tokens_in: 400,
            tokens_out: 80,
        },
    }
}

pub fn tool_call_turn(name: &str, input: serde_json::Value) -> ModelTurn {
    ModelTurn {
        text: None,
        tool_calls: vec![ToolCallRequest {
            id: "call-1".to_string(),
            name: name.to_string(),
            input,
        }],
        usage: TokenUsage {
            tokens_in: 300,
            tokens_out: 50,
        },
    }
}

pub fn message_event(chat_id: i64, external_message_id: i64, text: &str) -> Event {
    Event {
        kind: EventKind::Message,
        platform: "telegram".to_string(),
        chat: ChatInfo {
            id: chat_id.to_string(),
            chat_type: "private".to_string(),
            title: None,
        },
        author: Some(AuthorInfo {
            id: "7".to_string(),
            username: Some("owner".to_string()),
            display_name: None,
        }),
        message: Some(InboundMessage {
            external_id: external_message_id.to_string(),
            text: Some(text.to_string()),
            attachments: Vec::new(),
            timestamp: chrono::Utc::now(),
        }),
        callback: None,
        signature: None,
        raw: Some(json!({ "test": true })),
    }
}

pub fn callback_event(chat_id: i64, tag: &str, data: Option<&str>) -> Event {
    Event {
        kind: EventKind::Callback,
        platform: "telegram".to_string(),
        chat: ChatInfo {
            id: chat_id.to_string(),
            chat_type: "private".to_string(),
            title: None,
        },
        author: Some(AuthorInfo {
            id: "7".to_string(),
            username: Some("owner".to_string()),
            display_name: None,
        }),
        message: None,
        callback: Some(CallbackInfo {
            tag: tag.to_string(),
            data: data.map(ToString::to_string),
        }),
        signature: None,
        raw: None,
    }
}

pub struct TestRig {
    pub engine: Engine,
    pub platform: Arc<MockPlatform>,
}

pub async fn build_engine(
    classifier: Arc<ScriptedClassifier>,
    executor: Arc<ScriptedExecutor>,
    registry: ToolRegistry,
    config: EngineConfig,
) -> TestRig {
    let store = Arc::new(Store::open_in_memory().await.expect("store"));
    let platform = MockPlatform::new();
    let engine = Engine::new(
        store,
        platform.clone(),
        classifier,
        executor,
        registry,
        adjutant_tools::SafetyPolicy::default(),
        adjutant_core::PricingTable::new().with_rate("mock-executor", 0.15, 0.60),
        Arc::new(AlwaysHealthy),
        config,
    );
    TestRig { engine, platform }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        master_chat_id: Some("42".to_string()),
        ..EngineConfig::default()
    }
}
