// Tool gateway: every executor tool call passes through here. Safe calls run
// immediately, forbidden calls come back as a structured error the model can
// read, and gated calls open a ToolApproval and wait — with a deadline and
// cancellation — for the owner's button press.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use adjutant_channels::{ChatPlatform, ControlSpec};
use adjutant_store::{Store, StoreError};
use adjutant_tools::{
    forbidden_tool_result, unapproved_tool_result, unknown_tool_result, GateDecision, SafetyGate,
    ToolRegistry,
};
use adjutant_providers::ToolCallRequest;
use adjutant_types::{
    EngineConfig, Event, ToolApproval, ToolApprovalStatus, ToolResult, ToolSchema,
};

use crate::approvals::CallbackOutcome;
use crate::error::EngineResult;

pub const TOOL_APPROVAL_TAG_PREFIX: &str = "toolapproval:";

type Waiters = Arc<RwLock<HashMap<String, watch::Sender<Option<ToolApprovalStatus>>>>>;

#[derive(Clone)]
pub struct ToolGateway {
    store: Arc<Store>,
    platform: Arc<dyn ChatPlatform>,
    registry: ToolRegistry,
    gate: Arc<SafetyGate>,
    config: EngineConfig,
    waiters: Waiters,
}

impl ToolGateway {
    pub fn new(
        store: Arc<Store>,
        platform: Arc<dyn ChatPlatform>,
        registry: ToolRegistry,
        gate: Arc<SafetyGate>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            platform,
            registry,
            gate,
            config,
            waiters: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn schemas(&self) -> Vec<ToolSchema> {
        self.registry.list().await
    }

    /// Run one tool call under the safety gate. Never returns an error for
    /// policy outcomes — the model gets a readable result either way.
    pub async fn invoke(
        &self,
        call: &ToolCallRequest,
        reasoning: Option<&str>,
        cancel: CancellationToken,
    ) -> EngineResult<ToolResult> {
        let Some(tier) = self.registry.tier(&call.name).await else {
            return Ok(unknown_tool_result(&call.name));
        };
        match self.gate.evaluate(tier, &call.input) {
            GateDecision::RunNow => Ok(self
                .registry
                .execute(&call.name, call.input.clone(), cancel)
                .await?),
            GateDecision::Forbidden => {
                info!(tool = %call.name, "forbidden tool call refused");
                Ok(forbidden_tool_result(&call.name))
            }
            GateDecision::NeedsApproval => {
                let request = self.open_request(call, reasoning).await?;
                let status = self.wait_for_resolution(&request.id, cancel.clone()).await;
                match status {
                    ToolApprovalStatus::Approved => Ok(self
                        .registry
                        .execute(&call.name, call.input.clone(), cancel)
                        .await?),
                    ToolApprovalStatus::Rejected => {
                        Ok(unapproved_tool_result(&call.name, "rejected by owner"))
                    }
                    _ => Ok(unapproved_tool_result(&call.name, "approval timed out")),
                }
            }
        }
    }

    /// Resolve a gated request from a control callback.
    pub async fn handle_callback(&self, event: &Event) -> EngineResult<CallbackOutcome> {
        let Some(callback) = event.callback.as_ref() else {
            return Ok(CallbackOutcome::Ignored);
        };
        let Some(request_id) = callback.tag.strip_prefix(TOOL_APPROVAL_TAG_PREFIX) else {
            return Ok(CallbackOutcome::Ignored);
        };
        let approved = callback.data.as_deref() != Some("reject");
        let outcome = if approved {
            ToolApprovalStatus::Approved
        } else {
            ToolApprovalStatus::Rejected
        };
        let response = event.author.as_ref().map(|a| format!("resolved by {}", a.id));

        let prior = match self
            .store
            .resolve_tool_approval(request_id, outcome, response.as_deref())
            .await
        {
            Ok(prior) => prior,
            Err(StoreError::StaleGuard(_)) | Err(StoreError::NotFound(_)) => {
                return Ok(CallbackOutcome::Ignored);
            }
            Err(err) => return Err(err.into()),
        };
        if prior != ToolApprovalStatus::Pending {
            return Ok(CallbackOutcome::Ignored);
        }

        self.notify(request_id, outcome).await;
        info!(request = request_id, approved, "tool approval resolved");
        Ok(CallbackOutcome::Resolved {
            approved,
            resumed_as: None,
        })
    }

    /// Timer sweep for requests nobody is waiting on anymore (engine
    /// restart); in-process waiters enforce their own deadline.
    pub async fn expire_due(&self) -> EngineResult<usize> {
        Ok(self.store.expire_due_tool_approvals(Utc::now()).await?)
    }

    async fn open_request(
        &self,
        call: &ToolCallRequest,
        reasoning: Option<&str>,
    ) -> EngineResult<ToolApproval> {
        let now = Utc::now();
        let request = ToolApproval {
            id: uuid::Uuid::new_v4().to_string(),
            tool_name: call.name.clone(),
            input: call.input.clone(),
            reasoning: reasoning.map(ToString::to_string),
            created_at: now,
            expires_at: now
                + ChronoDuration::seconds(self.config.tool_approval_timeout_seconds as i64),
            status: ToolApprovalStatus::Pending,
            response: None,
        };
        self.store.create_tool_approval(&request).await?;

        let (tx, _rx) = watch::channel(None);
        self.waiters.write().await.insert(request.id.clone(), tx);

        if let Some(master_chat) = self.config.master_chat_id.as_deref() {
            let text = format!(
                "Tool `{}` needs your approval.\n\nInput:\n{}\n\nReason: {}",
                request.tool_name,
                serde_json::to_string_pretty(&request.input)
                    .unwrap_or_else(|_| request.input.to_string()),
                request.reasoning.as_deref().unwrap_or("(none given)"),
            );
            let control = ControlSpec {
                label: "✅ Allow".to_string(),
                tag: format!("{TOOL_APPROVAL_TAG_PREFIX}{}", request.id),
            };
            if let Err(err) = self
                .platform
                .send_message_with_control(master_chat, &text, &control)
                .await
            {
                warn!("failed to send tool approval control: {err}");
            }
        } else {
            warn!(
                tool = %request.tool_name,
                "gated tool call has no master chat to ask; it will time out"
            );
        }

        Ok(request)
    }

    async fn wait_for_resolution(
        &self,
        request_id: &str,
        cancel: CancellationToken,
    ) -> ToolApprovalStatus {
        let mut rx = match self.waiters.read().await.get(request_id) {
            Some(tx) => tx.subscribe(),
            None => return ToolApprovalStatus::Expired,
        };
        // A callback may have landed between insert and subscribe.
        let initial_status = *rx.borrow();
        if let Some(status) = initial_status {
            self.waiters.write().await.remove(request_id);
            return status;
        }
        let deadline = Duration::from_secs(self.config.tool_approval_timeout_seconds);

        let resolved = tokio::select! {
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep(deadline) => None,
            changed = rx.changed() => {
                if changed.is_ok() {
                    *rx.borrow()
                } else {
                    None
                }
            }
        };
        self.waiters.write().await.remove(request_id);

        match resolved {
            Some(status) => status,
            None => {
                // Deadline or shutdown: retire the row; a late callback will
                // see StaleGuard and be ignored.
                let _ = self
                    .store
                    .resolve_tool_approval(request_id, ToolApprovalStatus::Expired, None)
                    .await;
                ToolApprovalStatus::Expired
            }
        }
    }

    async fn notify(&self, request_id: &str, status: ToolApprovalStatus) {
        if let Some(tx) = self.waiters.read().await.get(request_id) {
            let _ = tx.send(Some(status));
        }
    }
}

/// Convenience for building a tool-result conversation turn.
pub fn tool_result_turn(call: &ToolCallRequest, result: &ToolResult) -> adjutant_providers::ChatTurn {
    adjutant_providers::ChatTurn::new(
        "tool",
        json!({
            "tool": call.name,
            "call_id": call.id,
            "output": result.output,
            "metadata": result.metadata,
        })
        .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use adjutant_tools::{SafetyPolicy, SafetyTier, Tool};
    use async_trait::async_trait;
    use serde_json::Value;

    struct ProbeTool {
        tier: SafetyTier,
    }

    #[async_trait]
    impl Tool for ProbeTool {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "probe".to_string(),
                description: "Probe".to_string(),
                input_schema: json!({"type":"object"}),
            }
        }

        fn tier(&self) -> SafetyTier {
            self.tier
        }

        async fn execute(&self, _args: Value) -> anyhow::Result<ToolResult> {
            Ok(ToolResult {
                output: "ran".to_string(),
                metadata: json!({}),
            })
        }
    }

    struct NullPlatform;

    #[async_trait]
    impl ChatPlatform for NullPlatform {
        fn name(&self) -> &str {
            "null"
        }
        async fn send_message(
            &self,
            _chat_id: &str,
            _text: &str,
            _reply_to: Option<&str>,
        ) -> anyhow::Result<String> {
            Ok("1".to_string())
        }
        async fn send_message_with_control(
            &self,
            _chat_id: &str,
            _text: &str,
            _control: &ControlSpec,
        ) -> anyhow::Result<String> {
            Ok("1".to_string())
        }
    }

    async fn gateway(tier: SafetyTier, timeout_secs: u64) -> ToolGateway {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let registry = ToolRegistry::new();
        registry.register(Arc::new(ProbeTool { tier })).await;
        let config = EngineConfig {
            tool_approval_timeout_seconds: timeout_secs,
            master_chat_id: Some("1".to_string()),
            ..EngineConfig::default()
        };
        ToolGateway::new(
            store,
            Arc::new(NullPlatform),
            registry,
            Arc::new(SafetyGate::new(SafetyPolicy::default())),
            config,
        )
    }

    fn call() -> ToolCallRequest {
        ToolCallRequest {
            id: "c1".to_string(),
            name: "probe".to_string(),
            input: json!({"target": "prod"}),
        }
    }

    #[tokio::test]
    async fn safe_tool_runs_immediately() {
        let gw = gateway(SafetyTier::Safe, 1).await;
        let result = gw
            .invoke(&call(), None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.output, "ran");
    }

    #[tokio::test]
    async fn forbidden_tool_returns_structured_error() {
        let gw = gateway(SafetyTier::Forbidden, 1).await;
        let result = gw
            .invoke(&call(), None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.metadata["error"], "tool_forbidden");
    }

    #[tokio::test]
    async fn gated_tool_times_out_into_error_result() {
        let gw = gateway(SafetyTier::Gated, 0).await;
        let result = gw
            .invoke(&call(), Some("because"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.metadata["error"], "tool_not_approved");
    }

    #[tokio::test]
    async fn gated_tool_runs_after_callback_approval() {
        let gw = gateway(SafetyTier::Gated, 30).await;
        let gw_resolver = gw.clone();

        let invoke = tokio::spawn({
            let gw = gw.clone();
            async move { gw.invoke(&call(), None, CancellationToken::new()).await }
        });

        // Find the pending request and approve it via the callback path.
        let request_id = loop {
            let waiters = gw_resolver.waiters.read().await;
            if let Some(id) = waiters.keys().next() {
                break id.clone();
            }
            drop(waiters);
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        let event = Event {
            kind: adjutant_types::EventKind::Callback,
            platform: "null".to_string(),
            chat: adjutant_types::ChatInfo {
                id: "1".to_string(),
                chat_type: "private".to_string(),
                title: None,
            },
            author: Some(adjutant_types::AuthorInfo {
                id: "owner".to_string(),
                username: None,
                display_name: None,
            }),
            message: None,
            callback: Some(adjutant_types::CallbackInfo {
                tag: format!("{TOOL_APPROVAL_TAG_PREFIX}{request_id}"),
                data: None,
            }),
            signature: None,
            raw: None,
        };
        let outcome = gw_resolver.handle_callback(&event).await.unwrap();
        assert!(matches!(outcome, CallbackOutcome::Resolved { approved: true, .. }));

        let result = invoke.await.unwrap().unwrap();
        assert_eq!(result.output, "ran");
    }
}
