//! Tool registry and safety gate.
//!
//! Every tool is listed explicitly with a name, an input schema, and a safety
//! tier. `safe` tools run immediately, `gated` tools pass through the
//! auto-approval predicate or go to the owner for confirmation, and
//! `forbidden` tools never run — the gate hands the model a structured error
//! it can read.

pub mod safety;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use adjutant_types::{ToolResult, ToolSchema};

pub use safety::{GateDecision, SafetyGate, SafetyPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyTier {
    Safe,
    Gated,
    Forbidden,
}

impl SafetyTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyTier::Safe => "safe",
            SafetyTier::Gated => "gated",
            SafetyTier::Forbidden => "forbidden",
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;

    fn tier(&self) -> SafetyTier {
        SafetyTier::Safe
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult>;

    async fn execute_with_cancel(
        &self,
        args: Value,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ToolResult> {
        self.execute(args).await
    }
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.schema().name;
        self.tools.write().await.insert(name, tool);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    /// Schemas of all registered tools, sorted by name. Forbidden tools are
    /// listed too so the model sees a stable catalog; the gate stops them at
    /// call time.
    pub async fn list(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .read()
            .await
            .values()
            .map(|t| t.schema())
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn tier(&self, name: &str) -> Option<SafetyTier> {
        self.tools.read().await.get(name).map(|t| t.tier())
    }

    pub async fn execute(
        &self,
        name: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<ToolResult> {
        let tool = { self.tools.read().await.get(name).cloned() };
        let Some(tool) = tool else {
            return Ok(unknown_tool_result(name));
        };
        tool.execute_with_cancel(args, cancel).await
    }
}

pub fn unknown_tool_result(name: &str) -> ToolResult {
    ToolResult {
        output: format!("Unknown tool: {name}"),
        metadata: json!({ "error": "unknown_tool" }),
    }
}

/// Structured error returned inline when a forbidden tool is called.
pub fn forbidden_tool_result(name: &str) -> ToolResult {
    ToolResult {
        output: format!("Tool `{name}` is forbidden and will never execute."),
        metadata: json!({ "error": "tool_forbidden", "tool": name }),
    }
}

/// Inline error for a gated call whose approval was rejected or timed out.
pub fn unapproved_tool_result(name: &str, reason: &str) -> ToolResult {
    ToolResult {
        output: format!("Tool `{name}` was not approved: {reason}."),
        metadata: json!({ "error": "tool_not_approved", "tool": name, "reason": reason }),
    }
}

/// Shell tool, gated behind the safety predicate: read-only commands run
/// immediately, anything else needs the owner's confirmation.
pub struct ShellTool;

#[async_trait]
impl Tool for ShellTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "shell".to_string(),
            description: "Run a shell command on the host".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": { "command": { "type": "string" } },
                "required": ["command"]
            }),
        }
    }

    fn tier(&self) -> SafetyTier {
        SafetyTier::Gated
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        self.execute_with_cancel(args, CancellationToken::new())
            .await
    }

    async fn execute_with_cancel(
        &self,
        args: Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<ToolResult> {
        let cmd = args["command"].as_str().unwrap_or("");
        let mut command = tokio::process::Command::new("sh");
        command.args(["-c", cmd]);
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());
        command.kill_on_drop(true);

        let child = command.spawn()?;
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Ok(ToolResult {
                    output: "command cancelled".to_string(),
                    metadata: json!({ "cancelled": true }),
                });
            }
            result = child.wait_with_output() => result?,
        };

        let stdout: String = String::from_utf8_lossy(&output.stdout)
            .chars()
            .take(20_000)
            .collect();
        Ok(ToolResult {
            output: stdout,
            metadata: json!({
                "exit_code": output.status.code(),
                "stderr": String::from_utf8_lossy(&output.stderr)
                    .chars()
                    .take(4_000)
                    .collect::<String>(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "echo".to_string(),
                description: "Echo input back".to_string(),
                input_schema: json!({"type":"object","properties":{"text":{"type":"string"}}}),
            }
        }

        async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
            Ok(ToolResult {
                output: args["text"].as_str().unwrap_or("").to_string(),
                metadata: json!({}),
            })
        }
    }

    struct SealedTool;

    #[async_trait]
    impl Tool for SealedTool {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "sealed".to_string(),
                description: "Never runs".to_string(),
                input_schema: json!({"type":"object"}),
            }
        }

        fn tier(&self) -> SafetyTier {
            SafetyTier::Forbidden
        }

        async fn execute(&self, _args: Value) -> anyhow::Result<ToolResult> {
            anyhow::bail!("must never be called")
        }
    }

    #[tokio::test]
    async fn registry_lists_sorted_schemas() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(SealedTool)).await;
        registry.register(Arc::new(EchoTool)).await;
        let names: Vec<String> = registry.list().await.into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["echo".to_string(), "sealed".to_string()]);
    }

    #[tokio::test]
    async fn registry_executes_known_tool() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await;
        let result = registry
            .execute("echo", json!({"text": "hi"}), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.output, "hi");
    }

    #[tokio::test]
    async fn unknown_tool_returns_structured_error() {
        let registry = ToolRegistry::new();
        let result = registry
            .execute("nope", json!({}), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.metadata["error"], "unknown_tool");
    }

    #[tokio::test]
    async fn shell_tool_captures_stdout_and_exit_code() {
        let result = ShellTool
            .execute(json!({"command": "echo $((40+2))"}))
            .await
            .unwrap();
        assert!(result.output.contains("42"));
        assert_eq!(result.metadata["exit_code"], 0);
    }
}
