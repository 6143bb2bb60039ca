// Engine configuration. A plain value passed in at construction; nothing in
// the core reads configuration from global state.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// K messages loaded as context for classify/execute.
    pub context_window: usize,
    /// T_approval: how long a confirmation control stays actionable.
    pub approval_timeout_seconds: u64,
    /// T_tool: how long a gated tool call waits for confirmation.
    pub tool_approval_timeout_seconds: u64,
    /// D_c: classifier call deadline.
    pub classifier_deadline_seconds: u64,
    /// D_e: executor call deadline.
    pub executor_deadline_seconds: u64,
    /// Store poll cadence for idle workers.
    pub worker_poll_interval_ms: u64,
    /// Reactive worker count.
    pub reactive_workers: usize,
    /// Daily cap on proactive-scope tokens.
    pub proactive_daily_token_limit: i64,
    /// Per-call warning threshold for reactive token usage.
    pub reactive_token_warn_threshold: i64,
    /// Bracket for the adaptive proactive sleep.
    pub proactive_min_interval_seconds: u64,
    pub proactive_max_interval_seconds: u64,
    /// Requeue ceiling before a job is marked failed.
    pub max_job_attempts: i64,
    /// Verify window for deployment health probes.
    pub deployment_health_timeout_seconds: u64,
    /// Grace added to D_e before a running job counts as crashed.
    pub reaper_grace_seconds: u64,
    /// Bounded iterations of the proactive tool-use loop.
    pub proactive_tool_iterations: usize,
    /// Days after which done-artifact blobs may be pruned.
    pub artifact_retention_days: i64,
    /// Shared secret inbound events must carry.
    pub platform_secret: String,
    /// Chat the agent treats as its owner: tool-approval controls and
    /// decomposition notices go here.
    pub master_chat_id: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            context_window: 30,
            approval_timeout_seconds: 3600,
            tool_approval_timeout_seconds: 3600,
            classifier_deadline_seconds: 30,
            executor_deadline_seconds: 120,
            worker_poll_interval_ms: 100,
            reactive_workers: 2,
            proactive_daily_token_limit: 7_000_000,
            reactive_token_warn_threshold: 100_000,
            proactive_min_interval_seconds: 60,
            proactive_max_interval_seconds: 3600,
            max_job_attempts: 3,
            deployment_health_timeout_seconds: 60,
            reaper_grace_seconds: 30,
            proactive_tool_iterations: 5,
            artifact_retention_days: 30,
            platform_secret: String::new(),
            master_chat_id: None,
        }
    }
}
