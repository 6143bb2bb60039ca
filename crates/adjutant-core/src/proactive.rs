// Proactive scheduler: the budget-aware autonomous loop. A singleton; it
// never runs two executor calls at once and contends with the reactive side
// only through the store.
//
// Each cycle sleeps according to the day's proactive token usage, then asks
// the executor for the next step on the highest-priority task (master-sourced
// work always first), runs tools through the safety gate, and writes a
// summary into agent memory.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use adjutant_channels::ChatPlatform;
use adjutant_providers::{ChatTurn, Executor};
use adjutant_store::Store;
use adjutant_types::{
    AgentTask, EngineConfig, LedgerScope, TaskSource, TaskStatus,
};

use crate::error::EngineResult;
use crate::ledger::{today_utc, BudgetStatus, TokenLedger};
use crate::tool_gateway::{tool_result_turn, ToolGateway};

#[derive(Clone)]
pub struct ProactiveScheduler {
    store: Arc<Store>,
    platform: Arc<dyn ChatPlatform>,
    executor: Arc<dyn Executor>,
    tools: ToolGateway,
    ledger: TokenLedger,
    config: EngineConfig,
}

/// Sleep chosen for a usage ratio. At or over budget the loop parks until
/// the next UTC midnight.
pub fn sleep_for_usage(ratio: f64, now: DateTime<Utc>) -> Duration {
    if ratio >= 1.0 {
        until_next_utc_midnight(now)
    } else if ratio >= 0.75 {
        Duration::from_secs(3600)
    } else if ratio >= 0.5 {
        Duration::from_secs(900)
    } else if ratio >= 0.25 {
        Duration::from_secs(300)
    } else {
        Duration::from_secs(60)
    }
}

pub fn until_next_utc_midnight(now: DateTime<Utc>) -> Duration {
    let tomorrow = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .unwrap_or_else(|| now.date_naive());
    let midnight = tomorrow
        .and_hms_opt(0, 0, 0)
        .map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
        .unwrap_or(now);
    (midnight - now).to_std().unwrap_or(Duration::from_secs(60))
}

/// What the executor asked for at the end of a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleAction {
    Decompose(Vec<SubtaskSpec>),
    Complete(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubtaskSpec {
    pub title: String,
    #[serde(default)]
    pub detail: Option<String>,
}

/// A structured `{"decompose": true, "subtasks": [...]}` reply splits the
/// task; anything else counts as completing it.
pub fn parse_cycle_action(text: &str) -> CycleAction {
    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        if value.get("decompose").and_then(|v| v.as_bool()) == Some(true) {
            if let Some(subtasks) = value.get("subtasks") {
                if let Ok(specs) = serde_json::from_value::<Vec<SubtaskSpec>>(subtasks.clone()) {
                    if !specs.is_empty() {
                        return CycleAction::Decompose(specs);
                    }
                }
            }
        }
        if let Some(summary) = value.get("summary").and_then(|v| v.as_str()) {
            return CycleAction::Complete(summary.to_string());
        }
    }
    CycleAction::Complete(text.trim().to_string())
}

impl ProactiveScheduler {
    pub fn new(
        store: Arc<Store>,
        platform: Arc<dyn ChatPlatform>,
        executor: Arc<dyn Executor>,
        tools: ToolGateway,
        ledger: TokenLedger,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            platform,
            executor,
            tools,
            ledger,
            config,
        }
    }

    /// The loop. Sleeps are cancellable; shutdown takes effect at the next
    /// suspension point.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("proactive scheduler started");
        loop {
            let status = match self.ledger.budget_status(&today_utc()).await {
                Ok(status) => status,
                Err(err) => {
                    warn!("budget query failed: {err}");
                    if sleep_or_cancel(Duration::from_secs(60), &cancel).await {
                        break;
                    }
                    continue;
                }
            };

            let sleep = self.clamped_sleep(status.usage_ratio);
            if sleep_or_cancel(sleep, &cancel).await {
                break;
            }

            // Budget may have moved while sleeping; recompute before acting.
            let status = match self.ledger.budget_status(&today_utc()).await {
                Ok(status) => status,
                Err(err) => {
                    warn!("budget query failed: {err}");
                    continue;
                }
            };
            if status.usage_ratio >= 1.0 {
                continue;
            }

            if let Err(err) = self.run_cycle(&cancel, status).await {
                warn!("proactive cycle failed: {err}");
            }
        }
        info!("proactive scheduler stopped");
    }

    fn clamped_sleep(&self, ratio: f64) -> Duration {
        let sleep = sleep_for_usage(ratio, Utc::now());
        if ratio >= 1.0 {
            // Midnight parking is exempt from the bracket.
            return sleep;
        }
        let min = Duration::from_secs(self.config.proactive_min_interval_seconds);
        let max = Duration::from_secs(self.config.proactive_max_interval_seconds);
        sleep.clamp(min, max)
    }

    /// One autonomous step: pick the next task, run the bounded tool loop,
    /// apply the outcome, and remember what happened.
    pub async fn run_cycle(
        &self,
        cancel: &CancellationToken,
        status: BudgetStatus,
    ) -> EngineResult<()> {
        let task = self.store.next_pending_task().await?;
        if let Some(task) = &task {
            self.store
                .set_task_status(&task.id, TaskStatus::Pending, TaskStatus::InProgress)
                .await?;
        }

        let turns = self.cycle_turns(task.as_ref(), status).await?;
        let reply = self.tool_loop(turns, cancel).await?;
        let action = parse_cycle_action(&reply);

        let summary = match (&action, &task) {
            (CycleAction::Decompose(specs), Some(task)) => {
                self.decompose(task, specs).await?;
                format!("split task `{}` into {} subtasks", task.title, specs.len())
            }
            (CycleAction::Decompose(_), None) => {
                // Nothing to split without a task; keep the text as a note.
                reply.clone()
            }
            (CycleAction::Complete(summary), Some(task)) => {
                let completed_parents = self.store.complete_task(&task.id, Utc::now()).await?;
                if !completed_parents.is_empty() {
                    info!(parents = completed_parents.len(), "auto-completed parent tasks");
                }
                format!("completed `{}`: {summary}", task.title)
            }
            (CycleAction::Complete(summary), None) => summary.clone(),
        };

        self.store
            .upsert_memory(
                "last_cycle",
                &summary,
                Some("cycle"),
                Some(&json!({ "budget_used": status.used })),
                Utc::now(),
            )
            .await?;
        Ok(())
    }

    async fn cycle_turns(
        &self,
        task: Option<&AgentTask>,
        status: BudgetStatus,
    ) -> EngineResult<Vec<ChatTurn>> {
        let goals = self.store.active_goals().await?;
        let backlog = self.store.pending_tasks(10).await?;
        let last_cycle = self.store.get_memory("last_cycle").await?;
        let focus = self.store.get_memory("current_focus").await?;

        let mut system = String::from(
            "You are the autonomous loop of a personal assistant. Work one step at a time and keep results concise.\n",
        );
        system.push_str(&format!(
            "Remaining proactive budget today: {} tokens ({}% used).\n",
            status.remaining,
            (status.usage_ratio * 100.0).round() as i64,
        ));
        if let Some(focus) = focus {
            system.push_str(&format!("Current focus: {}\n", focus.value));
        }
        if let Some(last) = last_cycle {
            system.push_str(&format!("Last cycle: {}\n", last.value));
        }
        if !goals.is_empty() {
            system.push_str("Active goals:\n");
            for goal in &goals {
                system.push_str(&format!("- {}\n", goal.title));
            }
        }
        if !backlog.is_empty() {
            system.push_str("Backlog (master tasks first):\n");
            for item in &backlog {
                system.push_str(&format!(
                    "- [{}] {} (priority {})\n",
                    item.source.as_str(),
                    item.title,
                    item.priority,
                ));
            }
        }

        let instruction = match task {
            Some(task) => format!(
                "Work on this task now: {}{}\n\nIf it is too large for one step, reply with JSON \
                 {{\"decompose\": true, \"subtasks\": [{{\"title\": \"...\", \"detail\": \"...\"}}]}}. \
                 When the task is finished, reply with JSON {{\"complete\": true, \"summary\": \"...\"}}.",
                task.title,
                task.detail
                    .as_deref()
                    .map(|d| format!(" — {d}"))
                    .unwrap_or_default(),
            ),
            None => "No pending tasks. Review the goals and do one small useful step, then \
                     summarize it in a sentence."
                .to_string(),
        };

        Ok(vec![
            ChatTurn::new("system", system),
            ChatTurn::new("user", instruction),
        ])
    }

    /// Bounded tool-use loop; every call is metered into the proactive
    /// ledger scope. One executor call in flight at a time.
    async fn tool_loop(
        &self,
        mut turns: Vec<ChatTurn>,
        cancel: &CancellationToken,
    ) -> EngineResult<String> {
        let tools = self.tools.schemas().await;
        let deadline = Duration::from_secs(self.config.executor_deadline_seconds);

        for _ in 0..self.config.proactive_tool_iterations {
            let turn = self.executor.step(&turns, &tools, deadline).await?;
            self.ledger
                .record(
                    LedgerScope::Proactive,
                    self.executor.provider(),
                    self.executor.model(),
                    turn.usage,
                    Some(json!({ "call": "proactive_cycle" })),
                )
                .await?;

            if let Some(text) = turn.text.as_deref() {
                turns.push(ChatTurn::new("assistant", text));
            }
            if turn.is_final() {
                return Ok(turn.text.unwrap_or_default());
            }
            for call in &turn.tool_calls {
                let result = self
                    .tools
                    .invoke(call, Some("autonomous cycle"), cancel.clone())
                    .await?;
                turns.push(tool_result_turn(call, &result));
            }
        }
        Ok("Stopped after the bounded number of tool steps.".to_string())
    }

    /// Create child tasks in order; the parent goes back to pending and the
    /// master is told when their task was split.
    async fn decompose(&self, parent: &AgentTask, specs: &[SubtaskSpec]) -> EngineResult<()> {
        let now = Utc::now();
        let children: Vec<AgentTask> = specs
            .iter()
            .enumerate()
            .map(|(index, spec)| AgentTask {
                id: uuid::Uuid::new_v4().to_string(),
                parent_id: Some(parent.id.clone()),
                goal_id: parent.goal_id.clone(),
                title: spec.title.clone(),
                detail: spec.detail.clone(),
                source: parent.source,
                priority: parent.priority,
                order_index: index as i64,
                status: TaskStatus::Pending,
                created_at: now,
                completed_at: None,
            })
            .collect();
        self.store.insert_subtasks(&children).await?;
        self.store
            .set_task_status(&parent.id, TaskStatus::InProgress, TaskStatus::Pending)
            .await?;

        if parent.source == TaskSource::Master {
            if let Some(master_chat) = self.config.master_chat_id.as_deref() {
                let lines: Vec<String> = specs
                    .iter()
                    .map(|spec| format!("• {}", spec.title))
                    .collect();
                let _ = self
                    .platform
                    .send_message(
                        master_chat,
                        &format!(
                            "I split your task \"{}\" into {} steps:\n{}",
                            parent.title,
                            specs.len(),
                            lines.join("\n"),
                        ),
                        None,
                    )
                    .await;
            }
        }
        Ok(())
    }
}

/// True when cancelled.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_table_matches_usage_bands() {
        let now = Utc::now();
        assert_eq!(sleep_for_usage(0.0, now), Duration::from_secs(60));
        assert_eq!(sleep_for_usage(0.24, now), Duration::from_secs(60));
        assert_eq!(sleep_for_usage(0.25, now), Duration::from_secs(300));
        assert_eq!(sleep_for_usage(0.49, now), Duration::from_secs(300));
        assert_eq!(sleep_for_usage(0.5, now), Duration::from_secs(900));
        assert_eq!(sleep_for_usage(0.74, now), Duration::from_secs(900));
        assert_eq!(sleep_for_usage(0.75, now), Duration::from_secs(3600));
        assert_eq!(sleep_for_usage(0.99, now), Duration::from_secs(3600));
    }

    #[test]
    fn over_budget_sleeps_until_utc_midnight() {
        let now = Utc::now();
        let sleep = sleep_for_usage(1.0, now);
        assert!(sleep <= Duration::from_secs(24 * 3600));
        assert!(sleep > Duration::from_secs(0));
        // The wakeup lands on the next midnight, not some fixed interval.
        let wake = now + chrono::Duration::from_std(sleep).unwrap();
        assert_eq!(wake.format("%H:%M").to_string(), "00:00");
    }

    #[test]
    fn decompose_reply_parses_subtasks() {
        let reply = r#"{"decompose": true, "subtasks": [
            {"title": "research options", "detail": "compare a and b"},
            {"title": "write summary"}
        ]}"#;
        match parse_cycle_action(reply) {
            CycleAction::Decompose(specs) => {
                assert_eq!(specs.len(), 2);
                assert_eq!(specs[0].title, "research options");
                assert_eq!(specs[1].detail, None);
            }
            other => panic!("expected decompose, got {other:?}"),
        }
    }

    #[test]
    fn plain_text_reply_counts_as_completion() {
        assert_eq!(
            parse_cycle_action("checked the feeds, nothing new"),
            CycleAction::Complete("checked the feeds, nothing new".to_string())
        );
    }

    #[test]
    fn structured_completion_extracts_summary() {
        assert_eq!(
            parse_cycle_action(r#"{"complete": true, "summary": "rotated the logs"}"#),
            CycleAction::Complete("rotated the logs".to_string())
        );
    }
}
