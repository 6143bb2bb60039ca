// Engine wiring: builds the components around one store and runs the
// background loops (workers, reaper, sweeps, proactive cycle) under a single
// cancellation token.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use adjutant_channels::ChatPlatform;
use adjutant_providers::{Classifier, Executor};
use adjutant_store::Store;
use adjutant_tools::{SafetyGate, SafetyPolicy, ToolRegistry};
use adjutant_types::{EngineConfig, Event};

use crate::approvals::ApprovalCoordinator;
use crate::deploy::{DeploymentController, HealthProbe};
use crate::error::EngineResult;
use crate::ingest::{IngestNormalizer, IngestOutcome};
use crate::ledger::{today_utc, PricingTable, TokenLedger};
use crate::proactive::ProactiveScheduler;
use crate::tool_gateway::ToolGateway;
use crate::workers::WorkerPool;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

pub struct Engine {
    pub store: Arc<Store>,
    pub ingest: IngestNormalizer,
    pub approvals: ApprovalCoordinator,
    pub tools: ToolGateway,
    pub workers: WorkerPool,
    pub proactive: ProactiveScheduler,
    pub deployments: DeploymentController,
    pub ledger: TokenLedger,
    pub config: EngineConfig,
    cancel: CancellationToken,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        platform: Arc<dyn ChatPlatform>,
        classifier: Arc<dyn Classifier>,
        executor: Arc<dyn Executor>,
        registry: ToolRegistry,
        safety_policy: SafetyPolicy,
        pricing: PricingTable,
        probe: Arc<dyn HealthProbe>,
        config: EngineConfig,
    ) -> Self {
        let gate = Arc::new(SafetyGate::new(safety_policy));
        let ledger = TokenLedger::new(
            store.clone(),
            pricing,
            config.proactive_daily_token_limit,
            config.reactive_token_warn_threshold,
        );
        let approvals = ApprovalCoordinator::new(store.clone(), platform.clone(), config.clone());
        let tools = ToolGateway::new(
            store.clone(),
            platform.clone(),
            registry,
            gate,
            config.clone(),
        );
        let ingest = IngestNormalizer::new(
            store.clone(),
            approvals.clone(),
            tools.clone(),
            config.clone(),
        );
        let workers = WorkerPool::new(
            store.clone(),
            platform.clone(),
            classifier,
            executor.clone(),
            tools.clone(),
            approvals.clone(),
            ledger.clone(),
            config.clone(),
        );
        let proactive = ProactiveScheduler::new(
            store.clone(),
            platform,
            executor,
            tools.clone(),
            ledger.clone(),
            config.clone(),
        );
        let deployments = DeploymentController::new(store.clone(), probe, config.clone());

        Self {
            store,
            ingest,
            approvals,
            tools,
            workers,
            proactive,
            deployments,
            ledger,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask every loop to stop; each reacts within one poll interval.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Single entry point for platform events.
    pub async fn ingest_event(&self, event: &Event) -> EngineResult<IngestOutcome> {
        self.ingest.ingest(event).await
    }

    /// Start the worker pool, reaper, sweeps, heartbeat, and the proactive
    /// loop. The returned set finishes once shutdown is requested.
    pub fn spawn_background(&self) -> JoinSet<()> {
        let mut set = JoinSet::new();

        for index in 0..self.config.reactive_workers.max(1) {
            let pool = self.workers.clone();
            let cancel = self.cancel.clone();
            set.spawn(async move {
                pool.run_worker(format!("worker-{}", index + 1), cancel).await;
            });
        }

        {
            let pool = self.workers.clone();
            let cancel = self.cancel.clone();
            set.spawn(async move { pool.run_reaper(cancel).await });
        }

        {
            let approvals = self.approvals.clone();
            let tools = self.tools.clone();
            let cancel = self.cancel.clone();
            set.spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                    }
                    if let Err(err) = approvals.expire_due().await {
                        warn!("approval expiry sweep failed: {err}");
                    }
                    if let Err(err) = tools.expire_due().await {
                        warn!("tool approval expiry sweep failed: {err}");
                    }
                }
            });
        }

        {
            let scheduler = self.proactive.clone();
            let cancel = self.cancel.clone();
            set.spawn(async move { scheduler.run(cancel).await });
        }

        {
            let store = self.store.clone();
            let ledger = self.ledger.clone();
            let workers = self.config.reactive_workers;
            let cancel = self.cancel.clone();
            set.spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
                    }
                    let depth = store.queued_depth().await.unwrap_or(-1);
                    match ledger.budget_status(&today_utc()).await {
                        Ok(budget) => info!(
                            workers,
                            queue_depth = depth,
                            budget_used = budget.used,
                            budget_remaining = budget.remaining,
                            "heartbeat"
                        ),
                        Err(err) => warn!("heartbeat budget query failed: {err}"),
                    }
                }
            });
        }

        {
            let store = self.store.clone();
            let retention_days = self.config.artifact_retention_days;
            let cancel = self.cancel.clone();
            set.spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(PRUNE_INTERVAL) => {}
                    }
                    let cutoff = Utc::now() - ChronoDuration::days(retention_days);
                    match store.prune_artifacts(cutoff).await {
                        Ok(0) => {}
                        Ok(pruned) => info!(pruned, "pruned old artifact blobs"),
                        Err(err) => warn!("artifact pruning failed: {err}"),
                    }
                }
            });
        }

        set
    }
}
