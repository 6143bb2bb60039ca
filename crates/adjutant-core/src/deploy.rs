// Deployment controller: verify-then-promote with automatic rollback.
//
// building → testing → deploying → healthy on success; any step may fail;
// a health-probe failure after `deploying` rolls back to the most recent
// healthy deployment.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use adjutant_store::{Store, StoreError};
use adjutant_types::{Deployment, DeploymentStatus, EngineConfig};

use crate::error::{EngineError, EngineResult};

/// Post-deploy health check. The engine wires a real probe; tests script it.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, deployment: &Deployment, timeout: Duration) -> anyhow::Result<()>;
}

/// Probe that always reports healthy; the default when no probe endpoint is
/// configured.
pub struct AlwaysHealthy;

#[async_trait]
impl HealthProbe for AlwaysHealthy {
    async fn check(&self, _deployment: &Deployment, _timeout: Duration) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct DeploymentController {
    store: Arc<Store>,
    probe: Arc<dyn HealthProbe>,
    config: EngineConfig,
}

impl DeploymentController {
    pub fn new(store: Arc<Store>, probe: Arc<dyn HealthProbe>, config: EngineConfig) -> Self {
        Self {
            store,
            probe,
            config,
        }
    }

    /// Open a deployment in `building`. Rejected while another one is in
    /// flight.
    pub async fn start(
        &self,
        commit_id: &str,
        branch: &str,
        trigger: &str,
    ) -> EngineResult<Deployment> {
        let deployment = Deployment {
            id: uuid::Uuid::new_v4().to_string(),
            commit_id: commit_id.to_string(),
            branch: branch.to_string(),
            status: DeploymentStatus::Building,
            started_at: Utc::now(),
            finished_at: None,
            report: Some(json!({ "trigger": trigger })),
            rollback_reason: None,
        };
        self.store.create_deployment(&deployment).await?;
        info!(deployment = %deployment.id, commit = commit_id, "deployment started");
        Ok(deployment)
    }

    /// Guarded transition to the next pipeline step or to `failed`.
    pub async fn advance(
        &self,
        deployment_id: &str,
        next: DeploymentStatus,
        report_delta: Option<Value>,
    ) -> EngineResult<Deployment> {
        let current = self.store.get_deployment(deployment_id).await?;
        let legal = next == DeploymentStatus::Failed
            || current.status.next_forward() == Some(next);
        if !legal {
            return Err(EngineError::Store(StoreError::Conflict(format!(
                "illegal deployment transition {} -> {}",
                current.status.as_str(),
                next.as_str()
            ))));
        }
        self.store
            .advance_deployment(
                deployment_id,
                current.status,
                next,
                report_delta.as_ref(),
                None,
                Utc::now(),
            )
            .await?;
        Ok(self.store.get_deployment(deployment_id).await?)
    }

    /// Run the health probe for a deployment sitting in `deploying`. Success
    /// promotes it to `healthy`; failure rolls back.
    pub async fn verify(&self, deployment_id: &str) -> EngineResult<Deployment> {
        let deployment = self.store.get_deployment(deployment_id).await?;
        if deployment.status != DeploymentStatus::Deploying {
            return Err(EngineError::Store(StoreError::StaleGuard(format!(
                "deployment {deployment_id} is not deploying"
            ))));
        }
        let timeout = Duration::from_secs(self.config.deployment_health_timeout_seconds);
        match self.probe.check(&deployment, timeout).await {
            Ok(()) => {
                self.store
                    .advance_deployment(
                        deployment_id,
                        DeploymentStatus::Deploying,
                        DeploymentStatus::Healthy,
                        Some(&json!({ "verify": "ok" })),
                        None,
                        Utc::now(),
                    )
                    .await?;
                info!(deployment = %deployment_id, "deployment healthy");
                Ok(self.store.get_deployment(deployment_id).await?)
            }
            Err(err) => self.rollback(deployment_id, &err.to_string()).await,
        }
    }

    /// Roll a failed deployment back to the previous healthy snapshot.
    /// `latest_healthy()` is untouched by the rollback itself.
    pub async fn rollback(&self, deployment_id: &str, reason: &str) -> EngineResult<Deployment> {
        let target = self.store.latest_healthy().await?;
        let delta = json!({
            "verify": "failed",
            "rollback_target": target.as_ref().map(|d| d.commit_id.clone()),
        });
        self.store
            .advance_deployment(
                deployment_id,
                DeploymentStatus::Deploying,
                DeploymentStatus::RolledBack,
                Some(&delta),
                Some(reason),
                Utc::now(),
            )
            .await?;
        warn!(deployment = %deployment_id, reason, "deployment rolled back");
        Ok(self.store.get_deployment(deployment_id).await?)
    }

    pub async fn latest_healthy(&self) -> EngineResult<Option<Deployment>> {
        Ok(self.store.latest_healthy().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingProbe;

    #[async_trait]
    impl HealthProbe for FailingProbe {
        async fn check(&self, _deployment: &Deployment, _timeout: Duration) -> anyhow::Result<()> {
            anyhow::bail!("health endpoint returned 503")
        }
    }

    async fn controller(probe: Arc<dyn HealthProbe>) -> DeploymentController {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        DeploymentController::new(store, probe, EngineConfig::default())
    }

    async fn drive_to_deploying(controller: &DeploymentController, commit: &str) -> Deployment {
        let deployment = controller.start(commit, "main", "push").await.unwrap();
        controller
            .advance(&deployment.id, DeploymentStatus::Testing, None)
            .await
            .unwrap();
        controller
            .advance(&deployment.id, DeploymentStatus::Deploying, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn happy_path_reaches_healthy() {
        let controller = controller(Arc::new(AlwaysHealthy)).await;
        let deployment = drive_to_deploying(&controller, "abc123").await;
        let verified = controller.verify(&deployment.id).await.unwrap();
        assert_eq!(verified.status, DeploymentStatus::Healthy);
        assert_eq!(
            controller.latest_healthy().await.unwrap().unwrap().id,
            deployment.id
        );
    }

    #[tokio::test]
    async fn failed_verify_rolls_back_and_keeps_previous_healthy() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let good = DeploymentController::new(store.clone(), Arc::new(AlwaysHealthy), EngineConfig::default());
        let baseline = drive_to_deploying(&good, "aaa111").await;
        good.verify(&baseline.id).await.unwrap();

        let bad = DeploymentController::new(store, Arc::new(FailingProbe), EngineConfig::default());
        let doomed = drive_to_deploying(&bad, "abc123").await;
        let rolled = bad.verify(&doomed.id).await.unwrap();

        assert_eq!(rolled.status, DeploymentStatus::RolledBack);
        assert_eq!(
            rolled.rollback_reason.as_deref(),
            Some("health endpoint returned 503")
        );
        let latest = bad.latest_healthy().await.unwrap().unwrap();
        assert_eq!(latest.id, baseline.id);
    }

    #[tokio::test]
    async fn skipping_a_step_is_rejected() {
        let controller = controller(Arc::new(AlwaysHealthy)).await;
        let deployment = controller.start("abc123", "main", "push").await.unwrap();
        let err = controller
            .advance(&deployment.id, DeploymentStatus::Deploying, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn any_step_may_fail() {
        let controller = controller(Arc::new(AlwaysHealthy)).await;
        let deployment = controller.start("abc123", "main", "push").await.unwrap();
        let failed = controller
            .advance(
                &deployment.id,
                DeploymentStatus::Failed,
                Some(json!({ "build": "compile error" })),
            )
            .await
            .unwrap();
        assert_eq!(failed.status, DeploymentStatus::Failed);
        assert!(failed.finished_at.is_some());
    }
}
