//! Rollout engine: assembles controller, runner, and work queue.
//!
//! The engine owns no global state: everything it needs is handed to
//! [`RolloutEngine::new`], and nothing runs until [`RolloutEngine::start`].

use std::sync::Arc;

use tracing::{debug, info};

use fleetgrid_state::{DeploymentProgress, DeploymentStatus, ExecutionResult, StateStore};

use crate::channel::{CommandChannel, MaintenanceGate, PauseNotifier};
use crate::config::EngineConfig;
use crate::controller::DeploymentController;
use crate::error::{RolloutError, RolloutResult};
use crate::executor::PayloadExecutor;
use crate::queue::{Job, JobFuture, JobHandler, JobKind, LocalQueue};
use crate::runner::{DeviceRunner, Recovered};

/// Routes queue jobs to the controller or the runner.
struct JobRouter {
    controller: Arc<DeploymentController>,
    runner: DeviceRunner,
}

impl JobHandler for JobRouter {
    fn handle<'a>(&'a self, job: &'a Job) -> JobFuture<'a> {
        Box::pin(async move {
            match &job.kind {
                JobKind::Admit {
                    deployment_id,
                    follow_up,
                } => {
                    let outcome = if *follow_up {
                        self.controller.admit_follow_up(deployment_id).await?
                    } else {
                        self.controller.admit_next_batch(deployment_id).await?
                    };
                    debug!(deployment = %deployment_id, follow_up, ?outcome, "admission pass done");
                }
                JobKind::RunDevice { key, attempt } => {
                    let outcome = self.runner.run(key, *attempt).await?;
                    debug!(device = %key, attempt, ?outcome, "device pass done");
                }
            }
            Ok(())
        })
    }
}

pub struct RolloutEngine {
    store: StateStore,
    queue: LocalQueue,
    controller: Arc<DeploymentController>,
    router: Arc<JobRouter>,
}

impl RolloutEngine {
    /// Build an engine. Fails only on an invalid config.
    pub fn new(
        config: EngineConfig,
        store: StateStore,
        channel: Arc<dyn CommandChannel>,
        gate: Arc<dyn MaintenanceGate>,
        notifier: Arc<dyn PauseNotifier>,
    ) -> RolloutResult<Self> {
        config.validate()?;

        let queue = LocalQueue::new(config.queue.clone());
        let controller = Arc::new(DeploymentController::new(
            store.clone(),
            Arc::new(queue.clone()),
            gate.clone(),
            notifier,
            config.admission.clone(),
        ));
        let runner = DeviceRunner::new(
            store.clone(),
            Arc::new(queue.clone()),
            gate,
            PayloadExecutor::new(channel, config.executor.clone()),
            controller.clone(),
            config.admission.maintenance_wait(),
        );

        Ok(Self {
            store,
            queue,
            router: Arc::new(JobRouter {
                controller: controller.clone(),
                runner,
            }),
            controller,
        })
    }

    /// Start processing jobs. Must be called inside a tokio runtime.
    ///
    /// Work a previous run left behind is re-issued from the store before
    /// returning: claimed device rows get their jobs again, rows caught
    /// `running` are settled as interrupted attempts, and running
    /// deployments get a fresh admission pass. Calling `start` on an
    /// engine that is already running does nothing.
    pub async fn start(&self) -> RolloutResult<()> {
        if self.queue.is_running() {
            return Ok(());
        }
        self.queue.start(self.router.clone())?;
        self.recover().await?;
        info!("rollout engine started");
        Ok(())
    }

    /// Stop processing jobs. Delayed work is dropped; the next `start`
    /// re-issues it from the device rows.
    pub async fn stop(&self) {
        self.queue.stop().await;
        info!("rollout engine stopped");
    }

    /// Resolve once no job is queued, delayed, or running.
    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    async fn recover(&self) -> RolloutResult<()> {
        for deployment in self.store.list_deployments()? {
            if !matches!(
                deployment.status,
                DeploymentStatus::Running | DeploymentStatus::Paused | DeploymentStatus::Cancelled
            ) {
                continue;
            }
            let recovered = self.router.runner.recover(&deployment.id).await?;
            let resumed = self.controller.resume(&deployment.id)?;
            if recovered != Recovered::default() || resumed {
                info!(
                    deployment = %deployment.id,
                    status = %deployment.status,
                    requeued = recovered.requeued,
                    interrupted = recovered.interrupted,
                    "deployment recovered"
                );
            }
        }
        Ok(())
    }

    pub fn controller(&self) -> &DeploymentController {
        &self.controller
    }

    /// Begin rolling out a pending deployment.
    pub fn start_deployment(&self, deployment_id: &str) -> RolloutResult<()> {
        self.controller.start_deployment(deployment_id)
    }

    pub fn cancel_deployment(&self, deployment_id: &str) -> RolloutResult<bool> {
        self.controller.cancel_deployment(deployment_id)
    }

    pub fn progress(&self, deployment_id: &str) -> RolloutResult<DeploymentProgress> {
        self.controller.progress(deployment_id)
    }

    /// Last recorded execution result of one device.
    pub fn device_result(
        &self,
        deployment_id: &str,
        device_id: &str,
    ) -> RolloutResult<Option<ExecutionResult>> {
        let device = self
            .store
            .find_device(deployment_id, device_id)?
            .ok_or_else(|| RolloutError::DeviceNotFound(format!("{deployment_id}/{device_id}")))?;
        Ok(device.last_result)
    }
}
