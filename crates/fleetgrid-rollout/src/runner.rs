//! Device runner: drives one device attempt to its next state.
//!
//! ```text
//! pending ──claim──▶ running ──execute──▶ completed
//!    ▲                                 ├──▶ pending (retry_count + 1, delayed re-run)
//!    │                                 ├──▶ failed  (retries exhausted)
//!    └── maintenance wait (unchanged)  └──▶ skipped (deployment halted meanwhile)
//! ```
//!
//! A job carries the `retry_count` it was issued for. Any job whose
//! attempt no longer matches the row, or whose row has already moved on,
//! is stale and leaves the device alone.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use fleetgrid_state::{
    epoch_secs, DeploymentStatus, DeviceKey, DeviceStatus, ExecutionResult, StateStore,
};

use crate::channel::MaintenanceGate;
use crate::controller::{completion_driven, DeploymentController};
use crate::error::{RolloutError, RolloutResult};
use crate::executor::PayloadExecutor;
use crate::queue::{Job, JobQueue};
use crate::retry;

/// What one runner pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Duplicate or out-of-date job; nothing changed.
    Stale,
    /// The deployment is halted; the device was skipped.
    Skipped { reason: String },
    /// The maintenance window is closed; the same attempt runs later.
    Waiting,
    Completed,
    /// The attempt failed and a retry was scheduled.
    Retrying { retry_count: u32, delay: Duration },
    /// The attempt failed with no retries left.
    Failed,
}

impl RunOutcome {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped { .. })
    }
}

/// Error recorded for an attempt whose runner went away midway.
const INTERRUPTED: &str = "Attempt interrupted";

/// Device rows picked up again by [`DeviceRunner::recover`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recovered {
    /// Claimed pending rows whose job was issued again.
    pub requeued: usize,
    /// Rows found `running`, settled as a failed attempt.
    pub interrupted: usize,
}

pub struct DeviceRunner {
    store: StateStore,
    queue: Arc<dyn JobQueue>,
    gate: Arc<dyn MaintenanceGate>,
    executor: PayloadExecutor,
    controller: Arc<DeploymentController>,
    maintenance_wait: Duration,
}

impl DeviceRunner {
    pub fn new(
        store: StateStore,
        queue: Arc<dyn JobQueue>,
        gate: Arc<dyn MaintenanceGate>,
        executor: PayloadExecutor,
        controller: Arc<DeploymentController>,
        maintenance_wait: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            gate,
            executor,
            controller,
            maintenance_wait,
        }
    }

    /// Run attempt `attempt` of the device at `key`.
    ///
    /// A missing device or deployment row is an error so the queue
    /// redelivers the job. Everything that happens on the device itself
    /// ends up in the row instead.
    pub async fn run(&self, key: &DeviceKey, attempt: u32) -> RolloutResult<RunOutcome> {
        let device = self
            .store
            .get_device(key)?
            .ok_or_else(|| RolloutError::DeviceNotFound(key.to_string()))?;
        if device.status != DeviceStatus::Pending || device.retry_count != attempt {
            debug!(device = %key, attempt, status = %device.status, "stale device job");
            if device.status.is_terminal() && device.retry_count == attempt {
                // Redelivery of the job that settled this row; its
                // deployment follow-ups may not have run.
                self.after_outcome(&key.deployment_id, true).await?;
            }
            return Ok(RunOutcome::Stale);
        }

        let deployment = self
            .store
            .get_deployment(&key.deployment_id)?
            .ok_or_else(|| RolloutError::DeploymentNotFound(key.deployment_id.clone()))?;

        if deployment.status.is_halted() {
            return self.skip(key, attempt, deployment.status);
        }
        if deployment.status == DeploymentStatus::Completed {
            return Ok(RunOutcome::Stale);
        }

        if deployment.rollout.respect_maintenance_windows && !self.eligible(key).await {
            self.queue
                .enqueue(Job::run_device(key.clone(), attempt), Some(self.maintenance_wait))?;
            debug!(
                device = %key,
                attempt,
                wait_secs = self.maintenance_wait.as_secs(),
                "outside maintenance window, waiting"
            );
            return Ok(RunOutcome::Waiting);
        }

        // The claim commits together with a check of the deployment, so a
        // pause or cancel that landed while the gate was consulted wins.
        let mut halted = None;
        let claimed = self.store.update_device_and_deployment(key, |d, dep| {
            if d.status != DeviceStatus::Pending || d.retry_count != attempt {
                return false;
            }
            if !dep.status.is_active() {
                halted = Some(dep.status);
                return false;
            }
            d.status = DeviceStatus::Running;
            d.started_at = Some(epoch_secs());
            true
        })?;
        if claimed.is_none() {
            return match halted {
                Some(status) if status.is_halted() => self.skip(key, attempt, status),
                _ => Ok(RunOutcome::Stale),
            };
        }

        debug!(
            device = %key,
            attempt,
            command_type = deployment.payload.command_type(),
            "executing payload"
        );
        let started = Instant::now();
        let result = match self.executor.execute(&key.device_id, &deployment.payload).await {
            Ok(result) => result,
            Err(e) => {
                warn!(device = %key, attempt, error = %e, "payload execution errored");
                let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                ExecutionResult::failure(e.to_string(), elapsed)
            }
        };

        let outcome = self.record(key, attempt, result)?;
        match &outcome {
            RunOutcome::Completed => info!(device = %key, attempt, "device completed"),
            RunOutcome::Failed => warn!(device = %key, attempt, "device failed, retries exhausted"),
            RunOutcome::Skipped { reason } => {
                info!(device = %key, attempt, %reason, "device skipped after halt")
            }
            RunOutcome::Retrying { retry_count, delay } => info!(
                device = %key,
                attempt,
                retry_count,
                delay_secs = delay.as_secs(),
                "device attempt failed, retrying"
            ),
            RunOutcome::Stale | RunOutcome::Waiting => {}
        }

        if let RunOutcome::Retrying { retry_count, delay } = outcome {
            self.schedule_retry(key, retry_count, delay)?;
        }
        if outcome != RunOutcome::Stale {
            self.after_outcome(&key.deployment_id, outcome.is_terminal())
                .await?;
        }
        Ok(outcome)
    }

    /// Settle the rows a previous engine run left in flight.
    ///
    /// Must run before the queue delivers jobs for `deployment_id`: a row
    /// still `running` at that point has no runner, so its attempt counts
    /// as failed and goes through the retry policy. Pending rows holding a
    /// dispatch claim get their job issued again.
    pub async fn recover(&self, deployment_id: &str) -> RolloutResult<Recovered> {
        let mut recovered = Recovered::default();
        let open = self.store.devices_with_status(
            deployment_id,
            &[DeviceStatus::Pending, DeviceStatus::Running],
            usize::MAX,
        )?;
        for device in open {
            let key = device.key();
            match device.status {
                DeviceStatus::Pending if device.dispatched => {
                    self.queue
                        .enqueue(Job::run_device(key, device.retry_count), None)?;
                    recovered.requeued += 1;
                }
                DeviceStatus::Running => {
                    let result = ExecutionResult::failure(INTERRUPTED, 0);
                    let outcome = self.record(&key, device.retry_count, result)?;
                    if let RunOutcome::Retrying { retry_count, delay } = outcome {
                        self.schedule_retry(&key, retry_count, delay)?;
                    }
                    if outcome != RunOutcome::Stale {
                        warn!(
                            device = %key,
                            attempt = device.retry_count,
                            ?outcome,
                            "interrupted attempt settled"
                        );
                        recovered.interrupted += 1;
                    }
                }
                _ => {}
            }
        }
        if recovered.interrupted > 0 {
            self.controller.evaluate_pause(deployment_id).await?;
        }
        Ok(recovered)
    }

    /// Mark a pending device skipped because its deployment is halted.
    fn skip(
        &self,
        key: &DeviceKey,
        attempt: u32,
        status: DeploymentStatus,
    ) -> RolloutResult<RunOutcome> {
        let reason = status.as_str().to_string();
        let skipped = self.store.update_device(key, |d| {
            if d.status != DeviceStatus::Pending || d.retry_count != attempt {
                return false;
            }
            d.skip_reason = Some(reason.clone());
            d.finish(DeviceStatus::Skipped, None);
            true
        })?;
        if skipped.is_none() {
            return Ok(RunOutcome::Stale);
        }
        debug!(device = %key, %reason, "device skipped");
        Ok(RunOutcome::Skipped { reason })
    }

    /// Write the attempt's outcome together with the deployment's
    /// consecutive-failure counter. An outcome that arrives after the
    /// deployment halted is recorded `skipped`, result kept.
    fn record(
        &self,
        key: &DeviceKey,
        attempt: u32,
        result: ExecutionResult,
    ) -> RolloutResult<RunOutcome> {
        let mut outcome = RunOutcome::Stale;
        self.store.update_device_and_deployment(key, |device, deployment| {
            if device.status != DeviceStatus::Running || device.retry_count != attempt {
                return false;
            }
            outcome = if deployment.status.is_halted() {
                let reason = deployment.status.as_str().to_string();
                device.skip_reason = Some(reason.clone());
                device.finish(DeviceStatus::Skipped, Some(result));
                RunOutcome::Skipped { reason }
            } else if result.success {
                device.finish(DeviceStatus::Completed, Some(result));
                deployment.consecutive_failures = 0;
                RunOutcome::Completed
            } else if retry::can_retry(attempt, &deployment.rollout) {
                device.retry_count = attempt + 1;
                device.status = DeviceStatus::Pending;
                // Owned by the retry job until it runs.
                device.dispatched = true;
                device.last_result = Some(result);
                RunOutcome::Retrying {
                    retry_count: device.retry_count,
                    delay: retry::backoff_delay(attempt, &deployment.rollout),
                }
            } else {
                device.finish(DeviceStatus::Failed, Some(result));
                deployment.consecutive_failures += 1;
                RunOutcome::Failed
            };
            true
        })?;
        Ok(outcome)
    }

    /// Enqueue the next attempt. If that fails the row gives up its
    /// dispatch claim so a later admission pass picks it up again.
    fn schedule_retry(
        &self,
        key: &DeviceKey,
        retry_count: u32,
        delay: Duration,
    ) -> RolloutResult<()> {
        let Err(e) = self
            .queue
            .enqueue(Job::run_device(key.clone(), retry_count), Some(delay))
        else {
            return Ok(());
        };
        self.store.update_device(key, |d| {
            if d.status != DeviceStatus::Pending || d.retry_count != retry_count {
                return false;
            }
            d.dispatched = false;
            true
        })?;
        Err(e)
    }

    async fn after_outcome(&self, deployment_id: &str, terminal: bool) -> RolloutResult<()> {
        if self.controller.evaluate_pause(deployment_id).await? || !terminal {
            return Ok(());
        }
        if self.controller.check_completion(deployment_id)? {
            return Ok(());
        }
        let Some(deployment) = self.store.get_deployment(deployment_id)? else {
            return Ok(());
        };
        if deployment.status == DeploymentStatus::Running && completion_driven(&deployment.rollout)
        {
            self.queue.enqueue(Job::admit(deployment_id), None)?;
        }
        Ok(())
    }

    /// Fail-closed maintenance check.
    async fn eligible(&self, key: &DeviceKey) -> bool {
        match self.gate.is_eligible(&key.device_id).await {
            Ok(eligible) => eligible,
            Err(e) => {
                warn!(device = %key, error = %e, "maintenance check failed, waiting");
                false
            }
        }
    }
}
