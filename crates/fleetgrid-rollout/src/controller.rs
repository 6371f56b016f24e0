//! Deployment controller: decides which batch runs next and when a
//! deployment is done or must stop.
//!
//! Every transition is a conditional update on the deployment or device
//! row, so running any operation twice (duplicate delivery, racing
//! admissions) has the same effect as running it once.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use fleetgrid_state::{
    epoch_secs, Deployment, DeploymentProgress, DeploymentStatus, DeviceStatus, RolloutConfig,
    StateStore,
};

use crate::channel::{MaintenanceGate, PauseEvent, PauseNotifier};
use crate::config::AdmissionConfig;
use crate::error::{RolloutError, RolloutResult};
use crate::queue::{Job, JobQueue};
use crate::threshold;

/// Result of one admission pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// The deployment is not pending or running.
    Skipped,
    /// The deployment row does not exist.
    NotFound,
    /// Every device is terminal; the deployment was completed.
    Completed,
    /// The current batch is fully in flight.
    Waiting,
    /// Devices of `batch` were handed to runners.
    Dispatched {
        batch: u32,
        devices: usize,
        /// Left pending because their maintenance window is closed.
        deferred: usize,
    },
}

/// Whether the next batch is admitted as soon as the current one settles,
/// rather than on a timer.
pub fn completion_driven(rollout: &RolloutConfig) -> bool {
    rollout.batch_delay().is_none_or(|delay| delay.is_zero())
}

/// Deployment-level state machine.
pub struct DeploymentController {
    store: StateStore,
    queue: Arc<dyn JobQueue>,
    gate: Arc<dyn MaintenanceGate>,
    notifier: Arc<dyn PauseNotifier>,
    config: AdmissionConfig,
}

impl DeploymentController {
    pub fn new(
        store: StateStore,
        queue: Arc<dyn JobQueue>,
        gate: Arc<dyn MaintenanceGate>,
        notifier: Arc<dyn PauseNotifier>,
        config: AdmissionConfig,
    ) -> Self {
        Self {
            store,
            queue,
            gate,
            notifier,
            config,
        }
    }

    /// Enqueue the first admission of a pending deployment.
    pub fn start_deployment(&self, deployment_id: &str) -> RolloutResult<()> {
        let deployment = self.load(deployment_id)?;
        if deployment.status != DeploymentStatus::Pending {
            return Err(RolloutError::NotStartable {
                id: deployment.id,
                status: deployment.status,
            });
        }
        self.queue.enqueue(Job::admit(deployment_id), None)?;
        info!(deployment = %deployment_id, name = %deployment.name, "deployment submitted");
        Ok(())
    }

    /// Run one admission pass.
    pub async fn admit_next_batch(&self, deployment_id: &str) -> RolloutResult<AdmitOutcome> {
        let Some(deployment) = self.store.get_deployment(deployment_id)? else {
            warn!(deployment = %deployment_id, "admission for unknown deployment");
            return Ok(AdmitOutcome::NotFound);
        };
        let Some(deployment) = self.activate(deployment)? else {
            return Ok(AdmitOutcome::Skipped);
        };

        let page = self
            .store
            .admission_page(deployment_id, self.config.page_size)?;
        let Some(batch) = page.batch else {
            return Ok(if self.check_completion(deployment_id)? {
                AdmitOutcome::Completed
            } else {
                AdmitOutcome::Waiting
            });
        };

        if page.ready.is_empty() {
            debug!(
                deployment = %deployment_id,
                batch,
                in_flight = page.in_flight,
                "batch in flight, nothing to admit"
            );
            self.schedule_follow_up(&deployment, false)?;
            return Ok(AdmitOutcome::Waiting);
        }

        let gated = deployment.rollout.respect_maintenance_windows;
        let mut dispatched = 0;
        let mut deferred = 0;
        for device in page.ready {
            if gated && !self.eligible(&device.device_id).await {
                deferred += 1;
                continue;
            }

            let key = device.key();
            let claimed = self.store.update_device(&key, |row| {
                if row.status != DeviceStatus::Pending || row.dispatched {
                    return false;
                }
                row.dispatched = true;
                true
            })?;
            let Some(claimed) = claimed else {
                debug!(deployment = %deployment_id, device = %device.device_id, "already claimed");
                continue;
            };

            if let Err(e) = self
                .queue
                .enqueue(Job::run_device(key.clone(), claimed.retry_count), None)
            {
                self.store.update_device(&key, |row| {
                    let owned = row.dispatched && row.status == DeviceStatus::Pending;
                    row.dispatched = false;
                    owned
                })?;
                return Err(e);
            }
            dispatched += 1;
        }

        info!(
            deployment = %deployment_id,
            batch,
            dispatched,
            deferred,
            in_flight = page.in_flight,
            "batch admitted"
        );
        self.schedule_follow_up(&deployment, deferred > 0)?;

        Ok(AdmitOutcome::Dispatched {
            batch,
            devices: dispatched,
            deferred,
        })
    }

    /// Run the deployment's delayed admission pass.
    ///
    /// The slot is released before the pass so the pass can queue the
    /// next one.
    pub async fn admit_follow_up(&self, deployment_id: &str) -> RolloutResult<AdmitOutcome> {
        if self.store.get_deployment(deployment_id)?.is_none() {
            warn!(deployment = %deployment_id, "follow-up admission for unknown deployment");
            return Ok(AdmitOutcome::NotFound);
        }
        self.release_follow_up(deployment_id)?;
        self.admit_next_batch(deployment_id).await
    }

    /// Re-arm admission for a deployment whose queued jobs were lost,
    /// as after an engine restart. Returns whether an admission pass was
    /// queued.
    pub fn resume(&self, deployment_id: &str) -> RolloutResult<bool> {
        self.load(deployment_id)?;
        self.release_follow_up(deployment_id)?;
        let deployment = self.load(deployment_id)?;
        if deployment.status != DeploymentStatus::Running {
            return Ok(false);
        }
        self.queue.enqueue(Job::admit(deployment_id), None)?;
        info!(deployment = %deployment_id, "admission resumed");
        Ok(true)
    }

    /// Pause the deployment if its failures cross the threshold.
    ///
    /// Returns true only for the call that performed the transition; only
    /// that call notifies.
    pub async fn evaluate_pause(&self, deployment_id: &str) -> RolloutResult<bool> {
        let deployment = self.load(deployment_id)?;
        if !deployment.status.is_active() {
            return Ok(false);
        }

        let progress = self.store.deployment_progress(deployment_id)?;
        let Some(reason) = threshold::breach(
            &deployment.rollout.failure_threshold,
            &progress,
            deployment.consecutive_failures,
        ) else {
            return Ok(false);
        };

        let paused = self.store.update_deployment(deployment_id, |d| {
            if !d.status.is_active() {
                return false;
            }
            d.status = DeploymentStatus::Paused;
            d.pause_reason = Some(reason.clone());
            true
        })?;
        let Some(paused) = paused else {
            return Ok(false);
        };

        warn!(
            deployment = %deployment_id,
            reason = %reason,
            failed = progress.failed,
            completed = progress.completed,
            "deployment auto-paused"
        );
        self.notifier
            .notify(PauseEvent {
                deployment_id: paused.id,
                deployment_name: paused.name,
                org_id: paused.org_id,
                reason,
            })
            .await;
        Ok(true)
    }

    /// Complete a running deployment once no device is pending or running.
    pub fn check_completion(&self, deployment_id: &str) -> RolloutResult<bool> {
        let progress = self.store.deployment_progress(deployment_id)?;
        if !progress.is_settled() {
            return Ok(false);
        }
        let completed = self.store.update_deployment(deployment_id, |d| {
            if d.status != DeploymentStatus::Running {
                return false;
            }
            d.status = DeploymentStatus::Completed;
            d.completed_at = Some(epoch_secs());
            true
        })?;
        if completed.is_some() {
            info!(
                deployment = %deployment_id,
                completed = progress.completed,
                failed = progress.failed,
                skipped = progress.skipped,
                "deployment completed"
            );
        }
        Ok(completed.is_some())
    }

    /// Cancel a pending, running, or paused deployment. Runners skip the
    /// deployment's devices from their next step on.
    pub fn cancel_deployment(&self, deployment_id: &str) -> RolloutResult<bool> {
        self.load(deployment_id)?;
        let cancelled = self.store.update_deployment(deployment_id, |d| {
            if !(d.status.is_active() || d.status == DeploymentStatus::Paused) {
                return false;
            }
            d.status = DeploymentStatus::Cancelled;
            true
        })?;
        if cancelled.is_some() {
            info!(deployment = %deployment_id, "deployment cancelled");
        }
        Ok(cancelled.is_some())
    }

    pub fn progress(&self, deployment_id: &str) -> RolloutResult<DeploymentProgress> {
        self.load(deployment_id)?;
        Ok(self.store.deployment_progress(deployment_id)?)
    }

    // ── Internals ──────────────────────────────────────────────────

    fn load(&self, deployment_id: &str) -> RolloutResult<Deployment> {
        self.store
            .get_deployment(deployment_id)?
            .ok_or_else(|| RolloutError::DeploymentNotFound(deployment_id.to_string()))
    }

    /// Move a pending deployment to running. Returns the deployment when
    /// admission may proceed.
    fn activate(&self, deployment: Deployment) -> RolloutResult<Option<Deployment>> {
        match deployment.status {
            DeploymentStatus::Running => Ok(Some(deployment)),
            DeploymentStatus::Pending => {
                let started = self.store.update_deployment(&deployment.id, |d| {
                    if d.status != DeploymentStatus::Pending {
                        return false;
                    }
                    d.status = DeploymentStatus::Running;
                    d.started_at = Some(epoch_secs());
                    true
                })?;
                match started {
                    Some(d) => {
                        info!(deployment = %d.id, "deployment running");
                        Ok(Some(d))
                    }
                    // Lost a race; go by whatever the winner left.
                    None => Ok(self
                        .store
                        .get_deployment(&deployment.id)?
                        .filter(|d| d.status == DeploymentStatus::Running)),
                }
            }
            status => {
                debug!(deployment = %deployment.id, %status, "admission skipped");
                Ok(None)
            }
        }
    }

    /// Fail-closed maintenance check.
    async fn eligible(&self, device_id: &str) -> bool {
        match self.gate.is_eligible(device_id).await {
            Ok(eligible) => eligible,
            Err(e) => {
                warn!(device = %device_id, error = %e, "maintenance check failed, deferring");
                false
            }
        }
    }

    /// Schedule the next admission: after the batch delay for staggered
    /// rollouts, and after the maintenance wait when devices were deferred.
    ///
    /// A deployment has at most one delayed pass queued. The slot is taken
    /// with a conditional update, so passes triggered by device outcomes
    /// do not start chains of their own.
    fn schedule_follow_up(&self, deployment: &Deployment, deferred: bool) -> RolloutResult<()> {
        let stagger = deployment
            .rollout
            .batch_delay()
            .filter(|delay| !delay.is_zero());
        let maintenance = deferred.then(|| self.config.maintenance_wait());
        let delay: Option<Duration> = match (stagger, maintenance) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let Some(delay) = delay else {
            return Ok(());
        };

        let taken = self.store.update_deployment(&deployment.id, |d| {
            if d.follow_up_scheduled {
                return false;
            }
            d.follow_up_scheduled = true;
            true
        })?;
        if taken.is_none() {
            debug!(deployment = %deployment.id, "next admission already scheduled");
            return Ok(());
        }

        if let Err(e) = self.queue.enqueue(Job::follow_up(&deployment.id), Some(delay)) {
            self.release_follow_up(&deployment.id)?;
            return Err(e);
        }
        debug!(
            deployment = %deployment.id,
            delay_secs = delay.as_secs(),
            "next admission scheduled"
        );
        Ok(())
    }

    /// Clear the follow-up slot. Returns whether it was held.
    fn release_follow_up(&self, deployment_id: &str) -> RolloutResult<bool> {
        let released = self.store.update_deployment(deployment_id, |d| {
            let held = d.follow_up_scheduled;
            d.follow_up_scheduled = false;
            held
        })?;
        Ok(released.is_some())
    }
}
