//! Work queue: delayed, at-least-once units of work with bounded concurrency.
//!
//! Controllers and device runners never call each other directly; they
//! enqueue [`Job`]s. [`LocalQueue`] runs each job as a tokio task that
//! sleeps out its delay, waits for a permit of its class, and hands the
//! job to the registered [`JobHandler`]. A handler error is an
//! infrastructure failure: the same job is delivered again with
//! exponential backoff until `job_max_deliveries` is reached.
//!
//! Device retries are not handled here. They are new `RunDevice` jobs
//! with a fresh `attempt`, scheduled by the runner.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify, Semaphore};
use tracing::{debug, error, info, warn};

use fleetgrid_state::{DeploymentId, DeviceKey};

use crate::config::QueueConfig;
use crate::error::{RolloutError, RolloutResult};

/// Upper bound on the infrastructure redelivery delay.
const MAX_REDELIVERY_DELAY: Duration = Duration::from_secs(60);

/// What a unit of work does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum JobKind {
    /// Run one admission pass for a deployment. `follow_up` marks the
    /// single delayed pass a deployment may have outstanding.
    Admit {
        deployment_id: DeploymentId,
        #[serde(default)]
        follow_up: bool,
    },
    /// Drive one device attempt. `attempt` is the row's `retry_count`
    /// when the job was issued; a mismatch marks the job stale.
    RunDevice { key: DeviceKey, attempt: u32 },
}

/// A unit of work plus its infrastructure delivery counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub kind: JobKind,
    /// Failed deliveries so far.
    #[serde(default)]
    pub delivery: u32,
}

/// Concurrency class of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobClass {
    Controller,
    Device,
}

impl Job {
    pub fn admit(deployment_id: impl Into<DeploymentId>) -> Self {
        Self {
            kind: JobKind::Admit {
                deployment_id: deployment_id.into(),
                follow_up: false,
            },
            delivery: 0,
        }
    }

    /// The delayed admission pass owned by the deployment's
    /// `follow_up_scheduled` flag.
    pub fn follow_up(deployment_id: impl Into<DeploymentId>) -> Self {
        Self {
            kind: JobKind::Admit {
                deployment_id: deployment_id.into(),
                follow_up: true,
            },
            delivery: 0,
        }
    }

    pub fn run_device(key: DeviceKey, attempt: u32) -> Self {
        Self {
            kind: JobKind::RunDevice { key, attempt },
            delivery: 0,
        }
    }

    pub fn class(&self) -> JobClass {
        match self.kind {
            JobKind::Admit { .. } => JobClass::Controller,
            JobKind::RunDevice { .. } => JobClass::Device,
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            JobKind::Admit {
                deployment_id,
                follow_up: false,
            } => write!(f, "admit {deployment_id}"),
            JobKind::Admit {
                deployment_id,
                follow_up: true,
            } => write!(f, "follow-up admit {deployment_id}"),
            JobKind::RunDevice { key, attempt } => write!(f, "run {key} attempt {attempt}"),
        }
    }
}

pub type JobFuture<'a> = Pin<Box<dyn Future<Output = RolloutResult<()>> + Send + 'a>>;

/// Executes jobs taken off a queue.
pub trait JobHandler: Send + Sync {
    fn handle<'a>(&'a self, job: &'a Job) -> JobFuture<'a>;
}

/// Anything jobs can be scheduled on.
pub trait JobQueue: Send + Sync {
    /// Schedule `job` to run after `delay` (immediately when `None`).
    fn enqueue(&self, job: Job, delay: Option<Duration>) -> RolloutResult<()>;
}

/// Handler and runtime captured by `start`.
struct Running {
    handler: Arc<dyn JobHandler>,
    runtime: Handle,
}

struct QueueInner {
    config: QueueConfig,
    controllers: Semaphore,
    devices: Semaphore,
    running: RwLock<Option<Running>>,
    shutdown: watch::Sender<bool>,
    /// Jobs enqueued but not yet finished, including delayed ones.
    outstanding: AtomicUsize,
    idle: Notify,
}

/// In-process [`JobQueue`] on the tokio runtime.
#[derive(Clone)]
pub struct LocalQueue {
    inner: Arc<QueueInner>,
}

impl LocalQueue {
    pub fn new(config: QueueConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(QueueInner {
                controllers: Semaphore::new(config.max_concurrent_controllers.max(1)),
                devices: Semaphore::new(config.max_concurrent_devices.max(1)),
                config,
                running: RwLock::new(None),
                shutdown,
                outstanding: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Begin delivering jobs to `handler`. Must be called from inside a
    /// tokio runtime; jobs are spawned onto that runtime.
    pub fn start(&self, handler: Arc<dyn JobHandler>) -> RolloutResult<()> {
        let runtime = Handle::try_current().map_err(|e| {
            RolloutError::Config(format!("queue must be started inside a tokio runtime: {e}"))
        })?;
        let mut running = self
            .inner
            .running
            .write()
            .map_err(|_| RolloutError::QueueStopped)?;
        *running = Some(Running { handler, runtime });
        self.inner.shutdown.send_replace(false);
        info!(
            controllers = self.inner.config.max_concurrent_controllers,
            devices = self.inner.config.max_concurrent_devices,
            "work queue started"
        );
        Ok(())
    }

    /// Stop accepting jobs, drop delayed ones, and wait for running
    /// handlers to return.
    pub async fn stop(&self) {
        if let Ok(mut running) = self.inner.running.write() {
            running.take();
        }
        self.inner.shutdown.send_replace(true);
        self.wait_idle().await;
        info!("work queue stopped");
    }

    /// Resolve once no job is queued, delayed, or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Jobs enqueued and not yet finished.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .running
            .read()
            .map(|running| running.is_some())
            .unwrap_or(false)
    }
}

impl JobQueue for LocalQueue {
    fn enqueue(&self, job: Job, delay: Option<Duration>) -> RolloutResult<()> {
        QueueInner::spawn(&self.inner, job, delay)
    }
}

impl QueueInner {
    fn spawn(inner: &Arc<Self>, job: Job, delay: Option<Duration>) -> RolloutResult<()> {
        let runtime = {
            let running = inner.running.read().map_err(|_| RolloutError::QueueStopped)?;
            match running.as_ref() {
                Some(running) => running.runtime.clone(),
                None => return Err(RolloutError::QueueStopped),
            }
        };

        inner.outstanding.fetch_add(1, Ordering::AcqRel);
        debug!(%job, delay_ms = delay.map(|d| d.as_millis() as u64), "job enqueued");

        let task_inner = Arc::clone(inner);
        runtime.spawn(async move {
            task_inner.run_job(job, delay).await;
            task_inner.finish_one();
        });
        Ok(())
    }

    fn finish_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn handler(&self) -> Option<Arc<dyn JobHandler>> {
        self.running
            .read()
            .ok()
            .and_then(|running| running.as_ref().map(|r| Arc::clone(&r.handler)))
    }

    async fn run_job(self: &Arc<Self>, job: Job, delay: Option<Duration>) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            debug!(%job, "queue stopped, job dropped");
            return;
        }

        if let Some(delay) = delay.filter(|d| !d.is_zero()) {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    debug!(%job, "queue stopped during delay, job dropped");
                    return;
                }
            }
        }

        let semaphore = match job.class() {
            JobClass::Controller => &self.controllers,
            JobClass::Device => &self.devices,
        };
        let _permit = tokio::select! {
            permit = semaphore.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = shutdown.changed() => {
                debug!(%job, "queue stopped while waiting for a permit, job dropped");
                return;
            }
        };

        let Some(handler) = self.handler() else {
            debug!(%job, "no handler registered, job dropped");
            return;
        };

        let Err(e) = handler.handle(&job).await else {
            return;
        };

        let next_delivery = job.delivery + 1;
        if next_delivery >= self.config.job_max_deliveries {
            error!(%job, deliveries = next_delivery, error = %e, "job failed, giving up");
            return;
        }

        let delay = redelivery_delay(self.config.job_retry_base_ms, job.delivery);
        warn!(
            %job,
            delivery = next_delivery,
            retry_in_ms = delay.as_millis() as u64,
            error = %e,
            "job failed, redelivering"
        );
        let retry = Job {
            delivery: next_delivery,
            ..job
        };
        if let Err(e) = Self::spawn(self, retry, Some(delay)) {
            warn!(error = %e, "redelivery dropped");
        }
    }
}

/// `base_ms × 2^delivery`, capped at one minute.
fn redelivery_delay(base_ms: u64, delivery: u32) -> Duration {
    let factor = 1u64.checked_shl(delivery).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor)).min(MAX_REDELIVERY_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Records every delivery; fails the first `fail_first` deliveries of
    /// each job and holds each call for `hold`.
    struct Recorder {
        seen: Mutex<Vec<(Job, Duration)>>,
        fail_first: u32,
        hold: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
        started: Instant,
    }

    impl Recorder {
        fn new(fail_first: u32, hold: Duration) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                fail_first,
                hold,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                started: Instant::now(),
            })
        }

        fn seen(&self) -> Vec<(Job, Duration)> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl JobHandler for Recorder {
        fn handle<'a>(&'a self, job: &'a Job) -> JobFuture<'a> {
            Box::pin(async move {
                self.seen
                    .lock()
                    .unwrap()
                    .push((job.clone(), self.started.elapsed()));
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                if !self.hold.is_zero() {
                    tokio::time::sleep(self.hold).await;
                }
                self.active.fetch_sub(1, Ordering::SeqCst);
                if job.delivery < self.fail_first {
                    return Err(RolloutError::Channel("flaky".to_string()));
                }
                Ok(())
            })
        }
    }

    fn device_job(n: u32) -> Job {
        Job::run_device(DeviceKey::new("dep-1", 1, &format!("dev-{n}")), 0)
    }

    #[tokio::test]
    async fn enqueue_before_start_is_rejected() {
        let queue = LocalQueue::new(QueueConfig::default());
        let err = queue.enqueue(Job::admit("dep-1"), None).unwrap_err();
        assert!(matches!(err, RolloutError::QueueStopped));
        assert!(!queue.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_job_runs_after_delay() {
        let queue = LocalQueue::new(QueueConfig::default());
        let recorder = Recorder::new(0, Duration::ZERO);
        queue.start(recorder.clone()).unwrap();

        queue
            .enqueue(Job::admit("dep-1"), Some(Duration::from_secs(600)))
            .unwrap();
        queue.wait_idle().await;

        let seen = recorder.seen();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].1 >= Duration::from_secs(600));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_job_is_redelivered_with_backoff_then_dropped() {
        let config = QueueConfig {
            job_max_deliveries: 3,
            job_retry_base_ms: 1_000,
            ..QueueConfig::default()
        };
        let queue = LocalQueue::new(config);
        let recorder = Recorder::new(u32::MAX, Duration::ZERO);
        queue.start(recorder.clone()).unwrap();

        queue.enqueue(Job::admit("dep-1"), None).unwrap();
        queue.wait_idle().await;

        let seen = recorder.seen();
        let deliveries: Vec<u32> = seen.iter().map(|(job, _)| job.delivery).collect();
        assert_eq!(deliveries, vec![0, 1, 2]);
        assert!(seen[1].1 >= Duration::from_secs(1));
        assert!(seen[2].1 >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn recovered_job_stops_redelivering() {
        let queue = LocalQueue::new(QueueConfig::default());
        let recorder = Recorder::new(1, Duration::ZERO);
        queue.start(recorder.clone()).unwrap();

        queue.enqueue(Job::admit("dep-1"), None).unwrap();
        queue.wait_idle().await;
        assert_eq!(recorder.seen().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn device_concurrency_is_bounded() {
        let config = QueueConfig {
            max_concurrent_devices: 3,
            ..QueueConfig::default()
        };
        let queue = LocalQueue::new(config);
        let recorder = Recorder::new(0, Duration::from_secs(5));
        queue.start(recorder.clone()).unwrap();

        for n in 0..10 {
            queue.enqueue(device_job(n), None).unwrap();
        }
        queue.wait_idle().await;

        assert_eq!(recorder.seen().len(), 10);
        assert_eq!(recorder.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_drops_delayed_jobs() {
        let queue = LocalQueue::new(QueueConfig::default());
        let recorder = Recorder::new(0, Duration::ZERO);
        queue.start(recorder.clone()).unwrap();

        queue
            .enqueue(Job::admit("dep-1"), Some(Duration::from_secs(3_600)))
            .unwrap();
        assert_eq!(queue.outstanding(), 1);
        queue.stop().await;

        assert!(recorder.seen().is_empty());
        assert_eq!(queue.outstanding(), 0);
        assert!(matches!(
            queue.enqueue(Job::admit("dep-1"), None),
            Err(RolloutError::QueueStopped)
        ));
    }

    #[test]
    fn redelivery_delay_doubles_and_caps() {
        assert_eq!(redelivery_delay(1_000, 0), Duration::from_secs(1));
        assert_eq!(redelivery_delay(1_000, 3), Duration::from_secs(8));
        assert_eq!(redelivery_delay(1_000, 10), MAX_REDELIVERY_DELAY);
        assert_eq!(redelivery_delay(1_000, 80), MAX_REDELIVERY_DELAY);
    }

    #[test]
    fn job_classes_and_display() {
        assert_eq!(Job::admit("dep-1").class(), JobClass::Controller);
        assert_eq!(device_job(1).class(), JobClass::Device);
        assert_eq!(Job::admit("dep-1").to_string(), "admit dep-1");
        assert_eq!(Job::follow_up("dep-1").to_string(), "follow-up admit dep-1");
        assert_eq!(device_job(7).to_string(), "run dep-1#1:dev-7 attempt 0");
    }

    #[test]
    fn admit_jobs_without_follow_up_marker_decode_as_regular() {
        let job: Job =
            serde_json::from_str(r#"{"kind":{"job":"admit","deployment_id":"dep-1"}}"#).unwrap();
        assert_eq!(job, Job::admit("dep-1"));
    }
}
