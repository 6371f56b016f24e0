//! Domain types for the fleetgrid state store.
//!
//! These types represent the persisted state of rollout campaigns
//! (deployments) and the per-device assignments under them. All types are
//! serializable to/from JSON for storage in redb tables.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique identifier for a deployment.
pub type DeploymentId = String;

/// Unique identifier for a managed device.
pub type DeviceId = String;

/// Unique identifier for the organization owning a deployment.
pub type OrgId = String;

// ── Deployment ─────────────────────────────────────────────────────

/// One rollout campaign: a payload pushed to a set of devices.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub org_id: OrgId,
    pub name: String,
    pub payload: Payload,
    pub rollout: RolloutConfig,
    pub status: DeploymentStatus,
    /// Why the deployment was paused, if it was.
    #[serde(default)]
    pub pause_reason: Option<String>,
    /// Terminal failures since the last terminal success.
    #[serde(default)]
    pub consecutive_failures: u32,
    /// A delayed admission pass is queued. At most one is outstanding.
    #[serde(default)]
    pub follow_up_scheduled: bool,
    /// Unix timestamp (seconds) when this deployment was created.
    pub created_at: u64,
    /// Set on the first transition to `running`.
    #[serde(default)]
    pub started_at: Option<u64>,
    /// Set on the transition to `completed`.
    #[serde(default)]
    pub completed_at: Option<u64>,
    /// Unix timestamp (seconds) of the last change.
    pub updated_at: u64,
}

impl Deployment {
    /// Create a new `pending` deployment.
    pub fn new(
        id: impl Into<DeploymentId>,
        org_id: impl Into<OrgId>,
        name: impl Into<String>,
        payload: Payload,
        rollout: RolloutConfig,
    ) -> Self {
        let now = epoch_secs();
        Self {
            id: id.into(),
            org_id: org_id.into(),
            name: name.into(),
            payload,
            rollout,
            status: DeploymentStatus::Pending,
            pause_reason: None,
            consecutive_failures: 0,
            follow_up_scheduled: false,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Build the key for the deployments table.
    pub fn table_key(&self) -> &str {
        &self.id
    }
}

/// Lifecycle status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Completed,
    Paused,
    Cancelled,
}

impl DeploymentStatus {
    /// Whether the controller may still admit devices.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Whether no new device attempts may start.
    pub fn is_halted(self) -> bool {
        matches!(self, Self::Paused | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Payload ────────────────────────────────────────────────────────

/// The unit of work applied to every device of a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Script {
        script_id: String,
        #[serde(default)]
        parameters: BTreeMap<String, String>,
        /// Script runtime limit; the executor adds a buffer on top.
        #[serde(default)]
        timeout_seconds: Option<u32>,
    },
    Patch {
        patch_ids: Vec<String>,
    },
    Software {
        package_id: String,
        action: SoftwareAction,
    },
    Policy {
        policy_id: String,
    },
}

impl Payload {
    /// Remote command type issued for this payload.
    pub fn command_type(&self) -> &'static str {
        match self {
            Self::Script { .. } => "script",
            Self::Patch { .. } => "install_patches",
            Self::Software { action, .. } => match action {
                SoftwareAction::Install => "software_install",
                SoftwareAction::Uninstall => "software_uninstall",
                SoftwareAction::Update => "software_update",
            },
            Self::Policy { .. } => "enforce_policy",
        }
    }
}

/// What to do with a software package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoftwareAction {
    Install,
    Uninstall,
    Update,
}

// ── Rollout configuration ─────────────────────────────────────────

/// How a deployment is rolled out across its batches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutConfig {
    #[serde(rename = "type")]
    pub kind: RolloutKind,
    /// Required when `kind` is `staggered`.
    #[serde(default)]
    pub staggered: Option<StaggeredConfig>,
    #[serde(default)]
    pub respect_maintenance_windows: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub failure_threshold: FailureThreshold,
    #[serde(default)]
    pub retry_backoff: RetryBackoff,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            kind: RolloutKind::Immediate,
            staggered: None,
            respect_maintenance_windows: false,
            max_retries: default_max_retries(),
            failure_threshold: FailureThreshold::default(),
            retry_backoff: RetryBackoff::default(),
        }
    }
}

impl RolloutConfig {
    /// Immediate rollout with default retry and threshold settings.
    pub fn immediate() -> Self {
        Self::default()
    }

    /// Staggered rollout delaying each batch by `batch_delay_minutes`.
    pub fn staggered(batch_delay_minutes: u32) -> Self {
        Self {
            kind: RolloutKind::Staggered,
            staggered: Some(StaggeredConfig {
                batch_delay_minutes,
            }),
            ..Self::default()
        }
    }

    /// Delay before the next batch admission, for staggered rollouts.
    ///
    /// A staggered config without a `staggered` section falls back to no delay.
    pub fn batch_delay(&self) -> Option<Duration> {
        match self.kind {
            RolloutKind::Immediate => None,
            RolloutKind::Staggered => {
                let minutes = self
                    .staggered
                    .as_ref()
                    .map(|s| s.batch_delay_minutes)
                    .unwrap_or(0);
                Some(Duration::from_secs(u64::from(minutes) * 60))
            }
        }
    }
}

/// Rollout pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutKind {
    Immediate,
    Staggered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaggeredConfig {
    pub batch_delay_minutes: u32,
}

/// When to auto-pause a deployment because too many devices failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum FailureThreshold {
    /// Never auto-pause.
    #[default]
    None,
    /// Pause once `max_failures` devices have terminally failed.
    Count { max_failures: u32 },
    /// Pause once the failure percentage among finished devices reaches
    /// `percent`, after at least `min_samples` devices finished.
    Rate { percent: u32, min_samples: u32 },
    /// Pause after `count` terminal failures in a row.
    Consecutive { count: u32 },
}

/// Exponential backoff parameters for device retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBackoff {
    pub base_secs: u64,
    pub multiplier: u32,
    pub max_secs: u64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base_secs: 30,
            multiplier: 2,
            max_secs: 900,
        }
    }
}

// ── Device assignment ─────────────────────────────────────────────

/// Composite key of a device assignment row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceKey {
    pub deployment_id: DeploymentId,
    pub batch_number: u32,
    pub device_id: DeviceId,
}

impl DeviceKey {
    pub fn new(deployment_id: &str, batch_number: u32, device_id: &str) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            batch_number,
            device_id: device_id.to_string(),
        }
    }

    /// Build the composite key for the devices table.
    pub fn table_key(&self) -> String {
        format!(
            "{}/{:010}/{}",
            self.deployment_id, self.batch_number, self.device_id
        )
    }

    /// Key prefix shared by every device of a deployment.
    pub fn deployment_prefix(deployment_id: &str) -> String {
        format!("{deployment_id}/")
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}:{}",
            self.deployment_id, self.batch_number, self.device_id
        )
    }
}

/// One (deployment, device) assignment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentDevice {
    pub deployment_id: DeploymentId,
    pub device_id: DeviceId,
    /// Positive; defines admission order.
    pub batch_number: u32,
    pub status: DeviceStatus,
    /// Retries granted so far. Never decremented.
    pub retry_count: u32,
    /// A pending row already owned by a queued unit of work.
    #[serde(default)]
    pub dispatched: bool,
    #[serde(default)]
    pub last_result: Option<ExecutionResult>,
    #[serde(default)]
    pub skip_reason: Option<String>,
    #[serde(default)]
    pub started_at: Option<u64>,
    #[serde(default)]
    pub finished_at: Option<u64>,
    pub updated_at: u64,
}

impl DeploymentDevice {
    /// Create a new `pending` assignment.
    pub fn new(deployment_id: &str, device_id: &str, batch_number: u32) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            device_id: device_id.to_string(),
            batch_number,
            status: DeviceStatus::Pending,
            retry_count: 0,
            dispatched: false,
            last_result: None,
            skip_reason: None,
            started_at: None,
            finished_at: None,
            updated_at: epoch_secs(),
        }
    }

    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(&self.deployment_id, self.batch_number, &self.device_id)
    }

    /// Build the composite key for the devices table.
    pub fn table_key(&self) -> String {
        self.key().table_key()
    }

    /// Move to a terminal status, recording the finish time.
    pub fn finish(&mut self, status: DeviceStatus, result: Option<ExecutionResult>) {
        let now = epoch_secs();
        self.status = status;
        self.dispatched = false;
        if result.is_some() {
            self.last_result = result;
        }
        self.finished_at = Some(now);
        self.updated_at = now;
    }
}

/// Lifecycle status of a device assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl DeviceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Execution result ──────────────────────────────────────────────

/// Outcome of one payload-execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// A failed attempt carrying only an error message.
    pub fn failure(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            exit_code: None,
            output: None,
            error: Some(error.into()),
            duration_ms,
        }
    }
}

// ── Progress ──────────────────────────────────────────────────────

/// Device counts per status for one deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentProgress {
    pub total: u32,
    pub pending: u32,
    pub running: u32,
    pub completed: u32,
    pub failed: u32,
    pub skipped: u32,
}

impl DeploymentProgress {
    /// Count one device.
    pub fn record(&mut self, status: DeviceStatus) {
        self.total += 1;
        match status {
            DeviceStatus::Pending => self.pending += 1,
            DeviceStatus::Running => self.running += 1,
            DeviceStatus::Completed => self.completed += 1,
            DeviceStatus::Failed => self.failed += 1,
            DeviceStatus::Skipped => self.skipped += 1,
        }
    }

    pub fn terminal(&self) -> u32 {
        self.completed + self.failed + self.skipped
    }

    /// No device is pending or running.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}

/// Result of an admission scan: the current batch and its ready rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdmissionPage {
    /// Lowest batch with open devices; `None` when every device is terminal.
    pub batch: Option<u32>,
    /// Pending rows of `batch` not yet owned by a unit of work.
    pub ready: Vec<DeploymentDevice>,
    /// Rows of `batch` seen running or already dispatched.
    pub in_flight: u32,
}

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
