//! Engine configuration, loaded from TOML.
//!
//! Every field has a default, so an empty file is a valid config:
//!
//! ```toml
//! [queue]
//! max_concurrent_controllers = 5
//! max_concurrent_devices = 10
//!
//! [admission]
//! page_size = 100
//! maintenance_wait_secs = 300
//!
//! [executor]
//! patch_timeout_secs = 1800
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RolloutError, RolloutResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub admission: AdmissionConfig,
    pub executor: ExecutorConfig,
}

/// Work queue limits and infrastructure retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Deployment-level admission jobs running at once.
    pub max_concurrent_controllers: usize,
    /// Device runner jobs running at once. Caps load on the agent channel.
    pub max_concurrent_devices: usize,
    /// Deliveries of one job before it is dropped after repeated errors.
    pub job_max_deliveries: u32,
    /// First redelivery delay; doubles on each further delivery.
    pub job_retry_base_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_controllers: 5,
            max_concurrent_devices: 10,
            job_max_deliveries: 5,
            job_retry_base_ms: 1_000,
        }
    }
}

/// Batch admission settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Devices considered per admission pass.
    pub page_size: usize,
    /// Delay before re-checking a device blocked by its maintenance window.
    pub maintenance_wait_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            maintenance_wait_secs: 300,
        }
    }
}

impl AdmissionConfig {
    pub fn maintenance_wait(&self) -> Duration {
        Duration::from_secs(self.maintenance_wait_secs)
    }
}

/// Per-payload timeouts and poll intervals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Script runtime limit when the payload does not set one.
    pub script_default_timeout_secs: u64,
    /// Added on top of the script's own timeout.
    pub script_timeout_buffer_secs: u64,
    pub script_poll_ms: u64,
    pub patch_timeout_secs: u64,
    pub patch_poll_ms: u64,
    pub software_timeout_secs: u64,
    pub software_poll_ms: u64,
    pub policy_timeout_secs: u64,
    pub policy_poll_ms: u64,
    /// Command output kept in `ExecutionResult::output`.
    pub max_output_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            script_default_timeout_secs: 300,
            script_timeout_buffer_secs: 60,
            script_poll_ms: 1_000,
            patch_timeout_secs: 30 * 60,
            patch_poll_ms: 5_000,
            software_timeout_secs: 15 * 60,
            software_poll_ms: 3_000,
            policy_timeout_secs: 10 * 60,
            policy_poll_ms: 2_000,
            max_output_bytes: 64 * 1024,
        }
    }
}

impl EngineConfig {
    /// Read, parse, and validate a TOML config file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML config text.
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> RolloutResult<()> {
        let invalid = |msg: &str| Err(RolloutError::Config(msg.to_string()));

        if self.queue.max_concurrent_controllers == 0 {
            return invalid("queue.max_concurrent_controllers must be at least 1");
        }
        if self.queue.max_concurrent_devices == 0 {
            return invalid("queue.max_concurrent_devices must be at least 1");
        }
        if self.queue.job_max_deliveries == 0 {
            return invalid("queue.job_max_deliveries must be at least 1");
        }
        if self.admission.page_size == 0 {
            return invalid("admission.page_size must be at least 1");
        }
        let polls = [
            self.executor.script_poll_ms,
            self.executor.patch_poll_ms,
            self.executor.software_poll_ms,
            self.executor.policy_poll_ms,
        ];
        if polls.contains(&0) {
            return invalid("executor poll intervals must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.queue.max_concurrent_controllers, 5);
        assert_eq!(config.queue.max_concurrent_devices, 10);
        assert_eq!(config.admission.maintenance_wait(), Duration::from_secs(300));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
[queue]
max_concurrent_devices = 25

[executor]
patch_timeout_secs = 600
"#,
        )
        .unwrap();
        assert_eq!(config.queue.max_concurrent_devices, 25);
        assert_eq!(config.queue.max_concurrent_controllers, 5);
        assert_eq!(config.executor.patch_timeout_secs, 600);
        assert_eq!(config.executor.patch_poll_ms, 5_000);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = EngineConfig::from_toml_str("[queue]\nmax_concurrent_devices = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_concurrent_devices"));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let mut config = EngineConfig::default();
        config.executor.policy_poll_ms = 0;
        assert!(matches!(config.validate(), Err(RolloutError::Config(_))));
    }

    #[test]
    fn toml_roundtrip_via_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        let mut config = EngineConfig::default();
        config.admission.page_size = 42;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = EngineConfig::from_file(&path).unwrap();
        assert_eq!(loaded.admission.page_size, 42);
    }
}
