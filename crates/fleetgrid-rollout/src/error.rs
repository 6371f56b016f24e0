//! Rollout engine error types.

use fleetgrid_state::{DeploymentStatus, StateError};
use thiserror::Error;

/// Errors that can occur while driving a rollout.
///
/// Device-level failures are not errors: they end up in the device row's
/// `last_result`. These variants abort one unit of work and are retried by
/// the work queue.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("deployment {id} is {status}, expected pending")]
    NotStartable { id: String, status: DeploymentStatus },

    #[error("work queue is not running")]
    QueueStopped,

    #[error("remote command channel error: {0}")]
    Channel(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type RolloutResult<T> = Result<T, RolloutError>;
