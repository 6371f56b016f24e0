//! Error types for the fleetgrid state store.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

/// Failures of the deployment state store.
///
/// Backend errors carry redb's message; the two `*NotFound` variants are
/// returned by conditional updates whose target row does not exist.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open state store: {0}")]
    Open(String),

    #[error("state store transaction failed: {0}")]
    Transaction(String),

    #[error("cannot open state table: {0}")]
    Table(String),

    #[error("cannot read state row: {0}")]
    Read(String),

    #[error("cannot write state row: {0}")]
    Write(String),

    #[error("cannot encode state row: {0}")]
    Serialize(String),

    #[error("corrupt state row: {0}")]
    Deserialize(String),

    #[error("deployment {0} does not exist")]
    DeploymentNotFound(String),

    #[error("device row {0} does not exist")]
    DeviceNotFound(String),
}
