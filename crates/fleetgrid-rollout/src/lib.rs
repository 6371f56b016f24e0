//! Fleetgrid rollout engine: pushes a payload to a fleet in batches.
//!
//! A deployment targets many devices, grouped into ordered batches. The
//! engine admits one batch at a time, runs every device of the batch as an
//! independent unit of work, retries failed devices with backoff, waits
//! out maintenance windows, and pauses the whole deployment once failures
//! cross the configured threshold.
//!
//! # Components
//!
//! - **`retry`**: pure retry/backoff decisions
//! - **`threshold`**: failure-threshold evaluation (count, rate, consecutive)
//! - **`channel`**: injected collaborators (remote commands, maintenance gate, pause notifier)
//! - **`executor`**: issues one remote command and polls it to an outcome
//! - **`queue`**: delayed, at-least-once work queue with bounded concurrency
//! - **`controller`**: deployment state machine (admission, completion, pause)
//! - **`runner`**: per-device state machine (gate, dispatch, retry or terminal)
//! - **`engine`**: wires everything together with an explicit start/stop lifecycle
//!
//! # Flow
//!
//! ```text
//! start_deployment ──▶ Admit ──▶ DeploymentController::admit_next_batch
//!                                   │ one RunDevice per ready device
//!                                   ▼
//!                       DeviceRunner::run ──▶ MaintenanceGate
//!                                   │        ──▶ PayloadExecutor ──▶ CommandChannel
//!                                   ▼
//!                       retry (delayed RunDevice) | terminal
//!                                   │
//!                                   ▼
//!                       evaluate_pause ──▶ check_completion ──▶ Admit (immediate)
//! ```
//!
//! Every state change is a conditional single-row update in the store, so
//! each job may be delivered more than once without duplicating work.

pub mod channel;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod executor;
pub mod queue;
pub mod retry;
pub mod runner;
pub mod threshold;

#[cfg(test)]
mod test_support;

pub use channel::{
    AlwaysEligible, ChannelNotifier, CommandChannel, CommandResult, CommandStatus, LogNotifier,
    MaintenanceGate, PauseEvent, PauseNotifier, RemoteCommand,
};
pub use config::{AdmissionConfig, EngineConfig, ExecutorConfig, QueueConfig};
pub use controller::{AdmitOutcome, DeploymentController};
pub use engine::RolloutEngine;
pub use error::{RolloutError, RolloutResult};
pub use executor::PayloadExecutor;
pub use queue::{Job, JobHandler, JobKind, JobQueue, LocalQueue};
pub use runner::{DeviceRunner, RunOutcome};
