//! Collaborator contracts the engine is injected with.
//!
//! - [`CommandChannel`]: creates remote commands and reads their state.
//! - [`MaintenanceGate`]: answers whether a device may receive disruptive work now.
//! - [`PauseNotifier`]: receives a [`PauseEvent`] when a deployment auto-pauses.
//!
//! The traits return boxed `Send` futures so they stay object-safe and can
//! be shared as `Arc<dyn …>` across tasks. Errors are plain strings: the
//! engine records them on the device row rather than matching on them.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Boxed future alias for collaborator calls.
pub type ChannelFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send + 'a>>;

/// Identifier of a command issued to a device agent.
pub type CommandId = String;

/// Remote state of an issued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Sent,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// What the agent reported for a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A command record as read back from the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCommand {
    pub id: CommandId,
    pub status: CommandStatus,
    #[serde(default)]
    pub result: Option<CommandResult>,
}

/// Channel to device agents. Injected for testability.
pub trait CommandChannel: Send + Sync {
    /// Queue a command for a device and return its ID.
    fn create_command<'a>(
        &'a self,
        device_id: &'a str,
        command_type: &'a str,
        payload: serde_json::Value,
    ) -> ChannelFuture<'a, CommandId>;

    /// Read a command's current state. `None` if the record no longer exists.
    fn get_command<'a>(&'a self, command_id: &'a str) -> ChannelFuture<'a, Option<RemoteCommand>>;
}

/// Maintenance window resolver.
pub trait MaintenanceGate: Send + Sync {
    /// Whether disruptive operations may run on the device right now.
    fn is_eligible<'a>(&'a self, device_id: &'a str) -> ChannelFuture<'a, bool>;
}

/// Gate for fleets without maintenance windows.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysEligible;

impl MaintenanceGate for AlwaysEligible {
    fn is_eligible<'a>(&'a self, _device_id: &'a str) -> ChannelFuture<'a, bool> {
        Box::pin(async { Ok(true) })
    }
}

/// Emitted once when a deployment is auto-paused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseEvent {
    pub deployment_id: String,
    pub deployment_name: String,
    pub org_id: String,
    pub reason: String,
}

/// Receiver of pause events. Delivery and formatting are its business.
pub trait PauseNotifier: Send + Sync {
    fn notify<'a>(&'a self, event: PauseEvent) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Forwards pause events into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<PauseEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PauseEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PauseNotifier for ChannelNotifier {
    fn notify<'a>(&'a self, event: PauseEvent) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if let Err(e) = self.tx.send(event) {
                warn!(deployment = %e.0.deployment_id, "pause event receiver dropped");
            }
        })
    }
}

/// Logs pause events and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl PauseNotifier for LogNotifier {
    fn notify<'a>(&'a self, event: PauseEvent) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            info!(
                deployment = %event.deployment_id,
                name = %event.deployment_name,
                org = %event.org_id,
                reason = %event.reason,
                "deployment paused"
            );
        })
    }
}
