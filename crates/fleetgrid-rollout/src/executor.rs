//! Payload executor: one remote command per attempt, polled to an outcome.
//!
//! Each payload variant maps to one command type with its own timeout and
//! poll interval. The poll loop sleeps between reads, so a long-running
//! patch install occupies a task, not a thread.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, warn};

use fleetgrid_state::{ExecutionResult, Payload};

use crate::channel::{CommandChannel, CommandStatus, RemoteCommand};
use crate::config::ExecutorConfig;
use crate::error::{RolloutError, RolloutResult};

/// How a finished command is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessRule {
    /// The remote exit code must be 0.
    ExitCodeZero,
    /// The agent's own `success` flag decides.
    ReportedSuccess,
}

/// Timing and judgement for one payload variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPlan {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub success_rule: SuccessRule,
}

/// Issues payload commands and waits for their outcome.
pub struct PayloadExecutor {
    channel: Arc<dyn CommandChannel>,
    config: ExecutorConfig,
}

impl PayloadExecutor {
    pub fn new(channel: Arc<dyn CommandChannel>, config: ExecutorConfig) -> Self {
        Self { channel, config }
    }

    /// Timeout, poll interval, and success rule for a payload.
    pub fn plan(&self, payload: &Payload) -> CommandPlan {
        let cfg = &self.config;
        let (timeout_secs, poll_ms, success_rule) = match payload {
            Payload::Script {
                timeout_seconds, ..
            } => {
                let script_secs = timeout_seconds
                    .map(u64::from)
                    .unwrap_or(cfg.script_default_timeout_secs);
                (
                    script_secs.saturating_add(cfg.script_timeout_buffer_secs),
                    cfg.script_poll_ms,
                    SuccessRule::ExitCodeZero,
                )
            }
            Payload::Patch { .. } => (
                cfg.patch_timeout_secs,
                cfg.patch_poll_ms,
                SuccessRule::ReportedSuccess,
            ),
            Payload::Software { .. } => (
                cfg.software_timeout_secs,
                cfg.software_poll_ms,
                SuccessRule::ReportedSuccess,
            ),
            Payload::Policy { .. } => (
                cfg.policy_timeout_secs,
                cfg.policy_poll_ms,
                SuccessRule::ReportedSuccess,
            ),
        };
        CommandPlan {
            timeout: Duration::from_secs(timeout_secs),
            poll_interval: Duration::from_millis(poll_ms.max(1)),
            success_rule,
        }
    }

    /// Run one attempt of `payload` on a device.
    ///
    /// Remote failures, vanished commands, and timeouts come back as a
    /// failed `ExecutionResult`. Only a refused `create_command` is
    /// returned as `Err`; a failed read is a missed poll.
    pub async fn execute(
        &self,
        device_id: &str,
        payload: &Payload,
    ) -> RolloutResult<ExecutionResult> {
        let plan = self.plan(payload);
        let started = Instant::now();
        let deadline = started + plan.timeout;

        let command_id = self
            .channel
            .create_command(device_id, payload.command_type(), command_payload(payload))
            .await
            .map_err(RolloutError::Channel)?;
        debug!(
            device = %device_id,
            command = %command_id,
            command_type = payload.command_type(),
            timeout_secs = plan.timeout.as_secs(),
            "command issued"
        );

        loop {
            match self.channel.get_command(&command_id).await {
                Ok(None) => {
                    warn!(device = %device_id, command = %command_id, "command record vanished");
                    return Ok(ExecutionResult::failure(
                        "Command not found",
                        elapsed_ms(started),
                    ));
                }
                Ok(Some(command)) if command.status.is_terminal() => {
                    let result = self.judge(&plan, command, elapsed_ms(started));
                    debug!(
                        device = %device_id,
                        command = %command_id,
                        success = result.success,
                        duration_ms = result.duration_ms,
                        "command finished"
                    );
                    return Ok(result);
                }
                Ok(Some(_)) => {}
                // The command may still be running remotely; only the
                // deadline ends this attempt.
                Err(e) => warn!(
                    device = %device_id,
                    command = %command_id,
                    error = %e,
                    "command read failed, polling again"
                ),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    device = %device_id,
                    command = %command_id,
                    timeout_secs = plan.timeout.as_secs(),
                    "command timed out"
                );
                return Ok(ExecutionResult::failure(
                    "Command timed out",
                    elapsed_ms(started),
                ));
            }
            tokio::time::sleep(plan.poll_interval.min(deadline - now)).await;
        }
    }

    /// Turn a terminal remote command into an execution result.
    fn judge(
        &self,
        plan: &CommandPlan,
        command: RemoteCommand,
        duration_ms: u64,
    ) -> ExecutionResult {
        let result = command.result.unwrap_or_default();
        let success = command.status == CommandStatus::Completed
            && match plan.success_rule {
                SuccessRule::ExitCodeZero => result.exit_code == Some(0),
                SuccessRule::ReportedSuccess => result.success,
            };

        let error = if success {
            None
        } else {
            Some(
                result
                    .error
                    .clone()
                    .filter(|e| !e.is_empty())
                    .or_else(|| result.stderr.clone().filter(|e| !e.is_empty()))
                    .unwrap_or_else(|| match (command.status, result.exit_code) {
                        (CommandStatus::Completed, Some(code)) => {
                            format!("Command exited with code {code}")
                        }
                        _ => "Command failed".to_string(),
                    }),
            )
        };

        ExecutionResult {
            success,
            exit_code: result.exit_code,
            output: self.collect_output(result.stdout, result.stderr),
            error,
            duration_ms,
        }
    }

    fn collect_output(&self, stdout: Option<String>, stderr: Option<String>) -> Option<String> {
        let mut output = match (stdout, stderr) {
            (None, None) => return None,
            (Some(out), None) => out,
            (None, Some(err)) => err,
            (Some(out), Some(err)) if err.is_empty() => out,
            (Some(out), Some(err)) => format!("{out}\n--- stderr ---\n{err}"),
        };
        truncate_at_char_boundary(&mut output, self.config.max_output_bytes);
        Some(output)
    }
}

/// Command body sent to the agent for a payload.
fn command_payload(payload: &Payload) -> serde_json::Value {
    match payload {
        Payload::Script {
            script_id,
            parameters,
            timeout_seconds,
        } => json!({
            "scriptId": script_id,
            "parameters": parameters,
            "timeoutSeconds": timeout_seconds,
        }),
        Payload::Patch { patch_ids } => json!({ "patchIds": patch_ids }),
        Payload::Software { package_id, .. } => json!({ "packageId": package_id }),
        Payload::Policy { policy_id } => json!({ "policyId": policy_id }),
    }
}

fn truncate_at_char_boundary(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
