//! In-memory doubles for the engine's collaborators, shared by unit tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleetgrid_state::{Deployment, DeploymentDevice, Payload, RolloutConfig, StateStore};

use crate::channel::{
    ChannelFuture, CommandChannel, CommandId, CommandResult, CommandStatus, MaintenanceGate,
    PauseEvent, PauseNotifier, RemoteCommand,
};
use crate::error::{RolloutError, RolloutResult};
use crate::queue::{Job, JobQueue};

pub const DEPLOYMENT: &str = "dep-1";

// ── Queue ──────────────────────────────────────────────────────────

/// Queue that only records what was enqueued.
#[derive(Default)]
pub struct RecordingQueue {
    jobs: Mutex<Vec<(Job, Option<Duration>)>>,
    reject: AtomicBool,
}

impl RecordingQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn jobs(&self) -> Vec<(Job, Option<Duration>)> {
        self.jobs.lock().unwrap().clone()
    }

    /// Drain the recorded jobs.
    pub fn take(&self) -> Vec<(Job, Option<Duration>)> {
        std::mem::take(&mut *self.jobs.lock().unwrap())
    }

    /// Make every further `enqueue` fail.
    pub fn reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }
}

impl JobQueue for RecordingQueue {
    fn enqueue(&self, job: Job, delay: Option<Duration>) -> RolloutResult<()> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(RolloutError::QueueStopped);
        }
        self.jobs.lock().unwrap().push((job, delay));
        Ok(())
    }
}

// ── Command channel ────────────────────────────────────────────────

/// How the mock agent handles one command.
#[derive(Debug, Clone)]
pub enum Script {
    /// Report `Sent` for `polls` reads, then `Completed` with `result`.
    CompleteAfter { polls: u32, result: CommandResult },
    /// Report `Sent` for `polls` reads, then `Failed` with `error`.
    FailAfter { polls: u32, error: String },
    /// Never leave `Sent`.
    Hang,
    /// Report `Sent` for `polls` reads, then lose the record.
    VanishAfter { polls: u32 },
    /// Fail read number `failing_read`, then complete successfully after
    /// `polls` reads.
    FlakyRead { failing_read: u32, polls: u32 },
    /// Refuse to create the command.
    CreateError(String),
}

impl Script {
    pub fn succeed() -> Self {
        Self::CompleteAfter {
            polls: 0,
            result: CommandResult {
                success: true,
                exit_code: Some(0),
                stdout: Some("done".to_string()),
                ..Default::default()
            },
        }
    }

    pub fn exit(code: i32) -> Self {
        Self::CompleteAfter {
            polls: 0,
            result: CommandResult {
                success: code == 0,
                exit_code: Some(code),
                stderr: (code != 0).then(|| format!("exit {code}")),
                ..Default::default()
            },
        }
    }
}

/// Scripted command channel. Each device has a queue of scripts; every
/// `create_command` takes the next one, and the last one repeats.
#[derive(Default)]
pub struct MockChannel {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    commands: Mutex<HashMap<CommandId, (Script, u32)>>,
    created: Mutex<Vec<String>>,
    next_id: AtomicU64,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a script for `device_id`.
    pub fn script(&self, device_id: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .entry(device_id.to_string())
            .or_default()
            .push_back(script);
    }

    /// Commands created for `device_id` so far.
    pub fn created_for(&self, device_id: &str) -> usize {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.as_str() == device_id)
            .count()
    }

    fn next_script(&self, device_id: &str) -> Script {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(device_id) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap_or_else(Script::succeed),
            None => Script::succeed(),
        }
    }
}

impl CommandChannel for MockChannel {
    fn create_command<'a>(
        &'a self,
        device_id: &'a str,
        _command_type: &'a str,
        _payload: serde_json::Value,
    ) -> ChannelFuture<'a, CommandId> {
        Box::pin(async move {
            let script = self.next_script(device_id);
            if let Script::CreateError(e) = script {
                return Err(e);
            }
            self.created.lock().unwrap().push(device_id.to_string());
            let id = format!("cmd-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.commands
                .lock()
                .unwrap()
                .insert(id.clone(), (script, 0));
            Ok(id)
        })
    }

    fn get_command<'a>(&'a self, command_id: &'a str) -> ChannelFuture<'a, Option<RemoteCommand>> {
        Box::pin(async move {
            let mut commands = self.commands.lock().unwrap();
            let Some((script, reads)) = commands.get_mut(command_id) else {
                return Ok(None);
            };
            let seen = *reads;
            *reads += 1;
            if let Script::FlakyRead { failing_read, .. } = script {
                if seen == *failing_read {
                    return Err("connection reset".to_string());
                }
            }
            let sent = |id: &str| {
                Some(RemoteCommand {
                    id: id.to_string(),
                    status: CommandStatus::Sent,
                    result: None,
                })
            };
            let command = match script {
                Script::CompleteAfter { polls, result } if seen >= *polls => Some(RemoteCommand {
                    id: command_id.to_string(),
                    status: CommandStatus::Completed,
                    result: Some(result.clone()),
                }),
                Script::FailAfter { polls, error } if seen >= *polls => Some(RemoteCommand {
                    id: command_id.to_string(),
                    status: CommandStatus::Failed,
                    result: Some(CommandResult {
                        error: Some(error.clone()),
                        ..Default::default()
                    }),
                }),
                Script::VanishAfter { polls } if seen >= *polls => None,
                Script::FlakyRead { polls, .. } if seen >= *polls => Some(RemoteCommand {
                    id: command_id.to_string(),
                    status: CommandStatus::Completed,
                    result: Some(CommandResult {
                        success: true,
                        exit_code: Some(0),
                        ..Default::default()
                    }),
                }),
                _ => sent(command_id),
            };
            Ok(command)
        })
    }
}

// ── Maintenance gate ───────────────────────────────────────────────

/// Gate with a blocklist and an error switch.
#[derive(Default)]
pub struct StaticGate {
    blocked: Mutex<HashSet<String>>,
    failing: AtomicBool,
    checks: AtomicUsize,
}

impl StaticGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn block(&self, device_id: &str) {
        self.blocked.lock().unwrap().insert(device_id.to_string());
    }

    pub fn unblock(&self, device_id: &str) {
        self.blocked.lock().unwrap().remove(device_id);
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

impl MaintenanceGate for StaticGate {
    fn is_eligible<'a>(&'a self, device_id: &'a str) -> ChannelFuture<'a, bool> {
        Box::pin(async move {
            self.checks.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err("maintenance service unavailable".to_string());
            }
            Ok(!self.blocked.lock().unwrap().contains(device_id))
        })
    }
}

// ── Notifier ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<PauseEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<PauseEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl PauseNotifier for RecordingNotifier {
    fn notify<'a>(&'a self, event: PauseEvent) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            self.events.lock().unwrap().push(event);
        })
    }
}

// ── Seeding ────────────────────────────────────────────────────────

pub fn script_payload() -> Payload {
    Payload::Script {
        script_id: "script-1".to_string(),
        parameters: BTreeMap::new(),
        timeout_seconds: Some(30),
    }
}

/// Store `DEPLOYMENT` with one device row per entry of `batches`
/// (batch numbers start at 1).
pub fn seed(store: &StateStore, rollout: RolloutConfig, batches: &[&[&str]]) -> Deployment {
    let deployment =
        Deployment::new(DEPLOYMENT, "org-1", "nightly patch", script_payload(), rollout);
    store.put_deployment(&deployment).unwrap();
    let devices: Vec<DeploymentDevice> = batches
        .iter()
        .enumerate()
        .flat_map(|(i, devices)| {
            devices
                .iter()
                .map(move |device| DeploymentDevice::new(DEPLOYMENT, device, i as u32 + 1))
        })
        .collect();
    store.put_devices(&devices).unwrap();
    deployment
}
