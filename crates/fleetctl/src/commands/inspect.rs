//! Read-only views over the state store.

use std::path::Path;

use anyhow::{bail, Context};
use fleetgrid_state::{Deployment, DeploymentDevice, DeploymentProgress, DeviceStatus, StateStore};
use tracing::debug;

use crate::Format;

const DB_FILE: &str = "fleetgrid.redb";

fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    let path = data_dir.join(DB_FILE);
    if !path.exists() {
        bail!("no state store at {}", path.display());
    }
    debug!(path = ?path, "opening state store");
    StateStore::open(&path).with_context(|| format!("failed to open {}", path.display()))
}

pub fn deployments(data_dir: &Path, format: Format) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    let deployments = store.list_deployments()?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&deployments)?),
        Format::Text => {
            if deployments.is_empty() {
                println!("no deployments");
            }
            for deployment in &deployments {
                println!("{}", deployment_line(deployment));
            }
        }
    }
    Ok(())
}

pub fn progress(data_dir: &Path, deployment_id: &str, format: Format) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    let Some(deployment) = store.get_deployment(deployment_id)? else {
        bail!("deployment {deployment_id} not found");
    };
    let progress = store.deployment_progress(deployment_id)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&progress)?),
        Format::Text => {
            println!("{}", deployment_line(&deployment));
            println!("{}", progress_line(&progress));
            if let Some(reason) = &deployment.pause_reason {
                println!("paused: {reason}");
            }
        }
    }
    Ok(())
}

pub fn devices(
    data_dir: &Path,
    deployment_id: &str,
    status: Option<DeviceStatus>,
    format: Format,
) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    if store.get_deployment(deployment_id)?.is_none() {
        bail!("deployment {deployment_id} not found");
    }
    let devices: Vec<DeploymentDevice> = match status {
        Some(status) => store.devices_with_status(deployment_id, &[status], usize::MAX)?,
        None => store.list_devices(deployment_id)?,
    };
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&devices)?),
        Format::Text => {
            for device in &devices {
                println!("{}", device_line(device));
            }
        }
    }
    Ok(())
}

fn deployment_line(deployment: &Deployment) -> String {
    format!(
        "{:<24} {:<10} {:<18} {}",
        deployment.id,
        deployment.status.as_str(),
        deployment.payload.command_type(),
        deployment.name
    )
}

fn progress_line(progress: &DeploymentProgress) -> String {
    format!(
        "{}/{} done: {} completed, {} failed, {} skipped, {} running, {} pending",
        progress.terminal(),
        progress.total,
        progress.completed,
        progress.failed,
        progress.skipped,
        progress.running,
        progress.pending
    )
}

fn device_line(device: &DeploymentDevice) -> String {
    let detail = match (&device.skip_reason, &device.last_result) {
        (Some(reason), _) => format!("skipped: {reason}"),
        (None, Some(result)) if !result.success => {
            result.error.clone().unwrap_or_else(|| "failed".to_string())
        }
        _ => String::new(),
    };
    format!(
        "batch {:<4} {:<24} {:<10} retries={} {}",
        device.batch_number,
        device.device_id,
        device.status.as_str(),
        device.retry_count,
        detail
    )
    .trim_end()
    .to_string()
}
