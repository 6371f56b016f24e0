//! fleetctl: operator CLI for the Fleetgrid rollout engine.
//!
//! Reads the engine's state store directly; it never schedules work.
//!
//! ```text
//! fleetctl --data-dir /var/lib/fleetgrid deployments
//! fleetctl progress dep-42
//! fleetctl devices dep-42 --status failed --format json
//! fleetctl check-config /etc/fleetgrid/engine.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use fleetgrid_state::DeviceStatus;

mod commands;

#[derive(Parser)]
#[command(
    name = "fleetctl",
    about = "Fleetgrid: inspect deployment rollouts",
    version,
    propagate_version = true
)]
struct Cli {
    /// Data directory holding the engine's state store.
    #[arg(long, global = true, default_value = "/var/lib/fleetgrid")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List deployments with their status
    Deployments {
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },
    /// Show device counts per status for a deployment
    Progress {
        deployment_id: String,
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },
    /// List a deployment's devices in batch order
    Devices {
        deployment_id: String,
        /// Only show devices in this status
        #[arg(short, long, value_enum)]
        status: Option<StatusFilter>,
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },
    /// Validate an engine config file and print it with defaults filled in
    CheckConfig { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusFilter {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl From<StatusFilter> for DeviceStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Pending => DeviceStatus::Pending,
            StatusFilter::Running => DeviceStatus::Running,
            StatusFilter::Completed => DeviceStatus::Completed,
            StatusFilter::Failed => DeviceStatus::Failed,
            StatusFilter::Skipped => DeviceStatus::Skipped,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,fleetctl=debug,fleetgrid=debug")
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Deployments { format } => commands::inspect::deployments(&cli.data_dir, format),
        Commands::Progress {
            deployment_id,
            format,
        } => commands::inspect::progress(&cli.data_dir, &deployment_id, format),
        Commands::Devices {
            deployment_id,
            status,
            format,
        } => commands::inspect::devices(
            &cli.data_dir,
            &deployment_id,
            status.map(DeviceStatus::from),
            format,
        ),
        Commands::CheckConfig { path } => commands::config::check(&path),
    }
}
