//! stratusd: the Stratus control plane daemon.
//!
//! Single binary that assembles the lifecycle subsystems:
//! - Application store (redb)
//! - Instance ledger, node registry and stats sweep
//! - Dispatch observer and staging orchestrator
//! - Health signal respondent
//! - Autoscale trigger
//!
//! # Usage
//!
//! ```text
//! stratusd run --config /etc/stratus/stratus.toml --data-dir /var/lib/stratus
//! stratusd run --bus-addr 0.0.0.0:4222
//! stratusd config --config /etc/stratus/stratus.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use stratus_core::ControlPlaneConfig;

const DEFAULT_LOG_FILTER: &str = "info,stratusd=debug,stratus=debug";

#[derive(Parser)]
#[command(name = "stratusd", about = "Stratus control plane daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane until interrupted.
    Run {
        /// Path to stratus.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for the application store.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Identifier of this control-plane node.
        #[arg(long)]
        node_id: Option<String>,

        /// Bus address to listen on or connect to, per `daemon.bus`.
        #[arg(long)]
        bus_addr: Option<String>,

        /// Disable the autoscale policy; scale-up signals are dropped.
        #[arg(long)]
        no_autoscale: bool,
    },

    /// Print the effective configuration and exit.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::Run {
            config,
            data_dir,
            node_id,
            bus_addr,
            no_autoscale,
        } => {
            let mut config = load_config(config)?;
            if let Some(data_dir) = data_dir {
                config.daemon.data_dir = data_dir;
            }
            if let Some(node_id) = node_id {
                config.daemon.node_id = node_id;
            }
            if let Some(bus_addr) = bus_addr {
                config.daemon.bus_addr = bus_addr;
            }
            if no_autoscale {
                config.autoscale.enabled = false;
            }
            stratusd::run_control_plane(config).await
        }
        Command::Config { config } => {
            let config = load_config(config)?;
            config.validate()?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<ControlPlaneConfig> {
    match path {
        Some(path) => Ok(ControlPlaneConfig::from_file(&path)?),
        None => Ok(ControlPlaneConfig::default()),
    }
}
