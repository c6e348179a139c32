use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cluster;
mod config;
mod ls;
mod readiness;
mod spinner;

use cluster::{OverrideArgs, ReadyArgs};

#[derive(Parser, Debug)]
#[command(name = "gpufleet")]
#[command(about = "gpufleet - A CLI tool for bringing GPU clusters up and down on Compute Engine")]
struct Args {
    /// Path to the config file
    #[arg(long, global = true, default_value = config::CONFIG_PATH)]
    config: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record a new cluster
    Create {
        /// Name of the cluster
        name: String,
        #[arg(short, long)]
        nodes: usize,
        /// Start the cluster right away
        #[arg(long)]
        start: bool,
        #[command(flatten)]
        overrides: OverrideArgs,
        #[command(flatten)]
        ready: ReadyArgs,
    },
    /// Start a cluster, creating missing nodes and network resources
    Start {
        /// Name of the cluster
        name: String,
        /// Node count; defaults to the recorded count
        #[arg(short, long)]
        nodes: Option<usize>,
        #[command(flatten)]
        overrides: OverrideArgs,
        #[command(flatten)]
        ready: ReadyArgs,
    },
    /// Stop a cluster, or delete it with its network resources
    Stop {
        /// Name of the cluster
        name: String,
        /// Delete the nodes, firewall rules, subnetwork and network
        #[arg(long)]
        delete: bool,
        /// Keep boot disks when deleting
        #[arg(long)]
        keep_disks: bool,
    },
    /// Change the run limit of a stopped cluster
    Update {
        /// Name of the cluster
        name: String,
        /// New run limit in hours
        #[arg(long)]
        max_hours: u32,
    },
    /// Show clusters from local state, or one cluster live from the provider
    Status {
        /// Cluster to show live
        name: Option<String>,
        /// Include deleted clusters
        #[arg(long, global = true)]
        all: bool,
        /// Print JSON instead of tables
        #[arg(long, global = true)]
        json: bool,
        #[command(subcommand)]
        action: Option<StatusAction>,
    },
}

#[derive(Subcommand, Debug)]
enum StatusAction {
    /// Reconcile local state with the provider, then show it
    Sync,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,gpufleet=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let args = Args::parse();

    let config = match config::parse_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let result = match args.command {
        Commands::Create { name, nodes, start, overrides, ready } => {
            cluster::handle_create_cluster(config, name, nodes, start, overrides, ready).await
        }
        Commands::Start { name, nodes, overrides, ready } => {
            cluster::handle_start_cluster(config, name, nodes, overrides, ready).await
        }
        Commands::Stop { name, delete, keep_disks } => {
            cluster::handle_stop_cluster(config, name, delete, keep_disks).await
        }
        Commands::Update { name, max_hours } => {
            cluster::handle_update_cluster(config, name, max_hours).await
        }
        Commands::Status { name, all, json, action } => match (action, name) {
            (Some(StatusAction::Sync), _) => cluster::handle_status_sync(config, all, json).await,
            (None, Some(name)) => cluster::handle_status_cluster(config, name, json).await,
            (None, None) => cluster::handle_status(config, all, json),
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
