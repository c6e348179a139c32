use gpufleet_core::instance::SshKey;
use gpufleet_core::operation::Cancellation;
use gpufleet_core::readiness::DEFAULT_READY_TIMEOUT;
use gpufleet_core::state::{ClusterRecord, StateDocument};
use gpufleet_core::{ClusterOrchestrator, ClusterOverrides, FleetConfig, StateStore};
use gpufleet_google::{Credentials, GoogleCompute};
use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use crate::ls;
use crate::readiness::HttpReadiness;
use crate::spinner::SpinnerProgress;

pub type CliResult = Result<(), Box<dyn Error>>;

/// Per-cluster settings given on the command line. Unset flags fall back to
/// what the cluster was recorded with, then to the config.
#[derive(clap::Args, Debug, Default, Clone)]
pub struct OverrideArgs {
    /// Machine type, e.g. "a2-highgpu-1g"
    #[arg(long)]
    pub machine_type: Option<String>,
    /// Boot disk size in GB
    #[arg(long)]
    pub disk_size_gb: Option<u32>,
    /// What happens when the run limit is reached: STOP or DELETE
    #[arg(long)]
    pub termination_action: Option<String>,
    /// Run limit in hours
    #[arg(long)]
    pub max_hours: Option<u32>,
    /// Create boot disks that survive instance deletion
    #[arg(long)]
    pub keep_disks: bool,
}

impl OverrideArgs {
    pub fn is_empty(&self) -> bool {
        self.machine_type.is_none()
            && self.disk_size_gb.is_none()
            && self.termination_action.is_none()
            && self.max_hours.is_none()
            && !self.keep_disks
    }

    pub fn apply(&self, base: ClusterOverrides) -> ClusterOverrides {
        ClusterOverrides {
            machine_type: self.machine_type.clone().or(base.machine_type),
            disk_size_gb: self.disk_size_gb.or(base.disk_size_gb),
            termination_action: self.termination_action.clone().or(base.termination_action),
            max_run_hours: self.max_hours.or(base.max_run_hours),
            keep_disks: self.keep_disks || base.keep_disks,
        }
    }
}

/// Waiting for first-boot setup after a start.
#[derive(clap::Args, Debug, Clone)]
pub struct ReadyArgs {
    /// Wait until the entry node reports that setup finished
    #[arg(long)]
    pub wait_ready: bool,
    /// How long to wait for readiness, e.g. "20m"
    #[arg(long, value_parser = humantime::parse_duration, default_value = "15m")]
    pub ready_timeout: Duration,
}

impl Default for ReadyArgs {
    fn default() -> Self {
        Self {
            wait_ready: false,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

async fn wait_if_asked(orchestrator: &ClusterOrchestrator, name: &str, ready: &ReadyArgs) -> CliResult {
    if !ready.wait_ready {
        return Ok(());
    }
    let checker = HttpReadiness::new()?;
    orchestrator.wait_until_ready(name, &checker, ready.ready_timeout).await?;
    println!("Cluster {} is ready.", name);
    Ok(())
}

/// Ctrl-C stops local waits; operations already issued keep running remotely.
fn ctrl_c_cancellation() -> Cancellation {
    let (tx, cancel) = Cancellation::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, remote operations already issued will still complete");
            let _ = tx.send(true);
        }
    });
    cancel
}

fn build_orchestrator(config: FleetConfig) -> Result<ClusterOrchestrator, Box<dyn Error>> {
    let region = config.region()?;
    let compute = GoogleCompute::new(
        &config.project.id,
        &config.project.zone,
        region,
        Credentials::from_env(),
    );
    let store = StateStore::new(config.state_dir()?);
    let user_data = config.bootstrap.render()?;
    let ssh_key = SshKey::from_config(&config.ssh)?;

    Ok(ClusterOrchestrator::new(Arc::new(compute), config, store)
        .with_progress(Arc::new(SpinnerProgress::new()))
        .with_cancellation(ctrl_c_cancellation())
        .with_user_data(user_data)
        .with_ssh_key(ssh_key))
}

pub async fn handle_create_cluster(
    config: FleetConfig,
    name: String,
    nodes: usize,
    start: bool,
    overrides: OverrideArgs,
    ready: ReadyArgs,
) -> CliResult {
    let orchestrator = build_orchestrator(config)?;
    let overrides = overrides.apply(ClusterOverrides::default());
    orchestrator.create_cluster(&name, nodes, &overrides)?;
    if !start {
        println!("Cluster {} recorded with {} nodes. Run `gpufleet start {}` to bring it up.", name, nodes, name);
        return Ok(());
    }
    orchestrator.start_cluster(&name, nodes, &overrides).await?;
    println!("Cluster {} started.", name);
    wait_if_asked(&orchestrator, &name, &ready).await
}

pub async fn handle_start_cluster(
    config: FleetConfig,
    name: String,
    nodes: Option<usize>,
    overrides: OverrideArgs,
    ready: ReadyArgs,
) -> CliResult {
    let orchestrator = build_orchestrator(config)?;
    if nodes.is_none() && overrides.is_empty() {
        orchestrator.start_recorded_cluster(&name).await?;
    } else {
        let recorded = orchestrator.store().load()?.cluster(&name).cloned();
        let count = nodes
            .or_else(|| recorded.as_ref().map(|r| r.num_instances).filter(|n| *n > 0))
            .ok_or_else(|| format!("Cluster '{}' not found in state, pass --nodes", name))?;
        let base = recorded.map(|r| r.overrides).unwrap_or_default();
        orchestrator
            .start_cluster(&name, count, &overrides.apply(base))
            .await?;
    }
    println!("Cluster {} started.", name);
    wait_if_asked(&orchestrator, &name, &ready).await
}

pub async fn handle_stop_cluster(config: FleetConfig, name: String, delete: bool, keep_disks: bool) -> CliResult {
    let orchestrator = build_orchestrator(config)?;
    orchestrator.stop_cluster(&name, delete, keep_disks).await?;
    if delete {
        println!("Cluster {} deleted.", name);
    } else {
        println!("Cluster {} stopped.", name);
    }
    Ok(())
}

pub async fn handle_update_cluster(config: FleetConfig, name: String, max_hours: u32) -> CliResult {
    let orchestrator = build_orchestrator(config)?;
    orchestrator.update_cluster(&name, max_hours).await?;
    println!("Cluster {} run limit set to {}h.", name, max_hours);
    Ok(())
}

/// Show what the local state knows, without contacting the provider.
pub fn handle_status(config: FleetConfig, all: bool, json: bool) -> CliResult {
    let doc = StateStore::new(config.state_dir()?).load()?;
    print_document(&doc, all, json)
}

pub async fn handle_status_sync(config: FleetConfig, all: bool, json: bool) -> CliResult {
    let orchestrator = build_orchestrator(config)?;
    let (doc, report) = orchestrator.sync_status().await?;
    if !json {
        for name in &report.deleted {
            println!("Cluster {} no longer exists remotely, marked deleted.", name);
        }
        for name in &report.never_started {
            println!("Cluster {} was never started.", name);
        }
    }
    print_document(&doc, all, json)
}

/// Live view of one cluster straight from the provider.
pub async fn handle_status_cluster(config: FleetConfig, name: String, json: bool) -> CliResult {
    let orchestrator = build_orchestrator(config)?;
    let instances = orchestrator.show_cluster(&name).await?;
    if json {
        let value = serde_json::to_value(&instances)?;
        println!("{}", colored_json::to_colored_json_auto(&value)?);
    } else {
        ls::print_live_cluster(&name, &instances);
    }
    Ok(())
}

fn print_document(doc: &StateDocument, all: bool, json: bool) -> CliResult {
    if !json {
        ls::print_status(doc, all);
        return Ok(());
    }
    let clusters: BTreeMap<&str, &ClusterRecord> = ls::visible_clusters(doc, all)
        .into_iter()
        .map(|cluster| (cluster.name.as_str(), cluster))
        .collect();
    let value = serde_json::to_value(&clusters)?;
    println!("{}", colored_json::to_colored_json_auto(&value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_the_record() {
        let recorded = ClusterOverrides {
            machine_type: Some("g2-standard-8".to_string()),
            max_run_hours: Some(4),
            ..Default::default()
        };
        let flags = OverrideArgs {
            max_hours: Some(12),
            ..Default::default()
        };
        let merged = flags.apply(recorded);
        assert_eq!(merged.machine_type.as_deref(), Some("g2-standard-8"));
        assert_eq!(merged.max_run_hours, Some(12));
        assert!(!merged.keep_disks);
    }

    #[test]
    fn readiness_wait_is_opt_in() {
        let ready = ReadyArgs::default();
        assert!(!ready.wait_ready);
        assert_eq!(ready.ready_timeout, Duration::from_secs(15 * 60));
    }

    #[test]
    fn no_flags_is_empty() {
        assert!(OverrideArgs::default().is_empty());
        let flags = OverrideArgs {
            keep_disks: true,
            ..Default::default()
        };
        assert!(!flags.is_empty());
    }

    #[test]
    fn status_reads_local_state_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store
            .record_cluster_create("alpha", "default", 2, &ClusterOverrides::default(), chrono::Utc::now())
            .unwrap();
        let config = FleetConfig {
            state_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        handle_status(config, false, true).unwrap();
    }
}
