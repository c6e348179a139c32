//! Cluster-wide lifecycle operations.
//!
//! Every operation validates its input before touching the remote, then
//! fans out one task per node and writes all outcomes back to the store in
//! a single write once every task has settled.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::compute::{ComputeClient, Instance};
use crate::config::FleetConfig;
use crate::error::{FleetError, Result};
use crate::instance::{self, InstanceController, InstanceTemplate, SshKey};
use crate::names;
use crate::network::{NetworkPlan, NetworkProvisioner};
use crate::operation::{Cancellation, Waiter};
use crate::progress::{ProgressSink, TracingProgress};
use crate::readiness::{self, ReadinessCheck};
use crate::reconcile::{StatusReconciler, SyncReport};
use crate::state::{ClusterOverrides, InstanceObservation, StateDocument, StateStore};

/// A node as the remote reports it right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveInstance {
    pub index: usize,
    pub name: String,
    /// Provider status, e.g. `RUNNING`.
    pub status: String,
    pub external_ip: Option<String>,
    pub internal_ip: Option<String>,
}

/// Drives clusters through their lifecycle against one compute client.
pub struct ClusterOrchestrator {
    compute: Arc<dyn ComputeClient>,
    config: FleetConfig,
    store: StateStore,
    progress: Arc<dyn ProgressSink>,
    cancel: Cancellation,
    user_data: Option<String>,
    ssh_key: Option<SshKey>,
}

impl ClusterOrchestrator {
    pub fn new(compute: Arc<dyn ComputeClient>, config: FleetConfig, store: StateStore) -> Self {
        Self {
            compute,
            config,
            store,
            progress: Arc::new(TracingProgress),
            cancel: Cancellation::none(),
            user_data: None,
            ssh_key: None,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    /// First-boot content for newly created nodes.
    pub fn with_user_data(mut self, user_data: Option<String>) -> Self {
        self.user_data = user_data;
        self
    }

    pub fn with_ssh_key(mut self, ssh_key: Option<SshKey>) -> Self {
        self.ssh_key = ssh_key;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// A waiter bounded by the configured timeout and the caller's cancellation.
    fn waiter(&self) -> Waiter {
        Waiter::new(
            self.config.operations.poll_interval,
            self.cancel.clone().with_timeout(self.config.operations.timeout),
        )
    }

    /// Name, count, and every resource name the cluster would create.
    fn validate_layout(&self, name: &str, node_count: usize) -> Result<()> {
        validate_cluster_name(name)?;
        validate_count(node_count)?;
        names::ClusterNames::new(&self.config.cluster.network_name_prefix, name).check(node_count)
    }

    /// Record a cluster without touching the remote.
    pub fn create_cluster(&self, name: &str, node_count: usize, overrides: &ClusterOverrides) -> Result<()> {
        self.validate_layout(name, node_count)?;
        validate_overrides(overrides)?;
        self.store
            .record_cluster_create(name, self.config.profile(), node_count, overrides, Utc::now())
    }

    /// Provision the network layer, then create or start every node.
    ///
    /// Nodes that came up are recorded even when others failed; the error of
    /// the lowest failing index is returned.
    pub async fn start_cluster(&self, name: &str, node_count: usize, overrides: &ClusterOverrides) -> Result<()> {
        self.validate_layout(name, node_count)?;
        validate_overrides(overrides)?;

        let plan = NetworkPlan::new(&self.config, name)?;
        let waiter = self.waiter();
        let progress = self.progress.as_ref();
        NetworkProvisioner::new(self.compute.as_ref(), &waiter, progress)
            .ensure(&plan)
            .await?;

        let template = InstanceTemplate::new(
            &self.config,
            plan,
            overrides,
            self.user_data.clone(),
            self.ssh_key.clone(),
        );
        let controller = InstanceController::new(self.compute.as_ref(), &waiter, progress);
        let (controller, template) = (&controller, &template);
        let targets = (0..node_count).map(|i| (i, names::instance_name(name, i))).collect();
        let outcome = instance::fan_out(targets, progress, move |index, _| {
            controller.create_or_start(template, index)
        })
        .await;

        self.store.record_cluster_start(
            name,
            self.config.profile(),
            node_count,
            overrides,
            &outcome.succeeded,
            Utc::now(),
        )?;
        let started = outcome.finish()?;
        info!(cluster = name, nodes = started.len(), "cluster started");
        Ok(())
    }

    /// Start a recorded cluster with its recorded size and overrides.
    pub async fn start_recorded_cluster(&self, name: &str) -> Result<()> {
        validate_cluster_name(name)?;
        let doc = self.store.load()?;
        let record = doc
            .cluster(name)
            .ok_or_else(|| FleetError::NotFound(format!("cluster {name} not found in state")))?;
        if record.num_instances == 0 {
            return Err(FleetError::Validation(format!(
                "cluster {name} has no recorded instance count"
            )));
        }
        let (count, overrides) = (record.num_instances, record.overrides.clone());
        self.start_cluster(name, count, &overrides).await
    }

    /// Stop every node, or delete the nodes and the network layer.
    ///
    /// A delete keeps boot disks when `retain_disks` is set. The record is
    /// removed only after a fully successful delete.
    pub async fn stop_cluster(&self, name: &str, delete: bool, retain_disks: bool) -> Result<()> {
        validate_cluster_name(name)?;
        if retain_disks && !delete {
            return Err(FleetError::Validation(
                "retaining disks requires deleting the cluster".to_string(),
            ));
        }

        let instances = self.cluster_instances(name).await?;
        if instances.is_empty() && !delete {
            warn!(cluster = name, "no instances found");
            return Ok(());
        }
        let waiter = self.waiter();
        let progress = self.progress.as_ref();
        let controller = InstanceController::new(self.compute.as_ref(), &waiter, progress);
        let controller = &controller;
        let lookup = |instance_name: &str| instances.iter().find(|i| i.name == instance_name);

        let outcome = if delete {
            let auto_delete = !retain_disks;
            instance::fan_out(targets(name, &instances), progress, move |_, instance_name| async move {
                match lookup(&instance_name) {
                    Some(instance) => controller.delete(instance, auto_delete).await,
                    None => Err(FleetError::NotFound(format!("instance {instance_name}"))),
                }
            })
            .await
        } else {
            instance::fan_out(targets(name, &instances), progress, move |_, instance_name| async move {
                match lookup(&instance_name) {
                    Some(instance) => controller.stop(instance).await,
                    None => Err(FleetError::NotFound(format!("instance {instance_name}"))),
                }
            })
            .await
        };

        let settled: Vec<String> = outcome.succeeded.iter().map(|o| o.name.clone()).collect();
        if !delete {
            self.store.record_cluster_stop(name, &settled, Utc::now())?;
            outcome.finish()?;
            info!(cluster = name, "cluster stopped");
            return Ok(());
        }

        if !outcome.failures.is_empty() {
            self.record_if_known(name, &outcome.succeeded)?;
            return outcome.finish().map(|_| ());
        }

        let plan = NetworkPlan::new(&self.config, name)?;
        if let Err(err) = NetworkProvisioner::new(self.compute.as_ref(), &waiter, progress)
            .cleanup(&plan)
            .await
        {
            self.record_if_known(name, &outcome.succeeded)?;
            return Err(err);
        }
        self.store.delete_cluster(name)?;
        info!(cluster = name, keep_disks = retain_disks, "cluster deleted");
        Ok(())
    }

    /// Change the run limit of every stopped node. Running nodes are skipped
    /// with a warning.
    pub async fn update_cluster(&self, name: &str, max_run_hours: u32) -> Result<()> {
        validate_cluster_name(name)?;
        if max_run_hours == 0 {
            return Err(FleetError::Validation("max run hours must be >= 1".to_string()));
        }

        let instances = self.cluster_instances(name).await?;
        if instances.is_empty() {
            warn!(cluster = name, "no instances found");
        }
        let termination_action = self
            .store
            .load()?
            .cluster(name)
            .and_then(|c| c.overrides.termination_action.clone())
            .unwrap_or_else(|| self.config.instance.termination_action.clone())
            .to_ascii_uppercase();
        let scheduling = instance::scheduling(&self.config, max_run_hours, &termination_action);

        let waiter = self.waiter();
        let progress = self.progress.as_ref();
        let controller = InstanceController::new(self.compute.as_ref(), &waiter, progress);
        let (controller, scheduling) = (&controller, &scheduling);
        let lookup = |instance_name: &str| instances.iter().find(|i| i.name == instance_name);
        let outcome = instance::fan_out(targets(name, &instances), progress, move |_, instance_name| async move {
            match lookup(&instance_name) {
                Some(instance) => controller.update_scheduling(instance, scheduling).await,
                None => Err(FleetError::NotFound(format!("instance {instance_name}"))),
            }
        })
        .await;

        let skipped = outcome.succeeded.iter().filter(|updated| !**updated).count();
        let updated = outcome.finish()?.len() - skipped;
        if updated > 0 {
            self.store.record_cluster_update(name, max_run_hours, Utc::now())?;
        }
        info!(cluster = name, updated, skipped, "cluster scheduling updated");
        Ok(())
    }

    /// Reconcile the store with the remote and return the merged view.
    pub async fn sync_status(&self) -> Result<(StateDocument, SyncReport)> {
        StatusReconciler::new(self.compute.as_ref(), &self.store, self.config.profile())
            .sync(Utc::now())
            .await
    }

    /// Live view of one cluster's nodes, ordered by index. Reads only.
    pub async fn show_cluster(&self, name: &str) -> Result<Vec<LiveInstance>> {
        validate_cluster_name(name)?;
        let instances = self.cluster_instances(name).await?;
        Ok(instances
            .iter()
            .map(|i| LiveInstance {
                index: instance_index(name, i),
                name: i.name.clone(),
                status: i.status.clone(),
                external_ip: i.external_ip().map(str::to_string),
                internal_ip: i.internal_ip().map(str::to_string),
            })
            .collect())
    }

    /// Wait for the entry node to report that first-boot setup finished,
    /// bounded by `timeout` and the caller's cancellation.
    pub async fn wait_until_ready(&self, name: &str, checker: &dyn ReadinessCheck, timeout: Duration) -> Result<()> {
        validate_cluster_name(name)?;
        let entry = names::instance_name(name, 0);
        let instance = self.compute.get_instance(&entry).await?;
        let host = instance
            .external_ip()
            .ok_or_else(|| FleetError::NotFound(format!("external IP of instance {entry}")))?;
        let cancel = self.cancel.clone().with_timeout(timeout);
        readiness::wait_for_ready(checker, &entry, host, &cancel, readiness::CHECK_INTERVAL, self.progress.as_ref())
            .await
    }

    async fn cluster_instances(&self, name: &str) -> Result<Vec<Instance>> {
        let mut instances = self.compute.list_instances(&names::cluster_filter(name)).await?;
        instances.sort_by_key(|i| instance_index(name, i));
        Ok(instances)
    }

    /// Apply observations to a cluster the store already knows about.
    fn record_if_known(&self, name: &str, observations: &[InstanceObservation]) -> Result<()> {
        if observations.is_empty() || self.store.load()?.cluster(name).is_none() {
            return Ok(());
        }
        self.store
            .record_cluster_instance_states(name, observations, Utc::now())
    }
}

fn instance_index(cluster: &str, instance: &Instance) -> usize {
    instance
        .labels
        .get(names::CLUSTER_INDEX_LABEL)
        .and_then(|raw| raw.parse().ok())
        .or_else(|| names::parse_instance_index(cluster, &instance.name))
        .unwrap_or(usize::MAX)
}

fn targets(cluster: &str, instances: &[Instance]) -> Vec<(usize, String)> {
    instances
        .iter()
        .map(|i| (instance_index(cluster, i), i.name.clone()))
        .collect()
}

pub fn validate_cluster_name(name: &str) -> Result<()> {
    if names::is_resource_name(name) {
        Ok(())
    } else {
        Err(FleetError::Validation(format!("invalid cluster name: {name}")))
    }
}

fn validate_count(count: usize) -> Result<()> {
    if count == 0 {
        return Err(FleetError::Validation("node count must be >= 1".to_string()));
    }
    Ok(())
}

fn validate_overrides(overrides: &ClusterOverrides) -> Result<()> {
    if let Some(action) = &overrides.termination_action {
        match action.trim().to_ascii_uppercase().as_str() {
            "" | "STOP" | "DELETE" => {}
            other => {
                return Err(FleetError::Validation(format!(
                    "termination action {other} is not STOP or DELETE"
                )));
            }
        }
    }
    if overrides.max_run_hours == Some(0) {
        return Err(FleetError::Validation("max run hours must be >= 1".to_string()));
    }
    if overrides.disk_size_gb == Some(0) {
        return Err(FleetError::Validation("disk size must be >= 1".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_names_and_counts() {
        assert!(validate_cluster_name("alpha-1").is_ok());
        assert!(validate_cluster_name("Alpha").is_err());
        assert!(validate_count(0).is_err());
        assert!(validate_count(3).is_ok());
    }

    #[test]
    fn rejects_bad_overrides() {
        let overrides = ClusterOverrides {
            termination_action: Some("hibernate".to_string()),
            ..Default::default()
        };
        assert!(validate_overrides(&overrides).is_err());
        assert!(validate_overrides(&ClusterOverrides {
            termination_action: Some("delete".to_string()),
            ..Default::default()
        })
        .is_ok());
    }

    #[test]
    fn index_from_label_or_name() {
        let mut instance = Instance {
            name: "alpha-4".to_string(),
            ..Default::default()
        };
        assert_eq!(instance_index("alpha", &instance), 4);
        instance
            .labels
            .insert(names::CLUSTER_INDEX_LABEL.to_string(), "7".to_string());
        assert_eq!(instance_index("alpha", &instance), 7);
        instance.labels.clear();
        instance.name = "stray".to_string();
        assert_eq!(instance_index("alpha", &instance), usize::MAX);
    }
}
