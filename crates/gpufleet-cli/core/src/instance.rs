//! Per-node operations and the fan-out that runs them across a cluster.

use std::collections::BTreeMap;
use std::fs;
use std::future::Future;

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::compute::{
    AccessConfig, AttachedDisk, ComputeClient, Disk, DiskInitializeParams, Instance, Metadata,
    MetadataItem, NetworkInterface, RunDuration, Scheduling, ServiceAccount, Tags,
};
use crate::config::{FleetConfig, SshConfig};
use crate::error::{FleetError, Result};
use crate::lifecycle::InstanceState;
use crate::names::{self, ClusterNames};
use crate::network::NetworkPlan;
use crate::operation::{OperationHandle, Waiter};
use crate::progress::ProgressSink;
use crate::state::{ClusterOverrides, InstanceObservation};

const USER_DATA_KEY: &str = "user-data";
const SSH_KEYS_KEY: &str = "ssh-keys";
const OS_LOGIN_KEY: &str = "enable-oslogin";

/// A login to install on every node as `user:key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshKey {
    pub user: String,
    pub public_key: String,
}

impl SshKey {
    pub fn new(user: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            user: user.into().trim().to_string(),
            public_key: public_key.into().trim().to_string(),
        }
    }

    /// Read the configured public key. `Ok(None)` when no key is configured.
    pub fn from_config(ssh: &SshConfig) -> Result<Option<Self>> {
        let Some(path) = &ssh.public_key else {
            return Ok(None);
        };
        let key = fs::read_to_string(path).map_err(|e| {
            FleetError::Config(format!("failed to read ssh public key {}: {e}", path.display()))
        })?;
        let user = match &ssh.user {
            Some(user) => user.clone(),
            None => std::env::var("USER")
                .map_err(|_| FleetError::Config("ssh.user is not set and $USER is empty".to_string()))?,
        };
        let key = SshKey::new(user, key);
        if key.user.is_empty() || key.public_key.is_empty() {
            return Err(FleetError::Config("ssh user and public key must not be empty".to_string()));
        }
        Ok(Some(key))
    }

    pub fn line(&self) -> String {
        format!("{}:{}", self.user, self.public_key)
    }
}

/// Everything that shapes a node of one cluster, resolved from the config
/// and the cluster's overrides.
#[derive(Debug, Clone)]
pub struct InstanceTemplate {
    pub plan: NetworkPlan,
    pub zone: String,
    pub machine_type: String,
    pub disk_size_gb: u32,
    pub disk_type: String,
    pub image: String,
    pub disk_auto_delete: bool,
    pub public_ip_all: bool,
    pub network_tier: String,
    pub stack_type: String,
    pub scheduling: Scheduling,
    pub tags_base: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
    pub service_account: Option<ServiceAccount>,
    pub user_data: Option<String>,
    pub ssh_key: Option<SshKey>,
}

impl InstanceTemplate {
    pub fn new(
        config: &FleetConfig,
        plan: NetworkPlan,
        overrides: &ClusterOverrides,
        user_data: Option<String>,
        ssh_key: Option<SshKey>,
    ) -> Self {
        let trimmed = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let machine_type =
            trimmed(&overrides.machine_type).unwrap_or_else(|| config.instance.machine_type.clone());
        let termination_action = trimmed(&overrides.termination_action)
            .unwrap_or_else(|| config.instance.termination_action.clone())
            .to_ascii_uppercase();
        let max_run_hours = overrides
            .max_run_hours
            .filter(|h| *h > 0)
            .unwrap_or(config.instance.max_run_hours);
        let disk_size_gb = overrides
            .disk_size_gb
            .filter(|s| *s > 0)
            .unwrap_or(config.disk.size_gb);

        let service_account = {
            let email = config.service_account.email.trim();
            (!email.is_empty() && !config.service_account.scopes.is_empty()).then(|| ServiceAccount {
                email: email.to_string(),
                scopes: config.service_account.scopes.clone(),
            })
        };

        Self {
            plan,
            zone: config.project.zone.clone(),
            machine_type,
            disk_size_gb,
            disk_type: config.disk.disk_type.clone(),
            image: config.disk.image.clone(),
            disk_auto_delete: config.disk.auto_delete && !overrides.keep_disks,
            public_ip_all: config.instance.public_ip,
            network_tier: config.network.network_tier.clone(),
            stack_type: config.network.stack_type.clone(),
            scheduling: scheduling(config, max_run_hours, &termination_action),
            tags_base: config.network.tags_base.clone(),
            labels: config.labels.clone(),
            metadata: config.metadata.clone(),
            service_account,
            user_data,
            ssh_key,
        }
    }

    pub fn names(&self) -> &ClusterNames {
        &self.plan.names
    }

    pub fn tags_for(&self, index: usize) -> Vec<String> {
        self.names().tags_for(index, &self.tags_base)
    }

    /// Index 0 is the entry point and always reachable from outside.
    pub fn public_ip_for(&self, index: usize) -> bool {
        self.public_ip_all || index == 0
    }

    /// Creation request for the node at `index`. An existing disk named like
    /// the node is attached instead of a fresh one from the image.
    pub fn build(&self, index: usize, existing_disk: Option<&Disk>) -> Instance {
        let name = self.names().instance(index);
        let project = &self.plan.project;

        let mut labels = self.labels.clone();
        labels.extend(self.names().labels_for(index));

        let mut boot = AttachedDisk {
            boot: true,
            auto_delete: self.disk_auto_delete,
            device_name: name.clone(),
            mode: Some("READ_WRITE".to_string()),
            ..Default::default()
        };
        match existing_disk {
            Some(disk) => {
                boot.source = Some(names::zone_resource(project, &self.zone, "disks", &disk.name));
            }
            None => {
                boot.initialize_params = Some(DiskInitializeParams {
                    disk_name: name.clone(),
                    disk_size_gb: self.disk_size_gb.to_string(),
                    disk_type: names::zone_resource(project, &self.zone, "diskTypes", &self.disk_type),
                    source_image: self.image.clone(),
                    labels: labels.clone(),
                });
            }
        }

        let access_configs = if self.public_ip_for(index) {
            vec![AccessConfig {
                name: "External NAT".to_string(),
                kind: "ONE_TO_ONE_NAT".to_string(),
                nat_ip: None,
                network_tier: Some(self.network_tier.clone()),
            }]
        } else {
            Vec::new()
        };

        Instance {
            name: name.clone(),
            machine_type: names::zone_resource(project, &self.zone, "machineTypes", &self.machine_type),
            status: String::new(),
            disks: vec![boot],
            network_interfaces: vec![NetworkInterface {
                network: self.plan.network_link(),
                subnetwork: Some(self.plan.subnetwork_link()),
                network_ip: None,
                stack_type: Some(self.stack_type.clone()),
                access_configs,
            }],
            scheduling: Some(self.scheduling.clone()),
            tags: Some(Tags {
                items: self.tags_for(index),
                fingerprint: None,
            }),
            metadata: Some(self.metadata_for(index)),
            labels,
            service_accounts: self.service_account.iter().cloned().collect(),
        }
    }

    /// `user-data` first, then the merged key/value metadata. Configured
    /// `ssh-keys` are kept and the login key line appended.
    fn metadata_for(&self, index: usize) -> Metadata {
        let mut merged = self.metadata.clone();
        for (key, value) in self.names().labels_for(index) {
            if key != names::MANAGED_LABEL_KEY {
                merged.insert(key, value);
            }
        }
        if let Some(key) = &self.ssh_key {
            let existing = merged.get(SSH_KEYS_KEY).map(String::as_str).unwrap_or_default();
            let value = if has_line(existing, &key.line()) {
                existing.to_string()
            } else {
                append_line(existing, &key.line())
            };
            merged.insert(SSH_KEYS_KEY.to_string(), value);
            merged.insert(OS_LOGIN_KEY.to_string(), "FALSE".to_string());
        }

        let mut items = Vec::with_capacity(merged.len() + 1);
        if let Some(user_data) = &self.user_data {
            items.push(MetadataItem::new(USER_DATA_KEY, user_data.clone()));
        }
        items.extend(merged.into_iter().map(|(k, v)| MetadataItem::new(k, v)));
        Metadata {
            items,
            fingerprint: None,
        }
    }
}

/// Scheduling policy with the given run limit and termination action.
pub fn scheduling(config: &FleetConfig, max_run_hours: u32, termination_action: &str) -> Scheduling {
    Scheduling {
        provisioning_model: Some(config.instance.provisioning_model.clone()),
        on_host_maintenance: Some(config.instance.maintenance_policy.clone()),
        instance_termination_action: Some(termination_action.to_string()),
        automatic_restart: Some(config.instance.restart_on_failure),
        max_run_duration: Some(RunDuration::hours(max_run_hours)),
    }
}

/// The instance's tags plus any required ones it lacks, or `None` when
/// nothing is missing. Carries the fingerprint for the conditional update.
pub fn tags_update(instance: &Instance, required: &[String]) -> Option<Tags> {
    let existing = instance.tag_items();
    let missing: Vec<String> = required
        .iter()
        .filter(|tag| !existing.contains(tag))
        .cloned()
        .collect();
    if missing.is_empty() {
        return None;
    }
    let mut items = existing.to_vec();
    items.extend(missing);
    Some(Tags {
        items,
        fingerprint: instance.tags.as_ref().and_then(|t| t.fingerprint.clone()),
    })
}

/// Metadata with `key` merged in, or `None` if it is already present and
/// OS Login already disabled. Other items are carried over untouched.
pub fn merge_ssh_key(metadata: &Metadata, key: &SshKey) -> Option<Metadata> {
    let line = key.line();
    let mut items = Vec::with_capacity(metadata.items.len() + 2);
    let mut found = false;
    let mut os_login_set = false;
    let mut changed = false;

    for item in &metadata.items {
        match item.key.as_str() {
            SSH_KEYS_KEY => {
                found = true;
                if has_line(&item.value, &line) {
                    items.push(item.clone());
                } else {
                    items.push(MetadataItem::new(SSH_KEYS_KEY, append_line(&item.value, &line)));
                    changed = true;
                }
            }
            OS_LOGIN_KEY => {
                os_login_set = true;
                if item.value.trim().eq_ignore_ascii_case("false") {
                    items.push(item.clone());
                } else {
                    items.push(MetadataItem::new(OS_LOGIN_KEY, "FALSE"));
                    changed = true;
                }
            }
            _ => items.push(item.clone()),
        }
    }
    if !found {
        items.push(MetadataItem::new(SSH_KEYS_KEY, line));
        changed = true;
    }
    if !os_login_set {
        items.push(MetadataItem::new(OS_LOGIN_KEY, "FALSE"));
        changed = true;
    }

    changed.then(|| Metadata {
        items,
        fingerprint: metadata.fingerprint.clone(),
    })
}

fn has_line(existing: &str, line: &str) -> bool {
    existing.split('\n').any(|entry| entry.trim() == line)
}

fn append_line(existing: &str, line: &str) -> String {
    let existing = existing.trim();
    if existing.is_empty() {
        line.to_string()
    } else {
        format!("{existing}\n{line}")
    }
}

/// Drives single-node operations. Each remote operation is waited on before
/// the call returns.
pub struct InstanceController<'a> {
    compute: &'a dyn ComputeClient,
    waiter: &'a Waiter,
    progress: &'a dyn ProgressSink,
}

impl<'a> InstanceController<'a> {
    pub fn new(compute: &'a dyn ComputeClient, waiter: &'a Waiter, progress: &'a dyn ProgressSink) -> Self {
        Self {
            compute,
            waiter,
            progress,
        }
    }

    /// Bring the node at `index` to running, creating it when absent.
    pub async fn create_or_start(&self, template: &InstanceTemplate, index: usize) -> Result<InstanceObservation> {
        let name = template.names().instance(index);
        let task = task_key(&name);
        self.progress.start(&task, &format!("Preparing {name}"));

        let Some(instance) = self.find(&name).await? else {
            let disk = match self.compute.get_disk(&name).await {
                Ok(disk) => {
                    debug!(instance = %name, "reusing boot disk");
                    Some(disk)
                }
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e.into()),
            };
            let request = template.build(index, disk.as_ref());
            let op = self.compute.insert_instance(&request).await?;
            self.wait(&task, op).await?;
            info!(instance = %name, "created");
            self.progress.done(&task, &format!("Created {name}"));
            return Ok(self.observe(&name, InstanceState::Ready).await);
        };

        if let Some(tags) = tags_update(&instance, &template.tags_for(index)) {
            let op = self.compute.set_instance_tags(&name, &tags).await?;
            self.waiter.wait(op).await?;
            debug!(instance = %name, tags = ?tags.items, "tags updated");
        }
        if let Some(key) = &template.ssh_key {
            let current = instance.metadata.clone().unwrap_or_default();
            if let Some(metadata) = merge_ssh_key(&current, key) {
                let op = self.compute.set_instance_metadata(&name, &metadata).await?;
                self.waiter.wait(op).await?;
                debug!(instance = %name, user = %key.user, "ssh key installed");
            }
        }

        match instance.status.as_str() {
            "RUNNING" => {
                self.progress.done(&task, &format!("Already running {name}"));
                return Ok(InstanceObservation::from_instance(&instance));
            }
            "TERMINATED" => {}
            other => {
                warn!(instance = %name, status = other, "starting instance from unexpected status");
                self.progress
                    .warn(&task, &format!("{name} is {other}, starting anyway"));
            }
        }
        let op = self.compute.start_instance(&name).await?;
        self.wait(&task, op).await?;
        info!(instance = %name, "started");
        self.progress.done(&task, &format!("Started {name}"));
        Ok(self.observe(&name, InstanceState::Ready).await)
    }

    /// Stop a node unless it is already at rest.
    pub async fn stop(&self, instance: &Instance) -> Result<InstanceObservation> {
        let name = &instance.name;
        let task = task_key(name);
        if InstanceState::from_compute_status(&instance.status).is_at_rest() {
            self.progress.done(&task, &format!("Already terminated {name}"));
            return Ok(InstanceObservation::new(name.clone(), InstanceState::Terminated));
        }
        self.progress.start(&task, &format!("Stopping {name}"));
        let op = self.compute.stop_instance(name).await?;
        self.wait(&task, op).await?;
        info!(instance = %name, "stopped");
        self.progress.done(&task, &format!("Stopped {name}"));
        Ok(InstanceObservation::new(name.clone(), InstanceState::Terminated))
    }

    /// Set every attached disk's auto-delete flag, then delete the node.
    pub async fn delete(&self, instance: &Instance, auto_delete: bool) -> Result<InstanceObservation> {
        let name = &instance.name;
        let task = task_key(name);
        self.progress.start(&task, &format!("Deleting {name}"));
        for disk in instance.disks.iter().filter(|d| d.auto_delete != auto_delete) {
            let op = self
                .compute
                .set_disk_auto_delete(name, &disk.device_name, auto_delete)
                .await?;
            self.waiter.wait(op).await?;
            debug!(instance = %name, device = %disk.device_name, auto_delete, "disk auto-delete set");
        }
        match self.compute.delete_instance(name).await {
            Ok(op) => self.wait(&task, op).await?,
            Err(e) if e.is_not_found() => debug!(instance = %name, "already deleted"),
            Err(e) => return Err(e.into()),
        }
        info!(instance = %name, keep_disk = !auto_delete, "deleted");
        self.progress.done(&task, &format!("Deleted {name}"));
        Ok(InstanceObservation::new(name.clone(), InstanceState::Terminated))
    }

    /// Apply a scheduling policy. Returns false, with a warning, for a node
    /// that is not at rest since the platform refuses the change.
    pub async fn update_scheduling(&self, instance: &Instance, scheduling: &Scheduling) -> Result<bool> {
        let name = &instance.name;
        let task = task_key(name);
        if !InstanceState::from_compute_status(&instance.status).is_at_rest() {
            warn!(instance = %name, status = %instance.status, "skipping scheduling update");
            self.progress
                .warn(&task, &format!("{name} must be TERMINATED to update max run duration"));
            return Ok(false);
        }
        self.progress.start(&task, &format!("Updating scheduling for {name}"));
        let op = self.compute.set_instance_scheduling(name, scheduling).await?;
        self.wait(&task, op).await?;
        self.progress.done(&task, &format!("Updated {name}"));
        Ok(true)
    }

    async fn find(&self, name: &str) -> Result<Option<Instance>> {
        match self.compute.get_instance(name).await {
            Ok(instance) => Ok(Some(instance)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read back state and addresses after a finished operation. A failed
    /// read falls back to `fallback` without addresses.
    async fn observe(&self, name: &str, fallback: InstanceState) -> InstanceObservation {
        match self.compute.get_instance(name).await {
            Ok(instance) => InstanceObservation::from_instance(&instance),
            Err(e) => {
                warn!(instance = %name, error = %e, "could not read instance after operation");
                InstanceObservation::new(name, fallback)
            }
        }
    }

    async fn wait(&self, task: &str, op: OperationHandle) -> Result<()> {
        let progress = self.progress;
        self.waiter
            .wait_with_progress(op, |percent| progress.update(task, percent))
            .await
    }
}

pub fn task_key(instance: &str) -> String {
    format!("instance {instance}")
}

/// Results of one cluster-wide fan-out, ordered by instance index.
#[derive(Debug)]
pub struct FanOut<T> {
    pub succeeded: Vec<T>,
    pub failures: Vec<FleetError>,
}

impl<T> FanOut<T> {
    /// `Ok` with every success, or the lowest-index failure.
    pub fn finish(self) -> Result<Vec<T>> {
        match self.failures.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(self.succeeded),
        }
    }
}

/// Run one task per `(index, name)` concurrently and wait for all of them.
///
/// A failing task does not cancel its siblings. Every failure is logged and
/// reported to `progress`, then attributed to its index.
pub async fn fan_out<T, F, Fut>(
    targets: Vec<(usize, String)>,
    progress: &dyn ProgressSink,
    run: F,
) -> FanOut<T>
where
    F: Fn(usize, String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let tasks = targets.into_iter().map(|(index, name)| {
        let task = run(index, name.clone());
        async move { (index, name, task.await) }
    });
    let mut results = join_all(tasks).await;
    results.sort_by_key(|(index, _, _)| *index);

    let mut out = FanOut {
        succeeded: Vec::with_capacity(results.len()),
        failures: Vec::new(),
    };
    for (index, name, result) in results {
        match result {
            Ok(value) => out.succeeded.push(value),
            Err(err) => {
                error!(instance = %name, index, error = %err, "instance task failed");
                progress.fail(&task_key(&name), &err.to_string());
                out.failures.push(FleetError::for_instance(index, &name, err));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use crate::progress::RecordingProgress;

    fn config() -> FleetConfig {
        FleetConfig {
            project: ProjectConfig {
                id: "proj".to_string(),
                zone: "us-east1-d".to_string(),
            },
            ..Default::default()
        }
    }

    fn template(config: &FleetConfig, overrides: &ClusterOverrides) -> InstanceTemplate {
        let plan = NetworkPlan::new(config, "alpha").unwrap();
        InstanceTemplate::new(
            config,
            plan,
            overrides,
            Some("#cloud-config".to_string()),
            Some(SshKey::new("dev", "ssh-ed25519 AAAA dev@host")),
        )
    }

    #[test]
    fn build_fresh_instance() {
        let cfg = config();
        let request = template(&cfg, &ClusterOverrides::default()).build(1, None);

        assert_eq!(request.name, "alpha-1");
        assert_eq!(request.machine_type, "projects/proj/zones/us-east1-d/machineTypes/g2-standard-8");
        let params = request.disks[0].initialize_params.as_ref().unwrap();
        assert_eq!(params.disk_size_gb, "200");
        assert!(request.disks[0].auto_delete);
        assert_eq!(
            request.network_interfaces[0].subnetwork.as_deref(),
            Some("projects/proj/regions/us-east1/subnetworks/gpufleet-alpha-subnet")
        );
        assert_eq!(request.tag_items(), ["cluster-alpha".to_string()]);
        assert_eq!(request.labels["gpufleet"], "managed");
        assert_eq!(request.labels["cluster_index"], "1");

        let scheduling = request.scheduling.as_ref().unwrap();
        assert_eq!(scheduling.max_run_duration, Some(RunDuration::hours(8)));
        assert_eq!(scheduling.instance_termination_action.as_deref(), Some("STOP"));

        let metadata = request.metadata.as_ref().unwrap();
        assert_eq!(metadata.items[0].key, "user-data");
        assert_eq!(metadata.get("ssh-keys"), Some("dev:ssh-ed25519 AAAA dev@host"));
        assert_eq!(metadata.get("enable-oslogin"), Some("FALSE"));
        assert_eq!(metadata.get("cluster_role"), Some("worker"));
    }

    #[test]
    fn build_applies_overrides_and_reuses_disk() {
        let cfg = config();
        let overrides = ClusterOverrides {
            machine_type: Some("a2-highgpu-1g".to_string()),
            disk_size_gb: Some(500),
            termination_action: Some("delete".to_string()),
            max_run_hours: Some(2),
            keep_disks: true,
        };
        let disk = Disk {
            name: "alpha-0".to_string(),
            size_gb: "500".to_string(),
        };
        let request = template(&cfg, &overrides).build(0, Some(&disk));

        assert!(request.machine_type.ends_with("/a2-highgpu-1g"));
        assert_eq!(
            request.disks[0].source.as_deref(),
            Some("projects/proj/zones/us-east1-d/disks/alpha-0")
        );
        assert!(request.disks[0].initialize_params.is_none());
        assert!(!request.disks[0].auto_delete);
        let scheduling = request.scheduling.unwrap();
        assert_eq!(scheduling.instance_termination_action.as_deref(), Some("DELETE"));
        assert_eq!(scheduling.max_run_duration.unwrap().seconds, "7200");
        assert_eq!(
            request.tags.unwrap().items,
            vec!["cluster-alpha".to_string(), "cluster-alpha-master".to_string()]
        );
    }

    #[test]
    fn only_entry_point_is_public_when_restricted() {
        let mut cfg = config();
        cfg.instance.public_ip = false;
        let template = template(&cfg, &ClusterOverrides::default());
        assert_eq!(template.build(0, None).network_interfaces[0].access_configs.len(), 1);
        assert!(template.build(2, None).network_interfaces[0].access_configs.is_empty());
    }

    #[test]
    fn ssh_key_merge_preserves_existing_items() {
        let key = SshKey::new("dev", "ssh-ed25519 AAAA");
        let metadata = Metadata {
            items: vec![
                MetadataItem::new("ssh-keys", "ops:ssh-rsa BBBB"),
                MetadataItem::new("startup", "echo"),
            ],
            fingerprint: Some("fp-1".to_string()),
        };

        let merged = merge_ssh_key(&metadata, &key).unwrap();
        assert_eq!(merged.get("ssh-keys"), Some("ops:ssh-rsa BBBB\ndev:ssh-ed25519 AAAA"));
        assert_eq!(merged.get("startup"), Some("echo"));
        assert_eq!(merged.get("enable-oslogin"), Some("FALSE"));
        assert_eq!(merged.fingerprint.as_deref(), Some("fp-1"));
        // The input is left as it was.
        assert_eq!(metadata.items.len(), 2);

        assert_eq!(merge_ssh_key(&merged, &key), None);
    }

    #[test]
    fn ssh_key_merge_forces_os_login_off() {
        let key = SshKey::new("dev", "k");
        let metadata = Metadata {
            items: vec![
                MetadataItem::new("ssh-keys", "dev:k"),
                MetadataItem::new("enable-oslogin", "TRUE"),
            ],
            fingerprint: None,
        };
        let merged = merge_ssh_key(&metadata, &key).unwrap();
        assert_eq!(merged.get("enable-oslogin"), Some("FALSE"));
        assert_eq!(merged.get("ssh-keys"), Some("dev:k"));
    }

    #[test]
    fn tags_update_only_when_missing() {
        let mut instance = Instance {
            name: "alpha-0".to_string(),
            tags: Some(Tags {
                items: vec!["cluster-alpha".to_string(), "custom".to_string()],
                fingerprint: Some("fp".to_string()),
            }),
            ..Default::default()
        };
        assert_eq!(tags_update(&instance, &["cluster-alpha".to_string()]), None);

        let update = tags_update(
            &instance,
            &["cluster-alpha".to_string(), "cluster-alpha-master".to_string()],
        )
        .unwrap();
        assert_eq!(update.items, vec!["cluster-alpha", "custom", "cluster-alpha-master"]);
        assert_eq!(update.fingerprint.as_deref(), Some("fp"));

        instance.tags = None;
        assert_eq!(tags_update(&instance, &["x".to_string()]).unwrap().items, vec!["x"]);
    }

    #[tokio::test]
    async fn fan_out_reports_lowest_index_failure() {
        let progress = RecordingProgress::new();
        let targets = (0..4).map(|i| (i, format!("alpha-{i}"))).collect();
        let outcome = fan_out(targets, &progress, |index, _name| async move {
            if index == 1 || index == 3 {
                Err(FleetError::Validation(format!("boom {index}")))
            } else {
                Ok(index)
            }
        })
        .await;

        assert_eq!(outcome.succeeded, vec![0, 2]);
        assert_eq!(outcome.failures.len(), 2);
        match outcome.finish().unwrap_err() {
            FleetError::Instance { index, name, .. } => {
                assert_eq!(index, 1);
                assert_eq!(name, "alpha-1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
