//! Local record of every known cluster and its instances.
//!
//! The whole document is loaded, mutated and written back on every change.
//! Writes go to a temporary file that is renamed over `state.json`, so a
//! reader never sees a partial document.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{FleetError, Result};
use crate::lifecycle::{ClusterStatus, InstanceState};
use crate::names;

/// Current on-disk schema version.
pub const STATE_VERSION: u32 = 2;

const STATE_FILE: &str = "state.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub clusters: BTreeMap<String, ClusterRecord>,
}

impl Default for StateDocument {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            updated_at: None,
            clusters: BTreeMap::new(),
        }
    }
}

impl StateDocument {
    /// Get the cluster record, creating an empty one on first reference.
    pub fn cluster_entry(&mut self, name: &str) -> &mut ClusterRecord {
        self.clusters
            .entry(name.to_string())
            .or_insert_with(|| ClusterRecord::new(name))
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterRecord> {
        self.clusters.get(name)
    }
}

/// Per-cluster knobs that override the configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_size_gb: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_run_hours: Option<u32>,
    /// Keep boot disks when instances are deleted.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub keep_disks: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastAction {
    Create,
    Start,
    Stop,
    Update,
    Delete,
}

impl LastAction {
    pub fn as_str(self) -> &'static str {
        match self {
            LastAction::Create => "create",
            LastAction::Start => "start",
            LastAction::Stop => "stop",
            LastAction::Update => "update",
            LastAction::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub name: String,
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub num_instances: usize,
    #[serde(default)]
    pub overrides: ClusterOverrides,
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceRecord>,
    #[serde(default = "terminated_status")]
    pub status: ClusterStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action: Option<LastAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

fn terminated_status() -> ClusterStatus {
    ClusterStatus::Terminated
}

impl ClusterRecord {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            profile: String::new(),
            num_instances: 0,
            overrides: ClusterOverrides::default(),
            instances: BTreeMap::new(),
            status: ClusterStatus::Terminated,
            created_at: None,
            updated_at: None,
            last_action: None,
            last_action_at: None,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Recompute the aggregate status. A drift-deleted record stays deleted.
    pub fn refresh_status(&mut self) {
        self.status = if self.is_deleted() {
            ClusterStatus::Deleted
        } else {
            ClusterStatus::derive(self.instances.values().map(|i| i.state))
        };
    }

    /// Make sure `<name>-0 .. <name>-(count-1)` exist, new ones at rest.
    pub fn ensure_instances(&mut self, count: usize, when: DateTime<Utc>) {
        for index in 0..count {
            let name = names::instance_name(&self.name, index);
            self.instances
                .entry(name.clone())
                .or_insert_with(|| InstanceRecord::new(name, index, when));
        }
    }

    /// Apply an observed instance state; creates the record if unknown.
    pub fn observe(&mut self, observation: &InstanceObservation, when: DateTime<Utc>) {
        let index = names::parse_instance_index(&self.name, &observation.name);
        let entry = self
            .instances
            .entry(observation.name.clone())
            .or_insert_with(|| InstanceRecord::new(observation.name.clone(), index.unwrap_or(0), when));
        if let Some(index) = index {
            entry.index = index;
        }
        entry.state = observation.state;
        entry.updated_at = Some(when);
        if observation.external_ip.is_some() || observation.state.is_at_rest() {
            entry.external_ip = observation.external_ip.clone();
        }
        if observation.internal_ip.is_some() || observation.state.is_at_rest() {
            entry.internal_ip = observation.internal_ip.clone();
        }
        if self.num_instances < self.instances.len() {
            self.num_instances = self.instances.len();
        }
    }

    fn stamp_action(&mut self, action: LastAction, when: DateTime<Utc>) {
        self.last_action = Some(action);
        self.last_action_at = Some(when);
    }

    /// Instances ordered by index, then name.
    pub fn instances_by_index(&self) -> Vec<&InstanceRecord> {
        let mut out: Vec<&InstanceRecord> = self.instances.values().collect();
        out.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.name.cmp(&b.name)));
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub name: String,
    #[serde(default)]
    pub index: usize,
    #[serde(default = "terminated_state")]
    pub state: InstanceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn terminated_state() -> InstanceState {
    InstanceState::Terminated
}

impl InstanceRecord {
    pub fn new(name: String, index: usize, when: DateTime<Utc>) -> Self {
        Self {
            name,
            index,
            state: InstanceState::Terminated,
            external_ip: None,
            internal_ip: None,
            created_at: Some(when),
            updated_at: Some(when),
        }
    }
}

/// One instance's state as read from the remote or produced by a finished
/// local operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceObservation {
    pub name: String,
    pub state: InstanceState,
    pub external_ip: Option<String>,
    pub internal_ip: Option<String>,
}

impl InstanceObservation {
    pub fn new(name: impl Into<String>, state: InstanceState) -> Self {
        Self {
            name: name.into(),
            state,
            external_ip: None,
            internal_ip: None,
        }
    }

    pub fn from_instance(instance: &crate::compute::Instance) -> Self {
        Self {
            name: instance.name.clone(),
            state: InstanceState::from_compute_status(&instance.status),
            external_ip: instance.external_ip().map(str::to_string),
            internal_ip: instance.internal_ip().map(str::to_string),
        }
    }
}

/// File-backed store for the [`StateDocument`].
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
    path: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let path = dir.join(STATE_FILE);
        Self { dir, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document. A missing file is an empty document; a newer
    /// schema version is an error; an older one is upgraded in memory.
    pub fn load(&self) -> Result<StateDocument> {
        if !self.path.exists() {
            return Ok(StateDocument::default());
        }
        let raw = fs::read_to_string(&self.path).map_err(|e| self.io_error("read", e))?;
        let mut value: Value =
            serde_json::from_str(&raw).map_err(|e| FleetError::StateParse(e.to_string()))?;

        let version = value
            .get("version")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(0);
        if version > STATE_VERSION {
            return Err(FleetError::StateVersion {
                found: version,
                supported: STATE_VERSION,
            });
        }
        if version < STATE_VERSION {
            debug!(from = version, to = STATE_VERSION, "upgrading state document");
            upgrade_v1(&mut value);
        }

        let mut doc: StateDocument =
            serde_json::from_value(value).map_err(|e| FleetError::StateParse(e.to_string()))?;
        doc.version = STATE_VERSION;
        for (key, cluster) in doc.clusters.iter_mut() {
            if cluster.name.is_empty() {
                cluster.name = key.clone();
            }
            for (instance_key, instance) in cluster.instances.iter_mut() {
                if instance.name.is_empty() {
                    instance.name = instance_key.clone();
                }
                if let Some(index) = names::parse_instance_index(&cluster.name, &instance.name) {
                    instance.index = index;
                }
            }
            cluster.refresh_status();
        }
        Ok(doc)
    }

    /// Replace the document on disk.
    pub fn save(&self, doc: &StateDocument) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| self.io_error("create state directory", e))?;
        let mut doc = doc.clone();
        doc.version = STATE_VERSION;
        let json =
            serde_json::to_string_pretty(&doc).map_err(|e| FleetError::StateParse(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        write_synced(&tmp, json.as_bytes()).map_err(|e| self.io_error("write", e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error("replace", e))?;
        debug!(path = %self.path.display(), clusters = doc.clusters.len(), "state saved");
        Ok(())
    }

    /// Load, apply `f` to the named cluster (created on first reference),
    /// refresh its status and timestamps, and save.
    fn mutate_cluster<F>(&self, name: &str, when: DateTime<Utc>, f: F) -> Result<()>
    where
        F: FnOnce(&mut ClusterRecord),
    {
        let mut doc = self.load()?;
        let cluster = doc.cluster_entry(name);
        f(cluster);
        cluster.refresh_status();
        cluster.updated_at = Some(when);
        doc.updated_at = Some(when);
        self.save(&doc)
    }

    /// Record a cluster defined but not necessarily started.
    pub fn record_cluster_create(
        &self,
        name: &str,
        profile: &str,
        num_instances: usize,
        overrides: &ClusterOverrides,
        when: DateTime<Utc>,
    ) -> Result<()> {
        self.mutate_cluster(name, when, |cluster| {
            define_cluster(cluster, profile, num_instances, overrides, when);
            cluster.stamp_action(LastAction::Create, when);
        })?;
        info!(cluster = name, num_instances, "recorded cluster create");
        Ok(())
    }

    /// Record a start along with what each successfully started node looked
    /// like afterwards. Nodes without an observation keep their last state.
    pub fn record_cluster_start(
        &self,
        name: &str,
        profile: &str,
        num_instances: usize,
        overrides: &ClusterOverrides,
        observations: &[InstanceObservation],
        when: DateTime<Utc>,
    ) -> Result<()> {
        self.mutate_cluster(name, when, |cluster| {
            define_cluster(cluster, profile, num_instances, overrides, when);
            for observation in observations {
                cluster.observe(observation, when);
            }
            cluster.stamp_action(LastAction::Start, when);
        })?;
        info!(cluster = name, started = observations.len(), "recorded cluster start");
        Ok(())
    }

    /// Record a stop. Each named instance is marked terminated and loses its
    /// addresses; the record itself is kept.
    pub fn record_cluster_stop(&self, name: &str, stopped: &[String], when: DateTime<Utc>) -> Result<()> {
        self.mutate_cluster(name, when, |cluster| {
            for instance in stopped {
                cluster.observe(&InstanceObservation::new(instance.clone(), InstanceState::Terminated), when);
            }
            cluster.stamp_action(LastAction::Stop, when);
        })?;
        info!(cluster = name, stopped = stopped.len(), "recorded cluster stop");
        Ok(())
    }

    pub fn record_cluster_update(&self, name: &str, max_run_hours: u32, when: DateTime<Utc>) -> Result<()> {
        self.mutate_cluster(name, when, |cluster| {
            cluster.overrides.max_run_hours = Some(max_run_hours);
            cluster.stamp_action(LastAction::Update, when);
        })?;
        info!(cluster = name, max_run_hours, "recorded cluster update");
        Ok(())
    }

    pub fn record_cluster_instance_state(
        &self,
        cluster: &str,
        observation: &InstanceObservation,
        when: DateTime<Utc>,
    ) -> Result<()> {
        self.record_cluster_instance_states(cluster, std::slice::from_ref(observation), when)
    }

    /// Apply several observations in one write.
    pub fn record_cluster_instance_states(
        &self,
        cluster: &str,
        observations: &[InstanceObservation],
        when: DateTime<Utc>,
    ) -> Result<()> {
        self.mutate_cluster(cluster, when, |record| {
            if record.created_at.is_none() {
                record.created_at = Some(when);
            }
            record.deleted_at = None;
            let count = record.num_instances;
            record.ensure_instances(count, when);
            for observation in observations {
                record.observe(observation, when);
            }
        })
    }

    /// Forget the cluster entirely. Unknown names are not an error.
    pub fn delete_cluster(&self, name: &str) -> Result<()> {
        let mut doc = self.load()?;
        let existed = doc.clusters.remove(name).is_some();
        doc.updated_at = Some(Utc::now());
        self.save(&doc)?;
        info!(cluster = name, existed, "removed cluster from state");
        Ok(())
    }

    fn io_error(&self, action: &str, err: std::io::Error) -> FleetError {
        FleetError::StateIo {
            path: self.path.display().to_string(),
            message: format!("failed to {action}: {err}"),
        }
    }
}

/// Write and flush to disk, so the rename never exposes an empty file.
fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn define_cluster(
    cluster: &mut ClusterRecord,
    profile: &str,
    num_instances: usize,
    overrides: &ClusterOverrides,
    when: DateTime<Utc>,
) {
    if cluster.created_at.is_none() {
        cluster.created_at = Some(when);
    }
    cluster.profile = profile.to_string();
    cluster.num_instances = num_instances;
    cluster.overrides = overrides.clone();
    cluster.deleted_at = None;
    cluster.ensure_instances(num_instances, when);
}

/// Version 1 documents stored cluster status as free text (`running`,
/// `stopped`) and instance states upper-cased. Drop the former so it is
/// re-derived and lower-case the latter.
fn upgrade_v1(value: &mut Value) {
    let Some(clusters) = value.get_mut("clusters").and_then(Value::as_object_mut) else {
        return;
    };
    for cluster in clusters.values_mut() {
        let Some(cluster) = cluster.as_object_mut() else {
            continue;
        };
        let keep_status = matches!(cluster.get("status").and_then(Value::as_str), Some("deleted"));
        if !keep_status {
            cluster.remove("status");
        }
        for key in ["created_at", "updated_at", "last_action_at", "deleted_at", "last_action"] {
            if cluster.get(key).and_then(Value::as_str) == Some("") {
                cluster.remove(key);
            }
        }
        if let Some(instances) = cluster.get_mut("instances").and_then(Value::as_object_mut) {
            for instance in instances.values_mut() {
                let Some(instance) = instance.as_object_mut() else {
                    continue;
                };
                if let Some(state) = instance.get("state").and_then(Value::as_str) {
                    let lowered = state.trim().to_ascii_lowercase();
                    instance.insert("state".to_string(), Value::String(lowered));
                }
                for key in ["external_ip", "internal_ip", "created_at", "updated_at"] {
                    if instance.get(key).and_then(Value::as_str) == Some("") {
                        instance.remove(key);
                    }
                }
            }
        }
    }
}
