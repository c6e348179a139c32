//! Configuration consumed by the orchestrator.
//!
//! Every section has defaults so a config file only needs `[project]`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bootstrap::BootstrapConfig;
use crate::error::{FleetError, Result};
use crate::names;
use crate::subnet;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Recorded against every cluster this config touches.
    pub profile: String,
    pub project: ProjectConfig,
    pub cluster: ClusterConfig,
    pub instance: InstanceConfig,
    pub disk: DiskConfig,
    pub network: NetworkConfig,
    pub service_account: ServiceAccountConfig,
    pub labels: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
    pub ssh: SshConfig,
    pub bootstrap: BootstrapConfig,
    pub operations: OperationsConfig,
    /// Directory holding `state.json`. Defaults to `~/.gpufleet`.
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub id: String,
    pub zone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub network_name_prefix: String,
    pub subnet_cidr_base: String,
    pub subnet_prefix: u8,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            network_name_prefix: "gpufleet".to_string(),
            subnet_cidr_base: "10.200.0.0/16".to_string(),
            subnet_prefix: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub machine_type: String,
    pub provisioning_model: String,
    pub maintenance_policy: String,
    pub termination_action: String,
    pub max_run_hours: u32,
    pub restart_on_failure: bool,
    /// Give every node a public address. When false only index 0 gets one.
    pub public_ip: bool,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            machine_type: "g2-standard-8".to_string(),
            provisioning_model: "SPOT".to_string(),
            maintenance_policy: "TERMINATE".to_string(),
            termination_action: "STOP".to_string(),
            max_run_hours: 8,
            restart_on_failure: false,
            public_ip: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    pub size_gb: u32,
    pub disk_type: String,
    pub image: String,
    pub auto_delete: bool,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            size_gb: 200,
            disk_type: "pd-balanced".to_string(),
            image: "projects/ml-images/global/images/family/common-cu124-ubuntu-2204".to_string(),
            auto_delete: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP ports opened to the internet on cluster nodes, besides SSH.
    pub ports: Vec<u16>,
    /// Extra network tags for the entry point node.
    pub tags_base: Vec<String>,
    pub network_tier: String,
    pub stack_type: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ports: vec![8888],
            tags_base: Vec::new(),
            network_tier: "PREMIUM".to_string(),
            stack_type: "IPV4_ONLY".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceAccountConfig {
    pub email: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: Option<String>,
    /// Path to an OpenSSH public key to install on every node.
    pub public_key: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationsConfig {
    #[serde(with = "human_duration")]
    pub poll_interval: Duration,
    /// Upper bound on any single cluster-wide command's waits.
    #[serde(with = "human_duration")]
    pub timeout: Duration,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(800),
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl FleetConfig {
    pub fn profile(&self) -> &str {
        if self.profile.is_empty() {
            "default"
        } else {
            &self.profile
        }
    }

    /// Region of the configured zone, `us-east1-d` -> `us-east1`.
    pub fn region(&self) -> Result<String> {
        region_from_zone(&self.project.zone)
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.state_dir {
            return Ok(dir.clone());
        }
        let home = dirs::home_dir()
            .ok_or_else(|| FleetError::Config("unable to determine home directory".to_string()))?;
        Ok(home.join(".gpufleet"))
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(FleetError::Config(msg));

        if self.project.id.trim().is_empty() {
            return invalid("project.id is required".to_string());
        }
        if self.project.zone.trim().is_empty() {
            return invalid("project.zone is required".to_string());
        }
        self.region()?;
        if !names::is_resource_name(&self.cluster.network_name_prefix) {
            return invalid("cluster.network_name_prefix must be a valid resource name".to_string());
        }
        let (_, base_prefix) = subnet::parse_ipv4_cidr(&self.cluster.subnet_cidr_base)
            .map_err(|e| FleetError::Config(format!("cluster.subnet_cidr_base: {e}")))?;
        if self.cluster.subnet_prefix < base_prefix || self.cluster.subnet_prefix > 30 {
            return invalid(format!(
                "cluster.subnet_prefix must be between {base_prefix} and 30"
            ));
        }
        if self.instance.max_run_hours == 0 {
            return invalid("instance.max_run_hours must be >= 1".to_string());
        }
        match self.instance.termination_action.to_ascii_uppercase().as_str() {
            "STOP" | "DELETE" => {}
            other => return invalid(format!("instance.termination_action {other} is not STOP or DELETE")),
        }
        check_ports(&self.network.ports)?;
        if self.disk.size_gb == 0 {
            return invalid("disk.size_gb must be >= 1".to_string());
        }
        Ok(())
    }
}

/// The service-ports rule is open to the internet, and an empty port list
/// would allow every TCP port, so at least one port is required.
pub(crate) fn check_ports(ports: &[u16]) -> Result<()> {
    if ports.is_empty() {
        return Err(FleetError::Config("network.ports must list at least one port".to_string()));
    }
    if ports.contains(&0) {
        return Err(FleetError::Config("network.ports must be between 1 and 65535".to_string()));
    }
    Ok(())
}

pub fn region_from_zone(zone: &str) -> Result<String> {
    let parts: Vec<&str> = zone.trim().split('-').collect();
    if parts.len() < 2 || parts.iter().any(|p| p.is_empty()) {
        return Err(FleetError::Config(format!("invalid zone: {zone}")));
    }
    Ok(parts[..2].join("-"))
}

mod human_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
