//! The compute client capability and the resource shapes it exchanges.
//!
//! Field names follow the provider's JSON representation so a REST backend
//! can send and receive these types directly.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ComputeError;
use crate::operation::OperationHandle;

pub type ComputeResult<T> = Result<T, ComputeError>;

/// Issues calls against the remote VM platform for one project and zone.
///
/// Mutating calls hand back an [`OperationHandle`] that must be polled until
/// done. Implementations report a missing resource as
/// [`ComputeError::NotFound`] and a duplicate insert as
/// [`ComputeError::AlreadyExists`].
#[async_trait]
pub trait ComputeClient: Send + Sync {
    async fn get_network(&self, name: &str) -> ComputeResult<Network>;
    async fn insert_network(&self, network: &Network) -> ComputeResult<OperationHandle>;
    async fn delete_network(&self, name: &str) -> ComputeResult<OperationHandle>;

    async fn get_subnetwork(&self, name: &str) -> ComputeResult<Subnetwork>;
    async fn insert_subnetwork(&self, subnetwork: &Subnetwork) -> ComputeResult<OperationHandle>;
    async fn delete_subnetwork(&self, name: &str) -> ComputeResult<OperationHandle>;

    async fn get_firewall(&self, name: &str) -> ComputeResult<Firewall>;
    async fn insert_firewall(&self, firewall: &Firewall) -> ComputeResult<OperationHandle>;
    async fn patch_firewall(&self, name: &str, firewall: &Firewall) -> ComputeResult<OperationHandle>;
    async fn delete_firewall(&self, name: &str) -> ComputeResult<OperationHandle>;

    async fn get_instance(&self, name: &str) -> ComputeResult<Instance>;
    async fn list_instances(&self, filter: &LabelFilter) -> ComputeResult<Vec<Instance>>;
    async fn insert_instance(&self, instance: &Instance) -> ComputeResult<OperationHandle>;
    async fn start_instance(&self, name: &str) -> ComputeResult<OperationHandle>;
    async fn stop_instance(&self, name: &str) -> ComputeResult<OperationHandle>;
    async fn delete_instance(&self, name: &str) -> ComputeResult<OperationHandle>;
    async fn set_instance_scheduling(
        &self,
        name: &str,
        scheduling: &Scheduling,
    ) -> ComputeResult<OperationHandle>;
    async fn set_instance_tags(&self, name: &str, tags: &Tags) -> ComputeResult<OperationHandle>;
    async fn set_instance_metadata(
        &self,
        name: &str,
        metadata: &Metadata,
    ) -> ComputeResult<OperationHandle>;
    async fn set_disk_auto_delete(
        &self,
        instance: &str,
        device_name: &str,
        auto_delete: bool,
    ) -> ComputeResult<OperationHandle>;

    async fn get_disk(&self, name: &str) -> ComputeResult<Disk>;
}

/// Label equality filter for instance listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelFilter {
    pub key: String,
    pub value: String,
}

impl LabelFilter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Provider filter expression, e.g. `labels.cluster = "alpha"`.
    pub fn expression(&self) -> String {
        format!("labels.{} = \"{}\"", self.key, self.value)
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        labels.get(&self.key).is_some_and(|v| *v == self.value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_create_subnetworks: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subnetwork {
    pub name: String,
    #[serde(default)]
    pub ip_cidr_range: String,
    #[serde(default)]
    pub network: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Firewall {
    pub name: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub direction: String,
    #[serde(default)]
    pub target_tags: Vec<String>,
    #[serde(default)]
    pub source_ranges: Vec<String>,
    #[serde(default)]
    pub allowed: Vec<FirewallAllow>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallAllow {
    #[serde(rename = "IPProtocol")]
    pub ip_protocol: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
}

impl FirewallAllow {
    pub fn new(protocol: &str, ports: &[&str]) -> Self {
        Self {
            ip_protocol: protocol.to_string(),
            ports: ports.iter().map(|p| p.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub machine_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default)]
    pub disks: Vec<AttachedDisk>,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling: Option<Scheduling>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Tags>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_accounts: Vec<ServiceAccount>,
}

impl Instance {
    /// NAT address of the first interface, present only when publicly reachable.
    pub fn external_ip(&self) -> Option<&str> {
        self.network_interfaces
            .first()?
            .access_configs
            .first()?
            .nat_ip
            .as_deref()
            .filter(|ip| !ip.is_empty())
    }

    pub fn internal_ip(&self) -> Option<&str> {
        self.network_interfaces
            .first()?
            .network_ip
            .as_deref()
            .filter(|ip| !ip.is_empty())
    }

    pub fn tag_items(&self) -> &[String] {
        self.tags.as_ref().map(|t| t.items.as_slice()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDisk {
    #[serde(default)]
    pub boot: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub device_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialize_params: Option<DiskInitializeParams>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskInitializeParams {
    pub disk_name: String,
    /// int64 travels as a decimal string.
    pub disk_size_gb: String,
    pub disk_type: String,
    pub source_image: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    #[serde(default)]
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnetwork: Option<String>,
    #[serde(rename = "networkIP", default, skip_serializing_if = "Option::is_none")]
    pub network_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessConfig {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(rename = "natIP", default, skip_serializing_if = "Option::is_none")]
    pub nat_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_tier: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scheduling {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_host_maintenance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_termination_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automatic_restart: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_run_duration: Option<RunDuration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDuration {
    /// int64 travels as a decimal string.
    pub seconds: String,
}

impl RunDuration {
    pub fn hours(hours: u32) -> Self {
        Self {
            seconds: (u64::from(hours) * 3600).to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tags {
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub items: Vec<MetadataItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl Metadata {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|item| item.key == key)
            .map(|item| item.value.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataItem {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

impl MetadataItem {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccount {
    pub email: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    pub name: String,
    #[serde(default)]
    pub size_gb: String,
}
