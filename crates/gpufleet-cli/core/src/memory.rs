//! An in-process [`ComputeClient`] for tests and dry runs.
//!
//! Every call takes effect immediately and is appended to a call log as
//! `"<method> <name>"`. Operations come back already finished, unless the
//! instance was marked failing or stalled.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::compute::{
    ComputeClient, ComputeResult, Disk, Firewall, Instance, LabelFilter, Metadata, Network,
    Scheduling, Subnetwork, Tags,
};
use crate::error::ComputeError;
use crate::names;
use crate::operation::{CompletedOperation, Operation, OperationHandle};

#[derive(Debug, Default)]
struct Inner {
    networks: BTreeMap<String, Network>,
    subnetworks: BTreeMap<String, Subnetwork>,
    firewalls: BTreeMap<String, Firewall>,
    instances: BTreeMap<String, Instance>,
    disks: BTreeMap<String, Disk>,
    calls: Vec<String>,
    failing: BTreeMap<String, String>,
    stalled: BTreeSet<String>,
    next_address: u32,
    next_operation: u64,
}

impl Inner {
    fn operation(&mut self) -> OperationHandle {
        self.next_operation += 1;
        CompletedOperation::boxed(format!("operation-{}", self.next_operation))
    }

    /// True when operations on `resource` do not take effect.
    fn intercepts(&self, resource: &str) -> bool {
        self.failing.contains_key(resource) || self.stalled.contains(resource)
    }

    /// A failed operation for an injected failure, one that never finishes
    /// for a stalled resource, otherwise a finished one.
    fn operation_for(&mut self, resource: &str) -> OperationHandle {
        self.next_operation += 1;
        let name = format!("operation-{}", self.next_operation);
        if let Some(message) = self.failing.get(resource) {
            return CompletedOperation::failed(name, message.clone());
        }
        if self.stalled.contains(resource) {
            return Box::new(StalledOperation { name });
        }
        CompletedOperation::boxed(name)
    }

    fn address(&mut self) -> u32 {
        self.next_address += 1;
        self.next_address
    }

    fn fingerprint(&mut self) -> Option<String> {
        Some(format!("fp-{}", self.address()))
    }
}

/// Simulated remote for one project and zone.
#[derive(Debug, Default)]
pub struct InMemoryCompute {
    inner: Mutex<Inner>,
}

impl InMemoryCompute {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, method: &str, name: &str) -> MutexGuard<'_, Inner> {
        let mut inner = self.lock();
        inner.calls.push(format!("{method} {name}"));
        inner
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Calls other than `get_*` and `list_*`.
    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("get_") && !c.starts_with("list_"))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Operations touching `instance` finish with `message` as their error.
    pub fn fail_instance(&self, instance: &str, message: &str) {
        self.lock()
            .failing
            .insert(instance.to_string(), message.to_string());
    }

    /// Operations touching `instance` stay in flight until the caller gives up.
    pub fn stall_instance(&self, instance: &str) {
        self.lock().stalled.insert(instance.to_string());
    }

    pub fn clear_failures(&self) {
        let mut inner = self.lock();
        inner.failing.clear();
        inner.stalled.clear();
    }

    pub fn instance(&self, name: &str) -> Option<Instance> {
        self.lock().instances.get(name).cloned()
    }

    pub fn instance_names(&self) -> Vec<String> {
        self.lock().instances.keys().cloned().collect()
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.lock().networks.contains_key(name)
    }

    pub fn has_subnetwork(&self, name: &str) -> bool {
        self.lock().subnetworks.contains_key(name)
    }

    pub fn firewall(&self, name: &str) -> Option<Firewall> {
        self.lock().firewalls.get(name).cloned()
    }

    pub fn has_disk(&self, name: &str) -> bool {
        self.lock().disks.contains_key(name)
    }

    /// Place an instance as if another client had created it.
    pub fn put_instance(&self, instance: Instance) {
        self.lock().instances.insert(instance.name.clone(), instance);
    }

    /// Remove an instance behind the orchestrator's back.
    pub fn remove_instance(&self, name: &str) -> Option<Instance> {
        self.lock().instances.remove(name)
    }

    pub fn set_status(&self, name: &str, status: &str) {
        if let Some(instance) = self.lock().instances.get_mut(name) {
            instance.status = status.to_string();
        }
    }

    pub fn put_disk(&self, disk: Disk) {
        self.lock().disks.insert(disk.name.clone(), disk);
    }
}

/// Polls fine, never finishes.
struct StalledOperation {
    name: String,
}

#[async_trait]
impl Operation for StalledOperation {
    fn name(&self) -> &str {
        &self.name
    }

    async fn poll(&mut self) -> Result<(), ComputeError> {
        Ok(())
    }

    fn done(&self) -> bool {
        false
    }

    fn progress(&self) -> u8 {
        50
    }
}

fn not_found(kind: &str, name: &str) -> ComputeError {
    ComputeError::NotFound(format!("{kind} {name}"))
}

fn in_use(kind: &str, name: &str, by: &str) -> ComputeError {
    ComputeError::Api {
        status: 400,
        message: format!("{kind} {name} is already being used by {by}"),
    }
}

#[async_trait]
impl ComputeClient for InMemoryCompute {
    async fn get_network(&self, name: &str) -> ComputeResult<Network> {
        let inner = self.record("get_network", name);
        inner.networks.get(name).cloned().ok_or_else(|| not_found("network", name))
    }

    async fn insert_network(&self, network: &Network) -> ComputeResult<OperationHandle> {
        let mut inner = self.record("insert_network", &network.name);
        if inner.networks.contains_key(&network.name) {
            return Err(ComputeError::AlreadyExists(format!("network {}", network.name)));
        }
        inner.networks.insert(network.name.clone(), network.clone());
        Ok(inner.operation())
    }

    async fn delete_network(&self, name: &str) -> ComputeResult<OperationHandle> {
        let mut inner = self.record("delete_network", name);
        if !inner.networks.contains_key(name) {
            return Err(not_found("network", name));
        }
        let dependent = inner
            .subnetworks
            .values()
            .map(|s| s.network.clone())
            .chain(inner.firewalls.values().map(|f| f.network.clone()))
            .find(|link| names::short_name(link) == name);
        if let Some(link) = dependent {
            return Err(in_use("network", name, &link));
        }
        inner.networks.remove(name);
        Ok(inner.operation())
    }

    async fn get_subnetwork(&self, name: &str) -> ComputeResult<Subnetwork> {
        let inner = self.record("get_subnetwork", name);
        inner
            .subnetworks
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("subnetwork", name))
    }

    async fn insert_subnetwork(&self, subnetwork: &Subnetwork) -> ComputeResult<OperationHandle> {
        let mut inner = self.record("insert_subnetwork", &subnetwork.name);
        if inner.subnetworks.contains_key(&subnetwork.name) {
            return Err(ComputeError::AlreadyExists(format!("subnetwork {}", subnetwork.name)));
        }
        let network = names::short_name(&subnetwork.network).to_string();
        if !inner.networks.contains_key(&network) {
            return Err(not_found("network", &network));
        }
        inner.subnetworks.insert(subnetwork.name.clone(), subnetwork.clone());
        Ok(inner.operation())
    }

    async fn delete_subnetwork(&self, name: &str) -> ComputeResult<OperationHandle> {
        let mut inner = self.record("delete_subnetwork", name);
        if !inner.subnetworks.contains_key(name) {
            return Err(not_found("subnetwork", name));
        }
        let user = inner
            .instances
            .values()
            .find(|i| {
                i.network_interfaces.iter().any(|nic| {
                    nic.subnetwork.as_deref().map(names::short_name) == Some(name)
                })
            })
            .map(|i| i.name.clone());
        if let Some(user) = user {
            return Err(in_use("subnetwork", name, &user));
        }
        inner.subnetworks.remove(name);
        Ok(inner.operation())
    }

    async fn get_firewall(&self, name: &str) -> ComputeResult<Firewall> {
        let inner = self.record("get_firewall", name);
        inner.firewalls.get(name).cloned().ok_or_else(|| not_found("firewall", name))
    }

    async fn insert_firewall(&self, firewall: &Firewall) -> ComputeResult<OperationHandle> {
        let mut inner = self.record("insert_firewall", &firewall.name);
        if inner.firewalls.contains_key(&firewall.name) {
            return Err(ComputeError::AlreadyExists(format!("firewall {}", firewall.name)));
        }
        inner.firewalls.insert(firewall.name.clone(), firewall.clone());
        Ok(inner.operation())
    }

    async fn patch_firewall(&self, name: &str, firewall: &Firewall) -> ComputeResult<OperationHandle> {
        let mut inner = self.record("patch_firewall", name);
        if !inner.firewalls.contains_key(name) {
            return Err(not_found("firewall", name));
        }
        inner.firewalls.insert(name.to_string(), firewall.clone());
        Ok(inner.operation())
    }

    async fn delete_firewall(&self, name: &str) -> ComputeResult<OperationHandle> {
        let mut inner = self.record("delete_firewall", name);
        if inner.firewalls.remove(name).is_none() {
            return Err(not_found("firewall", name));
        }
        Ok(inner.operation())
    }

    async fn get_instance(&self, name: &str) -> ComputeResult<Instance> {
        let inner = self.record("get_instance", name);
        inner.instances.get(name).cloned().ok_or_else(|| not_found("instance", name))
    }

    async fn list_instances(&self, filter: &LabelFilter) -> ComputeResult<Vec<Instance>> {
        let inner = self.record("list_instances", &filter.expression());
        Ok(inner
            .instances
            .values()
            .filter(|i| filter.matches(&i.labels))
            .cloned()
            .collect())
    }

    async fn insert_instance(&self, instance: &Instance) -> ComputeResult<OperationHandle> {
        let mut inner = self.record("insert_instance", &instance.name);
        if inner.instances.contains_key(&instance.name) {
            return Err(ComputeError::AlreadyExists(format!("instance {}", instance.name)));
        }
        if inner.intercepts(&instance.name) {
            return Ok(inner.operation_for(&instance.name));
        }

        let mut created = instance.clone();
        created.status = "RUNNING".to_string();
        for nic in created.network_interfaces.iter_mut() {
            let n = inner.address();
            nic.network_ip = Some(format!("10.0.{}.{}", n / 250, n % 250 + 2));
            for access in nic.access_configs.iter_mut() {
                let n = inner.address();
                access.nat_ip = Some(format!("34.0.{}.{}", n / 250, n % 250 + 2));
            }
        }
        if let Some(tags) = created.tags.as_mut() {
            tags.fingerprint = inner.fingerprint();
        }
        if let Some(metadata) = created.metadata.as_mut() {
            metadata.fingerprint = inner.fingerprint();
        }
        for disk in created.disks.iter_mut() {
            if let Some(params) = disk.initialize_params.take() {
                inner.disks.insert(
                    params.disk_name.clone(),
                    Disk {
                        name: params.disk_name.clone(),
                        size_gb: params.disk_size_gb.clone(),
                    },
                );
                disk.source = Some(params.disk_name);
            }
        }
        inner.instances.insert(created.name.clone(), created);
        Ok(inner.operation())
    }

    async fn start_instance(&self, name: &str) -> ComputeResult<OperationHandle> {
        let mut inner = self.record("start_instance", name);
        if inner.intercepts(name) {
            return Ok(inner.operation_for(name));
        }
        let addresses: Vec<u32> = (0..2).map(|_| inner.address()).collect();
        let instance = inner.instances.get_mut(name).ok_or_else(|| not_found("instance", name))?;
        instance.status = "RUNNING".to_string();
        for nic in instance.network_interfaces.iter_mut() {
            for access in nic.access_configs.iter_mut() {
                if access.nat_ip.is_none() {
                    access.nat_ip = Some(format!("34.1.0.{}", addresses[0] % 250 + 2));
                }
            }
            if nic.network_ip.is_none() {
                nic.network_ip = Some(format!("10.1.0.{}", addresses[1] % 250 + 2));
            }
        }
        Ok(inner.operation())
    }

    async fn stop_instance(&self, name: &str) -> ComputeResult<OperationHandle> {
        let mut inner = self.record("stop_instance", name);
        if inner.intercepts(name) {
            return Ok(inner.operation_for(name));
        }
        let instance = inner.instances.get_mut(name).ok_or_else(|| not_found("instance", name))?;
        instance.status = "TERMINATED".to_string();
        for nic in instance.network_interfaces.iter_mut() {
            for access in nic.access_configs.iter_mut() {
                access.nat_ip = None;
            }
        }
        Ok(inner.operation())
    }

    async fn delete_instance(&self, name: &str) -> ComputeResult<OperationHandle> {
        let mut inner = self.record("delete_instance", name);
        if inner.intercepts(name) {
            return Ok(inner.operation_for(name));
        }
        let instance = inner.instances.remove(name).ok_or_else(|| not_found("instance", name))?;
        for disk in instance.disks.iter().filter(|d| d.auto_delete) {
            let disk_name = disk
                .source
                .as_deref()
                .map(names::short_name)
                .unwrap_or(&disk.device_name)
                .to_string();
            inner.disks.remove(&disk_name);
        }
        Ok(inner.operation())
    }

    async fn set_instance_scheduling(
        &self,
        name: &str,
        scheduling: &Scheduling,
    ) -> ComputeResult<OperationHandle> {
        let mut inner = self.record("set_instance_scheduling", name);
        if inner.intercepts(name) {
            return Ok(inner.operation_for(name));
        }
        let instance = inner.instances.get_mut(name).ok_or_else(|| not_found("instance", name))?;
        if instance.status != "TERMINATED" {
            return Err(ComputeError::Api {
                status: 400,
                message: format!("instance {name} must be stopped to change scheduling"),
            });
        }
        instance.scheduling = Some(scheduling.clone());
        Ok(inner.operation())
    }

    async fn set_instance_tags(&self, name: &str, tags: &Tags) -> ComputeResult<OperationHandle> {
        let mut inner = self.record("set_instance_tags", name);
        let fingerprint = inner.fingerprint();
        let instance = inner.instances.get_mut(name).ok_or_else(|| not_found("instance", name))?;
        let current = instance.tags.as_ref().and_then(|t| t.fingerprint.clone());
        if current != tags.fingerprint {
            return Err(ComputeError::Api {
                status: 412,
                message: format!("stale tags fingerprint for {name}"),
            });
        }
        instance.tags = Some(Tags {
            items: tags.items.clone(),
            fingerprint,
        });
        Ok(inner.operation())
    }

    async fn set_instance_metadata(
        &self,
        name: &str,
        metadata: &Metadata,
    ) -> ComputeResult<OperationHandle> {
        let mut inner = self.record("set_instance_metadata", name);
        let fingerprint = inner.fingerprint();
        let instance = inner.instances.get_mut(name).ok_or_else(|| not_found("instance", name))?;
        let current = instance.metadata.as_ref().and_then(|m| m.fingerprint.clone());
        if current != metadata.fingerprint {
            return Err(ComputeError::Api {
                status: 412,
                message: format!("stale metadata fingerprint for {name}"),
            });
        }
        instance.metadata = Some(Metadata {
            items: metadata.items.clone(),
            fingerprint,
        });
        Ok(inner.operation())
    }

    async fn set_disk_auto_delete(
        &self,
        instance: &str,
        device_name: &str,
        auto_delete: bool,
    ) -> ComputeResult<OperationHandle> {
        let mut inner = self.record("set_disk_auto_delete", instance);
        let found = inner
            .instances
            .get_mut(instance)
            .ok_or_else(|| not_found("instance", instance))?;
        let disk = found
            .disks
            .iter_mut()
            .find(|d| d.device_name == device_name)
            .ok_or_else(|| not_found("disk", device_name))?;
        disk.auto_delete = auto_delete;
        Ok(inner.operation())
    }

    async fn get_disk(&self, name: &str) -> ComputeResult<Disk> {
        let inner = self.record("get_disk", name);
        inner.disks.get(name).cloned().ok_or_else(|| not_found("disk", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::NetworkInterface;

    #[tokio::test]
    async fn reports_not_found_and_duplicates() {
        let compute = InMemoryCompute::new();
        assert!(compute.get_network("n").await.unwrap_err().is_not_found());

        let network = Network {
            name: "n".to_string(),
            auto_create_subnetworks: Some(false),
        };
        compute.insert_network(&network).await.unwrap();
        assert!(compute.insert_network(&network).await.unwrap_err().is_already_exists());
        assert_eq!(compute.calls(), vec!["get_network n", "insert_network n", "insert_network n"]);
    }

    #[tokio::test]
    async fn network_in_use_cannot_be_deleted() {
        let compute = InMemoryCompute::new();
        compute
            .insert_network(&Network {
                name: "n".to_string(),
                auto_create_subnetworks: Some(false),
            })
            .await
            .unwrap();
        compute
            .insert_subnetwork(&Subnetwork {
                name: "s".to_string(),
                ip_cidr_range: "10.0.0.0/24".to_string(),
                network: "projects/p/global/networks/n".to_string(),
            })
            .await
            .unwrap();
        assert!(compute.delete_network("n").await.is_err());
        compute.delete_subnetwork("s").await.unwrap();
        compute.delete_network("n").await.unwrap();
    }

    #[tokio::test]
    async fn stalled_instance_never_finishes() {
        let compute = InMemoryCompute::new();
        compute.stall_instance("alpha-0");
        let instance = Instance {
            name: "alpha-0".to_string(),
            ..Default::default()
        };
        let mut op = compute.insert_instance(&instance).await.unwrap();
        op.poll().await.unwrap();
        assert!(!op.done());
        assert_eq!(op.progress(), 50);
        assert!(compute.instance("alpha-0").is_none());
    }

    #[tokio::test]
    async fn injected_failure_fails_the_operation() {
        let compute = InMemoryCompute::new();
        compute.fail_instance("alpha-1", "ZONE_RESOURCE_POOL_EXHAUSTED");
        let instance = Instance {
            name: "alpha-1".to_string(),
            network_interfaces: vec![NetworkInterface::default()],
            ..Default::default()
        };
        let mut op = compute.insert_instance(&instance).await.unwrap();
        let err = op.poll().await.unwrap_err();
        assert!(err.to_string().contains("ZONE_RESOURCE_POOL_EXHAUSTED"));
        assert!(compute.instance("alpha-1").is_none());
    }
}
