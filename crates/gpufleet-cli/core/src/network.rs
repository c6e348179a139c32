//! Network-layer resources of a cluster: one network, one subnetwork and
//! three firewall rules.
//!
//! `ensure` walks them in dependency order and never mutates an existing
//! network or subnetwork. Firewall rules are replaced when they drift from
//! the configured shape. `cleanup` deletes them in reverse order and treats
//! not-found as already done.

use tracing::{debug, info};

use crate::compute::{ComputeClient, Firewall, FirewallAllow, Network, Subnetwork};
use crate::config::{self, FleetConfig};
use crate::error::{FleetError, Result};
use crate::names::{self, ClusterNames};
use crate::operation::Waiter;
use crate::progress::ProgressSink;
use crate::subnet;

const OPEN_INTERNET: &str = "0.0.0.0/0";

/// Everything needed to provision one cluster's network layer.
#[derive(Debug, Clone)]
pub struct NetworkPlan {
    pub names: ClusterNames,
    pub project: String,
    pub region: String,
    pub subnet_cidr: String,
    pub ports: Vec<u16>,
}

impl NetworkPlan {
    pub fn new(config: &FleetConfig, cluster: &str) -> Result<Self> {
        config::check_ports(&config.network.ports)?;
        let subnet_cidr = subnet::derive_subnet_cidr(
            &config.cluster.subnet_cidr_base,
            config.cluster.subnet_prefix,
            cluster,
        )?;
        Ok(Self {
            names: ClusterNames::new(&config.cluster.network_name_prefix, cluster),
            project: config.project.id.clone(),
            region: config.region()?,
            subnet_cidr,
            ports: config.network.ports.clone(),
        })
    }

    pub fn network_link(&self) -> String {
        names::global_resource(&self.project, "networks", &self.names.network)
    }

    pub fn subnetwork_link(&self) -> String {
        names::region_resource(&self.project, &self.region, "subnetworks", &self.names.subnetwork)
    }

    /// Desired firewall rules, in creation order.
    pub fn firewall_rules(&self) -> Vec<Firewall> {
        let network = self.network_link();
        let target_tags = vec![self.names.cluster_tag()];
        let rule = |name: &str, source: &str, allowed: Vec<FirewallAllow>| Firewall {
            name: name.to_string(),
            network: network.clone(),
            direction: "INGRESS".to_string(),
            target_tags: target_tags.clone(),
            source_ranges: vec![source.to_string()],
            allowed,
        };

        let ports: Vec<String> = self.ports.iter().map(u16::to_string).collect();
        let ports: Vec<&str> = ports.iter().map(String::as_str).collect();

        vec![
            rule(
                &self.names.internal_firewall,
                &self.subnet_cidr,
                vec![
                    FirewallAllow::new("tcp", &["0-65535"]),
                    FirewallAllow::new("udp", &["0-65535"]),
                    FirewallAllow::new("icmp", &[]),
                ],
            ),
            rule(&self.names.ssh_firewall, OPEN_INTERNET, vec![FirewallAllow::new("tcp", &["22"])]),
            rule(&self.names.ports_firewall, OPEN_INTERNET, vec![FirewallAllow::new("tcp", &ports)]),
        ]
    }
}

/// Provisions and tears down the network layer through a compute client.
pub struct NetworkProvisioner<'a> {
    compute: &'a dyn ComputeClient,
    waiter: &'a Waiter,
    progress: &'a dyn ProgressSink,
}

impl<'a> NetworkProvisioner<'a> {
    pub fn new(compute: &'a dyn ComputeClient, waiter: &'a Waiter, progress: &'a dyn ProgressSink) -> Self {
        Self {
            compute,
            waiter,
            progress,
        }
    }

    /// Network, then subnetwork, then firewall rules. The first failure
    /// aborts the rest and is returned as is.
    pub async fn ensure(&self, plan: &NetworkPlan) -> Result<()> {
        self.ensure_network(plan).await?;
        self.ensure_subnetwork(plan).await?;
        for rule in plan.firewall_rules() {
            self.ensure_firewall(rule).await?;
        }
        info!(cluster = %plan.names.cluster, cidr = %plan.subnet_cidr, "network layer ready");
        Ok(())
    }

    async fn ensure_network(&self, plan: &NetworkPlan) -> Result<()> {
        let name = &plan.names.network;
        let task = format!("network {name}");
        match self.compute.get_network(name).await {
            Ok(_) => {
                self.progress.done(&task, &format!("Ready networks/{name}"));
                return Ok(());
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(self.failed(&task, e.into())),
        }

        self.progress.start(&task, &format!("Creating network {name}"));
        let network = Network {
            name: name.clone(),
            auto_create_subnetworks: Some(false),
        };
        let result = match self.compute.insert_network(&network).await {
            Ok(op) => self.waiter.wait(op).await,
            // Lost a race with another client; the network is there.
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e.into()),
        };
        result.map_err(|e| self.failed(&task, e))?;
        self.progress.done(&task, &format!("Created networks/{name}"));
        Ok(())
    }

    async fn ensure_subnetwork(&self, plan: &NetworkPlan) -> Result<()> {
        let name = &plan.names.subnetwork;
        let task = format!("subnetwork {name}");
        match self.compute.get_subnetwork(name).await {
            Ok(existing) => {
                if existing.ip_cidr_range != plan.subnet_cidr {
                    debug!(
                        subnetwork = %name,
                        existing = %existing.ip_cidr_range,
                        derived = %plan.subnet_cidr,
                        "keeping existing subnetwork range"
                    );
                }
                self.progress.done(&task, &format!("Ready subnetworks/{name}"));
                return Ok(());
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(self.failed(&task, e.into())),
        }

        self.progress.start(&task, &format!("Creating subnetwork {name}"));
        let subnetwork = Subnetwork {
            name: name.clone(),
            ip_cidr_range: plan.subnet_cidr.clone(),
            network: plan.network_link(),
        };
        let result = match self.compute.insert_subnetwork(&subnetwork).await {
            Ok(op) => self.waiter.wait(op).await,
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e.into()),
        };
        result.map_err(|e| self.failed(&task, e))?;
        self.progress.done(&task, &format!("Created subnetworks/{name}"));
        Ok(())
    }

    async fn ensure_firewall(&self, rule: Firewall) -> Result<()> {
        let task = format!("firewall {}", rule.name);
        let op = match self.compute.get_firewall(&rule.name).await {
            Ok(existing) if firewall_matches(&existing, &rule) => {
                self.progress.done(&task, &format!("Ready firewalls/{}", rule.name));
                return Ok(());
            }
            Ok(_) => {
                self.progress.start(&task, &format!("Updating firewall {}", rule.name));
                self.compute.patch_firewall(&rule.name, &rule).await
            }
            Err(e) if e.is_not_found() => {
                self.progress.start(&task, &format!("Creating firewall {}", rule.name));
                self.compute.insert_firewall(&rule).await
            }
            Err(e) => return Err(self.failed(&task, e.into())),
        };
        let result = match op {
            Ok(op) => self.waiter.wait(op).await,
            Err(e) => Err(e.into()),
        };
        result.map_err(|e| self.failed(&task, e))?;
        self.progress.done(&task, &format!("Ready firewalls/{}", rule.name));
        Ok(())
    }

    /// Delete firewall rules, then the subnetwork, then the network.
    pub async fn cleanup(&self, plan: &NetworkPlan) -> Result<()> {
        for rule in plan.names.firewalls() {
            let task = format!("firewall {rule}");
            self.delete(&task, self.compute.delete_firewall(rule).await).await?;
        }
        let subnetwork = &plan.names.subnetwork;
        self.delete(
            &format!("subnetwork {subnetwork}"),
            self.compute.delete_subnetwork(subnetwork).await,
        )
        .await?;
        let network = &plan.names.network;
        self.delete(&format!("network {network}"), self.compute.delete_network(network).await)
            .await?;
        info!(cluster = %plan.names.cluster, "network layer removed");
        Ok(())
    }

    async fn delete(
        &self,
        task: &str,
        issued: crate::compute::ComputeResult<crate::operation::OperationHandle>,
    ) -> Result<()> {
        let op = match issued {
            Ok(op) => op,
            Err(e) if e.is_not_found() => {
                debug!(task, "already gone");
                self.progress.done(task, &format!("Already deleted {task}"));
                return Ok(());
            }
            Err(e) => return Err(self.failed(task, e.into())),
        };
        self.progress.start(task, &format!("Deleting {task}"));
        match self.waiter.wait(op).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(self.failed(task, e)),
        }
        self.progress.done(task, &format!("Deleted {task}"));
        Ok(())
    }

    fn failed(&self, task: &str, err: FleetError) -> FleetError {
        self.progress.fail(task, &err.to_string());
        err
    }
}

/// Compare the parts of a rule this system owns. The network link is left
/// out since the provider echoes it back as a full URL.
fn firewall_matches(existing: &Firewall, desired: &Firewall) -> bool {
    let sorted = |items: &[String]| {
        let mut items = items.to_vec();
        items.sort();
        items
    };
    existing.direction.eq_ignore_ascii_case(&desired.direction)
        && sorted(&existing.target_tags) == sorted(&desired.target_tags)
        && sorted(&existing.source_ranges) == sorted(&desired.source_ranges)
        && existing.allowed == desired.allowed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;

    fn config() -> FleetConfig {
        FleetConfig {
            project: ProjectConfig {
                id: "proj".to_string(),
                zone: "us-east1-d".to_string(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn plan_links_and_rules() {
        let plan = NetworkPlan::new(&config(), "alpha").unwrap();
        assert_eq!(plan.network_link(), "projects/proj/global/networks/gpufleet-alpha");
        assert_eq!(
            plan.subnetwork_link(),
            "projects/proj/regions/us-east1/subnetworks/gpufleet-alpha-subnet"
        );

        let rules = plan.firewall_rules();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].source_ranges, vec![plan.subnet_cidr.clone()]);
        assert_eq!(rules[0].allowed.len(), 3);
        assert_eq!(rules[1].allowed, vec![FirewallAllow::new("tcp", &["22"])]);
        assert_eq!(rules[2].allowed, vec![FirewallAllow::new("tcp", &["8888"])]);
        assert!(rules.iter().all(|r| r.target_tags == vec!["cluster-alpha".to_string()]));
    }

    #[test]
    fn firewall_drift_detection() {
        let plan = NetworkPlan::new(&config(), "alpha").unwrap();
        let desired = plan.firewall_rules().remove(2);

        let mut echoed = desired.clone();
        echoed.network = format!("https://compute.example/{}", desired.network);
        assert!(firewall_matches(&echoed, &desired));

        let mut drifted = desired.clone();
        drifted.allowed = vec![FirewallAllow::new("tcp", &["8888", "6006"])];
        assert!(!firewall_matches(&drifted, &desired));
    }

    #[test]
    fn bad_base_block_fails_plan() {
        let mut cfg = config();
        cfg.cluster.subnet_cidr_base = "not-a-block".to_string();
        assert!(matches!(
            NetworkPlan::new(&cfg, "alpha").unwrap_err(),
            FleetError::InvalidAddressBlock(_)
        ));
    }

    #[test]
    fn empty_port_list_never_reaches_a_rule() {
        let mut cfg = config();
        cfg.network.ports.clear();
        assert!(matches!(NetworkPlan::new(&cfg, "alpha").unwrap_err(), FleetError::Config(_)));
    }
}
