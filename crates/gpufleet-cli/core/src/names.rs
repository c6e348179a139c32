//! Naming of every remote resource a cluster owns, and the labels that mark
//! resources as managed.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::compute::LabelFilter;
use crate::error::{FleetError, Result};

pub const MANAGED_LABEL_KEY: &str = "gpufleet";
pub const MANAGED_LABEL_VALUE: &str = "managed";
pub const CLUSTER_LABEL: &str = "cluster";
pub const CLUSTER_INDEX_LABEL: &str = "cluster_index";
pub const CLUSTER_ROLE_LABEL: &str = "cluster_role";

/// Longest name the provider accepts for networks, firewalls, instances and tags.
pub const MAX_RESOURCE_NAME: usize = 63;

static RESOURCE_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z]([a-z0-9-]{0,61}[a-z0-9])?$").ok());

pub fn is_resource_name(name: &str) -> bool {
    RESOURCE_NAME.as_ref().is_some_and(|re| re.is_match(name))
}

/// Names of a cluster's resources, derived from the cluster name and the
/// configured network prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNames {
    pub cluster: String,
    pub network: String,
    pub subnetwork: String,
    pub internal_firewall: String,
    pub ssh_firewall: String,
    pub ports_firewall: String,
}

impl ClusterNames {
    pub fn new(network_prefix: &str, cluster: &str) -> Self {
        let network = format!("{network_prefix}-{cluster}");
        Self {
            cluster: cluster.to_string(),
            subnetwork: format!("{network}-subnet"),
            internal_firewall: format!("{network}-internal"),
            ssh_firewall: format!("{network}-ssh"),
            ports_firewall: format!("{network}-ports"),
            network,
        }
    }

    /// Check every name the cluster would create for `node_count` nodes, so a
    /// name the provider would refuse is caught before anything is created.
    pub fn check(&self, node_count: usize) -> Result<()> {
        let last_instance = self.instance(node_count.saturating_sub(1));
        let (cluster_tag, master_tag) = (self.cluster_tag(), self.master_tag());
        let derived: [&str; 8] = [
            self.network.as_str(),
            &self.subnetwork,
            &self.internal_firewall,
            &self.ssh_firewall,
            &self.ports_firewall,
            &last_instance,
            &cluster_tag,
            &master_tag,
        ];
        match derived.into_iter().find(|name| !is_resource_name(name)) {
            None => Ok(()),
            Some(bad) if bad.len() > MAX_RESOURCE_NAME => Err(FleetError::Validation(format!(
                "cluster name {} is too long: derived name {bad} exceeds {MAX_RESOURCE_NAME} characters",
                self.cluster
            ))),
            Some(bad) => Err(FleetError::Validation(format!(
                "cluster name {} derives invalid resource name {bad}",
                self.cluster
            ))),
        }
    }

    /// Firewall rules in creation order; deletion walks the same list.
    pub fn firewalls(&self) -> [&str; 3] {
        [&self.internal_firewall, &self.ssh_firewall, &self.ports_firewall]
    }

    pub fn instance(&self, index: usize) -> String {
        instance_name(&self.cluster, index)
    }

    /// Network tag every node carries; firewall rules target it.
    pub fn cluster_tag(&self) -> String {
        format!("cluster-{}", self.cluster)
    }

    pub fn master_tag(&self) -> String {
        format!("cluster-{}-master", self.cluster)
    }

    /// Required network tags for the node at `index`. Index 0 also gets the
    /// entry point tag and the configured base tags.
    pub fn tags_for(&self, index: usize, tags_base: &[String]) -> Vec<String> {
        let mut tags = vec![self.cluster_tag()];
        if index == 0 {
            tags.push(self.master_tag());
            tags.extend(tags_base.iter().cloned());
        }
        tags
    }

    /// Labels stamped on the node at `index`, including the managed marker.
    pub fn labels_for(&self, index: usize) -> BTreeMap<String, String> {
        let role = if index == 0 { "master" } else { "worker" };
        BTreeMap::from([
            (MANAGED_LABEL_KEY.to_string(), MANAGED_LABEL_VALUE.to_string()),
            (CLUSTER_LABEL.to_string(), self.cluster.clone()),
            (CLUSTER_INDEX_LABEL.to_string(), index.to_string()),
            (CLUSTER_ROLE_LABEL.to_string(), role.to_string()),
        ])
    }

    pub fn filter(&self) -> LabelFilter {
        cluster_filter(&self.cluster)
    }
}

pub fn instance_name(cluster: &str, index: usize) -> String {
    format!("{cluster}-{index}")
}

/// Index encoded in `<cluster>-<index>`, if the name has that shape.
pub fn parse_instance_index(cluster: &str, instance: &str) -> Option<usize> {
    instance
        .strip_prefix(cluster)?
        .strip_prefix('-')?
        .parse()
        .ok()
}

/// `projects/<project>/global/<kind>/<name>`
pub fn global_resource(project: &str, kind: &str, name: &str) -> String {
    format!("projects/{project}/global/{kind}/{name}")
}

pub fn region_resource(project: &str, region: &str, kind: &str, name: &str) -> String {
    format!("projects/{project}/regions/{region}/{kind}/{name}")
}

pub fn zone_resource(project: &str, zone: &str, kind: &str, name: &str) -> String {
    format!("projects/{project}/zones/{zone}/{kind}/{name}")
}

/// Last path segment of a resource link, `.../networks/foo` -> `foo`.
pub fn short_name(link: &str) -> &str {
    link.rsplit('/').next().unwrap_or(link)
}

pub fn managed_filter() -> LabelFilter {
    LabelFilter::new(MANAGED_LABEL_KEY, MANAGED_LABEL_VALUE)
}

pub fn cluster_filter(cluster: &str) -> LabelFilter {
    LabelFilter::new(CLUSTER_LABEL, cluster)
}
