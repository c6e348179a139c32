//! Merge the remote inventory into the local state document.
//!
//! Remote truth wins for every cluster it reports. A cluster the store
//! knows but the broad listing misses is looked up once more by its own
//! label before it is declared gone.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::compute::{ComputeClient, Instance};
use crate::error::Result;
use crate::lifecycle::InstanceState;
use crate::names;
use crate::state::{ClusterRecord, InstanceObservation, InstanceRecord, LastAction, StateDocument, StateStore};

/// What a pass changed, for reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Clusters seen remotely, by name.
    pub live: Vec<String>,
    /// Clusters recorded but never started, now marked terminated.
    pub never_started: Vec<String>,
    /// Clusters newly marked deleted this pass.
    pub deleted: Vec<String>,
}

pub struct StatusReconciler<'a> {
    compute: &'a dyn ComputeClient,
    store: &'a StateStore,
    profile: &'a str,
}

impl<'a> StatusReconciler<'a> {
    /// `profile` is recorded on clusters first learned from the remote.
    pub fn new(compute: &'a dyn ComputeClient, store: &'a StateStore, profile: &'a str) -> Self {
        Self {
            compute,
            store,
            profile,
        }
    }

    /// One reconciliation pass. The document is saved once, at the end.
    pub async fn sync(&self, now: DateTime<Utc>) -> Result<(StateDocument, SyncReport)> {
        let mut doc = self.store.load()?;
        let mut report = SyncReport::default();

        let listed = self.compute.list_instances(&names::managed_filter()).await?;
        let groups = group_by_cluster(&listed);
        debug!(instances = listed.len(), clusters = groups.len(), "listed managed instances");

        for (cluster, instances) in &groups {
            let record = doc.cluster_entry(cluster);
            apply_live(record, instances, self.profile, now);
            report.live.push(cluster.clone());
        }

        let missing: Vec<String> = doc
            .clusters
            .keys()
            .filter(|name| !groups.contains_key(*name))
            .cloned()
            .collect();
        for name in missing {
            let found = self.compute.list_instances(&names::cluster_filter(&name)).await?;
            let Some(record) = doc.clusters.get_mut(&name) else {
                continue;
            };
            if !found.is_empty() {
                warn!(cluster = %name, instances = found.len(), "cluster missing from managed listing");
                let instances: Vec<&Instance> = found.iter().collect();
                apply_live(record, &instances, self.profile, now);
                report.live.push(name);
                continue;
            }
            match mark_missing(record, now) {
                Missing::NeverStarted => report.never_started.push(name),
                Missing::Deleted => {
                    info!(cluster = %name, "cluster no longer exists remotely");
                    report.deleted.push(name);
                }
                Missing::Unchanged => {}
            }
        }

        doc.updated_at = Some(now);
        self.store.save(&doc)?;
        info!(
            live = report.live.len(),
            deleted = report.deleted.len(),
            "status synced"
        );
        Ok((doc, report))
    }
}

/// Managed instances keyed by their `cluster` label.
fn group_by_cluster(instances: &[Instance]) -> BTreeMap<String, Vec<&Instance>> {
    let mut groups: BTreeMap<String, Vec<&Instance>> = BTreeMap::new();
    for instance in instances {
        if !names::managed_filter().matches(&instance.labels) {
            continue;
        }
        let Some(cluster) = instance
            .labels
            .get(names::CLUSTER_LABEL)
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
        else {
            continue;
        };
        groups.entry(cluster.to_string()).or_default().push(instance);
    }
    groups
}

/// Replace the record's instances with what the remote reports.
fn apply_live(record: &mut ClusterRecord, instances: &[&Instance], profile: &str, now: DateTime<Utc>) {
    if record.profile.is_empty() {
        record.profile = profile.to_string();
    }
    if record.created_at.is_none() {
        record.created_at = Some(now);
    }
    record.deleted_at = None;

    let mut live = BTreeMap::new();
    for instance in instances {
        let observation = InstanceObservation::from_instance(instance);
        let index = instance
            .labels
            .get(names::CLUSTER_INDEX_LABEL)
            .and_then(|raw| raw.trim().parse().ok())
            .or_else(|| names::parse_instance_index(&record.name, &instance.name))
            .unwrap_or(0);
        let created_at = record
            .instances
            .get(&instance.name)
            .and_then(|existing| existing.created_at)
            .or(Some(now));
        live.insert(
            instance.name.clone(),
            InstanceRecord {
                name: observation.name,
                index,
                state: observation.state,
                external_ip: observation.external_ip,
                internal_ip: observation.internal_ip,
                created_at,
                updated_at: Some(now),
            },
        );
    }
    record.num_instances = live.len();
    record.instances = live;
    record.refresh_status();
    record.updated_at = Some(now);
}

enum Missing {
    NeverStarted,
    Deleted,
    Unchanged,
}

/// Nothing of the cluster exists remotely. A cluster only ever recorded is
/// terminated; anything else is deleted, keeping an earlier deletion time.
fn mark_missing(record: &mut ClusterRecord, now: DateTime<Utc>) -> Missing {
    if record.last_action == Some(LastAction::Create) && !record.is_deleted() {
        let count = record.num_instances;
        record.ensure_instances(count, now);
        let before = record.clone();
        for instance in record.instances.values_mut() {
            instance.state = InstanceState::Terminated;
            instance.external_ip = None;
            instance.internal_ip = None;
        }
        record.refresh_status();
        if *record != before {
            record.updated_at = Some(now);
        }
        return Missing::NeverStarted;
    }
    if record.is_deleted() {
        return Missing::Unchanged;
    }
    record.deleted_at = Some(now);
    for instance in record.instances.values_mut() {
        instance.state = InstanceState::Terminated;
        instance.external_ip = None;
        instance.internal_ip = None;
    }
    record.refresh_status();
    record.updated_at = Some(now);
    Missing::Deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{AccessConfig, NetworkInterface};
    use crate::lifecycle::ClusterStatus;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn live(cluster: &str, index: usize, status: &str) -> Instance {
        let names = names::ClusterNames::new("gpufleet", cluster);
        Instance {
            name: names.instance(index),
            status: status.to_string(),
            labels: names.labels_for(index),
            network_interfaces: vec![NetworkInterface {
                network_ip: Some(format!("10.0.0.{}", index + 2)),
                access_configs: vec![AccessConfig {
                    nat_ip: Some(format!("34.0.0.{}", index + 2)),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn groups_only_managed_instances() {
        let mut stray = live("alpha", 5, "RUNNING");
        stray.labels.remove(names::MANAGED_LABEL_KEY);
        let instances = vec![live("alpha", 0, "RUNNING"), live("beta", 0, "TERMINATED"), stray];
        let groups = group_by_cluster(&instances);
        assert_eq!(groups.keys().collect::<Vec<_>>(), vec!["alpha", "beta"]);
        assert_eq!(groups["alpha"].len(), 1);
    }

    #[test]
    fn live_data_replaces_instances() {
        let mut record = ClusterRecord::new("alpha");
        record.num_instances = 3;
        record.ensure_instances(3, at(0));
        record.deleted_at = Some(at(1));

        let a = live("alpha", 0, "RUNNING");
        let b = live("alpha", 1, "STAGING");
        apply_live(&mut record, &[&a, &b], "default", at(10));

        assert_eq!(record.num_instances, 2);
        assert!(!record.instances.contains_key("alpha-2"));
        assert_eq!(record.instances["alpha-0"].external_ip.as_deref(), Some("34.0.0.2"));
        assert_eq!(record.instances["alpha-0"].created_at, Some(at(0)));
        assert_eq!(record.instances["alpha-1"].state, InstanceState::Starting);
        assert_eq!(record.status, ClusterStatus::Starting);
        assert_eq!(record.profile, "default");
        assert!(!record.is_deleted());
    }

    #[test]
    fn created_but_never_started_is_terminated() {
        let mut record = ClusterRecord::new("alpha");
        record.num_instances = 2;
        record.last_action = Some(LastAction::Create);
        assert!(matches!(mark_missing(&mut record, at(0)), Missing::NeverStarted));
        assert_eq!(record.status, ClusterStatus::Terminated);
        assert_eq!(record.instances.len(), 2);
        assert!(!record.is_deleted());
    }

    #[test]
    fn deletion_time_is_kept() {
        let mut record = ClusterRecord::new("alpha");
        record.last_action = Some(LastAction::Start);
        assert!(matches!(mark_missing(&mut record, at(0)), Missing::Deleted));
        assert_eq!(record.deleted_at, Some(at(0)));
        assert_eq!(record.status, ClusterStatus::Deleted);

        assert!(matches!(mark_missing(&mut record, at(60)), Missing::Unchanged));
        assert_eq!(record.deleted_at, Some(at(0)));
        assert_eq!(record.updated_at, Some(at(0)));
    }
}
