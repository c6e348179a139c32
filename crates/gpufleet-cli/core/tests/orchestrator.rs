use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use gpufleet_core::compute::{ComputeClient, Instance};
use gpufleet_core::config::{FleetConfig, ProjectConfig};
use gpufleet_core::memory::InMemoryCompute;
use gpufleet_core::names::ClusterNames;
use gpufleet_core::operation::Cancellation;
use gpufleet_core::progress::RecordingProgress;
use gpufleet_core::readiness::{Readiness, ReadinessCheck};
use gpufleet_core::state::LastAction;
use gpufleet_core::{
    ClusterOrchestrator, ClusterOverrides, ClusterStatus, FleetError, InstanceState, StateStore,
};
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    compute: Arc<InMemoryCompute>,
    progress: Arc<RecordingProgress>,
    orchestrator: ClusterOrchestrator,
}

fn config(state_dir: &TempDir) -> FleetConfig {
    FleetConfig {
        project: ProjectConfig {
            id: "proj".to_string(),
            zone: "us-east1-d".to_string(),
        },
        state_dir: Some(state_dir.path().to_path_buf()),
        ..Default::default()
    }
}

fn harness_with(configure: impl FnOnce(&mut FleetConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(&dir);
    configure(&mut cfg);
    let compute = Arc::new(InMemoryCompute::new());
    let progress = Arc::new(RecordingProgress::new());
    let store = StateStore::new(dir.path());
    let orchestrator = ClusterOrchestrator::new(compute.clone() as Arc<dyn ComputeClient>, cfg, store)
        .with_progress(progress.clone());
    Harness {
        _dir: dir,
        compute,
        progress,
        orchestrator,
    }
}

fn harness() -> Harness {
    harness_with(|_| {})
}

fn none() -> ClusterOverrides {
    ClusterOverrides::default()
}

fn position(calls: &[String], prefix: &str) -> Vec<usize> {
    calls
        .iter()
        .enumerate()
        .filter(|(_, c)| c.starts_with(prefix))
        .map(|(i, _)| i)
        .collect()
}

#[tokio::test]
async fn start_sync_delete_scenario() {
    let h = harness();
    h.orchestrator.start_cluster("alpha", 3, &none()).await.unwrap();
    assert_eq!(h.compute.instance_names(), vec!["alpha-0", "alpha-1", "alpha-2"]);
    assert!(h.compute.has_network("gpufleet-alpha"));
    assert!(h.compute.has_subnetwork("gpufleet-alpha-subnet"));

    let (doc, report) = h.orchestrator.sync_status().await.unwrap();
    assert_eq!(report.live, vec!["alpha"]);
    let alpha = doc.cluster("alpha").unwrap();
    assert_eq!(alpha.instances.len(), 3);
    assert!(alpha.instances.values().all(|i| i.state == InstanceState::Ready));
    assert_eq!(alpha.status, ClusterStatus::Ready);
    assert!(alpha.instances["alpha-0"].external_ip.is_some());

    h.orchestrator.stop_cluster("alpha", true, false).await.unwrap();
    assert!(h.compute.instance_names().is_empty());
    assert!(!h.compute.has_network("gpufleet-alpha"));
    assert!(!h.compute.has_disk("alpha-0"));
    assert!(h.orchestrator.store().load().unwrap().cluster("alpha").is_none());
}

#[tokio::test]
async fn second_start_issues_no_mutating_calls() {
    let h = harness();
    h.orchestrator.start_cluster("c", 3, &none()).await.unwrap();
    let creates = h
        .compute
        .calls()
        .iter()
        .filter(|c| c.starts_with("insert_instance"))
        .count();
    assert_eq!(creates, 3);

    h.compute.clear_calls();
    h.orchestrator.start_cluster("c", 3, &none()).await.unwrap();
    assert!(h.compute.mutating_calls().is_empty(), "{:?}", h.compute.mutating_calls());
}

#[tokio::test]
async fn partial_start_failure_is_recorded() {
    let h = harness();
    h.compute.fail_instance("alpha-1", "ZONE_RESOURCE_POOL_EXHAUSTED");

    let err = h.orchestrator.start_cluster("alpha", 3, &none()).await.unwrap_err();
    match &err {
        FleetError::Instance { index, name, source } => {
            assert_eq!(*index, 1);
            assert_eq!(name, "alpha-1");
            assert!(source.to_string().contains("ZONE_RESOURCE_POOL_EXHAUSTED"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let doc = h.orchestrator.store().load().unwrap();
    let alpha = doc.cluster("alpha").unwrap();
    assert_eq!(alpha.instances["alpha-0"].state, InstanceState::Ready);
    assert_eq!(alpha.instances["alpha-1"].state, InstanceState::Terminated);
    assert_eq!(alpha.instances["alpha-2"].state, InstanceState::Ready);
    assert_eq!(alpha.status, ClusterStatus::Starting);

    // A retry only creates what is missing.
    h.compute.clear_failures();
    h.compute.clear_calls();
    h.orchestrator.start_cluster("alpha", 3, &none()).await.unwrap();
    assert_eq!(h.compute.mutating_calls(), vec!["insert_instance alpha-1"]);
    let doc = h.orchestrator.store().load().unwrap();
    assert_eq!(doc.cluster("alpha").unwrap().status, ClusterStatus::Ready);
}

fn assert_cancelled_at(err: &FleetError, expected: usize) {
    match err {
        FleetError::Instance { index, source, .. } => {
            assert_eq!(*index, expected);
            assert!(matches!(**source, FleetError::Cancelled(_)), "{source}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn cancelling_mid_start_records_finished_nodes() {
    let h = harness();
    h.compute.stall_instance("beta-1");
    let (tx, cancel) = Cancellation::channel();
    let orchestrator = h.orchestrator.with_cancellation(cancel);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        let _ = tx.send(true);
    });
    let err = orchestrator.start_cluster("beta", 3, &none()).await.unwrap_err();
    assert_cancelled_at(&err, 1);

    let doc = orchestrator.store().load().unwrap();
    let beta = doc.cluster("beta").unwrap();
    assert_eq!(beta.instances["beta-0"].state, InstanceState::Ready);
    assert_eq!(beta.instances["beta-1"].state, InstanceState::Terminated);
    assert_eq!(beta.instances["beta-2"].state, InstanceState::Ready);
    assert_eq!(beta.status, ClusterStatus::Starting);
    assert_eq!(beta.last_action, Some(LastAction::Start));
}

#[tokio::test(start_paused = true)]
async fn deadline_bounds_every_wait() {
    let h = harness_with(|cfg| cfg.operations.timeout = Duration::from_secs(10));
    h.compute.stall_instance("gamma-0");

    let err = h.orchestrator.start_cluster("gamma", 2, &none()).await.unwrap_err();
    assert_cancelled_at(&err, 0);
    let doc = h.orchestrator.store().load().unwrap();
    assert_eq!(doc.cluster("gamma").unwrap().instances["gamma-1"].state, InstanceState::Ready);

    // The stalled insert never landed, so a retry creates only that node.
    h.compute.clear_failures();
    h.compute.clear_calls();
    h.orchestrator.start_cluster("gamma", 2, &none()).await.unwrap();
    assert_eq!(h.compute.mutating_calls(), vec!["insert_instance gamma-0"]);
}

#[tokio::test]
async fn overlong_cluster_name_is_rejected_before_provisioning() {
    let h = harness();
    let name = "a".repeat(45);
    h.orchestrator.create_cluster(&name, 1, &none()).unwrap();

    let longer = "a".repeat(46);
    let err = h.orchestrator.start_cluster(&longer, 1, &none()).await.unwrap_err();
    assert!(matches!(err, FleetError::Validation(_)), "{err}");
    assert!(h.compute.calls().is_empty());
}

#[tokio::test]
async fn drift_marks_cluster_deleted_once() {
    let h = harness();
    h.orchestrator.start_cluster("x", 2, &none()).await.unwrap();
    h.compute.remove_instance("x-0");
    h.compute.remove_instance("x-1");

    let (doc, report) = h.orchestrator.sync_status().await.unwrap();
    assert_eq!(report.deleted, vec!["x"]);
    let x = doc.cluster("x").unwrap();
    assert_eq!(x.status, ClusterStatus::Deleted);
    let deleted_at = x.deleted_at.expect("deletion time recorded");

    let (doc, report) = h.orchestrator.sync_status().await.unwrap();
    assert!(report.deleted.is_empty());
    assert_eq!(doc.cluster("x").unwrap().deleted_at, Some(deleted_at));

    let targeted = h
        .compute
        .calls()
        .iter()
        .filter(|c| c.as_str() == "list_instances labels.cluster = \"x\"")
        .count();
    assert_eq!(targeted, 2);
}

#[tokio::test]
async fn recorded_but_never_started_is_terminated() {
    let h = harness();
    h.orchestrator.create_cluster("idle", 2, &none()).unwrap();
    assert!(h.compute.mutating_calls().is_empty());

    let (doc, report) = h.orchestrator.sync_status().await.unwrap();
    assert_eq!(report.never_started, vec!["idle"]);
    let idle = doc.cluster("idle").unwrap();
    assert_eq!(idle.status, ClusterStatus::Terminated);
    assert_eq!(idle.last_action, Some(LastAction::Create));
    assert!(!idle.is_deleted());
}

#[tokio::test]
async fn sync_adopts_clusters_created_elsewhere() {
    let h = harness();
    let names = ClusterNames::new("gpufleet", "foreign");
    for index in 0..2 {
        h.compute.put_instance(Instance {
            name: names.instance(index),
            status: if index == 0 { "RUNNING" } else { "TERMINATED" }.to_string(),
            labels: names.labels_for(index),
            ..Default::default()
        });
    }

    let (doc, _) = h.orchestrator.sync_status().await.unwrap();
    let foreign = doc.cluster("foreign").unwrap();
    assert_eq!(foreign.num_instances, 2);
    assert_eq!(foreign.profile, "default");
    assert_eq!(foreign.status, ClusterStatus::Starting);
}

#[tokio::test]
async fn delete_orders_cleanup_after_instances() {
    let h = harness();
    h.orchestrator.start_cluster("beta", 2, &none()).await.unwrap();
    h.compute.clear_calls();

    h.orchestrator.stop_cluster("beta", true, false).await.unwrap();
    let calls = h.compute.calls();
    let last_instance_delete = *position(&calls, "delete_instance").last().unwrap();
    let firewalls = position(&calls, "delete_firewall");
    let subnet = position(&calls, "delete_subnetwork")[0];
    let network = position(&calls, "delete_network")[0];
    assert_eq!(firewalls.len(), 3);
    assert!(firewalls[0] > last_instance_delete);
    assert!(subnet > *firewalls.last().unwrap());
    assert!(network > subnet);
}

#[tokio::test]
async fn delete_tolerates_missing_network_layer() {
    let h = harness();
    let names = ClusterNames::new("gpufleet", "orphan");
    h.compute.put_instance(Instance {
        name: names.instance(0),
        status: "RUNNING".to_string(),
        labels: names.labels_for(0),
        ..Default::default()
    });

    h.orchestrator.stop_cluster("orphan", true, false).await.unwrap();
    assert!(h.compute.instance_names().is_empty());

    // Nothing left at all: a repeat is still fine.
    h.orchestrator.stop_cluster("orphan", true, false).await.unwrap();
}

#[tokio::test]
async fn failed_delete_keeps_the_record() {
    let h = harness();
    h.orchestrator.start_cluster("gamma", 2, &none()).await.unwrap();
    h.compute.fail_instance("gamma-1", "resource busy");

    let err = h.orchestrator.stop_cluster("gamma", true, false).await.unwrap_err();
    assert!(matches!(err, FleetError::Instance { index: 1, .. }));
    assert!(h.compute.has_network("gpufleet-gamma"));

    let doc = h.orchestrator.store().load().unwrap();
    let gamma = doc.cluster("gamma").unwrap();
    assert_eq!(gamma.instances["gamma-0"].state, InstanceState::Terminated);
    assert_eq!(gamma.instances["gamma-1"].state, InstanceState::Ready);
}

#[tokio::test]
async fn retained_disk_is_reused_on_next_start() {
    let h = harness();
    h.orchestrator.start_cluster("delta", 1, &none()).await.unwrap();
    h.orchestrator.stop_cluster("delta", true, true).await.unwrap();
    assert!(h.compute.has_disk("delta-0"));
    assert!(h.compute.calls().contains(&"set_disk_auto_delete delta-0".to_string()));

    h.orchestrator.start_cluster("delta", 1, &none()).await.unwrap();
    let instance = h.compute.instance("delta-0").unwrap();
    let boot = &instance.disks[0];
    assert!(boot.initialize_params.is_none());
    assert_eq!(
        boot.source.as_deref(),
        Some("projects/proj/zones/us-east1-d/disks/delta-0")
    );
}

#[tokio::test]
async fn stop_skips_instances_at_rest() {
    let h = harness();
    h.orchestrator.start_cluster("eps", 2, &none()).await.unwrap();
    h.compute.set_status("eps-1", "TERMINATED");
    h.compute.clear_calls();

    h.orchestrator.stop_cluster("eps", false, false).await.unwrap();
    assert_eq!(h.compute.mutating_calls(), vec!["stop_instance eps-0"]);

    let doc = h.orchestrator.store().load().unwrap();
    let eps = doc.cluster("eps").unwrap();
    assert_eq!(eps.status, ClusterStatus::Terminated);
    assert_eq!(eps.last_action, Some(LastAction::Stop));
    assert!(eps.instances.values().all(|i| i.external_ip.is_none()));

    h.compute.clear_calls();
    h.orchestrator.stop_cluster("eps", false, false).await.unwrap();
    assert!(h.compute.mutating_calls().is_empty());
}

#[tokio::test]
async fn update_skips_running_instances_with_warning() {
    let h = harness();
    h.orchestrator.start_cluster("zeta", 2, &none()).await.unwrap();
    h.compute.set_status("zeta-0", "TERMINATED");
    h.compute.clear_calls();

    h.orchestrator.update_cluster("zeta", 12).await.unwrap();
    assert_eq!(h.compute.mutating_calls(), vec!["set_instance_scheduling zeta-0"]);
    let seconds = h
        .compute
        .instance("zeta-0")
        .and_then(|i| i.scheduling)
        .and_then(|s| s.max_run_duration)
        .map(|d| d.seconds);
    assert_eq!(seconds.as_deref(), Some("43200"));
    assert!(h
        .progress
        .warnings()
        .iter()
        .any(|w| w.contains("zeta-1 must be TERMINATED")));

    let doc = h.orchestrator.store().load().unwrap();
    let zeta = doc.cluster("zeta").unwrap();
    assert_eq!(zeta.overrides.max_run_hours, Some(12));
    assert_eq!(zeta.last_action, Some(LastAction::Update));
}

#[tokio::test]
async fn changed_ports_patch_the_firewall() {
    let h = harness();
    h.orchestrator.start_cluster("eta", 1, &none()).await.unwrap();

    let mut cfg = h.orchestrator.config().clone();
    cfg.network.ports = vec![8888, 6006];
    let store = h.orchestrator.store().clone();
    let orchestrator = ClusterOrchestrator::new(h.compute.clone() as Arc<dyn ComputeClient>, cfg, store);
    h.compute.clear_calls();

    orchestrator.start_cluster("eta", 1, &none()).await.unwrap();
    assert_eq!(h.compute.mutating_calls(), vec!["patch_firewall gpufleet-eta-ports"]);
    let rule = h.compute.firewall("gpufleet-eta-ports").unwrap();
    assert_eq!(rule.allowed[0].ports, vec!["8888", "6006"]);
}

#[tokio::test]
async fn restarts_stopped_instances_and_reconciles_tags() {
    let h = harness_with(|cfg| cfg.network.tags_base = vec!["http-server".to_string()]);
    h.orchestrator.start_cluster("theta", 1, &none()).await.unwrap();
    h.orchestrator.stop_cluster("theta", false, false).await.unwrap();

    let mut instance = h.compute.remove_instance("theta-0").unwrap();
    if let Some(tags) = instance.tags.as_mut() {
        tags.items.retain(|t| t != "http-server");
    }
    h.compute.put_instance(instance);
    h.compute.clear_calls();

    h.orchestrator.start_cluster("theta", 1, &none()).await.unwrap();
    assert_eq!(
        h.compute.mutating_calls(),
        vec!["set_instance_tags theta-0", "start_instance theta-0"]
    );
    let doc = h.orchestrator.store().load().unwrap();
    assert_eq!(doc.cluster("theta").unwrap().status, ClusterStatus::Ready);
}

#[tokio::test]
async fn validation_happens_before_any_remote_call() {
    let h = harness();
    assert!(matches!(
        h.orchestrator.start_cluster("Bad_Name", 1, &none()).await.unwrap_err(),
        FleetError::Validation(_)
    ));
    assert!(matches!(
        h.orchestrator.start_cluster("ok", 0, &none()).await.unwrap_err(),
        FleetError::Validation(_)
    ));
    assert!(matches!(
        h.orchestrator.stop_cluster("ok", false, true).await.unwrap_err(),
        FleetError::Validation(_)
    ));
    assert!(matches!(
        h.orchestrator.update_cluster("ok", 0).await.unwrap_err(),
        FleetError::Validation(_)
    ));
    assert!(h.compute.calls().is_empty());
}

#[tokio::test]
async fn start_without_count_uses_the_record() {
    let h = harness();
    let err = h.orchestrator.start_recorded_cluster("nope").await.unwrap_err();
    assert!(matches!(err, FleetError::NotFound(_)));

    let overrides = ClusterOverrides {
        machine_type: Some("a2-highgpu-1g".to_string()),
        ..Default::default()
    };
    h.orchestrator.create_cluster("iota", 2, &overrides).unwrap();
    h.orchestrator.start_recorded_cluster("iota").await.unwrap();
    assert_eq!(h.compute.instance_names(), vec!["iota-0", "iota-1"]);
    assert!(h
        .compute
        .instance("iota-1")
        .unwrap()
        .machine_type
        .ends_with("/a2-highgpu-1g"));
}

/// Reports ready on the third check and remembers which hosts it was asked about.
#[derive(Default)]
struct ReadyOnThird {
    hosts: Mutex<Vec<String>>,
}

#[async_trait]
impl ReadinessCheck for ReadyOnThird {
    async fn check(&self, host: &str) -> Readiness {
        let mut hosts = self.hosts.lock().unwrap();
        hosts.push(host.to_string());
        if hosts.len() >= 3 {
            Readiness::Ready
        } else {
            Readiness::Running
        }
    }
}

#[tokio::test(start_paused = true)]
async fn readiness_asks_the_entry_node() {
    let h = harness();
    h.orchestrator.start_cluster("iota", 2, &none()).await.unwrap();
    let entry_ip = h.compute.instance("iota-0").unwrap().external_ip().unwrap().to_string();

    let checker = ReadyOnThird::default();
    h.orchestrator
        .wait_until_ready("iota", &checker, Duration::from_secs(60))
        .await
        .unwrap();
    let hosts = checker.hosts.lock().unwrap().clone();
    assert_eq!(hosts, vec![entry_ip.clone(), entry_ip.clone(), entry_ip]);
}

#[tokio::test(start_paused = true)]
async fn readiness_needs_a_reachable_entry_node() {
    let h = harness();
    h.orchestrator.start_cluster("kappa", 1, &none()).await.unwrap();
    h.orchestrator.stop_cluster("kappa", false, false).await.unwrap();

    let checker = ReadyOnThird::default();
    let err = h
        .orchestrator
        .wait_until_ready("kappa", &checker, Duration::from_secs(60))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::NotFound(_)), "{err}");
    assert!(checker.hosts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn show_cluster_reads_live_nodes_in_index_order() {
    let h = harness();
    h.orchestrator.start_cluster("lambda", 11, &none()).await.unwrap();
    h.compute.set_status("lambda-3", "STOPPING");
    h.compute.clear_calls();

    let live = h.orchestrator.show_cluster("lambda").await.unwrap();
    let indexes: Vec<usize> = live.iter().map(|i| i.index).collect();
    assert_eq!(indexes, (0..11).collect::<Vec<_>>());
    assert_eq!(live[3].status, "STOPPING");
    assert!(live[0].external_ip.is_some());
    assert!(h.compute.mutating_calls().is_empty());

    assert!(h.orchestrator.show_cluster("missing").await.unwrap().is_empty());
}
