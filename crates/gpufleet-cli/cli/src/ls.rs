use chrono::{DateTime, Utc};
use comfy_table::{Cell, Table};
use gpufleet_core::orchestrator::LiveInstance;
use gpufleet_core::state::{ClusterRecord, StateDocument};

/// Print clusters and their instances. Deleted clusters only with `all`.
pub fn print_status(doc: &StateDocument, all: bool) {
    let clusters = visible_clusters(doc, all);
    if clusters.is_empty() {
        println!("No clusters found.");
        return;
    }

    println!("Clusters");
    println!("{}", cluster_table(&clusters));

    for cluster in clusters.iter().filter(|c| !c.instances.is_empty()) {
        println!("\n{}", cluster.name);
        println!("{}", instance_table(cluster));
    }
}

pub fn visible_clusters(doc: &StateDocument, all: bool) -> Vec<&ClusterRecord> {
    doc.clusters
        .values()
        .filter(|cluster| all || !cluster.is_deleted())
        .collect()
}

fn cluster_table(clusters: &[&ClusterRecord]) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["Name", "Profile", "Status", "Instances", "Last Action", "Updated At"]);

    for cluster in clusters {
        let last_action = match (cluster.last_action, cluster.last_action_at) {
            (Some(action), Some(at)) => format!("{} ({})", action.as_str(), format_time_ago(at)),
            (Some(action), None) => action.as_str().to_string(),
            (None, _) => "-".to_string(),
        };
        table.add_row(vec![
            Cell::new(&cluster.name),
            Cell::new(&cluster.profile),
            Cell::new(cluster.status.as_str()),
            Cell::new(cluster.num_instances),
            Cell::new(last_action),
            Cell::new(format_timestamp(cluster.updated_at)),
        ]);
    }
    table
}

fn instance_table(cluster: &ClusterRecord) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["Name", "Index", "State", "External IP", "Internal IP"]);

    for instance in cluster.instances_by_index() {
        table.add_row(vec![
            Cell::new(&instance.name),
            Cell::new(instance.index),
            Cell::new(instance.state.as_str()),
            Cell::new(instance.external_ip.as_deref().unwrap_or("-")),
            Cell::new(instance.internal_ip.as_deref().unwrap_or("-")),
        ]);
    }
    table
}

/// Print one cluster as the provider reports it right now.
pub fn print_live_cluster(name: &str, instances: &[LiveInstance]) {
    if instances.is_empty() {
        println!("No instances found for cluster {}.", name);
        return;
    }
    println!("{}", live_table(instances));
}

fn live_table(instances: &[LiveInstance]) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["Name", "Index", "Status", "External IP", "Internal IP"]);

    for instance in instances {
        table.add_row(vec![
            Cell::new(&instance.name),
            Cell::new(instance.index),
            Cell::new(&instance.status),
            Cell::new(instance.external_ip.as_deref().unwrap_or("-")),
            Cell::new(instance.internal_ip.as_deref().unwrap_or("-")),
        ]);
    }
    table
}

fn format_timestamp(at: Option<DateTime<Utc>>) -> String {
    match at {
        Some(at) => at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => "-".to_string(),
    }
}

/// Elapsed time like "2h 30m ago", relative to now
fn format_time_ago(at: DateTime<Utc>) -> String {
    let elapsed = Utc::now() - at;
    let total_seconds = elapsed.num_seconds().max(0);
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    if hours == 0 && minutes == 0 {
        "just now".to_string()
    } else {
        format!("{}h {}m ago", hours, minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> StateDocument {
        let mut doc = StateDocument::default();
        let live = doc.cluster_entry("alpha");
        live.num_instances = 2;
        live.ensure_instances(2, Utc::now());
        live.refresh_status();
        let gone = doc.cluster_entry("beta");
        gone.deleted_at = Some(Utc::now());
        gone.refresh_status();
        doc
    }

    #[test]
    fn deleted_clusters_are_hidden_by_default() {
        let doc = doc();
        let names: Vec<&str> = visible_clusters(&doc, false).iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["alpha"]);
        assert_eq!(visible_clusters(&doc, true).len(), 2);
    }

    #[test]
    fn instance_rows_follow_index_order() {
        let mut cluster = ClusterRecord::new("alpha");
        cluster.num_instances = 11;
        cluster.ensure_instances(11, Utc::now());
        let rendered = instance_table(&cluster).to_string();
        let two = rendered.find("alpha-2 ").unwrap();
        let ten = rendered.find("alpha-10").unwrap();
        assert!(two < ten);
    }

    #[test]
    fn live_rows_show_provider_status() {
        let instances = vec![
            LiveInstance {
                index: 0,
                name: "alpha-0".to_string(),
                status: "RUNNING".to_string(),
                external_ip: Some("34.0.0.2".to_string()),
                internal_ip: Some("10.0.0.2".to_string()),
            },
            LiveInstance {
                index: 1,
                name: "alpha-1".to_string(),
                status: "TERMINATED".to_string(),
                external_ip: None,
                internal_ip: None,
            },
        ];
        let rendered = live_table(&instances).to_string();
        assert!(rendered.contains("34.0.0.2"));
        assert!(rendered.contains("TERMINATED"));
        assert!(rendered.find("alpha-0").unwrap() < rendered.find("alpha-1").unwrap());
    }

    #[test]
    fn recent_actions_read_as_just_now() {
        assert_eq!(format_time_ago(Utc::now()), "just now");
        assert_eq!(format_time_ago(Utc::now() - chrono::Duration::minutes(150)), "2h 30m ago");
        assert_eq!(format_timestamp(None), "-");
    }
}
