// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cluster end-to-end over engine-backed shards: affinity, routing, and
//! per-shard audit.

mod common;

use common::{app_policy, app_world, navigation_contract};
use predator::sim::SimulatedBrowser;
use predator::{
    ClusterSchedulerConfig, EngineConfig, NodeAdmissionSlo, ShardedCluster,
};

fn cluster_on(dir: &std::path::Path, shards: usize) -> ShardedCluster {
    let browser = SimulatedBrowser::new(app_world());
    let base = EngineConfig::rooted_at(dir);
    ShardedCluster::with_engine_nodes(
        browser,
        &base,
        ClusterSchedulerConfig {
            shard_count: shards,
            ..ClusterSchedulerConfig::default()
        },
        NodeAdmissionSlo::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn workflows_route_to_stable_shards_and_execute() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = cluster_on(dir.path(), 3);
    cluster.initialize().await.unwrap();

    let mut shard_ids = Vec::new();
    for index in 0..4 {
        let workflow = format!("wf-route-{index}");
        let result = cluster
            .execute_contract(
                "tenant-r",
                &workflow,
                app_policy(),
                navigation_contract(&workflow, 0),
            )
            .await
            .unwrap();
        assert!(result.success, "failure: {:?}", result.metadata);
        shard_ids.push(cluster.shard_for("tenant-r", &workflow).unwrap());
    }

    // Affinity: repeated routing answers identically after execution.
    for index in 0..4 {
        let workflow = format!("wf-route-{index}");
        assert_eq!(
            cluster.shard_for("tenant-r", &workflow).unwrap(),
            shard_ids[index]
        );
    }
    cluster.close().await;
}

#[tokio::test]
async fn subsequent_actions_land_on_the_pinned_shard() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = cluster_on(dir.path(), 3);
    cluster.initialize().await.unwrap();

    for step in 0..3 {
        let result = cluster
            .execute_contract(
                "tenant-p",
                "wf-pinned",
                app_policy(),
                navigation_contract("wf-pinned", step),
            )
            .await
            .unwrap();
        assert!(result.success);
    }

    // All three actions are on one shard's audit trail, chained.
    let records = cluster
        .get_replay_trace("tenant-p", "wf-pinned")
        .await
        .unwrap();
    assert_eq!(records.len(), 3);
    let outcome = cluster
        .verify_audit_chain("tenant-p", "wf-pinned")
        .await
        .unwrap();
    assert!(outcome.ok);
    assert_eq!(outcome.checked, 3);
    cluster.close().await;
}

#[tokio::test]
async fn cluster_health_aggregates_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = cluster_on(dir.path(), 2);
    cluster.initialize().await.unwrap();

    let result = cluster
        .execute_contract(
            "tenant-h",
            "wf-health",
            app_policy(),
            navigation_contract("wf-health", 0),
        )
        .await
        .unwrap();
    assert!(result.success);

    let health = cluster.get_health();
    assert_eq!(health.shard_count, 2);
    assert_eq!(health.status, "healthy");
    assert_eq!(health.workflow_affinity_size, 1);
    cluster.close().await;
}

#[tokio::test]
async fn cluster_idempotency_matches_single_node_semantics() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = cluster_on(dir.path(), 2);
    cluster.initialize().await.unwrap();

    let contract = navigation_contract("wf-idem", 0);
    let first = cluster
        .execute_contract("tenant-i", "wf-idem", app_policy(), contract.clone())
        .await
        .unwrap();
    let second = cluster
        .execute_contract("tenant-i", "wf-idem", app_policy(), contract)
        .await
        .unwrap();
    assert_eq!(first.action_id, second.action_id);
    let records = cluster
        .get_replay_trace("tenant-i", "wf-idem")
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    cluster.close().await;
}

#[tokio::test]
async fn tab_management_respects_affinity() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = cluster_on(dir.path(), 2);
    cluster.initialize().await.unwrap();

    let result = cluster
        .execute_contract(
            "tenant-t",
            "wf-tabs",
            app_policy(),
            navigation_contract("wf-tabs", 0),
        )
        .await
        .unwrap();
    assert!(result.success);

    let tab_id = cluster
        .open_tab("tenant-t", "wf-tabs", app_policy(), "http://app.test/")
        .await
        .unwrap();
    let tabs = cluster.list_tabs("wf-tabs").await;
    assert_eq!(tabs.len(), 2);
    assert!(tabs.iter().any(|tab| tab.tab_id == tab_id && tab.is_active));

    cluster.switch_tab("wf-tabs", "tab_0").await.unwrap();
    let tabs = cluster.list_tabs("wf-tabs").await;
    assert!(tabs.iter().any(|tab| tab.tab_id == "tab_0" && tab.is_active));
    cluster.close().await;
}
