//! Volume lifecycle details driven through the full transaction protocol

mod support;

use std::sync::atomic::Ordering;
use support::TestCluster;
use volmand::cluster::snapshot::SnapStatus;
use volmand::cluster::volume::{BrickStatus, RebalanceStatus, VolumeStatus};
use volmand::txn::{OpKind, OpSpec};

async fn create_distribute_volume(cluster: &TestCluster, name: &str, bricks: usize) {
    let brick_list = (0..bricks)
        .map(|i| format!("{}:/data/{}/b{}", cluster.nodes[0].id, name, i))
        .collect::<Vec<_>>()
        .join(",");
    let outcome = cluster
        .coordinator(0)
        .execute(
            OpSpec::new(OpKind::CreateVolume)
                .with("name", name)
                .with("bricks", brick_list),
        )
        .await;
    assert!(outcome.success, "{}", outcome.message);
}

#[tokio::test]
async fn test_brick_ordinals_reused_through_operations() {
    let cluster = TestCluster::new(2).await;
    let coordinator = cluster.coordinator(0);
    create_distribute_volume(&cluster, "v1", 3).await;

    // Remove the middle brick
    let outcome = coordinator
        .execute(
            OpSpec::new(OpKind::RemoveBrick)
                .with("name", "v1")
                .with("bricks", format!("{}:/data/v1/b1", cluster.nodes[0].id)),
        )
        .await;
    assert!(outcome.success, "{}", outcome.message);

    // The next added brick takes ordinal 1, not 3
    let outcome = coordinator
        .execute(
            OpSpec::new(OpKind::AddBrick)
                .with("name", "v1")
                .with("bricks", format!("{}:/data/v1/b3", cluster.nodes[0].id)),
        )
        .await;
    assert!(outcome.success, "{}", outcome.message);

    for node in &cluster.nodes {
        let state = node.state.read().await;
        let vol = state.volume("v1").unwrap();
        let added = vol
            .bricks
            .iter()
            .find(|b| b.path == "/data/v1/b3")
            .unwrap();
        assert_eq!(added.ordinal, 1);
        assert_eq!(added.brick_id, "v1-client-1");
        let ordinals: Vec<u32> = vol.bricks.iter().map(|b| b.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }
}

#[tokio::test]
async fn test_replace_brick_keeps_ordinal_and_group() {
    let cluster = TestCluster::new(3).await;
    let coordinator = cluster.coordinator(0);

    let outcome = coordinator
        .execute(
            OpSpec::new(OpKind::CreateVolume)
                .with("name", "rep")
                .with("replica", "3")
                .with("bricks", cluster.brick_per_node(3, "/data/rep")),
        )
        .await;
    assert!(outcome.success, "{}", outcome.message);

    let src = format!("{}:/data/rep/b1", cluster.nodes[1].id);
    let dst = format!("{}:/data/rep-new/b1", cluster.nodes[1].id);
    let outcome = coordinator
        .execute(
            OpSpec::new(OpKind::ReplaceBrick)
                .with("name", "rep")
                .with("src", src)
                .with("dst", dst),
        )
        .await;
    assert!(outcome.success, "{}", outcome.message);

    for node in &cluster.nodes {
        let state = node.state.read().await;
        let vol = state.volume("rep").unwrap();
        assert_eq!(vol.brick_count(), 3);
        let replaced = vol
            .bricks
            .iter()
            .find(|b| b.path == "/data/rep-new/b1")
            .unwrap();
        assert_eq!(replaced.ordinal, 1);
        assert_eq!(replaced.brick_id, "rep-client-1");
    }
}

#[tokio::test]
async fn test_option_set_and_reset_bump_version() {
    let cluster = TestCluster::new(2).await;
    let coordinator = cluster.coordinator(0);
    create_distribute_volume(&cluster, "v1", 2).await;

    let outcome = coordinator
        .execute(
            OpSpec::new(OpKind::SetOption)
                .with("name", "v1")
                .with("key", "cluster.min-free-disk")
                .with("value", "10%"),
        )
        .await;
    assert!(outcome.success);

    let outcome = coordinator
        .execute(
            OpSpec::new(OpKind::ResetOption)
                .with("name", "v1")
                .with("key", "cluster.min-free-disk"),
        )
        .await;
    assert!(outcome.success);

    let mut versions = Vec::new();
    for node in &cluster.nodes {
        let state = node.state.read().await;
        let vol = state.volume("v1").unwrap();
        assert!(!vol.options.contains_key("cluster.min-free-disk"));
        versions.push((vol.version, vol.checksum));
    }
    assert_eq!(versions[0], versions[1]);
    assert_eq!(versions[0].0, 3);
}

#[tokio::test]
async fn test_rebalance_lifecycle() {
    let cluster = TestCluster::new(2).await;
    let coordinator = cluster.coordinator(0);
    create_distribute_volume(&cluster, "dist", 2).await;

    // Not started yet: rebalance refused at stage
    let outcome = coordinator
        .execute(
            OpSpec::new(OpKind::Rebalance)
                .with("name", "dist")
                .with("action", "start"),
        )
        .await;
    assert!(!outcome.success);

    let outcome = coordinator
        .execute(OpSpec::new(OpKind::StartVolume).with("name", "dist"))
        .await;
    assert!(outcome.success);

    let outcome = coordinator
        .execute(
            OpSpec::new(OpKind::Rebalance)
                .with("name", "dist")
                .with("action", "start"),
        )
        .await;
    assert!(outcome.success, "{}", outcome.message);

    let task_id = {
        let state = cluster.nodes[0].state.read().await;
        let vol = state.volume("dist").unwrap();
        assert_eq!(vol.rebal.status, RebalanceStatus::Started);
        vol.rebal.task_id.unwrap()
    };
    // The task id is cluster-wide, usable for later status correlation
    {
        let state = cluster.nodes[1].state.read().await;
        assert_eq!(state.volume("dist").unwrap().rebal.task_id, Some(task_id));
    }

    let outcome = coordinator
        .execute(
            OpSpec::new(OpKind::Rebalance)
                .with("name", "dist")
                .with("action", "stop"),
        )
        .await;
    assert!(outcome.success);
    let state = cluster.nodes[1].state.read().await;
    assert_eq!(
        state.volume("dist").unwrap().rebal.status,
        RebalanceStatus::Stopped
    );
}

#[tokio::test]
async fn test_quota_lifecycle() {
    let cluster = TestCluster::new(2).await;
    let coordinator = cluster.coordinator(0);
    create_distribute_volume(&cluster, "v1", 2).await;

    // Limits require quota to be enabled first
    let outcome = coordinator
        .execute(
            OpSpec::new(OpKind::Quota)
                .with("name", "v1")
                .with("action", "limit")
                .with("path", "/projects")
                .with("limit", "10GB"),
        )
        .await;
    assert!(!outcome.success);

    let outcome = coordinator
        .execute(
            OpSpec::new(OpKind::Quota)
                .with("name", "v1")
                .with("action", "enable"),
        )
        .await;
    assert!(outcome.success);

    let outcome = coordinator
        .execute(
            OpSpec::new(OpKind::Quota)
                .with("name", "v1")
                .with("action", "limit")
                .with("path", "/projects")
                .with("limit", "10GB"),
        )
        .await;
    assert!(outcome.success, "{}", outcome.message);

    for node in &cluster.nodes {
        let state = node.state.read().await;
        let vol = state.volume("v1").unwrap();
        assert_eq!(vol.options.get("features.quota").unwrap(), "on");
        assert_eq!(
            vol.options.get("features.quota-limit./projects").unwrap(),
            "10GB"
        );
        assert_eq!(vol.quota_conf_version, 2);
    }
}

#[tokio::test]
async fn test_snapshot_create_restore_delete() {
    let cluster = TestCluster::new(2).await;
    let coordinator = cluster.coordinator(0);
    create_distribute_volume(&cluster, "v1", 2).await;

    let outcome = coordinator
        .execute(OpSpec::new(OpKind::StartVolume).with("name", "v1"))
        .await;
    assert!(outcome.success);

    let outcome = coordinator
        .execute(
            OpSpec::new(OpKind::SnapCreate)
                .with("snapname", "nightly")
                .with("volumes", "v1")
                .with("description", "pre-upgrade"),
        )
        .await;
    assert!(outcome.success, "{}", outcome.message);

    for node in &cluster.nodes {
        let state = node.state.read().await;
        let snap = state.snapshot("nightly").unwrap();
        assert_eq!(snap.status, SnapStatus::InUse);
        assert_eq!(snap.volumes, vec!["nightly_v1".to_string()]);

        let snap_vol = state.volume("nightly_v1").unwrap();
        assert!(snap_vol.is_snap_volume);
        assert_eq!(snap_vol.parent_volname.as_deref(), Some("v1"));
        assert_eq!(snap_vol.snapshot.as_deref(), Some("nightly"));
        assert!(snap_vol.bricks[0].path.contains(".snaps/nightly"));
    }

    // Restore requires the origin stopped
    let outcome = coordinator
        .execute(OpSpec::new(OpKind::SnapRestore).with("snapname", "nightly"))
        .await;
    assert!(!outcome.success);

    let outcome = coordinator
        .execute(OpSpec::new(OpKind::StopVolume).with("name", "v1"))
        .await;
    assert!(outcome.success);

    let outcome = coordinator
        .execute(OpSpec::new(OpKind::SnapRestore).with("snapname", "nightly"))
        .await;
    assert!(outcome.success, "{}", outcome.message);

    for node in &cluster.nodes {
        let state = node.state.read().await;
        assert_eq!(state.snapshot("nightly").unwrap().status, SnapStatus::Restored);
        let vol = state.volume("v1").unwrap();
        assert!(vol.bricks[0].path.contains(".snaps/nightly"));
        assert_eq!(vol.bricks[0].brick_id, "v1-client-0");
    }

    let outcome = coordinator
        .execute(OpSpec::new(OpKind::SnapDelete).with("snapname", "nightly"))
        .await;
    assert!(outcome.success, "{}", outcome.message);

    for node in &cluster.nodes {
        let state = node.state.read().await;
        assert!(state.snapshot("nightly").is_err());
        assert!(state.volume("nightly_v1").is_err());
    }
}

/// A brick launch failure on one peer during start-volume triggers the
/// declared compensation: peers that had started stop their workers again.
#[tokio::test]
async fn test_start_volume_compensates_on_partial_launch_failure() {
    let cluster = TestCluster::new(3).await;
    let coordinator = cluster.coordinator(0);

    let outcome = coordinator
        .execute(
            OpSpec::new(OpKind::CreateVolume)
                .with("name", "v1")
                .with("replica", "3")
                .with("bricks", cluster.brick_per_node(3, "/data/v1")),
        )
        .await;
    assert!(outcome.success);

    cluster.launchers[1].fail_spawn.store(true, Ordering::SeqCst);

    let outcome = coordinator
        .execute(OpSpec::new(OpKind::StartVolume).with("name", "v1"))
        .await;
    assert!(!outcome.success);

    // Nodes that had started were compensated back to stopped
    for i in [0usize, 2] {
        let node = &cluster.nodes[i];
        let state = node.state.read().await;
        let vol = state.volume("v1").unwrap();
        assert_eq!(vol.status, VolumeStatus::Stopped);
        let local = vol.bricks.iter().find(|b| b.peer_id == node.id).unwrap();
        assert_eq!(local.status, BrickStatus::Stopped);
        assert_eq!(node.supervisor.process_count().await, 0);
    }
    // The failing node never mutated
    {
        let state = cluster.nodes[1].state.read().await;
        assert_eq!(state.volume("v1").unwrap().status, VolumeStatus::Created);
    }
}
