//! End-to-end transaction scenarios over an in-process cluster

mod support;

use std::sync::atomic::Ordering;
use support::TestCluster;
use uuid::Uuid;
use volmand::cluster::handshake::{self, DivergenceOutcome};
use volmand::cluster::volume::{Brick, BrickStatus, Volume, VolumeStatus};
use volmand::rpc::PeerRequest;
use volmand::txn::fanout::PhaseResult;
use volmand::txn::{LockResource, OpKind, OpSpec, TxnPhase};

/// Scenario A: create a replica-3 volume across three peers, then start it.
#[tokio::test]
async fn test_create_and_start_volume_across_three_peers() {
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
    assert!(outcome.success, "create failed: {}", outcome.message);

    // Every node holds the same committed copy: status CREATED, version 1
    let mut checksums = Vec::new();
    for node in &cluster.nodes {
        let state = node.state.read().await;
        let vol = state.volume("v1").unwrap();
        assert_eq!(vol.status, VolumeStatus::Created);
        assert_eq!(vol.version, 1);
        assert_eq!(vol.brick_count(), 3);
        assert_eq!(vol.subvol_count * vol.dist_leaf_count, vol.brick_count());
        checksums.push(vol.checksum);
    }
    assert!(checksums.windows(2).all(|w| w[0] == w[1]));

    let outcome = coordinator
        .execute(OpSpec::new(OpKind::StartVolume).with("name", "v1"))
        .await;
    assert!(outcome.success, "start failed: {}", outcome.message);

    // Each node started its own brick worker and recorded port + status
    for (i, node) in cluster.nodes.iter().enumerate() {
        let state = node.state.read().await;
        let vol = state.volume("v1").unwrap();
        assert_eq!(vol.status, VolumeStatus::Started);
        assert_eq!(vol.version, 2);

        let local_brick = vol.bricks.iter().find(|b| b.peer_id == node.id).unwrap();
        assert_eq!(local_brick.status, BrickStatus::Started);
        assert!(local_brick.port.is_some());
        assert_eq!(cluster.launchers[i].spawns.load(Ordering::SeqCst), 1);
    }

    // Unlock ran unconditionally: nothing holds the resource anywhere
    for node in &cluster.nodes {
        assert_eq!(
            node.locks.owner_of(&LockResource::Volume("v1".into())),
            None
        );
    }
}

/// Scenario B: a second operation on a locked volume fails fast with the
/// holder's identity and changes nothing.
#[tokio::test]
async fn test_locked_volume_rejects_concurrent_operation() {
    let cluster = TestCluster::new(3).await;
    let coordinator = cluster.coordinator(0);

    let outcome = coordinator
        .execute(
            OpSpec::new(OpKind::CreateVolume)
                .with("name", "v1")
                .with("bricks", cluster.brick_per_node(3, "/data/v1")),
        )
        .await;
    assert!(outcome.success);

    // Another node's transaction holds the volume lock everywhere
    let holder = cluster.nodes[1].id;
    let txn = Uuid::new_v4();
    for node in &cluster.nodes {
        node.locks
            .acquire(&LockResource::Volume("v1".into()), holder, txn)
            .unwrap();
    }
    let version_before = cluster.nodes[0].state.read().await.volume("v1").unwrap().version;

    let outcome = coordinator
        .execute(
            OpSpec::new(OpKind::AddBrick)
                .with("name", "v1")
                .with("bricks", format!("{}:/data/v1-more/b0", cluster.nodes[0].id)),
        )
        .await;

    assert!(!outcome.success);
    let lock_phase = outcome
        .phases
        .iter()
        .find(|p| p.phase == TxnPhase::Lock)
        .unwrap();
    match &lock_phase.peers[0].result {
        PhaseResult::Busy { owner } => assert_eq!(*owner, holder),
        other => panic!("expected Busy outcome, got {:?}", other),
    }

    for node in &cluster.nodes {
        let state = node.state.read().await;
        let vol = state.volume("v1").unwrap();
        assert_eq!(vol.version, version_before);
        assert_eq!(vol.brick_count(), 3);
    }
}

/// Scenario C: a peer unreachable during commit leaves a partial commit
/// that is attributed per peer and repaired by the next handshake.
#[tokio::test]
async fn test_unreachable_peer_during_commit_then_handshake_repair() {
    let cluster = TestCluster::new(3).await;
    let coordinator = cluster.coordinator(0);

    let outcome = coordinator
        .execute(
            OpSpec::new(OpKind::CreateVolume)
                .with("name", "v1")
                .with("bricks", cluster.brick_per_node(3, "/data/v1")),
        )
        .await;
    assert!(outcome.success);

    // node-2 drops off the network for commit messages only
    let lost = cluster.nodes[2].id;
    cluster.hub.set_fault(Some(Box::new(move |target, request| {
        target.id == lost && matches!(request, PeerRequest::Commit { .. })
    })));

    let outcome = coordinator
        .execute(
            OpSpec::new(OpKind::SetOption)
                .with("name", "v1")
                .with("key", "performance.cache-size")
                .with("value", "256MB"),
        )
        .await;
    assert!(!outcome.success);

    // Aggregate names the unreachable peer at the commit phase
    let commit_phase = outcome
        .phases
        .iter()
        .find(|p| p.phase == TxnPhase::Commit)
        .unwrap();
    let lost_outcome = commit_phase.peers.iter().find(|o| o.peer == lost).unwrap();
    assert!(matches!(
        lost_outcome.result,
        PhaseResult::Unreachable { .. }
    ));
    let committed: Vec<_> = commit_phase
        .peers
        .iter()
        .filter(|o| o.is_ok())
        .map(|o| o.peer)
        .collect();
    assert!(committed.contains(&cluster.nodes[0].id));
    assert!(committed.contains(&cluster.nodes[1].id));

    // Divergence is real: two nodes moved on, one is behind
    for node in &cluster.nodes[..2] {
        let state = node.state.read().await;
        let vol = state.volume("v1").unwrap();
        assert_eq!(vol.version, 2);
        assert_eq!(
            vol.options.get("performance.cache-size").unwrap(),
            "256MB"
        );
    }
    {
        let state = cluster.nodes[2].state.read().await;
        assert_eq!(state.volume("v1").unwrap().version, 1);
    }

    // The lagging node classifies the volume NEEDS_UPDATE against a peer
    let behind = cluster.nodes[2].state.read().await.volume_summaries();
    let ahead = cluster.nodes[0].state.read().await.volume_summaries();
    let diffs = handshake::compare_summaries(&behind, &ahead);
    assert_eq!(diffs[0].outcome, DivergenceOutcome::NeedsUpdate);

    // Network heals; the handshake imports the newer copy
    cluster.hub.set_fault(None);
    cluster.nodes[2]
        .sync_with_peer(&cluster.endpoint(0))
        .await
        .unwrap();

    let state = cluster.nodes[2].state.read().await;
    let vol = state.volume("v1").unwrap();
    assert_eq!(vol.version, 2);
    assert_eq!(vol.options.get("performance.cache-size").unwrap(), "256MB");
}

/// One peer rejecting the stage aborts the transaction before any mutation.
#[tokio::test]
async fn test_stage_rejection_mutates_nothing() {
    let cluster = TestCluster::new(3).await;
    let coordinator = cluster.coordinator(0);

    // node-2 already knows a volume occupying the brick path
    let ghost_path = "/data/shared/b0";
    {
        let mut ghost = Volume::new("ghost");
        ghost
            .add_brick(Brick::new("ghost", 0, cluster.nodes[0].id, ghost_path))
            .unwrap();
        ghost.bump_version();
        cluster.nodes[2]
            .state
            .write()
            .await
            .insert_volume(ghost)
            .unwrap();
    }

    let outcome = coordinator
        .execute(
            OpSpec::new(OpKind::CreateVolume)
                .with("name", "newvol")
                .with("bricks", format!("{}:{}", cluster.nodes[0].id, ghost_path)),
        )
        .await;

    assert!(!outcome.success);
    let stage_phase = outcome
        .phases
        .iter()
        .find(|p| p.phase == TxnPhase::Stage)
        .unwrap();
    assert!(stage_phase
        .peers
        .iter()
        .any(|o| matches!(o.result, PhaseResult::Rejected { .. })));

    for node in &cluster.nodes {
        let state = node.state.read().await;
        assert!(state.volume("newvol").is_err());
    }
    // Locks were rolled back everywhere
    for node in &cluster.nodes {
        assert_eq!(
            node.locks
                .owner_of(&LockResource::Volume("newvol".into())),
            None
        );
    }
}

/// A parameter-level failure is purely local: no lock is taken anywhere and
/// no phase report is produced for remote peers.
#[tokio::test]
async fn test_local_parameter_failure_stays_local() {
    let cluster = TestCluster::new(3).await;
    let coordinator = cluster.coordinator(0);

    // Malformed brick list never leaves node-0
    let outcome = coordinator
        .execute(
            OpSpec::new(OpKind::CreateVolume)
                .with("name", "v1")
                .with("bricks", "not-a-brick"),
        )
        .await;
    assert!(!outcome.success);

    for node in &cluster.nodes[1..] {
        assert_eq!(node.locks.owner_of(&LockResource::Volume("v1".into())), None);
    }
}
