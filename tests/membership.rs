//! Peer membership: probe/attach, detach, gossip discovery, quorum

mod support;

use support::TestCluster;
use volmand::cluster::peer::PeerState;
use volmand::cluster::state::OPT_QUORUM_TYPE;
use volmand::txn::{OpKind, OpSpec};

#[tokio::test]
async fn test_probe_attach_and_detach_peer() {
    let mut cluster = TestCluster::new(2).await;
    let newcomer = cluster.add_standalone(2).await;
    let coordinator = cluster.coordinator(0);

    // Probe learns the candidate's identity before the transaction
    let probed = cluster.nodes[0]
        .probe(&newcomer.rpc_addr, &newcomer.hostname)
        .await
        .unwrap();
    assert_eq!(probed, newcomer.id);

    // The probe handshake already introduced us to the newcomer (gossip)
    {
        let state = newcomer.state.read().await;
        assert!(state.peers.get(&cluster.nodes[0].id).is_some());
    }

    let outcome = coordinator
        .execute(
            OpSpec::new(OpKind::AttachPeer)
                .with("id", probed.to_string())
                .with("hostname", &newcomer.hostname)
                .with("rpc_addr", &newcomer.rpc_addr),
        )
        .await;
    assert!(outcome.success, "{}", outcome.message);

    // Both existing members now track the newcomer as connected
    for node in &cluster.nodes[..2] {
        let state = node.state.read().await;
        let peer = state.peers.get(&probed).unwrap();
        assert_eq!(peer.state, PeerState::Connected);
    }

    // Detach runs under the global lock on every member, including the
    // target, which accepts its own removal and forgets the cluster
    let outcome = coordinator
        .execute(OpSpec::new(OpKind::DetachPeer).with("id", probed.to_string()))
        .await;
    assert!(outcome.success, "{}", outcome.message);

    for node in &cluster.nodes[..2] {
        let state = node.state.read().await;
        assert!(state.peers.get(&probed).is_none());
    }
    {
        let state = newcomer.state.read().await;
        assert!(state.peers.is_empty());
    }
}

#[tokio::test]
async fn test_detach_refused_while_peer_hosts_bricks() {
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

    let target = cluster.nodes[2].id;
    let outcome = coordinator
        .execute(OpSpec::new(OpKind::DetachPeer).with("id", target.to_string()))
        .await;
    assert!(!outcome.success);
    assert!(outcome.message.contains("v1"));

    // Still a member everywhere
    for node in &cluster.nodes[..2] {
        let state = node.state.read().await;
        assert!(state.peers.get(&target).is_some());
    }
}

#[tokio::test]
async fn test_gossip_discovery_via_handshake() {
    let mut cluster = TestCluster::new(2).await;
    let stranger = cluster.add_standalone(2).await;

    // An unknown node handshaking a member gets recorded as a peer
    stranger.sync_with_peer(&cluster.endpoint(0)).await.unwrap();

    let state = cluster.nodes[0].state.read().await;
    let discovered = state.peers.get(&stranger.id).unwrap();
    assert_eq!(discovered.state, PeerState::Connected);
    assert_eq!(discovered.primary_hostname(), stranger.hostname);
}

#[tokio::test]
async fn test_quorum_not_met_blocks_commit() {
    let cluster = TestCluster::new(3).await;
    let coordinator = cluster.coordinator(0);

    // Server quorum enforced cluster-wide
    for node in &cluster.nodes {
        let mut state = node.state.write().await;
        state
            .options
            .insert(OPT_QUORUM_TYPE.to_string(), "server".to_string());
    }

    // node-0 is partitioned from both peers: 1 of 3 members active
    {
        let mut state = cluster.nodes[0].state.write().await;
        let ids: Vec<_> = state.peers.iter().map(|p| p.id).collect();
        for id in ids {
            state.peers.set_state(&id, PeerState::Disconnected).unwrap();
        }
    }

    let outcome = coordinator
        .execute(
            OpSpec::new(OpKind::CreateVolume)
                .with("name", "v1")
                .with("bricks", format!("{}:/data/v1/b0", cluster.nodes[0].id)),
        )
        .await;

    assert!(!outcome.success);
    assert!(outcome.message.contains("Quorum not met"));

    // Nothing was created anywhere
    for node in &cluster.nodes {
        let state = node.state.read().await;
        assert!(state.volume("v1").is_err());
    }
}

#[tokio::test]
async fn test_membership_ops_serialize_under_global_lock() {
    let mut cluster = TestCluster::new(2).await;
    let newcomer = cluster.add_standalone(2).await;
    let coordinator = cluster.coordinator(0);

    // Another transaction holds the global lock everywhere
    let holder = cluster.nodes[1].id;
    let txn = uuid::Uuid::new_v4();
    for node in &cluster.nodes[..2] {
        node.locks
            .acquire(&volmand::txn::LockResource::Global, holder, txn)
            .unwrap();
    }

    let outcome = coordinator
        .execute(
            OpSpec::new(OpKind::AttachPeer)
                .with("id", newcomer.id.to_string())
                .with("hostname", &newcomer.hostname)
                .with("rpc_addr", &newcomer.rpc_addr),
        )
        .await;
    assert!(!outcome.success);
    assert!(outcome.message.contains("lock phase"));

    let state = cluster.nodes[0].state.read().await;
    assert!(state.peers.get(&newcomer.id).is_none());
}
