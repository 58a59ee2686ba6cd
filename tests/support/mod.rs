//! In-process test cluster: N nodes wired through the local transport hub
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;
use volmand::brick::{BrickSpec, ProcessId, ProcessLauncher};
use volmand::cluster::peer::{Peer, PeerState};
use volmand::common::{DaemonConfig, Error, Result};
use volmand::daemon::Node;
use volmand::rpc::local::{LocalHub, LocalTransport};
use volmand::rpc::PeerEndpoint;
use volmand::txn::TxnCoordinator;

/// Launcher that never runs real processes; brick workers are bookkeeping
/// entries only.
#[derive(Default)]
pub struct TestLauncher {
    next_id: AtomicU64,
    pub spawns: AtomicU64,
    pub fail_spawn: AtomicBool,
}

#[async_trait]
impl ProcessLauncher for TestLauncher {
    async fn spawn(&self, _brick: &BrickSpec, _port: u16) -> Result<ProcessId> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(Error::ProcessLaunchFailed("test launcher failure".into()));
        }
        self.spawns.fetch_add(1, Ordering::SeqCst);
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn attach(&self, _process: ProcessId, _brick: &BrickSpec) -> Result<()> {
        Ok(())
    }

    async fn detach(&self, _process: ProcessId, _brick: &BrickSpec) -> Result<()> {
        Ok(())
    }

    async fn terminate(&self, _process: ProcessId, _graceful: bool) -> Result<()> {
        Ok(())
    }
}

pub struct TestCluster {
    pub hub: Arc<LocalHub>,
    pub nodes: Vec<Arc<Node>>,
    pub launchers: Vec<Arc<TestLauncher>>,
}

impl TestCluster {
    /// Build an `n`-node cluster where every node already knows every other
    /// as a connected peer.
    pub async fn new(n: usize) -> Self {
        let hub = LocalHub::new();
        let ids: Vec<Uuid> = (0..n).map(|_| Uuid::new_v4()).collect();

        let mut nodes = Vec::new();
        let mut launchers = Vec::new();
        for (i, id) in ids.iter().enumerate() {
            let config = DaemonConfig {
                rpc_timeout_secs: 5,
                ..DaemonConfig::default()
            };
            let launcher = Arc::new(TestLauncher::default());
            let node = Node::new(
                config,
                *id,
                format!("node-{}", i),
                format!("local://node-{}", i),
                None,
                Arc::new(LocalTransport::new(hub.clone())),
                launcher.clone(),
            )
            .unwrap();
            hub.register(&node);
            nodes.push(node);
            launchers.push(launcher);
        }

        for (i, node) in nodes.iter().enumerate() {
            let mut state = node.state.write().await;
            for (j, id) in ids.iter().enumerate() {
                if i == j {
                    continue;
                }
                state
                    .peers
                    .insert(Peer::new(
                        *id,
                        format!("node-{}", j),
                        format!("local://node-{}", j),
                    ))
                    .unwrap();
                state.peers.set_state(id, PeerState::Connected).unwrap();
            }
        }

        Self {
            hub,
            nodes,
            launchers,
        }
    }

    /// Add a standalone node to the hub without making it a cluster member
    pub async fn add_standalone(&mut self, index: usize) -> Arc<Node> {
        let config = DaemonConfig {
            rpc_timeout_secs: 5,
            ..DaemonConfig::default()
        };
        let launcher = Arc::new(TestLauncher::default());
        let node = Node::new(
            config,
            Uuid::new_v4(),
            format!("node-{}", index),
            format!("local://node-{}", index),
            None,
            Arc::new(LocalTransport::new(self.hub.clone())),
            launcher.clone(),
        )
        .unwrap();
        self.hub.register(&node);
        self.nodes.push(node.clone());
        self.launchers.push(launcher);
        node
    }

    pub fn coordinator(&self, i: usize) -> TxnCoordinator {
        TxnCoordinator::new(self.nodes[i].clone())
    }

    pub fn endpoint(&self, i: usize) -> PeerEndpoint {
        PeerEndpoint {
            id: self.nodes[i].id,
            hostname: self.nodes[i].hostname.clone(),
            rpc_addr: self.nodes[i].rpc_addr.clone(),
        }
    }

    /// Brick list parameter placing one brick per node under `prefix`
    pub fn brick_per_node(&self, n: usize, prefix: &str) -> String {
        (0..n)
            .map(|i| format!("{}:{}/b{}", self.nodes[i].id, prefix, i))
            .collect::<Vec<_>>()
            .join(",")
    }
}
