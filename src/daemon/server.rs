//! Daemon wiring
//!
//! Builds the node from persisted state, starts the admin HTTP API and the
//! peer gRPC service, and runs the background maintenance tasks: the lock
//! staleness reaper and the periodic reconciling handshake.

use crate::brick::OsLauncher;
use crate::cluster::peer::PeerState;
use crate::cluster::store::MetaStore;
use crate::common::{DaemonConfig, Result};
use crate::daemon::http::{create_router, AppState};
use crate::daemon::node::Node;
use crate::rpc::grpc::{GrpcTransport, PeerMgmtService};
use crate::txn::coordinator::TxnCoordinator;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub struct Daemon {
    config: DaemonConfig,
    hostname: String,
}

impl Daemon {
    pub fn new(config: DaemonConfig, hostname: String) -> Self {
        Self { config, hostname }
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting volmand: {}", self.hostname);
        tracing::info!("  admin API: {}", self.config.bind_addr);
        tracing::info!("  peer RPC:  {}", self.config.grpc_addr);
        tracing::info!("  workdir:   {}", self.config.workdir.display());
        tracing::info!(
            "  brick ports: {}-{} (mux: {})",
            self.config.base_port,
            self.config.max_port,
            self.config.brick_mux_enabled
        );

        std::fs::create_dir_all(&self.config.workdir)?;
        let store = MetaStore::open(self.config.workdir.join("meta.db"))?;
        let id = store.local_id()?;
        tracing::info!("  node id:   {}", id);

        let transport = Arc::new(GrpcTransport::new());
        let launcher = Arc::new(OsLauncher::new(self.config.brick_program.clone()));
        let rpc_addr = format!("http://{}:{}", self.hostname, self.config.grpc_addr.port());
        let node = Node::new(
            self.config.clone(),
            id,
            self.hostname.clone(),
            rpc_addr,
            Some(store),
            transport,
            launcher,
        )?;
        let coordinator = Arc::new(TxnCoordinator::new(node.clone()));

        let _reaper = tokio::spawn(lock_reaper(
            node.clone(),
            Duration::from_secs(self.config.lock_reaper_interval_secs),
        ));
        let _handshaker = tokio::spawn(handshake_loop(
            node.clone(),
            Duration::from_secs(self.config.handshake_interval_secs),
        ));

        let http_state = AppState {
            node: node.clone(),
            coordinator,
        };
        let http_router = create_router(http_state);

        let grpc_server = tonic::transport::Server::builder()
            .add_service(PeerMgmtService::new(node.clone()).into_server())
            .serve(self.config.grpc_addr);

        let http_listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        let http_server = axum::serve(http_listener, http_router);

        tracing::info!("volmand ready");

        tokio::select! {
            res = http_server => {
                if let Err(e) = res {
                    tracing::error!("HTTP server error: {}", e);
                }
            }
            res = grpc_server => {
                if let Err(e) = res {
                    tracing::error!("gRPC server error: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
            }
        }

        Ok(())
    }
}

/// Force-release locks whose owner has been unreachable past the staleness
/// timeout. The local node and connected peers are never reaped.
async fn lock_reaper(node: Arc<Node>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;

        let connected: HashSet<Uuid> = {
            let state = node.state.read().await;
            state.peers.connected().iter().map(|p| p.id).collect()
        };
        let local = node.id;
        let reaped = node
            .locks
            .reap_stale(|owner| *owner != local && !connected.contains(owner));
        for (resource, owner) in reaped {
            tracing::warn!(%resource, %owner, "reaped stale lock from unreachable owner");
        }
    }
}

/// Periodically handshake every known peer: promotes reachable peers to
/// `Connected`, demotes silent ones, and pulls newer volume copies.
async fn handshake_loop(node: Arc<Node>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;

        for endpoint in node.known_endpoints().await {
            match node.sync_with_peer(&endpoint).await {
                Ok(()) => {}
                Err(e) => {
                    tracing::debug!(peer = %endpoint.hostname, error = %e, "handshake failed");
                    node.set_peer_state(&endpoint.id, PeerState::Disconnected).await;
                }
            }
        }
    }
}
