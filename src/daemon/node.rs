//! Per-daemon node context
//!
//! One [`Node`] owns everything a daemon works with: the cluster state, the
//! lock manager, the brick supervisor, the persistence store, and the peer
//! transport. It is the server side of the peer RPC surface and the
//! active side of the reconciling handshake.

use crate::brick::{BrickSupervisor, ProcessLauncher};
use crate::cluster::handshake;
use crate::cluster::peer::{Peer, PeerState};
use crate::cluster::snapshot::Snapshot;
use crate::cluster::state::ClusterState;
use crate::cluster::store::MetaStore;
use crate::cluster::volume::{Volume, VolumeSummary};
use crate::common::{DaemonConfig, Error, Result};
use crate::rpc::{PeerEndpoint, PeerReply, PeerRequest, PeerTransport};
use crate::txn::ops;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub struct Node {
    pub id: Uuid,
    pub hostname: String,
    pub rpc_addr: String,
    pub config: DaemonConfig,
    pub state: RwLock<ClusterState>,
    pub locks: crate::txn::lock::LockManager,
    pub supervisor: BrickSupervisor,
    pub transport: Arc<dyn PeerTransport>,
    store: Option<MetaStore>,
}

impl Node {
    /// Build a node, restoring volumes, snapshots, peers, and cluster
    /// options from the store when one is given. Restored peers start
    /// `Disconnected`; the handshake loop promotes them.
    pub fn new(
        config: DaemonConfig,
        id: Uuid,
        hostname: impl Into<String>,
        rpc_addr: impl Into<String>,
        store: Option<MetaStore>,
        transport: Arc<dyn PeerTransport>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Result<Arc<Self>> {
        let hostname = hostname.into();
        let mut state = ClusterState::new(id, hostname.clone());

        if let Some(store) = &store {
            for mut peer in store.load_peers()? {
                peer.state = PeerState::Disconnected;
                state.peers.insert(peer)?;
            }
            for volume in store.load_volumes()? {
                state.insert_volume(volume)?;
            }
            for snap in store.load_snapshots()? {
                state.insert_snapshot(snap)?;
            }
            state.options = store.load_options()?;
        }

        let supervisor = BrickSupervisor::new(
            launcher,
            config.base_port,
            config.max_port,
            config.brick_mux_enabled,
            config.max_bricks_per_process,
        );

        Ok(Arc::new(Self {
            id,
            hostname,
            rpc_addr: rpc_addr.into(),
            locks: crate::txn::lock::LockManager::new(config.lock_timeout()),
            supervisor,
            config,
            state: RwLock::new(state),
            transport,
            store,
        }))
    }

    // === Persistence collaborator ===

    pub(crate) fn persist_volume(&self, volume: &Volume) -> Result<()> {
        match &self.store {
            Some(store) => store.save_volume(volume),
            None => Ok(()),
        }
    }

    pub(crate) fn unpersist_volume(&self, name: &str) -> Result<()> {
        match &self.store {
            Some(store) => store.delete_volume(name),
            None => Ok(()),
        }
    }

    pub(crate) fn persist_snapshot(&self, snap: &Snapshot) -> Result<()> {
        match &self.store {
            Some(store) => store.save_snapshot(snap),
            None => Ok(()),
        }
    }

    pub(crate) fn unpersist_snapshot(&self, name: &str) -> Result<()> {
        match &self.store {
            Some(store) => store.delete_snapshot(name),
            None => Ok(()),
        }
    }

    pub(crate) fn persist_peer(&self, peer: &Peer) -> Result<()> {
        match &self.store {
            Some(store) => store.save_peer(peer),
            None => Ok(()),
        }
    }

    pub(crate) fn unpersist_peer(&self, id: &Uuid) -> Result<()> {
        match &self.store {
            Some(store) => store.delete_peer(id),
            None => Ok(()),
        }
    }

    pub(crate) fn persist_options(&self, options: &BTreeMap<String, String>) -> Result<()> {
        match &self.store {
            Some(store) => store.save_options(options),
            None => Ok(()),
        }
    }

    // === Fan-out targets ===

    pub async fn connected_endpoints(&self) -> Vec<PeerEndpoint> {
        let state = self.state.read().await;
        state.peers.connected().iter().map(PeerEndpoint::from).collect()
    }

    pub async fn known_endpoints(&self) -> Vec<PeerEndpoint> {
        let state = self.state.read().await;
        state.peers.iter().map(PeerEndpoint::from).collect()
    }

    pub async fn set_peer_state(&self, id: &Uuid, peer_state: PeerState) {
        let mut state = self.state.write().await;
        let _ = state.peers.set_state(id, peer_state);
    }

    // === Peer RPC server side ===

    /// Handle one inbound peer request. Application failures become
    /// `Rejected`/`Busy` replies; only the transport reports `Err`.
    pub async fn handle_peer_request(self: &Arc<Self>, request: PeerRequest) -> PeerReply {
        match request {
            PeerRequest::Lock {
                resource,
                txn_id,
                owner,
            } => match self.locks.acquire(&resource, owner, txn_id) {
                Ok(()) => PeerReply::Ok,
                Err(Error::LockBusy { owner, .. }) => PeerReply::Busy { owner },
                Err(e) => PeerReply::Rejected {
                    reason: e.to_string(),
                },
            },
            PeerRequest::Unlock { resource, txn_id } => {
                match self.locks.release(&resource, txn_id) {
                    Ok(()) => PeerReply::Ok,
                    // A forced staleness release may have beaten us here;
                    // unlock stays idempotent
                    Err(Error::LockNotHeld { .. }) => {
                        tracing::debug!(%resource, %txn_id, "unlock of unheld lock");
                        PeerReply::Ok
                    }
                    Err(e) => PeerReply::Rejected {
                        reason: e.to_string(),
                    },
                }
            }
            PeerRequest::Stage { txn_id, op } => {
                tracing::debug!(%txn_id, op = %op.kind, "peer stage request");
                match ops::stage(self, &op).await {
                    Ok(()) => PeerReply::Ok,
                    Err(e) => PeerReply::Rejected {
                        reason: e.to_string(),
                    },
                }
            }
            PeerRequest::Commit { txn_id, op } => {
                if !self.locks.mark_committed(txn_id) {
                    tracing::debug!(%txn_id, op = %op.kind, "duplicate commit ignored");
                    return PeerReply::Ok;
                }
                match ops::commit(self, txn_id, &op).await {
                    Ok(()) => PeerReply::Ok,
                    Err(e) => {
                        self.locks.clear_committed(txn_id);
                        PeerReply::Rejected {
                            reason: e.to_string(),
                        }
                    }
                }
            }
            PeerRequest::Handshake {
                from_id,
                from_hostname,
                from_addr,
                volumes,
            } => self.handle_handshake(from_id, from_hostname, from_addr, volumes).await,
            PeerRequest::FetchVolume { name } => {
                let state = self.state.read().await;
                match state.volume(&name) {
                    Ok(vol) => PeerReply::Volume(Box::new(vol.clone())),
                    Err(e) => PeerReply::Rejected {
                        reason: e.to_string(),
                    },
                }
            }
        }
    }

    async fn handle_handshake(
        &self,
        from_id: Uuid,
        from_hostname: String,
        from_addr: String,
        remote: Vec<VolumeSummary>,
    ) -> PeerReply {
        let mut state = self.state.write().await;

        // Gossip discovery: a handshaking node we have never seen becomes a
        // peer. A known one is marked connected and may gain a hostname
        // alias.
        if from_id != self.id && !from_id.is_nil() {
            match state.peers.get_mut(&from_id) {
                Some(peer) => {
                    peer.add_hostname(from_hostname.clone());
                    let peer = peer.clone();
                    let _ = state.peers.set_state(&from_id, PeerState::Connected);
                    let _ = self.persist_peer(&peer);
                }
                None => {
                    let mut peer = Peer::new(from_id, from_hostname.clone(), from_addr);
                    peer.state = PeerState::Connected;
                    if state.peers.insert(peer.clone()).is_ok() {
                        tracing::info!(peer = %from_id, hostname = %from_hostname, "peer discovered via handshake");
                        let _ = self.persist_peer(&peer);
                    }
                }
            }
        }

        let local = state.volume_summaries();
        let diffs = handshake::compare_summaries(&local, &remote);
        for conflict in handshake::conflicts_from_diffs(&diffs, &local, &remote, from_id) {
            state.record_conflict(conflict);
        }

        PeerReply::Handshake {
            peer_id: self.id,
            diffs,
            volumes: local,
        }
    }

    // === Handshake driver (active side) ===

    /// Probe an address: handshake without a known identity, returning the
    /// answering node's id.
    pub async fn probe(&self, rpc_addr: &str, hostname: &str) -> Result<Uuid> {
        let endpoint = PeerEndpoint::probe(rpc_addr, hostname);
        let reply = self.call_handshake(&endpoint).await?;
        match reply {
            PeerReply::Handshake { peer_id, .. } => Ok(peer_id),
            other => Err(Error::Internal(format!(
                "unexpected probe reply: {:?}",
                other
            ))),
        }
    }

    async fn call_handshake(&self, endpoint: &PeerEndpoint) -> Result<PeerReply> {
        let volumes = {
            let state = self.state.read().await;
            state.volume_summaries()
        };
        self.transport
            .call(
                endpoint,
                PeerRequest::Handshake {
                    from_id: self.id,
                    from_hostname: self.hostname.clone(),
                    from_addr: self.rpc_addr.clone(),
                    volumes,
                },
            )
            .await
    }

    /// Full reconciling handshake with one peer: exchange summaries, pull
    /// volumes this node is missing or behind on, and honor
    /// majority-governed deletions.
    pub async fn sync_with_peer(&self, endpoint: &PeerEndpoint) -> Result<()> {
        let reply = self.call_handshake(endpoint).await?;
        let (peer_id, their_volumes) = match reply {
            PeerReply::Handshake {
                peer_id, volumes, ..
            } => (peer_id, volumes),
            other => {
                return Err(Error::Internal(format!(
                    "unexpected handshake reply: {:?}",
                    other
                )))
            }
        };

        if !endpoint.id.is_nil() && peer_id != endpoint.id {
            return Err(Error::PeerRejected {
                peer: endpoint.hostname.clone(),
                reason: format!("identity mismatch: expected {}, got {}", endpoint.id, peer_id),
            });
        }
        self.set_peer_state(&peer_id, PeerState::Connected).await;

        let plan = {
            let state = self.state.read().await;
            handshake::plan(&state, &their_volumes)
        };

        for name in &plan.fetch {
            let reply = self
                .transport
                .call(endpoint, PeerRequest::FetchVolume { name: name.clone() })
                .await?;
            let volume = match reply {
                PeerReply::Volume(v) => *v,
                PeerReply::Rejected { reason } => {
                    tracing::warn!(volume = %name, peer = %peer_id, reason = %reason, "volume fetch rejected");
                    continue;
                }
                other => {
                    return Err(Error::Internal(format!(
                        "unexpected fetch reply: {:?}",
                        other
                    )))
                }
            };

            let mut state = self.state.write().await;
            match handshake::apply_remote_volume(&mut state, peer_id, volume) {
                Ok(()) => {
                    let vol = state.volume(name)?.clone();
                    drop(state);
                    self.persist_volume(&vol)?;
                    tracing::info!(volume = %name, peer = %peer_id, "volume imported from peer");
                }
                Err(Error::DivergenceDetected { .. }) => {
                    // Recorded inside apply_remote_volume; operator's turn
                }
                Err(e) => {
                    tracing::warn!(volume = %name, peer = %peer_id, error = %e, "volume import failed");
                }
            }
        }

        for name in &plan.delete {
            let mut state = self.state.write().await;
            if state.delete_volume(name).is_ok() {
                drop(state);
                self.unpersist_volume(name)?;
                tracing::info!(volume = %name, "volume deleted after majority handshake");
            }
        }

        Ok(())
    }
}
