//! Peer membership operations: attach (probe) and detach
//!
//! Membership changes serialize under the global lock. The initiator
//! learns the candidate's identity through a handshake before the
//! transaction starts; the commit only records the already-verified peer.

use crate::cluster::peer::{Peer, PeerState};
use crate::common::{Error, Result};
use crate::daemon::node::Node;
use crate::txn::ops::OpSpec;
use uuid::Uuid;

fn parse_peer_id(spec: &OpSpec) -> Result<Uuid> {
    spec.param("id")?
        .parse()
        .map_err(|_| Error::ValidationFailed("malformed peer id".into()))
}

// === attach-peer ===

pub async fn stage_attach(node: &Node, spec: &OpSpec) -> Result<()> {
    let id = parse_peer_id(spec)?;
    let hostname = spec.param("hostname")?;
    spec.param("rpc_addr")?;

    if id == node.id {
        return Err(Error::ValidationFailed(
            "cannot attach this node to itself".into(),
        ));
    }
    let state = node.state.read().await;
    if state.peers.get(&id).is_some() {
        return Err(Error::AlreadyExists(format!("peer {}", id)));
    }
    if let Some(existing) = state.peers.find_by_hostname(hostname) {
        return Err(Error::AlreadyExists(format!(
            "hostname {} already belongs to peer {}",
            hostname, existing.id
        )));
    }
    Ok(())
}

pub async fn commit_attach(node: &Node, spec: &OpSpec) -> Result<()> {
    let id = parse_peer_id(spec)?;
    let hostname = spec.param("hostname")?;
    let rpc_addr = spec.param("rpc_addr")?;

    let peer = {
        let mut state = node.state.write().await;
        let mut peer = Peer::new(id, hostname, rpc_addr);
        peer.state = PeerState::Connected;
        state.peers.insert(peer.clone())?;
        peer
    };
    node.persist_peer(&peer)?;
    tracing::info!(peer = %id, hostname, "peer attached");
    Ok(())
}

// === detach-peer ===

pub async fn stage_detach(node: &Node, spec: &OpSpec) -> Result<()> {
    let id = parse_peer_id(spec)?;
    if id == node.id {
        // This node is the one being detached; it accepts its removal. The
        // admin layer refuses detach requests targeting the initiator, so
        // this only runs on the target.
        let state = node.state.read().await;
        let hosting: Vec<String> = state
            .volumes
            .values()
            .filter(|v| v.bricks.iter().any(|b| b.peer_id == node.id))
            .map(|v| v.name.clone())
            .collect();
        if !hosting.is_empty() {
            return Err(Error::ValidationFailed(format!(
                "this node still hosts bricks of: {}",
                hosting.join(", ")
            )));
        }
        return Ok(());
    }
    let state = node.state.read().await;
    let peer = state
        .peers
        .get(&id)
        .ok_or_else(|| Error::NotFound(format!("peer {}", id)))?;
    if !peer.volumes.is_empty() {
        return Err(Error::ValidationFailed(format!(
            "peer {} still hosts bricks of: {}",
            id,
            peer.volumes.iter().cloned().collect::<Vec<_>>().join(", ")
        )));
    }
    Ok(())
}

pub async fn commit_detach(node: &Node, spec: &OpSpec) -> Result<()> {
    let id = parse_peer_id(spec)?;

    if id == node.id {
        // Leaving the cluster: forget every peer
        let former: Vec<Uuid> = {
            let mut state = node.state.write().await;
            let former: Vec<Uuid> = state.peers.iter().map(|p| p.id).collect();
            state.peers.clear();
            former
        };
        for peer in &former {
            node.unpersist_peer(peer)?;
        }
        tracing::info!("detached from cluster");
        return Ok(());
    }

    {
        let mut state = node.state.write().await;
        state.peers.remove(&id)?;
    }
    node.unpersist_peer(&id)?;
    tracing::info!(peer = %id, "peer detached");
    Ok(())
}
