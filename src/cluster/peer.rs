//! Peer identity and registry
//!
//! Every node in the cluster is a peer: a cluster-unique id, one or more
//! resolvable hostnames, and a connection state driven by the handshake.
//! A peer that hosts bricks is back-referenced by the owning volumes and
//! cannot be detached until those references are gone.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    /// Known but never handshaken
    Init,
    Connected,
    Disconnected,
    /// Handshake explicitly refused (version mismatch, conflicting cluster)
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: Uuid,
    /// First entry is the primary name; extra resolvable names are kept as
    /// aliases so a peer reachable under several addresses is still one peer
    pub hostnames: Vec<String>,
    /// Management RPC endpoint
    pub rpc_addr: String,
    pub state: PeerState,
    /// Volumes with at least one brick hosted here
    pub volumes: BTreeSet<String>,
}

impl Peer {
    pub fn new(id: Uuid, hostname: impl Into<String>, rpc_addr: impl Into<String>) -> Self {
        Self {
            id,
            hostnames: vec![hostname.into()],
            rpc_addr: rpc_addr.into(),
            state: PeerState::Init,
            volumes: BTreeSet::new(),
        }
    }

    pub fn primary_hostname(&self) -> &str {
        self.hostnames.first().map(String::as_str).unwrap_or("")
    }

    pub fn has_hostname(&self, name: &str) -> bool {
        self.hostnames.iter().any(|h| h == name)
    }

    pub fn add_hostname(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.has_hostname(&name) {
            self.hostnames.push(name);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == PeerState::Connected
    }
}

/// Registry of known cluster members, keyed by peer id
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<Uuid, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, peer: Peer) -> Result<()> {
        if self.peers.contains_key(&peer.id) {
            return Err(Error::AlreadyExists(format!("peer {}", peer.id)));
        }
        if let Some(existing) = self.find_by_hostname(peer.primary_hostname()) {
            return Err(Error::AlreadyExists(format!(
                "hostname {} already belongs to peer {}",
                peer.primary_hostname(),
                existing.id
            )));
        }
        self.peers.insert(peer.id, peer);
        Ok(())
    }

    /// Detach a peer. Refused while any volume still hosts a brick on it.
    pub fn remove(&mut self, id: &Uuid) -> Result<Peer> {
        let peer = self
            .peers
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("peer {}", id)))?;
        if !peer.volumes.is_empty() {
            return Err(Error::ValidationFailed(format!(
                "peer {} still hosts bricks of: {}",
                id,
                peer.volumes.iter().cloned().collect::<Vec<_>>().join(", ")
            )));
        }
        Ok(self.peers.remove(id).unwrap())
    }

    pub fn get(&self, id: &Uuid) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut Peer> {
        self.peers.get_mut(id)
    }

    pub fn find_by_hostname(&self, name: &str) -> Option<&Peer> {
        self.peers.values().find(|p| p.has_hostname(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Peers the coordinator fans RPCs out to
    pub fn connected(&self) -> Vec<Peer> {
        self.peers
            .values()
            .filter(|p| p.is_connected())
            .cloned()
            .collect()
    }

    /// Known peers, excluding self by construction (self is never inserted)
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn set_state(&mut self, id: &Uuid, state: PeerState) -> Result<()> {
        let peer = self
            .peers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("peer {}", id)))?;
        if peer.state != state {
            tracing::info!(peer = %id, from = ?peer.state, to = ?state, "peer state change");
            peer.state = state;
        }
        Ok(())
    }

    /// Forget every peer (this node is leaving the cluster)
    pub fn clear(&mut self) {
        self.peers.clear();
    }

    /// Track/untrack the volume back-reference on the hosting peer
    pub fn reference_volume(&mut self, peer_id: &Uuid, volume: &str) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.volumes.insert(volume.to_string());
        }
    }

    pub fn unreference_volume(&mut self, peer_id: &Uuid, volume: &str) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.volumes.remove(volume);
        }
    }
}
