//! In-memory cluster state
//!
//! One explicitly-owned [`ClusterState`] per daemon holds every registry the
//! management plane works on: volumes, snapshots, peers, and the cluster-wide
//! option map. It is shared behind a single `tokio::sync::RwLock` (see the
//! daemon wiring); that lock only guards structural consistency during a
//! mutation — cross-operation serialization is the cluster lock manager's
//! job.

use crate::cluster::peer::{PeerRegistry, PeerState};
use crate::cluster::snapshot::Snapshot;
use crate::cluster::volume::{Volume, VolumeSummary};
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Quorum evaluation outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumStatus {
    /// Quorum enforcement is not enabled for this operation
    NotApplicable,
    Met,
    NotMet,
}

/// A checksum conflict detected by the handshake, kept for the operator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConflict {
    pub volume: String,
    pub version: u64,
    pub local_cksum: u32,
    pub remote_cksum: u32,
    pub peer: Uuid,
}

pub const OPT_QUORUM_TYPE: &str = "cluster.server-quorum-type";
pub const OPT_QUORUM_RATIO: &str = "cluster.server-quorum-ratio";
pub const DEFAULT_QUORUM_RATIO: u32 = 51;

pub struct ClusterState {
    /// This node's cluster-unique identity
    pub local_id: Uuid,
    pub local_hostname: String,

    pub volumes: BTreeMap<String, Volume>,
    pub snapshots: BTreeMap<String, Snapshot>,
    pub peers: PeerRegistry,

    /// Cluster-wide option map (quorum settings, defaults)
    pub options: BTreeMap<String, String>,

    /// Unresolved checksum conflicts, keyed by volume name
    pub conflicts: BTreeMap<String, VolumeConflict>,
}

impl ClusterState {
    pub fn new(local_id: Uuid, local_hostname: impl Into<String>) -> Self {
        Self {
            local_id,
            local_hostname: local_hostname.into(),
            volumes: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            peers: PeerRegistry::new(),
            options: BTreeMap::new(),
            conflicts: BTreeMap::new(),
        }
    }

    // === Volume registry ===

    pub fn volume(&self, name: &str) -> Result<&Volume> {
        self.volumes
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("volume {}", name)))
    }

    pub fn volume_mut(&mut self, name: &str) -> Result<&mut Volume> {
        self.volumes
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("volume {}", name)))
    }

    pub fn find_volume_by_id(&self, id: &Uuid) -> Option<&Volume> {
        self.volumes.values().find(|v| v.id == *id)
    }

    /// Register a volume and its peer back-references
    pub fn insert_volume(&mut self, volume: Volume) -> Result<()> {
        if self.volumes.contains_key(&volume.name) {
            return Err(Error::AlreadyExists(format!("volume {}", volume.name)));
        }
        for brick in &volume.bricks {
            self.peers.reference_volume(&brick.peer_id, &volume.name);
        }
        self.volumes.insert(volume.name.clone(), volume);
        Ok(())
    }

    /// Drop a volume immediately, clearing peer back-references. Callers go
    /// through [`ClusterState::delete_volume`] which honors the refcount.
    fn destroy_volume(&mut self, name: &str) -> Result<Volume> {
        let volume = self
            .volumes
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("volume {}", name)))?;
        for brick in &volume.bricks {
            self.peers.unreference_volume(&brick.peer_id, name);
        }
        self.conflicts.remove(name);
        Ok(volume)
    }

    /// Delete a volume. With references outstanding the volume is only
    /// marked; the final holder's `unref` performs the destructive removal.
    pub fn delete_volume(&mut self, name: &str) -> Result<Option<Volume>> {
        let volume = self.volume_mut(name)?;
        if volume.refcnt > 0 {
            volume.stage_deleted = true;
            tracing::debug!(volume = name, refcnt = volume.refcnt, "delete deferred");
            return Ok(None);
        }
        self.destroy_volume(name).map(Some)
    }

    pub fn ref_volume(&mut self, name: &str) -> Result<()> {
        let volume = self.volume_mut(name)?;
        volume.refcnt += 1;
        Ok(())
    }

    /// Drop a reference. Returns the volume if this was the last reference
    /// on a deferred delete.
    pub fn unref_volume(&mut self, name: &str) -> Result<Option<Volume>> {
        let volume = self.volume_mut(name)?;
        volume.refcnt = volume.refcnt.saturating_sub(1);
        if volume.refcnt == 0 && volume.stage_deleted {
            return self.destroy_volume(name).map(Some);
        }
        Ok(None)
    }

    /// Summaries of every non-snapshot volume, exchanged during handshake
    pub fn volume_summaries(&self) -> Vec<VolumeSummary> {
        self.volumes
            .values()
            .filter(|v| !v.is_snap_volume)
            .map(|v| v.summary())
            .collect()
    }

    // === Snapshot registry ===

    pub fn snapshot(&self, name: &str) -> Result<&Snapshot> {
        self.snapshots
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("snapshot {}", name)))
    }

    pub fn snapshot_mut(&mut self, name: &str) -> Result<&mut Snapshot> {
        self.snapshots
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("snapshot {}", name)))
    }

    pub fn insert_snapshot(&mut self, snap: Snapshot) -> Result<()> {
        if self.snapshots.contains_key(&snap.name) {
            return Err(Error::AlreadyExists(format!("snapshot {}", snap.name)));
        }
        self.snapshots.insert(snap.name.clone(), snap);
        Ok(())
    }

    // === Quorum ===

    /// Effective option value: volume option, falling back to the cluster
    /// option map.
    pub fn effective_option<'a>(&'a self, volume: Option<&'a Volume>, key: &str) -> Option<&'a str> {
        volume
            .and_then(|v| v.options.get(key))
            .or_else(|| self.options.get(key))
            .map(String::as_str)
    }

    /// Evaluate server quorum for an operation touching `volume` (None for
    /// cluster-wide operations). Counts this node plus connected peers
    /// against all known cluster members.
    pub fn evaluate_quorum(&self, volume: Option<&Volume>) -> QuorumStatus {
        let enforced = self
            .effective_option(volume, OPT_QUORUM_TYPE)
            .map(|v| v == "server")
            .unwrap_or(false);
        if !enforced {
            return QuorumStatus::NotApplicable;
        }

        let ratio = self
            .effective_option(volume, OPT_QUORUM_RATIO)
            .and_then(|v| v.trim_end_matches('%').parse::<u32>().ok())
            .unwrap_or(DEFAULT_QUORUM_RATIO);

        let (active, total) = self.quorum_counts();
        if (active * 100) as u64 >= (total as u64) * (ratio as u64) {
            QuorumStatus::Met
        } else {
            QuorumStatus::NotMet
        }
    }

    /// (active, total) cluster members, counting this node as active
    pub fn quorum_counts(&self) -> (usize, usize) {
        let total = self.peers.len() + 1;
        let active = self
            .peers
            .iter()
            .filter(|p| p.state == PeerState::Connected)
            .count()
            + 1;
        (active, total)
    }

    /// Does this node currently see a connected majority of the cluster?
    /// Used by the handshake before honoring remote deletions.
    pub fn sees_majority(&self) -> bool {
        let (active, total) = self.quorum_counts();
        active * 2 > total
    }

    // === Divergence bookkeeping ===

    pub fn record_conflict(&mut self, conflict: VolumeConflict) {
        tracing::error!(
            volume = %conflict.volume,
            version = conflict.version,
            local_cksum = conflict.local_cksum,
            remote_cksum = conflict.remote_cksum,
            peer = %conflict.peer,
            "volume checksum conflict, operator reconciliation required"
        );
        self.conflicts.insert(conflict.volume.clone(), conflict);
    }

    pub fn clear_conflict(&mut self, volume: &str) {
        self.conflicts.remove(volume);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::peer::Peer;
    use crate::cluster::volume::Brick;

    fn state_with_peers(connected: usize, disconnected: usize) -> ClusterState {
        let mut state = ClusterState::new(Uuid::new_v4(), "local");
        for i in 0..connected {
            let id = Uuid::new_v4();
            state
                .peers
                .insert(Peer::new(id, format!("c{}", i), format!("addr-c{}", i)))
                .unwrap();
            state.peers.set_state(&id, PeerState::Connected).unwrap();
        }
        for i in 0..disconnected {
            let id = Uuid::new_v4();
            state
                .peers
                .insert(Peer::new(id, format!("d{}", i), format!("addr-d{}", i)))
                .unwrap();
            state.peers.set_state(&id, PeerState::Disconnected).unwrap();
        }
        state
    }

    #[test]
    fn test_quorum_not_applicable_by_default() {
        let state = state_with_peers(0, 2);
        assert_eq!(state.evaluate_quorum(None), QuorumStatus::NotApplicable);
    }

    #[test]
    fn test_quorum_met_and_not_met() {
        let mut state = state_with_peers(2, 0);
        state
            .options
            .insert(OPT_QUORUM_TYPE.to_string(), "server".to_string());
        // 3 of 3 active
        assert_eq!(state.evaluate_quorum(None), QuorumStatus::Met);

        let mut state = state_with_peers(0, 2);
        state
            .options
            .insert(OPT_QUORUM_TYPE.to_string(), "server".to_string());
        // 1 of 3 active
        assert_eq!(state.evaluate_quorum(None), QuorumStatus::NotMet);
    }

    #[test]
    fn test_quorum_custom_ratio() {
        let mut state = state_with_peers(1, 2);
        state
            .options
            .insert(OPT_QUORUM_TYPE.to_string(), "server".to_string());
        // 2 of 4 = 50%: below the default 51
        assert_eq!(state.evaluate_quorum(None), QuorumStatus::NotMet);
        state
            .options
            .insert(OPT_QUORUM_RATIO.to_string(), "50".to_string());
        assert_eq!(state.evaluate_quorum(None), QuorumStatus::Met);
    }

    #[test]
    fn test_deferred_delete_at_refcount_zero() {
        let mut state = ClusterState::new(Uuid::new_v4(), "local");
        state.insert_volume(Volume::new("vol1")).unwrap();

        state.ref_volume("vol1").unwrap();
        // Delete is accepted but deferred while referenced
        assert!(state.delete_volume("vol1").unwrap().is_none());
        assert!(state.volume("vol1").unwrap().stage_deleted);

        // Final unref performs the destructive removal
        let removed = state.unref_volume("vol1").unwrap();
        assert!(removed.is_some());
        assert!(state.volume("vol1").is_err());
    }

    #[test]
    fn test_delete_unreferenced_is_immediate() {
        let mut state = ClusterState::new(Uuid::new_v4(), "local");
        state.insert_volume(Volume::new("vol1")).unwrap();
        assert!(state.delete_volume("vol1").unwrap().is_some());
        assert!(state.volume("vol1").is_err());
    }

    #[test]
    fn test_peer_backrefs_follow_volume() {
        let mut state = ClusterState::new(Uuid::new_v4(), "local");
        let peer_id = Uuid::new_v4();
        state
            .peers
            .insert(Peer::new(peer_id, "node-a", "addr-a"))
            .unwrap();

        let mut vol = Volume::new("vol1");
        vol.add_brick(Brick::new("vol1", 0, peer_id, "/data/b0")).unwrap();
        state.insert_volume(vol).unwrap();
        assert!(state.peers.get(&peer_id).unwrap().volumes.contains("vol1"));
        assert!(state.peers.remove(&peer_id).is_err());

        state.delete_volume("vol1").unwrap();
        assert!(state.peers.remove(&peer_id).is_ok());
    }
}
