//! Volume and brick metadata
//!
//! A volume is a named storage service composed of bricks spread across
//! peers. Peers detect divergence of their copies by comparing a
//! monotonically increasing version and a deterministic checksum, so every
//! mutation here must go through [`Volume::bump_version`] (or at least
//! [`Volume::refresh_checksum`]) before the copy is shared.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::cluster::snapshot::SnapBackendKind;

/// Volume lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeStatus {
    Created,
    Started,
    Stopped,
}

impl std::fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeStatus::Created => write!(f, "created"),
            VolumeStatus::Started => write!(f, "started"),
            VolumeStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Brick lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrickStatus {
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// One storage unit of a volume: a path hosted on a peer.
///
/// Bricks are exclusively owned by their volume and ordered by `ordinal`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Brick {
    /// Hosting peer
    pub peer_id: Uuid,
    /// Filesystem path on the hosting peer
    pub path: String,
    /// Listening port, present once the worker has been started
    pub port: Option<u16>,
    pub status: BrickStatus,
    /// Position in the volume, gap-free, reused after removal
    pub ordinal: u32,
    /// Stable identifier, derived from volume name and ordinal
    pub brick_id: String,
    /// Replica-set tag used to co-locate members during configuration
    /// generation
    pub group: u16,
    /// Set while a remove-brick is draining this brick
    pub decommissioned: bool,
}

impl Brick {
    pub fn new(volume: &str, ordinal: u32, peer_id: Uuid, path: impl Into<String>) -> Self {
        Self {
            peer_id,
            path: path.into(),
            port: None,
            status: BrickStatus::Stopped,
            ordinal,
            brick_id: format!("{}-client-{}", volume, ordinal),
            group: 0,
            decommissioned: false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.status == BrickStatus::Started
    }
}

/// Rebalance task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RebalanceStatus {
    #[default]
    NotStarted,
    Started,
    Stopped,
    Completed,
    Failed,
}

/// Rebalance bookkeeping carried on the volume
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RebalanceInfo {
    pub task_id: Option<Uuid>,
    pub status: RebalanceStatus,
    pub rebalanced_files: u64,
    pub rebalanced_bytes: u64,
    pub skipped_files: u64,
    pub failures: u64,
}

/// Compact per-volume digest exchanged during the peer handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSummary {
    pub name: String,
    pub version: u64,
    pub checksum: u32,
}

/// A named distributed storage service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub id: Uuid,
    pub status: VolumeStatus,

    /// Replication topology. Invariant:
    /// `bricks.len() == subvol_count * dist_leaf_count`.
    pub replica_count: u32,
    pub arbiter_count: u32,
    pub disperse_count: u32,
    pub redundancy_count: u32,
    pub subvol_count: u32,
    pub dist_leaf_count: u32,

    /// Strictly increases on every committed mutation
    pub version: u64,
    /// Deterministic digest of the persisted representation
    pub checksum: u32,

    pub options: BTreeMap<String, String>,
    pub bricks: Vec<Brick>,

    // Snapshot linkage
    pub is_snap_volume: bool,
    pub parent_volname: Option<String>,
    /// Owning snapshot name when `is_snap_volume`
    pub snapshot: Option<String>,
    pub snap_backend: SnapBackendKind,

    pub rebal: RebalanceInfo,
    pub quota_conf_version: u32,

    /// In-flight operations and RPC callbacks hold references; destructive
    /// delete only happens at zero.
    #[serde(skip)]
    pub refcnt: u32,
    /// Volume passed delete staging, awaiting commit
    #[serde(skip)]
    pub stage_deleted: bool,
}

impl Volume {
    pub fn new(name: impl Into<String>) -> Self {
        let mut vol = Self {
            name: name.into(),
            id: Uuid::new_v4(),
            status: VolumeStatus::Created,
            replica_count: 1,
            arbiter_count: 0,
            disperse_count: 0,
            redundancy_count: 0,
            subvol_count: 0,
            dist_leaf_count: 1,
            version: 0,
            checksum: 0,
            options: BTreeMap::new(),
            bricks: Vec::new(),
            is_snap_volume: false,
            parent_volname: None,
            snapshot: None,
            snap_backend: SnapBackendKind::default(),
            rebal: RebalanceInfo::default(),
            quota_conf_version: 0,
            refcnt: 0,
            stage_deleted: false,
        };
        vol.refresh_checksum();
        vol
    }

    pub fn brick_count(&self) -> u32 {
        self.bricks.len() as u32
    }

    pub fn is_started(&self) -> bool {
        self.status == VolumeStatus::Started
    }

    pub fn is_replicated(&self) -> bool {
        self.replica_count > 1
    }

    /// Leaf count of one distribute subvolume
    pub fn leaf_count(&self) -> u32 {
        if self.disperse_count > 0 {
            self.disperse_count
        } else {
            self.replica_count.max(1)
        }
    }

    /// Recompute `dist_leaf_count` / `subvol_count` from the brick list and
    /// check the topology invariant.
    pub fn recompute_topology(&mut self) -> Result<()> {
        self.dist_leaf_count = self.leaf_count();
        let count = self.brick_count();
        if count == 0 {
            return Err(Error::ValidationFailed(format!(
                "volume {} has no bricks",
                self.name
            )));
        }
        if count % self.dist_leaf_count != 0 {
            return Err(Error::ValidationFailed(format!(
                "brick count {} is not a multiple of {} for volume {}",
                count, self.dist_leaf_count, self.name
            )));
        }
        self.subvol_count = count / self.dist_leaf_count;

        // Tag replica-set membership for configuration generation
        for (idx, brick) in self.bricks.iter_mut().enumerate() {
            brick.group = (idx as u32 / self.dist_leaf_count) as u16;
        }
        Ok(())
    }

    /// Lowest unused ordinal. Scans the brick list instead of keeping a
    /// counter so ids stay bounded across repeated add/remove cycles.
    pub fn next_brick_ordinal(&self) -> u32 {
        let mut used: Vec<u32> = self.bricks.iter().map(|b| b.ordinal).collect();
        used.sort_unstable();
        let mut next = 0;
        for ordinal in used {
            if ordinal == next {
                next += 1;
            } else if ordinal > next {
                break;
            }
        }
        next
    }

    /// Insert a brick keeping the list ordered by ordinal.
    pub fn add_brick(&mut self, brick: Brick) -> Result<()> {
        if self.bricks.iter().any(|b| b.ordinal == brick.ordinal) {
            return Err(Error::AlreadyExists(format!(
                "brick ordinal {} in volume {}",
                brick.ordinal, self.name
            )));
        }
        if self.find_brick(&brick.peer_id, &brick.path).is_some() {
            return Err(Error::AlreadyExists(format!(
                "brick {}:{} in volume {}",
                brick.peer_id, brick.path, self.name
            )));
        }
        let pos = self
            .bricks
            .iter()
            .position(|b| b.ordinal > brick.ordinal)
            .unwrap_or(self.bricks.len());
        self.bricks.insert(pos, brick);
        Ok(())
    }

    pub fn remove_brick(&mut self, peer_id: &Uuid, path: &str) -> Result<Brick> {
        let pos = self
            .bricks
            .iter()
            .position(|b| b.peer_id == *peer_id && b.path == path)
            .ok_or_else(|| {
                Error::NotFound(format!("brick {}:{} in volume {}", peer_id, path, self.name))
            })?;
        Ok(self.bricks.remove(pos))
    }

    pub fn find_brick(&self, peer_id: &Uuid, path: &str) -> Option<&Brick> {
        self.bricks
            .iter()
            .find(|b| b.peer_id == *peer_id && b.path == path)
    }

    pub fn find_brick_mut(&mut self, peer_id: &Uuid, path: &str) -> Option<&mut Brick> {
        self.bricks
            .iter_mut()
            .find(|b| b.peer_id == *peer_id && b.path == path)
    }

    /// Digest over the persisted representation. Runtime-only fields (brick
    /// status, ports, refcount) are excluded so that two peers holding the
    /// same configuration agree regardless of local process state.
    pub fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(self.name.as_bytes());
        hasher.update(self.id.as_bytes());
        hasher.update(&self.version.to_le_bytes());
        for count in [
            self.replica_count,
            self.arbiter_count,
            self.disperse_count,
            self.redundancy_count,
            self.subvol_count,
            self.dist_leaf_count,
        ] {
            hasher.update(&count.to_le_bytes());
        }
        hasher.update(&[self.is_snap_volume as u8]);
        if let Some(parent) = &self.parent_volname {
            hasher.update(parent.as_bytes());
        }
        for (key, value) in &self.options {
            hasher.update(key.as_bytes());
            hasher.update(&[0]);
            hasher.update(value.as_bytes());
            hasher.update(&[0]);
        }
        for brick in &self.bricks {
            hasher.update(&brick.ordinal.to_le_bytes());
            hasher.update(brick.peer_id.as_bytes());
            hasher.update(brick.path.as_bytes());
            hasher.update(&[brick.decommissioned as u8]);
        }
        hasher.finalize()
    }

    pub fn refresh_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Record a committed mutation: version strictly increases, checksum
    /// follows.
    pub fn bump_version(&mut self) {
        self.version += 1;
        self.refresh_checksum();
    }

    pub fn summary(&self) -> VolumeSummary {
        VolumeSummary {
            name: self.name.clone(),
            version: self.version,
            checksum: self.checksum,
        }
    }

    /// Merge a peer's copy of this volume.
    ///
    /// An incoming version lower than ours is a regression and is rejected;
    /// equal versions with differing checksums are flagged as divergence;
    /// a strictly newer version replaces configuration wholesale, preserving
    /// local brick runtime state (status, port) where bricks match.
    pub fn import(&mut self, incoming: Volume) -> Result<()> {
        if incoming.name != self.name {
            return Err(Error::Internal(format!(
                "import of volume {} into {}",
                incoming.name, self.name
            )));
        }
        if incoming.version < self.version {
            return Err(Error::ValidationFailed(format!(
                "peer copy of volume {} is older (version {} < {})",
                self.name, incoming.version, self.version
            )));
        }
        if incoming.version == self.version {
            if incoming.checksum != self.checksum {
                return Err(Error::DivergenceDetected {
                    volume: self.name.clone(),
                    version: self.version,
                    local_cksum: self.checksum,
                    remote_cksum: incoming.checksum,
                });
            }
            return Ok(());
        }

        let old_bricks = std::mem::take(&mut self.bricks);
        let refcnt = self.refcnt;
        *self = incoming;
        self.refcnt = refcnt;
        self.stage_deleted = false;
        for brick in &mut self.bricks {
            if let Some(old) = old_bricks
                .iter()
                .find(|b| b.peer_id == brick.peer_id && b.path == brick.path)
            {
                brick.status = old.status;
                brick.port = old.port;
            }
        }
        Ok(())
    }
}
