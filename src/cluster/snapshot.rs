//! Snapshot metadata and backend capability trait
//!
//! A snapshot captures one snapshot volume per origin volume. The actual
//! block-level capture (LVM thin pools, ZFS datasets) happens outside this
//! daemon; each backend kind implements the same small capability surface
//! and is selected by the `snap_backend` field on the volume.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cluster::volume::Volume;
use crate::common::Result;

/// Snapshot lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapStatus {
    Init,
    InUse,
    Decommission,
    UnderRestore,
    Restored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub id: Uuid,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: SnapStatus,
    /// Snapshot volume names, one per captured origin volume, in capture
    /// order
    pub volumes: Vec<String>,
}

impl Snapshot {
    pub fn new(name: impl Into<String>, description: Option<String>) -> Self {
        Self {
            name: name.into(),
            id: Uuid::new_v4(),
            description,
            created_at: Utc::now(),
            status: SnapStatus::Init,
            volumes: Vec::new(),
        }
    }

    /// Name of the snapshot volume capturing `origin` under this snapshot
    pub fn volume_name_for(&self, origin: &str) -> String {
        format!("{}_{}", self.name, origin)
    }
}

/// Which backend captures bricks of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SnapBackendKind {
    /// Metadata-only capture; brick paths are rewritten under a snapshot
    /// directory and the data capture is left to the operator or an
    /// external hook
    #[default]
    Plain,
    Lvm,
    Zfs,
}

/// Capability surface every snapshot backend provides.
///
/// Implementations must be side-effect free on the metadata model; the
/// caller owns all volume/snapshot mutation.
pub trait SnapshotBackend: Send + Sync {
    fn kind(&self) -> SnapBackendKind;

    /// Can this backend capture a brick at `brick_path`?
    fn probe(&self, brick_path: &str) -> bool;

    /// Brick path of the captured copy for `snap`
    fn brick_path(&self, snap: &Snapshot, origin_brick_path: &str) -> String;

    fn create(&self, snap: &Snapshot, origin: &Volume) -> Result<()>;
    fn clone_volume(&self, snap: &Snapshot, clone_name: &str) -> Result<()>;
    fn remove(&self, snap: &Snapshot) -> Result<()>;
    fn activate(&self, snap: &Snapshot) -> Result<()>;
    fn deactivate(&self, snap: &Snapshot) -> Result<()>;
    fn restore(&self, snap: &Snapshot, origin: &Volume) -> Result<()>;
}

/// Default backend: rewrites brick paths under `.snaps/<name>` and performs
/// no block-level work itself.
pub struct PlainBackend;

impl SnapshotBackend for PlainBackend {
    fn kind(&self) -> SnapBackendKind {
        SnapBackendKind::Plain
    }

    fn probe(&self, _brick_path: &str) -> bool {
        true
    }

    fn brick_path(&self, snap: &Snapshot, origin_brick_path: &str) -> String {
        format!("{}/.snaps/{}", origin_brick_path.trim_end_matches('/'), snap.name)
    }

    fn create(&self, _snap: &Snapshot, _origin: &Volume) -> Result<()> {
        Ok(())
    }

    fn clone_volume(&self, _snap: &Snapshot, _clone_name: &str) -> Result<()> {
        Ok(())
    }

    fn remove(&self, _snap: &Snapshot) -> Result<()> {
        Ok(())
    }

    fn activate(&self, _snap: &Snapshot) -> Result<()> {
        Ok(())
    }

    fn deactivate(&self, _snap: &Snapshot) -> Result<()> {
        Ok(())
    }

    fn restore(&self, _snap: &Snapshot, _origin: &Volume) -> Result<()> {
        Ok(())
    }
}

/// Backend lookup by kind. LVM and ZFS capture is driven by external
/// tooling, so they currently share the plain path-rewrite behavior here.
pub fn backend_for(kind: SnapBackendKind) -> &'static dyn SnapshotBackend {
    static PLAIN: PlainBackend = PlainBackend;
    match kind {
        SnapBackendKind::Plain | SnapBackendKind::Lvm | SnapBackendKind::Zfs => &PLAIN,
    }
}
