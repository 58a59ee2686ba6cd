//! Snapshot operations: create, delete, restore
//!
//! A snapshot captures one snapshot volume per origin volume. Snapshot
//! volumes are real volumes in the registry (linked to their snapshot and
//! to the global list) so the handshake replicates them like any other.

use crate::cluster::snapshot::{backend_for, SnapStatus, Snapshot};
use crate::cluster::volume::{BrickStatus, VolumeStatus};
use crate::common::{validate_name, Error, Result};
use crate::daemon::node::Node;
use crate::txn::ops::OpSpec;

fn parse_volume_list(value: &str) -> Result<Vec<String>> {
    let volumes: Vec<String> = value
        .split(',')
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect();
    if volumes.is_empty() {
        return Err(Error::ValidationFailed("empty volume list".into()));
    }
    Ok(volumes)
}

// === snap-create ===

pub async fn stage_create(node: &Node, spec: &OpSpec) -> Result<()> {
    let snapname = spec.param("snapname")?;
    validate_name(snapname)?;
    let volumes = parse_volume_list(spec.param("volumes")?)?;

    let state = node.state.read().await;
    if state.snapshots.contains_key(snapname) {
        return Err(Error::AlreadyExists(format!("snapshot {}", snapname)));
    }
    for name in &volumes {
        let vol = state.volume(name)?;
        if !vol.is_started() {
            return Err(Error::ValidationFailed(format!(
                "volume {} must be started to snapshot it",
                name
            )));
        }
        if vol.is_snap_volume {
            return Err(Error::ValidationFailed(format!(
                "{} is itself a snapshot volume",
                name
            )));
        }
        let snap_vol_name = format!("{}_{}", snapname, name);
        if state.volumes.contains_key(&snap_vol_name) {
            return Err(Error::AlreadyExists(format!("volume {}", snap_vol_name)));
        }
        let backend = backend_for(vol.snap_backend);
        for brick in &vol.bricks {
            if brick.peer_id == node.id && !backend.probe(&brick.path) {
                return Err(Error::ValidationFailed(format!(
                    "brick {} cannot be captured by the {:?} backend",
                    brick.path, vol.snap_backend
                )));
            }
        }
    }
    Ok(())
}

pub async fn commit_create(node: &Node, spec: &OpSpec) -> Result<()> {
    let snapname = spec.param("snapname")?;
    let volumes = parse_volume_list(spec.param("volumes")?)?;
    let description = spec.param_opt("description").map(str::to_string);

    let mut snap = Snapshot::new(snapname, description);
    // Identities and timestamp were pinned by the initiator so every peer
    // commits an identical record
    if let Some(id) = spec.param_opt("snap-id") {
        snap.id = id
            .parse()
            .map_err(|_| Error::ValidationFailed("malformed snapshot id".into()))?;
    }
    if let Some(raw) = spec.param_opt("timestamp") {
        let secs: i64 = raw
            .parse()
            .map_err(|_| Error::ValidationFailed("malformed snapshot timestamp".into()))?;
        snap.created_at = chrono::DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| Error::ValidationFailed("snapshot timestamp out of range".into()))?;
    }
    let mut snap_volumes = Vec::new();

    {
        let state = node.state.read().await;
        for name in &volumes {
            let origin = state.volume(name)?;
            let backend = backend_for(origin.snap_backend);
            backend.create(&snap, origin)?;

            let mut snap_vol = origin.clone();
            snap_vol.name = snap.volume_name_for(name);
            snap_vol.id = match spec.param_opt(&format!("snap-vol-id.{}", name)) {
                Some(id) => id
                    .parse()
                    .map_err(|_| Error::ValidationFailed("malformed snapshot volume id".into()))?,
                None => uuid::Uuid::new_v4(),
            };
            snap_vol.status = VolumeStatus::Created;
            snap_vol.is_snap_volume = true;
            snap_vol.parent_volname = Some(name.clone());
            snap_vol.snapshot = Some(snap.name.clone());
            snap_vol.version = 0;
            snap_vol.refcnt = 0;
            snap_vol.stage_deleted = false;
            snap_vol.rebal = Default::default();
            for brick in &mut snap_vol.bricks {
                brick.path = backend.brick_path(&snap, &brick.path);
                brick.brick_id = format!("{}-client-{}", snap_vol.name, brick.ordinal);
                brick.status = BrickStatus::Stopped;
                brick.port = None;
            }
            snap_vol.bump_version();
            snap.volumes.push(snap_vol.name.clone());
            snap_volumes.push(snap_vol);
        }
    }

    snap.status = SnapStatus::InUse;

    {
        let mut state = node.state.write().await;
        for snap_vol in &snap_volumes {
            state.insert_volume(snap_vol.clone())?;
        }
        state.insert_snapshot(snap.clone())?;
    }
    for snap_vol in &snap_volumes {
        node.persist_volume(snap_vol)?;
    }
    node.persist_snapshot(&snap)?;
    tracing::info!(snapshot = snapname, volumes = snap.volumes.len(), "snapshot created");
    Ok(())
}

// === snap-delete ===

pub async fn stage_delete(node: &Node, spec: &OpSpec) -> Result<()> {
    let snapname = spec.param("snapname")?;
    let state = node.state.read().await;
    let snap = state.snapshot(snapname)?;
    if snap.status == SnapStatus::UnderRestore {
        return Err(Error::ValidationFailed(format!(
            "snapshot {} is being restored",
            snapname
        )));
    }
    Ok(())
}

pub async fn commit_delete(node: &Node, spec: &OpSpec) -> Result<()> {
    let snapname = spec.param("snapname")?;

    let (snap, volume_names) = {
        let state = node.state.read().await;
        let snap = state.snapshot(snapname)?.clone();
        (snap.clone(), snap.volumes)
    };

    if let Some(first) = volume_names.first() {
        let state = node.state.read().await;
        if let Ok(vol) = state.volume(first) {
            backend_for(vol.snap_backend).remove(&snap)?;
        }
    }

    {
        let mut state = node.state.write().await;
        for name in &volume_names {
            if state.volumes.contains_key(name) {
                state.delete_volume(name)?;
            }
        }
        state.snapshots.remove(snapname);
    }
    for name in &volume_names {
        node.unpersist_volume(name)?;
    }
    node.unpersist_snapshot(snapname)?;
    tracing::info!(snapshot = snapname, "snapshot deleted");
    Ok(())
}

// === snap-restore ===

pub async fn stage_restore(node: &Node, spec: &OpSpec) -> Result<()> {
    let snapname = spec.param("snapname")?;
    let state = node.state.read().await;
    let snap = state.snapshot(snapname)?;
    if snap.status == SnapStatus::UnderRestore {
        return Err(Error::ValidationFailed(format!(
            "snapshot {} restore already in progress",
            snapname
        )));
    }
    for snap_vol_name in &snap.volumes {
        let snap_vol = state.volume(snap_vol_name)?;
        let origin_name = snap_vol.parent_volname.as_deref().ok_or_else(|| {
            Error::MetadataCorrupted(format!("snapshot volume {} has no origin", snap_vol_name))
        })?;
        let origin = state.volume(origin_name)?;
        if origin.is_started() {
            return Err(Error::ValidationFailed(format!(
                "origin volume {} must be stopped before restore",
                origin_name
            )));
        }
    }
    Ok(())
}

pub async fn commit_restore(node: &Node, spec: &OpSpec) -> Result<()> {
    let snapname = spec.param("snapname")?;

    let (snap, snap_volumes) = {
        let mut state = node.state.write().await;
        let snap = state.snapshot_mut(snapname)?;
        snap.status = SnapStatus::UnderRestore;
        let snap = snap.clone();
        let mut snap_vols = Vec::new();
        for name in &snap.volumes {
            snap_vols.push(state.volume(name)?.clone());
        }
        (snap, snap_vols)
    };

    let mut restored = Vec::new();
    {
        let mut state = node.state.write().await;
        for snap_vol in &snap_volumes {
            let origin_name = snap_vol.parent_volname.clone().ok_or_else(|| {
                Error::MetadataCorrupted(format!("snapshot volume {} has no origin", snap_vol.name))
            })?;
            backend_for(snap_vol.snap_backend).restore(&snap, state.volume(&origin_name)?)?;

            let origin = state.volume_mut(&origin_name)?;
            origin.options = snap_vol.options.clone();
            origin.bricks = snap_vol.bricks.clone();
            for brick in &mut origin.bricks {
                brick.brick_id = format!("{}-client-{}", origin_name, brick.ordinal);
                brick.status = BrickStatus::Stopped;
                brick.port = None;
            }
            origin.bump_version();
            restored.push(origin.clone());
        }
        let snap = state.snapshot_mut(snapname)?;
        snap.status = SnapStatus::Restored;
    }

    for vol in &restored {
        node.persist_volume(vol)?;
    }
    let snap = {
        let state = node.state.read().await;
        state.snapshot(snapname)?.clone()
    };
    node.persist_snapshot(&snap)?;
    tracing::info!(snapshot = snapname, volumes = restored.len(), "snapshot restored");
    Ok(())
}
