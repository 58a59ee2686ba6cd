//! Volume lifecycle operations: create, delete, start, stop, options,
//! rebalance, quota

use crate::brick::BrickSpec;
use crate::cluster::snapshot::SnapBackendKind;
use crate::cluster::volume::{Brick, BrickStatus, RebalanceInfo, RebalanceStatus, Volume, VolumeStatus};
use crate::common::{validate_name, Error, Result};
use crate::daemon::node::Node;
use crate::txn::ops::{parse_brick_list, OpSpec};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Options applied to every new volume (overridable afterwards)
static DEFAULT_VOLUME_OPTIONS: Lazy<BTreeMap<&'static str, &'static str>> = Lazy::new(|| {
    BTreeMap::from([
        ("transport.address-family", "inet"),
        ("nfs.disable", "on"),
        ("performance.client-io-threads", "off"),
    ])
});

// === Shared brick helpers ===

fn brick_spec(volume: &str, brick: &Brick) -> BrickSpec {
    BrickSpec {
        volume: volume.to_string(),
        brick_id: brick.brick_id.clone(),
        path: brick.path.clone(),
    }
}

/// Start the local bricks of `volume` (all of them, or just `targets`).
/// On a launch failure the bricks already started by this call are stopped
/// again before the error propagates — the compensating action for
/// worker-starting commits.
pub(crate) async fn start_local_bricks(
    node: &Node,
    volume: &str,
    targets: Option<&[(Uuid, String)]>,
) -> Result<()> {
    let specs: Vec<BrickSpec> = {
        let state = node.state.read().await;
        let vol = state.volume(volume)?;
        vol.bricks
            .iter()
            .filter(|b| b.peer_id == node.id)
            .filter(|b| match targets {
                Some(list) => list.iter().any(|(p, path)| *p == b.peer_id && path == &b.path),
                None => true,
            })
            .map(|b| brick_spec(volume, b))
            .collect()
    };

    let mut started: Vec<(BrickSpec, u16)> = Vec::new();
    for spec in &specs {
        match node.supervisor.start(spec).await {
            Ok(port) => started.push((spec.clone(), port)),
            Err(e) => {
                tracing::error!(volume, brick = %spec.brick_id, error = %e, "brick start failed, stopping siblings");
                for (done, _) in &started {
                    if let Err(stop_err) = node.supervisor.stop(done, true).await {
                        tracing::warn!(brick = %done.brick_id, error = %stop_err, "compensating stop failed");
                    }
                }
                return Err(e);
            }
        }
    }

    let mut state = node.state.write().await;
    let vol = state.volume_mut(volume)?;
    for (spec, port) in started {
        if let Some(brick) = vol.bricks.iter_mut().find(|b| b.brick_id == spec.brick_id) {
            brick.status = BrickStatus::Started;
            brick.port = Some(port);
        }
    }
    Ok(())
}

/// Stop the local bricks of `volume` (all, or just `targets`)
pub(crate) async fn stop_local_bricks(
    node: &Node,
    volume: &str,
    targets: Option<&[(Uuid, String)]>,
    graceful: bool,
) -> Result<()> {
    let specs: Vec<BrickSpec> = {
        let state = node.state.read().await;
        let vol = state.volume(volume)?;
        vol.bricks
            .iter()
            .filter(|b| b.peer_id == node.id)
            .filter(|b| match targets {
                Some(list) => list.iter().any(|(p, path)| *p == b.peer_id && path == &b.path),
                None => true,
            })
            .map(|b| brick_spec(volume, b))
            .collect()
    };

    for spec in &specs {
        if let Err(e) = node.supervisor.stop(spec, graceful).await {
            tracing::warn!(volume, brick = %spec.brick_id, error = %e, "brick stop failed");
        }
    }

    let mut state = node.state.write().await;
    let vol = state.volume_mut(volume)?;
    for spec in specs {
        if let Some(brick) = vol.bricks.iter_mut().find(|b| b.brick_id == spec.brick_id) {
            brick.status = BrickStatus::Stopped;
            brick.port = None;
        }
    }
    Ok(())
}

/// Validate that a brick is usable: hosted on this node or a known,
/// connected peer, and not already part of any volume.
pub(crate) fn validate_new_brick(
    state: &crate::cluster::ClusterState,
    local_id: Uuid,
    peer_id: &Uuid,
    path: &str,
) -> Result<()> {
    if *peer_id != local_id {
        let peer = state.peers.get(peer_id).ok_or_else(|| {
            Error::ValidationFailed(format!("brick host {} is not a cluster member", peer_id))
        })?;
        if !peer.is_connected() {
            return Err(Error::ValidationFailed(format!(
                "brick host {} ({}) is not connected",
                peer_id,
                peer.primary_hostname()
            )));
        }
    }
    for vol in state.volumes.values() {
        if vol.find_brick(peer_id, path).is_some() {
            return Err(Error::ValidationFailed(format!(
                "brick {}:{} is already part of volume {}",
                peer_id, path, vol.name
            )));
        }
    }
    Ok(())
}

// === create-volume ===

pub async fn stage_create(node: &Node, spec: &OpSpec) -> Result<()> {
    let name = spec.param("name")?;
    validate_name(name)?;

    let replica = spec.param_u32("replica", 1)?;
    let arbiter = spec.param_u32("arbiter", 0)?;
    let disperse = spec.param_u32("disperse", 0)?;
    let redundancy = spec.param_u32("redundancy", 0)?;

    if disperse > 0 && replica > 1 {
        return Err(Error::ValidationFailed(
            "disperse and replica cannot be combined".into(),
        ));
    }
    if arbiter > 0 && replica < 3 {
        return Err(Error::ValidationFailed(
            "arbiter requires replica 3".into(),
        ));
    }
    if redundancy > 0 && (disperse == 0 || redundancy * 2 >= disperse) {
        return Err(Error::ValidationFailed(format!(
            "redundancy {} is invalid for disperse {}",
            redundancy, disperse
        )));
    }

    let bricks = parse_brick_list(spec.param("bricks")?)?;
    let leaf = if disperse > 0 { disperse } else { replica.max(1) };
    if bricks.len() as u32 % leaf != 0 {
        return Err(Error::ValidationFailed(format!(
            "brick count {} is not a multiple of {}",
            bricks.len(),
            leaf
        )));
    }

    let state = node.state.read().await;
    if state.volumes.contains_key(name) {
        return Err(Error::AlreadyExists(format!("volume {}", name)));
    }
    for (peer, path) in &bricks {
        validate_new_brick(&state, node.id, peer, path)?;
    }
    Ok(())
}

pub async fn commit_create(node: &Node, spec: &OpSpec) -> Result<()> {
    let name = spec.param("name")?;
    let bricks = parse_brick_list(spec.param("bricks")?)?;

    let mut vol = Volume::new(name);
    // The initiator pins the id so every peer commits an identical record
    if let Some(id) = spec.param_opt("volume-id") {
        vol.id = id
            .parse()
            .map_err(|_| Error::ValidationFailed("malformed volume id".into()))?;
    }
    vol.replica_count = spec.param_u32("replica", 1)?.max(1);
    vol.arbiter_count = spec.param_u32("arbiter", 0)?;
    vol.disperse_count = spec.param_u32("disperse", 0)?;
    vol.redundancy_count = spec.param_u32("redundancy", 0)?;
    if let Some(backend) = spec.param_opt("snap-backend") {
        vol.snap_backend = match backend {
            "plain" => SnapBackendKind::Plain,
            "lvm" => SnapBackendKind::Lvm,
            "zfs" => SnapBackendKind::Zfs,
            other => {
                return Err(Error::ValidationFailed(format!(
                    "unknown snapshot backend: {}",
                    other
                )))
            }
        };
    }

    for (peer, path) in bricks {
        let ordinal = vol.next_brick_ordinal();
        vol.add_brick(Brick::new(name, ordinal, peer, path))?;
    }
    vol.recompute_topology()?;
    for (key, value) in DEFAULT_VOLUME_OPTIONS.iter() {
        vol.options.insert(key.to_string(), value.to_string());
    }
    vol.bump_version();

    {
        let mut state = node.state.write().await;
        state.insert_volume(vol.clone())?;
    }
    node.persist_volume(&vol)?;
    tracing::info!(volume = name, id = %vol.id, bricks = vol.brick_count(), "volume created");
    Ok(())
}

// === delete-volume ===

pub async fn stage_delete(node: &Node, spec: &OpSpec) -> Result<()> {
    let name = spec.param("name")?;
    let state = node.state.read().await;
    let vol = state.volume(name)?;
    if vol.is_started() {
        return Err(Error::ValidationFailed(format!(
            "volume {} is started, stop it first",
            name
        )));
    }
    if vol.is_snap_volume {
        return Err(Error::ValidationFailed(format!(
            "{} is a snapshot volume, delete its snapshot instead",
            name
        )));
    }
    if state
        .volumes
        .values()
        .any(|v| v.parent_volname.as_deref() == Some(name))
    {
        return Err(Error::ValidationFailed(format!(
            "volume {} still has snapshots",
            name
        )));
    }
    Ok(())
}

pub async fn commit_delete(node: &Node, spec: &OpSpec) -> Result<()> {
    let name = spec.param("name")?;
    {
        let mut state = node.state.write().await;
        state.delete_volume(name)?;
    }
    node.unpersist_volume(name)?;
    tracing::info!(volume = name, "volume deleted");
    Ok(())
}

// === start-volume ===

pub async fn stage_start(node: &Node, spec: &OpSpec) -> Result<()> {
    let name = spec.param("name")?;
    let force = spec.param_bool("force");
    let state = node.state.read().await;
    let vol = state.volume(name)?;
    if vol.is_started() && !force {
        return Err(Error::ValidationFailed(format!(
            "volume {} is already started",
            name
        )));
    }
    if vol.bricks.is_empty() {
        return Err(Error::ValidationFailed(format!("volume {} has no bricks", name)));
    }
    Ok(())
}

pub async fn commit_start(node: &Node, spec: &OpSpec) -> Result<()> {
    let name = spec.param("name")?;
    start_local_bricks(node, name, None).await?;

    let vol = {
        let mut state = node.state.write().await;
        let vol = state.volume_mut(name)?;
        vol.status = VolumeStatus::Started;
        vol.bump_version();
        vol.clone()
    };
    node.persist_volume(&vol)?;
    tracing::info!(volume = name, version = vol.version, "volume started");
    Ok(())
}

// === stop-volume ===

pub async fn stage_stop(node: &Node, spec: &OpSpec) -> Result<()> {
    let name = spec.param("name")?;
    let force = spec.param_bool("force");
    let state = node.state.read().await;
    let vol = state.volume(name)?;
    if !vol.is_started() && !force {
        return Err(Error::ValidationFailed(format!(
            "volume {} is not started",
            name
        )));
    }
    if vol.rebal.status == RebalanceStatus::Started && !force {
        return Err(Error::ValidationFailed(format!(
            "rebalance on volume {} is in progress",
            name
        )));
    }
    Ok(())
}

pub async fn commit_stop(node: &Node, spec: &OpSpec) -> Result<()> {
    let name = spec.param("name")?;
    let graceful = !spec.param_bool("force");
    stop_local_bricks(node, name, None, graceful).await?;

    let vol = {
        let mut state = node.state.write().await;
        let vol = state.volume_mut(name)?;
        vol.status = VolumeStatus::Stopped;
        vol.bump_version();
        vol.clone()
    };
    node.persist_volume(&vol)?;
    tracing::info!(volume = name, version = vol.version, "volume stopped");
    Ok(())
}

// === set-option / reset-option ===

pub async fn stage_set_option(node: &Node, spec: &OpSpec) -> Result<()> {
    let name = spec.param("name")?;
    let key = spec.param("key")?;
    spec.param("value")?;
    if key.is_empty() || !key.contains('.') {
        return Err(Error::ValidationFailed(format!(
            "malformed option key: {}",
            key
        )));
    }
    if name != "all" {
        let state = node.state.read().await;
        state.volume(name)?;
    }
    Ok(())
}

pub async fn commit_set_option(node: &Node, spec: &OpSpec) -> Result<()> {
    let name = spec.param("name")?;
    let key = spec.param("key")?;
    let value = spec.param("value")?;

    if name == "all" {
        let options = {
            let mut state = node.state.write().await;
            state.options.insert(key.to_string(), value.to_string());
            state.options.clone()
        };
        node.persist_options(&options)?;
        tracing::info!(key, value, "cluster option set");
        return Ok(());
    }

    let vol = {
        let mut state = node.state.write().await;
        let vol = state.volume_mut(name)?;
        vol.options.insert(key.to_string(), value.to_string());
        vol.bump_version();
        vol.clone()
    };
    node.persist_volume(&vol)?;
    tracing::info!(volume = name, key, value, "volume option set");
    Ok(())
}

pub async fn stage_reset_option(node: &Node, spec: &OpSpec) -> Result<()> {
    let name = spec.param("name")?;
    spec.param("key")?;
    if name != "all" {
        let state = node.state.read().await;
        state.volume(name)?;
    }
    Ok(())
}

pub async fn commit_reset_option(node: &Node, spec: &OpSpec) -> Result<()> {
    let name = spec.param("name")?;
    let key = spec.param("key")?;

    if name == "all" {
        let options = {
            let mut state = node.state.write().await;
            if key == "all" {
                state.options.clear();
            } else {
                state.options.remove(key);
            }
            state.options.clone()
        };
        node.persist_options(&options)?;
        return Ok(());
    }

    let vol = {
        let mut state = node.state.write().await;
        let vol = state.volume_mut(name)?;
        if key == "all" {
            vol.options.clear();
        } else {
            vol.options.remove(key);
        }
        vol.bump_version();
        vol.clone()
    };
    node.persist_volume(&vol)?;
    Ok(())
}

// === rebalance ===

pub async fn stage_rebalance(node: &Node, spec: &OpSpec) -> Result<()> {
    let name = spec.param("name")?;
    let action = spec.param("action")?;
    let state = node.state.read().await;
    let vol = state.volume(name)?;

    match action {
        "start" => {
            if !vol.is_started() {
                return Err(Error::ValidationFailed(format!(
                    "volume {} is not started",
                    name
                )));
            }
            if vol.subvol_count < 2 {
                return Err(Error::ValidationFailed(format!(
                    "volume {} has a single subvolume, nothing to rebalance",
                    name
                )));
            }
            if vol.rebal.status == RebalanceStatus::Started {
                return Err(Error::ValidationFailed(format!(
                    "rebalance on volume {} is already running",
                    name
                )));
            }
        }
        "stop" => {
            if vol.rebal.status != RebalanceStatus::Started {
                return Err(Error::ValidationFailed(format!(
                    "no rebalance running on volume {}",
                    name
                )));
            }
        }
        other => {
            return Err(Error::ValidationFailed(format!(
                "unknown rebalance action: {}",
                other
            )))
        }
    }
    Ok(())
}

pub async fn commit_rebalance(node: &Node, txn_id: Uuid, spec: &OpSpec) -> Result<()> {
    let name = spec.param("name")?;
    let action = spec.param("action")?;

    let vol = {
        let mut state = node.state.write().await;
        let vol = state.volume_mut(name)?;
        match action {
            "start" => {
                // The transaction id doubles as the rebalance task id so
                // later status round trips correlate to this run
                vol.rebal = RebalanceInfo {
                    task_id: Some(txn_id),
                    status: RebalanceStatus::Started,
                    ..RebalanceInfo::default()
                };
            }
            _ => {
                vol.rebal.status = RebalanceStatus::Stopped;
            }
        }
        vol.bump_version();
        vol.clone()
    };
    node.persist_volume(&vol)?;
    tracing::info!(volume = name, action, task = ?vol.rebal.task_id, "rebalance state changed");
    Ok(())
}

// === quota ===

pub async fn stage_quota(node: &Node, spec: &OpSpec) -> Result<()> {
    let name = spec.param("name")?;
    let action = spec.param("action")?;
    let state = node.state.read().await;
    let vol = state.volume(name)?;

    match action {
        "enable" | "disable" => {}
        "limit" | "remove" => {
            spec.param("path")?;
            if action == "limit" {
                spec.param("limit")?;
            }
            let enabled = vol.options.get("features.quota").map(String::as_str) == Some("on");
            if !enabled {
                return Err(Error::ValidationFailed(format!(
                    "quota is not enabled on volume {}",
                    name
                )));
            }
        }
        other => {
            return Err(Error::ValidationFailed(format!(
                "unknown quota action: {}",
                other
            )))
        }
    }
    Ok(())
}

pub async fn commit_quota(node: &Node, spec: &OpSpec) -> Result<()> {
    let name = spec.param("name")?;
    let action = spec.param("action")?;

    let vol = {
        let mut state = node.state.write().await;
        let vol = state.volume_mut(name)?;
        match action {
            "enable" => {
                vol.options.insert("features.quota".into(), "on".into());
                vol.quota_conf_version += 1;
            }
            "disable" => {
                vol.options.insert("features.quota".into(), "off".into());
                vol.options.retain(|k, _| !k.starts_with("features.quota-limit."));
                vol.quota_conf_version += 1;
            }
            "limit" => {
                let path = spec.param("path")?;
                let limit = spec.param("limit")?;
                vol.options
                    .insert(format!("features.quota-limit.{}", path), limit.to_string());
                vol.quota_conf_version += 1;
            }
            _ => {
                let path = spec.param("path")?;
                vol.options.remove(&format!("features.quota-limit.{}", path));
                vol.quota_conf_version += 1;
            }
        }
        vol.bump_version();
        vol.clone()
    };
    node.persist_volume(&vol)?;
    Ok(())
}
