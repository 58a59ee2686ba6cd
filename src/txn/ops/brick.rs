//! Brick membership operations: add, remove, replace

use crate::cluster::volume::{Brick, BrickStatus};
use crate::common::{Error, Result};
use crate::daemon::node::Node;
use crate::txn::ops::volume::{stop_local_bricks, validate_new_brick};
use crate::txn::ops::{parse_brick_list, OpSpec};
use uuid::Uuid;

fn parse_single_brick(value: &str) -> Result<(Uuid, String)> {
    let mut list = parse_brick_list(value)?;
    if list.len() != 1 {
        return Err(Error::ValidationFailed(format!(
            "expected a single brick, got {}",
            list.len()
        )));
    }
    Ok(list.remove(0))
}

// === add-brick ===

pub async fn stage_add(node: &Node, spec: &OpSpec) -> Result<()> {
    let name = spec.param("name")?;
    let bricks = parse_brick_list(spec.param("bricks")?)?;
    let state = node.state.read().await;
    let vol = state.volume(name)?;

    let replica = spec.param_u32("replica", vol.replica_count)?;
    let leaf = if vol.disperse_count > 0 {
        vol.disperse_count
    } else {
        replica.max(1)
    };
    let total = vol.brick_count() as usize + bricks.len();
    if total as u32 % leaf != 0 {
        return Err(Error::ValidationFailed(format!(
            "resulting brick count {} is not a multiple of {}",
            total, leaf
        )));
    }

    for (peer, path) in &bricks {
        validate_new_brick(&state, node.id, peer, path)?;
    }
    Ok(())
}

pub async fn commit_add(node: &Node, spec: &OpSpec) -> Result<()> {
    let name = spec.param("name")?;
    let new_bricks = parse_brick_list(spec.param("bricks")?)?;

    // Assign ordinals against a simulated copy so the worker starts below
    // use final brick ids; the resource lock keeps the real volume stable
    // meanwhile.
    let (planned, started_volume, replica) = {
        let state = node.state.read().await;
        let vol = state.volume(name)?;
        let replica = spec.param_u32("replica", vol.replica_count)?;
        let mut sim = vol.clone();
        let mut planned = Vec::new();
        for (peer, path) in &new_bricks {
            let ordinal = sim.next_brick_ordinal();
            let brick = Brick::new(name, ordinal, *peer, path.clone());
            sim.add_brick(brick.clone())?;
            planned.push(brick);
        }
        (planned, vol.is_started(), replica)
    };

    // Start local workers for the new bricks before touching the real
    // metadata; a launch failure leaves the model unmutated.
    let mut started: Vec<(String, u16)> = Vec::new();
    if started_volume {
        for brick in planned.iter().filter(|b| b.peer_id == node.id) {
            let spec = crate::brick::BrickSpec {
                volume: name.to_string(),
                brick_id: brick.brick_id.clone(),
                path: brick.path.clone(),
            };
            match node.supervisor.start(&spec).await {
                Ok(port) => started.push((brick.brick_id.clone(), port)),
                Err(e) => {
                    for (brick_id, _) in &started {
                        let stop_spec = crate::brick::BrickSpec {
                            volume: name.to_string(),
                            brick_id: brick_id.clone(),
                            path: String::new(),
                        };
                        let _ = node.supervisor.stop(&stop_spec, true).await;
                    }
                    return Err(e);
                }
            }
        }
    }

    let vol = {
        let mut state = node.state.write().await;
        let vol = state.volume_mut(name)?;
        vol.replica_count = replica.max(1);
        for mut brick in planned {
            if let Some((_, port)) = started.iter().find(|(id, _)| *id == brick.brick_id) {
                brick.status = BrickStatus::Started;
                brick.port = Some(*port);
            }
            vol.add_brick(brick)?;
        }
        vol.recompute_topology()?;
        vol.bump_version();
        let vol = vol.clone();
        for brick in &vol.bricks {
            state.peers.reference_volume(&brick.peer_id, name);
        }
        vol
    };
    node.persist_volume(&vol)?;
    tracing::info!(volume = name, bricks = vol.brick_count(), version = vol.version, "bricks added");
    Ok(())
}

// === remove-brick ===

pub async fn stage_remove(node: &Node, spec: &OpSpec) -> Result<()> {
    let name = spec.param("name")?;
    let bricks = parse_brick_list(spec.param("bricks")?)?;
    let state = node.state.read().await;
    let vol = state.volume(name)?;

    for (peer, path) in &bricks {
        if vol.find_brick(peer, path).is_none() {
            return Err(Error::ValidationFailed(format!(
                "brick {}:{} is not part of volume {}",
                peer, path, name
            )));
        }
    }

    let replica = spec.param_u32("replica", vol.replica_count)?;
    let leaf = if vol.disperse_count > 0 {
        vol.disperse_count
    } else {
        replica.max(1)
    };
    let remaining = vol.brick_count() as usize - bricks.len();
    if remaining == 0 {
        return Err(Error::ValidationFailed(
            "removing every brick would destroy the volume, use delete-volume".into(),
        ));
    }
    if remaining as u32 % leaf != 0 {
        return Err(Error::ValidationFailed(format!(
            "remaining brick count {} is not a multiple of {}",
            remaining, leaf
        )));
    }
    Ok(())
}

pub async fn commit_remove(node: &Node, spec: &OpSpec) -> Result<()> {
    let name = spec.param("name")?;
    let bricks = parse_brick_list(spec.param("bricks")?)?;

    stop_local_bricks(node, name, Some(&bricks), true).await?;

    let (vol, freed_peers) = {
        let mut state = node.state.write().await;
        let replica = {
            let vol = state.volume(name)?;
            spec.param_u32("replica", vol.replica_count)?
        };
        let vol = state.volume_mut(name)?;
        let mut removed = Vec::new();
        for (peer, path) in &bricks {
            removed.push(vol.remove_brick(peer, path)?);
        }
        vol.replica_count = replica.max(1);
        vol.recompute_topology()?;
        vol.bump_version();
        let snapshot = vol.clone();

        // Drop peer back-references for hosts that no longer hold a brick
        let mut freed = Vec::new();
        for brick in &removed {
            if !snapshot.bricks.iter().any(|b| b.peer_id == brick.peer_id) {
                freed.push(brick.peer_id);
            }
        }
        for peer in &freed {
            state.peers.unreference_volume(peer, name);
        }
        (snapshot, freed)
    };
    node.persist_volume(&vol)?;
    tracing::info!(
        volume = name,
        bricks = vol.brick_count(),
        version = vol.version,
        freed_hosts = freed_peers.len(),
        "bricks removed"
    );
    Ok(())
}

// === replace-brick ===

pub async fn stage_replace(node: &Node, spec: &OpSpec) -> Result<()> {
    let name = spec.param("name")?;
    let (src_peer, src_path) = parse_single_brick(spec.param("src")?)?;
    let (dst_peer, dst_path) = parse_single_brick(spec.param("dst")?)?;

    let state = node.state.read().await;
    let vol = state.volume(name)?;
    if !vol.is_replicated() {
        return Err(Error::ValidationFailed(format!(
            "volume {} is not replicated, replace-brick would lose data",
            name
        )));
    }
    if vol.find_brick(&src_peer, &src_path).is_none() {
        return Err(Error::ValidationFailed(format!(
            "source brick {}:{} is not part of volume {}",
            src_peer, src_path, name
        )));
    }
    validate_new_brick(&state, node.id, &dst_peer, &dst_path)?;
    Ok(())
}

pub async fn commit_replace(node: &Node, spec: &OpSpec) -> Result<()> {
    let name = spec.param("name")?;
    let (src_peer, src_path) = parse_single_brick(spec.param("src")?)?;
    let (dst_peer, dst_path) = parse_single_brick(spec.param("dst")?)?;

    let (ordinal, group, started_volume) = {
        let state = node.state.read().await;
        let vol = state.volume(name)?;
        let src = vol.find_brick(&src_peer, &src_path).ok_or_else(|| {
            Error::NotFound(format!("brick {}:{} in volume {}", src_peer, src_path, name))
        })?;
        (src.ordinal, src.group, vol.is_started())
    };

    stop_local_bricks(node, name, Some(&[(src_peer, src_path.clone())]), true).await?;

    let mut dst = Brick::new(name, ordinal, dst_peer, dst_path.clone());
    dst.group = group;

    if started_volume && dst_peer == node.id {
        let spec = crate::brick::BrickSpec {
            volume: name.to_string(),
            brick_id: dst.brick_id.clone(),
            path: dst.path.clone(),
        };
        let port = node.supervisor.start(&spec).await?;
        dst.status = BrickStatus::Started;
        dst.port = Some(port);
    }

    let vol = {
        let mut state = node.state.write().await;
        let vol = state.volume_mut(name)?;
        vol.remove_brick(&src_peer, &src_path)?;
        vol.add_brick(dst)?;
        vol.bump_version();
        let snapshot = vol.clone();
        if !snapshot.bricks.iter().any(|b| b.peer_id == src_peer) {
            state.peers.unreference_volume(&src_peer, name);
        }
        state.peers.reference_volume(&dst_peer, name);
        snapshot
    };
    node.persist_volume(&vol)?;
    tracing::info!(volume = name, version = vol.version, "brick replaced");
    Ok(())
}
