//! Cluster operations: the closed set of transaction kinds
//!
//! Every operation is described by an [`OpSpec`]: a kind plus a flat
//! string-to-string parameter map, which is what travels to peers in the
//! stage and commit phases. Each kind supplies a read-only stage validator
//! and a mutating commit handler over the local metadata; the coordinator
//! never mutates anything outside commit.

pub mod brick;
pub mod peer;
pub mod snapshot;
pub mod volume;

use crate::common::{Error, Result};
use crate::daemon::node::Node;
use crate::txn::lock::LockResource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpKind {
    CreateVolume,
    DeleteVolume,
    StartVolume,
    StopVolume,
    AddBrick,
    RemoveBrick,
    ReplaceBrick,
    SetOption,
    ResetOption,
    Rebalance,
    Quota,
    SnapCreate,
    SnapDelete,
    SnapRestore,
    AttachPeer,
    DetachPeer,
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::CreateVolume => "create-volume",
            OpKind::DeleteVolume => "delete-volume",
            OpKind::StartVolume => "start-volume",
            OpKind::StopVolume => "stop-volume",
            OpKind::AddBrick => "add-brick",
            OpKind::RemoveBrick => "remove-brick",
            OpKind::ReplaceBrick => "replace-brick",
            OpKind::SetOption => "set-option",
            OpKind::ResetOption => "reset-option",
            OpKind::Rebalance => "rebalance",
            OpKind::Quota => "quota",
            OpKind::SnapCreate => "snap-create",
            OpKind::SnapDelete => "snap-delete",
            OpKind::SnapRestore => "snap-restore",
            OpKind::AttachPeer => "attach-peer",
            OpKind::DetachPeer => "detach-peer",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            "create-volume" => OpKind::CreateVolume,
            "delete-volume" => OpKind::DeleteVolume,
            "start-volume" => OpKind::StartVolume,
            "stop-volume" => OpKind::StopVolume,
            "add-brick" => OpKind::AddBrick,
            "remove-brick" => OpKind::RemoveBrick,
            "replace-brick" => OpKind::ReplaceBrick,
            "set-option" => OpKind::SetOption,
            "reset-option" => OpKind::ResetOption,
            "rebalance" => OpKind::Rebalance,
            "quota" => OpKind::Quota,
            "snap-create" => OpKind::SnapCreate,
            "snap-delete" => OpKind::SnapDelete,
            "snap-restore" => OpKind::SnapRestore,
            "attach-peer" => OpKind::AttachPeer,
            "detach-peer" => OpKind::DetachPeer,
            other => return Err(Error::ValidationFailed(format!("unknown operation: {}", other))),
        })
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One operation request: kind plus a flat option dictionary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpSpec {
    pub kind: OpKind,
    pub params: BTreeMap<String, String>,
}

impl OpSpec {
    pub fn new(kind: OpKind) -> Self {
        Self {
            kind,
            params: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Result<&str> {
        self.params
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| Error::ValidationFailed(format!("missing parameter: {}", key)))
    }

    pub fn param_opt(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn param_u32(&self, key: &str, default: u32) -> Result<u32> {
        match self.params.get(key) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|_| {
                Error::ValidationFailed(format!("parameter {} is not a number: {}", key, v))
            }),
        }
    }

    pub fn param_bool(&self, key: &str) -> bool {
        self.param_opt(key)
            .map(|v| crate::common::parse_bool_option(v).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Resource this operation must lock. Peer membership and multi-volume
    /// snapshot operations serialize under the global key.
    pub fn resource(&self) -> Result<LockResource> {
        match self.kind {
            OpKind::AttachPeer
            | OpKind::DetachPeer
            | OpKind::SnapCreate
            | OpKind::SnapDelete
            | OpKind::SnapRestore => Ok(LockResource::Global),
            OpKind::SetOption | OpKind::ResetOption if self.param("name")? == "all" => {
                Ok(LockResource::Global)
            }
            _ => Ok(LockResource::Volume(self.param("name")?.to_string())),
        }
    }

    /// Volume name this operation targets, for quorum evaluation
    pub fn volume_name(&self) -> Option<&str> {
        match self.kind {
            OpKind::AttachPeer | OpKind::DetachPeer => None,
            _ => self.param_opt("name").filter(|n| *n != "all"),
        }
    }
}

/// Pin initiator-chosen identities into the payload before the transaction
/// starts. Every peer's commit must produce byte-identical metadata, so
/// ids and timestamps are decided once here, never per node.
pub fn prepare(spec: &mut OpSpec) {
    match spec.kind {
        OpKind::CreateVolume => {
            spec.params
                .entry("volume-id".to_string())
                .or_insert_with(|| Uuid::new_v4().to_string());
        }
        OpKind::SnapCreate => {
            spec.params
                .entry("snap-id".to_string())
                .or_insert_with(|| Uuid::new_v4().to_string());
            spec.params
                .entry("timestamp".to_string())
                .or_insert_with(|| crate::common::timestamp_now().to_string());
            if let Some(volumes) = spec.param_opt("volumes").map(str::to_string) {
                for name in volumes.split(',').filter(|v| !v.is_empty()) {
                    spec.params
                        .entry(format!("snap-vol-id.{}", name))
                        .or_insert_with(|| Uuid::new_v4().to_string());
                }
            }
        }
        _ => {}
    }
}

/// Parse a brick list parameter: `peer-uuid:/path` entries, comma separated
pub fn parse_brick_list(value: &str) -> Result<Vec<(Uuid, String)>> {
    let mut bricks = Vec::new();
    for entry in value.split(',').filter(|e| !e.is_empty()) {
        let (peer, path) = entry.split_once(':').ok_or_else(|| {
            Error::ValidationFailed(format!("malformed brick '{}', expected peer-uuid:/path", entry))
        })?;
        let peer: Uuid = peer.parse().map_err(|_| {
            Error::ValidationFailed(format!("malformed peer id in brick '{}'", entry))
        })?;
        if !path.starts_with('/') {
            return Err(Error::ValidationFailed(format!(
                "brick path must be absolute: {}",
                path
            )));
        }
        bricks.push((peer, path.to_string()));
    }
    if bricks.is_empty() {
        return Err(Error::ValidationFailed("empty brick list".into()));
    }
    Ok(bricks)
}

/// Stage: run the operation's read-only validator against local metadata
pub async fn stage(node: &Node, spec: &OpSpec) -> Result<()> {
    tracing::debug!(op = %spec.kind, "staging");
    match spec.kind {
        OpKind::CreateVolume => volume::stage_create(node, spec).await,
        OpKind::DeleteVolume => volume::stage_delete(node, spec).await,
        OpKind::StartVolume => volume::stage_start(node, spec).await,
        OpKind::StopVolume => volume::stage_stop(node, spec).await,
        OpKind::SetOption => volume::stage_set_option(node, spec).await,
        OpKind::ResetOption => volume::stage_reset_option(node, spec).await,
        OpKind::Rebalance => volume::stage_rebalance(node, spec).await,
        OpKind::Quota => volume::stage_quota(node, spec).await,
        OpKind::AddBrick => brick::stage_add(node, spec).await,
        OpKind::RemoveBrick => brick::stage_remove(node, spec).await,
        OpKind::ReplaceBrick => brick::stage_replace(node, spec).await,
        OpKind::SnapCreate => snapshot::stage_create(node, spec).await,
        OpKind::SnapDelete => snapshot::stage_delete(node, spec).await,
        OpKind::SnapRestore => snapshot::stage_restore(node, spec).await,
        OpKind::AttachPeer => peer::stage_attach(node, spec).await,
        OpKind::DetachPeer => peer::stage_detach(node, spec).await,
    }
}

/// Commit: apply the operation's mutation to local metadata (and the brick
/// supervisor where relevant). Callers guard idempotence via the
/// per-transaction ledger before invoking this.
pub async fn commit(node: &Node, txn_id: Uuid, spec: &OpSpec) -> Result<()> {
    tracing::debug!(op = %spec.kind, %txn_id, "committing");
    match spec.kind {
        OpKind::CreateVolume => volume::commit_create(node, spec).await,
        OpKind::DeleteVolume => volume::commit_delete(node, spec).await,
        OpKind::StartVolume => volume::commit_start(node, spec).await,
        OpKind::StopVolume => volume::commit_stop(node, spec).await,
        OpKind::SetOption => volume::commit_set_option(node, spec).await,
        OpKind::ResetOption => volume::commit_reset_option(node, spec).await,
        OpKind::Rebalance => volume::commit_rebalance(node, txn_id, spec).await,
        OpKind::Quota => volume::commit_quota(node, spec).await,
        OpKind::AddBrick => brick::commit_add(node, spec).await,
        OpKind::RemoveBrick => brick::commit_remove(node, spec).await,
        OpKind::ReplaceBrick => brick::commit_replace(node, spec).await,
        OpKind::SnapCreate => snapshot::commit_create(node, spec).await,
        OpKind::SnapDelete => snapshot::commit_delete(node, spec).await,
        OpKind::SnapRestore => snapshot::commit_restore(node, spec).await,
        OpKind::AttachPeer => peer::commit_attach(node, spec).await,
        OpKind::DetachPeer => peer::commit_detach(node, spec).await,
    }
}

/// Compensating operation fanned to peers whose commit succeeded when a
/// later peer's commit fails. Only operations whose mutation starts brick
/// workers declare one; everything else is reconciled through the next
/// handshake.
pub fn compensation(spec: &OpSpec) -> Option<OpSpec> {
    match spec.kind {
        OpKind::StartVolume => {
            let name = spec.param_opt("name")?;
            Some(
                OpSpec::new(OpKind::StopVolume)
                    .with("name", name)
                    .with("force", "true"),
            )
        }
        OpKind::AddBrick => {
            let name = spec.param_opt("name")?;
            let bricks = spec.param_opt("bricks")?;
            Some(
                OpSpec::new(OpKind::RemoveBrick)
                    .with("name", name)
                    .with("bricks", bricks)
                    .with("force", "true"),
            )
        }
        _ => None,
    }
}
