//! Peer management RPC surface
//!
//! The coordinator talks to peers through [`PeerTransport`], which decouples
//! transaction logic from the wire. Two implementations exist: the gRPC
//! transport used between real daemons, and an in-process hub used for
//! single-machine clusters and the integration tests.

pub mod grpc;
pub mod local;

use crate::cluster::handshake::VolumeDiff;
use crate::cluster::volume::{Volume, VolumeSummary};
use crate::common::Result;
use crate::txn::lock::LockResource;
use crate::txn::ops::OpSpec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How the coordinator addresses one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    /// Nil when probing a node whose identity is not yet known
    pub id: Uuid,
    pub hostname: String,
    pub rpc_addr: String,
}

impl PeerEndpoint {
    pub fn probe(rpc_addr: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            id: Uuid::nil(),
            hostname: hostname.into(),
            rpc_addr: rpc_addr.into(),
        }
    }
}

impl From<&crate::cluster::Peer> for PeerEndpoint {
    fn from(peer: &crate::cluster::Peer) -> Self {
        Self {
            id: peer.id,
            hostname: peer.primary_hostname().to_string(),
            rpc_addr: peer.rpc_addr.clone(),
        }
    }
}

/// Requests of the peer RPC surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerRequest {
    Lock {
        resource: LockResource,
        txn_id: Uuid,
        owner: Uuid,
    },
    Unlock {
        resource: LockResource,
        txn_id: Uuid,
    },
    Stage {
        txn_id: Uuid,
        op: OpSpec,
    },
    Commit {
        txn_id: Uuid,
        op: OpSpec,
    },
    Handshake {
        from_id: Uuid,
        from_hostname: String,
        from_addr: String,
        volumes: Vec<VolumeSummary>,
    },
    FetchVolume {
        name: String,
    },
}

impl PeerRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerRequest::Lock { .. } => "lock",
            PeerRequest::Unlock { .. } => "unlock",
            PeerRequest::Stage { .. } => "stage",
            PeerRequest::Commit { .. } => "commit",
            PeerRequest::Handshake { .. } => "handshake",
            PeerRequest::FetchVolume { .. } => "fetch-volume",
        }
    }
}

/// Application-level replies. Transport failures surface as `Err` from
/// [`PeerTransport::call`]; an explicit negative answer is a reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerReply {
    Ok,
    /// Lock refused: the resource is held by `owner`
    Busy { owner: Uuid },
    /// Explicit rejection with a reason (stage/commit failure, unknown
    /// volume, ...)
    Rejected { reason: String },
    Handshake {
        peer_id: Uuid,
        diffs: Vec<VolumeDiff>,
        volumes: Vec<VolumeSummary>,
    },
    Volume(Box<Volume>),
}

#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Human-readable name for logging ("grpc" or "local")
    fn name(&self) -> &str;

    /// Send a request to a peer and await the reply.
    ///
    /// `Err` means the peer could not be reached or did not answer in time;
    /// every application-level outcome, including rejection, is an `Ok`
    /// reply.
    async fn call(&self, target: &PeerEndpoint, request: PeerRequest) -> Result<PeerReply>;
}
