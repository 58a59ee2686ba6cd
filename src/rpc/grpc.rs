//! gRPC transport: the wire used between real daemons
//!
//! Maps the typed [`PeerRequest`]/[`PeerReply`] messages onto the protobuf
//! surface in `proto/volmand.proto`. The client side implements
//! [`PeerTransport`]; the server side wraps a [`Node`] into a tonic
//! service.

use crate::cluster::handshake::{DivergenceOutcome, VolumeDiff};
use crate::cluster::volume::{Volume, VolumeSummary};
use crate::common::{Error, Result};
use crate::daemon::node::Node;
use crate::proto;
use crate::proto::peer_mgmt_client::PeerMgmtClient;
use crate::proto::peer_mgmt_server::{PeerMgmt, PeerMgmtServer};
use crate::rpc::{PeerEndpoint, PeerReply, PeerRequest, PeerTransport};
use crate::txn::lock::LockResource;
use crate::txn::ops::{OpKind, OpSpec};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};
use uuid::Uuid;

// === Wire conversions ===

fn resource_to_wire(resource: &LockResource) -> String {
    resource.to_string()
}

fn resource_from_wire(raw: &str) -> Result<LockResource> {
    if raw == "global" {
        Ok(LockResource::Global)
    } else if let Some(name) = raw.strip_prefix("volume/") {
        Ok(LockResource::Volume(name.to_string()))
    } else {
        Err(Error::Internal(format!("malformed lock resource: {}", raw)))
    }
}

fn uuid_from_wire(raw: &str) -> Result<Uuid> {
    raw.parse()
        .map_err(|_| Error::Internal(format!("malformed uuid on the wire: {}", raw)))
}

fn outcome_to_wire(outcome: DivergenceOutcome) -> &'static str {
    match outcome {
        DivergenceOutcome::Identical => "identical",
        DivergenceOutcome::NeedsUpdate => "needs_update",
        DivergenceOutcome::Conflict => "conflict",
        DivergenceOutcome::AbsentLocally => "absent_locally",
        DivergenceOutcome::AbsentRemotely => "absent_remotely",
    }
}

fn outcome_from_wire(raw: &str) -> Result<DivergenceOutcome> {
    Ok(match raw {
        "identical" => DivergenceOutcome::Identical,
        "needs_update" => DivergenceOutcome::NeedsUpdate,
        "conflict" => DivergenceOutcome::Conflict,
        "absent_locally" => DivergenceOutcome::AbsentLocally,
        "absent_remotely" => DivergenceOutcome::AbsentRemotely,
        other => {
            return Err(Error::Internal(format!(
                "unknown divergence outcome on the wire: {}",
                other
            )))
        }
    })
}

fn summary_to_wire(summary: &VolumeSummary) -> proto::VolumeSummary {
    proto::VolumeSummary {
        name: summary.name.clone(),
        version: summary.version,
        checksum: summary.checksum,
    }
}

fn summary_from_wire(msg: proto::VolumeSummary) -> VolumeSummary {
    VolumeSummary {
        name: msg.name,
        version: msg.version,
        checksum: msg.checksum,
    }
}

fn generic_to_reply(msg: proto::GenericReply) -> Result<PeerReply> {
    match proto::ReplyStatus::try_from(msg.status) {
        Ok(proto::ReplyStatus::Ok) => Ok(PeerReply::Ok),
        Ok(proto::ReplyStatus::Busy) => Ok(PeerReply::Busy {
            owner: uuid_from_wire(&msg.owner)?,
        }),
        Ok(proto::ReplyStatus::Rejected) => Ok(PeerReply::Rejected { reason: msg.reason }),
        Err(_) => Err(Error::Internal(format!(
            "unknown reply status on the wire: {}",
            msg.status
        ))),
    }
}

fn reply_to_generic(reply: PeerReply) -> proto::GenericReply {
    match reply {
        PeerReply::Ok => proto::GenericReply {
            status: proto::ReplyStatus::Ok as i32,
            owner: String::new(),
            reason: String::new(),
        },
        PeerReply::Busy { owner } => proto::GenericReply {
            status: proto::ReplyStatus::Busy as i32,
            owner: owner.to_string(),
            reason: String::new(),
        },
        PeerReply::Rejected { reason } => proto::GenericReply {
            status: proto::ReplyStatus::Rejected as i32,
            owner: String::new(),
            reason,
        },
        other => proto::GenericReply {
            status: proto::ReplyStatus::Rejected as i32,
            owner: String::new(),
            reason: format!("unexpected reply for this call: {:?}", other),
        },
    }
}

fn status_to_error(endpoint: &PeerEndpoint, status: Status) -> Error {
    match status.code() {
        tonic::Code::Unavailable | tonic::Code::DeadlineExceeded | tonic::Code::Cancelled => {
            Error::PeerUnreachable(endpoint.hostname.clone())
        }
        _ => Error::PeerRejected {
            peer: endpoint.hostname.clone(),
            reason: status.message().to_string(),
        },
    }
}

// === Client side ===

pub struct GrpcTransport {
    clients: tokio::sync::Mutex<HashMap<String, PeerMgmtClient<Channel>>>,
}

impl GrpcTransport {
    pub fn new() -> Self {
        Self {
            clients: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, endpoint: &PeerEndpoint) -> Result<PeerMgmtClient<Channel>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&endpoint.rpc_addr) {
            return Ok(client.clone());
        }
        let client = PeerMgmtClient::connect(endpoint.rpc_addr.clone())
            .await
            .map_err(|e| Error::PeerUnreachable(format!("{}: {}", endpoint.hostname, e)))?;
        clients.insert(endpoint.rpc_addr.clone(), client.clone());
        Ok(client)
    }

    async fn drop_client(&self, endpoint: &PeerEndpoint) {
        self.clients.lock().await.remove(&endpoint.rpc_addr);
    }
}

impl Default for GrpcTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerTransport for GrpcTransport {
    fn name(&self) -> &str {
        "grpc"
    }

    async fn call(&self, target: &PeerEndpoint, request: PeerRequest) -> Result<PeerReply> {
        let mut client = self.client(target).await?;

        let result = match request {
            PeerRequest::Lock {
                resource,
                txn_id,
                owner,
            } => client
                .lock(Request::new(proto::LockRequest {
                    resource: resource_to_wire(&resource),
                    txn_id: txn_id.to_string(),
                    owner: owner.to_string(),
                }))
                .await
                .map(|r| generic_to_reply(r.into_inner()))
                .map_err(|s| status_to_error(target, s)),
            PeerRequest::Unlock { resource, txn_id } => client
                .unlock(Request::new(proto::UnlockRequest {
                    resource: resource_to_wire(&resource),
                    txn_id: txn_id.to_string(),
                }))
                .await
                .map(|r| generic_to_reply(r.into_inner()))
                .map_err(|s| status_to_error(target, s)),
            PeerRequest::Stage { txn_id, op } => client
                .stage(Request::new(proto::PhaseRequest {
                    txn_id: txn_id.to_string(),
                    op_kind: op.kind.name().to_string(),
                    params: op.params.into_iter().collect(),
                }))
                .await
                .map(|r| generic_to_reply(r.into_inner()))
                .map_err(|s| status_to_error(target, s)),
            PeerRequest::Commit { txn_id, op } => client
                .commit(Request::new(proto::PhaseRequest {
                    txn_id: txn_id.to_string(),
                    op_kind: op.kind.name().to_string(),
                    params: op.params.into_iter().collect(),
                }))
                .await
                .map(|r| generic_to_reply(r.into_inner()))
                .map_err(|s| status_to_error(target, s)),
            PeerRequest::Handshake {
                from_id,
                from_hostname,
                from_addr,
                volumes,
            } => client
                .handshake(Request::new(proto::HandshakeRequest {
                    from_id: from_id.to_string(),
                    from_hostname,
                    from_addr,
                    volumes: volumes.iter().map(summary_to_wire).collect(),
                }))
                .await
                .map(|r| {
                    let msg = r.into_inner();
                    let diffs = msg
                        .diffs
                        .into_iter()
                        .map(|d| {
                            Ok(VolumeDiff {
                                name: d.name,
                                outcome: outcome_from_wire(&d.outcome)?,
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    Ok(PeerReply::Handshake {
                        peer_id: uuid_from_wire(&msg.peer_id)?,
                        diffs,
                        volumes: msg.volumes.into_iter().map(summary_from_wire).collect(),
                    })
                })
                .map_err(|s| status_to_error(target, s)),
            PeerRequest::FetchVolume { name } => client
                .fetch_volume(Request::new(proto::FetchVolumeRequest { name }))
                .await
                .map(|r| {
                    let msg = r.into_inner();
                    if !msg.found {
                        return Ok(PeerReply::Rejected {
                            reason: "volume not found".to_string(),
                        });
                    }
                    let volume: Volume = bincode::deserialize(&msg.volume)
                        .map_err(|e| Error::MetadataCorrupted(e.to_string()))?;
                    Ok(PeerReply::Volume(Box::new(volume)))
                })
                .map_err(|s| status_to_error(target, s)),
        };

        match result {
            Ok(reply) => reply,
            Err(e) => {
                // A dead channel stays dead; reconnect on the next call
                if matches!(e, Error::PeerUnreachable(_)) {
                    self.drop_client(target).await;
                }
                Err(e)
            }
        }
    }
}

// === Server side ===

pub struct PeerMgmtService {
    node: Arc<Node>,
}

impl PeerMgmtService {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    pub fn into_server(self) -> PeerMgmtServer<Self> {
        PeerMgmtServer::new(self)
    }
}

fn phase_request_to_op(msg: proto::PhaseRequest) -> std::result::Result<(Uuid, OpSpec), Status> {
    let txn_id = uuid_from_wire(&msg.txn_id).map_err(|e| Status::invalid_argument(e.to_string()))?;
    let kind = OpKind::from_name(&msg.op_kind)
        .map_err(|e| Status::invalid_argument(e.to_string()))?;
    Ok((
        txn_id,
        OpSpec {
            kind,
            params: msg.params.into_iter().collect(),
        },
    ))
}

#[tonic::async_trait]
impl PeerMgmt for PeerMgmtService {
    async fn lock(
        &self,
        request: Request<proto::LockRequest>,
    ) -> std::result::Result<Response<proto::GenericReply>, Status> {
        let msg = request.into_inner();
        let req = PeerRequest::Lock {
            resource: resource_from_wire(&msg.resource)
                .map_err(|e| Status::invalid_argument(e.to_string()))?,
            txn_id: uuid_from_wire(&msg.txn_id)
                .map_err(|e| Status::invalid_argument(e.to_string()))?,
            owner: uuid_from_wire(&msg.owner)
                .map_err(|e| Status::invalid_argument(e.to_string()))?,
        };
        let reply = self.node.handle_peer_request(req).await;
        Ok(Response::new(reply_to_generic(reply)))
    }

    async fn unlock(
        &self,
        request: Request<proto::UnlockRequest>,
    ) -> std::result::Result<Response<proto::GenericReply>, Status> {
        let msg = request.into_inner();
        let req = PeerRequest::Unlock {
            resource: resource_from_wire(&msg.resource)
                .map_err(|e| Status::invalid_argument(e.to_string()))?,
            txn_id: uuid_from_wire(&msg.txn_id)
                .map_err(|e| Status::invalid_argument(e.to_string()))?,
        };
        let reply = self.node.handle_peer_request(req).await;
        Ok(Response::new(reply_to_generic(reply)))
    }

    async fn stage(
        &self,
        request: Request<proto::PhaseRequest>,
    ) -> std::result::Result<Response<proto::GenericReply>, Status> {
        let (txn_id, op) = phase_request_to_op(request.into_inner())?;
        let reply = self
            .node
            .handle_peer_request(PeerRequest::Stage { txn_id, op })
            .await;
        Ok(Response::new(reply_to_generic(reply)))
    }

    async fn commit(
        &self,
        request: Request<proto::PhaseRequest>,
    ) -> std::result::Result<Response<proto::GenericReply>, Status> {
        let (txn_id, op) = phase_request_to_op(request.into_inner())?;
        let reply = self
            .node
            .handle_peer_request(PeerRequest::Commit { txn_id, op })
            .await;
        Ok(Response::new(reply_to_generic(reply)))
    }

    async fn handshake(
        &self,
        request: Request<proto::HandshakeRequest>,
    ) -> std::result::Result<Response<proto::HandshakeReply>, Status> {
        let msg = request.into_inner();
        let req = PeerRequest::Handshake {
            from_id: uuid_from_wire(&msg.from_id)
                .map_err(|e| Status::invalid_argument(e.to_string()))?,
            from_hostname: msg.from_hostname,
            from_addr: msg.from_addr,
            volumes: msg.volumes.into_iter().map(summary_from_wire).collect(),
        };
        match self.node.handle_peer_request(req).await {
            PeerReply::Handshake {
                peer_id,
                diffs,
                volumes,
            } => Ok(Response::new(proto::HandshakeReply {
                peer_id: peer_id.to_string(),
                diffs: diffs
                    .into_iter()
                    .map(|d| proto::VolumeDiff {
                        name: d.name,
                        outcome: outcome_to_wire(d.outcome).to_string(),
                    })
                    .collect(),
                volumes: volumes.iter().map(summary_to_wire).collect(),
            })),
            other => Err(Status::internal(format!(
                "unexpected handshake reply: {:?}",
                other
            ))),
        }
    }

    async fn fetch_volume(
        &self,
        request: Request<proto::FetchVolumeRequest>,
    ) -> std::result::Result<Response<proto::FetchVolumeReply>, Status> {
        let msg = request.into_inner();
        match self
            .node
            .handle_peer_request(PeerRequest::FetchVolume { name: msg.name })
            .await
        {
            PeerReply::Volume(volume) => {
                let bytes = bincode::serialize(volume.as_ref())
                    .map_err(|e| Status::internal(e.to_string()))?;
                Ok(Response::new(proto::FetchVolumeReply {
                    found: true,
                    volume: bytes,
                }))
            }
            PeerReply::Rejected { .. } => Ok(Response::new(proto::FetchVolumeReply {
                found: false,
                volume: Vec::new(),
            })),
            other => Err(Status::internal(format!(
                "unexpected fetch reply: {:?}",
                other
            ))),
        }
    }
}
