//! Admin HTTP API
//!
//! Thin JSON layer over the transaction coordinator: every mutating route
//! builds an [`OpSpec`] and runs it through the full lock/stage/commit
//! protocol; read routes serve the local metadata directly.

use crate::daemon::node::Node;
use crate::rpc::PeerEndpoint;
use crate::txn::coordinator::{OpOutcome, TxnCoordinator};
use crate::txn::ops::{OpKind, OpSpec};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub node: Arc<Node>,
    pub coordinator: Arc<TxnCoordinator>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/status", get(status))
        .route("/v1/volumes", get(list_volumes).post(create_volume))
        .route("/v1/volumes/:name", get(get_volume).delete(delete_volume))
        .route("/v1/volumes/:name/start", post(start_volume))
        .route("/v1/volumes/:name/stop", post(stop_volume))
        .route("/v1/volumes/:name/bricks", post(add_bricks).delete(remove_bricks))
        .route("/v1/volumes/:name/replace-brick", post(replace_brick))
        .route("/v1/volumes/:name/options", put(set_option))
        .route("/v1/volumes/:name/options/:key", delete(reset_option))
        .route("/v1/volumes/:name/rebalance", post(rebalance))
        .route("/v1/volumes/:name/quota", post(quota))
        .route("/v1/peers", get(list_peers).post(attach_peer))
        .route("/v1/peers/:id", delete(detach_peer))
        .route("/v1/snapshots", get(list_snapshots).post(create_snapshot))
        .route("/v1/snapshots/:name", delete(delete_snapshot))
        .route("/v1/snapshots/:name/restore", post(restore_snapshot))
        .route("/v1/conflicts", get(list_conflicts))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

fn op_response(outcome: OpOutcome) -> impl IntoResponse {
    let code = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    (code, Json(outcome))
}

#[derive(Deserialize)]
struct BrickBody {
    peer_id: Uuid,
    path: String,
}

fn bricks_param(bricks: &[BrickBody]) -> String {
    bricks
        .iter()
        .map(|b| format!("{}:{}", b.peer_id, b.path))
        .collect::<Vec<_>>()
        .join(",")
}

// === Read routes ===

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let cluster = state.node.state.read().await;
    let (active, total) = cluster.quorum_counts();
    Json(json!({
        "node_id": state.node.id,
        "hostname": state.node.hostname,
        "version": crate::VERSION,
        "peers": cluster.peers.len(),
        "active_members": active,
        "total_members": total,
        "volumes": cluster.volumes.len(),
        "snapshots": cluster.snapshots.len(),
    }))
}

async fn list_volumes(State(state): State<AppState>) -> impl IntoResponse {
    let cluster = state.node.state.read().await;
    Json(cluster.volumes.values().cloned().collect::<Vec<_>>())
}

async fn get_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let cluster = state.node.state.read().await;
    match cluster.volume(&name) {
        Ok(vol) => (StatusCode::OK, Json(json!(vol))),
        Err(e) => (e.to_http_status(), Json(json!({ "error": e.to_string() }))),
    }
}

async fn list_peers(State(state): State<AppState>) -> impl IntoResponse {
    let cluster = state.node.state.read().await;
    Json(cluster.peers.iter().cloned().collect::<Vec<_>>())
}

async fn list_snapshots(State(state): State<AppState>) -> impl IntoResponse {
    let cluster = state.node.state.read().await;
    Json(cluster.snapshots.values().cloned().collect::<Vec<_>>())
}

async fn list_conflicts(State(state): State<AppState>) -> impl IntoResponse {
    let cluster = state.node.state.read().await;
    Json(cluster.conflicts.values().cloned().collect::<Vec<_>>())
}

// === Volume operations ===

#[derive(Deserialize)]
struct CreateVolumeBody {
    name: String,
    bricks: Vec<BrickBody>,
    replica: Option<u32>,
    arbiter: Option<u32>,
    disperse: Option<u32>,
    redundancy: Option<u32>,
    snap_backend: Option<String>,
}

async fn create_volume(
    State(state): State<AppState>,
    Json(body): Json<CreateVolumeBody>,
) -> impl IntoResponse {
    let mut spec = OpSpec::new(OpKind::CreateVolume)
        .with("name", &body.name)
        .with("bricks", bricks_param(&body.bricks));
    if let Some(replica) = body.replica {
        spec = spec.with("replica", replica.to_string());
    }
    if let Some(arbiter) = body.arbiter {
        spec = spec.with("arbiter", arbiter.to_string());
    }
    if let Some(disperse) = body.disperse {
        spec = spec.with("disperse", disperse.to_string());
    }
    if let Some(redundancy) = body.redundancy {
        spec = spec.with("redundancy", redundancy.to_string());
    }
    if let Some(backend) = body.snap_backend {
        spec = spec.with("snap-backend", backend);
    }
    op_response(state.coordinator.execute(spec).await)
}

async fn delete_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let spec = OpSpec::new(OpKind::DeleteVolume).with("name", name);
    op_response(state.coordinator.execute(spec).await)
}

#[derive(Deserialize, Default)]
struct ForceBody {
    #[serde(default)]
    force: bool,
}

async fn start_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<ForceBody>>,
) -> impl IntoResponse {
    let force = body.map(|b| b.force).unwrap_or(false);
    let mut spec = OpSpec::new(OpKind::StartVolume).with("name", name);
    if force {
        spec = spec.with("force", "true");
    }
    op_response(state.coordinator.execute(spec).await)
}

async fn stop_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<ForceBody>>,
) -> impl IntoResponse {
    let force = body.map(|b| b.force).unwrap_or(false);
    let mut spec = OpSpec::new(OpKind::StopVolume).with("name", name);
    if force {
        spec = spec.with("force", "true");
    }
    op_response(state.coordinator.execute(spec).await)
}

#[derive(Deserialize)]
struct BrickChangeBody {
    bricks: Vec<BrickBody>,
    replica: Option<u32>,
}

async fn add_bricks(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<BrickChangeBody>,
) -> impl IntoResponse {
    let mut spec = OpSpec::new(OpKind::AddBrick)
        .with("name", name)
        .with("bricks", bricks_param(&body.bricks));
    if let Some(replica) = body.replica {
        spec = spec.with("replica", replica.to_string());
    }
    op_response(state.coordinator.execute(spec).await)
}

async fn remove_bricks(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<BrickChangeBody>,
) -> impl IntoResponse {
    let mut spec = OpSpec::new(OpKind::RemoveBrick)
        .with("name", name)
        .with("bricks", bricks_param(&body.bricks));
    if let Some(replica) = body.replica {
        spec = spec.with("replica", replica.to_string());
    }
    op_response(state.coordinator.execute(spec).await)
}

#[derive(Deserialize)]
struct ReplaceBrickBody {
    src: BrickBody,
    dst: BrickBody,
}

async fn replace_brick(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<ReplaceBrickBody>,
) -> impl IntoResponse {
    let spec = OpSpec::new(OpKind::ReplaceBrick)
        .with("name", name)
        .with("src", format!("{}:{}", body.src.peer_id, body.src.path))
        .with("dst", format!("{}:{}", body.dst.peer_id, body.dst.path));
    op_response(state.coordinator.execute(spec).await)
}

#[derive(Deserialize)]
struct OptionBody {
    key: String,
    value: String,
}

async fn set_option(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<OptionBody>,
) -> impl IntoResponse {
    let spec = OpSpec::new(OpKind::SetOption)
        .with("name", name)
        .with("key", body.key)
        .with("value", body.value);
    op_response(state.coordinator.execute(spec).await)
}

async fn reset_option(
    State(state): State<AppState>,
    Path((name, key)): Path<(String, String)>,
) -> impl IntoResponse {
    let spec = OpSpec::new(OpKind::ResetOption)
        .with("name", name)
        .with("key", key);
    op_response(state.coordinator.execute(spec).await)
}

#[derive(Deserialize)]
struct RebalanceBody {
    action: String,
}

async fn rebalance(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<RebalanceBody>,
) -> impl IntoResponse {
    let spec = OpSpec::new(OpKind::Rebalance)
        .with("name", name)
        .with("action", body.action);
    op_response(state.coordinator.execute(spec).await)
}

#[derive(Deserialize)]
struct QuotaBody {
    action: String,
    path: Option<String>,
    limit: Option<String>,
}

async fn quota(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<QuotaBody>,
) -> impl IntoResponse {
    let mut spec = OpSpec::new(OpKind::Quota)
        .with("name", name)
        .with("action", body.action);
    if let Some(path) = body.path {
        spec = spec.with("path", path);
    }
    if let Some(limit) = body.limit {
        spec = spec.with("limit", limit);
    }
    op_response(state.coordinator.execute(spec).await)
}

// === Peer membership ===

#[derive(Deserialize)]
struct AttachPeerBody {
    hostname: String,
    rpc_addr: String,
}

async fn attach_peer(
    State(state): State<AppState>,
    Json(body): Json<AttachPeerBody>,
) -> axum::response::Response {
    // Learn the candidate's identity before the membership transaction
    let peer_id = match state.node.probe(&body.rpc_addr, &body.hostname).await {
        Ok(id) => id,
        Err(e) => {
            return (e.to_http_status(), Json(json!({ "error": e.to_string() })))
                .into_response()
        }
    };

    let spec = OpSpec::new(OpKind::AttachPeer)
        .with("id", peer_id.to_string())
        .with("hostname", &body.hostname)
        .with("rpc_addr", &body.rpc_addr);
    let outcome = state.coordinator.execute(spec).await;

    if outcome.success {
        // Push our view to the new member right away; periodic handshakes
        // take over from here
        let node = state.node.clone();
        let endpoint = PeerEndpoint {
            id: peer_id,
            hostname: body.hostname.clone(),
            rpc_addr: body.rpc_addr.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = node.sync_with_peer(&endpoint).await {
                tracing::warn!(peer = %endpoint.hostname, error = %e, "initial sync failed");
            }
        });
    }
    op_response(outcome).into_response()
}

async fn detach_peer(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> axum::response::Response {
    if id == state.node.id {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "cannot detach the node handling the request" })),
        )
            .into_response();
    }
    let spec = OpSpec::new(OpKind::DetachPeer).with("id", id.to_string());
    op_response(state.coordinator.execute(spec).await).into_response()
}

// === Snapshots ===

#[derive(Deserialize)]
struct CreateSnapshotBody {
    name: String,
    volumes: Vec<String>,
    description: Option<String>,
}

async fn create_snapshot(
    State(state): State<AppState>,
    Json(body): Json<CreateSnapshotBody>,
) -> impl IntoResponse {
    let mut spec = OpSpec::new(OpKind::SnapCreate)
        .with("snapname", &body.name)
        .with("volumes", body.volumes.join(","));
    if let Some(description) = body.description {
        spec = spec.with("description", description);
    }
    op_response(state.coordinator.execute(spec).await)
}

async fn delete_snapshot(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let spec = OpSpec::new(OpKind::SnapDelete).with("snapname", name);
    op_response(state.coordinator.execute(spec).await)
}

async fn restore_snapshot(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let spec = OpSpec::new(OpKind::SnapRestore).with("snapname", name);
    op_response(state.coordinator.execute(spec).await)
}
