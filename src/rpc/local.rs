//! In-process transport hub
//!
//! Routes peer requests directly to `Node` instances living in the same
//! process. This backs single-machine clusters and the integration tests;
//! the hub can also inject per-request faults so partial failure paths
//! (a peer dropping out between stage and commit) are exercisable without
//! a network.

use crate::common::{Error, Result};
use crate::daemon::node::Node;
use crate::rpc::{PeerEndpoint, PeerReply, PeerRequest, PeerTransport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use uuid::Uuid;

type FaultFn = Box<dyn Fn(&PeerEndpoint, &PeerRequest) -> bool + Send + Sync>;

#[derive(Default)]
struct HubInner {
    by_id: HashMap<Uuid, Weak<Node>>,
    by_addr: HashMap<String, Uuid>,
    fault: Option<FaultFn>,
}

#[derive(Default)]
pub struct LocalHub {
    inner: Mutex<HubInner>,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: &Arc<Node>) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_id.insert(node.id, Arc::downgrade(node));
        inner.by_addr.insert(node.rpc_addr.clone(), node.id);
    }

    pub fn unregister(&self, id: &Uuid) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_id.remove(id);
        inner.by_addr.retain(|_, v| v != id);
    }

    /// Install a fault hook: requests for which it returns `true` fail as
    /// unreachable.
    pub fn set_fault(&self, fault: Option<FaultFn>) {
        self.inner.lock().unwrap().fault = fault;
    }

    fn resolve(&self, target: &PeerEndpoint, request: &PeerRequest) -> Result<Arc<Node>> {
        let inner = self.inner.lock().unwrap();
        if let Some(fault) = &inner.fault {
            if fault(target, request) {
                return Err(Error::PeerUnreachable(target.hostname.clone()));
            }
        }
        let id = if target.id.is_nil() {
            *inner
                .by_addr
                .get(&target.rpc_addr)
                .ok_or_else(|| Error::PeerUnreachable(target.hostname.clone()))?
        } else {
            target.id
        };
        inner
            .by_id
            .get(&id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::PeerUnreachable(target.hostname.clone()))
    }
}

pub struct LocalTransport {
    hub: Arc<LocalHub>,
}

impl LocalTransport {
    pub fn new(hub: Arc<LocalHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl PeerTransport for LocalTransport {
    fn name(&self) -> &str {
        "local"
    }

    async fn call(&self, target: &PeerEndpoint, request: PeerRequest) -> Result<PeerReply> {
        let node = self.hub.resolve(target, &request)?;
        Ok(node.handle_peer_request(request).await)
    }
}
