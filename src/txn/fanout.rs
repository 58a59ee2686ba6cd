//! RPC fan-out and aggregation
//!
//! Each transaction phase sends one request to every participating peer in
//! parallel, waits for the replies within the phase deadline, and folds the
//! results into per-peer outcomes with error attribution. The aggregate is
//! a success only if every peer's outcome is.

use crate::common::Error;
use crate::rpc::{PeerEndpoint, PeerReply, PeerRequest, PeerTransport};
use futures_util::future::join_all;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PhaseResult {
    Ok,
    Busy { owner: Uuid },
    Rejected { reason: String },
    Unreachable { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerPhaseOutcome {
    pub peer: Uuid,
    pub hostname: String,
    #[serde(flatten)]
    pub result: PhaseResult,
}

impl PeerPhaseOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self.result, PhaseResult::Ok)
    }
}

/// Send `make_request` to every peer in parallel and collect one outcome
/// per peer within `deadline`.
pub async fn fanout(
    transport: &dyn PeerTransport,
    peers: &[PeerEndpoint],
    make_request: impl Fn(&PeerEndpoint) -> PeerRequest,
    deadline: Duration,
) -> Vec<PeerPhaseOutcome> {
    let calls = peers.iter().map(|peer| {
        let request = make_request(peer);
        async move {
            let result =
                match tokio::time::timeout(deadline, transport.call(peer, request)).await {
                    Ok(Ok(PeerReply::Ok)) => PhaseResult::Ok,
                    Ok(Ok(PeerReply::Busy { owner })) => PhaseResult::Busy { owner },
                    Ok(Ok(PeerReply::Rejected { reason })) => PhaseResult::Rejected { reason },
                    Ok(Ok(other)) => PhaseResult::Rejected {
                        reason: format!("unexpected reply: {:?}", other),
                    },
                    Ok(Err(e)) => PhaseResult::Unreachable {
                        error: e.to_string(),
                    },
                    Err(_) => PhaseResult::Unreachable {
                        error: format!("no reply within {:?}", deadline),
                    },
                };
            PeerPhaseOutcome {
                peer: peer.id,
                hostname: peer.hostname.clone(),
                result,
            }
        }
    });
    join_all(calls).await
}

pub fn all_ok(outcomes: &[PeerPhaseOutcome]) -> bool {
    outcomes.iter().all(PeerPhaseOutcome::is_ok)
}

/// Representative error of a failed phase, with the peer named
pub fn first_failure(outcomes: &[PeerPhaseOutcome], resource: &str) -> Option<Error> {
    outcomes.iter().find_map(|o| match &o.result {
        PhaseResult::Ok => None,
        PhaseResult::Busy { owner } => Some(Error::LockBusy {
            resource: resource.to_string(),
            owner: *owner,
        }),
        PhaseResult::Rejected { reason } => Some(Error::PeerRejected {
            peer: o.hostname.clone(),
            reason: reason.clone(),
        }),
        PhaseResult::Unreachable { .. } => Some(Error::PeerUnreachable(o.hostname.clone())),
    })
}
