//! Transaction coordinator: the operation state machine
//!
//! Drives one operation through lock → stage → quorum → commit → unlock
//! across this node and every connected peer. Mutation happens only in the
//! commit phase, after unanimous staging; the unlock phase runs
//! unconditionally. A mid-commit failure is reported with per-peer
//! attribution and, for operations that declare one, answered with a
//! compensating action on the peers that did commit — everything else is
//! left to handshake reconciliation.

use crate::common::Error;
use crate::daemon::node::Node;
use crate::rpc::{PeerEndpoint, PeerRequest};
use crate::txn::fanout::{all_ok, fanout, first_failure, PeerPhaseOutcome, PhaseResult};
use crate::txn::lock::{LockResource, TxnState};
use crate::txn::ops::{self, OpKind, OpSpec};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const UNLOCK_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnPhase {
    Lock,
    Stage,
    Commit,
    Compensate,
    Unlock,
}

impl std::fmt::Display for TxnPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxnPhase::Lock => write!(f, "lock"),
            TxnPhase::Stage => write!(f, "stage"),
            TxnPhase::Commit => write!(f, "commit"),
            TxnPhase::Compensate => write!(f, "compensate"),
            TxnPhase::Unlock => write!(f, "unlock"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub phase: TxnPhase,
    pub peers: Vec<PeerPhaseOutcome>,
}

/// Aggregate result of one operation: overall status, a human-readable
/// message, and the full per-peer breakdown per phase
#[derive(Debug, Clone, Serialize)]
pub struct OpOutcome {
    pub txn_id: Uuid,
    pub op: OpKind,
    pub success: bool,
    pub message: String,
    pub phases: Vec<PhaseReport>,
}

pub struct TxnCoordinator {
    node: Arc<Node>,
}

impl TxnCoordinator {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    fn local_outcome(&self, result: &crate::common::Result<()>) -> PeerPhaseOutcome {
        let result = match result {
            Ok(()) => PhaseResult::Ok,
            Err(Error::LockBusy { owner, .. }) => PhaseResult::Busy { owner: *owner },
            Err(e) => PhaseResult::Rejected {
                reason: e.to_string(),
            },
        };
        PeerPhaseOutcome {
            peer: self.node.id,
            hostname: self.node.hostname.clone(),
            result,
        }
    }

    /// Execute one operation end to end. Never panics the daemon: every
    /// failure degrades to an unsuccessful [`OpOutcome`].
    pub async fn execute(&self, spec: OpSpec) -> OpOutcome {
        let mut spec = spec;
        ops::prepare(&mut spec);
        let txn_id = Uuid::new_v4();
        let op = spec.kind;
        let deadline = self.node.config.rpc_timeout();
        let mut phases: Vec<PhaseReport> = Vec::new();

        tracing::info!(%txn_id, %op, "operation started");

        // Parameter-level failures are purely local: no lock, no network.
        let resource = match spec.resource() {
            Ok(resource) => resource,
            Err(e) => {
                return self.failed(txn_id, op, TxnPhase::Lock, &e, phases);
            }
        };
        let resource_key = resource.to_string();

        let peers = self.node.connected_endpoints().await;

        // === Lock phase: self first, then every peer ===
        let local_lock = self
            .node
            .locks
            .acquire(&resource, self.node.id, txn_id);
        if local_lock.is_err() {
            phases.push(PhaseReport {
                phase: TxnPhase::Lock,
                peers: vec![self.local_outcome(&local_lock)],
            });
            let e = local_lock.unwrap_err();
            return self.failed(txn_id, op, TxnPhase::Lock, &e, phases);
        }

        // Local staging runs before any fan-out so a locally-detectable
        // failure never leaves this node.
        let local_stage = ops::stage(&self.node, &spec).await;
        if local_stage.is_err() {
            phases.push(PhaseReport {
                phase: TxnPhase::Stage,
                peers: vec![self.local_outcome(&local_stage)],
            });
            self.release_local(&resource, txn_id);
            let e = local_stage.unwrap_err();
            return self.failed(txn_id, op, TxnPhase::Stage, &e, phases);
        }

        let lock_outcomes = fanout(
            self.node.transport.as_ref(),
            &peers,
            |_| PeerRequest::Lock {
                resource: resource.clone(),
                txn_id,
                owner: self.node.id,
            },
            deadline,
        )
        .await;
        let locked_peers: Vec<PeerEndpoint> = peers
            .iter()
            .zip(&lock_outcomes)
            .filter(|(_, o)| o.is_ok())
            .map(|(p, _)| p.clone())
            .collect();
        let mut lock_report = vec![self.local_outcome(&Ok(()))];
        lock_report.extend(lock_outcomes.clone());
        phases.push(PhaseReport {
            phase: TxnPhase::Lock,
            peers: lock_report,
        });

        if !all_ok(&lock_outcomes) {
            let err = first_failure(&lock_outcomes, &resource_key)
                .unwrap_or_else(|| Error::Internal("lock phase failed".into()));
            self.unlock(&resource, txn_id, &locked_peers, &mut phases, deadline)
                .await;
            return self.failed(txn_id, op, TxnPhase::Lock, &err, phases);
        }

        // === Stage phase on peers ===
        let stage_outcomes = fanout(
            self.node.transport.as_ref(),
            &peers,
            |_| PeerRequest::Stage {
                txn_id,
                op: spec.clone(),
            },
            deadline,
        )
        .await;
        let mut stage_report = vec![self.local_outcome(&Ok(()))];
        stage_report.extend(stage_outcomes.clone());
        phases.push(PhaseReport {
            phase: TxnPhase::Stage,
            peers: stage_report,
        });

        if !all_ok(&stage_outcomes) {
            let err = first_failure(&stage_outcomes, &resource_key)
                .unwrap_or_else(|| Error::Internal("stage phase failed".into()));
            self.unlock(&resource, txn_id, &peers, &mut phases, deadline)
                .await;
            return self.failed(txn_id, op, TxnPhase::Stage, &err, phases);
        }
        self.node.locks.set_txn_state(txn_id, TxnState::Staged);

        // === Quorum check ===
        let quorum = {
            let state = self.node.state.read().await;
            let volume = spec.volume_name().and_then(|n| state.volumes.get(n));
            let status = state.evaluate_quorum(volume);
            let (active, total) = state.quorum_counts();
            (status, active, total)
        };
        if quorum.0 == crate::cluster::QuorumStatus::NotMet {
            let err = Error::QuorumNotMet {
                active: quorum.1,
                total: quorum.2,
            };
            self.unlock(&resource, txn_id, &peers, &mut phases, deadline)
                .await;
            return self.failed(txn_id, op, TxnPhase::Stage, &err, phases);
        }

        // === Commit phase: self first, then every peer ===
        self.node.locks.set_txn_state(txn_id, TxnState::Committing);
        self.node.locks.mark_committed(txn_id);
        let local_commit = ops::commit(&self.node, txn_id, &spec).await;
        if local_commit.is_err() {
            self.node.locks.clear_committed(txn_id);
            phases.push(PhaseReport {
                phase: TxnPhase::Commit,
                peers: vec![self.local_outcome(&local_commit)],
            });
            self.unlock(&resource, txn_id, &peers, &mut phases, deadline)
                .await;
            let err = Error::MutationFailed {
                peer: self.node.hostname.clone(),
                reason: local_commit.unwrap_err().to_string(),
            };
            return self.failed(txn_id, op, TxnPhase::Commit, &err, phases);
        }

        let commit_outcomes = fanout(
            self.node.transport.as_ref(),
            &peers,
            |_| PeerRequest::Commit {
                txn_id,
                op: spec.clone(),
            },
            deadline,
        )
        .await;
        let mut commit_report = vec![self.local_outcome(&Ok(()))];
        commit_report.extend(commit_outcomes.clone());
        phases.push(PhaseReport {
            phase: TxnPhase::Commit,
            peers: commit_report,
        });

        if !all_ok(&commit_outcomes) {
            // Partial commit: compensate where the operation declares it,
            // surface the divergence either way.
            let err = first_failure(&commit_outcomes, &resource_key)
                .unwrap_or_else(|| Error::Internal("commit phase failed".into()));

            if let Some(comp) = ops::compensation(&spec) {
                let committed_peers: Vec<PeerEndpoint> = peers
                    .iter()
                    .zip(&commit_outcomes)
                    .filter(|(_, o)| o.is_ok())
                    .map(|(p, _)| p.clone())
                    .collect();
                let comp_txn = Uuid::new_v4();
                tracing::warn!(%txn_id, %op, comp = %comp.kind, "partial commit, running compensation");

                self.node.locks.mark_committed(comp_txn);
                let local_comp = ops::commit(&self.node, comp_txn, &comp).await;
                if let Err(e) = &local_comp {
                    tracing::error!(%txn_id, error = %e, "local compensation failed");
                }
                let comp_outcomes = fanout(
                    self.node.transport.as_ref(),
                    &committed_peers,
                    |_| PeerRequest::Commit {
                        txn_id: comp_txn,
                        op: comp.clone(),
                    },
                    deadline,
                )
                .await;
                let mut comp_report = vec![self.local_outcome(&local_comp)];
                comp_report.extend(comp_outcomes);
                phases.push(PhaseReport {
                    phase: TxnPhase::Compensate,
                    peers: comp_report,
                });
            }

            self.unlock(&resource, txn_id, &peers, &mut phases, deadline)
                .await;
            return self.failed(txn_id, op, TxnPhase::Commit, &err, phases);
        }

        // === Unlock phase ===
        self.node.locks.set_txn_state(txn_id, TxnState::Committed);
        self.unlock(&resource, txn_id, &peers, &mut phases, deadline)
            .await;

        tracing::info!(%txn_id, %op, peers = peers.len(), "operation committed");
        OpOutcome {
            txn_id,
            op,
            success: true,
            message: format!("{} committed on {} node(s)", op, peers.len() + 1),
            phases,
        }
    }

    fn release_local(&self, resource: &LockResource, txn_id: Uuid) {
        if let Err(e) = self.node.locks.release(resource, txn_id) {
            tracing::warn!(%resource, %txn_id, error = %e, "local unlock failed");
        }
    }

    /// Unconditional unlock of `resource` on this node and `peers`, with one
    /// short retry against peers that did not answer. A peer that stays
    /// unreachable is left to the staleness reaper. On abort paths the
    /// transaction passes through `Aborting` on its way back to idle.
    async fn unlock(
        &self,
        resource: &LockResource,
        txn_id: Uuid,
        peers: &[PeerEndpoint],
        phases: &mut Vec<PhaseReport>,
        deadline: Duration,
    ) {
        self.release_local(resource, txn_id);

        let mut outcomes = fanout(
            self.node.transport.as_ref(),
            peers,
            |_| PeerRequest::Unlock {
                resource: resource.clone(),
                txn_id,
            },
            deadline,
        )
        .await;

        let retry_targets: Vec<PeerEndpoint> = peers
            .iter()
            .zip(&outcomes)
            .filter(|(_, o)| matches!(o.result, PhaseResult::Unreachable { .. }))
            .map(|(p, _)| p.clone())
            .collect();
        if !retry_targets.is_empty() {
            tokio::time::sleep(UNLOCK_RETRY_DELAY).await;
            let retried = fanout(
                self.node.transport.as_ref(),
                &retry_targets,
                |_| PeerRequest::Unlock {
                    resource: resource.clone(),
                    txn_id,
                },
                deadline,
            )
            .await;
            for outcome in retried {
                if let Some(slot) = outcomes.iter_mut().find(|o| o.peer == outcome.peer) {
                    *slot = outcome;
                }
            }
        }

        for outcome in outcomes.iter().filter(|o| !o.is_ok()) {
            tracing::warn!(
                %resource,
                %txn_id,
                peer = %outcome.hostname,
                "unlock did not land, relying on staleness expiry"
            );
        }

        let mut report = vec![self.local_outcome(&Ok(()))];
        report.extend(outcomes);
        phases.push(PhaseReport {
            phase: TxnPhase::Unlock,
            peers: report,
        });
    }

    fn failed(
        &self,
        txn_id: Uuid,
        op: OpKind,
        phase: TxnPhase,
        err: &Error,
        phases: Vec<PhaseReport>,
    ) -> OpOutcome {
        self.node.locks.set_txn_state(txn_id, TxnState::Aborting);
        let message = format!("{} failed during {} phase: {}", op, phase, err);
        tracing::warn!(%txn_id, %op, %phase, error = %err, "operation failed");
        OpOutcome {
            txn_id,
            op,
            success: false,
            message,
            phases,
        }
    }
}
