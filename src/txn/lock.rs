//! Cluster lock manager
//!
//! Grants exclusive, non-reentrant locks keyed by resource (a volume name,
//! or the global key serializing cluster-wide changes). Acquisition never
//! blocks or queues: a held resource answers `LockBusy` carrying the
//! current owner so the initiator can surface it. Cluster-wide mutual
//! exclusion comes from the initiator acquiring the same resource on every
//! peer over RPC; the records here are always node-local.

use crate::common::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// What a transaction locks
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum LockResource {
    /// Serializes cluster-wide state changes (peer membership, global
    /// options) against everything else
    Global,
    Volume(String),
}

impl std::fmt::Display for LockResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockResource::Global => write!(f, "global"),
            LockResource::Volume(name) => write!(f, "volume/{}", name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockRecord {
    pub owner: Uuid,
    pub txn_id: Uuid,
    pub acquired_at: Instant,
}

/// Where a transaction stands in its lifecycle. The success path walks
/// `Idle → Locked → Staged → Committing → Committed`; any failure detours
/// through `Aborting` back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnState {
    Idle,
    Locked,
    Staged,
    Committing,
    Committed,
    Aborting,
}

/// Auxiliary per-transaction state, correlating the multiple round trips of
/// one operation and recording commit application for idempotence
#[derive(Debug, Clone)]
pub struct TxnOpInfo {
    pub origin: Uuid,
    pub resource: LockResource,
    pub started_at: Instant,
    pub state: TxnState,
    pub committed: bool,
}

#[derive(Default)]
struct Inner {
    locks: HashMap<LockResource, LockRecord>,
    txns: HashMap<Uuid, TxnOpInfo>,
}

pub struct LockManager {
    staleness: Duration,
    inner: Mutex<Inner>,
}

impl LockManager {
    pub fn new(staleness: Duration) -> Self {
        Self {
            staleness,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Acquire `resource` for `owner` under `txn_id`. Fails immediately with
    /// the current owner when held — including by the same owner
    /// (non-reentrant).
    pub fn acquire(&self, resource: &LockResource, owner: Uuid, txn_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(held) = inner.locks.get(resource) {
            return Err(Error::LockBusy {
                resource: resource.to_string(),
                owner: held.owner,
            });
        }
        inner.locks.insert(
            resource.clone(),
            LockRecord {
                owner,
                txn_id,
                acquired_at: Instant::now(),
            },
        );
        inner.txns.insert(
            txn_id,
            TxnOpInfo {
                origin: owner,
                resource: resource.clone(),
                started_at: Instant::now(),
                state: TxnState::Locked,
                committed: false,
            },
        );
        tracing::debug!(%resource, %owner, %txn_id, "lock acquired");
        Ok(())
    }

    /// Release `resource` held under `txn_id`. Releasing a lock that is not
    /// held, or held by a different transaction, is an error.
    pub fn release(&self, resource: &LockResource, txn_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.locks.get(resource) {
            Some(held) if held.txn_id == txn_id => {
                inner.locks.remove(resource);
                tracing::debug!(%resource, %txn_id, "lock released");
                Ok(())
            }
            _ => Err(Error::LockNotHeld {
                resource: resource.to_string(),
            }),
        }
    }

    pub fn owner_of(&self, resource: &LockResource) -> Option<Uuid> {
        self.inner
            .lock()
            .unwrap()
            .locks
            .get(resource)
            .map(|r| r.owner)
    }

    /// Record that `txn_id`'s commit has been applied on this node. Returns
    /// `false` when it already was, so a retried commit message is a no-op.
    pub fn mark_committed(&self, txn_id: Uuid) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.txns.get_mut(&txn_id) {
            Some(info) => {
                if info.committed {
                    false
                } else {
                    info.committed = true;
                    true
                }
            }
            // Commit without a local lock record (e.g. after a forced
            // release): apply once and remember it
            None => {
                inner.txns.insert(
                    txn_id,
                    TxnOpInfo {
                        origin: Uuid::nil(),
                        resource: LockResource::Global,
                        started_at: Instant::now(),
                        state: TxnState::Committing,
                        committed: true,
                    },
                );
                true
            }
        }
    }

    /// Roll the idempotence ledger back for a commit that failed to apply,
    /// so a retry is not silently skipped.
    pub fn clear_committed(&self, txn_id: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(info) = inner.txns.get_mut(&txn_id) {
            info.committed = false;
        }
    }

    /// Record a lifecycle transition for the transaction
    pub fn set_txn_state(&self, txn_id: Uuid, state: TxnState) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(info) = inner.txns.get_mut(&txn_id) {
            tracing::debug!(%txn_id, from = ?info.state, to = ?state, "transaction transition");
            info.state = state;
        }
    }

    pub fn txn_info(&self, txn_id: &Uuid) -> Option<TxnOpInfo> {
        self.inner.lock().unwrap().txns.get(txn_id).cloned()
    }

    /// Force-release locks older than the staleness timeout whose owner the
    /// caller considers unreachable. Returns what was reaped; every forced
    /// release is logged. Aged-out transaction records are purged here too.
    pub fn reap_stale(
        &self,
        owner_unreachable: impl Fn(&Uuid) -> bool,
    ) -> Vec<(LockResource, Uuid)> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let staleness = self.staleness;

        let expired: Vec<LockResource> = inner
            .locks
            .iter()
            .filter(|(_, rec)| {
                now.duration_since(rec.acquired_at) > staleness && owner_unreachable(&rec.owner)
            })
            .map(|(res, _)| res.clone())
            .collect();

        let mut reaped = Vec::new();
        for resource in expired {
            if let Some(rec) = inner.locks.remove(&resource) {
                tracing::warn!(
                    %resource,
                    owner = %rec.owner,
                    held_for = ?now.duration_since(rec.acquired_at),
                    "force-released stale lock"
                );
                reaped.push((resource, rec.owner));
            }
        }

        let txn_ttl = staleness * 4;
        inner
            .txns
            .retain(|_, info| now.duration_since(info.started_at) <= txn_ttl);

        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> LockManager {
        LockManager::new(Duration::from_secs(180))
    }

    #[test]
    fn test_mutual_exclusion() {
        let mgr = manager();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let res = LockResource::Volume("vol1".into());

        mgr.acquire(&res, a, Uuid::new_v4()).unwrap();
        let err = mgr.acquire(&res, b, Uuid::new_v4());
        match err {
            Err(Error::LockBusy { owner, .. }) => assert_eq!(owner, a),
            other => panic!("expected LockBusy, got {:?}", other),
        }
        assert_eq!(mgr.owner_of(&res), Some(a));
    }

    #[test]
    fn test_non_reentrant() {
        let mgr = manager();
        let a = Uuid::new_v4();
        let res = LockResource::Global;
        mgr.acquire(&res, a, Uuid::new_v4()).unwrap();
        assert!(mgr.acquire(&res, a, Uuid::new_v4()).is_err());
    }

    #[test]
    fn test_release_then_reacquire() {
        let mgr = manager();
        let a = Uuid::new_v4();
        let txn = Uuid::new_v4();
        let res = LockResource::Volume("vol1".into());

        mgr.acquire(&res, a, txn).unwrap();
        mgr.release(&res, txn).unwrap();
        assert_eq!(mgr.owner_of(&res), None);
        mgr.acquire(&res, Uuid::new_v4(), Uuid::new_v4()).unwrap();
    }

    #[test]
    fn test_release_wrong_txn_refused() {
        let mgr = manager();
        let res = LockResource::Volume("vol1".into());
        mgr.acquire(&res, Uuid::new_v4(), Uuid::new_v4()).unwrap();

        let err = mgr.release(&res, Uuid::new_v4());
        assert!(matches!(err, Err(Error::LockNotHeld { .. })));
        assert!(mgr.owner_of(&res).is_some());
    }

    #[test]
    fn test_distinct_resources_independent() {
        let mgr = manager();
        let a = Uuid::new_v4();
        mgr.acquire(&LockResource::Volume("vol1".into()), a, Uuid::new_v4())
            .unwrap();
        mgr.acquire(&LockResource::Volume("vol2".into()), a, Uuid::new_v4())
            .unwrap();
        mgr.acquire(&LockResource::Global, a, Uuid::new_v4()).unwrap();
    }

    #[test]
    fn test_stale_reap() {
        let mgr = LockManager::new(Duration::from_millis(0));
        let a = Uuid::new_v4();
        let res = LockResource::Volume("vol1".into());
        mgr.acquire(&res, a, Uuid::new_v4()).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        let reaped = mgr.reap_stale(|_| true);
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].1, a);
        assert_eq!(mgr.owner_of(&res), None);
    }

    #[test]
    fn test_reap_spares_reachable_owner() {
        let mgr = LockManager::new(Duration::from_millis(0));
        let a = Uuid::new_v4();
        let res = LockResource::Volume("vol1".into());
        mgr.acquire(&res, a, Uuid::new_v4()).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        let reaped = mgr.reap_stale(|_| false);
        assert!(reaped.is_empty());
        assert_eq!(mgr.owner_of(&res), Some(a));
    }

    #[test]
    fn test_commit_idempotence_ledger() {
        let mgr = manager();
        let txn = Uuid::new_v4();
        mgr.acquire(&LockResource::Volume("vol1".into()), Uuid::new_v4(), txn)
            .unwrap();

        assert!(mgr.mark_committed(txn));
        assert!(!mgr.mark_committed(txn));

        // A failed apply reopens the ledger for a retry
        mgr.clear_committed(txn);
        assert!(mgr.mark_committed(txn));
    }

    #[test]
    fn test_txn_state_transitions() {
        let mgr = manager();
        let txn = Uuid::new_v4();
        mgr.acquire(&LockResource::Global, Uuid::new_v4(), txn).unwrap();
        assert_eq!(mgr.txn_info(&txn).unwrap().state, TxnState::Locked);

        mgr.set_txn_state(txn, TxnState::Staged);
        mgr.set_txn_state(txn, TxnState::Committing);
        mgr.set_txn_state(txn, TxnState::Committed);
        assert_eq!(mgr.txn_info(&txn).unwrap().state, TxnState::Committed);
    }
}
