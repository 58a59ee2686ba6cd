//! Peer handshake: volume divergence detection
//!
//! On (re)connect, peers exchange per-volume `(version, checksum)` summaries.
//! Each side classifies every volume independently; the classification is
//! symmetric, so two peers comparing the same pair of summaries agree on the
//! outcome without further negotiation.

use crate::cluster::state::{ClusterState, VolumeConflict};
use crate::cluster::volume::{Volume, VolumeSummary};
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Per-volume comparison outcome, from the local node's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceOutcome {
    /// Copies agree (or the local copy is newer, which needs no local
    /// action — the peer imports on its side)
    Identical,
    /// Local copy is older: import the peer's copy
    NeedsUpdate,
    /// Equal versions, different checksums: operator attention required
    Conflict,
    /// Peer has a volume this node lacks
    AbsentLocally,
    /// This node has a volume the peer lacks
    AbsentRemotely,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeDiff {
    pub name: String,
    pub outcome: DivergenceOutcome,
}

/// Classify one volume given both sides' summaries
pub fn classify(
    local: Option<&VolumeSummary>,
    remote: Option<&VolumeSummary>,
) -> Option<DivergenceOutcome> {
    match (local, remote) {
        (None, None) => None,
        (None, Some(_)) => Some(DivergenceOutcome::AbsentLocally),
        (Some(_), None) => Some(DivergenceOutcome::AbsentRemotely),
        (Some(l), Some(r)) => Some(if l.version < r.version {
            DivergenceOutcome::NeedsUpdate
        } else if l.version == r.version && l.checksum != r.checksum {
            DivergenceOutcome::Conflict
        } else {
            DivergenceOutcome::Identical
        }),
    }
}

/// Compare full summary lists. Deterministic: output ordered by volume name.
pub fn compare_summaries(local: &[VolumeSummary], remote: &[VolumeSummary]) -> Vec<VolumeDiff> {
    let local_by_name: BTreeMap<&str, &VolumeSummary> =
        local.iter().map(|s| (s.name.as_str(), s)).collect();
    let remote_by_name: BTreeMap<&str, &VolumeSummary> =
        remote.iter().map(|s| (s.name.as_str(), s)).collect();

    let mut names: Vec<&str> = local_by_name.keys().copied().collect();
    for name in remote_by_name.keys() {
        if !local_by_name.contains_key(name) {
            names.push(name);
        }
    }
    names.sort_unstable();

    names
        .into_iter()
        .filter_map(|name| {
            classify(
                local_by_name.get(name).copied(),
                remote_by_name.get(name).copied(),
            )
            .map(|outcome| VolumeDiff {
                name: name.to_string(),
                outcome,
            })
        })
        .collect()
}

/// Materialize operator-facing conflict records for every `Conflict`
/// outcome in a comparison
pub fn conflicts_from_diffs(
    diffs: &[VolumeDiff],
    local: &[VolumeSummary],
    remote: &[VolumeSummary],
    peer: Uuid,
) -> Vec<VolumeConflict> {
    diffs
        .iter()
        .filter(|d| d.outcome == DivergenceOutcome::Conflict)
        .filter_map(|d| {
            let l = local.iter().find(|s| s.name == d.name)?;
            let r = remote.iter().find(|s| s.name == d.name)?;
            Some(VolumeConflict {
                volume: d.name.clone(),
                version: l.version,
                local_cksum: l.checksum,
                remote_cksum: r.checksum,
                peer,
            })
        })
        .collect()
}

/// Reconciliation work derived from a comparison
#[derive(Debug, Default)]
pub struct HandshakePlan {
    pub diffs: Vec<VolumeDiff>,
    /// Volumes to pull from the peer and import (older or missing locally)
    pub fetch: Vec<String>,
    /// Local volumes scheduled for deletion (peer majority no longer knows
    /// them)
    pub delete: Vec<String>,
}

/// Build the reconciliation plan for a peer's summaries.
///
/// Deletion of volumes the peer lacks is only scheduled while this node
/// sees a connected majority; a partitioned minority must not unilaterally
/// drop volumes known to the rest of the cluster.
pub fn plan(state: &ClusterState, remote: &[VolumeSummary]) -> HandshakePlan {
    let local = state.volume_summaries();
    let diffs = compare_summaries(&local, remote);

    let mut plan = HandshakePlan::default();
    for diff in &diffs {
        match diff.outcome {
            DivergenceOutcome::NeedsUpdate | DivergenceOutcome::AbsentLocally => {
                plan.fetch.push(diff.name.clone());
            }
            DivergenceOutcome::AbsentRemotely => {
                if state.sees_majority() {
                    plan.delete.push(diff.name.clone());
                } else {
                    tracing::warn!(
                        volume = %diff.name,
                        "peer lacks volume but no connected majority, keeping local copy"
                    );
                }
            }
            DivergenceOutcome::Identical | DivergenceOutcome::Conflict => {}
        }
    }
    plan.diffs = diffs;
    plan
}

/// Import a volume fetched from `peer`: merge into the existing copy or
/// create it. Checksum conflicts are recorded for the operator and
/// propagated.
pub fn apply_remote_volume(
    state: &mut ClusterState,
    peer: Uuid,
    incoming: Volume,
) -> Result<()> {
    let name = incoming.name.clone();
    match state.volumes.get_mut(&name) {
        Some(local) => match local.import(incoming) {
            Ok(()) => Ok(()),
            Err(Error::DivergenceDetected {
                volume,
                version,
                local_cksum,
                remote_cksum,
            }) => {
                state.record_conflict(VolumeConflict {
                    volume: volume.clone(),
                    version,
                    local_cksum,
                    remote_cksum,
                    peer,
                });
                Err(Error::DivergenceDetected {
                    volume,
                    version,
                    local_cksum,
                    remote_cksum,
                })
            }
            Err(e) => Err(e),
        },
        None => state.insert_volume(incoming),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(name: &str, version: u64, checksum: u32) -> VolumeSummary {
        VolumeSummary {
            name: name.to_string(),
            version,
            checksum,
        }
    }

    #[test]
    fn test_classify_identical() {
        let l = summary("v", 3, 42);
        let r = summary("v", 3, 42);
        assert_eq!(
            classify(Some(&l), Some(&r)),
            Some(DivergenceOutcome::Identical)
        );
    }

    #[test]
    fn test_classify_conflict_is_symmetric() {
        let a = summary("v", 3, 42);
        let b = summary("v", 3, 43);
        assert_eq!(
            classify(Some(&a), Some(&b)),
            Some(DivergenceOutcome::Conflict)
        );
        assert_eq!(
            classify(Some(&b), Some(&a)),
            Some(DivergenceOutcome::Conflict)
        );
    }

    #[test]
    fn test_classify_version_skew() {
        let old = summary("v", 2, 10);
        let new = summary("v", 3, 20);
        assert_eq!(
            classify(Some(&old), Some(&new)),
            Some(DivergenceOutcome::NeedsUpdate)
        );
        // The newer side needs no action
        assert_eq!(
            classify(Some(&new), Some(&old)),
            Some(DivergenceOutcome::Identical)
        );
    }

    #[test]
    fn test_compare_summaries_absences() {
        let local = vec![summary("a", 1, 1), summary("b", 1, 1)];
        let remote = vec![summary("b", 1, 1), summary("c", 1, 1)];

        let diffs = compare_summaries(&local, &remote);
        assert_eq!(diffs.len(), 3);
        assert_eq!(diffs[0].name, "a");
        assert_eq!(diffs[0].outcome, DivergenceOutcome::AbsentRemotely);
        assert_eq!(diffs[1].name, "b");
        assert_eq!(diffs[1].outcome, DivergenceOutcome::Identical);
        assert_eq!(diffs[2].name, "c");
        assert_eq!(diffs[2].outcome, DivergenceOutcome::AbsentLocally);
    }

    #[test]
    fn test_compare_summaries_deterministic() {
        let local = vec![summary("x", 2, 5), summary("a", 1, 1)];
        let remote = vec![summary("a", 1, 1), summary("x", 2, 5)];
        let first = compare_summaries(&local, &remote);
        let second = compare_summaries(&local, &remote);
        assert_eq!(
            first.iter().map(|d| &d.name).collect::<Vec<_>>(),
            second.iter().map(|d| &d.name).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_plan_minority_never_deletes() {
        use crate::cluster::peer::{Peer, PeerState};

        let mut state = ClusterState::new(Uuid::new_v4(), "local");
        state.insert_volume(Volume::new("survivor")).unwrap();
        // Two known peers, both disconnected: local is a minority of 1/3
        for i in 0..2 {
            let id = Uuid::new_v4();
            state
                .peers
                .insert(Peer::new(id, format!("n{}", i), format!("addr{}", i)))
                .unwrap();
            state.peers.set_state(&id, PeerState::Disconnected).unwrap();
        }

        let plan = plan(&state, &[]);
        assert!(plan.delete.is_empty());
        assert_eq!(plan.diffs[0].outcome, DivergenceOutcome::AbsentRemotely);
    }

    #[test]
    fn test_apply_remote_volume_records_conflict() {
        let peer = Uuid::new_v4();
        let mut state = ClusterState::new(Uuid::new_v4(), "local");

        let mut local = Volume::new("vol1");
        local.bump_version();
        let mut remote = local.clone();
        state.insert_volume(local).unwrap();

        remote.options.insert("diverged".into(), "yes".into());
        remote.refresh_checksum();

        let err = apply_remote_volume(&mut state, peer, remote);
        assert!(matches!(err, Err(Error::DivergenceDetected { .. })));
        assert!(state.conflicts.contains_key("vol1"));
    }
}
