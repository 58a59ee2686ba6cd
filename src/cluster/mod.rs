//! Cluster metadata model
//!
//! Entities (peers, volumes, bricks, snapshots), the shared [`ClusterState`]
//! they live in, the divergence-detecting handshake, and the RocksDB store
//! that persists committed configuration.

pub mod handshake;
pub mod peer;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod volume;

pub use peer::{Peer, PeerRegistry, PeerState};
pub use snapshot::{SnapBackendKind, SnapStatus, Snapshot};
pub use state::{ClusterState, QuorumStatus};
pub use store::MetaStore;
pub use volume::{Brick, BrickStatus, Volume, VolumeStatus, VolumeSummary};
