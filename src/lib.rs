//! # volmand
//!
//! Management daemon for a distributed storage cluster:
//! - Replicated view of peers, volumes, bricks, and snapshots
//! - Cluster-wide transactions (lock → stage → commit → unlock)
//! - Divergence detection via versioned, checksummed volume metadata
//! - Brick worker process supervision with optional multiplexing
//! - gRPC between daemons, HTTP for the admin surface
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   handshake / txn RPC   ┌──────────────┐
//! │  volmand A   │◄───────────────────────►│  volmand B   │
//! │  (initiator) │                         │  (peer)      │
//! └──────┬───────┘                         └──────┬───────┘
//!        │ supervises                             │ supervises
//! ┌──────▼───────┐                         ┌──────▼───────┐
//! │ brick worker │                         │ brick worker │
//! │ processes    │                         │ processes    │
//! └──────────────┘                         └──────────────┘
//! ```
//!
//! Every configuration change runs as one transaction: the initiating node
//! takes the resource lock everywhere, stages (validates) everywhere,
//! checks quorum, commits everywhere, and unlocks unconditionally. Peers
//! that miss a commit converge through the periodic handshake, which
//! compares per-volume versions and checksums.
//!
//! ## Usage
//!
//! ```bash
//! volmand serve \
//!   --hostname node-a \
//!   --bind 0.0.0.0:24007 \
//!   --grpc 0.0.0.0:24008 \
//!   --workdir /var/lib/volmand
//! ```

pub mod brick;
pub mod cluster;
pub mod common;
pub mod daemon;
pub mod rpc;
pub mod txn;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use daemon::{Daemon, Node};
pub use txn::{OpKind, OpOutcome, OpSpec, TxnCoordinator};

// Generated protobuf code
pub mod proto {
    tonic::include_proto!("volmand");
}

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
