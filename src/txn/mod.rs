//! Cluster transactions
//!
//! The lock manager, the per-phase RPC fan-out, the operation table, and
//! the coordinator that drives lock → stage → commit → unlock across the
//! cluster.

pub mod coordinator;
pub mod fanout;
pub mod lock;
pub mod ops;

pub use coordinator::{OpOutcome, PhaseReport, TxnCoordinator, TxnPhase};
pub use lock::{LockManager, LockResource, TxnState};
pub use ops::{OpKind, OpSpec};
