//! Brick worker process supervision
//!
//! Bricks are served by external worker processes. This module owns their
//! lifecycle: port allocation, launching, multiplexing several bricks into
//! one process, and graceful teardown.

pub mod launcher;
pub mod portmap;
pub mod supervisor;

pub use launcher::{BrickSpec, OsLauncher, ProcessId, ProcessLauncher};
pub use portmap::PortRegistry;
pub use supervisor::BrickSupervisor;
