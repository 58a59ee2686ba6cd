//! Brick process supervision
//!
//! Tracks which worker process serves which brick, allocates listening
//! ports, and multiplexes several bricks into one process when enabled.
//! A per-brick mutex serializes start/stop/restart so lifecycle
//! transitions for the same brick never overlap; bricks of different
//! volumes proceed independently.

use crate::brick::launcher::{BrickSpec, ProcessId, ProcessLauncher};
use crate::brick::portmap::PortRegistry;
use crate::cluster::volume::BrickStatus;
use crate::common::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

struct ProcEntry {
    port: u16,
    members: HashSet<String>,
}

#[derive(Default)]
struct Tables {
    procs: HashMap<ProcessId, ProcEntry>,
    assignment: HashMap<String, ProcessId>,
    statuses: HashMap<String, BrickStatus>,
}

enum StartPlan {
    Attach(ProcessId, u16),
    Spawn(u16),
}

pub struct BrickSupervisor {
    launcher: Arc<dyn ProcessLauncher>,
    mux_enabled: bool,
    max_per_process: usize,
    ports: std::sync::Mutex<PortRegistry>,
    tables: tokio::sync::Mutex<Tables>,
    brick_locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl BrickSupervisor {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        base_port: u16,
        max_port: u16,
        mux_enabled: bool,
        max_per_process: usize,
    ) -> Self {
        Self {
            launcher,
            mux_enabled,
            max_per_process: max_per_process.max(1),
            ports: std::sync::Mutex::new(PortRegistry::new(base_port, max_port)),
            tables: tokio::sync::Mutex::new(Tables::default()),
            brick_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn brick_lock(&self, brick_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.brick_locks.lock().unwrap();
        locks
            .entry(brick_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Start a brick worker, or attach to an existing one when
    /// multiplexing has capacity. Returns the listening port. Starting an
    /// already-running brick returns its current port.
    pub async fn start(&self, brick: &BrickSpec) -> Result<u16> {
        let lock = self.brick_lock(&brick.brick_id);
        let _guard = lock.lock().await;
        self.start_locked(brick).await
    }

    /// Stop a brick. The worker process is terminated once its last brick
    /// detaches; stopping a brick that is not running is a no-op.
    pub async fn stop(&self, brick: &BrickSpec, graceful: bool) -> Result<()> {
        let lock = self.brick_lock(&brick.brick_id);
        let _guard = lock.lock().await;
        self.stop_locked(brick, graceful).await
    }

    /// Stop then start under one per-brick critical section
    pub async fn restart(&self, brick: &BrickSpec) -> Result<u16> {
        let lock = self.brick_lock(&brick.brick_id);
        let _guard = lock.lock().await;
        self.stop_locked(brick, true).await?;
        self.start_locked(brick).await
    }

    pub async fn status(&self, brick_id: &str) -> BrickStatus {
        let tables = self.tables.lock().await;
        tables
            .statuses
            .get(brick_id)
            .copied()
            .unwrap_or(BrickStatus::Stopped)
    }

    /// Port the brick's worker listens on, if running
    pub async fn running_port(&self, brick_id: &str) -> Option<u16> {
        let tables = self.tables.lock().await;
        let pid = tables.assignment.get(brick_id)?;
        tables.procs.get(pid).map(|p| p.port)
    }

    /// Number of live worker processes
    pub async fn process_count(&self) -> usize {
        self.tables.lock().await.procs.len()
    }

    pub fn ports_in_use(&self) -> usize {
        self.ports.lock().unwrap().used_count()
    }

    async fn start_locked(&self, brick: &BrickSpec) -> Result<u16> {
        let plan = {
            let mut tables = self.tables.lock().await;

            if let Some(pid) = tables.assignment.get(&brick.brick_id) {
                let port = tables
                    .procs
                    .get(pid)
                    .map(|p| p.port)
                    .ok_or_else(|| Error::Internal("orphaned brick assignment".into()))?;
                tracing::debug!(brick = %brick.brick_id, port, "brick already running");
                return Ok(port);
            }

            // Reserve capacity before any await so concurrent starts see a
            // consistent picture
            let plan = if self.mux_enabled {
                let candidate = tables
                    .procs
                    .iter_mut()
                    .find(|(_, p)| p.members.len() < self.max_per_process);
                match candidate {
                    Some((pid, proc_entry)) => {
                        proc_entry.members.insert(brick.brick_id.clone());
                        StartPlan::Attach(*pid, proc_entry.port)
                    }
                    None => StartPlan::Spawn(self.ports.lock().unwrap().allocate()?),
                }
            } else {
                StartPlan::Spawn(self.ports.lock().unwrap().allocate()?)
            };
            tables
                .statuses
                .insert(brick.brick_id.clone(), BrickStatus::Starting);
            plan
        };

        match plan {
            StartPlan::Attach(pid, port) => {
                match self.launcher.attach(pid, brick).await {
                    Ok(()) => {
                        let mut tables = self.tables.lock().await;
                        tables.assignment.insert(brick.brick_id.clone(), pid);
                        tables
                            .statuses
                            .insert(brick.brick_id.clone(), BrickStatus::Started);
                        tracing::info!(brick = %brick.brick_id, process = pid, port, "brick attached");
                        Ok(port)
                    }
                    Err(e) => {
                        let mut tables = self.tables.lock().await;
                        if let Some(proc_entry) = tables.procs.get_mut(&pid) {
                            proc_entry.members.remove(&brick.brick_id);
                        }
                        tables
                            .statuses
                            .insert(brick.brick_id.clone(), BrickStatus::Stopped);
                        Err(e)
                    }
                }
            }
            StartPlan::Spawn(port) => match self.launcher.spawn(brick, port).await {
                Ok(pid) => {
                    let mut tables = self.tables.lock().await;
                    let mut members = HashSet::new();
                    members.insert(brick.brick_id.clone());
                    tables.procs.insert(pid, ProcEntry { port, members });
                    tables.assignment.insert(brick.brick_id.clone(), pid);
                    tables
                        .statuses
                        .insert(brick.brick_id.clone(), BrickStatus::Started);
                    tracing::info!(brick = %brick.brick_id, process = pid, port, "brick started");
                    Ok(port)
                }
                Err(e) => {
                    self.ports.lock().unwrap().release(port);
                    let mut tables = self.tables.lock().await;
                    tables
                        .statuses
                        .insert(brick.brick_id.clone(), BrickStatus::Stopped);
                    Err(e)
                }
            },
        }
    }

    async fn stop_locked(&self, brick: &BrickSpec, graceful: bool) -> Result<()> {
        let (pid, last, port) = {
            let mut tables = self.tables.lock().await;
            let pid = match tables.assignment.remove(&brick.brick_id) {
                Some(pid) => pid,
                None => {
                    tracing::debug!(brick = %brick.brick_id, "stop of non-running brick");
                    return Ok(());
                }
            };
            tables
                .statuses
                .insert(brick.brick_id.clone(), BrickStatus::Stopping);

            let proc_entry = tables
                .procs
                .get_mut(&pid)
                .ok_or_else(|| Error::Internal("orphaned brick assignment".into()))?;
            proc_entry.members.remove(&brick.brick_id);
            let last = proc_entry.members.is_empty();
            let port = proc_entry.port;
            if last {
                tables.procs.remove(&pid);
            }
            (pid, last, port)
        };

        if last {
            if let Err(e) = self.launcher.terminate(pid, graceful).await {
                tracing::warn!(brick = %brick.brick_id, process = pid, error = %e, "terminate failed");
            }
            self.ports.lock().unwrap().release(port);
            tracing::info!(brick = %brick.brick_id, process = pid, port, "worker terminated, port released");
        } else if let Err(e) = self.launcher.detach(pid, brick).await {
            tracing::warn!(brick = %brick.brick_id, process = pid, error = %e, "detach failed");
        }

        let mut tables = self.tables.lock().await;
        tables
            .statuses
            .insert(brick.brick_id.clone(), BrickStatus::Stopped);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    #[derive(Default)]
    struct MockLauncher {
        next_id: AtomicU64,
        spawns: AtomicU64,
        attaches: AtomicU64,
        terminates: AtomicU64,
        fail_spawn: AtomicBool,
    }

    #[async_trait]
    impl ProcessLauncher for MockLauncher {
        async fn spawn(&self, _brick: &BrickSpec, _port: u16) -> Result<ProcessId> {
            if self.fail_spawn.load(Ordering::SeqCst) {
                return Err(Error::ProcessLaunchFailed("mock spawn failure".into()));
            }
            self.spawns.fetch_add(1, Ordering::SeqCst);
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
        }

        async fn attach(&self, _process: ProcessId, _brick: &BrickSpec) -> Result<()> {
            self.attaches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn detach(&self, _process: ProcessId, _brick: &BrickSpec) -> Result<()> {
            Ok(())
        }

        async fn terminate(&self, _process: ProcessId, _graceful: bool) -> Result<()> {
            self.terminates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn spec(n: usize) -> BrickSpec {
        BrickSpec {
            volume: "vol1".to_string(),
            brick_id: format!("vol1-client-{}", n),
            path: format!("/data/brick{}", n),
        }
    }

    fn supervisor(mux: bool, max: usize) -> (BrickSupervisor, Arc<MockLauncher>) {
        let launcher = Arc::new(MockLauncher::default());
        let sup = BrickSupervisor::new(launcher.clone(), 49152, 49252, mux, max);
        (sup, launcher)
    }

    #[tokio::test]
    async fn test_mux_process_count_is_ceil() {
        let (sup, launcher) = supervisor(true, 2);

        // 5 bricks at 2 per process: 3 workers
        for i in 0..5 {
            sup.start(&spec(i)).await.unwrap();
        }
        assert_eq!(sup.process_count().await, 3);
        assert_eq!(launcher.spawns.load(Ordering::SeqCst), 3);
        assert_eq!(launcher.attaches.load(Ordering::SeqCst), 2);

        // Stopping everything leaves no residual processes or ports
        for i in 0..5 {
            sup.stop(&spec(i), true).await.unwrap();
        }
        assert_eq!(sup.process_count().await, 0);
        assert_eq!(sup.ports_in_use(), 0);
        assert_eq!(launcher.terminates.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_mux_one_process_per_brick() {
        let (sup, launcher) = supervisor(false, 250);

        let p0 = sup.start(&spec(0)).await.unwrap();
        let p1 = sup.start(&spec(1)).await.unwrap();
        assert_ne!(p0, p1);
        assert_eq!(sup.process_count().await, 2);
        assert_eq!(launcher.attaches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (sup, launcher) = supervisor(false, 250);
        let first = sup.start(&spec(0)).await.unwrap();
        let second = sup.start(&spec(0)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(launcher.spawns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_port_and_stops() {
        let (sup, launcher) = supervisor(false, 250);
        launcher.fail_spawn.store(true, Ordering::SeqCst);

        let err = sup.start(&spec(0)).await;
        assert!(matches!(err, Err(Error::ProcessLaunchFailed(_))));
        assert_eq!(sup.status("vol1-client-0").await, BrickStatus::Stopped);
        assert_eq!(sup.ports_in_use(), 0);

        // The failed port is reusable
        launcher.fail_spawn.store(false, Ordering::SeqCst);
        assert_eq!(sup.start(&spec(0)).await.unwrap(), 49152);
    }

    #[tokio::test]
    async fn test_stop_non_running_is_noop() {
        let (sup, _) = supervisor(false, 250);
        sup.stop(&spec(0), true).await.unwrap();
        assert_eq!(sup.status("vol1-client-0").await, BrickStatus::Stopped);
    }

    #[tokio::test]
    async fn test_restart() {
        let (sup, launcher) = supervisor(false, 250);
        sup.start(&spec(0)).await.unwrap();
        let port = sup.restart(&spec(0)).await.unwrap();
        assert_eq!(sup.status("vol1-client-0").await, BrickStatus::Started);
        assert_eq!(sup.running_port("vol1-client-0").await, Some(port));
        assert_eq!(launcher.spawns.load(Ordering::SeqCst), 2);
        assert_eq!(launcher.terminates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mux_respects_capacity_after_stops() {
        let (sup, _) = supervisor(true, 2);
        for i in 0..4 {
            sup.start(&spec(i)).await.unwrap();
        }
        assert_eq!(sup.process_count().await, 2);

        // Freeing one slot lets the next start attach instead of spawning
        sup.stop(&spec(0), true).await.unwrap();
        sup.start(&spec(4)).await.unwrap();
        assert_eq!(sup.process_count().await, 2);
    }
}
