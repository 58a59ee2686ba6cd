//! Worker process launching
//!
//! The supervisor drives brick workers through this trait so the lifecycle
//! logic stays independent of how processes are actually run. The OS
//! implementation spawns the configured worker program and talks to it over
//! a line-oriented control channel on stdin; attach/detach are the
//! out-of-band messages used for brick multiplexing.

use crate::common::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};

/// Opaque identifier of a running worker process
pub type ProcessId = u64;

/// Everything the worker needs to serve one brick
#[derive(Debug, Clone)]
pub struct BrickSpec {
    pub volume: String,
    pub brick_id: String,
    pub path: String,
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync + 'static {
    /// Launch a new worker serving `brick` on `port`
    async fn spawn(&self, brick: &BrickSpec, port: u16) -> Result<ProcessId>;

    /// Attach an additional brick to a running worker
    async fn attach(&self, process: ProcessId, brick: &BrickSpec) -> Result<()>;

    /// Detach a brick from a running worker without stopping it
    async fn detach(&self, process: ProcessId, brick: &BrickSpec) -> Result<()>;

    /// Stop a worker. Graceful termination asks the worker to drain and
    /// flush first; forced termination kills it outright.
    async fn terminate(&self, process: ProcessId, graceful: bool) -> Result<()>;
}

#[derive(Serialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
enum ControlMsg<'a> {
    Attach { brick_id: &'a str, volume: &'a str, path: &'a str },
    Detach { brick_id: &'a str },
    Drain,
}

struct Worker {
    child: Child,
    stdin: ChildStdin,
}

/// Launches real OS processes via the configured brick worker program
pub struct OsLauncher {
    program: PathBuf,
    graceful_timeout: Duration,
    next_id: AtomicU64,
    workers: tokio::sync::Mutex<HashMap<ProcessId, Worker>>,
}

impl OsLauncher {
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            graceful_timeout: Duration::from_secs(30),
            next_id: AtomicU64::new(1),
            workers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn send_control(&self, process: ProcessId, msg: ControlMsg<'_>) -> Result<()> {
        let mut workers = self.workers.lock().await;
        let worker = workers
            .get_mut(&process)
            .ok_or_else(|| Error::NotFound(format!("worker process {}", process)))?;
        let mut line = serde_json::to_vec(&msg)
            .map_err(|e| Error::Internal(format!("control message encode: {}", e)))?;
        line.push(b'\n');
        worker
            .stdin
            .write_all(&line)
            .await
            .map_err(|e| Error::ProcessLaunchFailed(format!("control channel write: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl ProcessLauncher for OsLauncher {
    async fn spawn(&self, brick: &BrickSpec, port: u16) -> Result<ProcessId> {
        let mut child = Command::new(&self.program)
            .arg("--brick-id")
            .arg(&brick.brick_id)
            .arg("--volume")
            .arg(&brick.volume)
            .arg("--path")
            .arg(&brick.path)
            .arg("--port")
            .arg(port.to_string())
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::ProcessLaunchFailed(format!("{}: {}", self.program.display(), e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::ProcessLaunchFailed("worker stdin unavailable".into()))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        tracing::info!(process = id, brick = %brick.brick_id, port, "worker spawned");
        self.workers
            .lock()
            .await
            .insert(id, Worker { child, stdin });
        Ok(id)
    }

    async fn attach(&self, process: ProcessId, brick: &BrickSpec) -> Result<()> {
        self.send_control(
            process,
            ControlMsg::Attach {
                brick_id: &brick.brick_id,
                volume: &brick.volume,
                path: &brick.path,
            },
        )
        .await
    }

    async fn detach(&self, process: ProcessId, brick: &BrickSpec) -> Result<()> {
        self.send_control(process, ControlMsg::Detach { brick_id: &brick.brick_id })
            .await
    }

    async fn terminate(&self, process: ProcessId, graceful: bool) -> Result<()> {
        if graceful {
            // Ask the worker to drain; ignore a dead control channel, the
            // wait below settles it either way
            let _ = self.send_control(process, ControlMsg::Drain).await;
        }

        let mut workers = self.workers.lock().await;
        let mut worker = workers
            .remove(&process)
            .ok_or_else(|| Error::NotFound(format!("worker process {}", process)))?;
        drop(workers);

        if graceful {
            match tokio::time::timeout(self.graceful_timeout, worker.child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(process, %status, "worker exited");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    tracing::warn!(process, error = %e, "wait on worker failed, killing");
                }
                Err(_) => {
                    tracing::warn!(process, "worker did not drain in time, killing");
                }
            }
        }

        worker
            .child
            .kill()
            .await
            .map_err(|e| Error::ProcessLaunchFailed(format!("kill worker {}: {}", process, e)))?;
        tracing::info!(process, "worker killed");
        Ok(())
    }
}
