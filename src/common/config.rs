//! Configuration for the volmand daemon

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Search order: `$VOLMAND_CONFIG`, then `./volmand.toml`. Environment
    /// variables prefixed `VOLMAND_` override file values. Missing files fall
    /// back to defaults; CLI flags are merged on top by the binary.
    pub fn load() -> Self {
        let path = std::env::var("VOLMAND_CONFIG").unwrap_or_else(|_| "volmand.toml".to_string());

        let builder = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(config::Environment::with_prefix("VOLMAND").separator("__"));

        match builder.build().and_then(|c| c.try_deserialize()) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!("Failed to load config ({}), using defaults", e);
                Config::default()
            }
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for the admin HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Bind address for peer management gRPC
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,

    /// Working directory (metadata store, run state)
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,

    /// First port handed out to brick worker processes
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Last port handed out to brick worker processes
    #[serde(default = "default_max_port")]
    pub max_port: u16,

    /// Per-peer RPC deadline (seconds) for each transaction phase
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,

    /// Age (seconds) after which an unreleased cluster lock may be reaped
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,

    /// Interval (seconds) between lock staleness sweeps
    #[serde(default = "default_reaper_interval")]
    pub lock_reaper_interval_secs: u64,

    /// Interval (seconds) between reconciling handshakes with known peers
    #[serde(default = "default_handshake_interval")]
    pub handshake_interval_secs: u64,

    /// Multiplex several bricks into one worker process
    #[serde(default)]
    pub brick_mux_enabled: bool,

    /// Member cap per multiplexed worker process
    #[serde(default = "default_max_bricks_per_process")]
    pub max_bricks_per_process: usize,

    /// Worker program executed for each brick process
    #[serde(default = "default_brick_program")]
    pub brick_program: PathBuf,
}

fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:24007".parse().unwrap()
}
fn default_grpc_addr() -> SocketAddr {
    "0.0.0.0:24008".parse().unwrap()
}
fn default_workdir() -> PathBuf {
    PathBuf::from("/var/lib/volmand")
}
fn default_base_port() -> u16 {
    49152
}
fn default_max_port() -> u16 {
    60999
}
fn default_rpc_timeout() -> u64 {
    30
}
fn default_lock_timeout() -> u64 {
    180
}
fn default_reaper_interval() -> u64 {
    30
}
fn default_handshake_interval() -> u64 {
    30
}
fn default_max_bricks_per_process() -> usize {
    250
}
fn default_brick_program() -> PathBuf {
    PathBuf::from("volmand-brick")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            grpc_addr: default_grpc_addr(),
            workdir: default_workdir(),
            base_port: default_base_port(),
            max_port: default_max_port(),
            rpc_timeout_secs: default_rpc_timeout(),
            lock_timeout_secs: default_lock_timeout(),
            lock_reaper_interval_secs: default_reaper_interval(),
            handshake_interval_secs: default_handshake_interval(),
            brick_mux_enabled: false,
            max_bricks_per_process: default_max_bricks_per_process(),
            brick_program: default_brick_program(),
        }
    }
}

impl DaemonConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}
