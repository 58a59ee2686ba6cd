//! Error types for volmand

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Lock Errors ===
    #[error("Resource {resource} is locked by {owner}")]
    LockBusy { resource: String, owner: Uuid },

    #[error("Lock on {resource} was force-released after staleness timeout")]
    LockStale { resource: String },

    #[error("No lock held on {resource} for this transaction")]
    LockNotHeld { resource: String },

    // === Transaction Errors ===
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Quorum not met: {active} of {total} peers reachable")]
    QuorumNotMet { active: usize, total: usize },

    #[error("Peer {0} unreachable")]
    PeerUnreachable(String),

    #[error("Peer {peer} rejected the request: {reason}")]
    PeerRejected { peer: String, reason: String },

    #[error("Commit failed on {peer}: {reason}")]
    MutationFailed { peer: String, reason: String },

    #[error("Volume {volume} diverged: version {version}, local checksum {local_cksum}, remote checksum {remote_cksum}")]
    DivergenceDetected {
        volume: String,
        version: u64,
        local_cksum: u32,
        remote_cksum: u32,
    },

    // === Brick Supervisor Errors ===
    #[error("Failed to launch worker process: {0}")]
    ProcessLaunchFailed(String),

    #[error("No free port in range {base}-{max}")]
    PortExhausted { base: u16, max: u16 },

    // === Metadata Errors ===
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("RocksDB error: {0}")]
    Store(#[from] rocksdb::Error),

    #[error("Metadata corrupted: {0}")]
    MetadataCorrupted(String),

    // === Network Errors ===
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Lock and validation failures are never retried automatically; only
    /// transport-level failures qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::ConnectionFailed(_) | Error::PeerUnreachable(_)
        )
    }

    /// Convert to gRPC status for RPC responses
    pub fn to_grpc_status(&self) -> tonic::Status {
        use tonic::Code;
        match self {
            Error::NotFound(_) => tonic::Status::new(Code::NotFound, self.to_string()),
            Error::AlreadyExists(_) => tonic::Status::new(Code::AlreadyExists, self.to_string()),
            Error::LockBusy { .. } => tonic::Status::new(Code::Aborted, self.to_string()),
            Error::ValidationFailed(_) | Error::InvalidConfig(_) => {
                tonic::Status::new(Code::InvalidArgument, self.to_string())
            }
            Error::QuorumNotMet { .. } => {
                tonic::Status::new(Code::FailedPrecondition, self.to_string())
            }
            Error::Timeout(_) => tonic::Status::new(Code::DeadlineExceeded, self.to_string()),
            Error::Grpc(status) => status.clone(),
            _ => tonic::Status::new(Code::Internal, self.to_string()),
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) | Error::LockBusy { .. } => StatusCode::CONFLICT,
            Error::ValidationFailed(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::QuorumNotMet { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::PeerUnreachable(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
