//! Error types for the worker supervisor.

use thiserror::Error;

use crate::supervisor::WorkerId;

/// Errors that can occur while running a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The loopback listener could not be bound.
    #[error("failed to bind worker socket on {address}: {source}")]
    SocketBindFailure {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The runtime process could not be spawned.
    #[error("failed to spawn runtime {program:?}: {source}")]
    ProcessSpawnFailure {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The worker failed to start and can no longer accept messages.
    #[error("worker {0} is unavailable; it failed to start")]
    WorkerUnavailable(WorkerId),

    /// The connection to the runtime failed.
    #[error("transport error: {0}")]
    Transport(#[from] isoworker_transport::TransportError),

    /// A message could not be encoded, or a port could not be transferred.
    #[error("structure error: {0}")]
    Structure(#[from] isoworker_structure::Error),

    /// Worker options could not be parsed.
    #[error("invalid worker options: {0}")]
    Config(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;
