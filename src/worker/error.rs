//! Worker-specific error types.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Errors surfaced to callers of the persistent and fallback paths.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// No ready worker to submit to.
    #[error("worker is not ready")]
    NotReady,

    /// A request with this identifier is already in flight.
    #[error("request id already pending: {0}")]
    DuplicateRequest(String),

    /// Failed to write to worker stdin.
    #[error("failed to write to worker: {0}")]
    WriteFailure(#[source] io::Error),

    /// The worker answered with an error for this request.
    #[error("worker error: {0}")]
    WorkerReported(String),

    /// No response within the deadline.
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The worker the request was issued against has exited.
    #[error("worker process exited")]
    WorkerClosed,

    /// The relay is shutting down.
    #[error("shutting down")]
    ShuttingDown,

    /// The one-shot fallback process failed or produced no output.
    #[error("fallback process failed: {0}")]
    Fallback(String),

    /// Failed to spawn a worker process.
    #[error("failed to spawn worker process: {0}")]
    SpawnFailed(#[source] io::Error),

    /// Failed to serialize request to JSON.
    #[error("failed to serialize request: {0}")]
    SerializeFailed(#[source] serde_json::Error),
}

impl WorkerError {
    /// Whether the persistent channel was merely unavailable, so the
    /// request can be retried on the one-shot path.
    pub fn is_recoverable_by_fallback(&self) -> bool {
        matches!(self, Self::NotReady | Self::WriteFailure(_))
    }

    /// Stable machine-readable name for the calling layer.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotReady => "not_ready",
            Self::DuplicateRequest(_) => "duplicate_request",
            Self::WriteFailure(_) => "write_failure",
            Self::WorkerReported(_) => "worker_error",
            Self::Timeout(_) => "timeout",
            Self::WorkerClosed => "worker_closed",
            Self::ShuttingDown => "shutting_down",
            Self::Fallback(_) => "fallback_error",
            Self::SpawnFailed(_) => "spawn_failed",
            Self::SerializeFailed(_) => "serialize_failed",
        }
    }
}

/// Why every pending request is being failed at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    WorkerClosed,
    ShuttingDown,
}

impl From<CloseReason> for WorkerError {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::WorkerClosed => Self::WorkerClosed,
            CloseReason::ShuttingDown => Self::ShuttingDown,
        }
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for WorkerError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        // Completion handles are only dropped unfired when the pending set is torn down.
        Self::WorkerClosed
    }
}
