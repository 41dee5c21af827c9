//! Error types for the execution broker.

use crate::job::JobStatus;
use corral_proto::RpcError;
use corral_types::{JobId, Origin};
use thiserror::Error;

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors surfaced to broker callers.
///
/// A timed-out or terminated call may already have produced side effects
/// inside the plugin, so none of these are retried at this layer.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Initialization never reached an established channel.
    #[error("handshake timeout: job '{job_id}' not established within {timeout_ms}ms")]
    HandshakeTimeout { job_id: JobId, timeout_ms: u64 },

    /// Creating, using or tearing down the transport failed.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// A ready job did not answer in time. The job has been terminated.
    #[error("call timeout: job '{job_id}' did not answer '{method}' within {timeout_ms}ms")]
    CallTimeout {
        job_id: JobId,
        method: String,
        timeout_ms: u64,
    },

    /// The origin already has the maximum number of calls in flight.
    #[error("queue full: origin '{origin}' has {max} requests in flight")]
    QueueFull { origin: Origin, max: usize },

    /// A decrement without a matching increment.
    #[error("admission queue underflow for origin '{origin}'")]
    QueueUnderflow { origin: Origin },

    /// The permission gate rejected the call.
    #[error("unauthorized: origin '{origin}' may not call '{method}'")]
    Unauthorized { origin: Origin, method: String },

    /// The call was issued to, or interrupted by, a terminated job.
    #[error("job '{0}' was terminated")]
    Terminated(JobId),

    /// No job with this id was ever initialized (or it aged out of the tombstones).
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// The job exists but has not finished initializing.
    #[error("job '{job_id}' is not ready (status: {status})")]
    NotReady { job_id: JobId, status: JobStatus },

    /// A live job already uses this id.
    #[error("job already exists: {0}")]
    JobAlreadyExists(JobId),

    /// The plugin answered with an error object.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid broker configuration.
    #[error("config error: {0}")]
    Config(String),
}

impl BrokerError {
    /// Whether a caller may reasonably retry later.
    ///
    /// Only admission failures qualify: everything else either reached the
    /// plugin or describes a permanent condition.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }
}
