//! Broker lifecycle and traffic events, delivered on a broadcast channel.

use crate::transport::TransportKind;
use corral_proto::RpcMessage;
use corral_types::JobId;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Why a job was terminated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TerminationReason {
    /// The host asked for it.
    Requested,
    /// The broker is shutting down every job.
    Shutdown,
    /// Initialization did not complete in time.
    HandshakeTimeout,
    /// Initialization was abandoned by its caller.
    InitCancelled,
    /// A call exceeded its deadline.
    CallTimeout,
    /// The plugin's side of the transport went away.
    TransportClosed,
    /// The plugin reported an error it could not handle.
    UnhandledError { message: String },
}

impl TerminationReason {
    /// Whether the job never became ready.
    pub fn is_init_failure(&self) -> bool {
        matches!(self, Self::HandshakeTimeout | Self::InitCancelled)
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("requested"),
            Self::Shutdown => f.write_str("shutdown"),
            Self::HandshakeTimeout => f.write_str("handshake timeout"),
            Self::InitCancelled => f.write_str("initialization cancelled"),
            Self::CallTimeout => f.write_str("call timeout"),
            Self::TransportClosed => f.write_str("transport closed"),
            Self::UnhandledError { message } => write!(f, "unhandled error: {message}"),
        }
    }
}

/// Something observable happened in the broker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerEvent {
    /// A job finished its handshake.
    JobReady { job_id: JobId, kind: TransportKind },
    /// A job was torn down. `release_error` is set when closing its
    /// transport failed.
    JobTerminated {
        job_id: JobId,
        reason: TerminationReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        release_error: Option<String>,
    },
    /// The plugin sent the host a request.
    OutboundRequest { job_id: JobId, request: RpcMessage },
    /// The host answered a plugin request.
    OutboundResponse { job_id: JobId, response: RpcMessage },
    /// The plugin sent a notification.
    Notification {
        job_id: JobId,
        method: String,
        params: Value,
    },
    /// The plugin reported an unhandled error.
    UnhandledError { job_id: JobId, error: Value },
}

impl BrokerEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::JobReady { job_id, .. }
            | Self::JobTerminated { job_id, .. }
            | Self::OutboundRequest { job_id, .. }
            | Self::OutboundResponse { job_id, .. }
            | Self::Notification { job_id, .. }
            | Self::UnhandledError { job_id, .. } => *job_id,
        }
    }
}
