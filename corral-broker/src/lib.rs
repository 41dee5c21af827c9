//! Execution broker for corral plugins.
//!
//! Runs each plugin job in an isolated runtime reached through a
//! [`Transport`], establishes a handshaked [`HandshakeStream`] over it, and
//! correlates calls with an [`RpcClient`]. The [`ExecutionService`] owns the
//! job registry, applies per-origin admission through an [`AdmissionQueue`],
//! and terminates any job that misses a call deadline.

mod admission;
mod config;
mod error;
mod events;
mod gate;
mod handler;
mod job;
mod rpc;
mod service;
mod stream;
pub mod transport;

pub use admission::{AdmissionPermit, AdmissionQueue};
pub use config::BrokerConfig;
pub use error::{BrokerError, BrokerResult};
pub use events::{BrokerEvent, TerminationReason};
pub use gate::{AllowAll, PermissionGate};
pub use handler::{HostRequestHandler, MethodNotFound};
pub use job::{Job, JobInfo, JobStatus};
pub use rpc::RpcClient;
pub use service::{ExecutionService, ExecutionServiceBuilder, PING_METHOD};
pub use stream::{HandshakeState, HandshakeStream};
pub use transport::{
    ChannelTransport, OpenedTransport, Transport, TransportConfig, TransportFactory, TransportKind,
};

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Locks `mutex`, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read-locks `rwlock`, recovering the data if a writer panicked.
pub(crate) fn read<T>(rwlock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(PoisonError::into_inner)
}

/// Write-locks `rwlock`, recovering the data if a writer panicked.
pub(crate) fn write<T>(rwlock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(PoisonError::into_inner)
}
