//! One running plugin instance and its lifecycle status.

use crate::error::BrokerResult;
use crate::rpc::RpcClient;
use crate::stream::HandshakeStream;
use crate::transport::{Transport, TransportKind};
use chrono::{DateTime, Utc};
use corral_types::JobId;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Lifecycle of a job. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Uninitialized,
    Initializing,
    Ready,
    Terminating,
    Terminated,
}

impl JobStatus {
    /// Whether `self -> next` is a legal transition.
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Uninitialized, Initializing) | (Initializing, Ready) => true,
            (Uninitialized | Initializing | Ready, Terminating) => true,
            (Terminating, Terminated) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self >= JobStatus::Terminating
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        })
    }
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobInfo {
    pub id: JobId,
    pub kind: TransportKind,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub pending_calls: usize,
}

/// A plugin instance: its transport, stream, RPC client and status.
pub struct Job {
    id: JobId,
    transport: Arc<dyn Transport>,
    rpc: Arc<RpcClient>,
    status: watch::Sender<JobStatus>,
    created_at: DateTime<Utc>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

impl Job {
    pub(crate) fn new(id: JobId, transport: Arc<dyn Transport>, rpc: Arc<RpcClient>) -> Self {
        Self {
            id,
            transport,
            rpc,
            status: watch::Sender::new(JobStatus::Uninitialized),
            created_at: Utc::now(),
            receive_task: Mutex::new(None),
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn status(&self) -> JobStatus {
        *self.status.borrow()
    }

    /// Resolves once the job is terminating or terminated.
    pub async fn wait_terminal(&self) {
        let mut rx = self.status.subscribe();
        let _ = rx.wait_for(|status| status.is_terminal()).await;
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn stream(&self) -> &Arc<HandshakeStream> {
        self.rpc.stream()
    }

    pub fn rpc(&self) -> &Arc<RpcClient> {
        &self.rpc
    }

    pub fn info(&self) -> JobInfo {
        JobInfo {
            id: self.id,
            kind: self.kind(),
            status: self.status(),
            created_at: self.created_at,
            pending_calls: self.rpc.pending_count(),
        }
    }

    /// Moves the status forward. Returns `false` and leaves it unchanged if
    /// the transition is not legal.
    pub(crate) fn advance(&self, next: JobStatus) -> bool {
        self.status.send_if_modified(|status| {
            if !status.can_advance_to(next) {
                if *status != next {
                    debug!(job_id = %self.id, from = %*status, to = %next, "ignored status transition");
                }
                return false;
            }
            debug!(job_id = %self.id, from = %*status, to = %next, "job status");
            *status = next;
            true
        })
    }

    pub(crate) fn set_receive_task(&self, handle: JoinHandle<()>) {
        if let Some(previous) = crate::lock(&self.receive_task).replace(handle) {
            warn!(job_id = %self.id, "replacing receive task");
            previous.abort();
        }
    }

    /// Stops the receive task and closes the transport. Runs at most once.
    pub(crate) async fn release(&self) -> BrokerResult<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(task) = crate::lock(&self.receive_task).take() {
            task.abort();
        }
        self.transport.close().await
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("status", &self.status())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}
