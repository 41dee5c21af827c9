//! Transport layer abstraction.
//!
//! A transport is the raw, per-job message primitive between the host and an
//! isolated runtime: `send` one JSON value, receive JSON values from an mpsc
//! channel, `close` once. It guarantees nothing about readiness; the
//! [`HandshakeStream`](crate::HandshakeStream) layered on top does.
//!
//! The kind of isolation (child process, OS thread, sandboxed window, web
//! worker) is selected with a [`TransportConfig`] value handed to a
//! [`TransportFactory`]; the broker never depends on a concrete kind.

mod process;
mod thread;

pub mod mock;

pub use process::{ProcessConfig, ProcessTransport, ProcessTransportFactory};
pub use thread::{ThreadConfig, ThreadEndpoint, ThreadEntry, ThreadTransport, ThreadTransportFactory};

use crate::error::{BrokerError, BrokerResult};
use async_trait::async_trait;
use corral_types::JobId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// The isolation mechanism behind a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Sandboxed window or iframe.
    Window,
    /// Web-style worker.
    Worker,
    /// Separate OS process.
    Process,
    /// Separate OS thread in the host process.
    Thread,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Window => "window",
            Self::Worker => "worker",
            Self::Process => "process",
            Self::Thread => "thread",
        })
    }
}

/// Per-job transport selection, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TransportConfig {
    /// Spawn a child process and talk over its stdio.
    Process(ProcessConfig),
    /// Run a registered entry point on a dedicated thread.
    Thread(ThreadConfig),
    /// Host-defined transport, interpreted only by a custom factory.
    Custom {
        transport: TransportKind,
        #[serde(default)]
        options: Value,
    },
}

impl TransportConfig {
    /// The kind of transport this config asks for.
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Process(_) => TransportKind::Process,
            Self::Thread(_) => TransportKind::Thread,
            Self::Custom { transport, .. } => *transport,
        }
    }
}

/// Host-side handle to one job's raw channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which isolation mechanism this transport uses.
    fn kind(&self) -> TransportKind;

    /// Queues one raw message toward the isolated runtime.
    fn send(&self, message: Value) -> BrokerResult<()>;

    /// Tears down the runtime and its channel.
    async fn close(&self) -> BrokerResult<()>;
}

/// A freshly opened transport plus its receive side.
pub struct OpenedTransport {
    /// Send/close handle.
    pub transport: Arc<dyn Transport>,
    /// Raw messages from the isolated runtime. Closes when the runtime goes away.
    pub inbound: mpsc::UnboundedReceiver<Value>,
}

impl fmt::Debug for OpenedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedTransport")
            .field("kind", &self.transport.kind())
            .finish_non_exhaustive()
    }
}

/// Creates transports for new jobs.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Acquires the isolated runtime for `job_id`.
    async fn open(&self, job_id: JobId, config: &TransportConfig) -> BrokerResult<OpenedTransport>;
}

/// Transport over an in-memory unbounded channel.
///
/// Used on both sides of the thread transport and by the stdio worker; the
/// receiver half is handed to whoever drains outbound traffic.
pub struct ChannelTransport {
    kind: TransportKind,
    outbound: Mutex<Option<mpsc::UnboundedSender<Value>>>,
}

impl ChannelTransport {
    /// Creates a transport and the receiver that sees everything it sends.
    pub fn pair(kind: TransportKind) -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            kind,
            outbound: Mutex::new(Some(tx)),
        };
        (transport, rx)
    }

    /// Whether `close` has been called or the receiver is gone.
    pub fn is_closed(&self) -> bool {
        crate::lock(&self.outbound)
            .as_ref()
            .is_none_or(mpsc::UnboundedSender::is_closed)
    }

    /// Drops the sender so the receiving side observes end-of-stream.
    pub fn shutdown(&self) -> bool {
        crate::lock(&self.outbound).take().is_some()
    }
}

impl fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn send(&self, message: Value) -> BrokerResult<()> {
        let guard = crate::lock(&self.outbound);
        let Some(tx) = guard.as_ref() else {
            return Err(BrokerError::TransportFailure("channel closed".into()));
        };
        tx.send(message)
            .map_err(|_| BrokerError::TransportFailure("channel receiver dropped".into()))
    }

    async fn close(&self) -> BrokerResult<()> {
        self.shutdown();
        Ok(())
    }
}

/// Factory dispatching on the [`TransportConfig`] tag to the built-in
/// process and thread transports.
#[derive(Default)]
pub struct StandardTransportFactory {
    process: ProcessTransportFactory,
    thread: ThreadTransportFactory,
}

impl StandardTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a thread entry point under `name` (see [`ThreadConfig::entry`]).
    pub fn register_thread_entry(&self, name: impl Into<String>, entry: ThreadEntry) {
        self.thread.register(name, entry);
    }

    /// The thread factory, for registering more entries.
    pub fn threads(&self) -> &ThreadTransportFactory {
        &self.thread
    }
}

#[async_trait]
impl TransportFactory for StandardTransportFactory {
    async fn open(&self, job_id: JobId, config: &TransportConfig) -> BrokerResult<OpenedTransport> {
        match config {
            TransportConfig::Process(_) => self.process.open(job_id, config).await,
            TransportConfig::Thread(_) => self.thread.open(job_id, config).await,
            TransportConfig::Custom { transport, .. } => Err(BrokerError::TransportFailure(
                format!("no factory for {transport} transports"),
            )),
        }
    }
}
