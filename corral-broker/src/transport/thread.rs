//! In-process transport: a registered entry point runs on its own OS thread
//! and exchanges raw messages with the host over unbounded channels.

use super::{ChannelTransport, OpenedTransport, Transport, TransportConfig, TransportFactory, TransportKind};
use crate::error::{BrokerError, BrokerResult};
use async_trait::async_trait;
use corral_types::JobId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Code run on the plugin thread. Returns when the endpoint closes.
pub type ThreadEntry = Arc<dyn Fn(ThreadEndpoint) + Send + Sync>;

/// Which registered entry point to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadConfig {
    pub entry: String,
}

impl ThreadConfig {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
        }
    }
}

/// The plugin side of a thread transport.
///
/// `recv` blocks the calling thread; it must not be used from inside an async
/// runtime.
pub struct ThreadEndpoint {
    job_id: JobId,
    inbound: mpsc::UnboundedReceiver<Value>,
    outbound: Arc<ChannelTransport>,
}

impl ThreadEndpoint {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Blocks until the host sends a message. `None` once the host closed the job.
    pub fn recv(&mut self) -> Option<Value> {
        self.inbound.blocking_recv()
    }

    /// Transport toward the host, for building a plugin-side stream.
    pub fn transport(&self) -> Arc<ChannelTransport> {
        Arc::clone(&self.outbound)
    }
}

impl fmt::Debug for ThreadEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadEndpoint")
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

/// Runs registered entry points on dedicated threads.
#[derive(Default)]
pub struct ThreadTransportFactory {
    entries: RwLock<HashMap<String, ThreadEntry>>,
}

impl ThreadTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `entry` under `name`, replacing any previous registration.
    pub fn register(&self, name: impl Into<String>, entry: ThreadEntry) {
        let name = name.into();
        debug!(entry = %name, "registered thread entry");
        crate::write(&self.entries).insert(name, entry);
    }

    fn entry(&self, name: &str) -> Option<ThreadEntry> {
        crate::read(&self.entries).get(name).cloned()
    }
}

#[async_trait]
impl TransportFactory for ThreadTransportFactory {
    async fn open(&self, job_id: JobId, config: &TransportConfig) -> BrokerResult<OpenedTransport> {
        let TransportConfig::Thread(config) = config else {
            return Err(BrokerError::TransportFailure(format!(
                "thread factory cannot open {} transports",
                config.kind()
            )));
        };
        let entry = self.entry(&config.entry).ok_or_else(|| {
            BrokerError::TransportFailure(format!("unknown thread entry '{}'", config.entry))
        })?;

        let (host_side, plugin_inbound) = ChannelTransport::pair(TransportKind::Thread);
        let (plugin_side, host_inbound) = ChannelTransport::pair(TransportKind::Thread);
        let endpoint = ThreadEndpoint {
            job_id,
            inbound: plugin_inbound,
            outbound: Arc::new(plugin_side),
        };

        // Dropping the handle detaches the thread.
        std::thread::Builder::new()
            .name(format!("corral-job-{job_id}"))
            .spawn(move || entry(endpoint))
            .map_err(|e| BrokerError::TransportFailure(format!("failed to spawn thread: {e}")))?;

        info!(job_id = %job_id, entry = %config.entry, "started plugin thread");

        Ok(OpenedTransport {
            transport: Arc::new(ThreadTransport {
                job_id,
                channel: host_side,
                detached: AtomicBool::new(false),
            }),
            inbound: host_inbound,
        })
    }
}

/// Host handle to a plugin thread.
pub struct ThreadTransport {
    job_id: JobId,
    channel: ChannelTransport,
    detached: AtomicBool,
}

#[async_trait]
impl Transport for ThreadTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Thread
    }

    fn send(&self, message: Value) -> BrokerResult<()> {
        self.channel.send(message)
    }

    async fn close(&self) -> BrokerResult<()> {
        self.channel.shutdown();
        // Threads cannot be killed; the entry sees `recv() == None` and returns.
        if !self.detached.swap(true, Ordering::SeqCst) {
            debug!(job_id = %self.job_id, "detached plugin thread");
        }
        Ok(())
    }
}
