//! In-memory transports for testing.
//!
//! [`LoopbackFactory`] connects each job to a simulated plugin running on a
//! tokio task. The simulated plugin speaks the real handshake and answers
//! requests through a responder closure.

use super::{ChannelTransport, OpenedTransport, Transport, TransportConfig, TransportFactory, TransportKind};
use crate::error::{BrokerError, BrokerResult};
use crate::stream::HandshakeStream;
use async_trait::async_trait;
use corral_proto::{HOST_STREAM, PLUGIN_STREAM, RpcError, RpcKind, RpcMessage};
use corral_types::JobId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Computes the simulated plugin's answer to a request. `None` means never answer.
pub type Responder = Arc<dyn Fn(&RpcMessage) -> Option<Result<Value, RpcError>> + Send + Sync>;

#[derive(Clone)]
enum PeerMode {
    Respond(Responder),
    /// Never sends SYN, so the handshake cannot complete.
    Silent,
}

#[derive(Debug, Default)]
struct Counters {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// Factory whose jobs talk to simulated in-process plugins.
#[derive(Clone)]
pub struct LoopbackFactory {
    mode: PeerMode,
    counters: Arc<Counters>,
    peers: Arc<Mutex<HashMap<JobId, LoopbackPeer>>>,
}

impl LoopbackFactory {
    /// Plugins answer every request with `responder`.
    pub fn new(
        responder: impl Fn(&RpcMessage) -> Option<Result<Value, RpcError>> + Send + Sync + 'static,
    ) -> Self {
        Self::with_mode(PeerMode::Respond(Arc::new(responder)))
    }

    /// Plugins answer `ping` with `"pong"` and `echo` with its params.
    pub fn echo() -> Self {
        Self::new(|request| {
            let method = request.method.as_deref().unwrap_or_default();
            Some(match method {
                "ping" => Ok(Value::String("pong".into())),
                "echo" => Ok(request.params.clone().unwrap_or(Value::Null)),
                other => Err(RpcError::method_not_found(other)),
            })
        })
    }

    /// Plugins complete the handshake but never answer.
    pub fn unresponsive() -> Self {
        Self::new(|_| None)
    }

    /// Plugins never start the handshake.
    pub fn silent() -> Self {
        Self::with_mode(PeerMode::Silent)
    }

    fn with_mode(mode: PeerMode) -> Self {
        Self {
            mode,
            counters: Arc::new(Counters::default()),
            peers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of transports opened.
    pub fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    /// Number of `close` calls across all transports.
    pub fn closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }

    /// The simulated plugin behind `job_id`, until its transport is closed.
    pub fn peer(&self, job_id: JobId) -> Option<LoopbackPeer> {
        crate::lock(&self.peers).get(&job_id).cloned()
    }
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn open(&self, job_id: JobId, config: &TransportConfig) -> BrokerResult<OpenedTransport> {
        let kind = config.kind();
        let (host_side, plugin_inbound) = ChannelTransport::pair(kind);
        let (plugin_side, host_inbound) = ChannelTransport::pair(kind);
        let plugin_side = Arc::new(plugin_side);

        let (stream, responder) = match &self.mode {
            PeerMode::Respond(responder) => {
                let stream = HandshakeStream::new(
                    PLUGIN_STREAM,
                    HOST_STREAM,
                    Arc::clone(&plugin_side) as Arc<dyn Transport>,
                )?;
                (Some(Arc::new(stream)), Some(Arc::clone(responder)))
            }
            PeerMode::Silent => (None, None),
        };

        let (observed_tx, observed_rx) = mpsc::unbounded_channel();
        let peer = LoopbackPeer {
            job_id,
            stream: stream.clone(),
            raw: Arc::clone(&plugin_side),
            observed: Arc::new(tokio::sync::Mutex::new(observed_rx)),
        };
        crate::lock(&self.peers).insert(job_id, peer);
        tokio::spawn(run_peer(plugin_inbound, stream, responder, observed_tx));

        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(OpenedTransport {
            transport: Arc::new(LoopbackTransport {
                job_id,
                channel: host_side,
                counters: Arc::clone(&self.counters),
                peers: Arc::clone(&self.peers),
            }),
            inbound: host_inbound,
        })
    }
}

struct LoopbackTransport {
    job_id: JobId,
    channel: ChannelTransport,
    counters: Arc<Counters>,
    peers: Arc<Mutex<HashMap<JobId, LoopbackPeer>>>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn kind(&self) -> TransportKind {
        self.channel.kind()
    }

    fn send(&self, message: Value) -> BrokerResult<()> {
        self.channel.send(message)
    }

    async fn close(&self) -> BrokerResult<()> {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        crate::lock(&self.peers).remove(&self.job_id);
        self.channel.close().await
    }
}

/// Test handle on a simulated plugin.
#[derive(Clone)]
pub struct LoopbackPeer {
    job_id: JobId,
    stream: Option<Arc<HandshakeStream>>,
    raw: Arc<ChannelTransport>,
    observed: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<RpcMessage>>>,
}

impl LoopbackPeer {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Writes an application payload through the plugin's stream.
    pub fn send_payload(&self, payload: Value) -> BrokerResult<()> {
        match &self.stream {
            Some(stream) => stream.write(payload),
            None => Err(BrokerError::TransportFailure("silent peer has no stream".into())),
        }
    }

    /// Writes a raw message, bypassing the plugin's stream.
    pub fn send_raw(&self, raw: Value) -> BrokerResult<()> {
        self.raw.send(raw)
    }

    /// Next RPC message the plugin received from the host.
    pub async fn next_message(&self) -> Option<RpcMessage> {
        self.observed.lock().await.recv().await
    }

    /// Simulates the plugin going away.
    pub fn disconnect(&self) {
        self.raw.shutdown();
    }
}

async fn run_peer(
    mut inbound: mpsc::UnboundedReceiver<Value>,
    stream: Option<Arc<HandshakeStream>>,
    responder: Option<Responder>,
    observed: mpsc::UnboundedSender<RpcMessage>,
) {
    while let Some(raw) = inbound.recv().await {
        let Some(stream) = &stream else {
            continue;
        };
        let Some(payload) = stream.receive(raw) else {
            continue;
        };
        let Ok(message) = RpcMessage::from_value(payload) else {
            continue;
        };

        if message.kind() == RpcKind::Request {
            if let (Some(responder), Some(id)) = (&responder, message.id.clone()) {
                if let Some(outcome) = responder(&message) {
                    let reply = match outcome {
                        Ok(result) => RpcMessage::success(id, result),
                        Err(error) => RpcMessage::failure(id, error),
                    };
                    if let Ok(reply) = serde_json::to_value(&reply) {
                        let _ = stream.write(reply);
                    }
                }
            }
        }
        let _ = observed.send(message);
    }
}

/// Factory that refuses every job.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingFactory;

#[async_trait]
impl TransportFactory for FailingFactory {
    async fn open(&self, _job_id: JobId, _config: &TransportConfig) -> BrokerResult<OpenedTransport> {
        Err(BrokerError::TransportFailure("transport refused".into()))
    }
}
