//! Request/response correlation over a [`HandshakeStream`].
//!
//! Outgoing requests get a fresh numeric id and a oneshot slot in the pending
//! table. Incoming payloads either settle a slot (responses) or are handed
//! back to the caller (requests and notifications from the plugin).

use crate::error::{BrokerError, BrokerResult};
use crate::stream::HandshakeStream;
use corral_proto::{RpcError, RpcId, RpcKind, RpcMessage};
use corral_types::JobId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

type Slot = oneshot::Sender<BrokerResult<Value>>;

#[derive(Default)]
struct Pending {
    slots: HashMap<RpcId, Slot>,
    closed: bool,
}

/// Correlates calls to one job with their responses.
pub struct RpcClient {
    job_id: JobId,
    stream: Arc<HandshakeStream>,
    pending: Mutex<Pending>,
    next_id: AtomicI64,
}

impl RpcClient {
    pub fn new(job_id: JobId, stream: Arc<HandshakeStream>) -> Self {
        Self {
            job_id,
            stream,
            pending: Mutex::new(Pending::default()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn stream(&self) -> &Arc<HandshakeStream> {
        &self.stream
    }

    /// Number of calls awaiting a response.
    pub fn pending_count(&self) -> usize {
        crate::lock(&self.pending).slots.len()
    }

    /// Sends a request and waits up to `deadline` for its response.
    ///
    /// Fails with [`BrokerError::CallTimeout`] when the deadline passes and with
    /// [`BrokerError::Terminated`] when the client is cancelled first. Dropping
    /// the returned future abandons only this call.
    pub async fn send_request(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> BrokerResult<Value> {
        let (tx, rx) = oneshot::channel();
        let id = self.register(tx)?;
        let _guard = PendingGuard {
            client: self,
            id: id.clone(),
        };

        let request = RpcMessage::request(id.clone(), method, params);
        self.stream.write(serde_json::to_value(&request)?)?;
        trace!(job_id = %self.job_id, %id, method, "request sent");

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BrokerError::Terminated(self.job_id)),
            Err(_) => Err(BrokerError::CallTimeout {
                job_id: self.job_id,
                method: method.to_string(),
                timeout_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Sends a notification; no response is expected.
    pub fn notify(&self, method: &str, params: Value) -> BrokerResult<()> {
        let message = RpcMessage::notification(method, params);
        self.stream.write(serde_json::to_value(&message)?)
    }

    /// Answers a request the plugin sent to the host.
    pub fn respond(&self, id: RpcId, outcome: Result<Value, RpcError>) -> BrokerResult<()> {
        let message = match outcome {
            Ok(result) => RpcMessage::success(id, result),
            Err(error) => RpcMessage::failure(id, error),
        };
        self.stream.write(serde_json::to_value(&message)?)
    }

    /// Routes one application payload.
    ///
    /// Responses settle their pending call and yield `None`. Requests and
    /// notifications are returned for the caller to dispatch. Anything else is
    /// dropped.
    pub fn handle_payload(&self, payload: Value) -> Option<RpcMessage> {
        let message = match RpcMessage::from_value(payload) {
            Ok(message) => message,
            Err(e) => {
                debug!(job_id = %self.job_id, error = %e, "dropping non-rpc payload");
                return None;
            }
        };

        match message.kind() {
            RpcKind::Request | RpcKind::Notification => Some(message),
            RpcKind::Response => {
                let id = message.id.clone()?;
                let slot = crate::lock(&self.pending).slots.remove(&id);
                match slot {
                    Some(slot) => {
                        // The caller may have given up already.
                        let _ = slot.send(message.into_outcome().map_err(BrokerError::Rpc));
                    }
                    None => debug!(job_id = %self.job_id, %id, "response for unknown call"),
                }
                None
            }
            RpcKind::Invalid => {
                debug!(job_id = %self.job_id, "dropping payload with neither id nor method");
                None
            }
        }
    }

    /// Fails every pending call with `reason()` and refuses new ones.
    pub fn cancel_all(&self, reason: impl Fn() -> BrokerError) -> usize {
        let slots: Vec<Slot> = {
            let mut pending = crate::lock(&self.pending);
            pending.closed = true;
            pending.slots.drain().map(|(_, slot)| slot).collect()
        };
        let count = slots.len();
        for slot in slots {
            let _ = slot.send(Err(reason()));
        }
        if count > 0 {
            debug!(job_id = %self.job_id, count, "cancelled pending calls");
        }
        count
    }

    fn register(&self, slot: Slot) -> BrokerResult<RpcId> {
        let mut pending = crate::lock(&self.pending);
        if pending.closed {
            return Err(BrokerError::Terminated(self.job_id));
        }
        let id = loop {
            let candidate = RpcId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
            if !pending.slots.contains_key(&candidate) {
                break candidate;
            }
        };
        pending.slots.insert(id.clone(), slot);
        Ok(id)
    }
}

/// Removes the caller's slot when its call future finishes or is dropped.
struct PendingGuard<'a> {
    client: &'a RpcClient,
    id: RpcId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        crate::lock(&self.client.pending).slots.remove(&self.id);
    }
}
