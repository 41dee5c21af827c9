//! Handshaking, corking message stream over a raw [`Transport`].
//!
//! Each side announces itself with `SYN` as soon as it exists and answers
//! every `SYN` it sees with `ACK`. A side is established when it receives an
//! `ACK`; if it never saw the peer's `SYN` it sends one extra `ACK` so the
//! peer can establish too. This converges whichever side comes up first.
//!
//! Writes issued before establishment are corked and flushed in order, before
//! any later write, the moment the stream is established.

use crate::error::BrokerResult;
use crate::transport::Transport;
use corral_proto::{ControlMessage, Envelope, EnvelopeData};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Handshake progress of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeState {
    AwaitingHandshake,
    Established,
}

#[derive(Default)]
struct StreamState {
    established: bool,
    have_syn: bool,
    corked: VecDeque<Value>,
}

/// One endpoint of a host/plugin channel.
pub struct HandshakeStream {
    local_name: String,
    target_name: String,
    transport: Arc<dyn Transport>,
    state: Mutex<StreamState>,
    established: watch::Sender<bool>,
}

impl HandshakeStream {
    /// Creates the stream and sends the opening `SYN`.
    pub fn new(
        local_name: impl Into<String>,
        target_name: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> BrokerResult<Self> {
        let stream = Self {
            local_name: local_name.into(),
            target_name: target_name.into(),
            transport,
            state: Mutex::new(StreamState::default()),
            established: watch::Sender::new(false),
        };
        stream.send_control(ControlMessage::Syn)?;
        Ok(stream)
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub fn state(&self) -> HandshakeState {
        if self.is_established() {
            HandshakeState::Established
        } else {
            HandshakeState::AwaitingHandshake
        }
    }

    pub fn is_established(&self) -> bool {
        crate::lock(&self.state).established
    }

    /// Number of writes waiting for establishment.
    pub fn corked_len(&self) -> usize {
        crate::lock(&self.state).corked.len()
    }

    /// Resolves once the stream is established.
    pub async fn wait_established(&self) {
        let mut rx = self.established.subscribe();
        // The sender lives as long as `self`, so this cannot observe a close.
        let _ = rx.wait_for(|established| *established).await;
    }

    /// Sends an application payload, or corks it until established.
    pub fn write(&self, payload: Value) -> BrokerResult<()> {
        let mut state = crate::lock(&self.state);
        if state.established {
            self.send_envelope(Envelope::payload(&self.target_name, payload))
        } else {
            state.corked.push_back(payload);
            Ok(())
        }
    }

    /// Processes one raw inbound message.
    ///
    /// Returns the application payload to deliver, if any. Control traffic,
    /// malformed messages, messages addressed to another stream, and payloads
    /// arriving before establishment all yield `None`.
    pub fn receive(&self, raw: Value) -> Option<Value> {
        let envelope = match Envelope::from_value(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(stream = %self.local_name, error = %e, "dropping malformed message");
                return None;
            }
        };
        if envelope.name != self.local_name {
            debug!(stream = %self.local_name, to = %envelope.name, "dropping message for another stream");
            return None;
        }

        let mut state = crate::lock(&self.state);
        if state.established {
            return Some(envelope.data.into_value());
        }

        match envelope.data {
            EnvelopeData::Control(ControlMessage::Syn) => {
                state.have_syn = true;
                self.send_or_log(ControlMessage::Ack);
            }
            EnvelopeData::Control(ControlMessage::Ack) => {
                state.established = true;
                if !state.have_syn {
                    self.send_or_log(ControlMessage::Ack);
                }
                for payload in state.corked.drain(..) {
                    if let Err(e) = self.send_envelope(Envelope::payload(&self.target_name, payload)) {
                        warn!(stream = %self.local_name, error = %e, "failed to flush corked write");
                    }
                }
                drop(state);
                debug!(stream = %self.local_name, "stream established");
                self.established.send_replace(true);
            }
            EnvelopeData::Payload(_) => {
                debug!(stream = %self.local_name, "dropping payload received before handshake");
            }
        }
        None
    }

    fn send_control(&self, control: ControlMessage) -> BrokerResult<()> {
        self.send_envelope(Envelope::control(&self.target_name, control))
    }

    fn send_or_log(&self, control: ControlMessage) {
        if let Err(e) = self.send_control(control) {
            warn!(stream = %self.local_name, control = control.as_str(), error = %e, "failed to send control message");
        }
    }

    fn send_envelope(&self, envelope: Envelope) -> BrokerResult<()> {
        self.transport.send(envelope.into_value())
    }
}

impl fmt::Debug for HandshakeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeStream")
            .field("local_name", &self.local_name)
            .field("target_name", &self.target_name)
            .field("state", &self.state())
            .finish()
    }
}
