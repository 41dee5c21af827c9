mod common;

use common::RecordingTransport;
use corral_broker::{HandshakeState, HandshakeStream};
use corral_proto::{HOST_STREAM, PLUGIN_STREAM};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::{Value, json};
use std::sync::Arc;

fn syn(to: &str) -> Value {
    json!({ "name": to, "data": "SYN" })
}

fn ack(to: &str) -> Value {
    json!({ "name": to, "data": "ACK" })
}

fn host_stream() -> (HandshakeStream, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::new());
    let stream = HandshakeStream::new(HOST_STREAM, PLUGIN_STREAM, transport.clone()).unwrap();
    (stream, transport)
}

/// Host/plugin stream pair whose outbound traffic is queued for manual delivery.
struct Link {
    host: HandshakeStream,
    plugin: HandshakeStream,
    host_out: Arc<RecordingTransport>,
    plugin_out: Arc<RecordingTransport>,
}

impl Link {
    fn new() -> Self {
        let host_out = Arc::new(RecordingTransport::new());
        let plugin_out = Arc::new(RecordingTransport::new());
        Self {
            host: HandshakeStream::new(HOST_STREAM, PLUGIN_STREAM, host_out.clone()).unwrap(),
            plugin: HandshakeStream::new(PLUGIN_STREAM, HOST_STREAM, plugin_out.clone()).unwrap(),
            host_out,
            plugin_out,
        }
    }

    /// Delivers one host→plugin message. Returns the payload the plugin surfaced.
    fn to_plugin(&self) -> Option<Option<Value>> {
        self.host_out.pop().map(|raw| self.plugin.receive(raw))
    }

    fn to_host(&self) -> Option<Option<Value>> {
        self.plugin_out.pop().map(|raw| self.host.receive(raw))
    }
}

// ── Opening ─────────────────────────────────────────────────────

#[test]
fn new_stream_sends_syn_to_target() {
    let (stream, transport) = host_stream();
    assert_eq!(transport.drain(), vec![syn(PLUGIN_STREAM)]);
    assert_eq!(stream.state(), HandshakeState::AwaitingHandshake);
    assert_eq!(stream.local_name(), HOST_STREAM);
    assert_eq!(stream.target_name(), PLUGIN_STREAM);
}

#[test]
fn writes_before_handshake_are_corked() {
    let (stream, transport) = host_stream();
    transport.drain();

    stream.write(json!({ "id": 1 })).unwrap();
    stream.write(json!({ "id": 2 })).unwrap();

    assert_eq!(transport.len(), 0);
    assert_eq!(stream.corked_len(), 2);
}

// ── Handshake ───────────────────────────────────────────────────

#[test]
fn syn_is_answered_with_ack() {
    let (stream, transport) = host_stream();
    transport.drain();

    assert_eq!(stream.receive(syn(HOST_STREAM)), None);
    assert_eq!(transport.drain(), vec![ack(PLUGIN_STREAM)]);
    assert!(!stream.is_established());
}

#[test]
fn ack_after_syn_establishes_without_extra_ack() {
    let (stream, transport) = host_stream();
    stream.receive(syn(HOST_STREAM));
    transport.drain();

    assert_eq!(stream.receive(ack(HOST_STREAM)), None);
    assert!(stream.is_established());
    assert_eq!(transport.len(), 0);
}

#[test]
fn ack_without_syn_sends_extra_ack() {
    let (stream, transport) = host_stream();
    transport.drain();

    stream.receive(ack(HOST_STREAM));
    assert!(stream.is_established());
    assert_eq!(transport.drain(), vec![ack(PLUGIN_STREAM)]);
}

#[test]
fn corked_writes_flush_in_order_on_establish() {
    let (stream, transport) = host_stream();
    transport.drain();
    for i in 0..3 {
        stream.write(json!({ "seq": i })).unwrap();
    }

    stream.receive(syn(HOST_STREAM));
    stream.receive(ack(HOST_STREAM));
    stream.write(json!({ "seq": 3 })).unwrap();

    let sent = transport.drain();
    assert_eq!(sent[0], ack(PLUGIN_STREAM));
    let payloads: Vec<Value> = sent[1..].iter().map(|m| m["data"]["seq"].clone()).collect();
    assert_eq!(payloads, vec![json!(0), json!(1), json!(2), json!(3)]);
    assert_eq!(stream.corked_len(), 0);
}

#[test]
fn established_stream_writes_immediately() {
    let (stream, transport) = host_stream();
    stream.receive(ack(HOST_STREAM));
    transport.drain();

    stream.write(json!({ "id": 9 })).unwrap();
    assert_eq!(
        transport.drain(),
        vec![json!({ "name": PLUGIN_STREAM, "data": { "id": 9 } })]
    );
}

// ── Receiving ───────────────────────────────────────────────────

#[test]
fn payload_before_handshake_is_dropped() {
    let (stream, _transport) = host_stream();
    let raw = json!({ "name": HOST_STREAM, "data": { "id": 1, "result": 2 } });
    assert_eq!(stream.receive(raw), None);
    assert!(!stream.is_established());
}

#[test]
fn payload_after_handshake_is_forwarded_verbatim() {
    let (stream, _transport) = host_stream();
    stream.receive(ack(HOST_STREAM));

    let payload = json!({ "id": 1, "result": { "deep": [true, null] } });
    let raw = json!({ "name": HOST_STREAM, "data": payload.clone() });
    assert_eq!(stream.receive(raw), Some(payload));
}

#[test]
fn control_literals_after_handshake_are_data() {
    let (stream, transport) = host_stream();
    stream.receive(ack(HOST_STREAM));
    transport.drain();

    assert_eq!(stream.receive(ack(HOST_STREAM)), Some(json!("ACK")));
    assert_eq!(stream.receive(syn(HOST_STREAM)), Some(json!("SYN")));
    assert_eq!(transport.len(), 0);
}

#[test]
fn messages_for_other_streams_are_dropped() {
    let (stream, transport) = host_stream();
    transport.drain();

    assert_eq!(stream.receive(ack("someone-else")), None);
    assert!(!stream.is_established());
    assert_eq!(stream.receive(syn(PLUGIN_STREAM)), None);
    assert_eq!(transport.len(), 0);
}

#[test]
fn malformed_messages_are_dropped() {
    let (stream, transport) = host_stream();
    stream.receive(ack(HOST_STREAM));
    transport.drain();

    for raw in [
        json!(null),
        json!("ACK"),
        json!([1, 2]),
        json!({ "data": { "id": 1 } }),
        json!({ "name": HOST_STREAM }),
        json!({ "name": HOST_STREAM, "data": null }),
    ] {
        assert_eq!(stream.receive(raw), None);
    }
    assert!(stream.is_established());
    assert_eq!(transport.len(), 0);
}

// ── Pairs ───────────────────────────────────────────────────────

#[test]
fn pair_converges_in_lockstep() {
    let link = Link::new();
    while link.to_plugin().is_some() || link.to_host().is_some() {}
    assert!(link.host.is_established());
    assert!(link.plugin.is_established());
}

#[test]
fn late_plugin_still_converges() {
    let host_out = Arc::new(RecordingTransport::new());
    let host = HandshakeStream::new(HOST_STREAM, PLUGIN_STREAM, host_out.clone()).unwrap();
    // Nobody is listening yet; the host's SYN is lost.
    host_out.drain();
    host.write(json!({ "hello": "plugin" })).unwrap();

    let plugin_out = Arc::new(RecordingTransport::new());
    let plugin = HandshakeStream::new(PLUGIN_STREAM, HOST_STREAM, plugin_out.clone()).unwrap();

    let mut delivered = Vec::new();
    loop {
        let mut progressed = false;
        while let Some(raw) = plugin_out.pop() {
            progressed = true;
            host.receive(raw);
        }
        while let Some(raw) = host_out.pop() {
            progressed = true;
            delivered.extend(plugin.receive(raw));
        }
        if !progressed {
            break;
        }
    }

    assert!(host.is_established());
    assert!(plugin.is_established());
    assert_eq!(delivered, vec![json!({ "hello": "plugin" })]);
}

#[test]
fn wait_established_resolves_after_ack() {
    let (stream, _transport) = host_stream();
    stream.receive(syn(HOST_STREAM));
    stream.receive(ack(HOST_STREAM));
    tokio_test::block_on(stream.wait_established());
}

#[tokio::test]
async fn wait_established_wakes_pending_waiter() {
    let (stream, _transport) = host_stream();
    let stream = Arc::new(stream);
    let waiter = tokio::spawn({
        let stream = stream.clone();
        async move { stream.wait_established().await }
    });
    tokio::task::yield_now().await;
    assert!(!waiter.is_finished());

    stream.receive(ack(HOST_STREAM));
    waiter.await.unwrap();
}

// ── Property: any delivery interleaving converges ───────────────

#[derive(Debug, Clone, Copy)]
enum Step {
    ToPlugin,
    ToHost,
    HostWrites,
    PluginWrites,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::ToPlugin),
        Just(Step::ToHost),
        Just(Step::HostWrites),
        Just(Step::PluginWrites),
    ]
}

proptest! {
    #[test]
    fn handshake_converges_under_any_interleaving(steps in prop::collection::vec(step(), 0..60)) {
        let link = Link::new();
        let mut host_sent = Vec::new();
        let mut plugin_sent = Vec::new();
        let mut host_got = Vec::new();
        let mut plugin_got = Vec::new();

        let mut deliver_to_plugin = |link: &Link, got: &mut Vec<Value>| {
            if let Some(payload) = link.to_plugin().flatten() {
                assert!(link.plugin.is_established(), "payload surfaced before establishment");
                got.push(payload);
            }
        };
        let deliver_to_host = |link: &Link, got: &mut Vec<Value>| {
            if let Some(payload) = link.to_host().flatten() {
                assert!(link.host.is_established(), "payload surfaced before establishment");
                got.push(payload);
            }
        };

        for (n, step) in steps.into_iter().enumerate() {
            match step {
                Step::ToPlugin => deliver_to_plugin(&link, &mut plugin_got),
                Step::ToHost => deliver_to_host(&link, &mut host_got),
                Step::HostWrites => {
                    let payload = json!({ "from": "host", "n": n });
                    link.host.write(payload.clone()).unwrap();
                    host_sent.push(payload);
                }
                Step::PluginWrites => {
                    let payload = json!({ "from": "plugin", "n": n });
                    link.plugin.write(payload.clone()).unwrap();
                    plugin_sent.push(payload);
                }
            }
        }
        while link.host_out.len() > 0 || link.plugin_out.len() > 0 {
            deliver_to_plugin(&link, &mut plugin_got);
            deliver_to_host(&link, &mut host_got);
        }

        prop_assert!(link.host.is_established());
        prop_assert!(link.plugin.is_established());
        prop_assert_eq!(plugin_got, host_sent);
        prop_assert_eq!(host_got, plugin_sent);
    }
}
