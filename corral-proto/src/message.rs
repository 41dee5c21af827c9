//! Envelope, handshake control and RPC payload types.

use crate::error::{ProtoError, ProtoResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Stream name of the host side of a job channel.
pub const HOST_STREAM: &str = "corral:host";

/// Stream name of the plugin side of a job channel.
pub const PLUGIN_STREAM: &str = "corral:plugin";

/// Notification a plugin sends when it hits an error it could not handle.
pub const UNHANDLED_ERROR_METHOD: &str = "UnhandledError";

/// Handshake control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Opening message, sent by each side as soon as its stream exists.
    #[serde(rename = "SYN")]
    Syn,
    /// Acknowledgement of a received `SYN`.
    #[serde(rename = "ACK")]
    Ack,
}

impl ControlMessage {
    /// Wire literal for this control message.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Syn => "SYN",
            Self::Ack => "ACK",
        }
    }

    /// Recognises a wire literal.
    pub fn from_wire(value: &Value) -> Option<Self> {
        match value.as_str()? {
            "SYN" => Some(Self::Syn),
            "ACK" => Some(Self::Ack),
            _ => None,
        }
    }
}

/// Contents of an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeData {
    /// Handshake traffic.
    Control(ControlMessage),
    /// Application traffic, forwarded verbatim once the channel is up.
    Payload(Value),
}

impl EnvelopeData {
    /// Converts to the JSON representation carried in `data`.
    pub fn into_value(self) -> Value {
        match self {
            Self::Control(control) => Value::String(control.as_str().to_string()),
            Self::Payload(value) => value,
        }
    }
}

/// Wire unit multiplexing control and application traffic on one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Name of the stream this envelope is addressed to.
    pub name: String,
    /// Control message or application payload.
    pub data: EnvelopeData,
}

impl Envelope {
    /// Creates a control envelope addressed to `name`.
    pub fn control(name: impl Into<String>, control: ControlMessage) -> Self {
        Self {
            name: name.into(),
            data: EnvelopeData::Control(control),
        }
    }

    /// Creates an application envelope addressed to `name`.
    pub fn payload(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            data: EnvelopeData::Payload(payload),
        }
    }

    /// Encodes the envelope as a raw JSON object.
    pub fn into_value(self) -> Value {
        let mut object = Map::with_capacity(2);
        object.insert("name".into(), Value::String(self.name));
        object.insert("data".into(), self.data.into_value());
        Value::Object(object)
    }

    /// Decodes a raw message.
    ///
    /// Fails with [`ProtoError::MalformedEnvelope`] when the message is not an
    /// object, has no string `name`, or has a missing or null `data`.
    pub fn from_value(raw: Value) -> ProtoResult<Self> {
        let Value::Object(mut object) = raw else {
            return Err(ProtoError::MalformedEnvelope(format!(
                "expected object, got {}",
                json_type(&raw)
            )));
        };

        let name = match object.remove("name") {
            Some(Value::String(name)) => name,
            Some(other) => {
                return Err(ProtoError::MalformedEnvelope(format!(
                    "name must be a string, got {}",
                    json_type(&other)
                )));
            }
            None => return Err(ProtoError::MalformedEnvelope("missing name".into())),
        };

        let data = match object.remove("data") {
            None | Some(Value::Null) => {
                return Err(ProtoError::MalformedEnvelope("missing data".into()));
            }
            Some(data) => match ControlMessage::from_wire(&data) {
                Some(control) => EnvelopeData::Control(control),
                None => EnvelopeData::Payload(data),
            },
        };

        Ok(Self { name, data })
    }
}

/// JSON-RPC request identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(i64),
    String(String),
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RpcId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RpcId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for RpcId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// Error object carried in a failed RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    /// Creates an error with the given code and message.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attaches structured data.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }
}

/// Classification of an [`RpcMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcKind {
    /// Has `method` and `id`: expects a response.
    Request,
    /// Has `method` but no `id`.
    Notification,
    /// Has `id` but no `method`: settles a pending call.
    Response,
    /// Neither `method` nor `id`.
    Invalid,
}

/// Application payload: `{ id?, method?, params?, result?, error? }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RpcId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcMessage {
    /// Creates a request expecting a response.
    pub fn request(id: RpcId, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: Some(id),
            method: Some(method.into()),
            params: Some(params),
            ..Self::default()
        }
    }

    /// Creates a notification (no response expected).
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: Some(method.into()),
            params: Some(params),
            ..Self::default()
        }
    }

    /// Creates a successful response.
    pub fn success(id: RpcId, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            ..Self::default()
        }
    }

    /// Creates a failed response.
    pub fn failure(id: RpcId, error: RpcError) -> Self {
        Self {
            id: Some(id),
            error: Some(error),
            ..Self::default()
        }
    }

    /// Classifies the message by which of `id`/`method` are present.
    pub fn kind(&self) -> RpcKind {
        match (&self.id, &self.method) {
            (Some(_), Some(_)) => RpcKind::Request,
            (None, Some(_)) => RpcKind::Notification,
            (Some(_), None) => RpcKind::Response,
            (None, None) => RpcKind::Invalid,
        }
    }

    /// Converts a response into the value it settles with.
    ///
    /// A response with neither `result` nor `error` (or `result: null`)
    /// settles with `null`.
    pub fn into_outcome(self) -> Result<Value, RpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }

    /// Decodes a payload, which must be a JSON object.
    pub fn from_value(payload: Value) -> ProtoResult<Self> {
        if !payload.is_object() {
            return Err(ProtoError::MalformedPayload(format!(
                "expected object, got {}",
                json_type(&payload)
            )));
        }
        serde_json::from_value(payload).map_err(|e| ProtoError::MalformedPayload(e.to_string()))
    }

    /// Encodes the payload as a JSON object.
    pub fn to_value(&self) -> ProtoResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
