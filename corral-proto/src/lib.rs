//! Wire protocol for corral host↔plugin channels.
//!
//! Every message on a raw transport is an [`Envelope`]:
//!
//! ```json
//! { "name": "corral:plugin", "data": "SYN" }
//! { "name": "corral:host",   "data": { "id": 1, "result": "pong" } }
//! ```
//!
//! `name` addresses the receiving stream, `data` is either a handshake
//! [`ControlMessage`] or an application [`RpcMessage`]. The envelope shape is
//! identical for every transport kind; byte-stream transports additionally
//! frame each envelope with a 4-byte big-endian length prefix (see
//! [`codec`]).

pub mod codec;
mod error;
mod message;

pub use codec::{MAX_FRAME_SIZE, read_frame, read_message, write_message};
pub use error::{ProtoError, ProtoResult};
pub use message::{
    ControlMessage, Envelope, EnvelopeData, HOST_STREAM, PLUGIN_STREAM, RpcError, RpcId, RpcKind,
    RpcMessage, UNHANDLED_ERROR_METHOD,
};
