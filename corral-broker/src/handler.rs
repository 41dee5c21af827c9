//! Host-side handling of requests initiated by a plugin.

use async_trait::async_trait;
use corral_proto::RpcError;
use corral_types::JobId;
use serde_json::Value;

/// Answers requests a plugin sends to the host.
///
/// The returned value or error is sent back to the plugin as the response.
#[async_trait]
pub trait HostRequestHandler: Send + Sync {
    async fn handle(&self, job_id: JobId, method: &str, params: Value) -> Result<Value, RpcError>;
}

/// Rejects every request with `method not found`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MethodNotFound;

#[async_trait]
impl HostRequestHandler for MethodNotFound {
    async fn handle(&self, _job_id: JobId, method: &str, _params: Value) -> Result<Value, RpcError> {
        Err(RpcError::method_not_found(method))
    }
}
