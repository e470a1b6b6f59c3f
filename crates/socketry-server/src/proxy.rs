//! Send-only capability for pushing invocations to clients.

use async_trait::async_trait;
use serde_json::Value;
use socketry_core::SendError;

/// Push an invocation to one connection or a group of connections.
///
/// Fire-and-forget: completion means the frame was handed to the transport
/// (or the group fan-out finished), not that the peer processed it. No
/// correlated result is returned.
#[async_trait]
pub trait ClientProxy: Send + Sync {
    /// Send a request-flagged envelope for `method` with `arguments`.
    async fn send(&self, method: &str, arguments: Vec<Value>) -> Result<(), SendError>;
}
