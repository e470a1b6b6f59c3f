//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::registry::HandlerScopes;

/// Default time allowed for live connections to close.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Coordinates graceful shutdown across the listener and every connection.
///
/// Connections run on child tokens of [`Self::token`]; cancelling it makes
/// each one close with 1001 and deregister.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Initiate shutdown and wait for every registered connection to close.
    ///
    /// Returns `false` if connections were still live after `timeout`
    /// (defaults to [`DEFAULT_SHUTDOWN_TIMEOUT`]).
    pub async fn drain(&self, scopes: &HandlerScopes, timeout: Option<Duration>) -> bool {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        self.shutdown();
        info!(
            connections = scopes.connection_count(),
            timeout_secs = timeout.as_secs(),
            "draining connections"
        );

        let wait = async {
            while scopes.connection_count() > 0 {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        };
        if tokio::time::timeout(timeout, wait).await.is_err() {
            warn!(
                remaining = scopes.connection_count(),
                "shutdown timed out after {timeout:?}, some connections are still open"
            );
            return false;
        }
        true
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ClientProxy;
    use async_trait::async_trait;
    use serde_json::Value;
    use socketry_core::{ConnectionId, SendError};
    use std::sync::Arc;

    struct NullProxy;

    #[async_trait]
    impl ClientProxy for NullProxy {
        async fn send(&self, _method: &str, _arguments: Vec<Value>) -> Result<(), SendError> {
            Ok(())
        }
    }

    struct Handler;

    #[test]
    fn initial_state_not_shutting_down() {
        let coord = ShutdownCoordinator::new();
        assert!(!coord.is_shutting_down());
    }

    #[test]
    fn token_propagation_reaches_children() {
        let coord = ShutdownCoordinator::new();
        let child = coord.token().child_token();
        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn drain_with_no_connections_is_immediate() {
        let coord = ShutdownCoordinator::new();
        assert!(coord.drain(&HandlerScopes::new(), None).await);
        assert!(coord.is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_deregistration() {
        let coord = ShutdownCoordinator::new();
        let scopes = Arc::new(HandlerScopes::new());
        let clients = Arc::clone(scopes.scope::<Handler>().clients());
        let id = ConnectionId::from("c1");
        let _ = clients.add(id.clone(), Arc::new(NullProxy));

        let token = coord.token();
        let remover = tokio::spawn(async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = clients.remove(&id);
        });

        assert!(coord.drain(&scopes, Some(Duration::from_secs(1))).await);
        remover.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out() {
        let coord = ShutdownCoordinator::new();
        let scopes = HandlerScopes::new();
        let _ = scopes
            .scope::<Handler>()
            .clients()
            .add(ConnectionId::from("stuck"), Arc::new(NullProxy));

        assert!(!coord.drain(&scopes, Some(Duration::from_millis(100))).await);
    }
}
