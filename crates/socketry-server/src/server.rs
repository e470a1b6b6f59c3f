//! `SocketServer`: axum HTTP server hosting the mapped socket handlers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::Json;
use axum::routing::{MethodRouter, get};
use socketry_settings::SocketrySettings;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::endpoint::{AcceptOptions, HandlerRoutes, SocketEndpoint};
use crate::handler::SocketHandler;
use crate::health::{self, HealthResponse};
use crate::registry::HandlerScopes;
use crate::shutdown::ShutdownCoordinator;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
struct AppState {
    scopes: Arc<HandlerScopes>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

/// HTTP server upgrading mapped paths to socket connections.
pub struct SocketServer {
    settings: SocketrySettings,
    routes: HandlerRoutes,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl SocketServer {
    /// Create a server with no routes mapped yet.
    pub fn new(settings: SocketrySettings) -> Self {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let options = AcceptOptions::new(settings.heartbeat, shutdown.token());
        Self {
            routes: HandlerRoutes::new(Arc::new(HandlerScopes::new()), options),
            settings,
            shutdown,
            start_time: Instant::now(),
        }
    }

    /// Map `path` to handler type `H`, built with `H::default()`.
    pub fn map<H: SocketHandler + Default>(&mut self, path: &str) -> &mut Self {
        let _ = self.routes.map::<H>(path);
        self
    }

    /// Map `path` to handler type `H`, built with `factory`.
    pub fn map_with<H: SocketHandler>(
        &mut self,
        path: &str,
        factory: impl Fn() -> H + Send + Sync + 'static,
    ) -> &mut Self {
        let _ = self.routes.map_with(path, factory);
        self
    }

    /// Build the axum router with `/health` and every mapped path.
    pub fn router(&self) -> Router {
        let state = AppState {
            scopes: Arc::clone(self.routes.scopes()),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
        };

        let max_message_size = self.settings.server.max_message_size;
        let mut router = Router::new().route("/health", get(health_handler));
        for (path, endpoint) in self.routes.iter() {
            router = router.route(path, upgrade_route(Arc::clone(endpoint), max_message_size));
        }
        router.with_state(state)
    }

    /// Bind `host:port` and serve in the background until shutdown.
    ///
    /// Returns the bound address (useful with port 0) and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let bind = format!("{}:{}", self.settings.server.host, self.settings.server.port);
        let listener = TcpListener::bind(&bind).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.shutdown.token();

        info!(%addr, paths = ?self.routes.paths(), "socket server listening");
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "server error");
            }
        });
        Ok((addr, handle))
    }

    /// Mapped handler routes.
    pub fn routes(&self) -> &HandlerRoutes {
        &self.routes
    }

    /// Connection and group registries of every mapped handler type.
    pub fn scopes(&self) -> &Arc<HandlerScopes> {
        self.routes.scopes()
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server settings.
    pub fn settings(&self) -> &SocketrySettings {
        &self.settings
    }
}

fn upgrade_route(endpoint: Arc<dyn SocketEndpoint>, max_message_size: usize) -> MethodRouter<AppState> {
    get(move |upgrade: WebSocketUpgrade| {
        let endpoint = Arc::clone(&endpoint);
        async move {
            upgrade
                .max_message_size(max_message_size)
                .on_failed_upgrade(|e: axum::Error| warn!(error = %e, "websocket upgrade failed"))
                .on_upgrade(move |socket| async move { endpoint.serve(socket).await })
        }
    })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.scopes.connection_count(),
        state.shutdown.is_shutting_down(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::MethodTable;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[derive(Default)]
    struct NoopHandler;

    #[async_trait]
    impl SocketHandler for NoopHandler {
        fn register_methods(_methods: &mut MethodTable<Self>) {}
    }

    fn make_server() -> SocketServer {
        let mut server = SocketServer::new(SocketrySettings::default());
        let _ = server.map::<NoopHandler>("/noop");
        server
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or_default())
    }

    #[test]
    fn server_with_default_settings() {
        let server = make_server();
        assert_eq!(server.settings().server.host, "127.0.0.1");
        assert_eq!(server.settings().server.port, 8080);
        assert_eq!(server.routes().paths(), vec!["/noop"]);
        assert!(!server.shutdown().is_shutting_down());
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server();
        let (status, body) = get_json(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert!(body["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn health_reports_draining() {
        let server = make_server();
        server.shutdown().shutdown();
        let (_, body) = get_json(server.router(), "/health").await;
        assert_eq!(body["status"], "draining");
    }

    #[tokio::test]
    async fn mapped_path_requires_upgrade() {
        let server = make_server();
        let req = Request::builder().uri("/noop").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let req = Request::builder()
            .uri("/nonexistent")
            .body(Body::empty())
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_on_ephemeral_port() {
        let mut settings = SocketrySettings::default();
        settings.server.port = 0;
        let server = SocketServer::new(settings);
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);

        server.shutdown().shutdown();
        handle.await.unwrap();
    }
}
