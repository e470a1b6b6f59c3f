//! Handler endpoints and path → handler route mapping.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::WebSocket;
use socketry_core::transport::close_code;
use socketry_core::{CloseFrame, ConnectionId, FrameSink, FrameStream};
use socketry_settings::HeartbeatSettings;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::DisconnectReason;
use crate::dispatch::MethodTable;
use crate::handler::SocketHandler;
use crate::registry::{HandlerScope, HandlerScopes};
use crate::session;
use crate::ws;

/// Per-accept configuration supplied by the acceptor.
#[derive(Clone, Debug, Default)]
pub struct AcceptOptions {
    /// Heartbeat interval and tolerated misses.
    pub heartbeat: HeartbeatSettings,
    /// Server-wide shutdown signal. Each connection runs on a child token.
    pub shutdown: CancellationToken,
}

impl AcceptOptions {
    /// Create accept options.
    pub fn new(heartbeat: HeartbeatSettings, shutdown: CancellationToken) -> Self {
        Self {
            heartbeat,
            shutdown,
        }
    }
}

/// Failures surfaced to the acceptor. Everything else is handled per frame.
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    /// Shutdown has begun; the transport was closed with 1001.
    #[error("server is shutting down")]
    ShuttingDown,

    /// Another live connection already holds this id.
    #[error("connection id '{0}' is already registered")]
    DuplicateConnection(ConnectionId),
}

type Factory<H> = Arc<dyn Fn() -> H + Send + Sync>;

/// Accepts connections for one handler type.
///
/// Builds the handler's [`MethodTable`] once; each accepted connection gets
/// a fresh handler instance from the factory.
pub struct HandlerEndpoint<H> {
    factory: Factory<H>,
    methods: Arc<MethodTable<H>>,
    scope: HandlerScope,
    options: AcceptOptions,
}

impl<H: SocketHandler> HandlerEndpoint<H> {
    /// Create an endpoint serving connections into `scope`.
    pub fn new(
        factory: impl Fn() -> H + Send + Sync + 'static,
        scope: HandlerScope,
        options: AcceptOptions,
    ) -> Self {
        let mut methods = MethodTable::new();
        H::register_methods(&mut methods);
        debug!(
            handler = scope.clients().name(),
            methods = methods.len(),
            "dispatch table built"
        );
        Self {
            factory: Arc::new(factory),
            methods: Arc::new(methods),
            scope,
            options,
        }
    }

    /// Registries shared by this endpoint's connections.
    pub fn scope(&self) -> &HandlerScope {
        &self.scope
    }

    /// The handler type's dispatch table.
    pub fn methods(&self) -> &MethodTable<H> {
        &self.methods
    }

    /// Accept options applied to every connection.
    pub fn options(&self) -> &AcceptOptions {
        &self.options
    }

    /// Run one connection under a freshly generated id.
    ///
    /// Returns once the connection is fully closed, with the reason that won
    /// teardown.
    pub async fn accept(
        &self,
        sink: impl FrameSink,
        stream: impl FrameStream,
    ) -> Result<DisconnectReason, AcceptError> {
        self.accept_with_id(ConnectionId::new(), sink, stream).await
    }

    /// Run one connection under a caller-chosen id.
    pub async fn accept_with_id(
        &self,
        id: ConnectionId,
        mut sink: impl FrameSink,
        stream: impl FrameStream,
    ) -> Result<DisconnectReason, AcceptError> {
        if self.options.shutdown.is_cancelled() {
            let close = CloseFrame::new(close_code::GOING_AWAY, "server shutting down");
            if let Err(e) = sink.close(Some(close)).await {
                debug!(conn_id = %id, error = %e, "close during shutdown failed");
            }
            return Err(AcceptError::ShuttingDown);
        }

        let handler = Arc::new((self.factory)());
        session::run_session(
            handler,
            Arc::clone(&self.methods),
            self.scope.clone(),
            id,
            sink,
            stream,
            &self.options,
        )
        .await
    }
}

/// Type-erased endpoint served on an HTTP route.
#[async_trait]
pub trait SocketEndpoint: Send + Sync {
    /// Handler type label, for logs.
    fn handler_name(&self) -> &str;

    /// Run an upgraded WebSocket until it closes.
    async fn serve(&self, socket: WebSocket);
}

#[async_trait]
impl<H: SocketHandler> SocketEndpoint for HandlerEndpoint<H> {
    fn handler_name(&self) -> &str {
        self.scope.clients().name()
    }

    async fn serve(&self, socket: WebSocket) {
        let (sink, stream) = ws::split_socket(socket);
        match self.accept(sink, stream).await {
            Ok(reason) => debug!(handler = self.handler_name(), reason = reason.label(), "socket served"),
            Err(e) => warn!(handler = self.handler_name(), error = %e, "socket rejected"),
        }
    }
}

/// Path → handler mapping resolved by the HTTP server.
pub struct HandlerRoutes {
    routes: BTreeMap<String, Arc<dyn SocketEndpoint>>,
    scopes: Arc<HandlerScopes>,
    options: AcceptOptions,
}

impl HandlerRoutes {
    /// Create an empty route table. Endpoints draw their registries from
    /// `scopes` and share `options`.
    pub fn new(scopes: Arc<HandlerScopes>, options: AcceptOptions) -> Self {
        Self {
            routes: BTreeMap::new(),
            scopes,
            options,
        }
    }

    /// Map `path` to handler type `H`, built with `H::default()`.
    pub fn map<H: SocketHandler + Default>(&mut self, path: &str) -> &mut Self {
        self.map_with(path, H::default)
    }

    /// Map `path` to handler type `H`, built with `factory`.
    pub fn map_with<H: SocketHandler>(
        &mut self,
        path: &str,
        factory: impl Fn() -> H + Send + Sync + 'static,
    ) -> &mut Self {
        let endpoint = HandlerEndpoint::new(factory, self.scopes.scope::<H>(), self.options.clone());
        let path = normalize_path(path);
        info!(path = %path, handler = endpoint.handler_name(), "handler mapped");
        if self.routes.insert(path.clone(), Arc::new(endpoint)).is_some() {
            warn!(path = %path, "handler route replaced");
        }
        self
    }

    /// Endpoint mapped at `path`.
    pub fn get(&self, path: &str) -> Option<Arc<dyn SocketEndpoint>> {
        self.routes.get(&normalize_path(path)).cloned()
    }

    /// Mapped paths, sorted.
    pub fn paths(&self) -> Vec<&str> {
        self.routes.keys().map(String::as_str).collect()
    }

    /// Mapped `(path, endpoint)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn SocketEndpoint>)> {
        self.routes.iter().map(|(path, endpoint)| (path.as_str(), endpoint))
    }

    /// Registries backing every mapped handler.
    pub fn scopes(&self) -> &Arc<HandlerScopes> {
        &self.scopes
    }

    /// Accept options shared by every mapped handler.
    pub fn options(&self) -> &AcceptOptions {
        &self.options
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_owned()
    } else {
        format!("/{trimmed}")
    }
}
