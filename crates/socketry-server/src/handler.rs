//! Handler capability implemented by application code.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use socketry_core::{ConnectionId, InvokeMessage, ResolveError};

use crate::connection::{Connection, DisconnectReason};
use crate::dispatch::MethodTable;
use crate::groups::{GroupProxy, GroupRegistry};
use crate::proxy::ClientProxy;
use crate::registry::{ClientRegistry, HandlerScope};

/// Application logic bound to one connection.
///
/// A fresh instance is built for every accepted connection. Callable methods
/// are registered once per type in [`SocketHandler::register_methods`]; the
/// lifecycle hooks default to no-ops.
#[async_trait]
pub trait SocketHandler: Send + Sync + 'static {
    /// Populate the dispatch table for this handler type.
    fn register_methods(methods: &mut MethodTable<Self>)
    where
        Self: Sized;

    /// The connection was registered and is about to start receiving.
    async fn on_connected(&self, _ctx: &HandlerContext) {}

    /// The connection is closing. Runs before registry removal, once.
    async fn on_disconnected(&self, _ctx: &HandlerContext, _reason: &DisconnectReason) {}

    /// A text frame arrived, before it is decoded. Observational only.
    async fn on_text_received(&self, _ctx: &HandlerContext, _text: &str) {}

    /// A binary frame arrived. The payload bypasses the envelope codec.
    async fn on_binary_received(&self, _ctx: &HandlerContext, _data: &Bytes) {}

    /// A response-flagged envelope arrived from the peer.
    async fn on_reply_received(&self, _ctx: &HandlerContext, _reply: &InvokeMessage) {}

    /// Decoding or dispatching a text frame failed. No reply is sent.
    async fn on_resolve_error(&self, _ctx: &HandlerContext, _raw: &str, _error: &ResolveError) {}
}

/// What a handler can reach while serving a connection.
#[derive(Clone)]
pub struct HandlerContext {
    connection: Arc<Connection>,
    scope: HandlerScope,
}

impl HandlerContext {
    /// Bind a connection to the registries of its handler type.
    pub fn new(connection: Arc<Connection>, scope: HandlerScope) -> Self {
        Self { connection, scope }
    }

    /// Id of the connection being served.
    pub fn connection_id(&self) -> &ConnectionId {
        self.connection.id()
    }

    /// The connection being served.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Send capability for the connection being served.
    pub fn caller(&self) -> Arc<dyn ClientProxy> {
        Arc::clone(&self.connection) as Arc<dyn ClientProxy>
    }

    /// Live connections of this handler type.
    pub fn clients(&self) -> &Arc<ClientRegistry> {
        self.scope.clients()
    }

    /// Groups of this handler type.
    pub fn groups(&self) -> &Arc<GroupRegistry> {
        self.scope.groups()
    }

    /// Send capability for another connection of this handler type.
    pub fn client(&self, id: &ConnectionId) -> Option<Arc<dyn ClientProxy>> {
        self.scope.clients().get(id)
    }

    /// Send capability for a group.
    pub fn group(&self, name: &str) -> GroupProxy {
        self.scope.groups().group(name)
    }

    /// Add the caller to `group`.
    pub fn join(&self, group: &str) -> bool {
        self.scope.groups().join(group, self.connection_id().clone())
    }

    /// Remove the caller from `group`.
    pub fn leave(&self, group: &str) -> bool {
        self.scope.groups().leave(group, self.connection_id())
    }
}
