//! # socketry-server
//!
//! Real-time bidirectional messaging over persistent socket connections.
//!
//! - Connection actor: one receive loop per connection, envelope dispatch,
//!   guarded teardown ([`session`])
//! - Dispatch tables built once per handler type ([`dispatch`])
//! - Per-handler-type connection and group registries ([`registry`], [`groups`])
//! - Transport-agnostic heartbeat liveness monitor ([`heartbeat`])
//! - Route mapping, axum WebSocket adapter, `/health`, graceful shutdown
//!   ([`endpoint`], [`ws`], [`server`], [`shutdown`])

#![deny(unsafe_code)]

pub mod connection;
pub mod dispatch;
pub mod endpoint;
pub mod groups;
pub mod handler;
pub mod health;
pub mod heartbeat;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod ws;

pub use connection::{Connection, ConnectionState, DisconnectReason};
pub use dispatch::{FromArguments, Invocation, MethodTable};
pub use endpoint::{AcceptError, AcceptOptions, HandlerEndpoint, HandlerRoutes, SocketEndpoint};
pub use groups::{GroupDelivery, GroupProxy, GroupRegistry};
pub use handler::{HandlerContext, SocketHandler};
pub use health::HealthResponse;
pub use heartbeat::HeartbeatResult;
pub use proxy::ClientProxy;
pub use registry::{ClientRegistry, HandlerScope, HandlerScopes};
pub use server::SocketServer;
pub use shutdown::ShutdownCoordinator;
