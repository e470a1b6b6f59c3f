//! Connection actor: one connection from registration through teardown.
//!
//! 1. Registers the connection in its handler type's registry
//! 2. Starts the writer task and the heartbeat monitor
//! 3. Reads frames strictly in arrival order, dispatching text envelopes
//! 4. Tears down exactly once, whichever of peer close, transport failure,
//!    heartbeat timeout or shutdown ends the loop first

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use metrics::{counter, gauge, histogram};
use socketry_core::envelope::{self, InvokeMessage};
use socketry_core::transport::close_code;
use socketry_core::{CloseFrame, ConnectionId, Frame, FrameSink, FrameStream, ResolveError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::connection::{Connection, DisconnectReason, OUTBOUND_CAPACITY};
use crate::dispatch::MethodTable;
use crate::endpoint::{AcceptError, AcceptOptions};
use crate::handler::{HandlerContext, SocketHandler};
use crate::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::proxy::ClientProxy;
use crate::registry::HandlerScope;

/// How long teardown waits for queued frames and the close frame to flush.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

struct Session<H> {
    handler: Arc<H>,
    methods: Arc<MethodTable<H>>,
    connection: Arc<Connection>,
    ctx: HandlerContext,
    shutdown: CancellationToken,
}

/// Run one accepted connection to completion.
#[instrument(skip_all, fields(conn_id = %id, handler = scope.clients().name()))]
pub(crate) async fn run_session<H, K, S>(
    handler: Arc<H>,
    methods: Arc<MethodTable<H>>,
    scope: HandlerScope,
    id: ConnectionId,
    sink: K,
    mut stream: S,
    options: &AcceptOptions,
) -> Result<DisconnectReason, AcceptError>
where
    H: SocketHandler,
    K: FrameSink,
    S: FrameStream,
{
    let (outbound, queue) = mpsc::channel(OUTBOUND_CAPACITY);
    let connection = Arc::new(Connection::new(
        id.clone(),
        outbound,
        options.shutdown.child_token(),
    ));
    let proxy: Arc<dyn ClientProxy> = Arc::clone(&connection) as Arc<dyn ClientProxy>;
    if !scope.clients().add(id.clone(), proxy) {
        // Dropping the sink releases the transport.
        warn!("connection id already registered");
        return Err(AcceptError::DuplicateConnection(id));
    }
    let writer = spawn_writer(Arc::clone(&connection), sink, queue);
    let _ = connection.start();

    info!("client connected");
    counter!("ws_connections_total").increment(1);
    gauge!("ws_connections_active").increment(1.0);

    let session = Session {
        handler,
        methods,
        ctx: HandlerContext::new(Arc::clone(&connection), scope),
        connection,
        shutdown: options.shutdown.clone(),
    };

    session
        .guard_hook("on_connected", session.handler.on_connected(&session.ctx))
        .await;

    let heartbeat = spawn_heartbeat(Arc::clone(&session.connection), options);
    let reason = session.receive_loop(&mut stream).await;
    let _ = session.connection.begin_close(reason);
    Ok(session.teardown(writer, heartbeat).await)
}

/// Drain the outbound queue into the transport. A failed write tears the
/// connection down.
fn spawn_writer<K: FrameSink>(
    connection: Arc<Connection>,
    mut sink: K,
    mut queue: mpsc::Receiver<Frame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = queue.recv().await {
            if let Frame::Close(close) = frame {
                if let Err(e) = sink.close(close).await {
                    debug!(conn_id = %connection.id(), error = %e, "transport close failed");
                }
                return;
            }
            if let Err(e) = sink.send(frame).await {
                if connection.begin_close(DisconnectReason::Transport(e.to_string())) {
                    warn!(conn_id = %connection.id(), error = %e, "send failed");
                    connection.abort();
                }
                return;
            }
        }
        if let Err(e) = sink.close(None).await {
            debug!(conn_id = %connection.id(), error = %e, "transport close failed");
        }
    })
}

fn spawn_heartbeat(connection: Arc<Connection>, options: &AcceptOptions) -> JoinHandle<()> {
    let settings = options.heartbeat;
    let cancel = connection.cancellation().clone();
    tokio::spawn(async move {
        if run_heartbeat(Arc::clone(&connection), settings, cancel).await
            == HeartbeatResult::TimedOut
            && connection.begin_close(DisconnectReason::HeartbeatTimeout)
        {
            warn!(
                conn_id = %connection.id(),
                idle_ms = u64::try_from(connection.idle_for().as_millis()).unwrap_or(u64::MAX),
                "heartbeat timeout"
            );
            connection.abort();
        }
    })
}

impl<H: SocketHandler> Session<H> {
    async fn receive_loop<S: FrameStream>(&self, stream: &mut S) -> DisconnectReason {
        let cancel = self.connection.cancellation().clone();
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return self.cancelled_reason(),
                next = stream.receive() => next,
            };
            let frame = match next {
                None => return DisconnectReason::StreamEnded,
                Some(Err(e)) => {
                    debug!(error = %e, "receive failed");
                    return DisconnectReason::Transport(e.to_string());
                }
                Some(Ok(frame)) => frame,
            };
            self.connection.touch();
            if let Frame::Close(close) = frame {
                return DisconnectReason::PeerClosed(close);
            }

            // A handler stuck on one frame must not outlive teardown.
            tokio::select! {
                biased;
                () = cancel.cancelled() => return self.cancelled_reason(),
                () = self.handle_frame(frame) => {}
            }
        }
    }

    fn cancelled_reason(&self) -> DisconnectReason {
        if self.shutdown.is_cancelled() {
            DisconnectReason::Shutdown
        } else {
            DisconnectReason::Aborted
        }
    }

    async fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Text(text) => self.handle_text(&text).await,
            Frame::Binary(data) => {
                self.guard_hook(
                    "on_binary_received",
                    self.handler.on_binary_received(&self.ctx, &data),
                )
                .await;
            }
            // The WebSocket layer answers pings; here they only count as traffic.
            Frame::Ping(_) | Frame::Pong(_) | Frame::Close(_) => {}
        }
    }

    async fn handle_text(&self, text: &str) {
        self.guard_hook(
            "on_text_received",
            self.handler.on_text_received(&self.ctx, text),
        )
        .await;

        let message = match envelope::decode(text) {
            Ok(message) => message,
            Err(e) => return self.resolve_failed(text, e.into()).await,
        };
        if !message.is_request() {
            debug!(method = %message.method, "reply received");
            self.guard_hook(
                "on_reply_received",
                self.handler.on_reply_received(&self.ctx, &message),
            )
            .await;
            return;
        }

        let InvokeMessage {
            method,
            arguments,
            id,
            ..
        } = message;
        debug!(method = %method, args = arguments.len(), "dispatch");
        counter!("socket_dispatch_total").increment(1);

        let result = self
            .methods
            .invoke(&self.handler, &self.ctx, &method, arguments)
            .resolve()
            .await;
        match result {
            Ok(Some(value)) => {
                let reply = InvokeMessage::response(method, value).with_id(id);
                if let Err(e) = self.connection.send_message(&reply) {
                    warn!(method = %reply.method, error = %e, "reply send failed");
                }
            }
            Ok(None) => {}
            Err(e) => self.resolve_failed(text, e).await,
        }
    }

    async fn resolve_failed(&self, raw: &str, error: ResolveError) {
        warn!(code = error.code(), error = %error, "resolve failed");
        counter!("socket_resolve_errors_total", "code" => error.code()).increment(1);
        self.guard_hook(
            "on_resolve_error",
            self.handler.on_resolve_error(&self.ctx, raw, &error),
        )
        .await;
    }

    /// Run a hook, containing a panic to this call.
    async fn guard_hook(&self, hook: &'static str, future: impl Future<Output = ()>) {
        if AssertUnwindSafe(future).catch_unwind().await.is_err() {
            warn!(hook, "handler hook panicked");
        }
    }

    async fn teardown(self, mut writer: JoinHandle<()>, heartbeat: JoinHandle<()>) -> DisconnectReason {
        let reason = self
            .connection
            .disconnect_reason()
            .cloned()
            .unwrap_or(DisconnectReason::Aborted);
        self.connection.abort();

        self.guard_hook(
            "on_disconnected",
            self.handler.on_disconnected(&self.ctx, &reason),
        )
        .await;

        // Deregister before purging groups: a racing join then either sees
        // the id gone or is purged here.
        let id = self.connection.id();
        let _ = self.ctx.clients().remove(id);
        let left = self.ctx.groups().remove_connection(id);

        let close = match &reason {
            DisconnectReason::PeerClosed(frame) => Some(
                frame
                    .clone()
                    .unwrap_or_else(|| CloseFrame::new(close_code::NORMAL, "")),
            ),
            DisconnectReason::Shutdown => Some(CloseFrame::new(
                close_code::GOING_AWAY,
                "server shutting down",
            )),
            DisconnectReason::Aborted => Some(CloseFrame::new(close_code::NORMAL, "")),
            DisconnectReason::StreamEnded
            | DisconnectReason::Transport(_)
            | DisconnectReason::HeartbeatTimeout => None,
        };
        // Without a close frame the transport is aborted; otherwise pending
        // frames get CLOSE_TIMEOUT to flush.
        let flushed = if self.connection.shut_outbound(close) {
            tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await.ok()
        } else {
            None
        };
        let written = match flushed {
            Some(result) => result,
            None => {
                writer.abort();
                writer.await
            }
        };
        if let Err(e) = written {
            if !e.is_cancelled() {
                debug!(error = %e, "writer task ended abnormally");
            }
        }

        if let Err(e) = heartbeat.await {
            debug!(error = %e, "heartbeat task ended abnormally");
        }
        self.connection.finish_close();

        info!(reason = reason.label(), groups_left = left, "client disconnected");
        counter!("ws_disconnections_total", "reason" => reason.label()).increment(1);
        gauge!("ws_connections_active").decrement(1.0);
        histogram!("ws_connection_duration_seconds").record(self.connection.age().as_secs_f64());
        reason
    }
}
