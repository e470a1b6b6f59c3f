//! Per-connection state shared between the receive loop, the heartbeat
//! monitor, and registry lookups.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use serde_json::Value;
use socketry_core::envelope::{self, InvokeMessage};
use socketry_core::{CloseFrame, ConnectionId, Frame, SendError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::proxy::ClientProxy;

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    /// Constructed, not yet registered.
    Accepted = 0,
    /// Registered; the receive loop is running.
    Running = 1,
    /// Teardown in progress.
    Closing = 2,
    /// Resources released. Terminal.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Accepted,
            1 => Self::Running,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Why a connection ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer sent a close frame.
    PeerClosed(Option<CloseFrame>),
    /// The frame stream ended without a close frame.
    StreamEnded,
    /// Reading or writing a frame failed.
    Transport(String),
    /// No frame arrived within the heartbeat threshold.
    HeartbeatTimeout,
    /// The server is shutting down.
    Shutdown,
    /// Server-side code closed the connection.
    Aborted,
}

impl DisconnectReason {
    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::PeerClosed(_) => "peer_closed",
            Self::StreamEnded => "stream_ended",
            Self::Transport(_) => "transport_error",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Shutdown => "shutdown",
            Self::Aborted => "aborted",
        }
    }
}

/// Frames a connection may queue before further sends are dropped.
pub const OUTBOUND_CAPACITY: usize = 256;

/// One live connection.
///
/// Sends never wait on the peer: frames go onto a bounded queue drained by
/// the connection's writer task, which exclusively owns the transport's write
/// half. A full queue drops the frame. Once teardown shuts the queue every
/// send fails with [`SendError::Closed`].
pub struct Connection {
    id: ConnectionId,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    dropped: AtomicU64,
    state: AtomicU8,
    last_seen: Mutex<Instant>,
    connected_at: Instant,
    cancel: CancellationToken,
    reason: OnceLock<DisconnectReason>,
}

impl Connection {
    /// Create a connection writing into `outbound`.
    ///
    /// `cancel` stops the receive loop, heartbeat monitor and writer; pass a
    /// child of the server's shutdown token.
    pub fn new(id: ConnectionId, outbound: mpsc::Sender<Frame>, cancel: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            id,
            outbound: Mutex::new(Some(outbound)),
            dropped: AtomicU64::new(0),
            state: AtomicU8::new(ConnectionState::Accepted as u8),
            last_seen: Mutex::new(now),
            connected_at: now,
            cancel,
            reason: OnceLock::new(),
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the receive loop is running and teardown has not begun.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Running
    }

    /// Why the connection ended, once teardown has begun.
    pub fn disconnect_reason(&self) -> Option<&DisconnectReason> {
        self.reason.get()
    }

    /// Record inbound activity (any frame kind).
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the last inbound frame (or acceptance).
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Frames dropped because the outbound queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Token cancelled when the connection starts closing.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Ask the receive loop to stop. Teardown runs on the loop's exit path.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// `Accepted → Running`.
    pub(crate) fn start(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Accepted as u8,
                ConnectionState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// `Accepted | Running → Closing`. Returns `true` for exactly one caller.
    pub(crate) fn begin_close(&self, reason: DisconnectReason) -> bool {
        let won = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < ConnectionState::Closing as u8)
                    .then_some(ConnectionState::Closing as u8)
            })
            .is_ok();
        if won {
            let _ = self.reason.set(reason);
        }
        won
    }

    /// `Closing → Closed`.
    pub(crate) fn finish_close(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }

    /// Encode and queue an envelope.
    pub fn send_message(&self, message: &InvokeMessage) -> Result<(), SendError> {
        let text = envelope::encode(message)?;
        self.send_frame(Frame::Text(text))
    }

    /// Queue a raw frame. Frames are written in the order they were queued.
    pub fn send_frame(&self, frame: Frame) -> Result<(), SendError> {
        let guard = self.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(SendError::Closed(self.id.clone()));
        };
        match tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("ws_messages_dropped_total").increment(1);
                Err(SendError::Full(self.id.clone()))
            }
            Err(TrySendError::Closed(_)) => Err(SendError::Closed(self.id.clone())),
        }
    }

    /// Stop accepting sends. With `close`, the close frame is queued behind
    /// pending frames; returns whether it was queued.
    pub(crate) fn shut_outbound(&self, close: Option<CloseFrame>) -> bool {
        let Some(tx) = self.outbound.lock().take() else {
            return false;
        };
        close.is_some_and(|close| tx.try_send(Frame::Close(Some(close))).is_ok())
    }
}

#[async_trait]
impl ClientProxy for Connection {
    async fn send(&self, method: &str, arguments: Vec<Value>) -> Result<(), SendError> {
        self.send_message(&InvokeMessage::request(method, arguments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn make_connection() -> (Connection, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(32);
        let conn = Connection::new(ConnectionId::from("conn_1"), tx, CancellationToken::new());
        (conn, rx)
    }

    #[test]
    fn create_connection() {
        let (conn, _rx) = make_connection();
        assert_eq!(conn.id().as_str(), "conn_1");
        assert_eq!(conn.state(), ConnectionState::Accepted);
        assert!(!conn.is_open());
        assert!(conn.disconnect_reason().is_none());
        assert_eq!(conn.drop_count(), 0);
    }

    #[tokio::test]
    async fn proxy_send_queues_request_envelope() {
        let (conn, mut rx) = make_connection();
        ClientProxy::send(&conn, "Notify", vec![json!("hi")])
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await,
            Some(Frame::text(r#"{"Method":"Notify","Flag":0,"Arguments":["hi"]}"#))
        );
    }

    #[tokio::test]
    async fn sends_preserve_order() {
        let (conn, mut rx) = make_connection();
        for i in 0..5 {
            conn.send_frame(Frame::text(format!("msg_{i}"))).unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await, Some(Frame::text(format!("msg_{i}"))));
        }
    }

    #[test]
    fn full_queue_drops_without_waiting() {
        let (tx, _rx) = mpsc::channel(2);
        let conn = Connection::new(ConnectionId::from("slow"), tx, CancellationToken::new());
        conn.send_frame(Frame::text("a")).unwrap();
        conn.send_frame(Frame::text("b")).unwrap();
        assert_matches!(
            conn.send_frame(Frame::text("c")),
            Err(SendError::Full(id)) if id.as_str() == "slow"
        );
        assert_eq!(conn.drop_count(), 1);
    }

    #[tokio::test]
    async fn send_after_shut_is_closed() {
        let (conn, mut rx) = make_connection();
        assert!(!conn.shut_outbound(None));
        assert_matches!(
            conn.send_frame(Frame::text("x")),
            Err(SendError::Closed(id)) if id.as_str() == "conn_1"
        );
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn shut_queues_close_behind_pending_frames() {
        let (conn, mut rx) = make_connection();
        conn.send_frame(Frame::text("last")).unwrap();
        assert!(conn.shut_outbound(Some(CloseFrame::new(1000, "bye"))));
        assert!(!conn.shut_outbound(Some(CloseFrame::new(1000, "again"))));

        assert_eq!(rx.recv().await, Some(Frame::text("last")));
        assert_eq!(
            rx.recv().await,
            Some(Frame::Close(Some(CloseFrame::new(1000, "bye"))))
        );
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn lifecycle_transitions() {
        let (conn, _rx) = make_connection();
        assert!(conn.start());
        assert!(!conn.start());
        assert!(conn.is_open());

        assert!(conn.begin_close(DisconnectReason::StreamEnded));
        assert!(!conn.begin_close(DisconnectReason::HeartbeatTimeout));
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert_eq!(conn.disconnect_reason(), Some(&DisconnectReason::StreamEnded));

        conn.finish_close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.begin_close(DisconnectReason::Shutdown));
    }

    #[test]
    fn close_before_start_is_allowed_once() {
        let (conn, _rx) = make_connection();
        assert!(conn.begin_close(DisconnectReason::Shutdown));
        assert!(!conn.start());
    }

    #[tokio::test(start_paused = true)]
    async fn touch_resets_idle_time() {
        let (conn, _rx) = make_connection();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(conn.idle_for() >= Duration::from_secs(5));
        conn.touch();
        assert!(conn.idle_for() < Duration::from_secs(1));
        assert!(conn.age() >= Duration::from_secs(5));
    }

    #[test]
    fn abort_cancels_token() {
        let (conn, _rx) = make_connection();
        conn.abort();
        assert!(conn.cancellation().is_cancelled());
    }

    #[test]
    fn reason_labels() {
        assert_eq!(DisconnectReason::HeartbeatTimeout.label(), "heartbeat_timeout");
        assert_eq!(DisconnectReason::PeerClosed(None).label(), "peer_closed");
    }
}
