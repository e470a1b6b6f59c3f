//! Duplex frame transport abstraction.
//!
//! The HTTP upgrade and socket setup happen outside this crate. What arrives
//! here is an established connection split into a [`FrameSink`] (writes) and a
//! [`FrameStream`] (reads). Frames are whole messages; fragment reassembly is
//! the transport's job.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::errors::TransportError;

/// Standard close status codes.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint is going away (server shutdown).
    pub const GOING_AWAY: u16 = 1001;
    /// Unexpected condition on the server.
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Close status and reason.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseFrame {
    /// Status code.
    pub code: u16,
    /// Human-readable reason.
    pub reason: String,
}

impl CloseFrame {
    /// Create a close frame.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// One complete message on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text, carrying invoke envelopes.
    Text(String),
    /// Raw bytes, delivered to the handler untouched.
    Binary(Bytes),
    /// Transport-level ping.
    Ping(Bytes),
    /// Transport-level pong.
    Pong(Bytes),
    /// Close request, with optional status.
    Close(Option<CloseFrame>),
}

impl Frame {
    /// Build a text frame.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Short frame kind name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::Close(_) => "close",
        }
    }
}

/// Write half of a duplex connection.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Write one frame.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Close the connection, optionally sending a close frame first.
    async fn close(&mut self, frame: Option<CloseFrame>) -> Result<(), TransportError>;
}

/// Read half of a duplex connection.
#[async_trait]
pub trait FrameStream: Send + 'static {
    /// Wait for the next frame. `None` means the stream has ended.
    async fn receive(&mut self) -> Option<Result<Frame, TransportError>>;
}

#[async_trait]
impl FrameSink for Box<dyn FrameSink> {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        (**self).send(frame).await
    }

    async fn close(&mut self, frame: Option<CloseFrame>) -> Result<(), TransportError> {
        (**self).close(frame).await
    }
}

// ── In-process channel transport ────────────────────────────────────

/// Build an in-process duplex backed by bounded channels.
///
/// The sink and stream are handed to the server side; the [`ChannelPeer`]
/// plays the remote client.
pub fn channel(buffer: usize) -> (ChannelSink, ChannelStream, ChannelPeer) {
    let (to_peer_tx, to_peer_rx) = mpsc::channel(buffer);
    let (to_server_tx, to_server_rx) = mpsc::channel(buffer);
    (
        ChannelSink {
            tx: Some(to_peer_tx),
        },
        ChannelStream { rx: to_server_rx },
        ChannelPeer {
            tx: Some(to_server_tx),
            rx: to_peer_rx,
        },
    )
}

/// Server-side write half of a [`channel`] transport.
pub struct ChannelSink {
    tx: Option<mpsc::Sender<Frame>>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self, frame: Option<CloseFrame>) -> Result<(), TransportError> {
        let tx = self.tx.take().ok_or(TransportError::Closed)?;
        if let Some(frame) = frame {
            // The peer may already be gone; closing still succeeds locally.
            let _ = tx.send(Frame::Close(Some(frame))).await;
        }
        Ok(())
    }
}

/// Server-side read half of a [`channel`] transport.
pub struct ChannelStream {
    rx: mpsc::Receiver<Result<Frame, TransportError>>,
}

#[async_trait]
impl FrameStream for ChannelStream {
    async fn receive(&mut self) -> Option<Result<Frame, TransportError>> {
        self.rx.recv().await
    }
}

/// The remote end of a [`channel`] transport.
pub struct ChannelPeer {
    tx: Option<mpsc::Sender<Result<Frame, TransportError>>>,
    rx: mpsc::Receiver<Frame>,
}

impl ChannelPeer {
    /// Send a frame to the server side.
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(Ok(frame)).await.map_err(|_| TransportError::Closed)
    }

    /// Send a text frame to the server side.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.send(Frame::Text(text.into())).await
    }

    /// Make the server's next receive fail with a transport error.
    pub async fn fail(&self, reason: impl Into<String>) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(Err(TransportError::Receive(reason.into())))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Send a close frame and stop sending.
    pub async fn close(&mut self, frame: Option<CloseFrame>) -> Result<(), TransportError> {
        self.send(Frame::Close(frame)).await?;
        self.tx = None;
        Ok(())
    }

    /// Drop the write side without a close frame; the server sees the stream end.
    pub fn disconnect(&mut self) {
        self.tx = None;
    }

    /// Wait for the next frame from the server. `None` once the server closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Take a frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }
}
