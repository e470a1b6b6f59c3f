//! axum WebSocket adapter for the frame transport traits.

use async_trait::async_trait;
use axum::extract::ws::{self, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use socketry_core::{CloseFrame, Frame, FrameSink, FrameStream, TransportError};

/// Write half of an upgraded WebSocket.
pub struct WsSink(SplitSink<WebSocket, Message>);

/// Read half of an upgraded WebSocket.
pub struct WsStream(SplitStream<WebSocket>);

/// Split an upgraded socket into transport halves.
pub fn split_socket(socket: WebSocket) -> (WsSink, WsStream) {
    let (sink, stream) = socket.split();
    (WsSink(sink), WsStream(stream))
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.0
            .send(to_message(frame))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self, frame: Option<CloseFrame>) -> Result<(), TransportError> {
        if let Some(frame) = frame {
            self.0
                .send(to_message(Frame::Close(Some(frame))))
                .await
                .map_err(|e| TransportError::Send(e.to_string()))?;
        }
        self.0
            .close()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

#[async_trait]
impl FrameStream for WsStream {
    async fn receive(&mut self) -> Option<Result<Frame, TransportError>> {
        let next = self.0.next().await?;
        Some(
            next.map(from_message)
                .map_err(|e| TransportError::Receive(e.to_string())),
        )
    }
}

/// Convert a transport frame into an axum message.
pub fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data),
        Frame::Ping(data) => Message::Ping(data),
        Frame::Pong(data) => Message::Pong(data),
        Frame::Close(close) => Message::Close(close.map(|c| ws::CloseFrame {
            code: c.code,
            reason: c.reason.into(),
        })),
    }
}

/// Convert an axum message into a transport frame.
pub fn from_message(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text.as_str().to_owned()),
        Message::Binary(data) => Frame::Binary(data),
        Message::Ping(data) => Frame::Ping(data),
        Message::Pong(data) => Frame::Pong(data),
        Message::Close(close) => {
            Frame::Close(close.map(|c| CloseFrame::new(c.code, c.reason.as_str())))
        }
    }
}
