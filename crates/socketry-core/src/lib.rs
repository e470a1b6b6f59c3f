//! # socketry-core
//!
//! Shared building blocks for the socketry messaging layer.
//!
//! - [`envelope`]: the `{Method, Flag, Arguments}` invoke message and its JSON codec
//! - [`transport`]: duplex frame sink/stream traits and an in-process channel transport
//! - [`errors`]: codec, transport, dispatch, and send error types
//! - [`ids`]: connection identifiers

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod transport;

pub use envelope::{InvokeFlag, InvokeMessage};
pub use errors::{CodecError, ResolveError, SendError, TransportError};
pub use ids::ConnectionId;
pub use transport::{CloseFrame, Frame, FrameSink, FrameStream};
