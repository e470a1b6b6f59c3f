//! Error types for the codec, transport, dispatch, and send paths.

use crate::ids::ConnectionId;

// ── Error code constants ────────────────────────────────────────────

/// Text frame could not be decoded as an envelope.
pub const MALFORMED_ENVELOPE: &str = "MALFORMED_ENVELOPE";
/// No handler method with the requested name.
pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
/// Argument count differs from the method's declared arity.
pub const PARAMETER_MISMATCH: &str = "PARAMETER_MISMATCH";
/// An argument could not be converted to the declared parameter type.
pub const INVALID_ARGUMENT: &str = "INVALID_ARGUMENT";
/// The handler method body returned an error.
pub const HANDLER_FAILED: &str = "HANDLER_FAILED";
/// The handler method body panicked.
pub const HANDLER_PANICKED: &str = "HANDLER_PANICKED";

/// Envelope encode/decode failure.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Input text is not a valid envelope.
    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),
    /// Envelope could not be serialized.
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Failure reported by the underlying duplex transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport has already been closed.
    #[error("transport closed")]
    Closed,
    /// Writing a frame failed.
    #[error("send failed: {0}")]
    Send(String),
    /// Reading a frame failed.
    #[error("receive failed: {0}")]
    Receive(String),
}

/// Per-frame failure routed to the handler's resolve-error hook.
///
/// None of these close the connection and none produce a reply frame.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// Text frame is not a well-formed envelope.
    #[error("{0}")]
    Malformed(#[source] CodecError),

    /// No method registered under this name.
    #[error("method '{method}' not found")]
    MethodNotFound {
        /// Requested method name.
        method: String,
    },

    /// Argument count does not match the method's arity.
    #[error("method '{method}' expects {expected} argument(s) but received {actual}")]
    ParameterMismatch {
        /// Requested method name.
        method: String,
        /// Declared parameter count.
        expected: usize,
        /// Received argument count.
        actual: usize,
    },

    /// An argument could not be deserialized into the parameter type.
    #[error("argument {index} of '{method}' is invalid: {source}")]
    InvalidArgument {
        /// Requested method name.
        method: String,
        /// Zero-based argument position.
        index: usize,
        /// Deserialization failure.
        #[source]
        source: serde_json::Error,
    },

    /// The method body returned an error.
    #[error("method '{method}' failed: {message}")]
    Handler {
        /// Requested method name.
        method: String,
        /// Rendered error chain.
        message: String,
    },

    /// The method body panicked.
    #[error("method '{method}' panicked: {message}")]
    Panicked {
        /// Requested method name.
        method: String,
        /// Panic payload, when it was a string.
        message: String,
    },
}

impl ResolveError {
    /// Machine-readable error code for this variant.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => MALFORMED_ENVELOPE,
            Self::MethodNotFound { .. } => METHOD_NOT_FOUND,
            Self::ParameterMismatch { .. } => PARAMETER_MISMATCH,
            Self::InvalidArgument { .. } => INVALID_ARGUMENT,
            Self::Handler { .. } => HANDLER_FAILED,
            Self::Panicked { .. } => HANDLER_PANICKED,
        }
    }

    /// Method name the failure relates to, if the envelope was decoded.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Malformed(_) => None,
            Self::MethodNotFound { method }
            | Self::ParameterMismatch { method, .. }
            | Self::InvalidArgument { method, .. }
            | Self::Handler { method, .. }
            | Self::Panicked { method, .. } => Some(method.as_str()),
        }
    }
}

impl From<CodecError> for ResolveError {
    fn from(err: CodecError) -> Self {
        Self::Malformed(err)
    }
}

/// Failure pushing an invocation to a client.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Envelope could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The transport rejected the frame.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The connection has been torn down.
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
    /// The connection's outbound queue is full; the frame was dropped.
    #[error("outbound queue for connection {0} is full")]
    Full(ConnectionId),
}
