//! The invoke envelope exchanged in text frames.
//!
//! Wire shape (compact JSON):
//!
//! ```text
//! {"Method":"Echo","Flag":0,"Arguments":[5]}
//! ```
//!
//! `Flag` `0` marks a request/command that is dispatched to a handler method
//! by name; `1` marks a response/result. An optional `Id` correlates a reply
//! with its request when the peer supplies one.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::CodecError;

/// Interpretation of an envelope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum InvokeFlag {
    /// A request or command, dispatched by method name.
    #[default]
    Request = 0,
    /// A response carrying a single result value.
    Response = 1,
}

/// Rejected numeric flag value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid envelope flag {0}, expected 0 or 1")]
pub struct InvalidFlag(pub u8);

impl From<InvokeFlag> for u8 {
    fn from(flag: InvokeFlag) -> Self {
        flag as u8
    }
}

impl TryFrom<u8> for InvokeFlag {
    type Error = InvalidFlag;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            other => Err(InvalidFlag(other)),
        }
    }
}

/// A remote invocation or its result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvokeMessage {
    /// Method name. Matched case-insensitively on dispatch.
    #[serde(rename = "Method", alias = "method")]
    pub method: String,
    /// Request or response marker.
    #[serde(rename = "Flag", alias = "flag", default)]
    pub flag: InvokeFlag,
    /// Positional arguments (requests) or the single result (responses).
    #[serde(rename = "Arguments", alias = "arguments", default)]
    pub arguments: Vec<Value>,
    /// Optional correlation identifier, echoed on replies.
    #[serde(
        rename = "Id",
        alias = "id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
}

impl InvokeMessage {
    /// Build a request-flagged envelope.
    pub fn request(method: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            flag: InvokeFlag::Request,
            arguments,
            id: None,
        }
    }

    /// Build a response-flagged envelope carrying one result value.
    pub fn response(method: impl Into<String>, result: Value) -> Self {
        Self {
            method: method.into(),
            flag: InvokeFlag::Response,
            arguments: vec![result],
            id: None,
        }
    }

    /// Attach a correlation identifier.
    #[must_use]
    pub fn with_id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }

    /// Build the reply to this request, keeping its method name and id.
    #[must_use]
    pub fn reply_to(self, result: Value) -> Self {
        Self::response(self.method, result).with_id(self.id)
    }

    /// Whether this envelope should be dispatched to a handler method.
    pub fn is_request(&self) -> bool {
        self.flag == InvokeFlag::Request
    }
}

/// Encode an envelope as compact JSON text.
pub fn encode(message: &InvokeMessage) -> Result<String, CodecError> {
    serde_json::to_string(message).map_err(CodecError::Encode)
}

/// Decode an envelope from JSON text.
pub fn decode(text: &str) -> Result<InvokeMessage, CodecError> {
    serde_json::from_str(text).map_err(CodecError::Decode)
}

/// Decode an envelope from UTF-8 JSON bytes.
pub fn decode_slice(bytes: &[u8]) -> Result<InvokeMessage, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn encode_request_is_compact() {
        let msg = InvokeMessage::request("Echo", vec![json!(5)]);
        insta::assert_snapshot!(encode(&msg).unwrap(), @r#"{"Method":"Echo","Flag":0,"Arguments":[5]}"#);
    }

    #[test]
    fn encode_response_with_id() {
        let msg = InvokeMessage::response("Echo", json!("hi")).with_id(Some("r1".into()));
        insta::assert_snapshot!(encode(&msg).unwrap(), @r#"{"Method":"Echo","Flag":1,"Arguments":["hi"],"Id":"r1"}"#);
    }

    #[test]
    fn decode_request() {
        let msg = decode(r#"{"Method":"Echo","Flag":0,"Arguments":[5]}"#).unwrap();
        assert_eq!(msg.method, "Echo");
        assert_eq!(msg.flag, InvokeFlag::Request);
        assert_eq!(msg.arguments, vec![json!(5)]);
        assert!(msg.id.is_none());
        assert!(msg.is_request());
    }

    #[test]
    fn decode_accepts_lowercase_fields() {
        let msg = decode(r#"{"method":"Add","flag":1,"arguments":[1,2],"id":"x"}"#).unwrap();
        assert_eq!(msg.method, "Add");
        assert_eq!(msg.flag, InvokeFlag::Response);
        assert_eq!(msg.arguments.len(), 2);
        assert_eq!(msg.id.as_deref(), Some("x"));
    }

    #[test]
    fn missing_flag_and_arguments_default() {
        let msg = decode(r#"{"Method":"Ping"}"#).unwrap();
        assert_eq!(msg.flag, InvokeFlag::Request);
        assert!(msg.arguments.is_empty());
    }

    #[test]
    fn invalid_flag_rejected() {
        let err = decode(r#"{"Method":"Echo","Flag":2,"Arguments":[]}"#).unwrap_err();
        assert_matches!(err, CodecError::Decode(_));
        assert!(err.to_string().contains("invalid envelope flag 2"), "got: {err}");
    }

    #[test]
    fn missing_method_rejected() {
        assert_matches!(decode(r#"{"Flag":0}"#), Err(CodecError::Decode(_)));
    }

    #[test]
    fn malformed_json_rejected() {
        assert_matches!(decode("{not json"), Err(CodecError::Decode(_)));
        assert_matches!(decode(""), Err(CodecError::Decode(_)));
        assert_matches!(decode("[1,2,3]"), Err(CodecError::Decode(_)));
    }

    #[test]
    fn reencoding_yields_canonical_form() {
        let raw = "{ \"Method\" : \"Echo\",\n \"Flag\": 0, \"Arguments\": [ 5, {\"a\": true} ] }";
        let encoded = encode(&decode(raw).unwrap()).unwrap();
        assert_eq!(encoded, r#"{"Method":"Echo","Flag":0,"Arguments":[5,{"a":true}]}"#);
        assert_eq!(decode(&encoded).unwrap(), decode(raw).unwrap());
    }

    #[test]
    fn reply_keeps_method_and_id() {
        let request = InvokeMessage::request("echo", vec![json!(1)]).with_id(Some("7".into()));
        let reply = request.reply_to(json!(1));
        assert_eq!(reply.method, "echo");
        assert_eq!(reply.flag, InvokeFlag::Response);
        assert_eq!(reply.arguments, vec![json!(1)]);
        assert_eq!(reply.id.as_deref(), Some("7"));
    }

    #[test]
    fn decode_slice_matches_decode() {
        let raw = br#"{"Method":"Echo","Flag":0,"Arguments":["x"]}"#;
        assert_eq!(decode_slice(raw).unwrap().arguments, vec![json!("x")]);
        assert_matches!(decode_slice(&[0xff, 0xfe]), Err(CodecError::Decode(_)));
    }

    #[test]
    fn flag_conversions() {
        assert_eq!(u8::from(InvokeFlag::Request), 0);
        assert_eq!(u8::from(InvokeFlag::Response), 1);
        assert_eq!(InvokeFlag::try_from(1), Ok(InvokeFlag::Response));
        assert_eq!(InvokeFlag::try_from(9), Err(InvalidFlag(9)));
    }
}
