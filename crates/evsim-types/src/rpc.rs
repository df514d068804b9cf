//! OCPP-J RPC framing.
//!
//! Every message on the wire is a JSON array whose first element selects
//! the frame type: `[2, id, action, payload]` for CALL, `[3, id, payload]`
//! for CALLRESULT and `[4, id, errorCode, errorDescription, errorDetails]`
//! for CALLERROR.

use crate::error::{ErrorCode, OcppError, OcppResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Frame type discriminant, the first element of every wire array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl TryFrom<u64> for MessageType {
    type Error = OcppError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(MessageType::Call),
            3 => Ok(MessageType::CallResult),
            4 => Ok(MessageType::CallError),
            other => Err(OcppError::Protocol(format!(
                "unknown message type {other}"
            ))),
        }
    }
}

/// A request frame sent by either peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    /// Build a CALL with a freshly generated message id.
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            action: action.into(),
            payload,
        }
    }
}

/// A successful response frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

/// An error response frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl CallError {
    /// Build a CALLERROR answering `message_id` from an [`OcppError`].
    pub fn from_error(message_id: impl Into<String>, error: &OcppError) -> Self {
        Self {
            message_id: message_id.into(),
            code: error.code(),
            description: error.description(),
            details: error.details(),
        }
    }
}

/// A fully parsed wire frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl Frame {
    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Call(_) => MessageType::Call,
            Frame::CallResult(_) => MessageType::CallResult,
            Frame::CallError(_) => MessageType::CallError,
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            Frame::Call(f) => &f.message_id,
            Frame::CallResult(f) => &f.message_id,
            Frame::CallError(f) => &f.message_id,
        }
    }

    /// Serialize to the wire array representation.
    pub fn to_wire(&self) -> OcppResult<String> {
        let value = match self {
            Frame::Call(f) => {
                serde_json::json!([MessageType::Call as u8, f.message_id, f.action, f.payload])
            }
            Frame::CallResult(f) => {
                serde_json::json!([MessageType::CallResult as u8, f.message_id, f.payload])
            }
            Frame::CallError(f) => serde_json::json!([
                MessageType::CallError as u8,
                f.message_id,
                f.code.as_str(),
                f.description,
                f.details
            ]),
        };
        Ok(serde_json::to_string(&value)?)
    }
}

/// Why an inbound frame could not be parsed, with whatever identifying
/// information was recoverable so the receiver can still answer with a
/// CALLERROR.
#[derive(Debug, Clone)]
pub struct FrameParseError {
    /// The message id, when the array carried a readable one
    pub message_id: Option<String>,
    /// The numeric message type, when the array carried a readable one
    pub message_type: Option<u64>,
    pub reason: String,
}

impl FrameParseError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            message_id: None,
            message_type: None,
            reason: reason.into(),
        }
    }

    /// True when the offending inbound was itself a CALLERROR, in which
    /// case no error reply must be produced.
    pub fn inbound_was_call_error(&self) -> bool {
        self.message_type == Some(MessageType::CallError as u64)
    }
}

impl std::fmt::Display for FrameParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Parse one inbound text frame.
///
/// Best effort: the message id and type are extracted before the arity
/// and element types are checked, so a malformed frame can still be
/// answered on the wire.
pub fn parse_frame(text: &str) -> Result<Frame, FrameParseError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| FrameParseError::new(format!("invalid JSON: {e}")))?;

    let items = value
        .as_array()
        .ok_or_else(|| FrameParseError::new("frame is not a JSON array"))?;

    let mut error = FrameParseError::new(String::new());
    error.message_type = items.first().and_then(Value::as_u64);
    error.message_id = items
        .get(1)
        .and_then(Value::as_str)
        .map(|s| s.to_string());

    let fail = |mut e: FrameParseError, reason: &str| {
        e.reason = reason.to_string();
        e
    };

    let Some(message_type) = error.message_type else {
        return Err(fail(error, "missing or non-numeric message type"));
    };
    let Some(message_id) = error.message_id.clone() else {
        return Err(fail(error, "missing or non-string message id"));
    };

    match MessageType::try_from(message_type) {
        Ok(MessageType::Call) => {
            if items.len() != 4 {
                return Err(fail(error, "CALL frame must have 4 elements"));
            }
            let Some(action) = items[2].as_str() else {
                return Err(fail(error, "CALL action must be a string"));
            };
            Ok(Frame::Call(Call {
                message_id,
                action: action.to_string(),
                payload: items[3].clone(),
            }))
        }
        Ok(MessageType::CallResult) => {
            if items.len() != 3 {
                return Err(fail(error, "CALLRESULT frame must have 3 elements"));
            }
            Ok(Frame::CallResult(CallResult {
                message_id,
                payload: items[2].clone(),
            }))
        }
        Ok(MessageType::CallError) => {
            if items.len() != 5 {
                return Err(fail(error, "CALLERROR frame must have 5 elements"));
            }
            let code = items[2].as_str().map(ErrorCode::parse).unwrap_or(ErrorCode::GenericError);
            Ok(Frame::CallError(CallError {
                message_id,
                code,
                description: items[3].as_str().unwrap_or_default().to_string(),
                details: items[4].clone(),
            }))
        }
        Err(_) => Err(fail(
            error,
            &format!("unknown message type {message_type}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_frame_round_trip() {
        let call = Call::new("Heartbeat", json!({}));
        let wire = Frame::Call(call.clone()).to_wire().unwrap();

        match parse_frame(&wire).unwrap() {
            Frame::Call(parsed) => {
                assert_eq!(parsed.message_id, call.message_id);
                assert_eq!(parsed.action, "Heartbeat");
                assert_eq!(parsed.payload, json!({}));
            }
            other => panic!("expected CALL, got {other:?}"),
        }
    }

    #[test]
    fn call_result_round_trip() {
        let wire = r#"[3,"id-1",{"currentTime":"2024-01-01T00:00:00Z"}]"#;
        match parse_frame(wire).unwrap() {
            Frame::CallResult(result) => {
                assert_eq!(result.message_id, "id-1");
                assert_eq!(result.payload["currentTime"], "2024-01-01T00:00:00Z");
            }
            other => panic!("expected CALLRESULT, got {other:?}"),
        }
    }

    #[test]
    fn call_error_round_trip() {
        let frame = Frame::CallError(CallError {
            message_id: "id-2".to_string(),
            code: ErrorCode::NotImplemented,
            description: "no such action".to_string(),
            details: json!({}),
        });
        let wire = frame.to_wire().unwrap();
        assert_eq!(parse_frame(&wire).unwrap(), frame);
    }

    #[test]
    fn fresh_message_ids_are_unique() {
        let a = Call::new("Heartbeat", json!({}));
        let b = Call::new("Heartbeat", json!({}));
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn non_array_frame_is_rejected() {
        let err = parse_frame(r#"{"not":"an array"}"#).unwrap_err();
        assert!(err.message_id.is_none());
    }

    #[test]
    fn unknown_message_type_keeps_id() {
        let err = parse_frame(r#"[9,"id-3","Whatever",{}]"#).unwrap_err();
        assert_eq!(err.message_id.as_deref(), Some("id-3"));
        assert_eq!(err.message_type, Some(9));
        assert!(!err.inbound_was_call_error());
    }

    #[test]
    fn wrong_arity_call_is_rejected() {
        let err = parse_frame(r#"[2,"id-4","Heartbeat"]"#).unwrap_err();
        assert_eq!(err.message_id.as_deref(), Some("id-4"));
    }

    #[test]
    fn malformed_call_error_is_flagged_as_such() {
        let err = parse_frame(r#"[4,"id-5"]"#).unwrap_err();
        assert!(err.inbound_was_call_error());
    }

    #[test]
    fn call_error_from_ocpp_error() {
        let source = OcppError::not_implemented("FancyAction");
        let frame = CallError::from_error("id-6", &source);
        assert_eq!(frame.code, ErrorCode::NotImplemented);
        assert!(frame.description.contains("FancyAction"));
    }
}
