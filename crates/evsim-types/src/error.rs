//! Error types shared by every layer of the simulator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// RPC error codes defined by the OCPP-J framing specification.
///
/// These travel on the wire inside CALLERROR frames and double as the
/// internal error taxonomy of the station core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ErrorCode {
    /// Requested action is not known by the receiver
    NotImplemented,
    /// Requested action is recognized but not supported
    NotSupported,
    /// An internal error occurred while processing the action
    InternalError,
    /// Payload for the action is incomplete
    ProtocolError,
    /// A security issue prevented the receiver from completing the action
    SecurityError,
    /// Payload is syntactically incorrect or does not match the PDU structure
    FormationViolation,
    /// Payload is syntactically correct but a field holds an invalid value
    PropertyConstraintViolation,
    /// Payload violates occurrence constraints
    OccurrenceConstraintViolation,
    /// Payload violates data type constraints
    TypeConstraintViolation,
    /// Any other error
    GenericError,
}

impl ErrorCode {
    /// The exact string the OCPP-J specification uses for this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::GenericError => "GenericError",
        }
    }

    /// Parse a wire error-code string, falling back to `GenericError` for
    /// codes this implementation does not know.
    pub fn parse(code: &str) -> Self {
        match code {
            "NotImplemented" => ErrorCode::NotImplemented,
            "NotSupported" => ErrorCode::NotSupported,
            "InternalError" => ErrorCode::InternalError,
            "ProtocolError" => ErrorCode::ProtocolError,
            "SecurityError" => ErrorCode::SecurityError,
            "FormationViolation" => ErrorCode::FormationViolation,
            "PropertyConstraintViolation" => ErrorCode::PropertyConstraintViolation,
            "OccurrenceConstraintViolation" => ErrorCode::OccurrenceConstraintViolation,
            "TypeConstraintViolation" => ErrorCode::TypeConstraintViolation,
            _ => ErrorCode::GenericError,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error produced by OCPP message handling and the RPC transport.
#[derive(Error, Debug, Clone)]
pub enum OcppError {
    /// An OCPP-level error carrying a wire error code. This is the form
    /// that crosses the socket as a CALLERROR and the form pending
    /// requests are rejected with.
    #[error("{code}: {description}")]
    Call {
        code: ErrorCode,
        description: String,
        details: serde_json::Value,
    },

    /// JSON serialization or deserialization failure
    #[error("JSON error: {0}")]
    Json(String),

    /// Frame-level violation: wrong arity, wrong types, unknown message type
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Transport failure outside the OCPP error space
    #[error("transport error: {0}")]
    Transport(String),
}

impl OcppError {
    /// Generic OCPP error with a free-form description.
    pub fn generic(description: impl Into<String>) -> Self {
        OcppError::Call {
            code: ErrorCode::GenericError,
            description: description.into(),
            details: serde_json::Value::Object(Default::default()),
        }
    }

    /// Unknown inbound action.
    pub fn not_implemented(action: &str) -> Self {
        OcppError::Call {
            code: ErrorCode::NotImplemented,
            description: format!("{action} is not implemented"),
            details: serde_json::Value::Object(Default::default()),
        }
    }

    /// A CALL did not receive its response within the RPC timeout.
    pub fn timeout(message_id: &str) -> Self {
        OcppError::generic(format!("Timeout for message id '{message_id}'"))
    }

    /// The frame could not be sent and was placed in the offline queue.
    pub fn buffered(action: &str) -> Self {
        OcppError::generic(format!("WebSocket closed, message buffered: {action}"))
    }

    /// The wire error code this error maps to.
    pub fn code(&self) -> ErrorCode {
        match self {
            OcppError::Call { code, .. } => *code,
            OcppError::Json(_) => ErrorCode::FormationViolation,
            OcppError::Protocol(_) => ErrorCode::ProtocolError,
            OcppError::Transport(_) => ErrorCode::GenericError,
        }
    }

    /// The human readable description carried on the wire.
    pub fn description(&self) -> String {
        match self {
            OcppError::Call { description, .. } => description.clone(),
            other => other.to_string(),
        }
    }

    /// Additional structured details, empty object when there are none.
    pub fn details(&self) -> serde_json::Value {
        match self {
            OcppError::Call { details, .. } => details.clone(),
            _ => serde_json::Value::Object(Default::default()),
        }
    }
}

impl From<serde_json::Error> for OcppError {
    fn from(err: serde_json::Error) -> Self {
        OcppError::Json(err.to_string())
    }
}

/// Result alias used across the protocol crates.
pub type OcppResult<T> = Result<T, OcppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_round_trip() {
        for code in [
            ErrorCode::NotImplemented,
            ErrorCode::NotSupported,
            ErrorCode::InternalError,
            ErrorCode::ProtocolError,
            ErrorCode::SecurityError,
            ErrorCode::FormationViolation,
            ErrorCode::PropertyConstraintViolation,
            ErrorCode::OccurrenceConstraintViolation,
            ErrorCode::TypeConstraintViolation,
            ErrorCode::GenericError,
        ] {
            assert_eq!(ErrorCode::parse(code.as_str()), code);
        }
    }

    #[test]
    fn unknown_code_becomes_generic() {
        assert_eq!(ErrorCode::parse("NoSuchCode"), ErrorCode::GenericError);
    }

    #[test]
    fn generic_error_carries_code() {
        let err = OcppError::generic("boom");
        assert_eq!(err.code(), ErrorCode::GenericError);
        assert_eq!(err.description(), "boom");
        assert!(err.details().as_object().unwrap().is_empty());
    }

    #[test]
    fn timeout_message_names_the_id() {
        let err = OcppError::timeout("abc-123");
        assert!(err.description().contains("abc-123"));
    }

    #[test]
    fn json_error_maps_to_formation_violation() {
        let json_err = serde_json::from_str::<i32>("nope").unwrap_err();
        let err = OcppError::from(json_err);
        assert_eq!(err.code(), ErrorCode::FormationViolation);
    }
}
