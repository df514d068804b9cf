//! Error type for the station core.

use evsim_types::OcppError;
use thiserror::Error;

/// Errors raised by station lifecycle and session management.
#[derive(Error, Debug)]
pub enum StationError {
    /// Station template could not be loaded or is invalid
    #[error("template error: {0}")]
    Template(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket connect or handshake failure
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// An OCPP-level failure surfaced through the RPC layer
    #[error(transparent)]
    Ocpp(#[from] OcppError),

    /// Operation attempted in a state that does not allow it
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl StationError {
    pub fn template(message: impl Into<String>) -> Self {
        StationError::Template(message.into())
    }

    pub fn websocket(message: impl std::fmt::Display) -> Self {
        StationError::WebSocket(message.to_string())
    }
}

/// Result alias for station operations.
pub type StationResult<T> = Result<T, StationError>;
