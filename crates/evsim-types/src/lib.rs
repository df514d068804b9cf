//! # evsim-types
//!
//! Protocol vocabulary for the evsim charging-station simulator: the
//! OCPP-J RPC frame types, the OCPP 1.6 enums and shared structs, and the
//! error type used on the wire and internally.

pub mod error;
pub mod rpc;
pub mod v16;

pub use error::{ErrorCode, OcppError, OcppResult};
pub use rpc::{parse_frame, Call, CallError, CallResult, Frame, FrameParseError, MessageType};

/// Re-export commonly used foundation types.
pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;
