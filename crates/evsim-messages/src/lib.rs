//! # evsim-messages
//!
//! Typed request and response payloads for every OCPP 1.6-J action the
//! simulator speaks, plus the [`OcppCall`] trait binding an action name to
//! its request/response pair.

pub mod v16;

pub use v16::*;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Binds a request payload to its OCPP action name and response type.
///
/// Implemented by every `*Request` struct in [`v16`]; the station core
/// uses it to send typed CALLs and decode the matching CALLRESULT.
pub trait OcppCall: Serialize + DeserializeOwned + Send + Sync {
    /// The action name as it appears in the CALL frame.
    const ACTION: &'static str;
    /// The payload type of the CALLRESULT answering this request.
    type Response: Serialize + DeserializeOwned + Send + Sync;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_names_match_the_ocpp_dispatch_keys() {
        assert_eq!(AuthorizeRequest::ACTION, "Authorize");
        assert_eq!(BootNotificationRequest::ACTION, "BootNotification");
        assert_eq!(HeartbeatRequest::ACTION, "Heartbeat");
        assert_eq!(MeterValuesRequest::ACTION, "MeterValues");
        assert_eq!(StartTransactionRequest::ACTION, "StartTransaction");
        assert_eq!(StatusNotificationRequest::ACTION, "StatusNotification");
        assert_eq!(StopTransactionRequest::ACTION, "StopTransaction");
        assert_eq!(ChangeAvailabilityRequest::ACTION, "ChangeAvailability");
        assert_eq!(ChangeConfigurationRequest::ACTION, "ChangeConfiguration");
        assert_eq!(ClearCacheRequest::ACTION, "ClearCache");
        assert_eq!(ClearChargingProfileRequest::ACTION, "ClearChargingProfile");
        assert_eq!(GetConfigurationRequest::ACTION, "GetConfiguration");
        assert_eq!(
            RemoteStartTransactionRequest::ACTION,
            "RemoteStartTransaction"
        );
        assert_eq!(
            RemoteStopTransactionRequest::ACTION,
            "RemoteStopTransaction"
        );
        assert_eq!(ResetRequest::ACTION, "Reset");
        assert_eq!(SetChargingProfileRequest::ACTION, "SetChargingProfile");
        assert_eq!(UnlockConnectorRequest::ACTION, "UnlockConnector");
    }
}
