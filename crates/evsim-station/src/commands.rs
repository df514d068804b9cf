//! Inbound command dispatch and outbound OCPP requests.
//!
//! Inbound CALLs are routed by action name to a handler; a handler error
//! becomes a CALLERROR on the wire and an error log locally. Outbound
//! requests go through [`Station::call_typed`] which pairs the typed
//! payload with its action name and decodes the response.

use crate::meter;
use crate::station::Station;
use evsim_messages::{
    AuthorizeRequest, BootNotificationRequest, BootNotificationResponse,
    ChangeAvailabilityRequest, ChangeAvailabilityResponse, ChangeConfigurationRequest,
    ChangeConfigurationResponse, ClearCacheRequest, ClearCacheResponse,
    ClearChargingProfileRequest, ClearChargingProfileResponse, GetConfigurationRequest,
    GetConfigurationResponse, HeartbeatRequest, HeartbeatResponse, MeterValuesRequest,
    OcppCall, RemoteStartTransactionRequest, RemoteStartTransactionResponse,
    RemoteStopTransactionRequest, RemoteStopTransactionResponse, ResetRequest, ResetResponse,
    SetChargingProfileRequest, SetChargingProfileResponse, StartTransactionRequest,
    StartTransactionResponse, StatusNotificationRequest, StopTransactionRequest,
    UnlockConnectorRequest, UnlockConnectorResponse,
};
use evsim_types::rpc::{Call, Frame};
use evsim_types::v16::{
    AvailabilityStatus, AvailabilityType, ChargePointErrorCode, ChargePointStatus,
    ChargingProfilePurposeType, ChargingProfileStatus, ClearCacheStatus,
    ClearChargingProfileStatus, IdTagInfo, Reason, RemoteStartStopStatus, ResetStatus, ResetType,
    UnlockStatus,
};
use evsim_types::{parse_frame, OcppError, OcppResult};
use crate::config_store::{keys, TimerRestart};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

fn decode<T: DeserializeOwned>(payload: Value) -> OcppResult<T> {
    serde_json::from_value(payload).map_err(OcppError::from)
}

fn encode<T: Serialize>(response: T) -> OcppResult<Value> {
    serde_json::to_value(response).map_err(OcppError::from)
}

/// Work a handler schedules to run after its CALLRESULT went out.
///
/// Remote start/stop answer first and drive the transaction afterwards,
/// so the Central System sees the acknowledgement before the
/// StatusNotification/StartTransaction exchange begins.
#[derive(Debug)]
pub(crate) enum FollowUp {
    StartTransaction { connector_id: u32, id_tag: String },
    StopTransaction { connector_id: u32 },
}

/// A dispatched response payload plus optional post-response work.
pub(crate) struct Dispatched {
    payload: Value,
    follow_up: Option<FollowUp>,
}

fn done<T: Serialize>(response: T) -> OcppResult<Dispatched> {
    Ok(Dispatched {
        payload: encode(response)?,
        follow_up: None,
    })
}

fn done_then<T: Serialize>(response: T, follow_up: FollowUp) -> OcppResult<Dispatched> {
    Ok(Dispatched {
        payload: encode(response)?,
        follow_up: Some(follow_up),
    })
}

impl Station {
    /// Feed one inbound text frame through parsing and dispatch. The
    /// session reader calls this for every received WebSocket text
    /// message; tests and alternative socket layers may call it directly.
    pub async fn handle_frame(self: &Arc<Self>, text: &str) {
        match parse_frame(text) {
            Ok(Frame::Call(call)) => {
                // handlers may issue nested RPCs; dispatch on its own task
                // so the reader keeps consuming responses meanwhile
                let station = Arc::clone(self);
                tokio::spawn(async move { station.dispatch_call(call).await });
            }
            Ok(Frame::CallResult(result)) => {
                self.transport().resolve(&result.message_id, result.payload);
            }
            Ok(Frame::CallError(error)) => {
                self.transport().reject(
                    &error.message_id,
                    OcppError::Call {
                        code: error.code,
                        description: error.description,
                        details: error.details,
                    },
                );
            }
            Err(parse_error) => {
                error!(
                    "{}: malformed inbound frame: {parse_error}",
                    self.station_id()
                );
                // answering a broken CALLERROR would start a reply storm
                if !parse_error.inbound_was_call_error() {
                    if let Some(message_id) = &parse_error.message_id {
                        let error = OcppError::generic(parse_error.reason.clone());
                        if let Err(send_error) =
                            self.transport().send_call_error(message_id, &error).await
                        {
                            error!(
                                "{}: could not answer malformed frame: {send_error}",
                                self.station_id()
                            );
                        }
                    }
                }
            }
        }
    }

    async fn dispatch_call(self: Arc<Self>, call: Call) {
        debug!(
            "{}: received {} CALL {}",
            self.station_id(),
            call.action,
            call.message_id
        );
        match self.dispatch(&call.action, call.payload).await {
            Ok(dispatched) => {
                if let Err(error) = self
                    .transport()
                    .send_call_result(&call.message_id, dispatched.payload)
                    .await
                {
                    error!(
                        "{}: could not send CALLRESULT for {}: {error}",
                        self.station_id(),
                        call.message_id
                    );
                }
                if let Some(follow_up) = dispatched.follow_up {
                    self.run_follow_up(follow_up).await;
                }
            }
            Err(error) => {
                error!(
                    "{}: handler for {} failed: {error}",
                    self.station_id(),
                    call.action
                );
                if let Err(send_error) = self
                    .transport()
                    .send_call_error(&call.message_id, &error)
                    .await
                {
                    error!(
                        "{}: could not send CALLERROR for {}: {send_error}",
                        self.station_id(),
                        call.message_id
                    );
                }
            }
        }
    }

    /// Route an inbound CALL payload to its handler.
    pub(crate) async fn dispatch(
        self: &Arc<Self>,
        action: &str,
        payload: Value,
    ) -> OcppResult<Dispatched> {
        match action {
            "Reset" => done(self.handle_reset(decode(payload)?).await?),
            "ClearCache" => done(self.handle_clear_cache(decode(payload)?).await?),
            "UnlockConnector" => done(self.handle_unlock_connector(decode(payload)?).await?),
            "GetConfiguration" => done(self.handle_get_configuration(decode(payload)?).await?),
            "ChangeConfiguration" => {
                done(self.handle_change_configuration(decode(payload)?).await?)
            }
            "SetChargingProfile" => {
                done(self.handle_set_charging_profile(decode(payload)?).await?)
            }
            "ClearChargingProfile" => {
                done(self.handle_clear_charging_profile(decode(payload)?).await?)
            }
            "ChangeAvailability" => {
                done(self.handle_change_availability(decode(payload)?).await?)
            }
            "RemoteStartTransaction" => {
                let (response, follow_up) =
                    self.handle_remote_start_transaction(decode(payload)?).await?;
                match follow_up {
                    Some(follow_up) => done_then(response, follow_up),
                    None => done(response),
                }
            }
            "RemoteStopTransaction" => {
                let (response, follow_up) =
                    self.handle_remote_stop_transaction(decode(payload)?).await?;
                match follow_up {
                    Some(follow_up) => done_then(response, follow_up),
                    None => done(response),
                }
            }
            unknown => {
                warn!("{}: unknown action {unknown}", self.station_id());
                Err(OcppError::not_implemented(unknown))
            }
        }
    }

    /// Execute post-response work scheduled by a handler.
    async fn run_follow_up(self: &Arc<Self>, follow_up: FollowUp) {
        match follow_up {
            FollowUp::StartTransaction {
                connector_id,
                id_tag,
            } => {
                {
                    let mut connectors = self.connectors.write().await;
                    if let Some(connector) = connectors.get_mut(&connector_id) {
                        connector.status = ChargePointStatus::Preparing;
                    }
                }
                if let Err(error) = self
                    .send_status_notification(connector_id, ChargePointStatus::Preparing)
                    .await
                {
                    error!(
                        "{}: preparing status notification failed: {error}",
                        self.station_id()
                    );
                }
                if let Err(error) = self.start_transaction(connector_id, &id_tag).await {
                    error!(
                        "{}: remote-start transaction failed: {error}",
                        self.station_id()
                    );
                }
            }
            FollowUp::StopTransaction { connector_id } => {
                {
                    let mut connectors = self.connectors.write().await;
                    if let Some(connector) = connectors.get_mut(&connector_id) {
                        connector.status = ChargePointStatus::Finishing;
                    }
                }
                if let Err(error) = self
                    .send_status_notification(connector_id, ChargePointStatus::Finishing)
                    .await
                {
                    error!(
                        "{}: finishing status notification failed: {error}",
                        self.station_id()
                    );
                }
                if let Err(error) = self.stop_transaction(connector_id, Reason::Remote).await {
                    error!(
                        "{}: remote-stop transaction failed: {error}",
                        self.station_id()
                    );
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Inbound command handlers
    // -----------------------------------------------------------------

    async fn handle_reset(self: &Arc<Self>, request: ResetRequest) -> OcppResult<ResetResponse> {
        let reason = match request.reset_type {
            ResetType::Hard => Reason::HardReset,
            ResetType::Soft => Reason::SoftReset,
        };
        let reset_time = self.info.read().await.reset_time;
        info!(
            "{}: {:?} reset requested, back up in {}s",
            self.station_id(),
            request.reset_type,
            reset_time.as_secs()
        );

        let station = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = station.stop(reason).await {
                error!("{}: reset stop failed: {error}", station.station_id());
            }
            tokio::time::sleep(reset_time).await;
            if let Err(error) = station.start().await {
                error!("{}: reset restart failed: {error}", station.station_id());
            }
        });

        Ok(ResetResponse {
            status: ResetStatus::Accepted,
        })
    }

    async fn handle_clear_cache(
        self: &Arc<Self>,
        _request: ClearCacheRequest,
    ) -> OcppResult<ClearCacheResponse> {
        // no authorization cache is kept
        Ok(ClearCacheResponse {
            status: ClearCacheStatus::Accepted,
        })
    }

    async fn handle_unlock_connector(
        self: &Arc<Self>,
        request: UnlockConnectorRequest,
    ) -> OcppResult<UnlockConnectorResponse> {
        let connector_id = request.connector_id;
        if connector_id == 0 {
            warn!(
                "{}: unlock requested for connector 0, not supported",
                self.station_id()
            );
            return Ok(UnlockConnectorResponse {
                status: UnlockStatus::NotSupported,
            });
        }

        let has_transaction = {
            let connectors = self.connectors.read().await;
            match connectors.get(&connector_id) {
                Some(connector) => connector.transaction_started,
                None => {
                    error!(
                        "{}: unlock requested for unknown connector {connector_id}",
                        self.station_id()
                    );
                    return Ok(UnlockConnectorResponse {
                        status: UnlockStatus::UnlockFailed,
                    });
                }
            }
        };

        let status = if has_transaction {
            match self.stop_transaction(connector_id, Reason::UnlockCommand).await {
                Ok(true) => UnlockStatus::Unlocked,
                Ok(false) => UnlockStatus::UnlockFailed,
                Err(error) => {
                    error!(
                        "{}: stopping transaction for unlock failed: {error}",
                        self.station_id()
                    );
                    UnlockStatus::UnlockFailed
                }
            }
        } else {
            {
                let mut connectors = self.connectors.write().await;
                if let Some(connector) = connectors.get_mut(&connector_id) {
                    connector.status = ChargePointStatus::Available;
                }
            }
            self.send_status_notification(connector_id, ChargePointStatus::Available)
                .await?;
            UnlockStatus::Unlocked
        };

        Ok(UnlockConnectorResponse { status })
    }

    async fn handle_get_configuration(
        self: &Arc<Self>,
        request: GetConfigurationRequest,
    ) -> OcppResult<GetConfigurationResponse> {
        let config = self.config.read().await;
        let (known, unknown) = config.get_configuration(request.key.as_deref());
        Ok(GetConfigurationResponse {
            configuration_key: Some(known),
            unknown_key: if unknown.is_empty() {
                None
            } else {
                Some(unknown)
            },
        })
    }

    async fn handle_change_configuration(
        self: &Arc<Self>,
        request: ChangeConfigurationRequest,
    ) -> OcppResult<ChangeConfigurationResponse> {
        let outcome = self
            .config
            .write()
            .await
            .apply_change(&request.key, &request.value);
        info!(
            "{}: ChangeConfiguration {}={} -> {:?}",
            self.station_id(),
            request.key,
            request.value,
            outcome.status
        );

        match outcome.restart {
            Some(TimerRestart::Heartbeat) => self.start_heartbeat().await,
            Some(TimerRestart::WebSocketPing) => self.start_ping().await,
            None => {}
        }

        Ok(ChangeConfigurationResponse {
            status: outcome.status,
        })
    }

    async fn handle_set_charging_profile(
        self: &Arc<Self>,
        request: SetChargingProfileRequest,
    ) -> OcppResult<SetChargingProfileResponse> {
        let connector_id = request.connector_id;
        let profile = request.cs_charging_profiles;

        let mut connectors = self.connectors.write().await;
        let Some(connector) = connectors.get_mut(&connector_id) else {
            warn!(
                "{}: SetChargingProfile on unknown connector {connector_id}",
                self.station_id()
            );
            return Ok(SetChargingProfileResponse {
                status: ChargingProfileStatus::Rejected,
            });
        };

        let rejected = match profile.charging_profile_purpose {
            ChargingProfilePurposeType::ChargePointMaxProfile => connector_id != 0,
            ChargingProfilePurposeType::TxProfile => {
                connector_id == 0 || !connector.transaction_started
            }
            ChargingProfilePurposeType::TxDefaultProfile => false,
        };
        if rejected {
            warn!(
                "{}: SetChargingProfile {:?} rejected on connector {connector_id}",
                self.station_id(),
                profile.charging_profile_purpose
            );
            return Ok(SetChargingProfileResponse {
                status: ChargingProfileStatus::Rejected,
            });
        }

        connector.upsert_charging_profile(profile);
        Ok(SetChargingProfileResponse {
            status: ChargingProfileStatus::Accepted,
        })
    }

    async fn handle_clear_charging_profile(
        self: &Arc<Self>,
        request: ClearChargingProfileRequest,
    ) -> OcppResult<ClearChargingProfileResponse> {
        let mut connectors = self.connectors.write().await;
        let cleared = match request.connector_id {
            Some(connector_id) => match connectors.get_mut(&connector_id) {
                Some(connector) => connector.clear_all_charging_profiles(),
                None => 0,
            },
            None => connectors
                .values_mut()
                .map(|connector| connector.clear_charging_profiles(&request))
                .sum(),
        };

        Ok(ClearChargingProfileResponse {
            status: if cleared > 0 {
                ClearChargingProfileStatus::Accepted
            } else {
                ClearChargingProfileStatus::Unknown
            },
        })
    }

    async fn handle_change_availability(
        self: &Arc<Self>,
        request: ChangeAvailabilityRequest,
    ) -> OcppResult<ChangeAvailabilityResponse> {
        let availability = request.availability_type;
        let target_status = match availability {
            AvailabilityType::Operative => ChargePointStatus::Available,
            AvailabilityType::Inoperative => ChargePointStatus::Unavailable,
        };

        if request.connector_id == 0 {
            let (any_transaction, ids) = {
                let mut connectors = self.connectors.write().await;
                let mut any_transaction = false;
                for connector in connectors.values_mut() {
                    connector.availability = availability;
                    any_transaction |= connector.transaction_started;
                }
                (any_transaction, connectors.keys().copied().collect::<Vec<_>>())
            };

            if any_transaction {
                return Ok(ChangeAvailabilityResponse {
                    status: AvailabilityStatus::Scheduled,
                });
            }

            for connector_id in ids {
                {
                    let mut connectors = self.connectors.write().await;
                    if let Some(connector) = connectors.get_mut(&connector_id) {
                        connector.status = target_status;
                    }
                }
                self.send_status_notification(connector_id, target_status)
                    .await?;
            }
            return Ok(ChangeAvailabilityResponse {
                status: AvailabilityStatus::Accepted,
            });
        }

        let (exists, station_availability, has_transaction) = {
            let connectors = self.connectors.read().await;
            let station_availability = connectors
                .get(&0)
                .map(|c| c.availability)
                .unwrap_or(AvailabilityType::Operative);
            match connectors.get(&request.connector_id) {
                Some(connector) => (true, station_availability, connector.transaction_started),
                None => (false, station_availability, false),
            }
        };
        if !exists {
            return Ok(ChangeAvailabilityResponse {
                status: AvailabilityStatus::Rejected,
            });
        }

        // a connector change is honoured only while the station itself is
        // operative, or when both sides agree on inoperative
        let honoured = station_availability == AvailabilityType::Operative
            || availability == AvailabilityType::Inoperative;
        if !honoured {
            return Ok(ChangeAvailabilityResponse {
                status: AvailabilityStatus::Rejected,
            });
        }

        {
            let mut connectors = self.connectors.write().await;
            if let Some(connector) = connectors.get_mut(&request.connector_id) {
                connector.availability = availability;
            }
        }

        if has_transaction {
            return Ok(ChangeAvailabilityResponse {
                status: AvailabilityStatus::Scheduled,
            });
        }

        {
            let mut connectors = self.connectors.write().await;
            if let Some(connector) = connectors.get_mut(&request.connector_id) {
                connector.status = target_status;
            }
        }
        self.send_status_notification(request.connector_id, target_status)
            .await?;

        Ok(ChangeAvailabilityResponse {
            status: AvailabilityStatus::Accepted,
        })
    }

    async fn handle_remote_start_transaction(
        self: &Arc<Self>,
        request: RemoteStartTransactionRequest,
    ) -> OcppResult<(RemoteStartTransactionResponse, Option<FollowUp>)> {
        let connector_id = request.connector_id.unwrap_or(1);
        let rejected = RemoteStartTransactionResponse {
            status: RemoteStartStopStatus::Rejected,
        };
        if connector_id == 0 {
            warn!(
                "{}: remote start rejected, connector 0 cannot carry a transaction",
                self.station_id()
            );
            return Ok((rejected, None));
        }

        let startable = {
            let connectors = self.connectors.read().await;
            let station_operative = connectors
                .get(&0)
                .map(|c| c.availability == AvailabilityType::Operative)
                .unwrap_or(true);
            match connectors.get(&connector_id) {
                Some(connector) => {
                    station_operative
                        && connector.availability == AvailabilityType::Operative
                        && !connector.transaction_started
                }
                None => false,
            }
        };
        if !startable {
            warn!(
                "{}: remote start rejected, connector {connector_id} not available",
                self.station_id()
            );
            return Ok((rejected, None));
        }

        if !self.is_remote_start_authorized(&request.id_tag).await {
            warn!(
                "{}: remote start rejected, idTag '{}' not in local authorization list",
                self.station_id(),
                request.id_tag
            );
            return Ok((rejected, None));
        }

        if let Some(profile) = request.charging_profile {
            if profile.charging_profile_purpose != ChargingProfilePurposeType::TxProfile {
                warn!(
                    "{}: remote start rejected, charging profile purpose {:?} is not TxProfile",
                    self.station_id(),
                    profile.charging_profile_purpose
                );
                return Ok((rejected, None));
            }
            let mut connectors = self.connectors.write().await;
            if let Some(connector) = connectors.get_mut(&connector_id) {
                connector.upsert_charging_profile(profile);
            }
        }

        // answer first; the preparing/start flow runs after the CALLRESULT
        Ok((
            RemoteStartTransactionResponse {
                status: RemoteStartStopStatus::Accepted,
            },
            Some(FollowUp::StartTransaction {
                connector_id,
                id_tag: request.id_tag,
            }),
        ))
    }

    /// Remote starts are vetted against the local authorization list only
    /// when the station authorizes remote transactions, the local list is
    /// enabled and tags were actually loaded.
    async fn is_remote_start_authorized(&self, id_tag: &str) -> bool {
        if !self.info.read().await.authorize_remote_tx_requests {
            return true;
        }
        let local_list_enabled = self
            .config
            .read()
            .await
            .get(keys::LOCAL_AUTH_LIST_ENABLED)
            .map(|entry| entry.value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if !local_list_enabled {
            return true;
        }
        let tags = self.authorized_tags().await;
        if tags.is_empty() {
            return true;
        }
        tags.iter().any(|tag| tag == id_tag)
    }

    async fn handle_remote_stop_transaction(
        self: &Arc<Self>,
        request: RemoteStopTransactionRequest,
    ) -> OcppResult<(RemoteStopTransactionResponse, Option<FollowUp>)> {
        let connector_id = {
            let connectors = self.connectors.read().await;
            connectors
                .iter()
                .find(|(id, connector)| {
                    **id > 0 && connector.transaction_id == Some(request.transaction_id)
                })
                .map(|(id, _)| *id)
        };

        let Some(connector_id) = connector_id else {
            error!(
                "{}: no connector is running transaction {}",
                self.station_id(),
                request.transaction_id
            );
            return Ok((
                RemoteStopTransactionResponse {
                    status: RemoteStartStopStatus::Rejected,
                },
                None,
            ));
        };

        Ok((
            RemoteStopTransactionResponse {
                status: RemoteStartStopStatus::Accepted,
            },
            Some(FollowUp::StopTransaction { connector_id }),
        ))
    }

    // -----------------------------------------------------------------
    // Outbound requests
    // -----------------------------------------------------------------

    /// Send a typed CALL and decode its CALLRESULT payload.
    pub(crate) async fn call_typed<T: OcppCall>(&self, request: T) -> OcppResult<T::Response> {
        let payload = serde_json::to_value(&request)?;
        let response = self.transport().call(T::ACTION, payload).await?;
        Ok(serde_json::from_value(response)?)
    }

    /// Single BootNotification attempt. On acceptance the heartbeat keys
    /// are written, the heartbeat timer armed and the per-connector boot
    /// statuses notified.
    pub async fn boot(self: &Arc<Self>) -> OcppResult<BootNotificationResponse> {
        let request = {
            let info = self.info.read().await;
            BootNotificationRequest {
                charge_point_vendor: info.vendor.clone(),
                charge_point_model: info.model.clone(),
                charge_point_serial_number: None,
                charge_box_serial_number: info.charge_box_serial_number.clone(),
                firmware_version: info.firmware_version.clone(),
                iccid: None,
                imsi: None,
                meter_type: None,
                meter_serial_number: None,
            }
        };

        let response = self.call_typed(request).await?;
        info!(
            "{}: boot notification answered with {:?}",
            self.station_id(),
            response.status
        );
        self.set_boot_response(Some(response.clone())).await;

        if response.status == evsim_types::v16::RegistrationStatus::Accepted {
            self.on_boot_accepted(&response).await;
        }
        Ok(response)
    }

    async fn on_boot_accepted(self: &Arc<Self>, response: &BootNotificationResponse) {
        self.config
            .write()
            .await
            .set_heartbeat_interval(response.interval as i64);
        self.set_has_stopped(false);
        self.registration_retry_count
            .store(0, std::sync::atomic::Ordering::SeqCst);

        self.start_heartbeat().await;

        // report every physical connector's status
        let statuses: Vec<(u32, ChargePointStatus)> = {
            let mut connectors = self.connectors.write().await;
            connectors
                .iter_mut()
                .filter(|(id, _)| **id > 0)
                .map(|(id, connector)| {
                    let status = connector.boot_status.unwrap_or(if connector.transaction_started
                    {
                        ChargePointStatus::Charging
                    } else {
                        ChargePointStatus::Available
                    });
                    connector.status = status;
                    (*id, status)
                })
                .collect()
        };
        for (connector_id, status) in statuses {
            if let Err(error) = self.send_status_notification(connector_id, status).await {
                error!(
                    "{}: boot status notification for connector {connector_id} failed: {error}",
                    self.station_id()
                );
            }
        }
    }

    pub async fn send_heartbeat(&self) -> OcppResult<HeartbeatResponse> {
        let response: HeartbeatResponse = self.call_typed(HeartbeatRequest {}).await?;
        debug!(
            "{}: heartbeat answered at {}",
            self.station_id(),
            response.current_time
        );
        Ok(response)
    }

    /// Ask the Central System to authorize an idTag.
    pub async fn authorize(&self, id_tag: &str) -> OcppResult<IdTagInfo> {
        let response = self
            .call_typed(AuthorizeRequest {
                id_tag: id_tag.to_string(),
            })
            .await?;
        Ok(response.id_tag_info)
    }

    pub(crate) async fn send_status_notification(
        &self,
        connector_id: u32,
        status: ChargePointStatus,
    ) -> OcppResult<()> {
        self.call_typed(StatusNotificationRequest {
            connector_id,
            error_code: ChargePointErrorCode::NoError,
            info: None,
            status,
            timestamp: Some(chrono::Utc::now()),
            vendor_id: None,
            vendor_error_code: None,
        })
        .await?;
        Ok(())
    }

    pub(crate) async fn send_meter_values(&self, request: MeterValuesRequest) -> OcppResult<()> {
        self.call_typed(request).await?;
        Ok(())
    }

    /// Start a transaction on `connector_id` and apply the Central
    /// System's verdict.
    pub async fn start_transaction(
        self: &Arc<Self>,
        connector_id: u32,
        id_tag: &str,
    ) -> OcppResult<StartTransactionResponse> {
        if connector_id == 0 {
            return Err(OcppError::generic(
                "connector 0 cannot carry a transaction",
            ));
        }
        let request = StartTransactionRequest {
            connector_id,
            id_tag: id_tag.to_string(),
            meter_start: 0,
            reservation_id: None,
            timestamp: chrono::Utc::now(),
        };
        let response: StartTransactionResponse = self.call_typed(request).await?;
        self.apply_start_transaction_response(connector_id, id_tag, &response)
            .await;
        Ok(response)
    }

    async fn apply_start_transaction_response(
        self: &Arc<Self>,
        connector_id: u32,
        id_tag: &str,
        response: &StartTransactionResponse,
    ) {
        let accepted = {
            let mut connectors = self.connectors.write().await;
            let Some(connector) = connectors.get_mut(&connector_id) else {
                error!(
                    "{}: StartTransaction answered for unknown connector {connector_id}",
                    self.station_id()
                );
                return;
            };
            if response.id_tag_info.is_accepted() && !connector.transaction_started {
                connector.transaction_started = true;
                connector.transaction_id = Some(response.transaction_id);
                connector.id_tag = Some(id_tag.to_string());
                connector.energy_active_import_register = 0;
                connector.status = ChargePointStatus::Charging;
                true
            } else {
                connector.reset_transaction();
                connector.status = ChargePointStatus::Available;
                false
            }
        };

        if accepted {
            info!(
                "{}: transaction {} started on connector {connector_id}",
                self.station_id(),
                response.transaction_id
            );
            if let Err(error) = self
                .send_status_notification(connector_id, ChargePointStatus::Charging)
                .await
            {
                error!(
                    "{}: charging status notification failed: {error}",
                    self.station_id()
                );
            }

            let interval = self.meter_sample_interval().await;
            let sampler = meter::spawn_sampler(self, connector_id, interval);
            let mut connectors = self.connectors.write().await;
            match connectors.get_mut(&connector_id) {
                Some(connector) if connector.transaction_started => {
                    connector.sampler = Some(sampler);
                }
                // the transaction ended before the sampler was registered
                _ => sampler.abort(),
            }
        } else {
            warn!(
                "{}: StartTransaction on connector {connector_id} not accepted",
                self.station_id()
            );
            if let Err(error) = self
                .send_status_notification(connector_id, ChargePointStatus::Available)
                .await
            {
                error!(
                    "{}: available status notification failed: {error}",
                    self.station_id()
                );
            }
        }
    }

    /// Stop the transaction on `connector_id`; returns whether the
    /// Central System accepted the stop.
    pub async fn stop_transaction(
        self: &Arc<Self>,
        connector_id: u32,
        reason: Reason,
    ) -> OcppResult<bool> {
        let (transaction_id, meter_stop, id_tag) = {
            let connectors = self.connectors.read().await;
            let connector = connectors.get(&connector_id).ok_or_else(|| {
                OcppError::generic(format!("unknown connector {connector_id}"))
            })?;
            let transaction_id = connector.transaction_id.ok_or_else(|| {
                OcppError::generic(format!(
                    "no transaction running on connector {connector_id}"
                ))
            })?;
            (
                transaction_id,
                connector.energy_active_import_register.max(0),
                connector.id_tag.clone(),
            )
        };

        let response = self
            .call_typed(StopTransactionRequest {
                id_tag,
                meter_stop,
                timestamp: chrono::Utc::now(),
                transaction_id,
                reason: Some(reason),
                transaction_data: None,
            })
            .await?;

        let accepted = response.is_accepted();
        if !accepted {
            warn!(
                "{}: StopTransaction {transaction_id} not accepted",
                self.station_id()
            );
            return Ok(false);
        }

        let status = {
            let mut connectors = self.connectors.write().await;
            let station_inoperative = connectors
                .get(&0)
                .map(|c| c.availability == AvailabilityType::Inoperative)
                .unwrap_or(false);
            match connectors.get_mut(&connector_id) {
                Some(connector) => {
                    let status = if station_inoperative
                        || connector.availability == AvailabilityType::Inoperative
                    {
                        ChargePointStatus::Unavailable
                    } else {
                        ChargePointStatus::Available
                    };
                    connector.reset_transaction();
                    connector.status = status;
                    Some(status)
                }
                None => None,
            }
        };

        info!(
            "{}: transaction {transaction_id} stopped on connector {connector_id} ({reason:?})",
            self.station_id()
        );
        if let Some(status) = status {
            if let Err(error) = self.send_status_notification(connector_id, status).await {
                error!(
                    "{}: post-stop status notification failed: {error}",
                    self.station_id()
                );
            }
        }
        Ok(true)
    }
}
