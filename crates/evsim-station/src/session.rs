//! Session controller: WebSocket lifecycle, boot handshake, heartbeat,
//! ping, reconnect policy and file watching.

use crate::error::{StationError, StationResult};
use crate::station::Station;
use crate::transport::OutboundFrame;
use evsim_types::v16::{ChargePointStatus, Reason, RegistrationStatus};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::HeaderValue;
use tungstenite::protocol::Message as WsMessage;

/// OCPP 1.6-J WebSocket subprotocol.
const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

/// Close codes that end the session without a reconnect.
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_NO_STATUS: u16 = 1005;
/// Synthetic code for a stream that ended without a close frame.
const CLOSE_ABNORMAL: u16 = 1006;

/// Sleep between boot attempts when the response carries no interval.
const DEFAULT_BOOT_RETRY: Duration = Duration::from_secs(60);

/// Poll period of the template/authorization file watchers.
const FILE_WATCH_POLL: Duration = Duration::from_secs(5);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Backoff delay for reconnect attempt `attempt` (1-based): doubles per
/// attempt with jitter, capped at 64 s.
pub(crate) fn exponential_delay(attempt: u32) -> Duration {
    let base_secs = 1u64 << attempt.min(6);
    let jitter_ms = rand::thread_rng().gen_range(0..1000);
    Duration::from_millis(base_secs * 1000 + jitter_ms)
}

impl Station {
    /// Start the station: begin watching its files and open the
    /// WebSocket session. A failed initial connect enters the reconnect
    /// loop just like an abnormal close would.
    pub async fn start(self: &Arc<Self>) -> StationResult<()> {
        info!("{}: starting", self.station_id());
        self.spawn_file_watchers().await;

        if let Err(error) = self.open_websocket(None).await {
            warn!(
                "{}: initial connection failed ({error}), entering reconnect loop",
                self.station_id()
            );
            let station = Arc::clone(self);
            tokio::spawn(async move { station.reconnect().await });
        }
        Ok(())
    }

    /// Stop the station. Idempotent; this is the authoritative terminal
    /// path: timers stop, running transactions end with `reason`, every
    /// connector reports Unavailable, the socket closes and the
    /// registration state clears.
    pub async fn stop(self: &Arc<Self>, reason: Reason) -> StationResult<()> {
        if self.set_has_stopped(true) {
            debug!("{}: already stopped", self.station_id());
            return Ok(());
        }
        info!("{}: stopping ({reason:?})", self.station_id());

        self.stop_ping().await;
        self.stop_heartbeat().await;

        let generator_enabled = self
            .template
            .read()
            .await
            .automatic_transaction_generator
            .enable;
        match (self.generator().await, generator_enabled) {
            (Some(generator), true) => generator.stop().await,
            _ => {
                let running: Vec<u32> = {
                    let connectors = self.connectors.read().await;
                    connectors
                        .iter()
                        .filter(|(id, connector)| **id > 0 && connector.transaction_started)
                        .map(|(id, _)| *id)
                        .collect()
                };
                for connector_id in running {
                    if let Err(error) = self.stop_transaction(connector_id, reason).await {
                        error!(
                            "{}: could not stop transaction on connector {connector_id}: {error}",
                            self.station_id()
                        );
                    }
                }
            }
        }

        let connector_ids = self.connector_ids().await;
        for connector_id in connector_ids {
            {
                let mut connectors = self.connectors.write().await;
                if let Some(connector) = connectors.get_mut(&connector_id) {
                    connector.status = ChargePointStatus::Unavailable;
                }
            }
            if let Err(error) = self
                .send_status_notification(connector_id, ChargePointStatus::Unavailable)
                .await
            {
                debug!(
                    "{}: unavailable status notification for connector {connector_id} failed: {error}",
                    self.station_id()
                );
            }
        }

        // a sampler must never tick on a half-torn-down station
        {
            let mut connectors = self.connectors.write().await;
            for connector in connectors.values_mut() {
                if let Some(sampler) = connector.sampler.take() {
                    sampler.abort();
                }
            }
        }

        self.transport().send_close().await;
        tokio::task::yield_now().await;
        self.transport().detach_sink().await;
        {
            let mut handles = self.socket_handles.lock().await;
            for handle in handles.drain(..) {
                handle.abort();
            }
        }

        self.set_boot_response(None).await;
        info!("{}: stopped", self.station_id());
        Ok(())
    }

    /// Open the WebSocket to `<supervisionURL>/<stationId>` with the
    /// `ocpp1.6` subprotocol. `handshake_timeout` overrides the
    /// template's connectionTimeout (the reconnect path passes its
    /// backoff delay minus a margin).
    pub(crate) fn open_websocket(
        self: &Arc<Self>,
        handshake_timeout: Option<Duration>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = StationResult<()>> + Send + '_>> {
        Box::pin(self.open_websocket_inner(handshake_timeout))
    }

    async fn open_websocket_inner(
        self: &Arc<Self>,
        handshake_timeout: Option<Duration>,
    ) -> StationResult<()> {
        // tear down any previous socket tasks before the new connect
        {
            let mut handles = self.socket_handles.lock().await;
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
        self.transport().detach_sink().await;

        let (url, configured_timeout) = {
            let template = self.template.read().await;
            let info = self.info.read().await;
            let base = template.supervision_url(self.index());
            (
                format!("{}/{}", base.trim_end_matches('/'), self.station_id()),
                info.connection_timeout,
            )
        };
        let handshake_timeout = handshake_timeout.unwrap_or(configured_timeout);

        let url = url::Url::parse(&url)
            .map_err(|error| StationError::websocket(format!("invalid supervision URL: {error}")))?;
        info!("{}: connecting to {url}", self.station_id());
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(StationError::websocket)?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(OCPP_SUBPROTOCOL),
        );

        // a zero timeout disables the handshake guard
        let connected = if handshake_timeout.is_zero() {
            connect_async(request).await
        } else {
            timeout(handshake_timeout, connect_async(request))
                .await
                .map_err(|_| StationError::websocket("WebSocket handshake timed out"))?
        };
        let (socket, _response) = connected.map_err(StationError::websocket)?;
        info!("{}: WebSocket connected", self.station_id());

        let (sink, stream) = socket.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.transport().attach_sink(outbound_tx).await;

        let writer = tokio::spawn(run_writer(self.station_id().to_string(), sink, outbound_rx));
        let reader = tokio::spawn(Arc::clone(self).run_reader(stream));
        let opener = tokio::spawn(Arc::clone(self).on_open());
        self.socket_handles
            .lock()
            .await
            .extend([writer, reader, opener]);

        self.start_ping().await;
        Ok(())
    }

    /// Runs once per successful connect: boot handshake when needed, then
    /// offline-queue drain and heartbeat for a registered session.
    async fn on_open(self: Arc<Self>) {
        if !self.is_registered().await {
            self.boot_notification_loop().await;
        }
        if self.is_registered().await {
            if self.has_socket_restarted.load(Ordering::SeqCst) {
                self.transport().drain_offline_queue().await;
            }
            self.start_heartbeat().await;
            self.auto_reconnect_retry_count.store(0, Ordering::SeqCst);
        } else {
            error!(
                "{}: could not register with the central system",
                self.station_id()
            );
        }
    }

    /// Retry BootNotification until the station is registered or the
    /// retry budget is spent (−1 retries forever, 0 gives a single
    /// attempt).
    async fn boot_notification_loop(self: &Arc<Self>) {
        let max_retries = self.info.read().await.registration_max_retries;
        loop {
            let retry_interval = match self.boot().await {
                Ok(response) => {
                    if response.status == RegistrationStatus::Accepted {
                        return;
                    }
                    warn!(
                        "{}: registration {:?}, retrying",
                        self.station_id(),
                        response.status
                    );
                    response.interval
                }
                Err(error) => {
                    error!("{}: boot notification failed: {error}", self.station_id());
                    0
                }
            };

            let attempts = self.registration_retry_count.fetch_add(1, Ordering::SeqCst) + 1;
            if max_retries != -1 && attempts as i64 > max_retries as i64 {
                error!(
                    "{}: giving up on registration after {attempts} attempt(s)",
                    self.station_id()
                );
                return;
            }

            let delay = if retry_interval > 0 {
                Duration::from_secs(retry_interval as u64)
            } else {
                DEFAULT_BOOT_RETRY
            };
            sleep(delay).await;
            if self.has_stopped() {
                return;
            }
        }
    }

    async fn run_reader(self: Arc<Self>, mut stream: WsStream) {
        let mut close_code = None;
        while let Some(message) = stream.next().await {
            match message {
                Ok(WsMessage::Text(text)) => self.handle_frame(&text).await,
                Ok(WsMessage::Ping(payload)) => {
                    debug!("{}: ping received, answering", self.station_id());
                    self.transport().send_pong(payload).await;
                }
                Ok(WsMessage::Pong(_)) => debug!("{}: pong received", self.station_id()),
                Ok(WsMessage::Close(frame)) => {
                    close_code = Some(
                        frame
                            .map(|frame| u16::from(frame.code))
                            .unwrap_or(CLOSE_NO_STATUS),
                    );
                }
                Ok(_) => debug!("{}: ignoring non-text frame", self.station_id()),
                // errors do not reconnect; only the close path does
                Err(error) => error!("{}: WebSocket error: {error}", self.station_id()),
            }
        }
        self.on_close(close_code.unwrap_or(CLOSE_ABNORMAL)).await;
    }

    async fn on_close(self: Arc<Self>, code: u16) {
        self.transport().detach_sink().await;
        self.stop_ping().await;

        if self.has_stopped() {
            debug!("{}: socket closed after stop", self.station_id());
            return;
        }

        match code {
            CLOSE_NORMAL | CLOSE_NO_STATUS => {
                info!(
                    "{}: WebSocket closed normally (code {code})",
                    self.station_id()
                );
                self.auto_reconnect_retry_count.store(0, Ordering::SeqCst);
            }
            code => {
                warn!(
                    "{}: WebSocket closed abnormally (code {code})",
                    self.station_id()
                );
                let station = Arc::clone(&self);
                tokio::spawn(async move { station.reconnect().await });
            }
        }
    }

    /// Reconnect with backoff until a connect succeeds or the retry
    /// budget is spent (−1 retries forever).
    pub(crate) async fn reconnect(self: Arc<Self>) {
        self.stop_heartbeat().await;

        let (generator_enabled, stop_on_failure) = {
            let template = self.template.read().await;
            (
                template.automatic_transaction_generator.enable,
                template
                    .automatic_transaction_generator
                    .stop_on_connection_failure,
            )
        };
        if generator_enabled && stop_on_failure {
            if let Some(generator) = self.generator().await {
                generator.stop().await;
            }
        }

        let (max_retries, exponential, connection_timeout) = {
            let info = self.info.read().await;
            (
                info.auto_reconnect_max_retries,
                info.reconnect_exponential_delay,
                info.connection_timeout,
            )
        };

        loop {
            if self.has_stopped() {
                return;
            }
            let attempts = self.auto_reconnect_retry_count.load(Ordering::SeqCst);
            if max_retries != -1 && attempts >= max_retries as u32 {
                error!(
                    "{}: giving up on reconnect after {attempts} attempt(s)",
                    self.station_id()
                );
                return;
            }
            let attempt = attempts + 1;
            self.auto_reconnect_retry_count.store(attempt, Ordering::SeqCst);

            let delay = if exponential {
                exponential_delay(attempt)
            } else {
                connection_timeout
            };
            warn!(
                "{}: reconnect attempt {attempt} in {} ms",
                self.station_id(),
                delay.as_millis()
            );
            sleep(delay).await;
            if self.has_stopped() {
                return;
            }

            self.has_socket_restarted.store(true, Ordering::SeqCst);
            let handshake = delay
                .checked_sub(Duration::from_millis(100))
                .filter(|margin| !margin.is_zero());
            match self.open_websocket(handshake).await {
                Ok(()) => {
                    info!("{}: reconnected", self.station_id());
                    return;
                }
                Err(error) => error!("{}: reconnect failed: {error}", self.station_id()),
            }
        }
    }

    // -----------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------

    /// (Re)arm the heartbeat timer from the configured interval. A
    /// non-positive or absent interval leaves the timer stopped.
    pub(crate) async fn start_heartbeat(self: &Arc<Self>) {
        self.stop_heartbeat().await;

        let interval_secs = self.config.read().await.heartbeat_interval_secs();
        let Some(interval_secs) = interval_secs.filter(|secs| *secs > 0) else {
            warn!(
                "{}: heartbeat interval not configured or non-positive, heartbeat disabled",
                self.station_id()
            );
            return;
        };

        info!(
            "{}: heartbeat every {interval_secs}s",
            self.station_id()
        );
        let station = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(interval_secs as u64));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(error) = station.send_heartbeat().await {
                    error!("{}: heartbeat failed: {error}", station.station_id());
                }
            }
        });
        *self.heartbeat_handle.lock().await = Some(handle);
    }

    pub(crate) async fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat_handle.lock().await.take() {
            handle.abort();
        }
    }

    pub async fn heartbeat_running(&self) -> bool {
        self.heartbeat_handle.lock().await.is_some()
    }

    /// (Re)arm the WebSocket ping timer from the WebSocketPingInterval
    /// key. A non-positive or absent interval disables pinging.
    pub(crate) async fn start_ping(self: &Arc<Self>) {
        self.stop_ping().await;

        let interval_secs = self
            .config
            .read()
            .await
            .get_i64(crate::config_store::keys::WEB_SOCKET_PING_INTERVAL);
        let Some(interval_secs) = interval_secs.filter(|secs| *secs > 0) else {
            return;
        };

        debug!(
            "{}: WebSocket ping every {interval_secs}s",
            self.station_id()
        );
        let station = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(interval_secs as u64));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !station.transport().send_ping().await {
                    debug!(
                        "{}: socket closed, skipping WebSocket ping",
                        station.station_id()
                    );
                }
            }
        });
        *self.ping_handle.lock().await = Some(handle);
    }

    pub(crate) async fn stop_ping(&self) {
        if let Some(handle) = self.ping_handle.lock().await.take() {
            handle.abort();
        }
    }

    pub async fn ping_running(&self) -> bool {
        self.ping_handle.lock().await.is_some()
    }

    // -----------------------------------------------------------------
    // File watching
    // -----------------------------------------------------------------

    /// Watch the template file and the authorization file (when
    /// configured) for changes; reload errors are caught and logged.
    async fn spawn_file_watchers(self: &Arc<Self>) {
        if self.watchers_already_started() {
            return;
        }

        let mut handles = Vec::new();
        if let Some(path) = self.template_path().cloned() {
            let station = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                watch_file(path, || {
                    let station = Arc::clone(&station);
                    async move {
                        if let Err(error) = station.reload_template().await {
                            error!(
                                "{}: template reload failed: {error}",
                                station.station_id()
                            );
                        }
                    }
                })
                .await;
            }));
        }
        if let Some(path) = self.authorization_path().await {
            let station = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                watch_file(path, || {
                    let station = Arc::clone(&station);
                    async move {
                        if let Err(error) = station.reload_authorized_tags().await {
                            error!(
                                "{}: authorization reload failed: {error}",
                                station.station_id()
                            );
                        }
                    }
                })
                .await;
            }));
        }
        self.watcher_handles.lock().await.extend(handles);
    }
}

/// Poll-based file watcher: fires `on_change` whenever the modification
/// time moves.
async fn watch_file<F, Fut>(path: PathBuf, on_change: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut last_modified = tokio::fs::metadata(&path)
        .await
        .and_then(|meta| meta.modified())
        .ok();

    loop {
        sleep(FILE_WATCH_POLL).await;
        let modified = match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(error) => {
                debug!("cannot stat {}: {error}", path.display());
                continue;
            }
        };
        if last_modified.map(|last| modified > last).unwrap_or(true) {
            last_modified = Some(modified);
            on_change().await;
        }
    }
}

/// Forwards queued outbound frames onto the socket until the channel or
/// the socket closes.
async fn run_writer(
    station_id: String,
    mut sink: WsSink,
    mut outbound: mpsc::UnboundedReceiver<OutboundFrame>,
) {
    while let Some(frame) = outbound.recv().await {
        let message = match frame {
            OutboundFrame::Text(text) => WsMessage::Text(text),
            OutboundFrame::Ping => WsMessage::Ping(Vec::new()),
            OutboundFrame::Pong(payload) => WsMessage::Pong(payload),
            OutboundFrame::Close => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
        };
        if let Err(error) = sink.send(message).await {
            error!("{station_id}: WebSocket send failed: {error}");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::minimal_template;
    use evsim_types::v16::AvailabilityType;

    #[test]
    fn exponential_delay_doubles_and_caps() {
        let first = exponential_delay(1);
        assert!(first >= Duration::from_secs(2) && first < Duration::from_secs(3));

        let sixth = exponential_delay(6);
        assert!(sixth >= Duration::from_secs(64) && sixth < Duration::from_secs(65));

        // capped past attempt six
        let huge = exponential_delay(40);
        assert!(huge < Duration::from_secs(65));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let station = Station::from_template(0, minimal_template()).await.unwrap();
        station.stop(Reason::Local).await.unwrap();
        assert!(station.has_stopped());
        assert!(!station.is_registered().await);

        // second stop is a no-op
        station.stop(Reason::Local).await.unwrap();
        assert!(station.has_stopped());
    }

    #[tokio::test]
    async fn stop_marks_connectors_unavailable() {
        let station = Station::from_template(0, minimal_template()).await.unwrap();
        station.stop(Reason::Local).await.unwrap();

        for id in station.connector_ids().await {
            let connector = station.connector(id).await.unwrap();
            assert_eq!(connector.status, ChargePointStatus::Unavailable);
            // availability is untouched by stop
            assert_eq!(connector.availability, AvailabilityType::Operative);
        }
    }

    #[tokio::test]
    async fn reconnect_gives_up_with_zero_retry_budget() {
        let mut template = minimal_template();
        template.auto_reconnect_max_retries = Some(0);
        let station = Station::from_template(0, template).await.unwrap();

        // returns without a single attempt
        Arc::clone(&station).reconnect().await;
        assert!(!station.transport().is_open().await);
        assert_eq!(
            station.auto_reconnect_retry_count.load(Ordering::SeqCst),
            0
        );
    }

    #[tokio::test]
    async fn registration_gives_up_with_zero_retry_budget() {
        let mut template = minimal_template();
        template.registration_max_retries = Some(0);
        let station = Station::from_template(0, template).await.unwrap();

        // no socket: the first boot attempt fails and the loop terminates
        station.boot_notification_loop().await;
        assert!(!station.is_registered().await);
        assert_eq!(
            station.registration_retry_count.load(Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn heartbeat_does_not_start_without_interval() {
        let station = Station::from_template(0, minimal_template()).await.unwrap();
        station.start_heartbeat().await;
        assert!(!station.heartbeat_running().await);
    }

    #[tokio::test]
    async fn heartbeat_starts_with_positive_interval() {
        let station = Station::from_template(0, minimal_template()).await.unwrap();
        station.config.write().await.set_heartbeat_interval(30);
        station.start_heartbeat().await;
        assert!(station.heartbeat_running().await);
        station.stop_heartbeat().await;
        assert!(!station.heartbeat_running().await);
    }

    #[tokio::test]
    async fn ping_timer_honours_zero_interval() {
        let station = Station::from_template(0, minimal_template()).await.unwrap();
        station
            .config
            .write()
            .await
            .add("WebSocketPingInterval", "0", false, true, false);
        station.start_ping().await;
        assert!(!station.ping_running().await);

        station
            .config
            .write()
            .await
            .set_value("WebSocketPingInterval", "54");
        station.start_ping().await;
        assert!(station.ping_running().await);
        station.stop_ping().await;
    }
}
