//! OCPP-J RPC transport: correlation, timeouts, offline buffering and the
//! boot admission gate.
//!
//! The transport does not own the socket; the session layer attaches an
//! outbound frame channel when a WebSocket opens and detaches it on close.
//! That keeps every send path, including tests and alternative socket
//! layers, behind one admission gate.

use dashmap::DashMap;
use evsim_types::rpc::{Call, CallError, CallResult, Frame};
use evsim_types::{OcppError, OcppResult};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Default time a CALL may wait for its CALLRESULT/CALLERROR.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(60);

/// The only action admitted through the transport before registration.
pub const BOOT_NOTIFICATION_ACTION: &str = "BootNotification";

/// Frames handed to the socket writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// A serialized OCPP-J array
    Text(String),
    /// RFC 6455 ping frame
    Ping,
    /// RFC 6455 pong frame answering a received ping
    Pong(Vec<u8>),
    /// Close the socket normally
    Close,
}

/// A CALL awaiting its response.
struct PendingRequest {
    responder: oneshot::Sender<OcppResult<Value>>,
    action: String,
    /// Original request payload, kept for post-mortem logging
    request: Value,
}

/// RPC transport for one station.
pub struct RpcTransport {
    station_id: String,
    rpc_timeout: Duration,
    pending: DashMap<String, PendingRequest>,
    offline_queue: Mutex<VecDeque<String>>,
    sink: RwLock<Option<mpsc::UnboundedSender<OutboundFrame>>>,
    registered: AtomicBool,
}

impl RpcTransport {
    pub fn new(station_id: impl Into<String>, rpc_timeout: Duration) -> Self {
        Self {
            station_id: station_id.into(),
            rpc_timeout,
            pending: DashMap::new(),
            offline_queue: Mutex::new(VecDeque::new()),
            sink: RwLock::new(None),
            registered: AtomicBool::new(false),
        }
    }

    /// Whether the boot handshake has completed; only then are actions
    /// other than BootNotification admitted.
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::SeqCst);
    }

    /// Attach the outbound channel of a freshly opened socket.
    pub async fn attach_sink(&self, sink: mpsc::UnboundedSender<OutboundFrame>) {
        *self.sink.write().await = Some(sink);
    }

    /// Detach the outbound channel when the socket is gone.
    pub async fn detach_sink(&self) {
        *self.sink.write().await = None;
    }

    pub async fn is_open(&self) -> bool {
        self.sink.read().await.is_some()
    }

    /// Issue a CALL and await its response.
    ///
    /// Admission: the socket must be open and the station registered,
    /// except for BootNotification which only needs the open socket. A
    /// non-admitted frame is buffered (deduplicated by exact content) and
    /// the caller rejected; a non-admitted BootNotification fails
    /// outright.
    pub async fn call(&self, action: &str, payload: Value) -> OcppResult<Value> {
        let admitted = self.is_open().await && (self.is_registered() || action == BOOT_NOTIFICATION_ACTION);

        let call = Call::new(action, payload);
        let wire = Frame::Call(call.clone()).to_wire()?;

        if !admitted {
            if action == BOOT_NOTIFICATION_ACTION {
                return Err(OcppError::generic(
                    "cannot send BootNotification on a closed WebSocket",
                ));
            }
            self.enqueue_offline(wire).await;
            warn!(
                "{}: WebSocket closed or station unregistered, buffered {action} request",
                self.station_id
            );
            return Err(OcppError::buffered(action));
        }

        let (responder, response) = oneshot::channel();
        self.pending.insert(
            call.message_id.clone(),
            PendingRequest {
                responder,
                action: call.action.clone(),
                request: call.payload.clone(),
            },
        );

        if !self.send_raw(wire.clone()).await {
            // socket vanished between the admission check and the send
            self.pending.remove(&call.message_id);
            self.enqueue_offline(wire).await;
            return Err(OcppError::buffered(action));
        }
        debug!("{}: sent {} CALL {}", self.station_id, action, call.message_id);

        match timeout(self.rpc_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OcppError::Transport(
                "response channel closed before a response arrived".to_string(),
            )),
            Err(_) => {
                self.pending.remove(&call.message_id);
                error!(
                    "{}: timeout waiting for response to {} ({})",
                    self.station_id, action, call.message_id
                );
                Err(OcppError::timeout(&call.message_id))
            }
        }
    }

    /// Send a CALLRESULT answering an inbound CALL.
    pub async fn send_call_result(&self, message_id: &str, payload: Value) -> OcppResult<()> {
        let wire = Frame::CallResult(CallResult {
            message_id: message_id.to_string(),
            payload,
        })
        .to_wire()?;
        if self.send_raw(wire).await {
            Ok(())
        } else {
            Err(OcppError::Transport("WebSocket closed".to_string()))
        }
    }

    /// Send a CALLERROR answering an inbound CALL.
    pub async fn send_call_error(&self, message_id: &str, error: &OcppError) -> OcppResult<()> {
        let wire = Frame::CallError(CallError::from_error(message_id, error)).to_wire()?;
        if self.send_raw(wire).await {
            Ok(())
        } else {
            Err(OcppError::Transport("WebSocket closed".to_string()))
        }
    }

    /// Complete the pending CALL `message_id` with a successful payload.
    /// Responses arriving after a timeout (or for unknown ids) are
    /// dropped silently apart from a debug log.
    pub fn resolve(&self, message_id: &str, payload: Value) {
        match self.pending.remove(message_id) {
            Some((_, pending)) => {
                debug!(
                    "{}: resolved {} response {}",
                    self.station_id, pending.action, message_id
                );
                let _ = pending.responder.send(Ok(payload));
            }
            None => debug!(
                "{}: dropping response for unknown or timed-out message id {message_id}",
                self.station_id
            ),
        }
    }

    /// Reject the pending CALL `message_id` with an OCPP error.
    pub fn reject(&self, message_id: &str, error: OcppError) {
        match self.pending.remove(message_id) {
            Some((_, pending)) => {
                warn!(
                    "{}: {} request {} rejected by peer: {} (request was {})",
                    self.station_id, pending.action, message_id, error, pending.request
                );
                let _ = pending.responder.send(Err(error));
            }
            None => debug!(
                "{}: dropping error for unknown or timed-out message id {message_id}",
                self.station_id
            ),
        }
    }

    /// Number of CALLs currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Frames waiting for the next registered connection.
    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }

    /// Send every buffered frame in FIFO order, removing each as it goes
    /// out. Stops when the socket drops mid-drain.
    pub async fn drain_offline_queue(&self) {
        let mut queue = self.offline_queue.lock().await;
        while let Some(frame) = queue.front().cloned() {
            if !self.send_raw(frame).await {
                warn!(
                    "{}: socket dropped while draining offline queue, {} frame(s) kept",
                    self.station_id,
                    queue.len()
                );
                return;
            }
            queue.pop_front();
        }
    }

    async fn enqueue_offline(&self, frame: String) {
        let mut queue = self.offline_queue.lock().await;
        // exact duplicates guard against repeated failed sends of the
        // same frame
        if !queue.contains(&frame) {
            queue.push_back(frame);
        }
    }

    async fn send_raw(&self, frame: String) -> bool {
        match self.sink.read().await.as_ref() {
            Some(sink) => sink.send(OutboundFrame::Text(frame)).is_ok(),
            None => false,
        }
    }

    /// Issue an RFC 6455 ping when the socket is open.
    pub async fn send_ping(&self) -> bool {
        match self.sink.read().await.as_ref() {
            Some(sink) => sink.send(OutboundFrame::Ping).is_ok(),
            None => false,
        }
    }

    /// Answer a received ping.
    pub async fn send_pong(&self, payload: Vec<u8>) -> bool {
        match self.sink.read().await.as_ref() {
            Some(sink) => sink.send(OutboundFrame::Pong(payload)).is_ok(),
            None => false,
        }
    }

    /// Ask the writer task to close the socket.
    pub async fn send_close(&self) {
        if let Some(sink) = self.sink.read().await.as_ref() {
            let _ = sink.send(OutboundFrame::Close);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evsim_types::ErrorCode;
    use serde_json::json;

    fn transport() -> RpcTransport {
        RpcTransport::new("CS-TEST-0000", Duration::from_millis(50))
    }

    async fn open_transport() -> (RpcTransport, mpsc::UnboundedReceiver<OutboundFrame>) {
        let transport = transport();
        let (tx, rx) = mpsc::unbounded_channel();
        transport.attach_sink(tx).await;
        (transport, rx)
    }

    fn frame_text(frame: OutboundFrame) -> String {
        match frame {
            OutboundFrame::Text(text) => text,
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn boot_notification_fails_fast_when_closed() {
        let transport = transport();
        let err = transport
            .call(BOOT_NOTIFICATION_ACTION, json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::GenericError);
        assert_eq!(transport.offline_queue_len().await, 0);
    }

    #[tokio::test]
    async fn non_boot_calls_are_buffered_when_closed() {
        let transport = transport();
        let err = transport.call("Heartbeat", json!({})).await.unwrap_err();
        assert!(err.description().contains("buffered"));
        assert_eq!(transport.offline_queue_len().await, 1);
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn boot_gate_blocks_until_registered() {
        let (transport, _rx) = open_transport().await;
        // open socket but not registered: still buffered
        let err = transport.call("Heartbeat", json!({})).await.unwrap_err();
        assert!(err.description().contains("buffered"));
    }

    #[tokio::test]
    async fn call_resolves_with_matching_response() {
        let (transport, mut rx) = open_transport().await;
        transport.set_registered(true);

        let call = transport.call("Heartbeat", json!({}));
        let resolver = async {
            let sent = frame_text(rx.recv().await.unwrap());
            let value: Value = serde_json::from_str(&sent).unwrap();
            assert_eq!(value[0], 2);
            assert_eq!(value[2], "Heartbeat");
            let id = value[1].as_str().unwrap().to_string();
            transport.resolve(&id, json!({"currentTime": "2024-01-01T00:00:00Z"}));
        };

        let (result, ()) = tokio::join!(call, resolver);
        let payload = result.unwrap();
        assert_eq!(payload["currentTime"], "2024-01-01T00:00:00Z");
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn call_rejects_on_call_error() {
        let (transport, mut rx) = open_transport().await;
        transport.set_registered(true);

        let call = transport.call("Heartbeat", json!({}));
        let rejecter = async {
            let sent = frame_text(rx.recv().await.unwrap());
            let value: Value = serde_json::from_str(&sent).unwrap();
            let id = value[1].as_str().unwrap().to_string();
            transport.reject(
                &id,
                OcppError::Call {
                    code: ErrorCode::InternalError,
                    description: "server melted".to_string(),
                    details: json!({}),
                },
            );
        };

        let (result, ()) = tokio::join!(call, rejecter);
        let err = result.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InternalError);
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn call_times_out_and_late_response_is_dropped() {
        let (transport, mut rx) = open_transport().await;
        transport.set_registered(true);

        let err = transport.call("Heartbeat", json!({})).await.unwrap_err();
        assert!(err.description().contains("Timeout"));
        assert_eq!(transport.pending_count(), 0);

        // the frame did go out; resolving afterwards must be a no-op
        let sent = frame_text(rx.recv().await.unwrap());
        let value: Value = serde_json::from_str(&sent).unwrap();
        let id = value[1].as_str().unwrap().to_string();
        transport.resolve(&id, json!({}));
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn offline_queue_drains_in_fifo_order() {
        let transport = transport();

        let _ = transport.call("Heartbeat", json!({})).await;
        let _ = transport
            .call("StatusNotification", json!({"connectorId": 1}))
            .await;
        assert_eq!(transport.offline_queue_len().await, 2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.attach_sink(tx).await;
        transport.set_registered(true);
        transport.drain_offline_queue().await;
        assert_eq!(transport.offline_queue_len().await, 0);

        let first: Value = serde_json::from_str(&frame_text(rx.recv().await.unwrap())).unwrap();
        assert_eq!(first[2], "Heartbeat");
        let second: Value = serde_json::from_str(&frame_text(rx.recv().await.unwrap())).unwrap();
        assert_eq!(second[2], "StatusNotification");
    }

    #[tokio::test]
    async fn exact_duplicate_frames_are_suppressed_on_enqueue() {
        let transport = transport();
        let frame = Frame::Call(Call::new("Heartbeat", json!({})))
            .to_wire()
            .unwrap();

        transport.enqueue_offline(frame.clone()).await;
        transport.enqueue_offline(frame.clone()).await;
        assert_eq!(transport.offline_queue_len().await, 1);

        let other = Frame::Call(Call::new("Heartbeat", json!({})))
            .to_wire()
            .unwrap();
        transport.enqueue_offline(other).await;
        assert_eq!(transport.offline_queue_len().await, 2);
    }

    #[tokio::test]
    async fn drain_stops_when_socket_drops() {
        let transport = transport();
        let _ = transport.call("Heartbeat", json!({})).await;
        assert_eq!(transport.offline_queue_len().await, 1);

        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        transport.attach_sink(tx).await;
        transport.drain_offline_queue().await;
        // the closed channel keeps the frame queued
        assert_eq!(transport.offline_queue_len().await, 1);
    }

    #[tokio::test]
    async fn call_result_and_error_frames_are_well_formed() {
        let (transport, mut rx) = open_transport().await;

        transport
            .send_call_result("id-1", json!({"status": "Accepted"}))
            .await
            .unwrap();
        let value: Value = serde_json::from_str(&frame_text(rx.recv().await.unwrap())).unwrap();
        assert_eq!(value, json!([3, "id-1", {"status": "Accepted"}]));

        transport
            .send_call_error("id-2", &OcppError::not_implemented("Fancy"))
            .await
            .unwrap();
        let value: Value = serde_json::from_str(&frame_text(rx.recv().await.unwrap())).unwrap();
        assert_eq!(value[0], 4);
        assert_eq!(value[1], "id-2");
        assert_eq!(value[2], "NotImplemented");
    }
}
