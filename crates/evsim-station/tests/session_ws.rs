//! Session lifecycle over a real WebSocket, against an in-process
//! central-system stub.

use evsim_station::{Station, StationTemplate};
use evsim_types::v16::Reason;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

fn template(port: u16) -> StationTemplate {
    serde_json::from_value(json!({
        "chargePointModel": "Virtual",
        "chargePointVendor": "evsim",
        "baseName": "CS-WS",
        "power": 7360.0,
        "numberOfConnectors": 1,
        "supervisionURL": format!("ws://127.0.0.1:{port}"),
        "connectionTimeout": 1,
        "Connectors": {
            "0": {},
            "1": {}
        }
    }))
    .unwrap()
}

/// Accept `connections` WebSocket sessions in order and answer every CALL
/// with a protocol-correct canned response. Each session ends when the
/// client closes or the stream errors out.
async fn spawn_central_system(connections: usize) -> (u16, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        for _ in 0..connections {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(message) = socket.next().await {
                let Ok(message) = message else { break };
                match message {
                    Message::Text(text) => {
                        let value: Value = serde_json::from_str(&text).unwrap();
                        if value[0] != 2 {
                            continue;
                        }
                        let payload = match value[2].as_str().unwrap() {
                            "BootNotification" => json!({
                                "status": "Accepted",
                                "currentTime": "2024-06-01T10:00:00Z",
                                "interval": 300
                            }),
                            "Heartbeat" => json!({"currentTime": "2024-06-01T10:00:00Z"}),
                            _ => json!({}),
                        };
                        let reply = json!([3, value[1], payload]).to_string();
                        if socket.send(Message::Text(reply)).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    });
    (port, handle)
}

async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..1000 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn boots_over_a_real_websocket() {
    let (port, _server) = spawn_central_system(1).await;
    let station: Arc<Station> = Station::from_template(0, template(port)).await.unwrap();

    station.start().await.unwrap();
    wait_until("registration", || async { station.is_registered().await }).await;

    assert!(station.heartbeat_running().await);
    let response = station.boot_response().await.unwrap();
    assert_eq!(response.interval, 300);

    // heartbeat keys mirror the boot interval
    let heartbeat = station.send_heartbeat().await.unwrap();
    assert_eq!(
        heartbeat.current_time.to_rfc3339(),
        "2024-06-01T10:00:00+00:00"
    );

    station.stop(Reason::Local).await.unwrap();
    assert!(station.has_stopped());
    assert!(!station.is_registered().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnects_after_abnormal_close() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let sessions = Arc::new(AtomicUsize::new(0));
    let sessions_seen = Arc::clone(&sessions);

    // first session: answer the boot exchange, then drop the TCP
    // connection without a close frame; second session: behave normally
    tokio::spawn(async move {
        for session in 0..2 {
            let (stream, _) = listener.accept().await.unwrap();
            sessions_seen.fetch_add(1, Ordering::SeqCst);
            let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut answered = 0;
            while let Some(message) = socket.next().await {
                let Ok(Message::Text(text)) = message else { break };
                let value: Value = serde_json::from_str(&text).unwrap();
                if value[0] != 2 {
                    continue;
                }
                let payload = match value[2].as_str().unwrap() {
                    "BootNotification" => json!({
                        "status": "Accepted",
                        "currentTime": "2024-06-01T10:00:00Z",
                        "interval": 300
                    }),
                    "Heartbeat" => json!({"currentTime": "2024-06-01T10:00:00Z"}),
                    _ => json!({}),
                };
                let reply = json!([3, value[1], payload]).to_string();
                if socket.send(Message::Text(reply)).await.is_err() {
                    break;
                }
                answered += 1;
                // kill the first session once the station is settled:
                // boot plus the per-connector status notification
                if session == 0 && answered >= 2 {
                    drop(socket);
                    break;
                }
            }
        }
    });

    let station: Arc<Station> = Station::from_template(0, template(port)).await.unwrap();
    station.start().await.unwrap();
    wait_until("registration", || async { station.is_registered().await }).await;

    // the dropped socket is an abnormal close; with connectionTimeout at
    // one second the retry fires quickly and the second session comes up
    wait_until("second session", || async {
        sessions.load(Ordering::SeqCst) >= 2
            && station.transport().is_open().await
            && station.is_registered().await
    })
    .await;

    station.stop(Reason::Local).await.unwrap();
}
