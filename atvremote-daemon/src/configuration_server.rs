//! Configuration endpoint
//!
//! HTTP and WebSocket server for the configuration UI:
//!
//! - a WebSocket on `/` receives the device snapshot array on connect and
//!   again on every state change
//! - `GET /state` returns the same array once
//! - `POST` with a [`ConfigurationRequest`] body runs it against the registry
//!
//! Requests are handed to the dispatch loop, which owns the registry, and
//! the result is sent back over a oneshot channel.

use anyhow::{Context, Result};
use atvremote_protocol::{ConfigurationRequest, DeviceStateSnapshot, ProtocolError};
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Latest device snapshot array, replaced on every state change
pub type SnapshotReceiver = watch::Receiver<Vec<DeviceStateSnapshot>>;

/// A request for the dispatch loop and the channel for its outcome
pub type PendingRequest = (
    ConfigurationRequest,
    oneshot::Sender<std::result::Result<(), ProtocolError>>,
);

#[derive(Clone)]
struct ServerState {
    snapshot: SnapshotReceiver,
    requests: mpsc::UnboundedSender<PendingRequest>,
}

/// Build the endpoint's routes
pub fn router(snapshot: SnapshotReceiver, requests: mpsc::UnboundedSender<PendingRequest>) -> Router {
    Router::new()
        .route("/", get(websocket).post(run_request))
        .route("/state", get(current_state))
        .route("/*action", post(run_request))
        .with_state(ServerState { snapshot, requests })
}

/// Listen on `port` until the server fails
pub async fn run(
    port: u16,
    snapshot: SnapshotReceiver,
    requests: mpsc::UnboundedSender<PendingRequest>,
) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind configuration port {}", port))?;
    info!("Configuration endpoint listening on port {}", port);

    axum::serve(listener, router(snapshot, requests))
        .await
        .context("Configuration endpoint failed")
}

/// HTTP status for a failed request
fn failure_status(error: &ProtocolError) -> StatusCode {
    if error.requires_user_action() {
        StatusCode::BAD_REQUEST
    } else if error.is_recoverable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn current_state(State(state): State<ServerState>) -> Json<Vec<DeviceStateSnapshot>> {
    Json(state.snapshot.borrow().clone())
}

async fn run_request(State(state): State<ServerState>, body: Bytes) -> Response {
    let request = match serde_json::from_slice::<ConfigurationRequest>(&body) {
        Ok(request) => request,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    debug!("Configuration request {:?}", request);

    let (reply, outcome) = oneshot::channel();
    if state.requests.send((request, reply)).is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "dispatch loop is not running");
    }

    match outcome.await {
        Ok(Ok(())) => Json(json!({ "ok": true })).into_response(),
        Ok(Err(e)) => {
            warn!("Configuration request failed: {}", e);
            error_response(failure_status(&e), e.to_string())
        }
        Err(_) => error_response(StatusCode::SERVICE_UNAVAILABLE, "request was dropped"),
    }
}

async fn websocket(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| push_state(socket, state.snapshot))
}

async fn push_state(socket: WebSocket, mut snapshot: SnapshotReceiver) {
    let (mut sender, mut receiver) = socket.split();
    info!("Configuration UI connected");

    loop {
        let payload = match serde_json::to_string(&*snapshot.borrow_and_update()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Cannot serialize device state: {}", e);
                break;
            }
        };
        if sender.send(Message::Text(payload.into())).await.is_err() {
            break;
        }

        // wait for the next change, answering nothing the UI sends
        let changed = loop {
            tokio::select! {
                changed = snapshot.changed() => break changed.is_ok(),
                message = receiver.next() => match message {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break false,
                    Some(Ok(_)) => {}
                },
            }
        };
        if !changed {
            break;
        }
    }

    debug!("Configuration UI disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use atvremote_protocol::ControlState;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn device(control_state: ControlState, pairing_state: &str) -> DeviceStateSnapshot {
        DeviceStateSnapshot {
            index: 1,
            ip_address: "192.168.1.40".to_string(),
            name: "Living Room".to_string(),
            control_state,
            pairing_state: pairing_state.to_string(),
        }
    }

    async fn start(
        initial: Vec<DeviceStateSnapshot>,
    ) -> (
        SocketAddr,
        watch::Sender<Vec<DeviceStateSnapshot>>,
        mpsc::UnboundedReceiver<PendingRequest>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (snapshot_sender, snapshot) = watch::channel(initial);
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            axum::serve(listener, router(snapshot, sender)).await.unwrap();
        });
        (addr, snapshot_sender, receiver)
    }

    async fn exchange(addr: SocketAddr, request: &[u8]) -> String {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(request).await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    fn post(path: &str, body: &str) -> Vec<u8> {
        format!(
            "POST {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\
             Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            path,
            body.len(),
            body
        )
        .into_bytes()
    }

    /// Answer requests the way the dispatch loop does for a one-device fleet
    fn answer_requests(mut requests: mpsc::UnboundedReceiver<PendingRequest>) {
        tokio::spawn(async move {
            while let Some((request, reply)) = requests.recv().await {
                let outcome = match request {
                    ConfigurationRequest::InitiatePairing { device_index: 1 } => Ok(()),
                    ConfigurationRequest::SendAnswer { .. } => {
                        Err(ProtocolError::NotConnected("pairing channel".to_string()))
                    }
                    other => Err(ProtocolError::DeviceNotFound(other.device_index())),
                };
                let _ = reply.send(outcome);
            }
        });
    }

    #[test]
    fn test_failure_status() {
        assert_eq!(failure_status(&ProtocolError::DeviceNotFound(9)), StatusCode::BAD_REQUEST);
        assert_eq!(
            failure_status(&ProtocolError::Timeout("pairing".to_string())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            failure_status(&ProtocolError::InvalidMessage("bad header".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_get_state() {
        let (addr, _snapshot, _requests) = start(vec![device(ControlState::Paired, "")]).await;

        let reply = exchange(addr, b"GET /state HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").await;
        assert!(reply.starts_with("HTTP/1.1 200 OK"));
        assert!(reply.ends_with(
            r#"[{"index":1,"ipAddress":"192.168.1.40","name":"Living Room","controlState":"Paired","pairingState":""}]"#
        ));
    }

    #[tokio::test]
    async fn test_post_request_round_trip() {
        let (addr, _snapshot, requests) = start(Vec::new()).await;
        answer_requests(requests);

        let reply = exchange(addr, &post("/", r#"{"method":"InitiatePairing","deviceIndex":1}"#)).await;
        assert!(reply.starts_with("HTTP/1.1 200 OK"));

        let reply = exchange(addr, &post("/api/InstallCompanionApp", r#"{"method":"InstallCompanionApp","deviceIndex":9}"#)).await;
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request"));
        assert!(reply.contains("Device not found: 9"));

        let reply = exchange(addr, &post("/", r#"{"method":"SendAnswer","deviceIndex":1,"answer":"3C4F21"}"#)).await;
        assert!(reply.starts_with("HTTP/1.1 503 Service Unavailable"));

        let reply = exchange(addr, &post("/", "{}")).await;
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request"));
    }

    #[tokio::test]
    async fn test_oversized_content_length_is_rejected() {
        let (addr, _snapshot, requests) = start(Vec::new()).await;
        answer_requests(requests);

        let reply = exchange(
            addr,
            b"POST / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\
              Content-Length: 18446744073709551615\r\n\r\n{}",
        )
        .await;
        assert!(reply.starts_with("HTTP/1.1 4"), "unexpected reply: {}", reply);

        // the server keeps serving
        let reply = exchange(addr, &post("/", r#"{"method":"InitiatePairing","deviceIndex":1}"#)).await;
        assert!(reply.starts_with("HTTP/1.1 200 OK"));
    }

    #[tokio::test]
    async fn test_websocket_pushes_state_changes() {
        let (addr, snapshot, _requests) = start(vec![device(ControlState::Disconnected, "")]).await;

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{}/", addr))
            .await
            .unwrap();

        let first = client.next().await.unwrap().unwrap();
        let devices: serde_json::Value = serde_json::from_str(first.to_text().unwrap()).unwrap();
        assert_eq!(devices[0]["controlState"], "Disconnected");

        snapshot.send_replace(vec![device(ControlState::Paired, "Successful")]);
        let second = client.next().await.unwrap().unwrap();
        let devices: serde_json::Value = serde_json::from_str(second.to_text().unwrap()).unwrap();
        assert_eq!(devices[0]["controlState"], "Paired");
        assert_eq!(devices[0]["pairingState"], "Successful");
    }
}
