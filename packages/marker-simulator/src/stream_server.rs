//! stream_server.rs — Tracking WebSocket server
//!
//! Speaks the tracking-server protocol the bridge's transport client polls:
//!   - on connect: `{"command":"REQUEST_ID"}`, first reply must carry `client_id`
//!   - `stream_data`: register/update a named stream
//!   - `request_stream_data`: reply with the stream's current data
//!   - `close_stream`, `broadcast` (fan-out to other clients), `message`,
//!     `send_to_client`, `client_id`
//!   - shutdown: `{"command":"SERVER_CLOSING"}` to every client
//!
//! The simulator publishes its own detections into a stream through
//! [`TrackingServer::publish`].

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use marker_types::ServerMessage;
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

pub struct TrackingServer {
    clients: RwLock<HashMap<String, mpsc::UnboundedSender<String>>>,
    streams: RwLock<HashMap<String, Value>>,
    /// `message` payloads for the simulator's control loop
    control: mpsc::UnboundedSender<(String, Value)>,
}

pub type SharedServer = Arc<TrackingServer>;

impl TrackingServer {
    pub fn new() -> (SharedServer, mpsc::UnboundedReceiver<(String, Value)>) {
        let (control, rx) = mpsc::unbounded_channel();
        let server = Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            streams: RwLock::new(HashMap::new()),
            control,
        });
        (server, rx)
    }

    /// Register a client; the returned receiver yields its outbound frames.
    pub async fn register(&self, client_id: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.clients.write().await.insert(client_id.to_string(), tx).is_some() {
            warn!("Client {client_id} reconnected, replacing previous socket");
        }
        info!("New client connected: ID {client_id}");
        rx
    }

    pub async fn unregister(&self, client_id: &str) {
        if self.clients.write().await.remove(client_id).is_some() {
            info!("Client disconnected: ID {client_id}");
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    #[cfg(test)]
    pub async fn stream(&self, name: &str) -> Option<Value> {
        self.streams.read().await.get(name).cloned()
    }

    /// Update (registering if needed) a stream from inside the simulator.
    pub async fn publish(&self, stream_name: &str, data: Value) {
        let mut streams = self.streams.write().await;
        if streams.insert(stream_name.to_string(), data).is_none() {
            info!("Stream '{stream_name}' started by simulator");
        }
    }

    async fn send_to(&self, client_id: &str, text: String) -> bool {
        match self.clients.read().await.get(client_id) {
            Some(tx) => tx.send(text).is_ok(),
            None => false,
        }
    }

    pub async fn handle_message(&self, client_id: &str, data: Value) {
        let command = data.get("command").and_then(Value::as_str).unwrap_or_default();
        match command {
            "send_to_client" => {
                let target = data.get("target_id").and_then(Value::as_str).unwrap_or_default();
                if self.send_to(target, data.to_string()).await {
                    info!("Message from {client_id} sent to {target}");
                } else {
                    warn!("Client {target} not found.");
                }
            }
            "stream_data" => {
                let name = data.get("stream_name").and_then(Value::as_str).unwrap_or_default();
                let payload = data.get("data").cloned().unwrap_or(Value::Null);
                let mut streams = self.streams.write().await;
                if streams.insert(name.to_string(), payload).is_none() {
                    info!("Stream '{name}' started by {client_id}");
                }
                debug!("Received data for stream '{name}' from client {client_id}");
            }
            "request_stream_data" => {
                let name = data.get("stream_name").and_then(Value::as_str).unwrap_or_default();
                let current = self.streams.read().await.get(name).cloned();
                match current {
                    Some(current) => {
                        let reply = json!({ "command": "stream_data", "stream_name": name, "data": current });
                        self.send_to(client_id, reply.to_string()).await;
                    }
                    None => warn!("Stream '{name}' not found."),
                }
            }
            "close_stream" => {
                let name = data.get("stream_name").and_then(Value::as_str).unwrap_or_default();
                if self.streams.write().await.remove(name).is_some() {
                    info!("Stream '{name}' closed by {client_id}");
                }
            }
            "broadcast" => {
                let payload = data.get("data").cloned().unwrap_or(Value::Null);
                self.broadcast(payload, Some(client_id)).await;
            }
            "message" => {
                let payload = data.get("data").cloned().unwrap_or(Value::Null);
                info!("Message from {client_id}: {payload}");
                let _ = self.control.send((client_id.to_string(), payload));
            }
            "client_id" => {
                info!("Received client_id command from {client_id}: {:?}", data.get("client_id"));
            }
            other => warn!("Unknown command from {client_id}: {other}"),
        }
    }

    pub async fn broadcast(&self, data: Value, exclude: Option<&str>) {
        let text = match serde_json::to_string(&ServerMessage::Broadcast { data }) {
            Ok(t) => t,
            Err(e) => {
                warn!("broadcast: serialize failed: {e}");
                return;
            }
        };
        for (id, tx) in self.clients.read().await.iter() {
            if Some(id.as_str()) != exclude {
                let _ = tx.send(text.clone());
            }
        }
    }

    /// Tell every client the server is going away and drop them.
    pub async fn close_all(&self) {
        let text = serde_json::to_string(&ServerMessage::ServerClosing).unwrap_or_default();
        let mut clients = self.clients.write().await;
        if !clients.is_empty() {
            info!("Disconnecting all clients...");
        }
        for tx in clients.values() {
            let _ = tx.send(text.clone());
        }
        clients.clear();
    }
}

// ── WebSocket plumbing ────────────────────────────────────────────────────────

pub fn router(server: SharedServer) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/health", get(|| async { "marker-sim ok" }))
        .with_state(server)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}

async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SharedServer>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, server))
}

async fn handle_socket(mut socket: WebSocket, server: SharedServer) {
    let hello = serde_json::to_string(&ServerMessage::RequestId).unwrap_or_default();
    if socket.send(Message::Text(hello)).await.is_err() {
        return;
    }

    // First frame must identify the client
    let client_id = match socket.recv().await {
        Some(Ok(Message::Text(text))) => serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("client_id").and_then(Value::as_str).map(str::to_string)),
        _ => None,
    };
    let Some(client_id) = client_id else {
        warn!("Connection closed before client identified");
        return;
    };

    let mut outbound = server.register(&client_id).await;
    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(text) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                // Dropped by close_all
                None => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(&text) {
                    Ok(v) => server.handle_message(&client_id, v).await,
                    Err(e) => warn!("Bad JSON from {client_id}: {e}"),
                },
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    server.unregister(&client_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_returns_current_stream_data() {
        let (server, _control) = TrackingServer::new();
        let mut rx = server.register("bridge").await;

        server.handle_message("bridge", json!({"command": "request_stream_data", "stream_name": "s"})).await;
        assert!(rx.try_recv().is_err(), "unknown stream gets no reply");

        server.publish("s", json!([{"marker_id": 1, "x": 0.0, "y": 0.0, "z": 1.0}])).await;
        server.handle_message("bridge", json!({"command": "request_stream_data", "stream_name": "s"})).await;
        let reply: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(reply["command"], "stream_data");
        assert_eq!(reply["data"][0]["marker_id"], 1);
    }

    #[tokio::test]
    async fn broadcast_skips_sender() {
        let (server, _control) = TrackingServer::new();
        let mut a = server.register("a").await;
        let mut b = server.register("b").await;
        server.handle_message("a", json!({"command": "broadcast", "data": "hello"})).await;
        assert!(a.try_recv().is_err());
        let got: Value = serde_json::from_str(&b.try_recv().unwrap()).unwrap();
        assert_eq!(got, json!({"command": "broadcast", "data": "hello"}));
    }

    #[tokio::test]
    async fn stream_lifecycle_and_control_messages() {
        let (server, mut control) = TrackingServer::new();
        server
            .handle_message("tracker", json!({"command": "stream_data", "stream_name": "s", "data": []}))
            .await;
        assert_eq!(server.stream("s").await, Some(json!([])));
        server.handle_message("tracker", json!({"command": "close_stream", "stream_name": "s"})).await;
        assert_eq!(server.stream("s").await, None);

        server.handle_message("ui", json!({"command": "message", "data": {"scenario": "dropout"}})).await;
        let (from, payload) = control.try_recv().unwrap();
        assert_eq!(from, "ui");
        assert_eq!(payload["scenario"], "dropout");
    }

    #[tokio::test]
    async fn close_all_says_goodbye() {
        let (server, _control) = TrackingServer::new();
        let mut rx = server.register("bridge").await;
        server.close_all().await;
        assert_eq!(rx.recv().await.as_deref(), Some(r#"{"command":"SERVER_CLOSING"}"#));
        assert_eq!(rx.recv().await, None);
        assert_eq!(server.client_count().await, 0);
    }
}
