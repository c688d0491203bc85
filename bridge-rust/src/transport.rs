//! # transport
//!
//! WebSocket client for the tracking server.
//!
//! ## Lifecycle
//! `connect()` performs the WebSocket handshake, immediately identifies with
//! `{"command":"client_id", ...}` and spawns three tasks for the connection:
//!   - reader: frames → bounded inbound queue (`TransportEvent::Frame`)
//!   - writer: outbound channel → socket
//!   - poll: `request_stream_data` on a repeating timer while `Open`
//!
//! Frames are never interpreted on the I/O tasks; the pipeline drains the
//! queue once per tick and calls [`dispatch`].
//!
//! Exactly one `TransportEvent::Closed` is emitted per connection, whether the
//! server hung up or `disconnect()` was called (any number of times).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use marker_types::{ClientMessage, MarkerId, MarkerRecord, DEFAULT_STREAM_NAME};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use crate::error::{ConnectError, SendError};
use crate::rolling_log::{RollingLog, DEFAULT_LOG_LINES};
use crate::ticker::{wait_for_shutdown, RepeatingTimer, Shutdown};

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub enabled: bool,
    pub url: String,
    pub client_id: String,
    pub stream_name: String,
    /// Period of `request_stream_data` polls
    pub request_interval_ms: u64,
    /// Delay between reconnect attempts
    pub reconnect_interval_ms: u64,
    /// `None` accepts every marker id
    pub allowed_marker_ids: Option<Vec<MarkerId>>,
    pub log_lines: usize,
    pub inbound_queue: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "ws://127.0.0.1:8080/".to_string(),
            client_id: "marker-bridge".to_string(),
            stream_name: DEFAULT_STREAM_NAME.to_string(),
            request_interval_ms: 50,
            reconnect_interval_ms: 2000,
            allowed_marker_ids: Some(vec![0, 1, 2, 3, 4, 5]),
            log_lines: DEFAULT_LOG_LINES,
            inbound_queue: 1024,
        }
    }
}

impl TransportConfig {
    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

// ── State & events ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Open,
    Closed,
    Errored,
}

impl ConnectionState {
    pub fn is_live(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Open)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One text frame as received (binary frames are decoded as UTF-8)
    Frame(String),
    Error(String),
    Closed,
}

/// Classification of one inbound frame by its `command` discriminator.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    StreamData(Value),
    Broadcast(Value),
    /// Server asks the client to identify
    RequestId,
    ServerClosing,
    Message(Value),
    /// Has a `command`, just not one we know
    Unknown(String),
    /// Valid JSON without a `command` field
    Unrecognized,
    Malformed(String),
}

pub fn dispatch(text: &str) -> Inbound {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return Inbound::Malformed(e.to_string()),
    };
    let Some(command) = value.get("command").and_then(Value::as_str) else {
        return Inbound::Unrecognized;
    };
    match command {
        "stream_data" => Inbound::StreamData(value),
        "broadcast" => Inbound::Broadcast(value.get("data").cloned().unwrap_or(Value::Null)),
        "message" => Inbound::Message(value.get("data").cloned().unwrap_or(Value::Null)),
        "REQUEST_ID" => Inbound::RequestId,
        "SERVER_CLOSING" => Inbound::ServerClosing,
        other => Inbound::Unknown(other.to_string()),
    }
}

/// `{command, client_id, ...fields}` as a text frame.
fn envelope(command: &str, client_id: &str, fields: Map<String, Value>) -> Result<String, serde_json::Error> {
    let mut msg = Map::with_capacity(fields.len() + 2);
    msg.insert("command".to_string(), Value::from(command));
    msg.insert("client_id".to_string(), Value::from(client_id));
    msg.extend(fields);
    serde_json::to_string(&Value::Object(msg))
}

// ── Client ────────────────────────────────────────────────────────────────────

struct Link {
    outbound: mpsc::UnboundedSender<Message>,
    stop: Shutdown,
    closed: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct TransportClient {
    config: TransportConfig,
    state: watch::Sender<ConnectionState>,
    events: mpsc::Sender<TransportEvent>,
    log: RollingLog,
    link: Mutex<Option<Link>>,
}

impl TransportClient {
    /// Create a disconnected client and the receiving end of its inbound queue.
    pub fn new(config: TransportConfig) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (events, rx) = mpsc::channel(config.inbound_queue.max(1));
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let log = RollingLog::new(config.log_lines);
        let client = Self { config, state, events, log, link: Mutex::new(None) };
        (client, rx)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn log(&self) -> RollingLog {
        self.log.clone()
    }

    /// Open the connection and identify. Failure is reported, never fatal;
    /// the caller may retry.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let url = self.config.url.clone();
        if self.state().is_live() {
            return Err(ConnectError::AlreadyConnected(url));
        }
        // Leftovers of a connection the server already closed
        if let Some(old) = self.take_link() {
            old.stop.trigger();
        }

        self.state.send_replace(ConnectionState::Connecting);
        self.log.push(format!("Connecting to {url}")).await;

        let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _response)) => ws,
            Err(e) => {
                self.state.send_replace(ConnectionState::Errored);
                self.log.push(format!("Connection error: {e}")).await;
                return Err(ConnectError::Handshake { url, source: Box::new(e) });
            }
        };
        let (mut sink, stream) = ws.split();

        let hello = ClientMessage::ClientId { client_id: self.config.client_id.clone() };
        let sent = match serde_json::to_string(&hello) {
            Ok(text) => sink.send(Message::Text(text)).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = sent {
            self.state.send_replace(ConnectionState::Errored);
            self.log.push(format!("Handshake failed: {e}")).await;
            return Err(ConnectError::Identify(e));
        }

        self.state.send_replace(ConnectionState::Open);
        info!("🔌 Connected to {url} as {}", self.config.client_id);
        self.log.push(format!("Connected as {}", self.config.client_id)).await;

        let stop = Shutdown::new();
        let closed = Arc::new(AtomicBool::new(false));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_loop(sink, outbound_rx, stop.subscribe()));
        let reader = tokio::spawn(read_loop(
            stream,
            self.events.clone(),
            self.state.clone(),
            self.log.clone(),
            closed.clone(),
            stop.subscribe(),
        ));
        let poll = tokio::spawn(poll_loop(
            outbound.clone(),
            self.config.clone(),
            self.state.subscribe(),
            stop.subscribe(),
        ));

        let link = Link { outbound, stop, closed, tasks: vec![writer, reader, poll] };
        if let Ok(mut slot) = self.link.lock() {
            *slot = Some(link);
        }
        Ok(())
    }

    /// Close the connection if open. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let Some(link) = self.take_link() else {
            return;
        };
        link.stop.trigger();
        finish(&link.closed, &self.state, &self.events, &self.log, ConnectionState::Closed).await;
        for task in link.tasks {
            let _ = task.await;
        }
    }

    /// Send `{command, client_id, ...fields}`. Only valid while `Open`.
    pub async fn send(&self, command: &str, fields: Map<String, Value>) -> Result<(), SendError> {
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(SendError::NotOpen(state));
        }
        let outbound = self
            .link
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|l| l.outbound.clone()))
            .ok_or(SendError::NotOpen(state))?;

        let text = envelope(command, &self.config.client_id, fields)?;
        outbound
            .send(Message::Text(text))
            .map_err(|_| SendError::WriterClosed)?;
        self.log.push(format!("Sent: {command}")).await;
        Ok(())
    }

    /// Re-send the client id, e.g. when the server asks for it.
    pub async fn identify(&self) -> Result<(), SendError> {
        self.send("client_id", Map::new()).await
    }

    pub async fn request_stream_data(&self) -> Result<(), SendError> {
        self.send("request_stream_data", fields(json!({ "stream_name": self.config.stream_name }))).await
    }

    pub async fn send_text(&self, data: impl Into<Value>) -> Result<(), SendError> {
        self.send("message", fields(json!({ "data": data.into() }))).await
    }

    /// Tracker-side publish on the configured stream.
    pub async fn publish_stream_data(&self, records: &[MarkerRecord]) -> Result<(), SendError> {
        let data = serde_json::to_value(records)?;
        self.send("stream_data", fields(json!({ "stream_name": self.config.stream_name, "data": data }))).await
    }

    pub async fn close_stream(&self) -> Result<(), SendError> {
        self.send("close_stream", fields(json!({ "stream_name": self.config.stream_name }))).await
    }

    /// Keep a connection up until shutdown, retrying every
    /// `reconnect_interval_ms`. Disconnects on the way out.
    pub async fn maintain(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut timer = RepeatingTimer::new(self.config.reconnect_interval(), shutdown);
        while timer.tick().await {
            if self.state().is_live() {
                continue;
            }
            if let Err(e) = self.connect().await {
                warn!("Transport: {e}");
            }
        }
        self.disconnect().await;
    }

    fn take_link(&self) -> Option<Link> {
        self.link.lock().ok().and_then(|mut slot| slot.take())
    }
}

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Mark the connection ended. Only the first caller per connection emits
/// `Closed`.
async fn finish(
    closed: &AtomicBool,
    state: &watch::Sender<ConnectionState>,
    events: &mpsc::Sender<TransportEvent>,
    log: &RollingLog,
    end: ConnectionState,
) {
    if closed.swap(true, Ordering::SeqCst) {
        return;
    }
    state.send_replace(end);
    if events.try_send(TransportEvent::Closed).is_err() {
        debug!("Transport: inbound queue unavailable for close event");
    }
    info!("Transport connection closed ({end:?})");
    log.push("Connection closed").await;
}

// ── Connection tasks ──────────────────────────────────────────────────────────

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn write_loop(
    mut sink: futures_util::stream::SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut stop) => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        warn!("Transport: write failed: {e}");
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: futures_util::stream::SplitStream<WsStream>,
    events: mpsc::Sender<TransportEvent>,
    state: watch::Sender<ConnectionState>,
    log: RollingLog,
    closed: Arc<AtomicBool>,
    mut stop: watch::Receiver<bool>,
) {
    let mut end = ConnectionState::Closed;
    loop {
        let frame = tokio::select! {
            _ = wait_for_shutdown(&mut stop) => break,
            frame = stream.next() => frame,
        };
        let event = match frame {
            Some(Ok(Message::Text(text))) => TransportEvent::Frame(text),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => TransportEvent::Frame(text),
                Err(_) => {
                    warn!("Transport: dropping non UTF-8 binary frame");
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                end = ConnectionState::Errored;
                log.push(format!("Connection error: {e}")).await;
                let _ = events.try_send(TransportEvent::Error(e.to_string()));
                break;
            }
        };
        tokio::select! {
            _ = wait_for_shutdown(&mut stop) => break,
            res = events.send(event) => {
                if res.is_err() {
                    break;
                }
            }
        }
    }
    finish(&closed, &state, &events, &log, end).await;
}

async fn poll_loop(
    outbound: mpsc::UnboundedSender<Message>,
    config: TransportConfig,
    state: watch::Receiver<ConnectionState>,
    stop: watch::Receiver<bool>,
) {
    let mut timer = RepeatingTimer::new(config.request_interval(), stop);
    let poll = ClientMessage::RequestStreamData {
        client_id: config.client_id.clone(),
        stream_name: config.stream_name.clone(),
    };
    let Ok(text) = serde_json::to_string(&poll) else {
        return;
    };
    while timer.tick().await {
        if *state.borrow() != ConnectionState::Open {
            continue;
        }
        if outbound.send(Message::Text(text.clone())).is_err() {
            break;
        }
        trace!("Transport: polled {}", config.stream_name);
    }
}
