//! Error types for the marker bridge
//!
//! Only resource acquisition (bind, connect, config load) surfaces to callers.
//! Everything that can go wrong with a single message is logged where it
//! happens and the loop carries on.

use thiserror::Error;

/// Main error type for the bridge
#[derive(Error, Debug)]
pub enum Error {
    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Bind error: {0}")]
    Bind(#[from] BindError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport client connection failures
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("already connected to {0}")]
    AlreadyConnected(String),

    #[error("websocket handshake with {url} failed: {source}")]
    Handshake {
        url: String,
        #[source]
        source: Box<tokio_tungstenite::tungstenite::Error>,
    },

    #[error("failed to send client id handshake: {0}")]
    Identify(String),
}

/// Outbound message failures
#[derive(Error, Debug)]
pub enum SendError {
    #[error("connection is not open (state: {0:?})")]
    NotOpen(crate::transport::ConnectionState),

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("writer task has stopped")]
    WriterClosed,
}

/// Malformed inbound payloads (either ingestion path)
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message has no `data` field")]
    MissingData,

    #[error("unexpected command `{0}`")]
    UnexpectedCommand(String),

    #[error("marker key `{0}` is not an integer id")]
    InvalidMarkerId(String),
}

/// Relay socket could not be opened; the relay cannot run.
#[derive(Error, Debug)]
#[error("could not bind UDP {addr}: {source}")]
pub struct BindError {
    pub addr: String,
    #[source]
    pub source: std::io::Error,
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Result type alias for the bridge
pub type Result<T> = std::result::Result<T, Error>;
