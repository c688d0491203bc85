//! Bridge configuration: `bridge.toml`, then environment overrides, then CLI.

use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use crate::aligner::AlignerConfig;
use crate::calibration::CalibrationConfig;
use crate::error::ConfigError;
use crate::http::HttpConfig;
use crate::pipeline::PipelineConfig;
use crate::relay::RelayConfig;
use crate::store::StoreConfig;
use crate::transport::TransportConfig;

/// Shipped defaults, used when no config file is present.
pub const DEFAULT_CONFIG: &str = include_str!("../bridge.toml");

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub transport: TransportConfig,
    pub relay: RelayConfig,
    pub store: StoreConfig,
    pub calibration: CalibrationConfig,
    pub aligner: AlignerConfig,
    pub pipeline: PipelineConfig,
    pub http: HttpConfig,
}

impl BridgeConfig {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path`, falling back to the embedded defaults if it does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => {
                info!("Loaded configuration from {}", path.display());
                text
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("{} not found, using built-in defaults", path.display());
                DEFAULT_CONFIG.to_string()
            }
            Err(source) => {
                return Err(ConfigError::Read { path: path.display().to_string(), source });
            }
        };
        Self::parse(&text)
    }

    /// `MARKER_WS_URL`, `MARKER_CLIENT_ID`, `MARKER_UDP_PORT`, `MARKER_HTTP_PORT`.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(url) = lookup("MARKER_WS_URL") {
            self.transport.url = url;
        }
        if let Some(id) = lookup("MARKER_CLIENT_ID") {
            self.transport.client_id = id;
        }
        if let Some(port) = lookup("MARKER_UDP_PORT") {
            self.relay.udp_port = parse_port("MARKER_UDP_PORT", &port)?;
        }
        if let Some(port) = lookup("MARKER_HTTP_PORT") {
            self.http.port = parse_port("MARKER_HTTP_PORT", &port)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.transport;
        if t.enabled && !(t.url.starts_with("ws://") || t.url.starts_with("wss://")) {
            return Err(ConfigError::Invalid {
                field: "transport.url",
                reason: format!("`{}` is not a ws:// or wss:// URL", t.url),
            });
        }
        if t.client_id.trim().is_empty() {
            return Err(ConfigError::Invalid { field: "transport.client_id", reason: "must not be empty".into() });
        }
        if t.request_interval_ms == 0 {
            return Err(ConfigError::Invalid { field: "transport.request_interval_ms", reason: "must be > 0".into() });
        }
        if self.relay.liveness_timeout_ms == 0 {
            return Err(ConfigError::Invalid { field: "relay.liveness_timeout_ms", reason: "must be > 0".into() });
        }
        if self.pipeline.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid { field: "pipeline.tick_interval_ms", reason: "must be > 0".into() });
        }
        // Stream-path calibration only sees ids that pass the allow-list
        if let (true, Some(allowed)) = (t.enabled, &t.allowed_marker_ids) {
            let anchor = self.calibration.anchor_marker_id;
            if !allowed.contains(&anchor) {
                return Err(ConfigError::Invalid {
                    field: "calibration.anchor_marker_id",
                    reason: format!("anchor {anchor} is filtered out by transport.allowed_marker_ids"),
                });
            }
            for id in self.calibration.target_marker_ids.iter().filter(|id| !allowed.contains(id)) {
                warn!("Target marker {id} is filtered out by transport.allowed_marker_ids");
            }
        }
        Ok(())
    }
}

fn parse_port(field: &'static str, value: &str) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { field, reason: format!("`{value}` is not a port number") })
}
