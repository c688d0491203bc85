//! main.rs — Camera marker tracker simulator entry point
//!
//! Runs three concurrent loops:
//!   1. Scene loop: advances the marker scene at `rate_hz`, sends each epoch
//!      as a relay datagram over UDP and publishes it into the tracking stream
//!   2. Tracking WebSocket server: the protocol the bridge transport polls
//!   3. Control loop: `message` commands switch fault scenarios at runtime
//!
//! Errors are logged and the simulator keeps running; ctrl-c sends
//! `SERVER_CLOSING` to every connected client.

mod marker_sim;
mod scenarios;
mod stream_server;
mod udp_tx;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use marker_sim::{MarkerScene, SceneConfig};
use marker_types::{MarkerId, DEFAULT_STREAM_NAME};
use scenarios::ScenarioConfig;
use stream_server::{SharedServer, TrackingServer};
use udp_tx::{UdpPublisher, ACK_TIMEOUT};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "marker-sim", about = "Camera marker tracker simulator")]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// Bridge relay address (overrides config)
    #[arg(long)]
    relay_addr: Option<SocketAddr>,
    /// Tracking WebSocket server port (overrides config)
    #[arg(long)]
    ws_port: Option<u16>,
    /// Do not send relay datagrams
    #[arg(long)]
    no_udp: bool,
    /// Do not run the tracking WebSocket server
    #[arg(long)]
    no_ws: bool,
    /// Pre-load a scenario preset on startup
    #[arg(long)]
    scenario: Option<String>,
    /// Detection epochs per second (overrides config)
    #[arg(long)]
    rate_hz: Option<f64>,
}

// ── Config structs ────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FullConfig {
    simulation: SimulationConfig,
    scene: SceneConfig,
    scenario: ScenarioConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SimulationConfig {
    rate_hz: f64,
    relay_addr: SocketAddr,
    ws_port: u16,
    stream_name: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            rate_hz: 20.0,
            relay_addr: SocketAddr::from(([127, 0, 0, 1], marker_types::DEFAULT_RELAY_PORT)),
            ws_port: 8080,
            stream_name: DEFAULT_STREAM_NAME.to_string(),
        }
    }
}

fn load_config(path: &str) -> anyhow::Result<FullConfig> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => {
            info!("No config at {path}, using built-in defaults");
            include_str!("../config.toml").to_string()
        }
    };
    toml::from_str(&raw).with_context(|| format!("parsing {path}"))
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marker_sim=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut cfg = load_config(&args.config)?;
    if let Some(addr) = args.relay_addr {
        cfg.simulation.relay_addr = addr;
    }
    if let Some(port) = args.ws_port {
        cfg.simulation.ws_port = port;
    }
    if let Some(rate) = args.rate_hz {
        cfg.simulation.rate_hz = rate;
    }
    anyhow::ensure!(cfg.simulation.rate_hz > 0.0, "rate_hz must be positive");

    let targets = cfg.scene.target_ids.clone();
    let initial = match args.scenario.as_deref() {
        Some(name) => scenarios::preset(name, &targets)
            .with_context(|| format!("unknown scenario preset '{name}'"))?,
        None => cfg.scenario.clone(),
    };

    info!(
        "📷 Marker simulator starting — anchor {}, {} targets, {} Hz",
        cfg.scene.anchor_id,
        targets.len(),
        cfg.simulation.rate_hz
    );

    let (scenario_tx, scenario_rx) = watch::channel(initial);
    let (server, control) = TrackingServer::new();

    let publisher = if args.no_udp {
        None
    } else {
        let epoch = Duration::from_secs_f64(1.0 / cfg.simulation.rate_hz);
        let publisher = UdpPublisher::new(cfg.simulation.relay_addr)
            .await
            .context("binding UDP socket")?
            .with_ack_timeout(ACK_TIMEOUT.min(epoch / 2));
        info!("📡 Sending relay datagrams to {}", cfg.simulation.relay_addr);
        Some(publisher)
    };

    tokio::spawn(sim_loop(
        MarkerScene::new(&cfg.scene),
        scenario_rx,
        publisher,
        server.clone(),
        cfg.simulation.stream_name.clone(),
        cfg.simulation.rate_hz,
    ));
    tokio::spawn(control_loop(control, scenario_tx, targets));

    if args.no_ws {
        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        info!("Shutting down...");
        return Ok(());
    }

    let addr = format!("0.0.0.0:{}", cfg.simulation.ws_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding tracking server on {addr}"))?;
    info!("🖥  Tracking server at ws://{addr}");

    let closing = server.clone();
    axum::serve(listener, stream_server::router(server))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down...");
            closing.close_all().await;
        })
        .await
        .context("tracking server")?;
    Ok(())
}

// ── Scene loop ────────────────────────────────────────────────────────────────

async fn sim_loop(
    mut scene: MarkerScene,
    scenario: watch::Receiver<ScenarioConfig>,
    mut publisher: Option<UdpPublisher>,
    server: SharedServer,
    stream_name: String,
    rate_hz: f64,
) {
    let epoch = Duration::from_secs_f64(1.0 / rate_hz);
    let mut ticker = interval(epoch);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut rng = StdRng::from_entropy();
    let started = Instant::now();

    info!("⚓ Scene loop running at {rate_hz} Hz ({}ms epoch)", epoch.as_millis());

    loop {
        ticker.tick().await;

        let sc = scenario.borrow().clone();
        let detections = scene.tick(epoch.as_secs_f32(), &sc, &mut rng);
        let timestamp = started.elapsed().as_secs_f64();

        if let Some(tx) = publisher.as_mut() {
            if detections.is_empty() {
                tx.send_heartbeat(timestamp).await;
            } else {
                tx.send(&marker_sim::to_datagram(timestamp, &detections)).await;
            }
        }

        match serde_json::to_value(marker_sim::to_records(&detections)) {
            Ok(records) => server.publish(&stream_name, records).await,
            Err(e) => warn!("stream: serialize failed: {e}"),
        }

        if scene.epoch % 100 == 0 {
            let relay = match publisher.as_ref() {
                Some(tx) if tx.is_connected() => "acked".to_string(),
                Some(tx) => format!("unacked ({})", tx.attempts()),
                None => "off".to_string(),
            };
            info!(
                "⏱ epoch={} | t={:.1}s | detections={} | relay={} | ws clients={} | scenarios={:?}",
                scene.epoch,
                scene.t_elapsed,
                detections.len(),
                relay,
                server.client_count().await,
                sc.active
            );
        }
    }
}

// ── Scenario control ──────────────────────────────────────────────────────────

/// `message` payloads understood by the simulator:
/// `{"scenario":"<preset>"}` or `{"set_scenario":{..ScenarioConfig..}}`.
async fn control_loop(
    mut control: mpsc::UnboundedReceiver<(String, Value)>,
    scenario: watch::Sender<ScenarioConfig>,
    targets: Vec<MarkerId>,
) {
    while let Some((from, payload)) = control.recv().await {
        if let Some(name) = payload.get("scenario").and_then(Value::as_str) {
            match scenarios::preset(name, &targets) {
                Some(sc) => {
                    scenario.send_replace(sc);
                    info!("🎭 Preset '{name}' loaded by {from}");
                }
                None => warn!("Unknown preset: {name}"),
            }
        } else if let Some(raw) = payload.get("set_scenario") {
            match serde_json::from_value::<ScenarioConfig>(raw.clone()) {
                Ok(sc) => {
                    scenario.send_replace(sc);
                    info!("🎭 Scenario updated by {from}");
                }
                Err(e) => warn!("Bad scenario from {from}: {e}"),
            }
        }
    }
}
