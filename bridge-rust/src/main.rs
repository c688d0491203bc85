use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use marker_bridge::aligner::{OffsetTuner, ReferenceTuner};
use marker_bridge::http::{self, AppState};
use marker_bridge::pipeline::TrackingPipeline;
use marker_bridge::relay::RelayServer;
use marker_bridge::store::MarkerPositionStore;
use marker_bridge::ticker::Shutdown;
use marker_bridge::transport::TransportClient;
use marker_bridge::BridgeConfig;

// ─── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "marker-bridge", about = "Marker pose streaming and alignment bridge")]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "bridge.toml")]
    config: String,
    /// Do not start the UDP relay
    #[arg(long)]
    no_relay: bool,
    /// Do not connect to the tracking WebSocket server
    #[arg(long)]
    no_transport: bool,
    /// Status API port (overrides config and MARKER_HTTP_PORT)
    #[arg(long)]
    http_port: Option<u16>,
}

// ─── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marker_bridge=info".into()),
        )
        .init();

    let args = Args::parse();
    info!("🎯 Marker bridge starting...");

    let mut config = BridgeConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config))?;
    config.apply_env().context("applying MARKER_* environment overrides")?;
    if args.no_relay {
        config.relay.enabled = false;
    }
    if args.no_transport {
        config.transport.enabled = false;
    }
    if let Some(port) = args.http_port {
        config.http.port = port;
    }

    let shutdown = Shutdown::new();
    let store = MarkerPositionStore::new();
    let offsets = OffsetTuner::new(config.aligner.offsets);
    let reference = ReferenceTuner::new(config.aligner.reference);

    let mut pipeline = TrackingPipeline::new(
        config.pipeline.clone(),
        store.clone(),
        &config.calibration,
        &config.aligner,
        &offsets,
    )
    .with_store_staleness(config.store.stale_after())
    .with_reference(&reference);

    let mut tasks = Vec::new();

    // Relay: bind failure is fatal
    if config.relay.enabled {
        let server = RelayServer::bind(&config.relay)
            .await
            .context("starting marker relay")?;
        pipeline = pipeline.with_relay(server.handle(), config.relay.stale_after());
        tasks.push(tokio::spawn(server.run(shutdown.subscribe())));
    }

    let mut log = None;
    if config.transport.enabled {
        let (client, inbound) = TransportClient::new(config.transport.clone());
        let client = Arc::new(client);
        log = Some(client.log());
        pipeline = pipeline.with_transport(client.clone(), inbound);
        tasks.push(tokio::spawn(client.maintain(shutdown.subscribe())));
    }

    if !config.relay.enabled && !config.transport.enabled {
        warn!("Both ingestion paths are disabled; nothing will be tracked");
    }

    if config.http.enabled {
        let state = AppState {
            view: pipeline.subscribe(),
            log,
            offsets: offsets.clone(),
            reference: reference.clone(),
        };
        let http_config = config.http.clone();
        let rx = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = http::serve(&http_config, state, rx).await {
                error!("Status API stopped: {e}");
            }
        }));
    }

    tasks.push(tokio::spawn(pipeline.run(shutdown.subscribe())));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutting down...");
    shutdown.trigger();
    for task in tasks {
        let _ = task.await;
    }
    info!("Marker bridge stopped");
    Ok(())
}
