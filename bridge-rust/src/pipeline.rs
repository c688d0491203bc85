//! Tick pipeline.
//!
//! One serialized loop owns everything that is not network I/O: it drains
//! the transport queue into the store, ticks the relay, runs both
//! calibration calculators, realigns, and publishes a [`PipelineView`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use marker_types::{HeadingPose, MarkerId, OrientedPose, Vec3};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::aligner::{AlignerConfig, CoordinateAligner, OffsetTuner, ReferenceTuner};
use crate::calibration::{CalibrationCalculator, CalibrationConfig, CalibrationTick};
use crate::decoder::MarkerStreamDecoder;
use crate::relay::{LinkState, RelayHandle};
use crate::rolling_log::RollingLog;
use crate::store::MarkerPositionStore;
use crate::ticker::RepeatingTimer;
use crate::transport::{dispatch, ConnectionState, Inbound, TransportClient, TransportEvent};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub tick_interval_ms: u64,
    /// Upper bound of transport frames handled per tick
    pub max_frames_per_tick: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { tick_interval_ms: 20, max_frames_per_tick: 256 }
    }
}

impl PipelineConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Aligned outputs of both ingestion paths.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlignedView {
    pub stream: HashMap<MarkerId, OrientedPose>,
    pub relay: HashMap<MarkerId, OrientedPose>,
}

/// Everything a pose consumer reads, published once per tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineView {
    pub tick: u64,
    pub transport: ConnectionState,
    pub relay_link: LinkState,
    pub markers: HashMap<MarkerId, Vec3>,
    pub relay: HashMap<MarkerId, HeadingPose>,
    pub stream_relative: HashMap<MarkerId, Vec3>,
    pub relay_relative: HashMap<MarkerId, HeadingPose>,
    pub aligned: AlignedView,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub frames: usize,
    pub decode_errors: usize,
    pub realigned: bool,
}

struct TransportLink {
    client: Arc<TransportClient>,
    inbound: mpsc::Receiver<TransportEvent>,
}

pub struct TrackingPipeline {
    config: PipelineConfig,
    store: MarkerPositionStore,
    store_stale_after: Option<Duration>,
    decoder: MarkerStreamDecoder,
    transport: Option<TransportLink>,
    relay: Option<RelayHandle>,
    relay_stale_after: Option<Duration>,
    stream_calc: CalibrationCalculator<Vec3>,
    relay_calc: CalibrationCalculator<HeadingPose>,
    aligner: CoordinateAligner,
    report_interval: Duration,
    last_report: Option<Instant>,
    view: watch::Sender<PipelineView>,
    ticks: u64,
}

impl TrackingPipeline {
    pub fn new(
        config: PipelineConfig,
        store: MarkerPositionStore,
        calibration: &CalibrationConfig,
        aligner: &AlignerConfig,
        offsets: &OffsetTuner,
    ) -> Self {
        let (view, _) = watch::channel(PipelineView::default());
        Self {
            config,
            store,
            store_stale_after: None,
            decoder: MarkerStreamDecoder::new(None),
            transport: None,
            relay: None,
            relay_stale_after: None,
            stream_calc: CalibrationCalculator::new(calibration),
            relay_calc: CalibrationCalculator::new(calibration),
            aligner: CoordinateAligner::new(aligner, offsets),
            report_interval: calibration.report_interval(),
            last_report: None,
            view,
            ticks: 0,
        }
    }

    pub fn with_transport(
        mut self,
        client: Arc<TransportClient>,
        inbound: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        self.decoder = MarkerStreamDecoder::new(client.config().allowed_marker_ids.as_deref());
        self.transport = Some(TransportLink { client, inbound });
        self
    }

    pub fn with_relay(mut self, relay: RelayHandle, stale_after: Option<Duration>) -> Self {
        self.relay = Some(relay);
        self.relay_stale_after = stale_after;
        self
    }

    pub fn with_store_staleness(mut self, stale_after: Option<Duration>) -> Self {
        self.store_stale_after = stale_after;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineView> {
        self.view.subscribe()
    }

    /// Realign whenever `reference` moves the camera frame.
    pub fn with_reference(mut self, reference: &ReferenceTuner) -> Self {
        self.aligner.follow_reference(reference);
        self
    }

    pub async fn tick(&mut self, now: Instant) -> TickSummary {
        self.ticks += 1;
        let mut summary = TickSummary::default();

        // 1. transport queue → store
        self.drain_transport(&mut summary).await;

        // 2. relay liveness / per-tick commit
        if let Some(relay) = &self.relay {
            let t = relay.tick(now).await;
            if t.committed > 0 {
                debug!("Relay tick committed {} marker(s)", t.committed);
            }
        }

        // 3. optional staleness
        if let Some(max_age) = self.store_stale_after {
            let n = self.store.evict_stale(now, max_age).await;
            if n > 0 {
                debug!("Evicted {n} stale stream marker(s)");
            }
        }
        if let (Some(relay), Some(max_age)) = (&self.relay, self.relay_stale_after) {
            let n = relay.evict_stale(now, max_age).await;
            if n > 0 {
                debug!("Evicted {n} stale relay marker(s)");
            }
        }

        // 4. calibration on fresh snapshots
        let markers = self.store.snapshot().await;
        let (relay_poses, relay_link) = match &self.relay {
            Some(relay) => (relay.query_all().await, relay.link_state(now).await),
            None => (HashMap::new(), LinkState::Disconnected),
        };
        let mut recalibrated = false;
        if self.stream_calc.is_due(now) {
            recalibrated |= matches!(self.stream_calc.update(now, &markers), CalibrationTick::Updated { .. });
        }
        if self.relay.is_some() && self.relay_calc.is_due(now) {
            recalibrated |= matches!(self.relay_calc.update(now, &relay_poses), CalibrationTick::Updated { .. });
        }

        // 5. realign on any input change
        let aligner_changed = self.aligner.refresh();
        summary.realigned = recalibrated || aligner_changed || self.ticks == 1;
        let aligned = if summary.realigned {
            AlignedView {
                stream: self.aligner.align_all(&self.stream_calc.query_all_relative()),
                relay: self.aligner.align_all(&self.relay_calc.query_all_relative()),
            }
        } else {
            self.view.borrow().aligned.clone()
        };

        // 6. publish
        let transport = self
            .transport
            .as_ref()
            .map_or(ConnectionState::Disconnected, |t| t.client.state());
        self.view.send_replace(PipelineView {
            tick: self.ticks,
            transport,
            relay_link,
            markers,
            relay: relay_poses,
            stream_relative: self.stream_calc.query_all_relative(),
            relay_relative: self.relay_calc.query_all_relative(),
            aligned,
        });

        // 7. periodic dump
        if self
            .last_report
            .map_or(true, |t| now.saturating_duration_since(t) >= self.report_interval)
        {
            self.last_report = Some(now);
            if self.relay.is_some() {
                info!("\n{}", self.relay_calc.report());
            }
            if self.transport.is_some() {
                info!("\n{}", self.stream_calc.report());
            }
        }

        summary
    }

    async fn drain_transport(&mut self, summary: &mut TickSummary) {
        let Some(link) = self.transport.as_mut() else {
            return;
        };
        let log = link.client.log();
        while summary.frames < self.config.max_frames_per_tick {
            let event = match link.inbound.try_recv() {
                Ok(event) => event,
                Err(_) => break,
            };
            match event {
                TransportEvent::Frame(text) => {
                    summary.frames += 1;
                    if !handle_frame(&text, &link.client, &log, &self.decoder, &self.store).await {
                        summary.decode_errors += 1;
                    }
                }
                TransportEvent::Error(e) => warn!("Transport error: {e}"),
                TransportEvent::Closed => log.push("Server connection closed").await,
            }
        }
    }

    /// Tick until shutdown.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) {
        let mut timer = RepeatingTimer::new(self.config.tick_interval(), shutdown);
        info!("Tracking pipeline ticking every {:?}", self.config.tick_interval());
        while timer.tick().await {
            self.tick(Instant::now()).await;
        }
        info!("Tracking pipeline stopped after {} tick(s)", self.ticks);
    }
}

/// Returns false when the frame was a `stream_data` that failed to decode.
async fn handle_frame(
    text: &str,
    client: &TransportClient,
    log: &RollingLog,
    decoder: &MarkerStreamDecoder,
    store: &MarkerPositionStore,
) -> bool {
    match dispatch(text) {
        Inbound::StreamData(msg) => {
            let stream = msg.get("stream_name").and_then(|v| v.as_str());
            if stream.is_some_and(|s| s != client.config().stream_name) {
                debug!("Ignoring data for stream {stream:?}");
                return true;
            }
            match decoder.decode_into(&msg, store).await {
                Ok(s) => {
                    log.push(format!("Received {} marker(s), {} filtered", s.accepted, s.filtered)).await;
                    true
                }
                Err(e) => {
                    warn!("Stream decode error: {e}");
                    log.push(format!("Decode error: {e}")).await;
                    false
                }
            }
        }
        Inbound::Broadcast(data) => {
            log.push(format!("Broadcast: {data}")).await;
            true
        }
        Inbound::Message(data) => {
            log.push(format!("Message: {data}")).await;
            true
        }
        Inbound::RequestId => {
            log.push("Server requested client id").await;
            if let Err(e) = client.identify().await {
                warn!("Could not answer REQUEST_ID: {e}");
            }
            true
        }
        Inbound::ServerClosing => {
            log.push("Server is closing").await;
            true
        }
        Inbound::Unknown(cmd) => {
            log.push(format!("Unknown command: {cmd}")).await;
            true
        }
        Inbound::Unrecognized => {
            log.push("Received unrecognized message format.").await;
            true
        }
        Inbound::Malformed(e) => {
            warn!("Failed to parse message as JSON: {e}");
            log.push("Failed to parse message as JSON.").await;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aligner::{Axis, ReferenceFrame};
    use marker_types::Quat;
    use crate::relay::RelayConfig;
    use crate::transport::TransportConfig;
    use serde_json::json;

    fn calibration() -> CalibrationConfig {
        CalibrationConfig {
            anchor_marker_id: 0,
            target_marker_ids: vec![1, 2],
            update_interval_ms: 0,
            ..CalibrationConfig::default()
        }
    }

    fn relay_datagram(markers: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&json!({ "timestamp": 0.0, "markers": markers })).unwrap()
    }

    #[tokio::test]
    async fn relay_path_flows_into_relative_and_aligned_views() {
        let tuner = OffsetTuner::new(Vec3::ZERO);
        let relay = RelayHandle::new(&RelayConfig::default());
        let mut pipeline = TrackingPipeline::new(
            PipelineConfig::default(),
            MarkerPositionStore::new(),
            &calibration(),
            &AlignerConfig::default(),
            &tuner,
        )
        .with_relay(relay.clone(), None);
        let view = pipeline.subscribe();

        let src = "127.0.0.1:5000".parse().unwrap();
        let now = Instant::now();
        relay
            .process_datagram(
                &relay_datagram(json!({
                    "0": {"position": {"x": 1.0, "y": 0.0, "z": 0.0}, "rotation": 10.0},
                    "1": {"position": {"x": 3.0, "y": 0.0, "z": 1.0}, "rotation": 40.0}
                })),
                src,
                now,
            )
            .await
            .unwrap();

        let summary = pipeline.tick(now).await;
        assert!(summary.realigned);

        let v = view.borrow().clone();
        assert_eq!(v.relay_link, LinkState::Connected);
        assert_eq!(v.relay_relative[&1], HeadingPose::new(Vec3::new(2.0, 0.0, 1.0), 30.0));
        assert!(v.aligned.relay[&1].position.approx_eq(&Vec3::new(2.0, 0.0, 1.0), 1e-5));

        // Offset change alone triggers realignment
        tuner.set_axis(Axis::X, 1.0);
        pipeline.tick(now).await;
        let v = view.borrow().clone();
        assert!(v.aligned.relay[&1].position.approx_eq(&Vec3::new(3.0, 0.0, 1.0), 1e-5));
    }

    #[tokio::test]
    async fn moving_the_reference_frame_realigns() {
        let tuner = OffsetTuner::new(Vec3::ZERO);
        let reference = ReferenceTuner::new(ReferenceFrame::default());
        let relay = RelayHandle::new(&RelayConfig::default());
        let mut pipeline = TrackingPipeline::new(
            PipelineConfig::default(),
            MarkerPositionStore::new(),
            &CalibrationConfig { update_interval_ms: 60_000, ..calibration() },
            &AlignerConfig::default(),
            &tuner,
        )
        .with_relay(relay.clone(), None)
        .with_reference(&reference);
        let view = pipeline.subscribe();

        let now = Instant::now();
        relay
            .process_datagram(
                &relay_datagram(json!({
                    "0": {"position": {"x": 0.0, "y": 0.0, "z": 0.0}, "rotation": 0.0},
                    "1": {"position": {"x": 1.0, "y": 0.0, "z": 0.0}, "rotation": 0.0}
                })),
                "127.0.0.1:5000".parse().unwrap(),
                now,
            )
            .await
            .unwrap();
        pipeline.tick(now).await;
        assert!(!pipeline.tick(now).await.realigned);

        reference.set(ReferenceFrame { position: Vec3::new(0.0, 1.5, 0.0), orientation: Quat::IDENTITY });
        assert!(pipeline.tick(now).await.realigned);
        let v = view.borrow().clone();
        assert!(v.aligned.relay[&1].position.approx_eq(&Vec3::new(1.0, 1.5, 0.0), 1e-5));
    }

    #[tokio::test]
    async fn stream_frames_are_decoded_on_tick() {
        let tuner = OffsetTuner::new(Vec3::ZERO);
        let store = MarkerPositionStore::new();
        let config = TransportConfig { allowed_marker_ids: Some(vec![0, 1]), ..TransportConfig::default() };
        let stream_name = config.stream_name.clone();
        let (client, _rx) = TransportClient::new(config);
        let (tx, rx) = mpsc::channel(8);

        let mut pipeline = TrackingPipeline::new(
            PipelineConfig::default(),
            store.clone(),
            &calibration(),
            &AlignerConfig::default(),
            &tuner,
        )
        .with_transport(Arc::new(client), rx);

        let frame = json!({
            "command": "stream_data",
            "stream_name": stream_name,
            "data": [
                {"marker_id": 0, "x": 1.0, "y": 1.0, "z": 1.0},
                {"marker_id": 1, "x": 2.0, "y": 1.0, "z": 1.0},
                {"marker_id": 9, "x": 0.0, "y": 0.0, "z": 0.0}
            ]
        });
        tx.send(TransportEvent::Frame(frame.to_string())).await.unwrap();
        tx.send(TransportEvent::Frame("{garbage".into())).await.unwrap();
        tx.send(TransportEvent::Frame(r#"{"command":"stream_data"}"#.into())).await.unwrap();

        let summary = pipeline.tick(Instant::now()).await;
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.decode_errors, 1);
        assert_eq!(store.len().await, 2);

        let v = pipeline.subscribe().borrow().clone();
        assert_eq!(v.stream_relative[&1], Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(v.transport, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn other_streams_are_ignored() {
        let tuner = OffsetTuner::new(Vec3::ZERO);
        let store = MarkerPositionStore::new();
        let (client, _rx) = TransportClient::new(TransportConfig::default());
        let (tx, rx) = mpsc::channel(8);
        let mut pipeline = TrackingPipeline::new(
            PipelineConfig::default(),
            store.clone(),
            &calibration(),
            &AlignerConfig::default(),
            &tuner,
        )
        .with_transport(Arc::new(client), rx);

        let frame = json!({
            "command": "stream_data",
            "stream_name": "someone_elses_stream",
            "data": [{"marker_id": 1, "x": 2.0, "y": 1.0, "z": 1.0}]
        });
        tx.send(TransportEvent::Frame(frame.to_string())).await.unwrap();
        pipeline.tick(Instant::now()).await;
        assert!(store.is_empty().await);
    }
}
