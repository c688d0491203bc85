//! # relay
//!
//! Aggregating relay. Receives per-frame marker batches from the camera
//! tracker via UDP, acknowledges each datagram, buffers samples per marker
//! and commits an averaged pose per marker.
//!
//! ## Architecture
//! `RelayServer::run` is a Tokio task of its own. It:
//!   1. Binds a UDP socket on port 12345 (configurable)
//!   2. Replies a bare `ACK` to every datagram's sender
//!   3. Refreshes link liveness (tracker heartbeats carry no markers)
//!   4. Decodes `{timestamp, markers}` and appends samples to pending buffers
//!   5. Commits the buffers (per datagram, or per pipeline tick)
//!
//! Readers go through `RelayHandle`, which only ever sees committed poses.
//!
//! ## Invariants
//! - A commit averages exactly the samples buffered since the previous commit
//!   for that marker.
//! - A datagram that fails to decode changes no marker state.
//! - Per-datagram errors never stop the receive loop; only bind failure is fatal.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use marker_types::{HeadingPose, MarkerId, RelayDatagram, Vec3, DEFAULT_RELAY_PORT, RELAY_ACK};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::error::{BindError, DecodeError};
use crate::ticker::wait_for_shutdown;

// ── Configuration ─────────────────────────────────────────────────────────────

/// When buffered samples are folded into the committed pose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitPolicy {
    /// Commit right after every datagram.
    #[default]
    PerDatagram,
    /// Accumulate across datagrams; commit on the pipeline tick.
    PerTick,
}

/// How buffered headings are averaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationMean {
    /// Plain mean of the angle values. Wrong across the ±180/0-360 seam.
    #[default]
    Arithmetic,
    /// Mean direction from averaged sine/cosine, in (-180, 180].
    Circular,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub enabled: bool,
    pub bind_addr: String,
    /// UDP port to listen on (default 12345)
    pub udp_port: u16,
    /// Link flips to disconnected after this long without a datagram
    pub liveness_timeout_ms: u64,
    pub commit: CommitPolicy,
    pub rotation_mean: RotationMean,
    /// Drop markers not sampled for this long. `None` keeps them forever.
    pub stale_after_ms: Option<u64>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: "0.0.0.0".to_string(),
            udp_port: DEFAULT_RELAY_PORT,
            liveness_timeout_ms: 2000,
            commit: CommitPolicy::PerDatagram,
            rotation_mean: RotationMean::Arithmetic,
            stale_after_ms: None,
        }
    }
}

impl RelayConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn stale_after(&self) -> Option<Duration> {
        self.stale_after_ms.map(Duration::from_millis)
    }
}

// ── Tracked marker ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TrackedMarker {
    /// Last averaged pose. `None` until the first commit.
    pub committed: Option<HeadingPose>,
    /// Samples received since the previous commit
    pub pending: Vec<HeadingPose>,
    pub last_update: Option<Instant>,
    pub last_seen: Instant,
}

impl TrackedMarker {
    fn new(now: Instant) -> Self {
        Self { committed: None, pending: Vec::new(), last_update: None, last_seen: now }
    }

    fn push(&mut self, sample: HeadingPose, now: Instant) {
        self.pending.push(sample);
        self.last_seen = now;
    }

    /// Fold the pending buffer into the committed pose. Returns false when
    /// there was nothing to commit.
    fn commit(&mut self, mean: RotationMean, now: Instant) -> bool {
        let Some(avg) = average(&self.pending, mean) else {
            return false;
        };
        self.committed = Some(avg);
        self.last_update = Some(now);
        self.pending.clear();
        true
    }
}

/// Mean pose of `samples`, `None` for an empty slice.
pub fn average(samples: &[HeadingPose], mean: RotationMean) -> Option<HeadingPose> {
    if samples.is_empty() {
        return None;
    }
    let n = samples.len() as f32;
    let mut pos = Vec3::ZERO;
    for s in samples {
        pos += s.position;
    }
    let rotation = match mean {
        RotationMean::Arithmetic => samples.iter().map(|s| s.rotation).sum::<f32>() / n,
        RotationMean::Circular => {
            let (sin, cos) = samples.iter().fold((0.0f32, 0.0f32), |(s, c), p| {
                let r = p.rotation.to_radians();
                (s + r.sin(), c + r.cos())
            });
            (sin / n).atan2(cos / n).to_degrees()
        }
    };
    Some(HeadingPose::new(pos / n, rotation))
}

// ── Liveness ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    #[default]
    Disconnected,
    Connected,
}

#[derive(Debug, Clone)]
pub struct Liveness {
    timeout: Duration,
    last_message: Option<Instant>,
    state: LinkState,
    peer: Option<SocketAddr>,
}

impl Liveness {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, last_message: None, state: LinkState::Disconnected, peer: None }
    }

    /// Record a datagram. Flips to connected if we were not.
    pub fn on_datagram(&mut self, now: Instant, src: SocketAddr) {
        self.last_message = Some(now);
        if self.state == LinkState::Disconnected {
            if self.peer.is_none() {
                info!("Tracker connected from {src}");
            } else {
                info!("Tracker reconnected from {src}");
            }
            self.state = LinkState::Connected;
        }
        self.peer = Some(src);
    }

    /// Per-tick timeout check. Returns true when the link just dropped.
    pub fn check(&mut self, now: Instant) -> bool {
        if self.state == LinkState::Connected && self.timed_out(now) {
            warn!("Tracker link lost: no datagram for {:?}", self.timeout);
            self.state = LinkState::Disconnected;
            return true;
        }
        false
    }

    /// State as of `now`, timing out without waiting for the next `check`.
    pub fn state_at(&self, now: Instant) -> LinkState {
        if self.state == LinkState::Connected && self.timed_out(now) {
            LinkState::Disconnected
        } else {
            self.state
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn timed_out(&self, now: Instant) -> bool {
        self.last_message
            .map_or(true, |t| now.saturating_duration_since(t) >= self.timeout)
    }
}

// ── Relay state ───────────────────────────────────────────────────────────────

/// Result of one relay tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayTick {
    pub committed: usize,
    pub link_dropped: bool,
}

pub struct RelayState {
    markers: HashMap<MarkerId, TrackedMarker>,
    liveness: Liveness,
    commit: CommitPolicy,
    rotation_mean: RotationMean,
    datagrams: u64,
    decode_errors: u64,
}

impl RelayState {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            markers: HashMap::new(),
            liveness: Liveness::new(config.liveness_timeout()),
            commit: config.commit,
            rotation_mean: config.rotation_mean,
            datagrams: 0,
            decode_errors: 0,
        }
    }

    /// Liveness, decode, buffer and (per-datagram policy) commit one payload.
    pub fn process(&mut self, payload: &[u8], src: SocketAddr, now: Instant) -> Result<usize, DecodeError> {
        self.datagrams += 1;
        self.liveness.on_datagram(now, src);

        let datagram: RelayDatagram = match serde_json::from_slice(payload) {
            Ok(d) => d,
            Err(e) => {
                self.decode_errors += 1;
                return Err(e.into());
            }
        };
        let n = match self.ingest(&datagram, now) {
            Ok(n) => n,
            Err(e) => {
                self.decode_errors += 1;
                return Err(e);
            }
        };
        if self.commit == CommitPolicy::PerDatagram {
            self.commit_all(now);
        }
        Ok(n)
    }

    /// Append every sample in `datagram` to its marker's pending buffer.
    /// All keys are validated first; a bad key leaves every marker untouched.
    pub fn ingest(&mut self, datagram: &RelayDatagram, now: Instant) -> Result<usize, DecodeError> {
        let Some(markers) = datagram.markers.as_ref() else {
            return Ok(0);
        };

        let mut parsed = Vec::with_capacity(markers.len());
        for (key, sample) in markers {
            let id: MarkerId = key
                .trim()
                .parse()
                .map_err(|_| DecodeError::InvalidMarkerId(key.clone()))?;
            parsed.push((id, HeadingPose::new(sample.position, sample.rotation)));
        }

        for (id, pose) in &parsed {
            self.markers
                .entry(*id)
                .or_insert_with(|| {
                    info!("New marker registered: {id}");
                    TrackedMarker::new(now)
                })
                .push(*pose, now);
        }
        Ok(parsed.len())
    }

    /// Commit every marker with pending samples. Returns how many committed.
    pub fn commit_all(&mut self, now: Instant) -> usize {
        let mean = self.rotation_mean;
        let mut n = 0;
        for (id, marker) in self.markers.iter_mut() {
            if marker.commit(mean, now) {
                if let Some(p) = marker.committed {
                    debug!(
                        "Updated marker {id}: position ({:.3}, {:.3}, {:.3}) rotation {:.3}",
                        p.position.x, p.position.y, p.position.z, p.rotation
                    );
                }
                n += 1;
            }
        }
        n
    }

    /// Once-per-tick work: liveness timeout and per-tick commits.
    pub fn tick(&mut self, now: Instant) -> RelayTick {
        let link_dropped = self.liveness.check(now);
        let committed = if self.commit == CommitPolicy::PerTick { self.commit_all(now) } else { 0 };
        RelayTick { committed, link_dropped }
    }

    pub fn query(&self, id: MarkerId) -> Option<HeadingPose> {
        self.markers.get(&id).and_then(|m| m.committed)
    }

    pub fn query_all(&self) -> HashMap<MarkerId, HeadingPose> {
        self.markers
            .iter()
            .filter_map(|(&id, m)| m.committed.map(|p| (id, p)))
            .collect()
    }

    pub fn pending_len(&self, id: MarkerId) -> usize {
        self.markers.get(&id).map_or(0, |m| m.pending.len())
    }

    pub fn link_state(&self, now: Instant) -> LinkState {
        self.liveness.state_at(now)
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.liveness.peer()
    }

    pub fn evict_stale(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.markers.len();
        self.markers
            .retain(|_, m| now.saturating_duration_since(m.last_seen) < max_age);
        before - self.markers.len()
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.datagrams, self.decode_errors)
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cloneable query surface over the relay state.
#[derive(Clone)]
pub struct RelayHandle {
    shared: Arc<RwLock<RelayState>>,
}

impl RelayHandle {
    pub fn new(config: &RelayConfig) -> Self {
        Self { shared: Arc::new(RwLock::new(RelayState::new(config))) }
    }

    pub async fn process_datagram(&self, payload: &[u8], src: SocketAddr, now: Instant) -> Result<usize, DecodeError> {
        self.shared.write().await.process(payload, src, now)
    }

    pub async fn query(&self, id: MarkerId) -> Option<HeadingPose> {
        self.shared.read().await.query(id)
    }

    pub async fn query_all(&self) -> HashMap<MarkerId, HeadingPose> {
        self.shared.read().await.query_all()
    }

    pub async fn link_state(&self, now: Instant) -> LinkState {
        self.shared.read().await.link_state(now)
    }

    pub async fn tick(&self, now: Instant) -> RelayTick {
        self.shared.write().await.tick(now)
    }

    pub async fn evict_stale(&self, now: Instant, max_age: Duration) -> usize {
        self.shared.write().await.evict_stale(now, max_age)
    }

    pub async fn pending_len(&self, id: MarkerId) -> usize {
        self.shared.read().await.pending_len(id)
    }

    pub async fn stats(&self) -> (u64, u64) {
        self.shared.read().await.stats()
    }
}

// ── UDP server ────────────────────────────────────────────────────────────────

/// Largest UDP payload over IPv4; the receive buffer never truncates.
const MAX_UDP_PAYLOAD: usize = 65_507;

pub struct RelayServer {
    socket: UdpSocket,
    local_addr: SocketAddr,
    handle: RelayHandle,
}

impl RelayServer {
    /// Bind the relay socket. Failure here is fatal for the relay.
    pub async fn bind(config: &RelayConfig) -> Result<Self, BindError> {
        let addr = format!("{}:{}", config.bind_addr, config.udp_port);
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|source| BindError { addr: addr.clone(), source })?;
        let local_addr = socket
            .local_addr()
            .map_err(|source| BindError { addr: addr.clone(), source })?;
        info!("📡 Marker relay listening on UDP {local_addr}");

        Ok(Self {
            socket,
            local_addr,
            handle: RelayHandle::new(config),
        })
    }

    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receive loop. Returns (and drops the socket) once shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((len, src)) => self.on_datagram(&buf[..len], src).await,
                    Err(e) => {
                        // Never stop the loop over one bad receive
                        warn!("Relay: UDP recv error: {e}");
                    }
                },
            }
        }
        let (datagrams, decode_errors) = self.handle.stats().await;
        info!(
            "Marker relay on {} stopped ({datagrams} datagram(s), {decode_errors} dropped)",
            self.local_addr
        );
    }

    async fn on_datagram(&self, data: &[u8], src: SocketAddr) {
        if let Err(e) = self.socket.send_to(RELAY_ACK, src).await {
            debug!("Relay: ACK to {src} failed: {e}");
        }
        match self.handle.process_datagram(data, src, Instant::now()).await {
            Ok(n) => debug!("Relay: {n} marker sample(s) from {src}"),
            Err(e) => warn!("Relay: dropped datagram from {src}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn src() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn sample(id: &str, x: f32, rot: f32) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "timestamp": 1.0,
            "markers": { id: { "position": { "x": x, "y": x, "z": x }, "rotation": rot } }
        }))
        .unwrap()
    }

    fn config(commit: CommitPolicy) -> RelayConfig {
        RelayConfig { commit, ..RelayConfig::default() }
    }

    #[test]
    fn per_tick_commit_averages_buffered_samples() {
        let mut state = RelayState::new(&config(CommitPolicy::PerTick));
        let now = Instant::now();
        state.process(&sample("7", 1.0, 0.0), src(), now).unwrap();
        state.process(&sample("7", 3.0, 0.0), src(), now).unwrap();

        // Nothing committed yet; pending is never visible to readers
        assert_eq!(state.query(7), None);
        assert_eq!(state.pending_len(7), 2);

        let tick = state.tick(now);
        assert_eq!(tick.committed, 1);
        assert_eq!(state.query(7), Some(HeadingPose::new(Vec3::new(2.0, 2.0, 2.0), 0.0)));
        assert_eq!(state.pending_len(7), 0);
    }

    #[test]
    fn commit_uses_only_samples_since_previous_commit() {
        let mut state = RelayState::new(&config(CommitPolicy::PerTick));
        let now = Instant::now();
        state.process(&sample("7", 1.0, 10.0), src(), now).unwrap();
        state.tick(now);
        state.process(&sample("7", 5.0, 20.0), src(), now).unwrap();
        state.process(&sample("7", 7.0, 40.0), src(), now).unwrap();
        state.tick(now);

        let p = state.query(7).unwrap();
        assert_eq!(p.position, Vec3::new(6.0, 6.0, 6.0));
        assert_eq!(p.rotation, 30.0);

        // Empty tick leaves the committed pose alone
        assert_eq!(state.tick(now).committed, 0);
        assert_eq!(state.query(7).unwrap().position.x, 6.0);
    }

    #[test]
    fn per_datagram_commit_is_immediately_visible() {
        let mut state = RelayState::new(&config(CommitPolicy::PerDatagram));
        let now = Instant::now();
        state.process(&sample("3", 4.0, 90.0), src(), now).unwrap();
        assert_eq!(state.query(3).unwrap().rotation, 90.0);
        assert_eq!(state.pending_len(3), 0);
        assert_eq!(state.query_all().len(), 1);
    }

    #[test]
    fn bad_marker_key_mutates_nothing() {
        let mut state = RelayState::new(&config(CommitPolicy::PerDatagram));
        let payload = serde_json::to_vec(&json!({
            "timestamp": 1.0,
            "markers": {
                "1": { "position": { "x": 1, "y": 1, "z": 1 }, "rotation": 0 },
                "left": { "position": { "x": 2, "y": 2, "z": 2 }, "rotation": 0 }
            }
        }))
        .unwrap();
        let err = state.process(&payload, src(), Instant::now()).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidMarkerId(k) if k == "left"));
        assert!(state.query_all().is_empty());
        assert_eq!(state.pending_len(1), 0);
        assert_eq!(state.stats(), (1, 1));
    }

    #[test]
    fn malformed_json_still_counts_as_liveness() {
        let mut state = RelayState::new(&RelayConfig::default());
        let now = Instant::now();
        assert!(state.process(b"{not json", src(), now).is_err());
        assert_eq!(state.link_state(now), LinkState::Connected);
        assert!(state.query_all().is_empty());
    }

    #[test]
    fn heartbeat_refreshes_link_without_markers() {
        let mut state = RelayState::new(&RelayConfig::default());
        let now = Instant::now();
        let hb = serde_json::to_vec(&RelayDatagram::heartbeat(3.0)).unwrap();
        assert_eq!(state.process(&hb, src(), now).unwrap(), 0);
        assert_eq!(state.link_state(now), LinkState::Connected);
        assert_eq!(state.peer(), Some(src()));
    }

    #[test]
    fn liveness_times_out_and_recovers_on_next_datagram() {
        let mut live = Liveness::new(Duration::from_secs(2));
        let t0 = Instant::now();
        assert_eq!(live.state_at(t0), LinkState::Disconnected);

        live.on_datagram(t0, src());
        assert_eq!(live.state_at(t0 + Duration::from_millis(1999)), LinkState::Connected);
        assert_eq!(live.state_at(t0 + Duration::from_secs(2)), LinkState::Disconnected);
        assert_eq!(live.state_at(t0 + Duration::from_secs(30)), LinkState::Disconnected);

        assert!(live.check(t0 + Duration::from_secs(3)));
        assert!(!live.check(t0 + Duration::from_secs(4)));

        let t1 = t0 + Duration::from_secs(5);
        live.on_datagram(t1, src());
        assert_eq!(live.state_at(t1), LinkState::Connected);
    }

    #[test]
    fn circular_mean_handles_the_wrap_seam() {
        let samples = [
            HeadingPose::new(Vec3::ZERO, 350.0),
            HeadingPose::new(Vec3::ZERO, 10.0),
        ];
        let arith = average(&samples, RotationMean::Arithmetic).unwrap();
        assert_eq!(arith.rotation, 180.0);
        let circ = average(&samples, RotationMean::Circular).unwrap();
        assert!(circ.rotation.abs() < 1e-3, "{}", circ.rotation);
    }

    #[test]
    fn evicts_markers_not_seen_recently() {
        let mut state = RelayState::new(&RelayConfig::default());
        let t0 = Instant::now();
        state.process(&sample("1", 1.0, 0.0), src(), t0).unwrap();
        state.process(&sample("2", 1.0, 0.0), src(), t0 + Duration::from_secs(9)).unwrap();
        assert_eq!(state.evict_stale(t0 + Duration::from_secs(10), Duration::from_secs(5)), 1);
        assert!(state.query(1).is_none());
        assert!(state.query(2).is_some());
    }
}
