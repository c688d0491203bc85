//! marker_sim.rs — Simulated camera marker scene
//!
//! One fixed anchor marker plus N target markers orbiting it in the camera's
//! X/Z plane. Each epoch produces the noisy detections a camera tracker
//! would report:
//! - Position in camera space (meters, X right, Y down, Z forward)
//! - Heading in degrees, `[0, 360)`
//! - Gaussian noise on both, rounded to millimetres like the real tracker
//!
//! Pure math and RNG, no I/O; the transmit paths live in `udp_tx` and
//! `stream_server`.

use std::collections::BTreeMap;

use marker_types::{HeadingPose, MarkerId, MarkerRecord, RelayDatagram, RelayMarkerSample, Vec3};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::scenarios::{ScenarioConfig, ScenarioType};

// ── Config struct (populated from config.toml) ────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub anchor_id: MarkerId,
    /// Anchor position in camera space
    pub anchor_position: [f32; 3],
    pub anchor_heading_deg: f32,
    pub target_ids: Vec<MarkerId>,
    pub orbit_radius_m: f32,
    pub orbit_period_s: f32,
    pub position_noise_m: f32,
    pub heading_noise_deg: f32,
    /// Probability that a visible marker is actually detected in one epoch
    pub detection_rate: f64,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            anchor_id: 0,
            anchor_position: [0.0, 0.1, 1.2],
            anchor_heading_deg: 0.0,
            target_ids: vec![1, 2, 3, 4, 5],
            orbit_radius_m: 0.3,
            orbit_period_s: 20.0,
            position_noise_m: 0.002,
            heading_noise_deg: 0.5,
            detection_rate: 0.98,
        }
    }
}

// ── Scene state ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub id: MarkerId,
    pub pose: HeadingPose,
}

#[derive(Debug, Clone)]
struct Target {
    id: MarkerId,
    /// Phase offset so targets spread evenly around the anchor (radians)
    phase: f32,
}

pub struct MarkerScene {
    cfg: SceneConfig,
    targets: Vec<Target>,
    pub t_elapsed: f32,
    pub epoch: u32,
}

impl MarkerScene {
    pub fn new(cfg: &SceneConfig) -> Self {
        let n = cfg.target_ids.len().max(1) as f32;
        let targets = cfg
            .target_ids
            .iter()
            .enumerate()
            .filter(|(_, &id)| id != cfg.anchor_id)
            .map(|(i, &id)| Target { id, phase: i as f32 / n * std::f32::consts::TAU })
            .collect();
        Self { cfg: cfg.clone(), targets, t_elapsed: 0.0, epoch: 0 }
    }

    pub fn anchor_truth(&self) -> HeadingPose {
        let [x, y, z] = self.cfg.anchor_position;
        HeadingPose::new(Vec3::new(x, y, z), self.cfg.anchor_heading_deg)
    }

    /// Noise-free pose of a target at the current time.
    pub fn target_truth(&self, phase: f32) -> HeadingPose {
        let omega = std::f32::consts::TAU / self.cfg.orbit_period_s.max(0.1);
        let theta = phase + omega * self.t_elapsed;
        let anchor = self.anchor_truth();
        let r = self.cfg.orbit_radius_m;
        let position = anchor.position + Vec3::new(r * theta.cos(), 0.0, r * theta.sin());
        // Marker faces along its orbit tangent
        let heading = (theta.to_degrees() + 90.0).rem_euclid(360.0);
        HeadingPose::new(position, heading)
    }

    pub fn ground_truth(&self) -> Vec<Detection> {
        let mut out = vec![Detection { id: self.cfg.anchor_id, pose: self.anchor_truth() }];
        out.extend(self.targets.iter().map(|t| Detection { id: t.id, pose: self.target_truth(t.phase) }));
        out
    }

    /// Advance by `dt` seconds and return this epoch's detections.
    pub fn tick<R: Rng>(&mut self, dt: f32, scenario: &ScenarioConfig, rng: &mut R) -> Vec<Detection> {
        self.t_elapsed += dt;
        self.epoch += 1;

        let noise_k = scenario.noise_multiplier() as f32;
        let pos_sigma = self.cfg.position_noise_m * noise_k;
        let rot_sigma = self.cfg.heading_noise_deg * noise_k;

        let mut detections = Vec::with_capacity(self.targets.len() + 1);
        for truth in self.ground_truth() {
            if truth.id == self.cfg.anchor_id && scenario.anchor_hidden(self.epoch) {
                continue;
            }
            if scenario.is_dropped(truth.id, self.epoch) || !rng.gen_bool(self.cfg.detection_rate.clamp(0.0, 1.0)) {
                continue;
            }
            let mut pose = truth.pose;
            pose.position += Vec3::new(
                noise(pos_sigma, rng),
                noise(pos_sigma, rng),
                noise(pos_sigma, rng),
            );
            pose.rotation += noise(rot_sigma, rng);
            if scenario.has(ScenarioType::HeadingWrap) {
                // Alternate either side of north
                pose.rotation = if self.epoch % 2 == 0 { 359.0 } else { 1.0 };
            }
            pose.rotation = pose.rotation.rem_euclid(360.0);
            detections.push(Detection { id: truth.id, pose: round_pose(pose) });
        }

        if scenario.has(ScenarioType::SpuriousIds) {
            for &id in &scenario.spurious_ids {
                if rng.gen_bool(scenario.spurious_rate.clamp(0.0, 1.0)) {
                    let p = Vec3::new(rng.gen_range(-0.5..0.5), rng.gen_range(-0.3..0.3), rng.gen_range(0.5..2.0));
                    detections.push(Detection { id, pose: round_pose(HeadingPose::new(p, rng.gen_range(0.0..360.0))) });
                }
            }
        }
        detections
    }
}

/// Zero-mean Gaussian sample; a non-positive sigma means no noise.
fn noise<R: Rng>(sigma: f32, rng: &mut R) -> f32 {
    match Normal::new(0.0, sigma) {
        Ok(n) if sigma > 0.0 => n.sample(rng),
        _ => 0.0,
    }
}

fn round3(v: f32) -> f32 {
    (v * 1000.0).round() / 1000.0
}

fn round_pose(p: HeadingPose) -> HeadingPose {
    HeadingPose::new(
        Vec3::new(round3(p.position.x), round3(p.position.y), round3(p.position.z)),
        round3(p.rotation),
    )
}

// ── Wire conversion ───────────────────────────────────────────────────────────

/// Relay datagram for one epoch; no detections means a heartbeat.
pub fn to_datagram(timestamp: f64, detections: &[Detection]) -> RelayDatagram {
    if detections.is_empty() {
        return RelayDatagram::heartbeat(timestamp);
    }
    let markers: BTreeMap<String, RelayMarkerSample> = detections
        .iter()
        .map(|d| (d.id.to_string(), RelayMarkerSample { position: d.pose.position, rotation: d.pose.rotation }))
        .collect();
    RelayDatagram { timestamp, markers: Some(markers) }
}

/// Position records for the WebSocket stream (heading is not carried).
pub fn to_records(detections: &[Detection]) -> Vec<MarkerRecord> {
    detections
        .iter()
        .map(|d| MarkerRecord { marker_id: d.id, position: d.pose.position })
        .collect()
}
