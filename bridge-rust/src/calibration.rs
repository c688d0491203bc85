//! Tick-based relative-pose calculator: poses of target markers expressed
//! against one anchor marker.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use marker_types::{HeadingPose, MarkerId, Vec3};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ── Configuration ─────────────────────────────────────────────────────────────

/// Treatment of the rotation difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AngleWrap {
    /// `target - anchor` as is, e.g. 350 - 10 = 340.
    #[default]
    Raw,
    /// Normalized into [-180, 180).
    Signed180,
}

impl AngleWrap {
    pub fn apply(self, delta_deg: f32) -> f32 {
        match self {
            AngleWrap::Raw => delta_deg,
            AngleWrap::Signed180 => (delta_deg + 180.0).rem_euclid(360.0) - 180.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub anchor_marker_id: MarkerId,
    pub target_marker_ids: Vec<MarkerId>,
    /// Minimum time between recomputations
    pub update_interval_ms: u64,
    pub angle_wrap: AngleWrap,
    /// How often the pipeline logs the calibration dump
    pub report_interval_ms: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            anchor_marker_id: 0,
            target_marker_ids: vec![1, 2, 3, 4, 5],
            update_interval_ms: 1000,
            angle_wrap: AngleWrap::Raw,
            report_interval_ms: 1000,
        }
    }
}

impl CalibrationConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

// ── Relative pose ─────────────────────────────────────────────────────────────

/// A pose that can be expressed relative to an anchor pose of the same kind.
pub trait RelativePose: Copy + std::fmt::Debug {
    fn relative_to(&self, anchor: &Self, wrap: AngleWrap) -> Self;
    fn describe(&self) -> String;
}

impl RelativePose for Vec3 {
    fn relative_to(&self, anchor: &Self, _wrap: AngleWrap) -> Self {
        *self - *anchor
    }

    fn describe(&self) -> String {
        format!("Relative Position: ({:.3}, {:.3}, {:.3})", self.x, self.y, self.z)
    }
}

impl RelativePose for HeadingPose {
    fn relative_to(&self, anchor: &Self, wrap: AngleWrap) -> Self {
        HeadingPose::new(
            self.position - anchor.position,
            wrap.apply(self.rotation - anchor.rotation),
        )
    }

    fn describe(&self) -> String {
        let p = self.position;
        format!(
            "Relative Position: ({:.3}, {:.3}, {:.3})\n  Relative Rotation: {:.3}°",
            p.x, p.y, p.z, self.rotation
        )
    }
}

// ── Calculator ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalibrationTick {
    /// Interval has not elapsed yet
    NotDue,
    /// Anchor absent; previous results kept
    AnchorMissing,
    Updated { resolved: usize, missing: Vec<MarkerId> },
}

pub struct CalibrationCalculator<P> {
    anchor: MarkerId,
    targets: Vec<MarkerId>,
    interval: Duration,
    wrap: AngleWrap,
    relative: HashMap<MarkerId, P>,
    last_update: Option<Instant>,
    anchor_seen: bool,
}

impl<P: RelativePose> CalibrationCalculator<P> {
    pub fn new(config: &CalibrationConfig) -> Self {
        let anchor = config.anchor_marker_id;
        let mut targets: Vec<MarkerId> = Vec::with_capacity(config.target_marker_ids.len());
        for &id in &config.target_marker_ids {
            if id != anchor && !targets.contains(&id) {
                targets.push(id);
            }
        }
        Self {
            anchor,
            targets,
            interval: config.update_interval(),
            wrap: config.angle_wrap,
            relative: HashMap::new(),
            last_update: None,
            anchor_seen: false,
        }
    }

    pub fn anchor(&self) -> MarkerId {
        self.anchor
    }

    pub fn targets(&self) -> &[MarkerId] {
        &self.targets
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.last_update
            .map_or(true, |t| now.saturating_duration_since(t) >= self.interval)
    }

    /// Recompute from `poses` (a snapshot of the ingestion store) if due.
    /// The interval clock restarts on every due check, found anchor or not.
    pub fn update(&mut self, now: Instant, poses: &HashMap<MarkerId, P>) -> CalibrationTick {
        if !self.is_due(now) {
            return CalibrationTick::NotDue;
        }
        self.last_update = Some(now);

        let Some(anchor) = poses.get(&self.anchor) else {
            if self.anchor_seen {
                warn!("Anchor marker {} not detected!", self.anchor);
            } else {
                debug!("Anchor marker {} not detected yet", self.anchor);
            }
            return CalibrationTick::AnchorMissing;
        };
        self.anchor_seen = true;

        self.relative.clear();
        let mut missing = Vec::new();
        for &id in &self.targets {
            match poses.get(&id) {
                Some(target) => {
                    self.relative.insert(id, target.relative_to(anchor, self.wrap));
                }
                None => missing.push(id),
            }
        }
        debug!(
            "Calibration: anchor {} → {} target(s) resolved, {} missing",
            self.anchor,
            self.relative.len(),
            missing.len()
        );
        CalibrationTick::Updated { resolved: self.relative.len(), missing }
    }

    pub fn query_relative(&self, id: MarkerId) -> Option<P> {
        self.relative.get(&id).copied()
    }

    pub fn query_all_relative(&self) -> HashMap<MarkerId, P> {
        self.relative.clone()
    }

    /// Human-readable dump of the current relative poses.
    pub fn report(&self) -> String {
        let mut sb = String::new();
        let _ = writeln!(sb, "=== Calibration Data at {} ===", chrono::Local::now().format("%H:%M:%S"));
        let _ = writeln!(sb, "Anchor ID: {}", self.anchor);
        if self.relative.is_empty() {
            let _ = writeln!(sb, "No markers currently tracked");
        } else {
            let mut ids: Vec<_> = self.relative.keys().copied().collect();
            ids.sort_unstable();
            for id in ids {
                let _ = writeln!(sb, "Marker {id}:\n  {}", self.relative[&id].describe());
            }
        }
        sb.push_str("=====================================");
        sb
    }
}
