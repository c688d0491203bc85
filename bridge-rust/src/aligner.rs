//! Coordinate aligner: tracker-space marker poses → consumer reference space.
//!
//! `aligned = frame.position + frame.orientation ⊗ axes(raw.position) + offsets`
//! `orientation = frame.orientation * raw.orientation`
//!
//! The axis convention varies between deployments (camera mounting, tracker
//! handedness), so it is configuration rather than code.

use std::collections::HashMap;

use marker_types::{MarkerId, OrientedPose, Quat, Vec3};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

// ── Axis convention ───────────────────────────────────────────────────────────

/// Per-axis sign flip applied to the raw tracker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AxisConvention {
    #[serde(default)]
    pub flip_x: bool,
    #[serde(default)]
    pub flip_y: bool,
    #[serde(default)]
    pub flip_z: bool,
}

impl AxisConvention {
    pub const fn new(flip_x: bool, flip_y: bool, flip_z: bool) -> Self {
        Self { flip_x, flip_y, flip_z }
    }

    pub fn apply(&self, v: Vec3) -> Vec3 {
        let s = |flip: bool, c: f32| if flip { -c } else { c };
        Vec3::new(s(self.flip_x, v.x), s(self.flip_y, v.y), s(self.flip_z, v.z))
    }
}

/// Named conventions seen across tracker/camera setups, plus a free form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisPreset {
    #[default]
    Identity,
    /// Image-down Y to world-up Y
    InvertY,
    InvertZx,
    MirrorXInvertY,
    /// Alias of `InvertZx`, named for poses placed at `camera - R * p` with
    /// Y already inverted.
    CameraRelative,
    Custom(AxisConvention),
}

impl AxisPreset {
    pub fn convention(&self) -> AxisConvention {
        match self {
            AxisPreset::Identity => AxisConvention::new(false, false, false),
            AxisPreset::InvertY => AxisConvention::new(false, true, false),
            AxisPreset::InvertZx | AxisPreset::CameraRelative => AxisConvention::new(true, false, true),
            AxisPreset::MirrorXInvertY => AxisConvention::new(true, true, false),
            AxisPreset::Custom(c) => *c,
        }
    }
}

// ── Reference frame & configuration ───────────────────────────────────────────

/// Pose of the tracking camera in the consumer's reference space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceFrame {
    pub position: Vec3,
    pub orientation: Quat,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AlignerConfig {
    pub axis: AxisPreset,
    pub reference: ReferenceFrame,
    /// Initial user offset
    pub offsets: Vec3,
}

/// Pure alignment of one pose.
pub fn align(raw: &OrientedPose, frame: &ReferenceFrame, axes: AxisConvention, offsets: Vec3) -> OrientedPose {
    let local = axes.apply(raw.position);
    let position = frame.position + frame.orientation.rotate_vec3(local) + offsets;
    let orientation = (frame.orientation * raw.orientation).normalized();
    OrientedPose::new(position, orientation)
}

// ── Offsets ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

/// Writer side of the user-tunable offset. Clone freely; every aligner built
/// from it observes changes on its next `refresh`.
#[derive(Clone)]
pub struct OffsetTuner {
    tx: watch::Sender<Vec3>,
}

impl OffsetTuner {
    pub fn new(initial: Vec3) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Set one axis. Listeners are only notified when the value changes.
    pub fn set_axis(&self, axis: Axis, value: f32) -> bool {
        self.tx.send_if_modified(|v| {
            let slot = match axis {
                Axis::X => &mut v.x,
                Axis::Y => &mut v.y,
                Axis::Z => &mut v.z,
            };
            if *slot == value {
                false
            } else {
                *slot = value;
                true
            }
        })
    }

    pub fn set(&self, offsets: Vec3) -> bool {
        self.tx.send_if_modified(|v| {
            if *v == offsets {
                false
            } else {
                *v = offsets;
                true
            }
        })
    }

    pub fn get(&self) -> Vec3 {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec3> {
        self.tx.subscribe()
    }
}

/// Writer side of the camera reference frame; the frame can be moved while
/// the bridge runs.
#[derive(Clone)]
pub struct ReferenceTuner {
    tx: watch::Sender<ReferenceFrame>,
}

impl ReferenceTuner {
    pub fn new(initial: ReferenceFrame) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Replace the frame. Orientation is normalized; listeners are only
    /// notified when the value changes.
    pub fn set(&self, frame: ReferenceFrame) -> bool {
        let frame = ReferenceFrame { orientation: frame.orientation.normalized(), ..frame };
        self.tx.send_if_modified(|v| {
            if *v == frame {
                false
            } else {
                *v = frame;
                true
            }
        })
    }

    pub fn get(&self) -> ReferenceFrame {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReferenceFrame> {
        self.tx.subscribe()
    }
}

// ── Aligner ───────────────────────────────────────────────────────────────────

pub struct CoordinateAligner {
    axes: AxisConvention,
    frame: ReferenceFrame,
    offsets_rx: watch::Receiver<Vec3>,
    offsets: Vec3,
    frame_rx: Option<watch::Receiver<ReferenceFrame>>,
}

impl CoordinateAligner {
    pub fn new(config: &AlignerConfig, tuner: &OffsetTuner) -> Self {
        let mut offsets_rx = tuner.subscribe();
        let offsets = *offsets_rx.borrow_and_update();
        Self {
            axes: config.axis.convention(),
            frame: config.reference,
            offsets_rx,
            offsets,
            frame_rx: None,
        }
    }

    /// Take the reference frame from `tuner` instead of the static config.
    pub fn follow_reference(&mut self, tuner: &ReferenceTuner) {
        let mut rx = tuner.subscribe();
        self.frame = *rx.borrow_and_update();
        self.frame_rx = Some(rx);
    }

    /// Pull the latest offsets/frame. Returns true when dependents must be
    /// realigned.
    pub fn refresh(&mut self) -> bool {
        let mut changed = false;
        if let Some(rx) = self.frame_rx.as_mut() {
            if rx.has_changed().unwrap_or(false) {
                self.frame = *rx.borrow_and_update();
                debug!(
                    "Reference frame moved → ({:.3}, {:.3}, {:.3})",
                    self.frame.position.x, self.frame.position.y, self.frame.position.z
                );
                changed = true;
            }
        }
        if self.offsets_rx.has_changed().unwrap_or(false) {
            self.offsets = *self.offsets_rx.borrow_and_update();
            debug!(
                "Offsets changed → ({:.3}, {:.3}, {:.3})",
                self.offsets.x, self.offsets.y, self.offsets.z
            );
            changed = true;
        }
        changed
    }

    pub fn reference_frame(&self) -> ReferenceFrame {
        self.frame
    }

    pub fn offsets(&self) -> Vec3 {
        self.offsets
    }

    pub fn align(&self, raw: &OrientedPose) -> OrientedPose {
        align(raw, &self.frame, self.axes, self.offsets)
    }

    pub fn align_all<P>(&self, raw: &HashMap<MarkerId, P>) -> HashMap<MarkerId, OrientedPose>
    where
        P: Copy + Into<OrientedPose>,
    {
        raw.iter().map(|(&id, &p)| (id, self.align(&p.into()))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marker_types::HeadingPose;

    const EPS: f32 = 1e-5;

    #[test]
    fn identity_frame_adds_offset_only() {
        let raw = OrientedPose::from(Vec3::new(1.0, 2.0, 3.0));
        let out = align(&raw, &ReferenceFrame::default(), AxisConvention::default(), Vec3::new(0.5, 0.0, 0.0));
        assert!(out.position.approx_eq(&Vec3::new(1.5, 2.0, 3.0), EPS));
        assert!(out.orientation.approx_eq(&Quat::IDENTITY, EPS));
    }

    #[test]
    fn axis_flip_happens_before_frame_rotation() {
        let frame = ReferenceFrame {
            position: Vec3::new(10.0, 0.0, 0.0),
            orientation: Quat::from_heading_deg(90.0),
        };
        let raw = OrientedPose::from(Vec3::new(0.0, 1.0, 1.0));
        let out = align(&raw, &frame, AxisPreset::InvertY.convention(), Vec3::ZERO);
        // (0, -1, 1) rotated 90° about Y → (1, -1, 0), then translated
        assert!(out.position.approx_eq(&Vec3::new(11.0, -1.0, 0.0), EPS), "{:?}", out.position);
    }

    #[test]
    fn rotation_composes_reference_then_raw() {
        let frame = ReferenceFrame { position: Vec3::ZERO, orientation: Quat::from_heading_deg(45.0) };
        let raw: OrientedPose = HeadingPose::new(Vec3::ZERO, 30.0).into();
        let out = align(&raw, &frame, AxisConvention::default(), Vec3::ZERO);
        assert!(out.orientation.approx_eq(&Quat::from_heading_deg(75.0), EPS));
    }

    #[test]
    fn camera_relative_matches_subtractive_placement() {
        // camera - R * (x, -y, z) == camera + R * (-x, y, -z)
        let frame = ReferenceFrame {
            position: Vec3::new(0.0, 1.5, 0.0),
            orientation: Quat::from_heading_deg(30.0),
        };
        let p = Vec3::new(0.2, 0.4, 1.0);
        let expected = frame.position - frame.orientation.rotate_vec3(Vec3::new(p.x, -p.y, p.z));
        let got = align(&OrientedPose::from(p), &frame, AxisPreset::CameraRelative.convention(), Vec3::ZERO);
        assert!(got.position.approx_eq(&expected, EPS));
    }

    #[test]
    fn custom_preset_parses_from_toml() {
        #[derive(Deserialize)]
        struct W {
            axis: AxisPreset,
        }
        let w: W = toml::from_str("axis = \"mirror_x_invert_y\"").unwrap();
        assert_eq!(w.axis, AxisPreset::MirrorXInvertY);
        let w: W = toml::from_str("[axis.custom]\nflip_z = true\n").unwrap();
        assert_eq!(w.axis.convention(), AxisConvention::new(false, false, true));
    }

    #[test]
    fn offset_change_is_observed_once() {
        let tuner = OffsetTuner::new(Vec3::ZERO);
        let mut aligner = CoordinateAligner::new(&AlignerConfig::default(), &tuner);
        assert!(!aligner.refresh());

        assert!(tuner.set_axis(Axis::Y, 0.25));
        assert!(aligner.refresh());
        assert!(!aligner.refresh());
        assert_eq!(aligner.offsets(), Vec3::new(0.0, 0.25, 0.0));

        // Same value again is not a change
        assert!(!tuner.set_axis(Axis::Y, 0.25));
        assert!(!aligner.refresh());

        let out = aligner.align(&OrientedPose::from(Vec3::new(1.0, 0.0, 0.0)));
        assert!(out.position.approx_eq(&Vec3::new(1.0, 0.25, 0.0), EPS));
    }

    #[test]
    fn moving_the_frame_requests_realignment() {
        let tuner = OffsetTuner::new(Vec3::ZERO);
        let reference = ReferenceTuner::new(ReferenceFrame::default());
        let mut aligner = CoordinateAligner::new(&AlignerConfig::default(), &tuner);
        aligner.follow_reference(&reference);
        assert!(!aligner.refresh());

        assert!(reference.set(ReferenceFrame {
            position: Vec3::new(0.0, 2.0, 0.0),
            orientation: Quat::IDENTITY,
        }));
        assert!(aligner.refresh());
        assert!(!aligner.refresh());
        assert_eq!(aligner.reference_frame().position, Vec3::new(0.0, 2.0, 0.0));

        let raw = HashMap::from([(3, Vec3::new(1.0, 0.0, 0.0))]);
        let out = aligner.align_all(&raw);
        assert!(out[&3].position.approx_eq(&Vec3::new(1.0, 2.0, 0.0), EPS));

        // Same frame again is not a change
        assert!(!reference.set(reference.get()));
        assert!(!aligner.refresh());
    }

    #[test]
    fn camera_relative_is_an_alias_of_invert_zx() {
        assert_eq!(AxisPreset::CameraRelative.convention(), AxisPreset::InvertZx.convention());
    }

    #[test]
    fn reference_with_only_position_keeps_identity_orientation() {
        #[derive(Deserialize)]
        struct W {
            reference: ReferenceFrame,
        }
        let w: W = toml::from_str("[reference]\nposition = { x = 0.0, y = 1.5, z = 0.0 }\n").unwrap();
        assert_eq!(w.reference.position, Vec3::new(0.0, 1.5, 0.0));
        assert_eq!(w.reference.orientation, Quat::IDENTITY);
    }
}
