//! # marker-types
//!
//! Shared marker-tracking structures for the marker bridge.
//!
//! These types are used by:
//! - `bridge-rust`: decoding tracker traffic, storing and aligning marker poses
//! - `packages/marker-simulator`: producing the same traffic without a camera
//!
//! ## Coordinate Conventions
//!
//! - **Tracker space**: whatever the external camera tracker reports (meters).
//!   Axis direction depends on the deployment and is corrected by the aligner.
//! - **Reference space**: the consumer's world frame, Y up, left-handed
//!   heading (positive heading turns about +Y).
//!
//! ## Two pose shapes
//! The UDP relay path carries a scalar heading in degrees (`HeadingPose`);
//! the WebSocket path and the aligner work with quaternions (`OrientedPose`).
//! They are separate types on purpose and only convert towards `OrientedPose`.

use std::collections::BTreeMap;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};

/// Physical fiducial id (ArUco tag id). Not contiguous, not bounded.
pub type MarkerId = i32;

/// Default UDP port of the aggregating relay.
pub const DEFAULT_RELAY_PORT: u16 = 12345;
/// Default stream the tracker publishes marker positions on.
pub const DEFAULT_STREAM_NAME: &str = "aruco_position_stream";
/// Bare acknowledgment bytes the relay sends back for every datagram.
pub const RELAY_ACK: &[u8] = b"ACK";

// ── 3D Vector & Quaternion ────────────────────────────────────────────────────

/// 3D vector (meters)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn length(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Component-wise closeness, used by calibration checks.
    pub fn approx_eq(&self, other: &Vec3, eps: f32) -> bool {
        (self.x - other.x).abs() <= eps
            && (self.y - other.y).abs() <= eps
            && (self.z - other.z).abs() <= eps
    }
}

impl Add for Vec3 {
    type Output = Vec3;
    fn add(self, o: Vec3) -> Vec3 { Vec3::new(self.x + o.x, self.y + o.y, self.z + o.z) }
}

impl AddAssign for Vec3 {
    fn add_assign(&mut self, o: Vec3) {
        self.x += o.x;
        self.y += o.y;
        self.z += o.z;
    }
}

impl Sub for Vec3 {
    type Output = Vec3;
    fn sub(self, o: Vec3) -> Vec3 { Vec3::new(self.x - o.x, self.y - o.y, self.z - o.z) }
}

impl Mul<f32> for Vec3 {
    type Output = Vec3;
    fn mul(self, s: f32) -> Vec3 { Vec3::new(self.x * s, self.y * s, self.z * s) }
}

impl Div<f32> for Vec3 {
    type Output = Vec3;
    fn div(self, s: f32) -> Vec3 { Vec3::new(self.x / s, self.y / s, self.z / s) }
}

impl Neg for Vec3 {
    type Output = Vec3;
    fn neg(self) -> Vec3 { Vec3::new(-self.x, -self.y, -self.z) }
}

/// Orientation quaternion (normalized)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quat {
    pub const IDENTITY: Quat = Quat { x: 0.0, y: 0.0, z: 0.0, w: 1.0 };

    /// Rotation of `angle_deg` about `axis` (axis need not be unit length).
    pub fn from_axis_angle_deg(axis: Vec3, angle_deg: f32) -> Self {
        let len = axis.length();
        if len <= f32::EPSILON {
            return Self::IDENTITY;
        }
        let a = axis / len;
        let half = angle_deg.to_radians() * 0.5;
        let s = half.sin();
        Self { x: a.x * s, y: a.y * s, z: a.z * s, w: half.cos() }
    }

    /// Heading rotation about the reference frame's up axis (+Y).
    pub fn from_heading_deg(heading_deg: f32) -> Self {
        Self::from_axis_angle_deg(Vec3::new(0.0, 1.0, 0.0), heading_deg)
    }

    pub fn normalized(&self) -> Self {
        let n = (self.x * self.x + self.y * self.y + self.z * self.z + self.w * self.w).sqrt();
        if n <= f32::EPSILON {
            return Self::IDENTITY;
        }
        Self { x: self.x / n, y: self.y / n, z: self.z / n, w: self.w / n }
    }

    /// Same rotation check; `q` and `-q` are equal rotations.
    pub fn approx_eq(&self, other: &Quat, eps: f32) -> bool {
        let dot = self.x * other.x + self.y * other.y + self.z * other.z + self.w * other.w;
        (dot.abs() - 1.0).abs() <= eps
    }

    /// Convert quaternion to 3×3 rotation matrix (row-major)
    pub fn to_rotation_matrix(&self) -> [[f32; 3]; 3] {
        let (x, y, z, w) = (self.x, self.y, self.z, self.w);
        [
            [1.0 - 2.0*(y*y + z*z), 2.0*(x*y - w*z),       2.0*(x*z + w*y)],
            [2.0*(x*y + w*z),        1.0 - 2.0*(x*x + z*z), 2.0*(y*z - w*x)],
            [2.0*(x*z - w*y),        2.0*(y*z + w*x),       1.0 - 2.0*(x*x + y*y)],
        ]
    }

    /// Rotate a vector from this frame's local axes into its parent frame.
    pub fn rotate_vec3(&self, v: Vec3) -> Vec3 {
        let r = self.to_rotation_matrix();
        Vec3 {
            x: r[0][0]*v.x + r[0][1]*v.y + r[0][2]*v.z,
            y: r[1][0]*v.x + r[1][1]*v.y + r[1][2]*v.z,
            z: r[2][0]*v.x + r[2][1]*v.y + r[2][2]*v.z,
        }
    }
}

/// Hamilton product: `a * b` rotates by `b` first, then by `a`.
impl Mul for Quat {
    type Output = Quat;
    fn mul(self, b: Quat) -> Quat {
        let a = self;
        Quat {
            w: a.w*b.w - a.x*b.x - a.y*b.y - a.z*b.z,
            x: a.w*b.x + a.x*b.w + a.y*b.z - a.z*b.y,
            y: a.w*b.y - a.x*b.z + a.y*b.w + a.z*b.x,
            z: a.w*b.z + a.x*b.y - a.y*b.x + a.z*b.w,
        }
    }
}

// ── Poses ─────────────────────────────────────────────────────────────────────

/// Relay-path pose: position plus a scalar heading in degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HeadingPose {
    pub position: Vec3,
    pub rotation: f32,
}

impl HeadingPose {
    pub const fn new(position: Vec3, rotation: f32) -> Self {
        Self { position, rotation }
    }
}

/// Full pose with quaternion orientation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OrientedPose {
    pub position: Vec3,
    pub orientation: Quat,
}

impl OrientedPose {
    pub const fn new(position: Vec3, orientation: Quat) -> Self {
        Self { position, orientation }
    }
}

impl From<HeadingPose> for OrientedPose {
    fn from(p: HeadingPose) -> Self {
        Self { position: p.position, orientation: Quat::from_heading_deg(p.rotation) }
    }
}

impl From<Vec3> for OrientedPose {
    fn from(position: Vec3) -> Self {
        Self { position, orientation: Quat::IDENTITY }
    }
}

// ── WebSocket wire format ─────────────────────────────────────────────────────

/// One decoded marker position from a `stream_data` payload.
///
/// Accepts both shapes trackers emit:
/// `{"marker_id":1,"x":..,"y":..,"z":..}` and
/// `{"marker_id":1,"position":{"x":..,"y":..,"z":..}}`.
/// Serializes as the nested shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "MarkerRecordWire")]
pub struct MarkerRecord {
    pub marker_id: MarkerId,
    pub position: Vec3,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MarkerRecordWire {
    Nested { marker_id: MarkerId, position: Vec3 },
    Flat { marker_id: MarkerId, x: f32, y: f32, z: f32 },
}

impl From<MarkerRecordWire> for MarkerRecord {
    fn from(w: MarkerRecordWire) -> Self {
        match w {
            MarkerRecordWire::Nested { marker_id, position } => Self { marker_id, position },
            MarkerRecordWire::Flat { marker_id, x, y, z } => Self { marker_id, position: Vec3::new(x, y, z) },
        }
    }
}

/// Body of a `stream_data` message. `data` may be null on a stream that was
/// registered but never fed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDataMessage {
    #[serde(default)]
    pub stream_name: Option<String>,
    #[serde(default)]
    pub data: Option<Vec<MarkerRecord>>,
}

/// Messages a client sends to the tracking server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Handshake: `{"command":"client_id","client_id":"..."}`
    ClientId { client_id: String },
    /// Poll: `{"command":"request_stream_data","client_id":"...","stream_name":"..."}`
    RequestStreamData {
        #[serde(default)]
        client_id: String,
        stream_name: String,
    },
    /// Publish (tracker side). Trackers commonly omit the client id.
    StreamData {
        stream_name: String,
        data: Vec<MarkerRecord>,
    },
    CloseStream {
        #[serde(default)]
        client_id: String,
        stream_name: String,
    },
    Message {
        #[serde(default)]
        client_id: String,
        data: serde_json::Value,
    },
    Broadcast {
        #[serde(default)]
        client_id: String,
        data: serde_json::Value,
    },
    SendToClient {
        #[serde(default)]
        client_id: String,
        target_id: String,
        data: serde_json::Value,
    },
}

/// Messages the tracking server sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum ServerMessage {
    #[serde(rename = "REQUEST_ID")]
    RequestId,
    #[serde(rename = "stream_data")]
    StreamData(StreamDataMessage),
    #[serde(rename = "broadcast")]
    Broadcast { data: serde_json::Value },
    #[serde(rename = "message")]
    Message { data: serde_json::Value },
    #[serde(rename = "SERVER_CLOSING")]
    ServerClosing,
}

// ── UDP relay wire format ─────────────────────────────────────────────────────

/// Per-marker sample inside a relay datagram.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelayMarkerSample {
    pub position: Vec3,
    #[serde(default)]
    pub rotation: f32,
}

/// `{"timestamp":<f64>,"markers":{"<id>":{"position":{..},"rotation":<f32>}}}`
///
/// An empty or absent `markers` map is a tracker heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayDatagram {
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub markers: Option<BTreeMap<String, RelayMarkerSample>>,
}

impl RelayDatagram {
    pub fn heartbeat(timestamp: f64) -> Self {
        Self { timestamp, markers: Some(BTreeMap::new()) }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.markers.as_ref().map_or(true, |m| m.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_record_accepts_flat_and_nested_shapes() {
        let flat: MarkerRecord =
            serde_json::from_str(r#"{"marker_id":3,"x":1.0,"y":2.0,"z":3.5}"#).unwrap();
        let nested: MarkerRecord =
            serde_json::from_str(r#"{"marker_id":3,"position":{"x":1.0,"y":2.0,"z":3.5}}"#).unwrap();
        assert_eq!(flat, nested);
        assert_eq!(flat.position, Vec3::new(1.0, 2.0, 3.5));
    }

    #[test]
    fn marker_record_rejects_missing_coordinates() {
        let r = serde_json::from_str::<MarkerRecord>(r#"{"marker_id":3,"x":1.0}"#);
        assert!(r.is_err());
    }

    #[test]
    fn handshake_and_poll_wire_shape() {
        let hs = serde_json::to_value(ClientMessage::ClientId { client_id: "c1".into() }).unwrap();
        assert_eq!(hs, serde_json::json!({"command": "client_id", "client_id": "c1"}));

        let poll = serde_json::to_value(ClientMessage::RequestStreamData {
            client_id: "c1".into(),
            stream_name: "s".into(),
        })
        .unwrap();
        assert_eq!(
            poll,
            serde_json::json!({"command": "request_stream_data", "client_id": "c1", "stream_name": "s"})
        );
    }

    #[test]
    fn server_stream_data_round_trips_through_tag() {
        let raw = r#"{"command":"stream_data","stream_name":"s","data":[{"marker_id":1,"x":0,"y":0,"z":1}]}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ServerMessage::StreamData(sd) => {
                assert_eq!(sd.stream_name.as_deref(), Some("s"));
                assert_eq!(sd.data.unwrap()[0].position.z, 1.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        let id = serde_json::to_string(&ServerMessage::RequestId).unwrap();
        assert_eq!(id, r#"{"command":"REQUEST_ID"}"#);
    }

    #[test]
    fn relay_datagram_heartbeat_has_no_markers() {
        let d: RelayDatagram = serde_json::from_str(r#"{"timestamp":12.5,"markers":{}}"#).unwrap();
        assert!(d.is_heartbeat());
        let d: RelayDatagram = serde_json::from_str(r#"{"timestamp":12.5}"#).unwrap();
        assert!(d.is_heartbeat());
        let d: RelayDatagram = serde_json::from_str(
            r#"{"timestamp":1,"markers":{"7":{"position":{"x":1,"y":2,"z":3},"rotation":45}}}"#,
        )
        .unwrap();
        assert!(!d.is_heartbeat());
        assert_eq!(d.markers.unwrap()["7"].rotation, 45.0);
    }

    #[test]
    fn heading_quaternion_rotates_about_up_axis() {
        let q = Quat::from_heading_deg(90.0);
        let v = q.rotate_vec3(Vec3::new(0.0, 0.0, 1.0));
        assert!(v.approx_eq(&Vec3::new(1.0, 0.0, 0.0), 1e-5), "{v:?}");
        // Up axis is invariant under heading
        let up = q.rotate_vec3(Vec3::new(0.0, 1.0, 0.0));
        assert!(up.approx_eq(&Vec3::new(0.0, 1.0, 0.0), 1e-5));
    }

    #[test]
    fn quaternion_product_composes_rotations() {
        let a = Quat::from_heading_deg(30.0);
        let b = Quat::from_heading_deg(60.0);
        assert!((a * b).approx_eq(&Quat::from_heading_deg(90.0), 1e-5));

        // Order: reference ∘ raw applies raw first
        let yaw = Quat::from_heading_deg(90.0);
        let pitch = Quat::from_axis_angle_deg(Vec3::new(1.0, 0.0, 0.0), 90.0);
        let v = (yaw * pitch).rotate_vec3(Vec3::new(0.0, 1.0, 0.0));
        let expected = yaw.rotate_vec3(pitch.rotate_vec3(Vec3::new(0.0, 1.0, 0.0)));
        assert!(v.approx_eq(&expected, 1e-5));
    }
}
