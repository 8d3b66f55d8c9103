//! Bus message definitions carried by the bridge
//!
//! Field layouts follow the robot-bus interface definitions. Bodies are
//! serialized with bincode using fixed-width integers and rejecting trailing
//! bytes, so a body only decodes as the type it was produced from. That
//! selectivity is what makes type probing of untagged frames usable.

use crate::channels::messages::{
    MAX_MESSAGE_SIZE, MSG_CONTROL, MSG_CONTROL_MODE_REPORT, MSG_GEAR_REPORT, MSG_IMAGE,
    MSG_LASER_SCAN, MSG_ODOMETRY, MSG_POSE_WITH_COVARIANCE_STAMPED, MSG_STEERING_REPORT,
    MSG_TRAJECTORY, MSG_VELOCITY_REPORT,
};
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Serialize a message body
pub fn encode_body<T: Serialize>(msg: &T) -> Result<Vec<u8>, bincode::Error> {
    body_options().serialize(msg)
}

/// Deserialize a message body; the whole slice must be consumed
pub fn decode_body<T: DeserializeOwned>(data: &[u8]) -> Result<T, bincode::Error> {
    body_options().deserialize(data)
}

fn body_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_MESSAGE_SIZE as u64)
        .reject_trailing_bytes()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Time {
    pub sec: i32,
    pub nanosec: u32,
}

impl Time {
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: now.as_secs() as i32,
            nanosec: now.subsec_nanos(),
        }
    }
}

/// Message duration (same layout as [`Time`])
pub type MsgDuration = Time;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub stamp: Time,
    pub frame_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vector3,
    pub orientation: Quaternion,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Twist {
    pub linear: Vector3,
    pub angular: Vector3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseWithCovariance {
    pub pose: Pose,
    /// Row-major 6x6
    pub covariance: Vec<f64>,
}

impl Default for PoseWithCovariance {
    fn default() -> Self {
        Self {
            pose: Pose::default(),
            covariance: vec![0.0; 36],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwistWithCovariance {
    pub twist: Twist,
    pub covariance: Vec<f64>,
}

impl Default for TwistWithCovariance {
    fn default() -> Self {
        Self {
            twist: Twist::default(),
            covariance: vec![0.0; 36],
        }
    }
}

/// `sensor_msgs/msg/Image`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub header: Header,
    pub height: u32,
    pub width: u32,
    /// Pixel encoding, e.g. `rgb8`, `bgr8`, `rgba8`
    pub encoding: String,
    pub is_bigendian: u8,
    /// Row length in bytes
    pub step: u32,
    pub data: Vec<u8>,
}

/// `sensor_msgs/msg/LaserScan`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaserScan {
    pub header: Header,
    pub angle_min: f32,
    pub angle_max: f32,
    pub angle_increment: f32,
    pub time_increment: f32,
    pub scan_time: f32,
    pub range_min: f32,
    pub range_max: f32,
    pub ranges: Vec<f32>,
    pub intensities: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lateral {
    pub stamp: Time,
    pub control_time: Time,
    pub steering_tire_angle: f32,
    pub steering_tire_rotation_rate: f32,
    pub is_defined_steering_tire_rotation_rate: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Longitudinal {
    pub stamp: Time,
    pub control_time: Time,
    pub velocity: f32,
    pub acceleration: f32,
    pub jerk: f32,
    pub is_defined_acceleration: bool,
    pub is_defined_jerk: bool,
}

/// `autoware_control_msgs/msg/Control`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Control {
    pub stamp: Time,
    pub control_time: Time,
    pub lateral: Lateral,
    pub longitudinal: Longitudinal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub time_from_start: MsgDuration,
    pub pose: Pose,
    pub longitudinal_velocity_mps: f32,
    pub lateral_velocity_mps: f32,
    pub acceleration_mps2: f32,
    pub heading_rate_rps: f32,
    pub front_wheel_angle_rad: f32,
    pub rear_wheel_angle_rad: f32,
}

/// `autoware_planning_msgs/msg/Trajectory`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub header: Header,
    pub points: Vec<TrajectoryPoint>,
}

/// `autoware_vehicle_msgs/msg/ControlModeReport`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlModeReport {
    pub stamp: Time,
    pub mode: u8,
}

/// `autoware_vehicle_msgs/msg/VelocityReport`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VelocityReport {
    pub header: Header,
    pub longitudinal_velocity: f32,
    pub lateral_velocity: f32,
    pub heading_rate: f32,
}

/// `autoware_vehicle_msgs/msg/SteeringReport`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SteeringReport {
    pub stamp: Time,
    pub steering_tire_angle: f32,
}

/// `autoware_vehicle_msgs/msg/GearReport`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GearReport {
    pub stamp: Time,
    pub report: u8,
}

/// `nav_msgs/msg/Odometry`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Odometry {
    pub header: Header,
    pub child_frame_id: String,
    pub pose: PoseWithCovariance,
    pub twist: TwistWithCovariance,
}

/// `geometry_msgs/msg/PoseWithCovarianceStamped`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoseWithCovarianceStamped {
    pub header: Header,
    pub pose: PoseWithCovariance,
}

/// Any message the bridge can carry
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    Image(Image),
    LaserScan(LaserScan),
    Control(Control),
    Trajectory(Trajectory),
    ControlModeReport(ControlModeReport),
    VelocityReport(VelocityReport),
    SteeringReport(SteeringReport),
    GearReport(GearReport),
    Odometry(Odometry),
    PoseWithCovarianceStamped(PoseWithCovarianceStamped),
}

impl BusMessage {
    /// Registered type name
    pub fn type_name(&self) -> &'static str {
        match self {
            BusMessage::Image(_) => MSG_IMAGE,
            BusMessage::LaserScan(_) => MSG_LASER_SCAN,
            BusMessage::Control(_) => MSG_CONTROL,
            BusMessage::Trajectory(_) => MSG_TRAJECTORY,
            BusMessage::ControlModeReport(_) => MSG_CONTROL_MODE_REPORT,
            BusMessage::VelocityReport(_) => MSG_VELOCITY_REPORT,
            BusMessage::SteeringReport(_) => MSG_STEERING_REPORT,
            BusMessage::GearReport(_) => MSG_GEAR_REPORT,
            BusMessage::Odometry(_) => MSG_ODOMETRY,
            BusMessage::PoseWithCovarianceStamped(_) => MSG_POSE_WITH_COVARIANCE_STAMPED,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, BusMessage::Image(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_bytes_rejected() {
        let report = GearReport {
            stamp: Time { sec: 1, nanosec: 2 },
            report: 3,
        };
        let mut body = encode_body(&report).unwrap();
        assert_eq!(body.len(), 9);
        assert_eq!(decode_body::<GearReport>(&body).unwrap(), report);

        body.push(0);
        assert!(decode_body::<GearReport>(&body).is_err());
    }

    #[test]
    fn test_image_does_not_decode_as_scan() {
        let image = Image {
            header: Header {
                stamp: Time::now(),
                frame_id: "camera".to_string(),
            },
            height: 2,
            width: 2,
            encoding: "rgb8".to_string(),
            is_bigendian: 0,
            step: 6,
            data: vec![7; 12],
        };
        let body = encode_body(&image).unwrap();
        assert!(decode_body::<LaserScan>(&body).is_err());
        assert_eq!(decode_body::<Image>(&body).unwrap(), image);
    }

    #[test]
    fn test_type_names() {
        assert_eq!(BusMessage::Image(Image::default()).type_name(), MSG_IMAGE);
        assert!(BusMessage::Image(Image::default()).is_image());
        assert_eq!(
            BusMessage::Odometry(Odometry::default()).type_name(),
            MSG_ODOMETRY
        );
    }
}
