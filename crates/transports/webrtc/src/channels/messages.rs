//! Data channel frame format
//!
//! Every non-video message travels as one data channel message laid out as
//!
//! ```text
//! +----------------------------+---------------------------+
//! | type tag (32 bytes, ASCII, | serialized message body   |
//! | NUL padded / truncated)    |                           |
//! +----------------------------+---------------------------+
//! ```
//!
//! The tag is the registered type name of the body. Peers that predate the
//! tag send the bare body; receivers detect that and probe every registered
//! type instead.

use bytes::{BufMut, Bytes, BytesMut};

/// Length of the type tag prefix
pub const TYPE_TAG_LEN: usize = 32;

/// Maximum message size accepted from the data channel (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

pub const MSG_IMAGE: &str = "sensor_msgs/msg/Image";
pub const MSG_LASER_SCAN: &str = "sensor_msgs/msg/LaserScan";
pub const MSG_CONTROL: &str = "autoware_control_msgs/msg/Control";
pub const MSG_TRAJECTORY: &str = "autoware_planning_msgs/msg/Trajectory";
pub const MSG_CONTROL_MODE_REPORT: &str = "autoware_vehicle_msgs/msg/ControlModeReport";
pub const MSG_VELOCITY_REPORT: &str = "autoware_vehicle_msgs/msg/VelocityReport";
pub const MSG_STEERING_REPORT: &str = "autoware_vehicle_msgs/msg/SteeringReport";
pub const MSG_GEAR_REPORT: &str = "autoware_vehicle_msgs/msg/GearReport";
pub const MSG_ODOMETRY: &str = "nav_msgs/msg/Odometry";
pub const MSG_POSE_WITH_COVARIANCE_STAMPED: &str = "geometry_msgs/msg/PoseWithCovarianceStamped";

/// All bridgeable message types, in registration order
pub const REGISTERED_TYPES: [&str; 10] = [
    MSG_IMAGE,
    MSG_LASER_SCAN,
    MSG_CONTROL,
    MSG_TRAJECTORY,
    MSG_CONTROL_MODE_REPORT,
    MSG_VELOCITY_REPORT,
    MSG_STEERING_REPORT,
    MSG_GEAR_REPORT,
    MSG_ODOMETRY,
    MSG_POSE_WITH_COVARIANCE_STAMPED,
];

pub fn is_registered_type(name: &str) -> bool {
    REGISTERED_TYPES.contains(&name)
}

/// The part of a type name that survives truncation into the tag
pub fn tag_key(type_name: &str) -> &str {
    let mut end = type_name.len().min(TYPE_TAG_LEN);
    while !type_name.is_char_boundary(end) {
        end -= 1;
    }
    &type_name[..end]
}

/// Build the 32-byte tag for a type name
pub fn encode_type_tag(type_name: &str) -> [u8; TYPE_TAG_LEN] {
    let mut tag = [0u8; TYPE_TAG_LEN];
    let name = type_name.as_bytes();
    let n = name.len().min(TYPE_TAG_LEN);
    tag[..n].copy_from_slice(&name[..n]);
    tag
}

/// Prefix `body` with the tag for `type_name`
pub fn encode_frame(type_name: &str, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(TYPE_TAG_LEN + body.len());
    buf.put_slice(&encode_type_tag(type_name));
    buf.put_slice(body);
    buf.freeze()
}

/// What the first 32 bytes of an inbound frame turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHeader<'a> {
    /// Non-empty tag; `body` follows it
    Tagged { key: &'a str, body: &'a [u8] },
    /// 32 NUL bytes; `body` follows them
    Blank { body: &'a [u8] },
    /// Shorter than a tag, or the tag is not text
    Missing,
}

/// Split an inbound frame into its tag key and body
pub fn parse_frame(data: &[u8]) -> FrameHeader<'_> {
    if data.len() < TYPE_TAG_LEN {
        return FrameHeader::Missing;
    }
    let (tag, body) = data.split_at(TYPE_TAG_LEN);
    let end = tag.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    if end == 0 {
        return FrameHeader::Blank { body };
    }
    match std::str::from_utf8(&tag[..end]) {
        Ok(key) if key.is_ascii() => FrameHeader::Tagged { key, body },
        _ => FrameHeader::Missing,
    }
}
