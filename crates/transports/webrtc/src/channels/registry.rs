//! Type registry: tag → (de)serialization routine
//!
//! Built once at startup and shared read-only (behind an `Arc`) by every
//! multiplexer. Registration order is the probing order for untagged frames.

use super::messages::{self, tag_key};
use crate::msgs::{decode_body, encode_body, BusMessage};
use crate::{Error, Result};
use std::collections::HashMap;

pub type EncodeFn = fn(&BusMessage) -> Result<Vec<u8>>;
pub type DecodeFn = fn(&[u8]) -> Result<BusMessage>;

/// Serialization routines for one registered type
#[derive(Clone, Copy)]
pub struct MessageCodec {
    pub type_name: &'static str,
    pub encode: EncodeFn,
    pub decode: DecodeFn,
}

impl std::fmt::Debug for MessageCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCodec")
            .field("type_name", &self.type_name)
            .finish()
    }
}

macro_rules! codec {
    ($name:expr, $variant:ident) => {
        MessageCodec {
            type_name: $name,
            encode: |msg| match msg {
                BusMessage::$variant(m) => {
                    encode_body(m).map_err(|e| Error::SerializationError(e.to_string()))
                }
                other => Err(Error::SerializationError(format!(
                    "codec for {} cannot encode {}",
                    $name,
                    other.type_name()
                ))),
            },
            decode: |data| {
                decode_body(data)
                    .map(BusMessage::$variant)
                    .map_err(|e| Error::SerializationError(e.to_string()))
            },
        }
    };
}

/// Immutable registry of bridgeable message types
#[derive(Debug)]
pub struct TypeRegistry {
    codecs: Vec<MessageCodec>,
    by_key: HashMap<&'static str, usize>,
}

impl TypeRegistry {
    /// Build a registry from codecs; later duplicates of a tag key are ignored
    pub fn new(codecs: Vec<MessageCodec>) -> Self {
        let mut by_key = HashMap::with_capacity(codecs.len());
        let mut kept = Vec::with_capacity(codecs.len());
        for codec in codecs {
            let key = tag_key(codec.type_name);
            if by_key.contains_key(key) {
                continue;
            }
            by_key.insert(key, kept.len());
            kept.push(codec);
        }
        Self {
            codecs: kept,
            by_key,
        }
    }

    /// Registry with every type the bridge knows
    pub fn standard() -> Self {
        Self::new(vec![
            codec!(messages::MSG_IMAGE, Image),
            codec!(messages::MSG_LASER_SCAN, LaserScan),
            codec!(messages::MSG_CONTROL, Control),
            codec!(messages::MSG_TRAJECTORY, Trajectory),
            codec!(messages::MSG_CONTROL_MODE_REPORT, ControlModeReport),
            codec!(messages::MSG_VELOCITY_REPORT, VelocityReport),
            codec!(messages::MSG_STEERING_REPORT, SteeringReport),
            codec!(messages::MSG_GEAR_REPORT, GearReport),
            codec!(messages::MSG_ODOMETRY, Odometry),
            codec!(
                messages::MSG_POSE_WITH_COVARIANCE_STAMPED,
                PoseWithCovarianceStamped
            ),
        ])
    }

    /// Look up by the key read from a frame tag (or by full type name)
    pub fn lookup(&self, key: &str) -> Option<&MessageCodec> {
        self.by_key.get(tag_key(key)).map(|&i| &self.codecs[i])
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.lookup(type_name).is_some()
    }

    /// Codecs in probing order
    pub fn codecs(&self) -> &[MessageCodec] {
        &self.codecs
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    /// Serialize a message with its registered codec
    pub fn encode(&self, msg: &BusMessage) -> Result<Vec<u8>> {
        let codec = self
            .lookup(msg.type_name())
            .ok_or_else(|| Error::UnknownMessageType(msg.type_name().to_string()))?;
        (codec.encode)(msg)
    }
}
