//! WebRTC bridge for robot messaging buses
//!
//! Carries bus topics between two hosts over one WebRTC peer connection:
//! image topics as a VP8 video track, every other bridged type as tagged
//! frames on a data channel.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────── sender ───────────────┐        ┌────────────── receiver ──────────────┐
//! │ MessageBus ─▶ dispatcher             │        │                                      │
//! │               ├─ Image ─▶ VP8 encode ─┼─ RTP ─▶│ FrameReassembler ─▶ decode ─▶ bus    │
//! │               └─ other ─▶ tag + body ─┼─ DC ──▶│ MessageMultiplexer ─▶ bus            │
//! │ BandwidthManager (video ↔ data split) │        │ PLI every 3 s                        │
//! │ SignalingServer  ◀──── WebSocket /webrtc ────▶ signaling client                       │
//! └──────────────────────────────────────┘        └──────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use wrb_webrtc::{BridgeConfig, Mode};
//!
//! let config = BridgeConfig::default()
//!     .with_mode(Mode::Receiver)
//!     .with_addr("192.168.1.20:8080");
//! assert!(config.validate().is_ok());
//! ```

#![warn(clippy::all)]

pub mod bandwidth;
pub mod bridge;
pub mod bus;
pub mod channels;
pub mod config;
pub mod error;
pub mod media;
pub mod msgs;
pub mod peer;
pub mod session;
pub mod signaling;

pub use bandwidth::{BandwidthManager, BitrateControl, EncoderSlot};
pub use bridge::Bridge;
pub use bus::{LocalBus, MessageBus};
pub use channels::{MessageMultiplexer, TypeRegistry};
pub use config::{BandwidthConfig, BridgeConfig, Mode, TopicConfig};
pub use error::{Error, Result};
pub use media::{FrameReassembler, UnavailableCodec, Vp8Codec};
pub use msgs::BusMessage;
pub use session::{DoneSignal, SessionEvent};
pub use signaling::{SignalingChannel, SignalingServer};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
