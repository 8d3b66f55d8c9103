//! WebRTC peer connection management
//!
//! [`connection`] owns the negotiation and state machine shared by both
//! ends; [`sender`] and [`receiver`] add the media and data channel wiring
//! for each role.

pub mod candidates;
pub mod connection;
pub mod receiver;
pub mod sender;

use crate::bus::MessageBus;
use crate::channels::TypeRegistry;
use crate::config::BridgeConfig;
use crate::media::codec::Vp8Codec;
use std::sync::Arc;

pub use candidates::IceCandidateQueue;
pub use connection::{
    drive_signaling, new_peer_connection, PeerConnectionState, PeerLink, HEADER_EXTENSIONS,
    VP8_PAYLOAD_TYPE,
};
pub use receiver::{TopicRoutes, GREETING, PLI_INTERVAL};
pub use sender::{FrameEncoder, DATA_CHANNEL_LABEL};

/// Process-wide collaborators shared by every session
#[derive(Clone)]
pub struct PeerContext {
    pub config: Arc<BridgeConfig>,
    pub bus: Arc<dyn MessageBus>,
    pub codec: Arc<dyn Vp8Codec>,
    pub registry: Arc<TypeRegistry>,
}
