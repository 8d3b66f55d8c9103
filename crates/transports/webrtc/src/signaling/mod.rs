//! Session signaling over WebSocket
//!
//! The sender runs a [`SignalingServer`]; the receiver dials it with
//! [`client::connect`]. Both ends get a [`SignalingChannel`] that carries
//! the session description and trickled ICE candidates.

pub mod channel;
pub mod client;
pub mod handshake;
pub mod protocol;
pub mod server;

pub use channel::{SignalingChannel, SignalingSender};
pub use handshake::{Handshake, HandshakeState, Role, SignalingEvent};
pub use protocol::{
    munge_answer_sdp, ConfigureMessage, IceCandidateMessage, StreamSetup, ALREADY_CONNECTED,
    SIGNALING_PATH,
};
pub use server::SignalingServer;
