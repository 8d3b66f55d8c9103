//! Inbound signaling state machine
//!
//! Classifies each inbound text frame by where the session is in the
//! handshake. The server expects `configure`, then the remote description,
//! then candidates. The client sent `configure` itself, so it starts at the
//! description. A frame that does not parse for the current step is a
//! protocol error; the caller logs it and keeps reading.

use super::protocol::{parse_candidate, parse_configure, parse_description, StreamSetup};
use crate::Result;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts the connection and offers
    Server,
    /// Dials, sends `configure` and answers
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingConfigure,
    AwaitingDescription,
    /// Handshake done; everything inbound is a candidate
    Trickling,
}

/// Events surfaced to the owner of a signaling connection
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    Configure(StreamSetup),
    Description(RTCSessionDescription),
    Candidate(RTCIceCandidateInit),
    /// The connection is gone; no further events follow
    Closed,
}

#[derive(Debug)]
pub struct Handshake {
    role: Role,
    state: HandshakeState,
}

impl Handshake {
    pub fn new(role: Role) -> Self {
        let state = match role {
            Role::Server => HandshakeState::AwaitingConfigure,
            Role::Client => HandshakeState::AwaitingDescription,
        };
        Self { role, state }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Classify one inbound text frame, advancing on success only
    pub fn on_message(&mut self, text: &str) -> Result<SignalingEvent> {
        match self.state {
            HandshakeState::AwaitingConfigure => {
                let setup = parse_configure(text)?;
                self.state = HandshakeState::AwaitingDescription;
                Ok(SignalingEvent::Configure(setup))
            }
            HandshakeState::AwaitingDescription => {
                let desc = parse_description(text)?;
                self.state = HandshakeState::Trickling;
                Ok(SignalingEvent::Description(desc))
            }
            HandshakeState::Trickling => parse_candidate(text).map(SignalingEvent::Candidate),
        }
    }
}
