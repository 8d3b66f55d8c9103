//! Signaling wire format
//!
//! JSON text frames over a WebSocket at [`SIGNALING_PATH`]:
//!
//! 1. client → server: a `configure` message naming the stream and track
//! 2. server → client: the offer, as a raw session description object
//! 3. client → server: the answer, as a raw session description object
//! 4. both directions: `ice_candidate` messages

use crate::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// HTTP path the signaling WebSocket is served on
pub const SIGNALING_PATH: &str = "/webrtc";

/// Body of the 409 response sent to a second receiver
pub const ALREADY_CONNECTED: &str = "already have a receiver";

pub const CONFIGURE_TYPE: &str = "configure";
pub const ICE_CANDIDATE_TYPE: &str = "ice_candidate";

const STREAM_ID_PREFIX: &str = "webrtc_ros-stream-";
const TRACK_SUFFIX: &str = "/subscribed_video";
const SOURCE_PREFIX: &str = "ros_image:/";

/// One step of a `configure` message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    AddStream {
        id: String,
    },
    AddVideoTrack {
        id: String,
        stream_id: String,
        src: String,
    },
}

/// First message of a session, sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub actions: Vec<Action>,
}

/// The stream and track a validated `configure` message asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSetup {
    pub stream_id: String,
    pub track_id: String,
    pub src: String,
}

impl ConfigureMessage {
    /// Build the request for a topic under a fresh random stream id
    pub fn for_topic(name_in: &str) -> Self {
        let stream_id = format!(
            "{}{}",
            STREAM_ID_PREFIX,
            rand::thread_rng().gen_range(0..1_000_000_000u32)
        );
        Self::new(&stream_id, name_in)
    }

    pub fn new(stream_id: &str, name_in: &str) -> Self {
        Self {
            kind: CONFIGURE_TYPE.to_string(),
            actions: vec![
                Action::AddStream {
                    id: stream_id.to_string(),
                },
                Action::AddVideoTrack {
                    id: format!("{}{}", stream_id, TRACK_SUFFIX),
                    stream_id: stream_id.to_string(),
                    src: format!("{}{}", SOURCE_PREFIX, name_in.trim_start_matches('/')),
                },
            ],
        }
    }

    /// Check the message shape and extract the requested stream
    ///
    /// Exactly two actions are accepted: `add_stream`, then `add_video_track`
    /// referring to the same stream.
    pub fn validate(&self) -> Result<StreamSetup> {
        if self.kind != CONFIGURE_TYPE {
            return Err(Error::ProtocolError(format!(
                "expected configure message, got type '{}'",
                self.kind
            )));
        }
        match self.actions.as_slice() {
            [Action::AddStream { id: stream }, Action::AddVideoTrack {
                id,
                stream_id,
                src,
            }] => {
                if stream != stream_id {
                    return Err(Error::ProtocolError(format!(
                        "video track refers to stream '{}' but stream '{}' was added",
                        stream_id, stream
                    )));
                }
                if id.is_empty() || stream_id.is_empty() {
                    return Err(Error::ProtocolError("empty stream or track id".to_string()));
                }
                Ok(StreamSetup {
                    stream_id: stream_id.clone(),
                    track_id: id.clone(),
                    src: src.clone(),
                })
            }
            actions => Err(Error::ProtocolError(format!(
                "configure needs add_stream then add_video_track, got {} action(s)",
                actions.len()
            ))),
        }
    }
}

/// A trickled ICE candidate
///
/// Inbound messages may omit `type` and may use the camelCase field names
/// of the browser `RTCIceCandidateInit` dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateMessage {
    #[serde(rename = "type", default = "ice_candidate_type")]
    pub kind: String,
    pub candidate: String,
    #[serde(default, alias = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(default, alias = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

fn ice_candidate_type() -> String {
    ICE_CANDIDATE_TYPE.to_string()
}

impl From<RTCIceCandidateInit> for IceCandidateMessage {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            kind: ice_candidate_type(),
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
        }
    }
}

impl From<IceCandidateMessage> for RTCIceCandidateInit {
    fn from(msg: IceCandidateMessage) -> Self {
        RTCIceCandidateInit {
            candidate: msg.candidate,
            sdp_mid: msg.sdp_mid,
            sdp_mline_index: msg.sdp_mline_index,
            username_fragment: None,
        }
    }
}

/// Outbound signaling payloads
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Configure(ConfigureMessage),
    Description(RTCSessionDescription),
    Candidate(IceCandidateMessage),
}

impl OutboundMessage {
    pub fn to_json(&self) -> Result<String> {
        let json = match self {
            OutboundMessage::Configure(msg) => serde_json::to_string(msg)?,
            OutboundMessage::Description(desc) => serde_json::to_string(desc)?,
            OutboundMessage::Candidate(msg) => serde_json::to_string(msg)?,
        };
        Ok(json)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Configure(_) => "configure",
            OutboundMessage::Description(_) => "description",
            OutboundMessage::Candidate(_) => "candidate",
        }
    }
}

pub fn parse_configure(text: &str) -> Result<StreamSetup> {
    let msg: ConfigureMessage = serde_json::from_str(text)
        .map_err(|e| Error::ProtocolError(format!("not a configure message: {}", e)))?;
    msg.validate()
}

pub fn parse_description(text: &str) -> Result<RTCSessionDescription> {
    let desc: RTCSessionDescription = serde_json::from_str(text)
        .map_err(|e| Error::SdpError(format!("not a session description: {}", e)))?;
    if desc.sdp.is_empty() {
        return Err(Error::SdpError("session description has no SDP".to_string()));
    }
    Ok(desc)
}

pub fn parse_candidate(text: &str) -> Result<RTCIceCandidateInit> {
    let msg: IceCandidateMessage = serde_json::from_str(text)
        .map_err(|e| Error::IceCandidateError(format!("not an ICE candidate: {}", e)))?;
    if msg.kind != ICE_CANDIDATE_TYPE {
        return Err(Error::IceCandidateError(format!(
            "unexpected message type '{}'",
            msg.kind
        )));
    }
    Ok(msg.into())
}

/// Rewrite an answer for the remote end
///
/// Advertises trickle ICE and re-enables a video section the local stack
/// rejected with port 0.
pub fn munge_answer_sdp(sdp: &str) -> String {
    let mut sdp = sdp.replacen("m=video 0 ", "m=video 9 ", 1);
    if !sdp.contains("a=ice-options:trickle") {
        if !sdp.is_empty() && !sdp.ends_with("\r\n") {
            sdp.push_str("\r\n");
        }
        sdp.push_str("a=ice-options:trickle\r\n");
    }
    sdp
}
