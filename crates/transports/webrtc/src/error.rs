//! Error types for the WebRTC bridge

use crate::media::codec::CodecError;

/// Result type alias using the bridge Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in bridge operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling connection error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Malformed or out-of-order signaling message
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannelError(String),

    /// Media track read/write error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// Video codec error
    #[error("Codec error: {0}")]
    CodecError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Data channel payload whose type could not be resolved
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// The session was torn down after a fatal failure
    #[error("Session failed: {0}")]
    SessionFailed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is a configuration error (fatal at startup only)
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Protocol errors are logged and the offending message dropped
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Error::ProtocolError(_) | Error::SerializationError(_) | Error::UnknownMessageType(_)
        )
    }

    /// Transport errors terminate the affected session
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_)
                | Error::WebSocketError(_)
                | Error::WebRtcError(_)
                | Error::SdpError(_)
                | Error::MediaTrackError(_)
                | Error::DataChannelError(_)
                | Error::SessionFailed(_)
                | Error::IoError(_)
        )
    }

    /// Codec errors only drop the current sample or frame
    pub fn is_codec_error(&self) -> bool {
        matches!(self, Error::CodecError(_))
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Error::CodecError(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::WebRtcError(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocketError(e.to_string())
    }
}
