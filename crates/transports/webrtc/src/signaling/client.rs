//! Signaling client (receiver side)

use super::channel::SignalingChannel;
use super::handshake::Role;
use super::protocol::{ConfigureMessage, ALREADY_CONNECTED, SIGNALING_PATH};
use crate::{Error, Result};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::info;

/// WebSocket URL of the signaling endpoint at `addr` (`host:port`)
pub fn signaling_url(addr: &str) -> String {
    format!("ws://{}{}", addr, SIGNALING_PATH)
}

/// Dial the sender and open the session with `configure`
///
/// # Errors
///
/// `SignalingError` if the server already has a receiver (HTTP 409),
/// `WebSocketError` for any other connection failure.
pub async fn connect(addr: &str, configure: ConfigureMessage) -> Result<SignalingChannel> {
    let url = signaling_url(addr);
    info!("Connecting to signaling server at {}", url);

    let (ws, _response) = connect_async(url.as_str()).await.map_err(|e| match e {
        WsError::Http(response) if response.status() == StatusCode::CONFLICT => {
            Error::SignalingError(format!("{} rejected us: {}", addr, ALREADY_CONNECTED))
        }
        other => Error::from(other),
    })?;
    info!("Connected to signaling server");

    let channel = SignalingChannel::spawn(ws, Role::Client, None, ());
    channel.sender().send_configure(configure)?;
    Ok(channel)
}
