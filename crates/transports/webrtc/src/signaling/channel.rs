//! One signaling connection: a reader task, a writer task and two queues
//!
//! Outbound messages go through an unbounded queue drained by a single writer
//! task, so callers can send from synchronous callbacks and the wire order is
//! the enqueue order. Inbound frames are classified by [`Handshake`] and
//! delivered as [`SignalingEvent`]s. A read or write failure closes the
//! connection's [`DoneSignal`] and ends the event stream with
//! [`SignalingEvent::Closed`].

use super::handshake::{Handshake, Role, SignalingEvent};
use super::protocol::{ConfigureMessage, IceCandidateMessage, OutboundMessage};
use crate::session::DoneSignal;
use crate::{Error, Result};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Cloneable handle for queueing outbound signaling messages
#[derive(Clone)]
pub struct SignalingSender {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl SignalingSender {
    fn enqueue(&self, msg: OutboundMessage) -> Result<()> {
        let kind = msg.kind();
        self.tx
            .send(msg)
            .map_err(|_| Error::SignalingError(format!("connection closed, {} not sent", kind)))
    }

    pub fn send_configure(&self, msg: ConfigureMessage) -> Result<()> {
        self.enqueue(OutboundMessage::Configure(msg))
    }

    pub fn send_description(&self, desc: RTCSessionDescription) -> Result<()> {
        self.enqueue(OutboundMessage::Description(desc))
    }

    pub fn send_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.enqueue(OutboundMessage::Candidate(IceCandidateMessage::from(candidate)))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Sender whose messages land in the returned queue instead of a socket
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

/// A live signaling connection
pub struct SignalingChannel {
    sender: SignalingSender,
    events: mpsc::UnboundedReceiver<SignalingEvent>,
    done: DoneSignal,
    peer_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.done.is_closed())
            .finish()
    }
}

impl SignalingChannel {
    /// Start the reader and writer tasks over an upgraded WebSocket
    ///
    /// `guard` is held by the reader task and dropped when the connection ends.
    pub(crate) fn spawn<S, G>(
        ws: WebSocketStream<S>,
        role: Role,
        peer_addr: Option<SocketAddr>,
        guard: G,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        G: Send + 'static,
    {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundMessage>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let done = DoneSignal::new();

        let writer_done = done.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = writer_done.closed() => break,
                    msg = out_rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                let json = match msg.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to serialize outbound {}: {}", msg.kind(), e);
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::Text(json)).await {
                    warn!("Signaling write failed: {}", e);
                    writer_done.close();
                    break;
                }
                debug!(kind = msg.kind(), "Sent signaling message");
            }
            let _ = ws_tx.close().await;
            debug!("Signaling writer stopped");
        });

        let reader_done = done.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let mut handshake = Handshake::new(role);
            loop {
                let frame = tokio::select! {
                    _ = reader_done.closed() => break,
                    frame = ws_rx.next() => frame,
                };
                match frame {
                    Some(Ok(Message::Text(text))) => match handshake.on_message(&text) {
                        Ok(event) => {
                            if event_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(
                            state = ?handshake.state(),
                            "Skipping malformed signaling message: {}", e
                        ),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Signaling connection closed by remote");
                        break;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!(len = data.len(), "Ignoring binary signaling frame");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Signaling read failed: {}", e);
                        break;
                    }
                }
            }
            reader_done.close();
            let _ = event_tx.send(SignalingEvent::Closed);
            debug!("Signaling reader stopped");
        });

        Self {
            sender: SignalingSender { tx: out_tx },
            events: event_rx,
            done,
            peer_addr,
        }
    }

    pub fn sender(&self) -> SignalingSender {
        self.sender.clone()
    }

    pub fn send_description(&self, desc: RTCSessionDescription) -> Result<()> {
        self.sender.send_description(desc)
    }

    pub fn send_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.sender.send_candidate(candidate)
    }

    /// Next inbound event; `None` once the connection is gone and drained
    pub async fn next_event(&mut self) -> Option<SignalingEvent> {
        self.events.recv().await
    }

    pub fn done(&self) -> DoneSignal {
        self.done.clone()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Close the connection; both tasks exit
    pub fn close(&self) {
        self.done.close();
    }

    /// Split into the outbound handle, the event stream and the done signal
    pub fn into_parts(
        self,
    ) -> (
        SignalingSender,
        mpsc::UnboundedReceiver<SignalingEvent>,
        DoneSignal,
    ) {
        (self.sender, self.events, self.done)
    }
}
