//! Signaling server (sender side)
//!
//! Accepts WebSocket upgrades on [`SIGNALING_PATH`] and hands each accepted
//! connection to the owner as a [`SignalingChannel`]. Only one receiver may
//! be connected at a time: while a channel is live, further upgrade requests
//! are answered with HTTP 409 and the live session is left alone. The slot
//! is taken when the upgrade request is accepted, not when the TCP
//! connection is.

use super::channel::SignalingChannel;
use super::handshake::Role;
use super::protocol::{ALREADY_CONNECTED, SIGNALING_PATH};
use crate::session::DoneSignal;
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, warn};

/// Upper bound on the HTTP upgrade, from accept to response
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Marks the single receiver slot as taken until dropped
struct ReceiverSlot {
    busy: Arc<AtomicBool>,
}

impl ReceiverSlot {
    fn try_claim(busy: &Arc<AtomicBool>) -> Option<Self> {
        busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                busy: Arc::clone(busy),
            })
    }
}

impl Drop for ReceiverSlot {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
        debug!("Receiver slot released");
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Accepts at most one receiver at a time
///
/// ```
/// # tokio_test::block_on(async {
/// use wrb_webrtc::SignalingServer;
///
/// let server = SignalingServer::bind("127.0.0.1:0").await.unwrap();
/// assert_ne!(server.local_addr().port(), 0);
/// assert!(!server.has_receiver());
/// server.shutdown();
/// # });
/// ```
pub struct SignalingServer {
    local_addr: SocketAddr,
    sessions: mpsc::Receiver<SignalingChannel>,
    busy: Arc<AtomicBool>,
    shutdown: DoneSignal,
}

impl SignalingServer {
    /// Bind `addr` and start accepting in the background
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::SignalingError(format!("failed to bind {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;
        let busy = Arc::new(AtomicBool::new(false));
        let shutdown = DoneSignal::new();
        let (session_tx, sessions) = mpsc::channel(1);

        info!("Signaling server listening on ws://{}{}", local_addr, SIGNALING_PATH);

        let accept_busy = Arc::clone(&busy);
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = tokio::select! {
                    _ = accept_shutdown.closed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Failed to accept signaling connection: {}", e);
                            continue;
                        }
                    },
                };
                let busy = Arc::clone(&accept_busy);
                let session_tx = session_tx.clone();
                tokio::spawn(async move {
                    match upgrade(stream, peer_addr, &busy).await {
                        Ok(Some(channel)) => {
                            if session_tx.send(channel).await.is_err() {
                                debug!("Signaling server dropped, discarding connection");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(%peer_addr, "Signaling upgrade failed: {}", e),
                    }
                });
            }
            info!("Signaling server stopped accepting");
        });

        Ok(Self {
            local_addr,
            sessions,
            busy,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next receiver; `None` after shutdown
    pub async fn next_session(&mut self) -> Option<SignalingChannel> {
        tokio::select! {
            _ = self.shutdown.closed() => None,
            channel = self.sessions.recv() => channel,
        }
    }

    /// Whether a receiver currently holds the slot
    pub fn has_receiver(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.shutdown.close();
    }
}

impl Drop for SignalingServer {
    fn drop(&mut self) {
        self.shutdown.close();
    }
}

/// Run the HTTP upgrade; `Ok(None)` when the request was rejected
///
/// The receiver slot is claimed only once a well-formed request for
/// [`SIGNALING_PATH`] arrives, so idle or stalled sockets never hold it.
async fn upgrade(
    stream: TcpStream,
    peer_addr: SocketAddr,
    busy: &Arc<AtomicBool>,
) -> Result<Option<SignalingChannel>> {
    let mut slot = None;
    let callback = |req: &Request, response: Response| {
        if req.uri().path() != SIGNALING_PATH {
            return Err(reject(StatusCode::NOT_FOUND, "not found"));
        }
        match ReceiverSlot::try_claim(busy) {
            Some(claimed) => {
                slot = Some(claimed);
                Ok(response)
            }
            None => Err(reject(StatusCode::CONFLICT, ALREADY_CONNECTED)),
        }
    };

    let handshake = timeout(HANDSHAKE_TIMEOUT, accept_hdr_async(stream, callback)).await;
    let ws = match handshake {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) if slot.is_none() => {
            warn!(%peer_addr, "Rejected signaling request: {}", e);
            return Ok(None);
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            warn!(%peer_addr, "Signaling handshake timed out after {:?}", HANDSHAKE_TIMEOUT);
            return Ok(None);
        }
    };

    let Some(slot) = slot else {
        return Ok(None);
    };
    info!(%peer_addr, "New receiver connected");
    Ok(Some(SignalingChannel::spawn(
        ws,
        Role::Server,
        Some(peer_addr),
        slot,
    )))
}
