//! Session supervisors for both bridge modes
//!
//! The sender listens for receivers and serves one session at a time; a
//! failed session is logged and the server goes back to accepting. The
//! receiver dials the sender once and returns when its session ends.

use crate::bus::MessageBus;
use crate::channels::TypeRegistry;
use crate::config::{BridgeConfig, Mode};
use crate::media::codec::Vp8Codec;
use crate::peer::{drive_signaling, receiver, sender, PeerContext};
use crate::session::{DoneSignal, SessionEvent, SessionReporter};
use crate::signaling::{client, ConfigureMessage, SignalingChannel, SignalingEvent, SignalingServer};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct Bridge {
    ctx: PeerContext,
}

impl Bridge {
    pub fn new(config: BridgeConfig, bus: Arc<dyn MessageBus>, codec: Arc<dyn Vp8Codec>) -> Self {
        Self {
            ctx: PeerContext {
                config: Arc::new(config),
                bus,
                codec,
                registry: Arc::new(TypeRegistry::standard()),
            },
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.ctx.config
    }

    /// Run in the configured mode until `shutdown` closes
    pub async fn run(&self, shutdown: DoneSignal) -> Result<()> {
        match self.ctx.config.mode {
            Mode::Sender => self.run_sender(shutdown).await,
            Mode::Receiver => self.run_receiver(shutdown).await,
        }
    }

    /// Accept receivers on the configured address, one session at a time
    pub async fn run_sender(&self, shutdown: DoneSignal) -> Result<()> {
        let mut server = SignalingServer::bind(&self.ctx.config.addr).await?;

        loop {
            let channel = tokio::select! {
                _ = shutdown.closed() => break,
                channel = server.next_session() => match channel {
                    Some(channel) => channel,
                    None => break,
                },
            };
            let peer_addr = channel.peer_addr();
            match self.serve_sender_session(channel, &shutdown).await {
                SessionEvent::Failed(reason) => {
                    warn!(?peer_addr, "Session failed, waiting for the next receiver: {}", reason)
                }
                _ => info!(?peer_addr, "Session ended"),
            }
        }

        server.shutdown();
        info!("Sender stopped");
        Ok(())
    }

    async fn serve_sender_session(
        &self,
        mut channel: SignalingChannel,
        shutdown: &DoneSignal,
    ) -> SessionEvent {
        let setup = loop {
            let event = tokio::select! {
                _ = shutdown.closed() => {
                    channel.close();
                    return SessionEvent::Closed;
                }
                event = channel.next_event() => event,
            };
            match event {
                Some(SignalingEvent::Configure(setup)) => break setup,
                Some(SignalingEvent::Closed) | None => return SessionEvent::Closed,
                Some(other) => debug!(?other, "Ignoring signaling event before configure"),
            }
        };

        let (signaling, events, done) = channel.into_parts();
        let (reporter, outcomes) = SessionReporter::new(uuid::Uuid::new_v4().to_string(), done);
        match sender::start(&self.ctx, setup, signaling, reporter.clone()).await {
            Ok(link) => {
                tokio::spawn(drive_signaling(link, events));
            }
            Err(e) => reporter.fail(e.to_string()),
        }
        await_outcome(&reporter, outcomes, shutdown).await
    }

    /// Dial the sender and run one session
    ///
    /// # Errors
    ///
    /// `SignalingError` if the sender already has a receiver, and
    /// `SessionFailed` if the session ends in failure.
    pub async fn run_receiver(&self, shutdown: DoneSignal) -> Result<()> {
        let config = &self.ctx.config;
        let topic = config
            .image_topic()
            .or_else(|| config.topics.first())
            .ok_or_else(|| Error::InvalidConfig("no topics configured".to_string()))?;

        let channel = client::connect(&config.addr, ConfigureMessage::for_topic(&topic.name_in)).await?;
        let (signaling, events, done) = channel.into_parts();
        let (reporter, outcomes) = SessionReporter::new(uuid::Uuid::new_v4().to_string(), done);
        match receiver::start(&self.ctx, signaling, reporter.clone()).await {
            Ok(link) => {
                tokio::spawn(drive_signaling(link, events));
            }
            Err(e) => reporter.fail(e.to_string()),
        }

        match await_outcome(&reporter, outcomes, &shutdown).await {
            SessionEvent::Failed(reason) => Err(Error::SessionFailed(reason)),
            _ => {
                info!("Receiver stopped");
                Ok(())
            }
        }
    }
}

/// Wait for the session's terminal event, closing it on shutdown
async fn await_outcome(
    reporter: &SessionReporter,
    mut outcomes: mpsc::UnboundedReceiver<SessionEvent>,
    shutdown: &DoneSignal,
) -> SessionEvent {
    loop {
        let event = tokio::select! {
            _ = shutdown.closed(), if !reporter.done().is_closed() => {
                reporter.close();
                continue;
            }
            event = outcomes.recv() => event,
        };
        match event {
            Some(SessionEvent::Connected) => {
                info!(session_id = reporter.session_id(), "Peer connected")
            }
            Some(terminal) => return terminal,
            None => return SessionEvent::Closed,
        }
    }
}
