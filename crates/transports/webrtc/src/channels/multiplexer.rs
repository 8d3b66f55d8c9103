//! Data channel application protocol
//!
//! Outbound, image messages go to the video path and every other type is
//! framed as tag + body for the data channel. Inbound, the tag selects the
//! codec; untagged or unknown frames fall back to probing every registered
//! type in registration order.

use super::messages::{encode_frame, parse_frame, FrameHeader, MAX_MESSAGE_SIZE};
use super::registry::TypeRegistry;
use crate::bandwidth::BandwidthManager;
use crate::msgs::{BusMessage, Image};
use crate::session::DoneSignal;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Where an outbound message goes
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// To the encoder and the video track
    Video(Image),
    /// To the data channel as a tagged frame
    Data {
        type_name: &'static str,
        frame: Bytes,
    },
}

/// How an inbound frame was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The tag named a registered type
    Tagged,
    /// No usable tag; a registered type was found by probing
    Probed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub message: BusMessage,
    pub resolution: Resolution,
}

pub struct MessageMultiplexer {
    registry: Arc<TypeRegistry>,
    bandwidth: Option<Arc<BandwidthManager>>,
}

impl MessageMultiplexer {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            bandwidth: None,
        }
    }

    /// Report data channel traffic to `bandwidth`
    pub fn with_bandwidth(mut self, bandwidth: Arc<BandwidthManager>) -> Self {
        self.bandwidth = Some(bandwidth);
        self
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Frame a message as tag + body regardless of its type
    pub fn encode(&self, msg: &BusMessage) -> Result<Bytes> {
        let body = self.registry.encode(msg)?;
        Ok(encode_frame(msg.type_name(), &body))
    }

    /// Split image messages from everything else
    pub fn route(&self, msg: BusMessage) -> Result<Outbound> {
        match msg {
            BusMessage::Image(image) => Ok(Outbound::Video(image)),
            other => {
                let frame = self.encode(&other)?;
                Ok(Outbound::Data {
                    type_name: other.type_name(),
                    frame,
                })
            }
        }
    }

    /// Account a frame that went out on the data channel
    pub fn record_sent(&self, type_name: &str, bytes: usize) {
        if let Some(bandwidth) = &self.bandwidth {
            bandwidth.register_message_traffic(type_name, bytes);
        }
    }

    /// Decode one inbound data channel message
    ///
    /// # Errors
    ///
    /// `SerializationError` when a registered tag's body does not parse (the
    /// message is dropped without probing), `UnknownMessageType` when probing
    /// finds no match.
    pub fn decode(&self, data: &[u8]) -> Result<Decoded> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(Error::ProtocolError(format!(
                "data channel message of {} bytes exceeds limit",
                data.len()
            )));
        }

        match parse_frame(data) {
            FrameHeader::Tagged { key, body } => match self.registry.lookup(key) {
                Some(codec) => (codec.decode)(body)
                    .map(|message| Decoded {
                        message,
                        resolution: Resolution::Tagged,
                    })
                    .map_err(|e| {
                        Error::SerializationError(format!(
                            "body tagged {} failed to decode: {}",
                            codec.type_name, e
                        ))
                    }),
                None => {
                    debug!(tag = key, "Unknown type tag, probing registered types");
                    self.probe(data)
                }
            },
            FrameHeader::Blank { body } => self.probe(body).or_else(|_| self.probe(data)),
            FrameHeader::Missing => self.probe(data),
        }
    }

    fn probe(&self, data: &[u8]) -> Result<Decoded> {
        for codec in self.registry.codecs() {
            if let Ok(message) = (codec.decode)(data) {
                debug!(msg_type = codec.type_name, "Resolved untagged message by probing");
                return Ok(Decoded {
                    message,
                    resolution: Resolution::Probed,
                });
            }
        }
        Err(Error::UnknownMessageType(format!(
            "no registered type matches {} byte message",
            data.len()
        )))
    }
}

/// Destination for framed data channel messages
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, frame: Bytes) -> Result<()>;
}

#[async_trait]
impl FrameSink for webrtc::data_channel::RTCDataChannel {
    async fn send_frame(&self, frame: Bytes) -> Result<()> {
        self.send(&frame)
            .await
            .map(|_| ())
            .map_err(|e| Error::DataChannelError(e.to_string()))
    }
}

/// Sender-side dispatch loop
///
/// Drains `rx` in order: images are forwarded to `video_tx` (dropped when the
/// encoder is behind), everything else is framed and sent on `sink`. One
/// queue feeds both paths, so messages of a type keep their order.
pub async fn run_dispatcher(
    mux: Arc<MessageMultiplexer>,
    mut rx: mpsc::Receiver<BusMessage>,
    video_tx: Option<mpsc::Sender<Image>>,
    sink: Arc<dyn FrameSink>,
    done: DoneSignal,
) {
    info!("Message dispatcher started");
    loop {
        let msg = tokio::select! {
            _ = done.closed() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let type_name = msg.type_name();
        match mux.route(msg) {
            Ok(Outbound::Video(image)) => match &video_tx {
                Some(tx) => {
                    if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(image) {
                        debug!("Encoder busy, dropping image");
                    }
                }
                None => debug!("No video path, dropping image"),
            },
            Ok(Outbound::Data { type_name, frame }) => {
                let len = frame.len();
                match sink.send_frame(frame).await {
                    Ok(()) => mux.record_sent(type_name, len),
                    Err(e) => warn!(msg_type = type_name, "Failed to send message: {}", e),
                }
            }
            Err(e) => warn!(msg_type = type_name, "Failed to encode message: {}", e),
        }
    }
    info!("Message dispatcher stopped");
}
