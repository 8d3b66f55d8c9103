//! Receiver side of a session
//!
//! Accepts one VP8 video track and the sender's data channel. Video is
//! reassembled, decoded and published on the image topic; data channel
//! messages are decoded by the multiplexer and published on the topic
//! configured for their type.

use super::connection::{new_peer_connection, PeerLink};
use super::PeerContext;
use crate::bus::{node_name, FpsMeter, MessageBus};
use crate::channels::messages::MSG_IMAGE;
use crate::channels::MessageMultiplexer;
use crate::config::{BridgeConfig, Mode};
use crate::media::image::rgb_to_image;
use crate::media::reassembler::{FrameReassembler, RtpPacket};
use crate::msgs::BusMessage;
use crate::session::{DoneSignal, SessionReporter};
use crate::signaling::SignalingSender;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;

/// Keyframe request period for each inbound video track
pub const PLI_INTERVAL: Duration = Duration::from_secs(3);

/// Text sent to the sender when the data channel opens
pub const GREETING: &str = "Hello from receiver!";

/// Output topic per message type
#[derive(Debug, Clone, Default)]
pub struct TopicRoutes {
    image: Option<String>,
    by_type: HashMap<String, String>,
}

impl TopicRoutes {
    /// Routes from the configured topics; the first topic of a type wins
    pub fn from_config(config: &BridgeConfig) -> Self {
        let mut by_type = HashMap::new();
        for topic in config.data_topics() {
            by_type
                .entry(topic.msg_type.clone())
                .or_insert_with(|| topic.name_out.clone());
        }
        Self {
            image: config.image_topic().map(|topic| topic.name_out.clone()),
            by_type,
        }
    }

    pub fn image_topic(&self) -> Option<&str> {
        self.image.as_deref()
    }

    pub fn topic_for(&self, type_name: &str) -> Option<&str> {
        self.by_type.get(type_name).map(String::as_str)
    }
}

/// Set up the receiver peer; the offer arrives through signaling
pub async fn start(
    ctx: &PeerContext,
    signaling: SignalingSender,
    reporter: SessionReporter,
) -> Result<Arc<PeerLink>> {
    info!(session_id = reporter.session_id(), "Starting receiver session");

    let pc = new_peer_connection(&ctx.config.ice_servers, RTCRtpTransceiverDirection::Recvonly)
        .await?;
    let link = PeerLink::new(Arc::clone(&pc), signaling, reporter.clone());

    pc.add_transceiver_from_kind(
        RTPCodecType::Video,
        Some(RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        }),
    )
    .await
    .map_err(|e| Error::WebRtcError(format!("Failed to add video transceiver: {}", e)))?;

    let routes = Arc::new(TopicRoutes::from_config(&ctx.config));

    let weak_pc = Arc::downgrade(&pc);
    let track_ctx = ctx.clone();
    let track_routes = Arc::clone(&routes);
    let track_reporter = reporter.clone();
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        if track.kind() == RTPCodecType::Video {
            info!(
                ssrc = track.ssrc(),
                stream_id = %track.stream_id(),
                "Received video track"
            );
            let track_done = DoneSignal::new();
            tokio::spawn(run_pli_ticker(
                weak_pc.clone(),
                track.ssrc(),
                track_reporter.done().clone(),
                track_done.clone(),
            ));
            tokio::spawn(run_track_reader(
                track,
                FrameReassembler::new(Arc::clone(&track_ctx.codec)),
                Arc::clone(&track_ctx.bus),
                track_routes.image_topic().map(str::to_owned),
                track_reporter.clone(),
                track_done,
            ));
        } else {
            debug!(kind = %track.kind(), "Ignoring non-video track");
        }
        Box::pin(async {})
    }));

    let mux = Arc::new(MessageMultiplexer::new(Arc::clone(&ctx.registry)));
    let bus = Arc::clone(&ctx.bus);
    pc.on_data_channel(Box::new(move |data_channel: Arc<RTCDataChannel>| {
        info!(label = data_channel.label(), "Data channel announced");
        wire_data_channel(
            &data_channel,
            Arc::clone(&mux),
            Arc::clone(&bus),
            Arc::clone(&routes),
        );
        Box::pin(async {})
    }));

    Ok(link)
}

fn wire_data_channel(
    data_channel: &Arc<RTCDataChannel>,
    mux: Arc<MessageMultiplexer>,
    bus: Arc<dyn MessageBus>,
    routes: Arc<TopicRoutes>,
) {
    let greeter = Arc::clone(data_channel);
    data_channel.on_open(Box::new(move || {
        Box::pin(async move {
            info!(label = greeter.label(), id = greeter.id(), "Data channel open");
            if let Err(e) = greeter.send_text(GREETING.to_string()).await {
                warn!("Failed to greet sender: {}", e);
            }
        })
    }));

    data_channel.on_message(Box::new(move |msg: DataChannelMessage| {
        if msg.is_string {
            debug!(len = msg.data.len(), "Ignoring text message on data channel");
        } else {
            deliver(&mux, bus.as_ref(), &routes, &msg.data);
        }
        Box::pin(async {})
    }));
}

/// Decode one data channel frame and publish it; failures drop the frame
pub fn deliver(mux: &MessageMultiplexer, bus: &dyn MessageBus, routes: &TopicRoutes, data: &[u8]) {
    let decoded = match mux.decode(data) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(len = data.len(), "Dropping data channel message: {}", e);
            return;
        }
    };
    let type_name = decoded.message.type_name();
    let Some(topic) = routes.topic_for(type_name) else {
        debug!(msg_type = type_name, "No topic configured, dropping message");
        return;
    };
    if let Err(e) = bus.publish(topic, decoded.message) {
        warn!(msg_type = type_name, topic, "Failed to publish: {}", e);
    }
}

async fn run_pli_ticker(
    pc: Weak<RTCPeerConnection>,
    media_ssrc: u32,
    session_done: DoneSignal,
    track_done: DoneSignal,
) {
    let mut ticker = tokio::time::interval(PLI_INTERVAL);
    loop {
        tokio::select! {
            _ = session_done.closed() => break,
            _ = track_done.closed() => break,
            _ = ticker.tick() => {}
        }
        let Some(pc) = pc.upgrade() else {
            break;
        };
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        };
        if let Err(e) = pc.write_rtcp(&[Box::new(pli)]).await {
            debug!(media_ssrc, "Failed to send PLI: {}", e);
        }
    }
    debug!(media_ssrc, "PLI ticker stopped");
}

async fn run_track_reader(
    track: Arc<TrackRemote>,
    mut reassembler: FrameReassembler,
    bus: Arc<dyn MessageBus>,
    topic: Option<String>,
    reporter: SessionReporter,
    track_done: DoneSignal,
) {
    let done = reporter.done().clone();
    let frame_id = track.stream_id();
    let mut fps = FpsMeter::new(match &topic {
        Some(topic) => node_name(Mode::Receiver, MSG_IMAGE, topic),
        None => "video".to_string(),
    });

    loop {
        let read = tokio::select! {
            _ = done.closed() => break,
            read = track.read_rtp() => read,
        };
        let packet = match read {
            Ok((packet, _)) => packet,
            Err(e) => {
                if !done.is_closed() {
                    reporter.fail(format!("video track read failed: {}", e));
                }
                break;
            }
        };

        for frame in reassembler.push(RtpPacket::from(&packet)) {
            let image = match rgb_to_image(frame.image, &frame_id) {
                Ok(image) => image,
                Err(e) => {
                    warn!("Dropping decoded frame: {}", e);
                    continue;
                }
            };
            fps.tick();
            if let Some(topic) = &topic {
                if let Err(e) = bus.publish(topic, BusMessage::Image(image)) {
                    warn!(topic = %topic, "Failed to publish image: {}", e);
                }
            }
        }
    }

    track_done.close();
    let stats = reassembler.stats();
    info!(
        packets = stats.packets_received,
        frames = stats.frames_decoded,
        dropped_gap = stats.samples_dropped_gap,
        codec_errors = stats.codec_errors,
        "Video track reader stopped"
    );
}
