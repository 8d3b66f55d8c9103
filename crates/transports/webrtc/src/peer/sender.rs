//! Sender side of a session
//!
//! Publishes one VP8 track and the `data` channel. Bus messages from every
//! configured topic are merged into one queue and handed to the dispatcher:
//! images go to the encode loop and out on the track, everything else is
//! framed by the multiplexer and sent on the data channel once it is open.

use super::connection::{new_peer_connection, vp8_capability, PeerLink};
use super::PeerContext;
use crate::bandwidth::{BandwidthManager, BitrateWatch, EncoderSlot};
use crate::bus::node_name;
use crate::channels::{run_dispatcher, FrameSink, MessageMultiplexer};
use crate::media::codec::{Vp8Codec, Vp8Encoder};
use crate::media::image::image_to_rgba;
use crate::msgs::{BusMessage, Image};
use crate::session::{DoneSignal, SessionReporter};
use crate::signaling::{SignalingSender, StreamSetup};
use crate::{Error, Result};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Label of the data channel created by the sender
pub const DATA_CHANNEL_LABEL: &str = "data";

/// Images waiting for the encoder; newer images are dropped beyond this
const VIDEO_QUEUE_DEPTH: usize = 2;

/// Merged bus queue depth
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Set up the sender peer for `setup` and send the offer
///
/// The returned link still needs its signaling events driven. Everything
/// spawned here exits when the reporter's done signal closes.
pub async fn start(
    ctx: &PeerContext,
    setup: StreamSetup,
    signaling: SignalingSender,
    reporter: SessionReporter,
) -> Result<Arc<PeerLink>> {
    let done = reporter.done().clone();
    info!(
        session_id = reporter.session_id(),
        stream_id = %setup.stream_id,
        track_id = %setup.track_id,
        src = %setup.src,
        "Starting sender session"
    );

    let pc = new_peer_connection(&ctx.config.ice_servers, RTCRtpTransceiverDirection::Sendonly)
        .await?;
    let link = PeerLink::new(Arc::clone(&pc), signaling, reporter);

    let track = Arc::new(TrackLocalStaticSample::new(
        vp8_capability(),
        setup.track_id.clone(),
        setup.stream_id.clone(),
    ));
    let rtp_sender = pc
        .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(|e| Error::WebRtcError(format!("Failed to add video track: {}", e)))?;

    // RTCP has to be read for the interceptors (NACK, REMB) to run
    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; 1500];
        while let Ok((_, _)) = rtp_sender.read(&mut rtcp_buf).await {}
        debug!("RTCP reader stopped");
    });

    let data_channel = pc
        .create_data_channel(DATA_CHANNEL_LABEL, None)
        .await
        .map_err(|e| Error::DataChannelError(format!("Failed to create data channel: {}", e)))?;
    let opened = Arc::new(Notify::new());
    wire_data_channel(&data_channel, Arc::clone(&opened));

    let bandwidth = Arc::new(BandwidthManager::new(ctx.config.bandwidth.clone()));
    bandwidth.start();
    {
        let bandwidth = Arc::clone(&bandwidth);
        let done = done.clone();
        tokio::spawn(async move {
            done.closed().await;
            bandwidth.stop();
        });
    }

    let outbound = subscribe_topics(ctx, &done)?;

    let frame_interval = ctx
        .config
        .image_topic()
        .map(|topic| topic.frame_interval())
        .unwrap_or_else(|| Duration::from_secs_f64(1.0 / 30.0));
    let (video_tx, video_rx) = mpsc::channel(VIDEO_QUEUE_DEPTH);
    let encoder = FrameEncoder::new(Arc::clone(&ctx.codec), Arc::clone(&bandwidth));
    tokio::spawn(run_encode_loop(
        encoder,
        video_rx,
        track,
        frame_interval,
        done.clone(),
    ));

    let mux = Arc::new(
        MessageMultiplexer::new(Arc::clone(&ctx.registry)).with_bandwidth(Arc::clone(&bandwidth)),
    );
    let sink: Arc<dyn FrameSink> = data_channel;
    {
        let done = done.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = done.closed() => return,
                _ = opened.notified() => {}
            }
            run_dispatcher(mux, outbound, Some(video_tx), sink, done).await;
        });
    }

    link.create_offer().await?;
    Ok(link)
}

fn wire_data_channel(data_channel: &Arc<RTCDataChannel>, opened: Arc<Notify>) {
    let label = data_channel.label().to_owned();
    data_channel.on_open(Box::new(move || {
        info!(label = %label, "Data channel open");
        opened.notify_one();
        Box::pin(async {})
    }));

    data_channel.on_message(Box::new(move |msg: DataChannelMessage| {
        if msg.is_string {
            info!(
                "Message from receiver: {}",
                String::from_utf8_lossy(&msg.data)
            );
        } else {
            debug!(len = msg.data.len(), "Ignoring binary message from receiver");
        }
        Box::pin(async {})
    }));
}

/// Subscribe every configured topic and merge them into one queue
///
/// Each topic is forwarded by its own task, so messages of one topic keep
/// their order.
fn subscribe_topics(ctx: &PeerContext, done: &DoneSignal) -> Result<mpsc::Receiver<BusMessage>> {
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    for topic in &ctx.config.topics {
        let mut sub = ctx.bus.subscribe(&topic.name_in, &topic.msg_type)?;
        let tx = tx.clone();
        let done = done.clone();
        let name = topic.name_in.clone();
        info!(
            topic = %name,
            msg_type = %topic.msg_type,
            node = %node_name(ctx.config.mode, &topic.msg_type, &topic.name_out),
            qos = ?topic.qos_or_default(),
            "Subscribed"
        );
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = done.closed() => break,
                    msg = sub.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
            debug!(topic = %name, "Topic forwarder stopped");
        });
    }
    Ok(rx)
}

struct ActiveEncoder {
    encoder: Box<dyn Vp8Encoder>,
    dimensions: (u32, u32),
    bitrate: Option<watch::Receiver<u32>>,
}

/// Owns the VP8 encode context for one session
///
/// The context is (re)created whenever the image geometry changes and is
/// registered with the bandwidth manager, adjustable or fixed depending on
/// what the encoder supports.
pub struct FrameEncoder {
    codec: Arc<dyn Vp8Codec>,
    bandwidth: Arc<BandwidthManager>,
    active: Option<ActiveEncoder>,
    /// Geometry whose init already failed; not retried or re-logged
    failed: Option<(u32, u32)>,
}

impl FrameEncoder {
    pub fn new(codec: Arc<dyn Vp8Codec>, bandwidth: Arc<BandwidthManager>) -> Self {
        Self {
            codec,
            bandwidth,
            active: None,
            failed: None,
        }
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.active.as_ref().map(|active| active.dimensions)
    }

    /// Encode one bus image
    ///
    /// `Ok(None)` when no encoder can be created for this geometry.
    pub fn encode(&mut self, image: &Image) -> Result<Option<Bytes>> {
        let frame = image_to_rgba(image)?;
        let dimensions = (frame.width, frame.height);

        if self.dimensions() != Some(dimensions) && !self.init(dimensions) {
            return Ok(None);
        }
        let Some(active) = self.active.as_mut() else {
            return Ok(None);
        };

        if let Some(rx) = active.bitrate.as_mut() {
            if rx.has_changed().unwrap_or(false) {
                let bitrate_bps = *rx.borrow_and_update();
                if let Some(control) = active.encoder.bitrate_control() {
                    match control.set_bitrate(bitrate_bps) {
                        Ok(()) => debug!(bitrate_bps, "Encoder bitrate updated"),
                        Err(e) => warn!(bitrate_bps, "Failed to set encoder bitrate: {}", e),
                    }
                }
            }
        }

        Ok(Some(active.encoder.encode(&frame)?))
    }

    fn init(&mut self, (width, height): (u32, u32)) -> bool {
        if self.failed == Some((width, height)) {
            return false;
        }
        self.active = None;
        self.bandwidth.register_encoder(EncoderSlot::Unregistered);

        let bitrate_bps = self.bandwidth.current_video_bitrate();
        let mut encoder = match self.codec.init_encoder(width, height, bitrate_bps) {
            Ok(encoder) => encoder,
            Err(e) => {
                warn!(width, height, "Failed to initialize VP8 encoder: {}", e);
                self.failed = Some((width, height));
                return false;
            }
        };
        self.failed = None;

        let bitrate = if encoder.bitrate_control().is_some() {
            let (control, rx) = BitrateWatch::channel(bitrate_bps);
            self.bandwidth.register_encoder(EncoderSlot::Adjustable(control));
            Some(rx)
        } else {
            self.bandwidth.register_encoder(EncoderSlot::Fixed);
            None
        };
        info!(width, height, bitrate_bps, "VP8 encoder initialized");

        self.active = Some(ActiveEncoder {
            encoder,
            dimensions: (width, height),
            bitrate,
        });
        true
    }
}

async fn run_encode_loop(
    mut encoder: FrameEncoder,
    mut images: mpsc::Receiver<Image>,
    track: Arc<TrackLocalStaticSample>,
    frame_interval: Duration,
    done: DoneSignal,
) {
    loop {
        let image = tokio::select! {
            _ = done.closed() => break,
            image = images.recv() => match image {
                Some(image) => image,
                None => break,
            },
        };

        let data = match encoder.encode(&image) {
            Ok(Some(data)) => data,
            Ok(None) => continue,
            Err(e) => {
                warn!("Dropping frame: {}", e);
                continue;
            }
        };
        let sample = Sample {
            data,
            duration: frame_interval,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            warn!("Failed to write video sample: {}", e);
        }
    }
    debug!("Encode loop stopped");
}
