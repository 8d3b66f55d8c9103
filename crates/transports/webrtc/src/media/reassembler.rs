//! RTP → VP8 frame reassembly and decode
//!
//! Two layers:
//!
//! - [`SampleAssembler`] reorders packets through a bounded jitter buffer and
//!   concatenates the partitions of one frame (same RTP timestamp, first
//!   packet flagged start-of-frame, last packet carrying the marker bit) into
//!   a [`Vp8Sample`].
//! - [`FrameReassembler`] gates samples on the first keyframe, (re)creates the
//!   decoder when keyframe dimensions change, decodes, and converts to RGB.
//!
//! Loss policy: when the sequence number of a released packet is more than
//! one past the previous one, the sample being accumulated is discarded and
//! nothing is emitted until the next start-of-frame packet. There is no error
//! concealment; the periodic PLI sent by the receiver brings a fresh keyframe.

use super::codec::{CodecError, PixelBuffer, Vp8Codec, Vp8Decoder};
use super::jitter_buffer::{JitterBuffer, Sequenced, DEFAULT_CAPACITY};
use super::vp8;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// RTP video clock rate
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// The RTP fields the reassembler needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub sequence_number: u16,
    pub timestamp: u32,
    /// Last packet of a frame
    pub marker: bool,
    /// VP8 payload descriptor followed by partition bytes
    pub payload: Bytes,
}

impl Sequenced for RtpPacket {
    fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    fn closes_frame(&self) -> bool {
        self.marker
    }
}

impl From<&webrtc::rtp::packet::Packet> for RtpPacket {
    fn from(packet: &webrtc::rtp::packet::Packet) -> Self {
        Self {
            sequence_number: packet.header.sequence_number,
            timestamp: packet.header.timestamp,
            marker: packet.header.marker,
            payload: packet.payload.clone(),
        }
    }
}

/// One reassembled encoded frame
#[derive(Debug, Clone, PartialEq)]
pub struct Vp8Sample {
    pub data: Bytes,
    pub is_keyframe: bool,
    pub rtp_timestamp: u32,
    /// Presentation time relative to the first packet of the stream
    pub pts: Duration,
    /// Header dimensions, keyframes only
    pub dimensions: Option<(u32, u32)>,
}

/// One decoded frame ready for publishing
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub image: PixelBuffer,
    pub pts: Duration,
    pub is_keyframe: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyState {
    /// No keyframe yet; samples are discarded
    WaitingForKeyframe,
    /// Accumulating packets of the next frame
    Reassembling,
    /// A complete sample is being handed to the decoder
    EmittingSample,
}

/// Counters for expected drops and codec failures
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub packets_received: u64,
    pub samples_emitted: u64,
    /// In-progress samples discarded because of a sequence gap
    pub samples_dropped_gap: u64,
    /// Samples cut short by a new frame or timestamp change before their marker
    pub samples_dropped_incomplete: u64,
    /// Samples discarded before the first keyframe
    pub samples_dropped_before_keyframe: u64,
    pub malformed_packets: u64,
    pub decoder_inits: u64,
    pub frames_decoded: u64,
    pub codec_errors: u64,
}

struct PartialSample {
    timestamp: u32,
    data: BytesMut,
}

/// Packet → sample stage
pub struct SampleAssembler {
    buffer: JitterBuffer<RtpPacket>,
    current: Option<PartialSample>,
    last_seq: Option<u16>,
    first_timestamp: Option<u32>,
    stats: ReassemblyStats,
}

impl SampleAssembler {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: JitterBuffer::new(capacity),
            current: None,
            last_seq: None,
            first_timestamp: None,
            stats: ReassemblyStats::default(),
        }
    }

    /// Push one packet; returns every sample it completed
    pub fn push(&mut self, packet: RtpPacket) -> Vec<Vp8Sample> {
        self.stats.packets_received += 1;
        if !self.buffer.insert(packet) {
            return Vec::new();
        }

        let mut samples = Vec::new();
        while let Some(packet) = self.buffer.pop() {
            if let Some(sample) = self.accept(packet) {
                samples.push(sample);
            }
        }
        samples
    }

    fn accept(&mut self, packet: RtpPacket) -> Option<Vp8Sample> {
        if let Some(last) = self.last_seq {
            let gap = packet.sequence_number.wrapping_sub(last);
            if gap > 1 && self.current.take().is_some() {
                self.stats.samples_dropped_gap += 1;
                debug!(
                    seq = packet.sequence_number,
                    last_seq = last,
                    "Sequence gap, discarding in-progress sample"
                );
            }
        }
        self.last_seq = Some(packet.sequence_number);

        let Some((desc, partition)) = vp8::parse_descriptor(&packet.payload) else {
            self.stats.malformed_packets += 1;
            if self.current.take().is_some() {
                self.stats.samples_dropped_incomplete += 1;
            }
            return None;
        };

        if desc.is_start_of_frame() {
            if self.current.is_some() {
                self.stats.samples_dropped_incomplete += 1;
            }
            let mut data = BytesMut::with_capacity(partition.len() * 4);
            data.extend_from_slice(partition);
            self.current = Some(PartialSample {
                timestamp: packet.timestamp,
                data,
            });
        } else {
            match self.current.as_mut() {
                // Waiting for the next start-of-frame
                None => return None,
                Some(current) if current.timestamp != packet.timestamp => {
                    self.current = None;
                    self.stats.samples_dropped_incomplete += 1;
                    return None;
                }
                Some(current) => current.data.extend_from_slice(partition),
            }
        }

        if !packet.marker {
            return None;
        }
        let sample = self.current.take()?;
        Some(self.finish(sample))
    }

    fn finish(&mut self, sample: PartialSample) -> Vp8Sample {
        let first = *self.first_timestamp.get_or_insert(sample.timestamp);
        let ticks = sample.timestamp.wrapping_sub(first) as u64;
        let data = sample.data.freeze();
        let is_keyframe = vp8::is_keyframe(&data);
        let dimensions = if is_keyframe {
            vp8::keyframe_dimensions(&data)
        } else {
            None
        };
        self.stats.samples_emitted += 1;

        Vp8Sample {
            data,
            is_keyframe,
            rtp_timestamp: sample.timestamp,
            pts: Duration::from_micros(ticks * 1_000_000 / VIDEO_CLOCK_RATE as u64),
            dimensions,
        }
    }

    pub fn is_assembling(&self) -> bool {
        self.current.is_some()
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }
}

impl Default for SampleAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Packet → decoded frame pipeline for one inbound track
pub struct FrameReassembler {
    assembler: SampleAssembler,
    codec: Arc<dyn Vp8Codec>,
    decoder: Option<Box<dyn Vp8Decoder>>,
    decoder_dimensions: Option<(u32, u32)>,
    state: ReassemblyState,
    stats: ReassemblyStats,
}

impl FrameReassembler {
    pub fn new(codec: Arc<dyn Vp8Codec>) -> Self {
        Self::with_capacity(codec, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(codec: Arc<dyn Vp8Codec>, capacity: usize) -> Self {
        Self {
            assembler: SampleAssembler::new(capacity),
            codec,
            decoder: None,
            decoder_dimensions: None,
            state: ReassemblyState::WaitingForKeyframe,
            stats: ReassemblyStats::default(),
        }
    }

    pub fn state(&self) -> ReassemblyState {
        self.state
    }

    /// Assembler and decoder counters combined
    pub fn stats(&self) -> ReassemblyStats {
        let a = self.assembler.stats();
        ReassemblyStats {
            packets_received: a.packets_received,
            samples_emitted: a.samples_emitted,
            samples_dropped_gap: a.samples_dropped_gap,
            samples_dropped_incomplete: a.samples_dropped_incomplete,
            malformed_packets: a.malformed_packets,
            ..self.stats
        }
    }

    pub fn decoder_dimensions(&self) -> Option<(u32, u32)> {
        self.decoder_dimensions
    }

    /// Push one RTP packet; returns any frames it completed and decoded
    pub fn push(&mut self, packet: RtpPacket) -> Vec<DecodedFrame> {
        let samples = self.assembler.push(packet);
        let mut frames = Vec::with_capacity(samples.len());
        for sample in samples {
            if let Some(frame) = self.handle_sample(sample) {
                frames.push(frame);
            }
        }
        frames
    }

    fn handle_sample(&mut self, sample: Vp8Sample) -> Option<DecodedFrame> {
        if self.state == ReassemblyState::WaitingForKeyframe && !sample.is_keyframe {
            self.stats.samples_dropped_before_keyframe += 1;
            return None;
        }
        self.state = ReassemblyState::EmittingSample;
        let frame = self.decode_sample(&sample);
        self.state = ReassemblyState::Reassembling;
        frame
    }

    fn decode_sample(&mut self, sample: &Vp8Sample) -> Option<DecodedFrame> {
        if sample.is_keyframe {
            if let Some(dims) = sample.dimensions {
                if self.decoder.is_none() || self.decoder_dimensions != Some(dims) {
                    self.init_decoder(dims);
                }
            }
        }

        let decoder = match self.decoder.as_mut() {
            Some(decoder) => decoder,
            None => {
                self.stats.codec_errors += 1;
                debug!("No decoder for sample at ts={}, dropping", sample.rtp_timestamp);
                return None;
            }
        };

        let raw = match decoder.decode(&sample.data) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!("{}", CodecError::NoFrame);
                return None;
            }
            Err(e) => {
                self.stats.codec_errors += 1;
                warn!(ts = sample.rtp_timestamp, "Failed to decode VP8 frame: {}", e);
                return None;
            }
        };

        match decoder.color_convert(&raw) {
            Ok(image) => {
                self.stats.frames_decoded += 1;
                Some(DecodedFrame {
                    image,
                    pts: sample.pts,
                    is_keyframe: sample.is_keyframe,
                })
            }
            Err(e) => {
                self.stats.codec_errors += 1;
                warn!("Failed to convert decoded frame: {}", e);
                None
            }
        }
    }

    fn init_decoder(&mut self, (width, height): (u32, u32)) {
        match self.codec.init_decoder(width, height) {
            Ok(decoder) => {
                info!(width, height, "Initialized VP8 decoder");
                self.decoder = Some(decoder);
                self.decoder_dimensions = Some((width, height));
                self.stats.decoder_inits += 1;
            }
            Err(e) => {
                warn!(width, height, "Failed to initialize VP8 decoder: {}", e);
                self.decoder = None;
                self.decoder_dimensions = None;
            }
        }
    }
}
