//! RTP → decoded frame pipeline tests with a scripted codec

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use wrb_webrtc::media::codec::{CodecResult, RawFrame, Vp8Decoder, Vp8Encoder};
use wrb_webrtc::media::vp8::keyframe_header;
use wrb_webrtc::media::{
    CodecError, FrameReassembler, PixelFormat, ReassemblyState, RtpPacket, Vp8Codec,
};

/// Records decoder inits and decodes in call order
#[derive(Default)]
struct ScriptedCodec {
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedCodec {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl Vp8Codec for ScriptedCodec {
    fn init_decoder(&self, width: u32, height: u32) -> CodecResult<Box<dyn Vp8Decoder>> {
        self.calls.lock().push(format!("init {}x{}", width, height));
        Ok(Box::new(ScriptedDecoder {
            width,
            height,
            calls: Arc::clone(&self.calls),
        }))
    }

    fn init_encoder(&self, _: u32, _: u32, _: u32) -> CodecResult<Box<dyn Vp8Encoder>> {
        Err(CodecError::NotAvailable("decode only".to_string()))
    }
}

struct ScriptedDecoder {
    width: u32,
    height: u32,
    calls: Arc<Mutex<Vec<String>>>,
}

impl Vp8Decoder for ScriptedDecoder {
    fn decode(&mut self, data: &[u8]) -> CodecResult<Option<RawFrame>> {
        self.calls.lock().push(format!("decode {}", data.len()));
        let w = self.width as usize;
        let h = self.height as usize;
        let cw = w.div_ceil(2);
        let ch = h.div_ceil(2);
        Ok(Some(RawFrame {
            width: self.width,
            height: self.height,
            y: vec![16; w * h],
            u: vec![128; cw * ch],
            v: vec![128; cw * ch],
            y_stride: w,
            uv_stride: cw,
        }))
    }
}

fn packet(seq: u16, ts: u32, start: bool, marker: bool, body: &[u8]) -> RtpPacket {
    let mut payload = vec![if start { 0x10 } else { 0x00 }];
    payload.extend_from_slice(body);
    RtpPacket {
        sequence_number: seq,
        timestamp: ts,
        marker,
        payload: Bytes::from(payload),
    }
}

/// A keyframe of `width`×`height` split across `count` packets
fn keyframe_packets(first_seq: u16, ts: u32, width: u16, height: u16, count: usize) -> Vec<RtpPacket> {
    let mut frame = keyframe_header(width, height).to_vec();
    frame.extend(std::iter::repeat(0xAB).take(count * 8));
    let chunk = frame.len().div_ceil(count);
    frame
        .chunks(chunk)
        .enumerate()
        .map(|(i, body)| {
            packet(
                first_seq.wrapping_add(i as u16),
                ts,
                i == 0,
                i == count - 1,
                body,
            )
        })
        .collect()
}

/// Single-packet interframe with a recognizable length
fn interframe(seq: u16, ts: u32, len: usize) -> RtpPacket {
    let mut body = vec![0x01];
    body.resize(len, 0xCD);
    packet(seq, ts, true, true, &body)
}

#[test]
fn test_keyframe_from_five_packets() {
    let codec = Arc::new(ScriptedCodec::default());
    let mut reassembler = FrameReassembler::new(codec.clone());

    let packets = keyframe_packets(100, 9000, 640, 480, 5);
    assert_eq!(packets.len(), 5);
    let total: usize = packets.iter().map(|p| p.payload.len() - 1).sum();

    let mut frames = Vec::new();
    for p in packets {
        frames.extend(reassembler.push(p));
    }

    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    assert!(frame.is_keyframe);
    assert_eq!((frame.image.width, frame.image.height), (640, 480));
    assert_eq!(frame.image.format, PixelFormat::Rgb24);
    assert_eq!(frame.image.data.len(), 640 * 480 * 3);

    // Decoder sized from the keyframe header before the first decode
    assert_eq!(
        codec.calls(),
        vec!["init 640x480".to_string(), format!("decode {}", total)]
    );
    assert_eq!(reassembler.decoder_dimensions(), Some((640, 480)));
    assert_eq!(reassembler.state(), ReassemblyState::Reassembling);
}

#[test]
fn test_nothing_decoded_before_keyframe() {
    let codec = Arc::new(ScriptedCodec::default());
    let mut reassembler = FrameReassembler::new(codec.clone());

    for seq in 1..=3u16 {
        assert!(reassembler.push(interframe(seq, seq as u32 * 3000, 12)).is_empty());
    }
    assert!(codec.calls().is_empty());
    assert_eq!(reassembler.state(), ReassemblyState::WaitingForKeyframe);
    assert_eq!(reassembler.stats().samples_dropped_before_keyframe, 3);

    let mut frames = Vec::new();
    for p in keyframe_packets(4, 12_000, 320, 240, 2) {
        frames.extend(reassembler.push(p));
    }
    assert_eq!(frames.len(), 1);
    assert_eq!(reassembler.stats().decoder_inits, 1);

    // Interframes now decode with the existing decoder
    assert_eq!(reassembler.push(interframe(6, 15_000, 12)).len(), 1);
    assert_eq!(reassembler.stats().decoder_inits, 1);
    assert_eq!(reassembler.stats().frames_decoded, 2);
}

#[test]
fn test_one_frame_per_marker_group() {
    let codec = Arc::new(ScriptedCodec::default());
    let mut reassembler = FrameReassembler::new(codec.clone());

    let mut frames = Vec::new();
    for p in keyframe_packets(1, 0, 64, 48, 3) {
        frames.extend(reassembler.push(p));
    }
    // Two-packet interframe: start, then marker
    frames.extend(reassembler.push(packet(4, 3000, true, false, &[0x01, 0x02])));
    frames.extend(reassembler.push(packet(5, 3000, false, true, &[0x03])));
    frames.extend(reassembler.push(interframe(6, 6000, 7)));

    assert_eq!(frames.len(), 3);
    let calls = codec.calls();
    assert_eq!(calls.iter().filter(|c| c.starts_with("decode")).count(), 3);
    assert_eq!(calls[2], "decode 3");
    assert_eq!(calls[3], "decode 7");
}

#[test]
fn test_reordered_packets_reassembled() {
    let codec = Arc::new(ScriptedCodec::default());
    let mut reassembler = FrameReassembler::new(codec.clone());

    let packets = keyframe_packets(10, 0, 64, 48, 3);
    let mut frames = reassembler.push(packets[0].clone());
    frames.extend(reassembler.push(packets[2].clone()));
    assert!(frames.is_empty());
    frames.extend(reassembler.push(packets[1].clone()));

    assert_eq!(frames.len(), 1);
    assert_eq!(reassembler.stats().samples_dropped_gap, 0);
}

#[test]
fn test_gap_discards_frame_until_next_start() {
    let codec = Arc::new(ScriptedCodec::default());
    let mut reassembler = FrameReassembler::with_capacity(codec.clone(), 4);

    let mut frames = Vec::new();
    for p in keyframe_packets(1, 0, 64, 48, 1) {
        frames.extend(reassembler.push(p));
    }
    assert_eq!(frames.len(), 1);

    // Frame at ts 3000 loses its middle packet (seq 3)
    assert!(reassembler.push(packet(2, 3000, true, false, &[0x01, 0xEE])).is_empty());
    assert!(reassembler.push(packet(4, 3000, false, true, &[0xEE])).is_empty());
    assert!(reassembler.push(interframe(5, 6000, 5)).is_empty());
    assert!(reassembler.push(interframe(6, 9000, 6)).is_empty());

    // Buffer full: the hole is given up on and the rest flows
    let frames = reassembler.push(interframe(7, 12_000, 7));
    assert_eq!(frames.len(), 3);

    let stats = reassembler.stats();
    assert_eq!(stats.samples_dropped_gap, 1);
    assert_eq!(stats.frames_decoded, 4);
    let decodes: Vec<String> = codec
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("decode"))
        .collect();
    assert_eq!(decodes[1..], ["decode 5", "decode 6", "decode 7"]);
}

#[test]
fn test_dimension_change_reinitializes_decoder() {
    let codec = Arc::new(ScriptedCodec::default());
    let mut reassembler = FrameReassembler::new(codec.clone());

    let mut frames = Vec::new();
    for p in keyframe_packets(1, 0, 64, 48, 2) {
        frames.extend(reassembler.push(p));
    }
    for p in keyframe_packets(3, 3000, 64, 48, 2) {
        frames.extend(reassembler.push(p));
    }
    for p in keyframe_packets(5, 6000, 32, 16, 2) {
        frames.extend(reassembler.push(p));
    }

    assert_eq!(frames.len(), 3);
    assert_eq!((frames[2].image.width, frames[2].image.height), (32, 16));
    assert_eq!(reassembler.stats().decoder_inits, 2);
    let inits: Vec<String> = codec
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("init"))
        .collect();
    assert_eq!(inits, ["init 64x48", "init 32x16"]);
}

#[test]
fn test_unavailable_codec_drops_frames() {
    let mut reassembler = FrameReassembler::new(Arc::new(wrb_webrtc::UnavailableCodec));
    let mut frames = Vec::new();
    for p in keyframe_packets(1, 0, 64, 48, 2) {
        frames.extend(reassembler.push(p));
    }
    assert!(frames.is_empty());
    assert_eq!(reassembler.stats().codec_errors, 1);
    assert_eq!(reassembler.decoder_dimensions(), None);
}
