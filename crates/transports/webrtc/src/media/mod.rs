//! Video path: VP8 depacketization, decoding and image conversion

pub mod codec;
pub mod image;
pub mod jitter_buffer;
pub mod reassembler;
pub mod vp8;

pub use codec::{
    CodecError, CodecResult, PixelBuffer, PixelFormat, RawFrame, UnavailableCodec, Vp8Codec,
    Vp8Decoder, Vp8Encoder,
};
pub use reassembler::{
    DecodedFrame, FrameReassembler, ReassemblyState, ReassemblyStats, RtpPacket, SampleAssembler,
    Vp8Sample, VIDEO_CLOCK_RATE,
};
