//! VP8 codec contract
//!
//! The bitstream math lives in an external codec library; the bridge only
//! drives it through these traits. A native backend implements [`Vp8Codec`]
//! and is handed to the sender/receiver at startup. [`UnavailableCodec`] is
//! used when no backend is linked: signaling and the data channel keep
//! working, video is dropped with a logged codec error.

use bytes::Bytes;

/// Codec-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Codec not available: {0}")]
    NotAvailable(String),

    #[error("Codec initialization failed: {0}")]
    InitFailed(String),

    #[error("Decoding failed: {0}")]
    DecodeFailed(String),

    #[error("Decoder produced no frame")]
    NoFrame,

    #[error("Encoding failed: {0}")]
    EncodeFailed(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

/// Result type for codec operations
pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Planar I420 image as produced by the decoder
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// Authoritative dimensions reported by the decoder
    pub width: u32,
    pub height: u32,
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
    pub y_stride: usize,
    pub uv_stride: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 3 bytes per pixel, R G B
    Rgb24,
    /// 4 bytes per pixel, R G B A
    Rgba32,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb24 => 3,
            PixelFormat::Rgba32 => 4,
        }
    }
}

/// Interleaved pixels
#[derive(Debug, Clone, PartialEq)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl PixelBuffer {
    pub fn stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }
}

/// Factory for decode/encode contexts
pub trait Vp8Codec: Send + Sync {
    fn init_decoder(&self, width: u32, height: u32) -> CodecResult<Box<dyn Vp8Decoder>>;

    fn init_encoder(
        &self,
        width: u32,
        height: u32,
        bitrate_bps: u32,
    ) -> CodecResult<Box<dyn Vp8Encoder>>;
}

/// Decode context sized for one stream geometry
pub trait Vp8Decoder: Send {
    /// Decode one complete VP8 frame
    ///
    /// `Ok(None)` means the decoder accepted the data but has no frame to show.
    fn decode(&mut self, data: &[u8]) -> CodecResult<Option<RawFrame>>;

    /// Convert a decoded frame to interleaved RGB
    fn color_convert(&self, frame: &RawFrame) -> CodecResult<PixelBuffer> {
        i420_to_rgb24(frame)
    }
}

/// Runtime bitrate control, for encoders that support it
pub trait AdjustableBitrate {
    fn set_bitrate(&mut self, bitrate_bps: u32) -> CodecResult<()>;
}

/// Encode context
pub trait Vp8Encoder: Send {
    /// Encode one RGBA frame into a VP8 frame
    fn encode(&mut self, frame: &PixelBuffer) -> CodecResult<Bytes>;

    /// `None` for encoders whose bitrate is fixed at init
    fn bitrate_control(&mut self) -> Option<&mut dyn AdjustableBitrate> {
        None
    }
}

/// Codec used when no VP8 backend is linked
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableCodec;

impl Vp8Codec for UnavailableCodec {
    fn init_decoder(&self, _width: u32, _height: u32) -> CodecResult<Box<dyn Vp8Decoder>> {
        Err(CodecError::NotAvailable("no VP8 decoder backend".to_string()))
    }

    fn init_encoder(
        &self,
        _width: u32,
        _height: u32,
        _bitrate_bps: u32,
    ) -> CodecResult<Box<dyn Vp8Encoder>> {
        Err(CodecError::NotAvailable("no VP8 encoder backend".to_string()))
    }
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// BT.601 limited-range I420 → RGB24
pub fn i420_to_rgb24(frame: &RawFrame) -> CodecResult<PixelBuffer> {
    let w = frame.width as usize;
    let h = frame.height as usize;
    let cw = w.div_ceil(2);
    let ch = h.div_ceil(2);

    if frame.y_stride < w || frame.uv_stride < cw {
        return Err(CodecError::InvalidFrame(format!(
            "strides {}/{} too small for {}x{}",
            frame.y_stride, frame.uv_stride, w, h
        )));
    }
    if frame.y.len() < frame.y_stride * h.saturating_sub(1) + w
        || frame.u.len() < frame.uv_stride * ch.saturating_sub(1) + cw
        || frame.v.len() < frame.uv_stride * ch.saturating_sub(1) + cw
    {
        return Err(CodecError::InvalidFrame(format!(
            "plane buffers too small for {}x{}",
            w, h
        )));
    }

    let mut data = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        for col in 0..w {
            let y = frame.y[row * frame.y_stride + col] as i32 - 16;
            let uv_index = (row / 2) * frame.uv_stride + col / 2;
            let u = frame.u[uv_index] as i32 - 128;
            let v = frame.v[uv_index] as i32 - 128;

            let c = 298 * y;
            data.push(clamp_u8((c + 409 * v + 128) >> 8));
            data.push(clamp_u8((c - 100 * u - 208 * v + 128) >> 8));
            data.push(clamp_u8((c + 516 * u + 128) >> 8));
        }
    }

    Ok(PixelBuffer {
        width: frame.width,
        height: frame.height,
        format: PixelFormat::Rgb24,
        data,
    })
}
