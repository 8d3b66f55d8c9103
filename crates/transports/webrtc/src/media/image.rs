//! Conversions between bus image messages and codec pixel buffers

use super::codec::{CodecError, CodecResult, PixelBuffer, PixelFormat};
use crate::msgs::{Header, Image, Time};

/// Convert a bus image to RGBA for the encoder
///
/// Supports `rgb8`, `bgr8` and `rgba8`; rows may carry padding up to `step`.
pub fn image_to_rgba(image: &Image) -> CodecResult<PixelBuffer> {
    let (bpp, swap_rb, has_alpha) = match image.encoding.as_str() {
        "rgb8" => (3, false, false),
        "bgr8" => (3, true, false),
        "rgba8" => (4, false, true),
        other => {
            return Err(CodecError::InvalidFrame(format!(
                "unsupported image encoding '{}'",
                other
            )))
        }
    };

    let w = image.width as usize;
    let h = image.height as usize;
    let step = image.step as usize;
    if w == 0 || h == 0 {
        return Err(CodecError::InvalidFrame("empty image".to_string()));
    }
    if step < w * bpp || image.data.len() < step * (h - 1) + w * bpp {
        return Err(CodecError::InvalidFrame(format!(
            "{}x{} {} image has {} bytes with step {}",
            w,
            h,
            image.encoding,
            image.data.len(),
            step
        )));
    }

    let mut data = Vec::with_capacity(w * h * 4);
    for row in image.data.chunks(step).take(h) {
        for px in row[..w * bpp].chunks_exact(bpp) {
            let (r, b) = if swap_rb { (px[2], px[0]) } else { (px[0], px[2]) };
            let a = if has_alpha { px[3] } else { 255 };
            data.extend_from_slice(&[r, px[1], b, a]);
        }
    }

    Ok(PixelBuffer {
        width: image.width,
        height: image.height,
        format: PixelFormat::Rgba32,
        data,
    })
}

/// Wrap a decoded RGB buffer as a bus image
pub fn rgb_to_image(buffer: PixelBuffer, frame_id: &str) -> CodecResult<Image> {
    if buffer.format != PixelFormat::Rgb24 {
        return Err(CodecError::InvalidFrame(format!(
            "expected RGB24 pixels, got {:?}",
            buffer.format
        )));
    }
    let step = buffer.stride();
    if buffer.data.len() != step * buffer.height as usize {
        return Err(CodecError::InvalidFrame(format!(
            "{} bytes for {}x{} RGB",
            buffer.data.len(),
            buffer.width,
            buffer.height
        )));
    }

    Ok(Image {
        header: Header {
            stamp: Time::now(),
            frame_id: frame_id.to_string(),
        },
        height: buffer.height,
        width: buffer.width,
        encoding: "rgb8".to_string(),
        is_bigendian: 0,
        step: step as u32,
        data: buffer.data,
    })
}
