//! VP8 RTP payload format (RFC 7741) and frame header helpers

/// Parsed VP8 payload descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Vp8Descriptor {
    /// N bit: frame may be discarded without affecting others
    pub non_reference: bool,
    /// S bit: first packet of a partition
    pub start_of_partition: bool,
    pub partition_id: u8,
    pub picture_id: Option<u16>,
    /// Length of the descriptor in bytes
    pub header_len: usize,
}

impl Vp8Descriptor {
    /// First packet of a frame: start of partition 0
    pub fn is_start_of_frame(&self) -> bool {
        self.start_of_partition && self.partition_id == 0
    }
}

const X_BIT: u8 = 0x80;
const N_BIT: u8 = 0x20;
const S_BIT: u8 = 0x10;
const PID_MASK: u8 = 0x07;

const I_BIT: u8 = 0x80;
const L_BIT: u8 = 0x40;
const T_BIT: u8 = 0x20;
const K_BIT: u8 = 0x10;
const M_BIT: u8 = 0x80;

/// Split an RTP payload into its descriptor and VP8 partition bytes
pub fn parse_descriptor(payload: &[u8]) -> Option<(Vp8Descriptor, &[u8])> {
    let first = *payload.first()?;
    let mut desc = Vp8Descriptor {
        non_reference: first & N_BIT != 0,
        start_of_partition: first & S_BIT != 0,
        partition_id: first & PID_MASK,
        picture_id: None,
        header_len: 1,
    };

    let mut idx = 1;
    if first & X_BIT != 0 {
        let ext = *payload.get(idx)?;
        idx += 1;

        if ext & I_BIT != 0 {
            let b = *payload.get(idx)?;
            idx += 1;
            if b & M_BIT != 0 {
                let lo = *payload.get(idx)?;
                idx += 1;
                desc.picture_id = Some((((b & 0x7F) as u16) << 8) | lo as u16);
            } else {
                desc.picture_id = Some((b & 0x7F) as u16);
            }
        }
        if ext & L_BIT != 0 {
            idx += 1;
        }
        if ext & (T_BIT | K_BIT) != 0 {
            idx += 1;
        }
    }

    if idx > payload.len() {
        return None;
    }
    desc.header_len = idx;
    Some((desc, &payload[idx..]))
}

/// Frame tag bit 0 (P) is clear on keyframes
pub fn is_keyframe(frame: &[u8]) -> bool {
    frame.first().is_some_and(|b| b & 0x01 == 0)
}

/// Width and height from a keyframe header
///
/// Bytes 6..10 hold two little-endian 16-bit fields whose low 14 bits are
/// width and height (the top two bits are scaling).
pub fn keyframe_dimensions(frame: &[u8]) -> Option<(u32, u32)> {
    if !is_keyframe(frame) || frame.len() < 10 {
        return None;
    }
    let raw = u32::from_le_bytes([frame[6], frame[7], frame[8], frame[9]]);
    let width = raw & 0x3FFF;
    let height = (raw >> 16) & 0x3FFF;
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

/// Build a keyframe header for the given dimensions (frame tag, start code, size)
pub fn keyframe_header(width: u16, height: u16) -> [u8; 10] {
    let w = (width & 0x3FFF).to_le_bytes();
    let h = (height & 0x3FFF).to_le_bytes();
    [0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, w[0], w[1], h[0], h[1]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_descriptor() {
        let (desc, rest) = parse_descriptor(&[0x10, 0xAA, 0xBB]).unwrap();
        assert!(desc.is_start_of_frame());
        assert_eq!(desc.header_len, 1);
        assert_eq!(rest, &[0xAA, 0xBB]);

        let (desc, _) = parse_descriptor(&[0x00, 0xAA]).unwrap();
        assert!(!desc.start_of_partition);
    }

    #[test]
    fn test_extended_descriptor_with_long_picture_id() {
        // X, S | I, L | M + picture id 0x1234 | tl0picidx | payload
        let payload = [0x90, 0xC0, 0x92, 0x34, 0x05, 0xAA];
        let (desc, rest) = parse_descriptor(&payload).unwrap();
        assert_eq!(desc.picture_id, Some(0x1234));
        assert_eq!(desc.header_len, 5);
        assert_eq!(rest, &[0xAA]);
    }

    #[test]
    fn test_truncated_descriptor() {
        assert!(parse_descriptor(&[]).is_none());
        assert!(parse_descriptor(&[0x80]).is_none());
        assert!(parse_descriptor(&[0x80, 0x80, 0x80]).is_none());
    }

    #[test]
    fn test_non_first_partition_is_not_frame_start() {
        let (desc, _) = parse_descriptor(&[0x11, 0x00]).unwrap();
        assert!(desc.start_of_partition);
        assert!(!desc.is_start_of_frame());
    }

    #[test]
    fn test_keyframe_dimensions() {
        let header = keyframe_header(640, 480);
        assert!(is_keyframe(&header));
        assert_eq!(keyframe_dimensions(&header), Some((640, 480)));
    }

    #[test]
    fn test_scaling_bits_ignored() {
        let mut header = keyframe_header(1280, 720);
        header[7] |= 0xC0;
        header[9] |= 0x40;
        assert_eq!(keyframe_dimensions(&header), Some((1280, 720)));
    }

    #[test]
    fn test_interframe() {
        let frame = [0x01, 0x00, 0x00, 0x00];
        assert!(!is_keyframe(&frame));
        assert_eq!(keyframe_dimensions(&frame), None);
        assert!(!is_keyframe(&[]));
    }
}
