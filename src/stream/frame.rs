//! MySQL wire framing
//!
//! One logical packet is `<len:3 LE><seq:1><payload>`, where a payload of
//! exactly 0xFFFFFF bytes continues into the next frame until a shorter
//! frame terminates it. Frames are read off a [`DirectionalBuffer`] without
//! consuming bytes until the whole logical packet is available.

use crate::stream::buffer::DirectionalBuffer;

/// Largest logical packet accepted before the stream is declared broken
pub const MAX_LOGICAL_PACKET: usize = 64 << 20;

/// Payload length signalling a continuation frame
const CONTINUATION_LEN: usize = 0xFF_FFFF;

/// One decoded logical packet
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// MySQL sequence number of the first wire frame
    pub seq: u8,
    /// Concatenated payload
    pub payload: Vec<u8>,
    /// Capture timestamp of the last byte of the packet
    pub ts: i64,
}

/// Outcome of a framing attempt
#[derive(Debug)]
pub enum FrameRead {
    /// A complete logical packet was consumed from the buffer
    Frame(Frame),
    /// Not enough contiguous bytes yet
    NeedMore,
    /// Framing is unrecoverable at this position
    Invalid(&'static str),
}

/// Try to read one logical packet, consuming it from `buf` on success
pub fn read_frame(buf: &mut DirectionalBuffer) -> FrameRead {
    let window = buf.window();
    let mut offset = 0usize;
    let mut total = 0usize;
    let mut seq = 0u8;
    let mut first = true;

    // Walk the chained headers inside the contiguous window first; nothing
    // is consumed until the full logical packet is present.
    loop {
        if window.len() < offset + 4 {
            return FrameRead::NeedMore;
        }
        let len = (window[offset] as usize)
            | ((window[offset + 1] as usize) << 8)
            | ((window[offset + 2] as usize) << 16);
        if first {
            seq = window[offset + 3];
            first = false;
        }
        if window.len() < offset + 4 + len {
            return FrameRead::NeedMore;
        }
        offset += 4 + len;
        total += len;
        if total > MAX_LOGICAL_PACKET {
            return FrameRead::Invalid("logical packet too large");
        }
        if len < CONTINUATION_LEN {
            break;
        }
    }

    let mut payload = Vec::with_capacity(total);
    let window = buf.window();
    let mut at = 0usize;
    while at < offset {
        let len = (window[at] as usize)
            | ((window[at + 1] as usize) << 8)
            | ((window[at + 2] as usize) << 16);
        payload.extend_from_slice(&window[at + 4..at + 4 + len]);
        at += 4 + len;
    }
    let ts = buf.advance(offset);
    FrameRead::Frame(Frame { seq, payload, ts })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(bytes: &[u8]) -> DirectionalBuffer {
        let mut buf = DirectionalBuffer::new(true);
        buf.write(0, bytes, 7);
        buf
    }

    fn packet(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![
            (payload.len() & 0xff) as u8,
            ((payload.len() >> 8) & 0xff) as u8,
            ((payload.len() >> 16) & 0xff) as u8,
            seq,
        ];
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_simple_frame() {
        let mut buf = buffer_with(&packet(0, b"\x03SELECT 1"));
        match read_frame(&mut buf) {
            FrameRead::Frame(f) => {
                assert_eq!(f.seq, 0);
                assert_eq!(f.payload, b"\x03SELECT 1");
                assert_eq!(f.ts, 7);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(buf.window().is_empty());
    }

    #[test]
    fn test_short_header_needs_more() {
        let mut buf = buffer_with(&[0x05, 0x00]);
        assert!(matches!(read_frame(&mut buf), FrameRead::NeedMore));
    }

    #[test]
    fn test_partial_payload_needs_more() {
        let mut bytes = packet(1, b"abcdef");
        bytes.truncate(bytes.len() - 2);
        let mut buf = buffer_with(&bytes);
        assert!(matches!(read_frame(&mut buf), FrameRead::NeedMore));
        // Nothing consumed while waiting.
        assert_eq!(buf.window().len(), bytes.len());
    }

    #[test]
    fn test_continuation_frames_concatenate() {
        let big = vec![0xaa; CONTINUATION_LEN];
        let mut bytes = packet(0, &big);
        bytes.extend_from_slice(&packet(1, b"tail"));
        let mut buf = buffer_with(&bytes);
        match read_frame(&mut buf) {
            FrameRead::Frame(f) => {
                assert_eq!(f.seq, 0);
                assert_eq!(f.payload.len(), CONTINUATION_LEN + 4);
                assert_eq!(&f.payload[CONTINUATION_LEN..], b"tail");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_continuation_waits_for_terminator() {
        let big = vec![0xaa; CONTINUATION_LEN];
        let bytes = packet(0, &big);
        let mut buf = buffer_with(&bytes);
        assert!(matches!(read_frame(&mut buf), FrameRead::NeedMore));
    }

    #[test]
    fn test_empty_payload_frame() {
        let mut buf = buffer_with(&packet(2, b""));
        match read_frame(&mut buf) {
            FrameRead::Frame(f) => {
                assert_eq!(f.seq, 2);
                assert!(f.payload.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_two_frames_in_sequence() {
        let mut bytes = packet(0, b"\x0e");
        bytes.extend_from_slice(&packet(0, b"\x01"));
        let mut buf = buffer_with(&bytes);
        let FrameRead::Frame(first) = read_frame(&mut buf) else {
            panic!("first frame");
        };
        let FrameRead::Frame(second) = read_frame(&mut buf) else {
            panic!("second frame");
        };
        assert_eq!(first.payload, b"\x0e");
        assert_eq!(second.payload, b"\x01");
    }
}
