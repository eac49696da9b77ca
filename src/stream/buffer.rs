//! Per-direction TCP reassembly
//!
//! A [`DirectionalBuffer`] accepts raw TCP segments in any order and exposes
//! the contiguous prefix as an ordered byte window. Sequence numbers are
//! widened to 64 bits relative to the first accepted byte so u32 wraparound
//! never reorders late traffic. Each contiguous chunk remembers the capture
//! timestamp of the segment that completed it; consumers read the timestamp
//! of the last byte they advance past.

use bytes::BytesMut;
use std::collections::BTreeMap;
use std::collections::VecDeque;

/// Reassembled byte stream for one direction of a flow
#[derive(Debug)]
pub struct DirectionalBuffer {
    /// Accept the first data byte as the base when no SYN was seen
    force_start: bool,
    /// Unwrapped sequence of the next byte expected into `window`
    next_seq: u64,
    /// Raw 32-bit sequence paired with `ref_unwrapped`, used to unwrap
    /// arrivals near the current position
    ref_raw: u32,
    ref_unwrapped: u64,
    started: bool,

    /// Contiguous, not yet consumed bytes
    window: BytesMut,
    /// (remaining length, capture ts) per contiguous chunk in `window`
    chunk_ts: VecDeque<(usize, i64)>,

    /// Out-of-order data keyed by unwrapped sequence
    pending: BTreeMap<u64, (Vec<u8>, i64)>,
    pending_bytes: usize,

    closed: bool,
    truncated: bool,
    last_seen: i64,
}

/// Upper bound on buffered out-of-order data per direction
const MAX_PENDING_BYTES: usize = 8 << 20;

impl DirectionalBuffer {
    pub fn new(force_start: bool) -> Self {
        Self {
            force_start,
            next_seq: 0,
            ref_raw: 0,
            ref_unwrapped: 0,
            started: false,
            window: BytesMut::new(),
            chunk_ts: VecDeque::new(),
            pending: BTreeMap::new(),
            pending_bytes: 0,
            closed: false,
            truncated: false,
            last_seen: 0,
        }
    }

    /// Establish the base sequence from a SYN (`seq + 1` is the first data
    /// byte)
    pub fn start(&mut self, syn_seq: u32, ts: i64) {
        if self.started {
            return;
        }
        self.started = true;
        self.ref_raw = syn_seq.wrapping_add(1);
        self.ref_unwrapped = 0;
        self.next_seq = 0;
        self.last_seen = ts;
    }

    /// Accept one segment; returns the number of new bytes admitted.
    ///
    /// Segments preceding an established base, duplicates, and data after
    /// close are dropped; partial overlaps are trimmed.
    pub fn write(&mut self, seq: u32, payload: &[u8], ts: i64) -> usize {
        if self.closed || payload.is_empty() {
            return 0;
        }
        if !self.started {
            if !self.force_start {
                return 0;
            }
            self.started = true;
            self.ref_raw = seq;
            self.ref_unwrapped = 0;
            self.next_seq = 0;
        }
        self.last_seen = ts;

        // Unwrap the 32-bit sequence against the last position seen.
        let delta = seq.wrapping_sub(self.ref_raw) as i32 as i64;
        let Some(start) = self.ref_unwrapped.checked_add_signed(delta) else {
            return 0;
        };
        self.ref_raw = seq;
        self.ref_unwrapped = start;

        let mut data = payload;
        let mut start = start;
        // Trim what the window already holds.
        if start < self.next_seq {
            let overlap = (self.next_seq - start) as usize;
            if overlap >= data.len() {
                return 0;
            }
            data = &data[overlap..];
            start = self.next_seq;
        }

        if start == self.next_seq {
            self.push_contiguous(data, ts);
            self.drain_pending();
            data.len()
        } else {
            self.stash(start, data, ts)
        }
    }

    fn push_contiguous(&mut self, data: &[u8], ts: i64) {
        self.window.extend_from_slice(data);
        self.chunk_ts.push_back((data.len(), ts));
        self.next_seq += data.len() as u64;
    }

    fn stash(&mut self, start: u64, data: &[u8], ts: i64) -> usize {
        if self.pending_bytes + data.len() > MAX_PENDING_BYTES {
            return 0;
        }
        // Trim against an existing pending run covering the same range.
        if let Some((&prev_start, (prev, _))) = self.pending.range(..=start).next_back() {
            let prev_end = prev_start + prev.len() as u64;
            if prev_end >= start + data.len() as u64 {
                return 0;
            }
        }
        self.pending_bytes += data.len();
        self.pending.insert(start, (data.to_vec(), ts));
        data.len()
    }

    fn drain_pending(&mut self) {
        while let Some((&start, _)) = self.pending.first_key_value() {
            if start > self.next_seq {
                break;
            }
            let Some((start, (data, ts))) = self.pending.pop_first() else {
                break;
            };
            self.pending_bytes -= data.len();
            if start + data.len() as u64 <= self.next_seq {
                continue;
            }
            let skip = (self.next_seq - start) as usize;
            let fresh = data[skip..].to_vec();
            self.push_contiguous(&fresh, ts);
        }
    }

    /// The contiguous window of unconsumed bytes
    pub fn window(&self) -> &[u8] {
        &self.window
    }

    /// Consume `n` bytes from the window, returning the capture timestamp
    /// of the last byte consumed
    pub fn advance(&mut self, n: usize) -> i64 {
        debug_assert!(n <= self.window.len());
        let n = n.min(self.window.len());
        let _ = self.window.split_to(n);
        let mut left = n;
        let mut ts = self.last_seen;
        while left > 0 {
            let Some((len, chunk_ts)) = self.chunk_ts.front_mut() else {
                break;
            };
            ts = *chunk_ts;
            if *len > left {
                *len -= left;
                left = 0;
            } else {
                left -= *len;
                self.chunk_ts.pop_front();
            }
        }
        ts
    }

    /// Close the direction (FIN/RST/idle flush). Remaining contiguous bytes
    /// stay readable; non-contiguous pending data marks the stream
    /// truncated.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if !self.pending.is_empty() {
            self.truncated = true;
            self.pending.clear();
            self.pending_bytes = 0;
        }
    }

    /// True after [`close`](Self::close); the window may still hold bytes
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True once the direction is closed and fully consumed
    pub fn is_drained(&self) -> bool {
        self.closed && self.window.is_empty()
    }

    /// Closed with a sequence gap still outstanding
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Whether a base sequence has been established
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Capture timestamp of the most recent activity
    pub fn last_seen(&self) -> i64 {
        self.last_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_delivery() {
        let mut buf = DirectionalBuffer::new(false);
        buf.start(99, 0);
        buf.write(100, b"hello ", 1);
        buf.write(106, b"world", 2);
        assert_eq!(buf.window(), b"hello world");
        assert_eq!(buf.advance(6), 1);
        assert_eq!(buf.advance(5), 2);
    }

    #[test]
    fn test_out_of_order_segments() {
        let mut buf = DirectionalBuffer::new(false);
        buf.start(0, 0);
        // Delivered [3, 1, 2]
        buf.write(9, b"ccc", 3);
        buf.write(1, b"aaaa", 1);
        assert_eq!(buf.window(), b"aaaa");
        buf.write(5, b"bbbb", 2);
        assert_eq!(buf.window(), b"aaaabbbbccc");
    }

    #[test]
    fn test_duplicates_dropped() {
        let mut buf = DirectionalBuffer::new(false);
        buf.start(0, 0);
        assert_eq!(buf.write(1, b"abcd", 1), 4);
        assert_eq!(buf.write(1, b"abcd", 2), 0);
        assert_eq!(buf.window(), b"abcd");
    }

    #[test]
    fn test_overlap_trimmed() {
        let mut buf = DirectionalBuffer::new(false);
        buf.start(0, 0);
        buf.write(1, b"abcd", 1);
        // Retransmit covering old and new data
        buf.write(3, b"cdEF", 2);
        assert_eq!(buf.window(), b"abcdEF");
    }

    #[test]
    fn test_no_syn_without_force_start() {
        let mut buf = DirectionalBuffer::new(false);
        assert_eq!(buf.write(500, b"data", 1), 0);
        assert!(!buf.is_started());
        assert!(buf.window().is_empty());
    }

    #[test]
    fn test_force_start_mid_stream() {
        let mut buf = DirectionalBuffer::new(true);
        assert_eq!(buf.write(500, b"data", 1), 4);
        assert_eq!(buf.window(), b"data");
        buf.write(504, b"more", 2);
        assert_eq!(buf.window(), b"datamore");
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut buf = DirectionalBuffer::new(true);
        buf.write(u32::MAX - 1, b"ab", 1);
        buf.write(0, b"cd", 2);
        assert_eq!(buf.window(), b"abcd");
    }

    #[test]
    fn test_close_with_gap_is_truncated() {
        let mut buf = DirectionalBuffer::new(false);
        buf.start(0, 0);
        buf.write(1, b"aa", 1);
        buf.write(10, b"zz", 2);
        buf.close();
        assert!(buf.is_truncated());
        assert_eq!(buf.window(), b"aa");
        buf.advance(2);
        assert!(buf.is_drained());
    }

    #[test]
    fn test_write_after_close_dropped() {
        let mut buf = DirectionalBuffer::new(true);
        buf.write(0, b"aa", 1);
        buf.close();
        assert_eq!(buf.write(2, b"bb", 2), 0);
        assert_eq!(buf.window(), b"aa");
    }

    #[test]
    fn test_advance_timestamps_span_chunks() {
        let mut buf = DirectionalBuffer::new(true);
        buf.write(0, b"aaa", 10);
        buf.write(3, b"bbb", 20);
        // Consuming into the second chunk reports the second timestamp.
        assert_eq!(buf.advance(4), 20);
    }
}
