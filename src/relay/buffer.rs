use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// One decoded payload from the voice service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Local enqueue order. Diagnostic only, never sent.
    pub seq: u64,
    pub payload: Bytes,
}

/// Bounded queue of voice-service audio awaiting delivery to the caller.
///
/// Full buffers drop their oldest chunk. A relay owns exactly one buffer and
/// only its voice-to-caller path touches it, so flushes and drains never
/// interleave.
#[derive(Debug)]
pub struct JitterBuffer {
    chunks: VecDeque<AudioChunk>,
    capacity: usize,
    next_seq: u64,
    evicted: u64,
}

impl JitterBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            chunks: VecDeque::with_capacity(capacity),
            capacity,
            next_seq: 0,
            evicted: 0,
        }
    }

    /// Append a payload, evicting the oldest chunk when full. Returns the
    /// sequence number assigned to it.
    pub fn push(&mut self, payload: Bytes) -> u64 {
        if self.chunks.len() == self.capacity {
            if let Some(oldest) = self.chunks.pop_front() {
                self.evicted += 1;
                tracing::warn!(
                    seq = oldest.seq,
                    evicted_total = self.evicted,
                    "Jitter buffer full, dropped oldest chunk"
                );
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.chunks.push_back(AudioChunk { seq, payload });
        seq
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Discard everything buffered (barge-in). Returns how many chunks went.
    pub fn flush(&mut self) -> usize {
        let dropped = self.chunks.len();
        self.chunks.clear();
        dropped
    }

    /// Take every buffered chunk, concatenated in arrival order.
    pub fn drain_combined(&mut self) -> Option<Bytes> {
        if self.chunks.is_empty() {
            return None;
        }

        let total = self.chunks.iter().map(|c| c.payload.len()).sum();
        let mut combined = BytesMut::with_capacity(total);
        let mut last_seq = None;
        for chunk in self.chunks.drain(..) {
            debug_assert!(last_seq.map_or(true, |s| s < chunk.seq));
            last_seq = Some(chunk.seq);
            combined.extend_from_slice(&chunk.payload);
        }
        Some(combined.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(bytes: &'static [u8]) -> Bytes {
        Bytes::from_static(bytes)
    }

    #[test]
    fn drains_in_arrival_order() {
        let mut buf = JitterBuffer::new(8);
        buf.push(chunk(b"ab"));
        buf.push(chunk(b"cd"));
        buf.push(chunk(b"ef"));

        assert_eq!(buf.len(), 3);
        assert_eq!(buf.drain_combined().unwrap(), chunk(b"abcdef"));
        assert!(buf.is_empty());
        assert_eq!(buf.drain_combined(), None);
    }

    #[test]
    fn sequence_numbers_keep_increasing() {
        let mut buf = JitterBuffer::new(2);
        assert_eq!(buf.push(chunk(b"a")), 0);
        assert_eq!(buf.push(chunk(b"b")), 1);
        buf.flush();
        assert_eq!(buf.push(chunk(b"c")), 2);
    }

    #[test]
    fn full_buffer_drops_oldest() {
        let mut buf = JitterBuffer::new(3);
        for payload in [b"1", b"2", b"3", b"4", b"5"] {
            buf.push(Bytes::from_static(payload));
        }

        assert_eq!(buf.len(), 3);
        assert_eq!(buf.evicted, 2);
        assert_eq!(buf.drain_combined().unwrap(), chunk(b"345"));
    }

    #[test]
    fn flush_discards_everything() {
        let mut buf = JitterBuffer::new(4);
        buf.push(chunk(b"stale"));
        buf.push(chunk(b"stale"));

        assert_eq!(buf.flush(), 2);
        assert!(buf.is_empty());

        buf.push(chunk(b"fresh"));
        assert_eq!(buf.drain_combined().unwrap(), chunk(b"fresh"));
    }

    #[test]
    fn zero_capacity_holds_one_chunk() {
        let mut buf = JitterBuffer::new(0);
        buf.push(chunk(b"a"));
        buf.push(chunk(b"b"));
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.drain_combined().unwrap(), chunk(b"b"));
    }

    #[test]
    fn buffers_are_independent() {
        let mut first = JitterBuffer::new(4);
        let mut second = JitterBuffer::new(4);
        first.push(chunk(b"one"));
        second.push(chunk(b"two"));

        first.flush();
        assert!(first.is_empty());
        assert_eq!(second.drain_combined().unwrap(), chunk(b"two"));
    }
}
