use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// Default cap on bytes held while a connection is still settling.
pub const EARLY_BUFFER_MAX_BYTES: usize = 1_000_000;

/// Binary data that arrived before the render sink was ready.
///
/// Bounded by total size; on overflow whole chunks are dropped from the
/// front, oldest first. A chatty session can therefore lose the start of its
/// replayed backlog. Every drop is logged.
#[derive(Debug)]
pub struct EarlyBuffer {
    max_bytes: usize,
    chunks: VecDeque<Bytes>,
    size: usize,
    dropped: usize,
}

impl EarlyBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            chunks: VecDeque::new(),
            size: 0,
            dropped: 0,
        }
    }

    pub fn len_bytes(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Bytes discarded by overflow since the last [`clear`](Self::clear).
    pub fn dropped_bytes(&self) -> usize {
        self.dropped
    }

    pub fn push(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.size += data.len();
        self.chunks.push_back(data);

        let mut dropped_now = 0;
        while self.size > self.max_bytes {
            let Some(oldest) = self.chunks.pop_front() else {
                break;
            };
            self.size -= oldest.len();
            dropped_now += oldest.len();
        }
        if dropped_now > 0 {
            self.dropped += dropped_now;
            tracing::warn!(
                dropped = dropped_now,
                kept = self.size,
                max = self.max_bytes,
                "early data buffer overflow, dropped oldest output"
            );
        }
    }

    /// Take every buffered chunk, in arrival order.
    pub fn drain(&mut self) -> Vec<Bytes> {
        self.size = 0;
        self.chunks.drain(..).collect()
    }

    /// Everything buffered, concatenated. Mainly for inspection.
    pub fn contents(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size);
        for chunk in &self.chunks {
            buf.extend_from_slice(chunk);
        }
        buf.freeze()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.size = 0;
        self.dropped = 0;
    }
}

impl Default for EarlyBuffer {
    fn default() -> Self {
        Self::new(EARLY_BUFFER_MAX_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_chunks_in_order() {
        let mut buf = EarlyBuffer::new(100);
        buf.push(Bytes::from_static(b"abc"));
        buf.push(Bytes::from_static(b"def"));
        assert_eq!(buf.len_bytes(), 6);
        assert_eq!(buf.contents(), Bytes::from_static(b"abcdef"));
        assert_eq!(buf.drain(), vec![Bytes::from_static(b"abc"), Bytes::from_static(b"def")]);
        assert!(buf.is_empty());
    }

    #[test]
    fn overflow_drops_oldest_whole_chunks() {
        let mut buf = EarlyBuffer::new(10);
        buf.push(Bytes::from_static(b"aaaa"));
        buf.push(Bytes::from_static(b"bbbb"));
        buf.push(Bytes::from_static(b"cccc"));
        assert_eq!(buf.contents(), Bytes::from_static(b"bbbbcccc"));
        assert_eq!(buf.dropped_bytes(), 4);
    }

    #[test]
    fn single_oversized_chunk_is_dropped_entirely() {
        let mut buf = EarlyBuffer::new(4);
        buf.push(Bytes::from_static(b"0123456789"));
        assert!(buf.is_empty());
        assert_eq!(buf.dropped_bytes(), 10);
    }

    #[test]
    fn clear_resets_drop_counter() {
        let mut buf = EarlyBuffer::new(2);
        buf.push(Bytes::from_static(b"xyz"));
        buf.clear();
        assert_eq!(buf.dropped_bytes(), 0);
        assert_eq!(buf.len_bytes(), 0);
    }
}
