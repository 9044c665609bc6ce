use std::collections::VecDeque;
use std::io::IoSlice;

use bytes::{BufMut, Bytes, BytesMut};

/// An ordered sequence of byte chunks with a head-side offset.
///
/// Receive queues push chunks as they come off the wire and pop exact
/// frame lengths; send queues push whole frames and consume whatever the
/// kernel accepted. `len()` is always the sum of the chunk lengths minus
/// the head offset.
#[derive(Debug, Default)]
pub struct ByteQueue {
    chunks: VecDeque<Bytes>,
    offset: usize,
    len: usize,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }

        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Copy the head of the queue into `dst` without consuming it.
    /// Returns `false` when fewer than `dst.len()` bytes are queued.
    pub fn peek(&self, dst: &mut [u8]) -> bool {
        if self.len < dst.len() {
            return false;
        }

        let mut copied = 0;

        for (idx, chunk) in self.chunks.iter().enumerate() {
            let chunk = if idx == 0 { &chunk[self.offset..] } else { &chunk[..] };

            let take = chunk.len().min(dst.len() - copied);
            dst[copied..copied + take].copy_from_slice(&chunk[..take]);
            copied += take;

            if copied == dst.len() {
                return true;
            }
        }

        false
    }

    /// Pop exactly `n` bytes as one contiguous chunk.
    ///
    /// Callers check `len()` first; popping more than is queued is a
    /// logic error.
    pub fn pop(&mut self, n: usize) -> Bytes {
        assert!(n <= self.len, "pop of {n} bytes from a queue of {}", self.len);

        if n == 0 {
            return Bytes::new();
        }

        // fast path: the head chunk alone covers the request
        let head_remaining = self.chunks.front().map_or(0, |c| c.len() - self.offset);

        if head_remaining >= n {
            let head = self.chunks.front().expect("peeked above");
            let out = head.slice(self.offset..self.offset + n);
            self.consume(n);
            return out;
        }

        let mut out = BytesMut::with_capacity(n);
        let mut remaining = n;

        while remaining > 0 {
            let head = self.chunks.front().expect("len invariant");
            let avail = head.len() - self.offset;
            let take = avail.min(remaining);

            out.put_slice(&head[self.offset..self.offset + take]);
            remaining -= take;
            self.consume(take);
        }

        out.freeze()
    }

    /// Drop `n` bytes off the head, advancing the offset and releasing
    /// exhausted chunks.
    pub fn consume(&mut self, mut n: usize) {
        assert!(n <= self.len, "consume of {n} bytes from a queue of {}", self.len);

        self.len -= n;

        while n > 0 {
            let head_len = self.chunks.front().expect("len invariant").len();
            let avail = head_len - self.offset;

            if n < avail {
                self.offset += n;
                return;
            }

            n -= avail;
            self.offset = 0;
            self.chunks.pop_front();
        }
    }

    /// Fill `out` with I/O slices over the queued bytes, head offset
    /// applied, for a single vectored write.
    pub fn io_slices<'a>(&'a self, out: &mut Vec<IoSlice<'a>>) {
        for (idx, chunk) in self.chunks.iter().enumerate() {
            let chunk = if idx == 0 { &chunk[self.offset..] } else { &chunk[..] };

            if !chunk.is_empty() {
                out.push(IoSlice::new(chunk));
            }
        }
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.offset = 0;
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_tracks_length_across_push_pop_consume() {
        let mut q = ByteQueue::new();
        assert!(q.is_empty());

        q.push(Bytes::from_static(b"hello"));
        q.push(Bytes::from_static(b" world"));
        assert_eq!(q.len(), 11);

        let head = q.pop(3);
        assert_eq!(&head[..], b"hel");
        assert_eq!(q.len(), 8);

        q.consume(2);
        assert_eq!(q.len(), 6);
        assert_eq!(&q.pop(6)[..], b" world");
        assert!(q.is_empty());
    }

    #[test]
    fn it_peeks_across_chunk_boundaries() {
        let mut q = ByteQueue::new();
        q.push(Bytes::from_static(b"\x05\x00"));
        q.push(Bytes::from_static(b"\x00\x01rest"));

        let mut header = [0u8; 4];
        assert!(q.peek(&mut header));
        assert_eq!(header, [5, 0, 0, 1]);

        // peeking does not consume
        assert_eq!(q.len(), 8);
    }

    #[test]
    fn it_refuses_a_short_peek() {
        let mut q = ByteQueue::new();
        q.push(Bytes::from_static(b"\x05\x00\x00"));

        let mut header = [0u8; 4];
        assert!(!q.peek(&mut header));
    }

    #[test]
    fn it_pops_across_chunk_boundaries() {
        let mut q = ByteQueue::new();
        q.push(Bytes::from_static(b"ab"));
        q.push(Bytes::from_static(b"cd"));
        q.push(Bytes::from_static(b"ef"));

        assert_eq!(&q.pop(5)[..], b"abcde");
        assert_eq!(&q.pop(1)[..], b"f");
        assert!(q.is_empty());
    }

    #[test]
    fn it_exposes_io_slices_with_the_offset_applied() {
        let mut q = ByteQueue::new();
        q.push(Bytes::from_static(b"abcd"));
        q.push(Bytes::from_static(b"efgh"));
        q.consume(2);

        let mut slices = Vec::new();
        q.io_slices(&mut slices);

        assert_eq!(slices.len(), 2);
        assert_eq!(&*slices[0], b"cd");
        assert_eq!(&*slices[1], b"efgh");
    }
}
