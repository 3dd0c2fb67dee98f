//! A FIFO queue of bytes, used as the backing store for stream buffers.

use std::collections::VecDeque;
use std::io::{Read, Write};

pub struct ByteQueue {
    bytes: VecDeque<u8>,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self {
            bytes: VecDeque::new(),
        }
    }

    pub fn num_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn has_bytes(&self) -> bool {
        !self.bytes.is_empty()
    }

    /// Append all bytes readable from `src`. The caller bounds the read (for
    /// example with [`Read::take`]); this reads until EOF.
    pub fn push_stream<R: Read>(&mut self, mut src: R) -> std::io::Result<usize> {
        let mut buf = Vec::new();
        let num_read = src.read_to_end(&mut buf)?;
        self.bytes.extend(buf);
        Ok(num_read)
    }

    /// Remove up to `max` bytes and write them to `dst`. Returns the number of
    /// bytes removed.
    pub fn pop<W: Write>(&mut self, mut dst: W, max: usize) -> std::io::Result<usize> {
        let num_pop = std::cmp::min(max, self.bytes.len());

        let (front, back) = self.bytes.as_slices();
        if num_pop <= front.len() {
            dst.write_all(&front[..num_pop])?;
        } else {
            dst.write_all(front)?;
            dst.write_all(&back[..num_pop - front.len()])?;
        }

        self.bytes.drain(..num_pop);
        Ok(num_pop)
    }

    /// Remove up to `max` bytes and return them.
    pub fn pop_bytes(&mut self, max: usize) -> bytes::Bytes {
        let num_pop = std::cmp::min(max, self.bytes.len());
        let popped: Vec<u8> = self.bytes.drain(..num_pop).collect();
        bytes::Bytes::from(popped)
    }
}

impl Default for ByteQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop() {
        let mut q = ByteQueue::new();

        let src: &[u8] = b"hello world";
        assert_eq!(q.push_stream(src).unwrap(), 11);
        assert_eq!(q.num_bytes(), 11);

        let mut out = vec![];
        assert_eq!(q.pop(&mut out, 5).unwrap(), 5);
        assert_eq!(&out, b"hello");
        assert_eq!(q.num_bytes(), 6);

        let mut out = vec![];
        assert_eq!(q.pop(&mut out, 100).unwrap(), 6);
        assert_eq!(&out, b" world");
        assert!(!q.has_bytes());
    }

    #[test]
    fn test_bounded_push() {
        let mut q = ByteQueue::new();

        let src: &[u8] = b"123456789";
        assert_eq!(q.push_stream(src.take(4)).unwrap(), 4);
        assert_eq!(q.pop_bytes(100), bytes::Bytes::from_static(b"1234"));
    }

    #[test]
    fn test_pop_empty() {
        let mut q = ByteQueue::new();
        let mut out = vec![];
        assert_eq!(q.pop(&mut out, 10).unwrap(), 0);
        assert!(out.is_empty());
    }
}
