//! Fixed-capacity single-producer/single-consumer byte ring.
//!
//! Capacity is rounded up to the next power of two so index arithmetic can use
//! a mask instead of a modulo. The poller thread is both producer and
//! consumer; there is no cross-thread synchronization here.

#[derive(Debug)]
pub struct RingBuffer {
    buf: Vec<u8>,
    mask: usize,
    read_pos: usize,
    write_pos: usize,
}

impl RingBuffer {
    /// Returns a ring buffer with capacity rounded up to the next power of two
    /// that is at least `capacity`.
    pub fn new(capacity: usize) -> RingBuffer {
        let cap = capacity.next_power_of_two().max(1);
        RingBuffer {
            buf: vec![0u8; cap],
            mask: cap - 1,
            read_pos: 0,
            write_pos: 0,
        }
    }

    pub fn cap(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn free(&self) -> usize {
        self.cap() - self.len()
    }

    /// Writes `data` into the ring, failing atomically (no partial write) if
    /// there isn't enough free space.
    pub fn write(&mut self, data: &[u8]) -> bool {
        if data.len() > self.free() {
            return false;
        }
        let start = self.write_pos & self.mask;
        let end = start + data.len();
        if end <= self.buf.len() {
            self.buf[start..end].copy_from_slice(data);
        } else {
            let head = self.buf.len() - start;
            self.buf[start..].copy_from_slice(&data[..head]);
            self.buf[..end - self.buf.len()].copy_from_slice(&data[head..]);
        }
        self.write_pos += data.len();
        true
    }

    /// Returns up to `min(n, len())` bytes without advancing the read
    /// position. Contiguous regions are returned as a zero-copy slice;
    /// wrapped regions are copied out.
    pub fn peek(&self, n: usize) -> std::borrow::Cow<'_, [u8]> {
        let n = n.min(self.len());
        if n == 0 {
            return std::borrow::Cow::Borrowed(&[]);
        }
        let start = self.read_pos & self.mask;
        let end = start + n;
        if end <= self.buf.len() {
            std::borrow::Cow::Borrowed(&self.buf[start..end])
        } else {
            let mut out = Vec::with_capacity(n);
            let head = self.buf.len() - start;
            out.extend_from_slice(&self.buf[start..]);
            out.extend_from_slice(&self.buf[..end - self.buf.len()]);
            std::borrow::Cow::Owned(out)
        }
    }

    /// Advances the read position by `n`, clamped to `len()`. Returns the
    /// number of bytes actually discarded.
    pub fn discard(&mut self, n: usize) -> usize {
        let n = n.min(self.len());
        self.read_pos += n;
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_capacity_to_power_of_two() {
        let r = RingBuffer::new(100);
        assert_eq!(r.cap(), 128);
    }

    #[test]
    fn write_read_fifo() {
        let mut r = RingBuffer::new(8);
        assert!(r.write(b"abcd"));
        assert_eq!(r.len(), 4);
        assert_eq!(&*r.peek(4), b"abcd");
        assert_eq!(r.discard(2), 2);
        assert_eq!(&*r.peek(2), b"cd");
    }

    #[test]
    fn write_fails_atomically_when_too_large() {
        let mut r = RingBuffer::new(4);
        assert!(!r.write(b"12345"));
        assert_eq!(r.len(), 0);
    }

    #[test]
    fn wrap_around_peek_is_contiguous_copy() {
        let mut r = RingBuffer::new(4);
        assert!(r.write(b"ab"));
        assert_eq!(r.discard(2), 2);
        assert!(r.write(b"cdef"));
        assert_eq!(&*r.peek(4), b"cdef");
    }

    #[test]
    fn len_plus_free_equals_cap_after_every_op() {
        let mut r = RingBuffer::new(16);
        let cap = r.cap();
        for i in 0..100u8 {
            let data = [i; 3];
            if r.free() >= data.len() {
                r.write(&data);
            }
            r.discard(1);
            assert_eq!(r.len() + r.free(), cap);
        }
    }

    #[test]
    fn discard_clamps_to_len() {
        let mut r = RingBuffer::new(8);
        r.write(b"ab");
        assert_eq!(r.discard(100), 2);
        assert_eq!(r.len(), 0);
    }
}
