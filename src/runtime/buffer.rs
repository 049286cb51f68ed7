//! Fixed-capacity outbound buffer.
//!
//! The protocol handler appends response bytes at `read_end` and the write
//! path drains them from `write_cursor`. The buffer never grows: an append
//! past capacity is rejected with [`BufferOverflow`] and leaves the buffer
//! untouched.
//!
//! ```text
//! 0        write_cursor        read_end            capacity
//! |  sent  |      pending      |       free        |
//! ```

use std::fmt;

/// Error returned when an append would exceed the buffer capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferOverflow {
    /// Capacity of the buffer that rejected the append.
    pub capacity: usize,
}

impl fmt::Display for BufferOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "send buffer full ({} bytes)", self.capacity)
    }
}

impl std::error::Error for BufferOverflow {}

/// Outbound byte queue with a send cursor.
///
/// Invariant: `write_cursor <= read_end <= capacity`.
#[derive(Debug)]
pub struct SendBuffer {
    buf: Box<[u8]>,
    /// Next byte to transmit.
    write_cursor: usize,
    /// One past the last queued byte.
    read_end: usize,
}

impl SendBuffer {
    /// Create an empty buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            write_cursor: 0,
            read_end: 0,
        }
    }

    /// Maximum number of bytes the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Offset of the next byte to transmit.
    pub fn write_cursor(&self) -> usize {
        self.write_cursor
    }

    /// Offset one past the last queued byte.
    pub fn read_end(&self) -> usize {
        self.read_end
    }

    /// Bytes queued but not yet transmitted.
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.write_cursor..self.read_end]
    }

    /// Whether any queued bytes remain to be transmitted.
    pub fn has_pending(&self) -> bool {
        self.write_cursor < self.read_end
    }

    /// Queue a single byte.
    pub fn push(&mut self, byte: u8) -> Result<(), BufferOverflow> {
        if self.read_end >= self.capacity() {
            return Err(BufferOverflow {
                capacity: self.capacity(),
            });
        }
        self.buf[self.read_end] = byte;
        self.read_end += 1;
        Ok(())
    }

    /// Record that `n` pending bytes were transmitted.
    ///
    /// Returns `true` when the queue is fully drained, in which case both
    /// cursors are rewound to the start of the buffer.
    pub fn consume(&mut self, n: usize) -> bool {
        debug_assert!(n <= self.read_end - self.write_cursor, "consumed past read_end");
        self.write_cursor = (self.write_cursor + n).min(self.read_end);
        if self.write_cursor == self.read_end {
            self.clear();
            true
        } else {
            false
        }
    }

    /// Drop all queued bytes and rewind both cursors.
    pub fn clear(&mut self) {
        self.write_cursor = 0;
        self.read_end = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_consume() {
        let mut buf = SendBuffer::new(8);
        assert!(!buf.has_pending());

        for &b in b"hello" {
            buf.push(b).unwrap();
        }
        assert_eq!(buf.pending(), b"hello");

        // Partial drain keeps the remaining bytes in place
        assert!(!buf.consume(2));
        assert_eq!(buf.write_cursor(), 2);
        assert_eq!(buf.pending(), b"llo");

        // Full drain rewinds
        assert!(buf.consume(3));
        assert_eq!(buf.write_cursor(), 0);
        assert_eq!(buf.read_end(), 0);
        assert!(buf.pending().is_empty());
    }

    #[test]
    fn test_capacity_is_hard_ceiling() {
        let mut buf = SendBuffer::new(3);
        buf.push(b'a').unwrap();
        buf.push(b'b').unwrap();
        buf.push(b'c').unwrap();

        assert_eq!(buf.push(b'd'), Err(BufferOverflow { capacity: 3 }));
        assert_eq!(buf.pending(), b"abc");
        assert_eq!(buf.read_end(), buf.capacity());
    }

    #[test]
    fn test_sent_bytes_do_not_free_space_until_drained() {
        let mut buf = SendBuffer::new(2);
        buf.push(b'a').unwrap();
        buf.push(b'b').unwrap();
        buf.consume(1);

        // Space before write_cursor is only reclaimed by a full drain
        assert!(buf.push(b'c').is_err());
        assert!(buf.consume(1));
        buf.push(b'c').unwrap();
        assert_eq!(buf.pending(), b"c");
    }
}
