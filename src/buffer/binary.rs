use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

use super::grown_capacity;

/// Accumulates the pieces of a fragmented binary message
#[derive(Debug)]
pub struct BinaryBuffer {
    limit: usize,
    buffer: BytesMut,
    received_last: bool,
    overflowed: bool,
}

impl BinaryBuffer {
    /// Create a buffer holding at most `limit` bytes per message
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            buffer: BytesMut::new(),
            received_last: false,
            overflowed: false,
        }
    }

    /// Forget the previous message
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.received_last = false;
        self.overflowed = false;
    }

    /// Bytes currently buffered
    #[inline]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Configured ceiling
    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Whether the current message is finished (completed or abandoned)
    #[inline]
    pub fn received_last(&self) -> bool {
        self.received_last
    }

    /// Append a piece; returns the whole message when `last` is set
    pub fn append(&mut self, piece: &[u8], last: bool) -> Result<Option<Bytes>> {
        if self.overflowed {
            return Ok(None);
        }

        let needed = self.buffer.len() + piece.len();
        if needed > self.limit {
            tracing::debug!(
                buffered = self.buffer.len(),
                incoming = piece.len(),
                limit = self.limit,
                "binary message exceeds buffer limit"
            );
            self.buffer = BytesMut::new();
            self.received_last = true;
            self.overflowed = true;
            return Err(Error::MessageTooBig);
        }

        if needed > self.buffer.capacity() {
            let target = grown_capacity(needed, self.limit);
            self.buffer.reserve(target - self.buffer.len());
        }
        self.buffer.extend_from_slice(piece);

        if last {
            self.received_last = true;
            return Ok(Some(self.buffer.split().freeze()));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembles_message() {
        let mut buf = BinaryBuffer::new(1024);
        assert!(buf.append(b"ab", false).unwrap().is_none());
        assert!(buf.append(b"cd", false).unwrap().is_none());
        let whole = buf.append(b"ef", true).unwrap().unwrap();
        assert_eq!(&whole[..], b"abcdef");
        assert_eq!(buf.buffered(), 0);
    }

    #[test]
    fn test_overflow_marks_last() {
        let mut buf = BinaryBuffer::new(5);
        buf.append(b"abc", false).unwrap();
        assert!(!buf.received_last());
        assert!(matches!(buf.append(b"def", false), Err(Error::MessageTooBig)));
        assert!(buf.received_last());
        assert!(buf.append(b"g", true).unwrap().is_none());
    }
}
