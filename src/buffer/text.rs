use crate::error::{Error, Result};

use super::grown_capacity;

/// Accumulates the pieces of a fragmented text message
#[derive(Debug)]
pub struct TextBuffer {
    limit: usize,
    buffer: String,
    received_last: bool,
    overflowed: bool,
}

impl TextBuffer {
    /// Create a buffer holding at most `limit` bytes per message
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            buffer: String::new(),
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
    ///
    /// Pieces arriving after an overflow are dropped until the next
    /// [`reset`](Self::reset).
    pub fn append(&mut self, piece: &str, last: bool) -> Result<Option<String>> {
        if self.overflowed {
            return Ok(None);
        }

        let needed = self.buffer.len() + piece.len();
        if needed > self.limit {
            tracing::debug!(
                buffered = self.buffer.len(),
                incoming = piece.len(),
                limit = self.limit,
                "text message exceeds buffer limit"
            );
            self.buffer = String::new();
            self.received_last = true;
            self.overflowed = true;
            return Err(Error::MessageTooBig);
        }

        if needed > self.buffer.capacity() {
            let target = grown_capacity(needed, self.limit);
            self.buffer.reserve(target - self.buffer.len());
        }
        self.buffer.push_str(piece);

        if last {
            self.received_last = true;
            return Ok(Some(std::mem::take(&mut self.buffer)));
        }
        Ok(None)
    }
}
