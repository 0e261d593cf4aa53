//! Message buffers
//!
//! Consumers that want whole-message semantics for a fragmented message
//! collect its frames here. [`TextBuffer`] and [`BinaryBuffer`] accumulate
//! until the last frame and hand out the complete message. [`StreamBuffer`]
//! feeds a blocking [`InputStream`] or [`MessageReader`] consumed on a worker
//! thread while frames are still arriving.
//!
//! Every buffer enforces a hard ceiling on the bytes held for one message.
//! Crossing it fails the append with [`Error::MessageTooBig`] once, discards
//! what was buffered and marks the message as finished so no consumer keeps
//! waiting for a terminal frame.
//!
//! [`Error::MessageTooBig`]: crate::Error::MessageTooBig

mod binary;
mod stream;
mod text;

pub use binary::BinaryBuffer;
pub use stream::{InputStream, MessageReader, StreamBuffer};
pub use text::TextBuffer;

/// Capacity step used when a buffer grows
pub const GROWTH_STEP: usize = 256;

/// Capacity to reserve so that `needed` bytes fit, rounded up to
/// [`GROWTH_STEP`] and never above `limit`
#[inline]
pub(crate) fn grown_capacity(needed: usize, limit: usize) -> usize {
    needed
        .div_ceil(GROWTH_STEP)
        .saturating_mul(GROWTH_STEP)
        .min(limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grown_capacity() {
        assert_eq!(grown_capacity(1, 10_000), 256);
        assert_eq!(grown_capacity(256, 10_000), 256);
        assert_eq!(grown_capacity(257, 10_000), 512);
        assert_eq!(grown_capacity(300, 400), 400);
        assert_eq!(grown_capacity(0, 400), 0);
    }
}
