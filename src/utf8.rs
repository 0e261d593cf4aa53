//! UTF-8 validation for text messages
//!
//! Whole payloads are checked with `simdutf8`'s fast path. Fragmented text
//! messages go through [`Utf8Decoder`], which carries the bytes of a code
//! point split across a frame boundary into the next frame.

use crate::error::{Error, Result};

/// Validate that the input is valid UTF-8
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}

/// Borrow the input as `&str`, failing with [`Error::InvalidUtf8`]
#[inline]
pub fn to_str(data: &[u8]) -> Result<&str> {
    simdutf8::basic::from_utf8(data).map_err(|_| Error::InvalidUtf8)
}

/// Check a possibly truncated UTF-8 prefix
///
/// Returns the number of trailing bytes that start a code point not yet
/// complete (0-3), or an error if an invalid sequence appears anywhere.
pub fn incomplete_suffix_len(data: &[u8]) -> Result<usize> {
    match simdutf8::compat::from_utf8(data) {
        Ok(_) => Ok(0),
        // `error_len() == None` means the input ended inside a sequence
        Err(e) if e.error_len().is_none() => Ok(data.len() - e.valid_up_to()),
        Err(_) => Err(Error::InvalidUtf8),
    }
}

/// Incremental decoder for text messages spanning several frames
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    remainder: Vec<u8>,
}

impl Utf8Decoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of an incomplete code point held from the previous frame
    pub fn pending(&self) -> &[u8] {
        &self.remainder
    }

    /// Decode the next piece of a text message
    ///
    /// Returns every complete character. A trailing partial code point is
    /// kept for the next call unless `last` is set, in which case it is an
    /// error.
    pub fn decode(&mut self, data: &[u8], last: bool) -> Result<String> {
        let mut input = std::mem::take(&mut self.remainder);
        input.extend_from_slice(data);

        let tail = incomplete_suffix_len(&input)?;
        if tail > 0 && last {
            return Err(Error::InvalidUtf8);
        }
        let split = input.len() - tail;
        self.remainder = input.split_off(split);

        // The prefix was validated above
        String::from_utf8(input).map_err(|_| Error::InvalidUtf8)
    }

    /// Validate the next piece without producing a string
    pub fn feed(&mut self, data: &[u8], last: bool) -> Result<()> {
        if self.remainder.is_empty() {
            let tail = incomplete_suffix_len(data)?;
            if tail > 0 && last {
                return Err(Error::InvalidUtf8);
            }
            self.remainder.extend_from_slice(&data[data.len() - tail..]);
            return Ok(());
        }
        self.decode(data, last).map(|_| ())
    }

    /// Drop any carried bytes
    pub fn reset(&mut self) {
        self.remainder.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_and_invalid() {
        assert!(validate_utf8(b"Hello, World!"));
        assert!(validate_utf8("Hello, 世界!".as_bytes()));
        assert!(!validate_utf8(&[0xC0, 0x80]));
        assert!(!validate_utf8(&[0xED, 0xA0, 0x80]));
        assert!(!validate_utf8(&[0xFF]));
    }

    #[test]
    fn test_incomplete_suffix() {
        assert_eq!(incomplete_suffix_len(b"hello").unwrap(), 0);
        assert_eq!(incomplete_suffix_len(&[0xC2]).unwrap(), 1);
        assert_eq!(incomplete_suffix_len(&[b'h', b'i', 0xE4, 0xB8]).unwrap(), 2);
        assert!(incomplete_suffix_len(&[0xE4, 0x00]).is_err());
    }

    #[test]
    fn test_decoder_across_frames() {
        let text = "κόσμε";
        let bytes = text.as_bytes();
        let mut decoder = Utf8Decoder::new();

        let first = decoder.decode(&bytes[..3], false).unwrap();
        assert_eq!(first, "κ");
        assert_eq!(decoder.pending().len(), 1);

        let rest = decoder.decode(&bytes[3..], true).unwrap();
        assert_eq!(format!("{}{}", first, rest), text);
        assert!(decoder.pending().is_empty());
    }

    #[test]
    fn test_decoder_rejects_truncated_last() {
        let mut decoder = Utf8Decoder::new();
        assert!(decoder.decode(&[0xE4, 0xB8], true).is_err());
    }

    #[test]
    fn test_feed_byte_by_byte() {
        let text = "日本語 emoji 🎉";
        let mut decoder = Utf8Decoder::new();
        let bytes = text.as_bytes();
        for (i, b) in bytes.iter().enumerate() {
            decoder.feed(&[*b], i + 1 == bytes.len()).unwrap();
        }
        assert!(decoder.pending().is_empty());
    }
}
