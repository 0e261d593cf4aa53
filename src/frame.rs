//! WebSocket frame model, incremental parser and serializer
//!
//! A [`Frame`] is an immutable value; transformations (extensions, the
//! outgoing fragmentation bookkeeping) build a new frame through
//! [`FrameBuilder`]. [`FrameParser`] decodes one frame at a time from an
//! accumulating [`BytesMut`] and can be resumed after any short read.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CloseReason, Error, Result};
use crate::mask::apply_mask;
use crate::utf8;
use crate::{MEDIUM_MESSAGE_THRESHOLD, SMALL_MESSAGE_THRESHOLD};

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from the low nibble of a header byte
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// RSV1 bit in the first header byte
pub const RSV1: u8 = 0x40;
/// RSV2 bit in the first header byte
pub const RSV2: u8 = 0x20;
/// RSV3 bit in the first header byte
pub const RSV3: u8 = 0x10;

/// An immutable WebSocket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    fin: bool,
    rsv1: bool,
    rsv2: bool,
    rsv3: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>, fin: bool) -> Self {
        Self {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Start building a frame
    pub fn builder(opcode: OpCode) -> FrameBuilder {
        FrameBuilder {
            frame: Frame::new(opcode, Bytes::new(), true),
        }
    }

    /// Start building a frame that copies every field of this one
    pub fn to_builder(&self) -> FrameBuilder {
        FrameBuilder {
            frame: self.clone(),
        }
    }

    /// Create a text frame
    #[inline]
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, data, true)
    }

    /// Create a binary frame
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data, true)
    }

    /// Create a continuation frame
    #[inline]
    pub fn continuation(data: impl Into<Bytes>, fin: bool) -> Self {
        Self::new(OpCode::Continuation, data, fin)
    }

    /// Create a ping frame
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data, true)
    }

    /// Create a pong frame
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data, true)
    }

    /// Create a close frame carrying a status code and reason
    ///
    /// The reason is truncated on a character boundary so the payload stays
    /// within the 125-byte control frame limit.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut end = reason.len().min(SMALL_MESSAGE_THRESHOLD - 2);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        let mut payload = BytesMut::with_capacity(2 + end);
        payload.put_u16(code);
        payload.put_slice(&reason.as_bytes()[..end]);
        Self::new(OpCode::Close, payload.freeze(), true)
    }

    /// Create an empty close frame
    #[inline]
    pub fn close_empty() -> Self {
        Self::new(OpCode::Close, Bytes::new(), true)
    }

    /// Final fragment flag
    #[inline]
    pub fn fin(&self) -> bool {
        self.fin
    }

    /// RSV1 flag
    #[inline]
    pub fn rsv1(&self) -> bool {
        self.rsv1
    }

    /// RSV2 flag
    #[inline]
    pub fn rsv2(&self) -> bool {
        self.rsv2
    }

    /// RSV3 flag
    #[inline]
    pub fn rsv3(&self) -> bool {
        self.rsv3
    }

    /// RSV bits as they appear in the first header byte
    #[inline]
    pub fn rsv_bits(&self) -> u8 {
        let mut bits = 0;
        if self.rsv1 {
            bits |= RSV1;
        }
        if self.rsv2 {
            bits |= RSV2;
        }
        if self.rsv3 {
            bits |= RSV3;
        }
        bits
    }

    /// Frame opcode
    #[inline]
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// Masking key, if the frame was (or will be) masked on the wire
    #[inline]
    pub fn mask(&self) -> Option<[u8; 4]> {
        self.mask
    }

    /// Unmasked payload
    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the frame, returning its payload
    #[inline]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Payload length in bytes
    #[inline]
    pub fn payload_len(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    /// Check if this is the final fragment
    #[inline]
    pub fn is_final(&self) -> bool {
        self.fin
    }

    /// Get the payload as a string (for text frames)
    pub fn as_text(&self) -> Result<&str> {
        utf8::to_str(&self.payload)
    }

    /// Check the control frame invariant: fin set and payload ≤ 125 bytes
    pub fn validate(&self) -> Result<()> {
        if self.opcode.is_control() {
            if !self.fin {
                return Err(Error::Protocol("control frame must not be fragmented"));
            }
            if self.payload.len() > SMALL_MESSAGE_THRESHOLD {
                return Err(Error::Protocol("control frame too large"));
            }
        }
        Ok(())
    }

    /// Parse and validate a close frame payload
    ///
    /// Returns `Ok(None)` for an empty payload (no status code). A one-byte
    /// payload, a code that may not appear on the wire, or a non UTF-8
    /// reason is a protocol error.
    pub fn parse_close(&self) -> Result<Option<CloseReason>> {
        match self.payload.len() {
            0 => Ok(None),
            1 => Err(Error::Protocol("close frame payload of one byte")),
            _ => {
                let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
                if !CloseReason::is_valid_code(code) {
                    return Err(Error::InvalidCloseCode(code));
                }
                let reason = utf8::to_str(&self.payload[2..])?.to_owned();
                Ok(Some(CloseReason::new(code, reason)))
            }
        }
    }

    /// Size of this frame once serialized
    pub fn encoded_len(&self) -> usize {
        header_len(self.payload.len(), self.mask.is_some()) + self.payload.len()
    }

    /// Serialize this frame, masking the payload if a key is set
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut b0 = self.opcode as u8 | self.rsv_bits();
        if self.fin {
            b0 |= 0x80;
        }
        encode_raw(buf, b0, &self.payload, self.mask);
    }
}

/// Builder producing a new [`Frame`]
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    frame: Frame,
}

impl FrameBuilder {
    /// Set the final fragment flag
    pub fn fin(mut self, fin: bool) -> Self {
        self.frame.fin = fin;
        self
    }

    /// Set RSV1
    pub fn rsv1(mut self, rsv1: bool) -> Self {
        self.frame.rsv1 = rsv1;
        self
    }

    /// Set RSV2
    pub fn rsv2(mut self, rsv2: bool) -> Self {
        self.frame.rsv2 = rsv2;
        self
    }

    /// Set RSV3
    pub fn rsv3(mut self, rsv3: bool) -> Self {
        self.frame.rsv3 = rsv3;
        self
    }

    /// Set the opcode
    pub fn opcode(mut self, opcode: OpCode) -> Self {
        self.frame.opcode = opcode;
        self
    }

    /// Set or clear the masking key
    pub fn mask(mut self, mask: Option<[u8; 4]>) -> Self {
        self.frame.mask = mask;
        self
    }

    /// Replace the payload
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.frame.payload = payload.into();
        self
    }

    /// Build the frame
    pub fn build(self) -> Frame {
        self.frame
    }
}

#[inline]
fn header_len(payload_len: usize, masked: bool) -> usize {
    2 + if payload_len > MEDIUM_MESSAGE_THRESHOLD {
        8
    } else if payload_len > SMALL_MESSAGE_THRESHOLD {
        2
    } else {
        0
    } + if masked { 4 } else { 0 }
}

/// Encode a frame from its raw first byte (FIN | RSV | opcode)
///
/// The length prefix is 1, 3 or 9 bytes depending on the payload size.
/// When `mask` is set the payload is copied and masked.
pub fn encode_raw(buf: &mut BytesMut, first_byte: u8, payload: &[u8], mask: Option<[u8; 4]>) {
    let payload_len = payload.len();
    buf.reserve(header_len(payload_len, mask.is_some()) + payload_len);

    buf.put_u8(first_byte);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if payload_len <= SMALL_MESSAGE_THRESHOLD {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= MEDIUM_MESSAGE_THRESHOLD {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(payload_len as u64);
    }

    if let Some(m) = mask {
        buf.put_slice(&m);
        let start = buf.len();
        buf.put_slice(payload);
        apply_mask(&mut buf[start..], m);
    } else {
        buf.put_slice(payload);
    }
}

/// Encode a frame with the given opcode and fin flag
#[inline]
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) {
    let b0 = opcode as u8 | if fin { 0x80 } else { 0 };
    encode_raw(buf, b0, payload, mask);
}

/// Parser cursor: which part of the frame is expected next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    /// Opcode byte and 7-bit length byte
    #[default]
    Header,
    /// 2- or 8-byte extended length
    ExtendedLength,
    /// 4-byte masking key
    MaskKey,
    /// Payload bytes
    Payload,
}

/// Partially-read fields of the frame being parsed
#[derive(Debug, Clone, Default)]
pub struct ParsingState {
    stage: Stage,
    first_byte: u8,
    length_code: u8,
    length: u64,
    masked: bool,
    mask: [u8; 4],
}

impl ParsingState {
    /// Current stage
    #[inline]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Reset to the header stage for the next frame
    #[inline]
    pub fn recycle(&mut self) {
        *self = Self::default();
    }
}

/// Which masking direction the parser enforces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskPolicy {
    /// Accept masked and unmasked frames
    Any,
    /// Every frame must be masked (server reading client frames)
    Required,
    /// No frame may be masked (client reading server frames)
    Forbidden,
}

/// Incremental frame parser
///
/// Each call to [`parse`](FrameParser::parse) consumes the bytes of at most
/// one frame. Bytes are only consumed once a whole stage is available, so
/// a short read leaves the buffer and the cursor ready to resume. After an
/// error the parser refuses further input.
#[derive(Debug)]
pub struct FrameParser {
    state: ParsingState,
    max_frame_size: usize,
    mask_policy: MaskPolicy,
    failed: bool,
}

impl FrameParser {
    /// Create a new frame parser
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            state: ParsingState::default(),
            max_frame_size,
            mask_policy: MaskPolicy::Any,
            failed: false,
        }
    }

    /// Enforce a masking direction
    pub fn with_mask_policy(mut self, policy: MaskPolicy) -> Self {
        self.mask_policy = policy;
        self
    }

    /// Current parser cursor
    pub fn state(&self) -> &ParsingState {
        &self.state
    }

    /// Parse a frame from the buffer
    ///
    /// Returns:
    /// - Ok(Some(frame)) if a complete frame was parsed
    /// - Ok(None) if more data is needed
    /// - Err(e) if the frame is malformed; the parser is unusable afterwards
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        if self.failed {
            return Err(Error::InvalidState("frame parser failed earlier"));
        }
        match self.step(buf) {
            Ok(frame) => Ok(frame),
            Err(e) => {
                self.failed = true;
                self.state.recycle();
                Err(e)
            }
        }
    }

    fn step(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            match self.state.stage {
                Stage::Header => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    let b0 = buf.get_u8();
                    let b1 = buf.get_u8();

                    let opcode = OpCode::from_u8(b0 & 0x0F)
                        .ok_or(Error::InvalidFrame("unknown opcode"))?;
                    let fin = b0 & 0x80 != 0;
                    if opcode.is_control() && !fin {
                        return Err(Error::Protocol("control frame must not be fragmented"));
                    }

                    let masked = b1 & 0x80 != 0;
                    match self.mask_policy {
                        MaskPolicy::Required if !masked => {
                            return Err(Error::Protocol("client frames must be masked"));
                        }
                        MaskPolicy::Forbidden if masked => {
                            return Err(Error::Protocol("server frames must not be masked"));
                        }
                        _ => {}
                    }

                    let length_code = b1 & 0x7F;
                    self.state.first_byte = b0;
                    self.state.masked = masked;
                    self.state.length_code = length_code;

                    if length_code <= 125 {
                        self.state.length = length_code as u64;
                        self.after_length(opcode)?;
                    } else {
                        if opcode.is_control() {
                            return Err(Error::Protocol("control frame too large"));
                        }
                        self.state.stage = Stage::ExtendedLength;
                    }
                }

                Stage::ExtendedLength => {
                    let length = if self.state.length_code == 126 {
                        if buf.len() < 2 {
                            return Ok(None);
                        }
                        let len = buf.get_u16() as u64;
                        if len <= SMALL_MESSAGE_THRESHOLD as u64 {
                            return Err(Error::Protocol("payload length not minimal"));
                        }
                        len
                    } else {
                        if buf.len() < 8 {
                            return Ok(None);
                        }
                        let len = buf.get_u64();
                        if len >> 63 != 0 {
                            return Err(Error::Protocol("payload length MSB must be 0"));
                        }
                        if len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
                            return Err(Error::Protocol("payload length not minimal"));
                        }
                        len
                    };
                    self.state.length = length;
                    let opcode = self.opcode();
                    self.after_length(opcode)?;
                }

                Stage::MaskKey => {
                    if buf.len() < 4 {
                        return Ok(None);
                    }
                    buf.copy_to_slice(&mut self.state.mask);
                    self.state.stage = Stage::Payload;
                }

                Stage::Payload => {
                    let length = self.state.length as usize;
                    if buf.len() < length {
                        // Make room for the rest so the socket read lands in one allocation
                        buf.reserve(length - buf.len());
                        return Ok(None);
                    }

                    let mut payload = buf.split_to(length);
                    let mask = if self.state.masked {
                        apply_mask(&mut payload, self.state.mask);
                        Some(self.state.mask)
                    } else {
                        None
                    };

                    let b0 = self.state.first_byte;
                    let frame = Frame {
                        fin: b0 & 0x80 != 0,
                        rsv1: b0 & RSV1 != 0,
                        rsv2: b0 & RSV2 != 0,
                        rsv3: b0 & RSV3 != 0,
                        opcode: self.opcode(),
                        mask,
                        payload: payload.freeze(),
                    };

                    tracing::trace!(
                        opcode = ?frame.opcode,
                        fin = frame.fin,
                        len = frame.payload.len(),
                        "frame parsed"
                    );

                    self.state.recycle();
                    return Ok(Some(frame));
                }
            }
        }
    }

    fn opcode(&self) -> OpCode {
        // Validated in the header stage
        OpCode::from_u8(self.state.first_byte & 0x0F).unwrap_or(OpCode::Continuation)
    }

    fn after_length(&mut self, opcode: OpCode) -> Result<()> {
        if opcode.is_control() && self.state.length > SMALL_MESSAGE_THRESHOLD as u64 {
            return Err(Error::Protocol("control frame too large"));
        }
        if self.state.length > self.max_frame_size as u64 {
            return Err(Error::FrameTooLarge);
        }
        self.state.stage = if self.state.masked {
            Stage::MaskKey
        } else {
            Stage::Payload
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn parse_all(parser: &mut FrameParser, bytes: &[u8]) -> Frame {
        let mut buf = BytesMut::from(bytes);
        let frame = parser.parse(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        frame
    }

    #[test]
    fn test_opcode() {
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(OpCode::Close.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(OpCode::Continuation.is_data());
        assert_eq!(OpCode::from_u8(0x3), None);
        assert_eq!(OpCode::from_u8(0xB), None);
    }

    #[test]
    fn test_parse_small_unmasked() {
        let mut parser = FrameParser::new(1024 * 1024);
        let frame = parse_all(&mut parser, &[0x81, 0x05, b'h', b'e', b'l', b'l', b'o']);
        assert!(frame.fin());
        assert_eq!(frame.opcode(), OpCode::Text);
        assert_eq!(frame.payload().as_ref(), b"hello");
        assert_eq!(parser.state().stage(), Stage::Header);
    }

    #[test]
    fn test_parse_rfc_masked_hello() {
        let mut parser = FrameParser::new(1024).with_mask_policy(MaskPolicy::Required);
        let frame = parse_all(
            &mut parser,
            &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58],
        );
        assert_eq!(frame.payload().as_ref(), b"Hello");
        assert_eq!(frame.mask(), Some([0x37, 0xfa, 0x21, 0x3d]));
    }

    #[test]
    fn test_parse_rejects_mask_policy() {
        let mut parser = FrameParser::new(1024).with_mask_policy(MaskPolicy::Required);
        let mut buf = BytesMut::from(&[0x81, 0x00][..]);
        assert!(parser.parse(&mut buf).is_err());

        let mut parser = FrameParser::new(1024).with_mask_policy(MaskPolicy::Forbidden);
        let mut buf = BytesMut::from(&[0x81, 0x80, 1, 2, 3, 4][..]);
        assert!(parser.parse(&mut buf).is_err());
    }

    #[test]
    fn test_parse_medium_length() {
        let mut parser = FrameParser::new(1024 * 1024);
        let mut buf = BytesMut::new();
        buf.put_u8(0x82);
        buf.put_u8(126);
        buf.put_u16(200);
        buf.put_slice(&[0x42u8; 200]);

        let frame = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(frame.opcode(), OpCode::Binary);
        assert_eq!(frame.payload_len(), 200);
    }

    #[test]
    fn test_length_prefix_boundaries() {
        for (len, header) in [(0usize, 2usize), (125, 2), (126, 4), (65535, 4), (65536, 10)] {
            let payload = vec![7u8; len];
            let mut buf = BytesMut::new();
            encode_frame(&mut buf, OpCode::Binary, &payload, true, None);
            assert_eq!(buf.len(), header + len, "length {}", len);

            let mut parser = FrameParser::new(1 << 20);
            let frame = parser.parse(&mut buf).unwrap().unwrap();
            assert_eq!(frame.payload_len(), len as u64);
        }
    }

    #[test]
    fn test_partial_header_is_resumable() {
        let mut encoded = BytesMut::new();
        Frame::binary(vec![1u8; 300]).encode(&mut encoded);

        let mut parser = FrameParser::new(1 << 20);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded[..1]);
        assert!(parser.parse(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 1);

        buf.extend_from_slice(&encoded[1..3]);
        assert!(parser.parse(&mut buf).unwrap().is_none());
        assert_eq!(parser.state().stage(), Stage::ExtendedLength);

        buf.extend_from_slice(&encoded[3..]);
        let frame = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload_len(), 300);
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        Frame::text("a").encode(&mut buf);
        Frame::ping("b").encode(&mut buf);

        let mut parser = FrameParser::new(1024);
        assert_eq!(parser.parse(&mut buf).unwrap().unwrap().opcode(), OpCode::Text);
        assert_eq!(parser.parse(&mut buf).unwrap().unwrap().opcode(), OpCode::Ping);
        assert!(parser.parse(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_control_frame_fragmentation() {
        let mut parser = FrameParser::new(1024);
        let mut buf = BytesMut::from(&[0x09, 0x00][..]);
        assert!(matches!(parser.parse(&mut buf), Err(Error::Protocol(_))));
        // Parser is poisoned after an error
        let mut buf = BytesMut::from(&[0x89, 0x00][..]);
        assert!(matches!(parser.parse(&mut buf), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_control_frame_extended_length() {
        let mut parser = FrameParser::new(1024);
        let mut buf = BytesMut::from(&[0x89, 126, 0x00, 0x80][..]);
        assert!(parser.parse(&mut buf).is_err());
    }

    #[test]
    fn test_unknown_opcode_and_non_minimal_length() {
        let mut parser = FrameParser::new(1024);
        let mut buf = BytesMut::from(&[0x83, 0x00][..]);
        assert!(parser.parse(&mut buf).is_err());

        let mut parser = FrameParser::new(1024);
        let mut buf = BytesMut::from(&[0x82, 126, 0x00, 0x05][..]);
        assert!(parser.parse(&mut buf).is_err());
    }

    #[test]
    fn test_frame_too_large() {
        let mut parser = FrameParser::new(100);
        let mut buf = BytesMut::from(&[0x82, 126, 0x01, 0x00][..]);
        assert!(matches!(parser.parse(&mut buf), Err(Error::FrameTooLarge)));
    }

    #[test]
    fn test_encode_frame_masked() {
        let mask = [0x01, 0x02, 0x03, 0x04];
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Text, b"test", true, Some(mask));

        assert_eq!(buf[0], 0x81);
        assert_eq!(buf[1], 0x84);
        assert_eq!(&buf[2..6], &mask);

        let mut payload = buf[6..].to_vec();
        apply_mask(&mut payload, mask);
        assert_eq!(&payload, b"test");
    }

    #[test]
    fn test_close_frame() {
        let frame = Frame::close(1000, "goodbye");
        assert_eq!(frame.opcode(), OpCode::Close);

        let close = frame.parse_close().unwrap().unwrap();
        assert_eq!(close.code, 1000);
        assert_eq!(close.reason, "goodbye");

        assert_eq!(Frame::close_empty().parse_close().unwrap(), None);
        assert!(Frame::new(OpCode::Close, vec![0x03], true).parse_close().is_err());
        assert!(matches!(
            Frame::close(1005, "").parse_close(),
            Err(Error::InvalidCloseCode(1005))
        ));
        assert!(Frame::new(OpCode::Close, vec![0x03, 0xe8, 0xff], true)
            .parse_close()
            .is_err());
    }

    #[test]
    fn test_close_reason_truncated() {
        let long = "é".repeat(100);
        let frame = Frame::close(1000, &long);
        assert!(frame.payload_len() <= 125);
        assert!(frame.validate().is_ok());
        assert!(frame.parse_close().is_ok());
    }

    #[test]
    fn test_builder_produces_new_frame() {
        let original = Frame::text("abc");
        let changed = original.to_builder().fin(false).rsv1(true).build();
        assert!(original.fin());
        assert!(!original.rsv1());
        assert!(!changed.fin());
        assert_eq!(changed.rsv_bits(), RSV1);
        assert_eq!(changed.payload(), original.payload());
    }

    fn arb_frame() -> impl Strategy<Value = Frame> {
        let data = (
            prop_oneof![
                Just(OpCode::Continuation),
                Just(OpCode::Text),
                Just(OpCode::Binary)
            ],
            any::<bool>(),
            proptest::collection::vec(any::<u8>(), 0..70_000),
        )
            .prop_map(|(op, fin, payload)| Frame::new(op, payload, fin));
        let control = (
            prop_oneof![Just(OpCode::Ping), Just(OpCode::Pong)],
            proptest::collection::vec(any::<u8>(), 0..=125),
        )
            .prop_map(|(op, payload)| Frame::new(op, payload, true));
        (
            prop_oneof![data, control],
            any::<bool>(),
            any::<bool>(),
            any::<bool>(),
            proptest::option::of(any::<[u8; 4]>()),
        )
            .prop_map(|(f, r1, r2, r3, mask)| {
                f.to_builder().rsv1(r1).rsv2(r2).rsv3(r3).mask(mask).build()
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn round_trip(frame in arb_frame()) {
            let mut buf = BytesMut::new();
            frame.encode(&mut buf);
            prop_assert_eq!(buf.len(), frame.encoded_len());
            let mut parser = FrameParser::new(1 << 20);
            let parsed = parser.parse(&mut buf).unwrap().unwrap();
            prop_assert_eq!(parsed, frame);
        }

        #[test]
        fn split_parse_matches_whole(frame in arb_frame(), cuts in proptest::collection::vec(any::<prop::sample::Index>(), 1..8)) {
            let mut encoded = BytesMut::new();
            frame.encode(&mut encoded);
            let mut points: Vec<usize> = cuts.iter().map(|c| c.index(encoded.len())).collect();
            points.sort_unstable();

            let mut parser = FrameParser::new(1 << 20);
            let mut buf = BytesMut::new();
            let mut start = 0;
            let mut parsed = None;
            for end in points.into_iter().chain(std::iter::once(encoded.len())) {
                buf.extend_from_slice(&encoded[start..end]);
                start = end;
                if let Some(f) = parser.parse(&mut buf).unwrap() {
                    parsed = Some(f);
                }
            }
            prop_assert_eq!(parsed, Some(frame));
        }
    }
}
