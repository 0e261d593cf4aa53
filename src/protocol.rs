//! WebSocket protocol handler
//!
//! The send half, [`ProtocolHandler`], is shared between every thread that
//! may write to a connection. It serializes frames under one lock, runs the
//! outgoing extension chain, masks client frames, and enforces that at most
//! one fragmented message is in flight: a whole-message send that finds a
//! partial send of another type in progress waits on a condition variable
//! for a bounded time, then fails.
//!
//! The receive half, [`FrameReceiver`], is owned by the thread driving the
//! connection's reads. It turns buffered bytes into [`Incoming`] events:
//! parse, RSV check, incoming extension chain, fragmentation tracking and
//! UTF-8 decoding of text payloads.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{CloseReason, Error, Result};
use crate::extension::ExtensionPipeline;
use crate::fragment::{FragmentTracker, OutgoingFragments, check_rsv};
use crate::frame::{Frame, FrameParser, MaskPolicy, OpCode};
use crate::mask::{SharedMaskGenerator, default_mask_generator};
use crate::utf8::Utf8Decoder;
use crate::writer::{SendFuture, SharedWriter, WriteCompletion};
use crate::{DEFAULT_SEND_TIMEOUT, SMALL_MESSAGE_THRESHOLD};

/// WebSocket endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client (must mask frames)
    Client,
    /// Server (must not mask frames)
    Server,
}

impl Role {
    /// Whether this is the client side
    #[inline]
    pub fn is_client(self) -> bool {
        self == Role::Client
    }

    /// Mask policy applied to frames received by this side
    pub fn incoming_mask_policy(self, strict: bool) -> MaskPolicy {
        match (self, strict) {
            (_, false) => MaskPolicy::Any,
            (Role::Server, true) => MaskPolicy::Required,
            (Role::Client, true) => MaskPolicy::Forbidden,
        }
    }
}

/// Outgoing partial-message state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendState {
    /// No partial message in flight
    #[default]
    Idle,
    /// A fragmented text message is being sent
    SendingText,
    /// A fragmented binary message is being sent
    SendingBinary,
}

impl SendState {
    fn for_opcode(opcode: OpCode) -> Self {
        match opcode {
            OpCode::Text => SendState::SendingText,
            _ => SendState::SendingBinary,
        }
    }
}

#[derive(Debug, Default)]
struct SendSide {
    state: SendState,
    fragments: OutgoingFragments,
}

type CloseListener = Box<dyn Fn(&CloseReason) + Send + Sync>;

/// Send half of a connection
pub struct ProtocolHandler {
    role: Role,
    writer: SharedWriter,
    masks: SharedMaskGenerator,
    pipeline: Arc<ExtensionPipeline>,
    send: Mutex<SendSide>,
    idle: Condvar,
    send_timeout: Duration,
    close_listener: OnceLock<CloseListener>,
}

impl ProtocolHandler {
    /// Create a send half writing to `writer` through `pipeline`
    pub fn new(role: Role, writer: SharedWriter, pipeline: Arc<ExtensionPipeline>) -> Self {
        Self {
            role,
            writer,
            masks: default_mask_generator(),
            pipeline,
            send: Mutex::new(SendSide::default()),
            idle: Condvar::new(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            close_listener: OnceLock::new(),
        }
    }

    /// Replace the masking key generator
    pub fn with_mask_generator(mut self, masks: SharedMaskGenerator) -> Self {
        self.masks = masks;
        self
    }

    /// Bound on the wait for an in-flight partial message
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Endpoint role
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Negotiated extensions
    pub fn pipeline(&self) -> &Arc<ExtensionPipeline> {
        &self.pipeline
    }

    /// Underlying writer
    pub fn writer(&self) -> &SharedWriter {
        &self.writer
    }

    /// Current partial-send state
    pub fn send_state(&self) -> SendState {
        self.send.lock().state
    }

    /// Register the callback run by [`close`](Self::close)
    ///
    /// Returns `false` if a listener was already installed.
    pub fn set_close_listener(&self, listener: impl Fn(&CloseReason) + Send + Sync + 'static) -> bool {
        self.close_listener.set(Box::new(listener)).is_ok()
    }

    /// Send a whole text message
    pub fn send_text(&self, text: &str) -> Result<SendFuture> {
        self.send_message(Frame::text(Bytes::copy_from_slice(text.as_bytes())))
    }

    /// Send a whole binary message
    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<SendFuture> {
        self.send_message(Frame::binary(data))
    }

    /// Send one fragment of a text message
    pub fn stream_text(&self, fragment: &str, last: bool) -> Result<SendFuture> {
        self.stream(
            OpCode::Text,
            Bytes::copy_from_slice(fragment.as_bytes()),
            last,
        )
    }

    /// Send one fragment of a binary message
    pub fn stream_binary(&self, fragment: impl Into<Bytes>, last: bool) -> Result<SendFuture> {
        self.stream(OpCode::Binary, fragment.into(), last)
    }

    /// Send a ping
    pub fn send_ping(&self, payload: impl Into<Bytes>) -> Result<SendFuture> {
        self.send_control(Frame::ping(payload))
    }

    /// Send a pong
    pub fn send_pong(&self, payload: impl Into<Bytes>) -> Result<SendFuture> {
        self.send_control(Frame::pong(payload))
    }

    /// Send an arbitrary frame through fragmentation bookkeeping and extensions
    pub fn send_frame(&self, frame: Frame) -> Result<SendFuture> {
        let mut side = self.send.lock();
        self.write_locked(&mut side, frame)
    }

    /// Write pre-framed bytes once no partial message is in flight
    pub fn send_raw(&self, bytes: Bytes) -> Result<SendFuture> {
        let mut side = self.send.lock();
        self.wait_idle(&mut side)?;
        Ok(self.write_bytes(bytes))
    }

    /// Send a close frame and run the close listener
    ///
    /// Codes that may never be sent explicitly are remapped to 1000. The
    /// listener runs as soon as the frame is handed to the writer; the peer's
    /// acknowledgement is not awaited.
    pub fn close(&self, reason: CloseReason) -> Result<SendFuture> {
        let (future, reason) = self.send_close(reason)?;
        if let Some(listener) = self.close_listener.get() {
            listener(&reason);
        }
        Ok(future)
    }

    /// Send a close frame without running the listener
    ///
    /// Returns the future and the reason actually put on the wire.
    pub fn send_close(&self, reason: CloseReason) -> Result<(SendFuture, CloseReason)> {
        let code = CloseReason::outgoing_code(reason.code, self.role.is_client());
        if !CloseReason::is_valid_code(code) {
            return Err(Error::InvalidCloseCode(code));
        }
        let mut text = reason.reason;
        let limit = SMALL_MESSAGE_THRESHOLD - 2;
        if text.len() > limit {
            let mut end = limit;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
        }
        let reason = CloseReason::new(code, text);
        let future = self.send_control(Frame::close(code, &reason.reason))?;
        Ok((future, reason))
    }

    /// Send a complete data frame once no partial message is in flight
    pub fn send_message(&self, frame: Frame) -> Result<SendFuture> {
        let mut side = self.send.lock();
        self.wait_idle(&mut side)?;
        self.write_locked(&mut side, frame)
    }

    fn stream(&self, opcode: OpCode, payload: Bytes, last: bool) -> Result<SendFuture> {
        let kind = SendState::for_opcode(opcode);
        let mut side = self.send.lock();
        if side.state != SendState::Idle && side.state != kind {
            self.wait_idle(&mut side)?;
        }
        let future = self.write_locked(&mut side, Frame::new(opcode, payload, last))?;
        side.state = if last { SendState::Idle } else { kind };
        if last {
            self.idle.notify_all();
        }
        Ok(future)
    }

    fn send_control(&self, frame: Frame) -> Result<SendFuture> {
        if frame.payload().len() > SMALL_MESSAGE_THRESHOLD {
            return Err(Error::Protocol("control frame payload exceeds 125 bytes"));
        }
        let mut side = self.send.lock();
        self.write_locked(&mut side, frame)
    }

    fn wait_idle(&self, side: &mut MutexGuard<'_, SendSide>) -> Result<()> {
        if side.state == SendState::Idle {
            return Ok(());
        }
        let deadline = Instant::now() + self.send_timeout;
        while side.state != SendState::Idle {
            if self.idle.wait_until(side, deadline).timed_out() && side.state != SendState::Idle {
                tracing::debug!(state = ?side.state, "timed out waiting for partial send");
                return Err(Error::InvalidState(
                    "a partial message of another type is still being sent",
                ));
            }
        }
        Ok(())
    }

    fn write_locked(&self, side: &mut SendSide, frame: Frame) -> Result<SendFuture> {
        let frame = side.fragments.prepare(frame)?;
        let frame = self.pipeline.outgoing(frame);
        let mask = self.role.is_client().then(|| self.masks.next_mask());
        let frame = frame.to_builder().mask(mask).build();

        let mut buf = BytesMut::with_capacity(frame.encoded_len());
        frame.encode(&mut buf);
        tracing::trace!(
            opcode = ?frame.opcode(),
            fin = frame.fin(),
            len = frame.payload().len(),
            "frame sent"
        );
        Ok(self.write_bytes(buf.freeze()))
    }

    fn write_bytes(&self, bytes: Bytes) -> SendFuture {
        let (completion, future) = WriteCompletion::new();
        self.writer.write(bytes, completion);
        future
    }
}

impl std::fmt::Debug for ProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolHandler")
            .field("role", &self.role)
            .field("pipeline", &self.pipeline)
            .field("send_timeout", &self.send_timeout)
            .finish_non_exhaustive()
    }
}

/// Decoded event produced by the receive half
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// Text payload; partial frames carry only complete characters
    Text {
        /// Decoded characters
        data: String,
        /// First frame of the message
        first: bool,
        /// Last frame of the message
        last: bool,
    },
    /// Binary payload
    Binary {
        /// Payload bytes
        data: Bytes,
        /// First frame of the message
        first: bool,
        /// Last frame of the message
        last: bool,
    },
    /// Ping with its payload
    Ping(Bytes),
    /// Pong with its payload
    Pong(Bytes),
    /// Close with the peer's status, if any
    Close(Option<CloseReason>),
}

/// Receive half of a connection
#[derive(Debug)]
pub struct FrameReceiver {
    role: Role,
    parser: FrameParser,
    tracker: FragmentTracker,
    utf8: Utf8Decoder,
    pipeline: Arc<ExtensionPipeline>,
    failed: bool,
}

impl FrameReceiver {
    /// Create a receive half for `role`
    pub fn new(role: Role, max_frame_size: usize, pipeline: Arc<ExtensionPipeline>) -> Self {
        Self {
            role,
            parser: FrameParser::new(max_frame_size),
            tracker: FragmentTracker::new(),
            utf8: Utf8Decoder::new(),
            pipeline,
            failed: false,
        }
    }

    /// Apply a masking policy to incoming frames
    pub fn with_mask_policy(mut self, policy: MaskPolicy) -> Self {
        self.parser = self.parser.with_mask_policy(policy);
        self
    }

    /// Whether a fragmented message is being received
    pub fn in_fragment(&self) -> bool {
        self.tracker.in_fragment()
    }

    /// Decode the next event from `buf`
    ///
    /// Returns `Ok(None)` when more bytes are needed. After an error the
    /// receiver refuses further input.
    pub fn read(&mut self, buf: &mut BytesMut) -> Result<Option<Incoming>> {
        if self.failed {
            return Err(Error::InvalidState("receiver failed on an earlier frame"));
        }
        let frame = match self.parser.parse(buf) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.failed = true;
                return Err(e);
            }
        };
        self.process(frame).map(Some)
    }

    /// Run one parsed frame through validation, extensions and tracking
    pub fn process(&mut self, frame: Frame) -> Result<Incoming> {
        if self.failed {
            return Err(Error::InvalidState("receiver failed on an earlier frame"));
        }
        let result = self.process_inner(frame);
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn process_inner(&mut self, frame: Frame) -> Result<Incoming> {
        check_rsv(&frame, self.pipeline.reserved_rsv())?;
        let frame = self.pipeline.incoming(frame);

        match frame.opcode() {
            OpCode::Close => {
                let reason = frame.parse_close()?;
                if let Some(r) = &reason {
                    if self.role == Role::Server
                        && matches!(
                            r.code,
                            CloseReason::SERVICE_RESTART | CloseReason::TRY_AGAIN_LATER
                        )
                    {
                        return Err(Error::Protocol("close code reserved for servers"));
                    }
                }
                Ok(Incoming::Close(reason))
            }
            OpCode::Ping => Ok(Incoming::Ping(frame.into_payload())),
            OpCode::Pong => Ok(Incoming::Pong(frame.into_payload())),
            _ => {
                let info = self
                    .tracker
                    .track(&frame)?
                    .ok_or(Error::Protocol("data frame with control opcode"))?;
                match info.message_type {
                    OpCode::Text => {
                        if info.first {
                            self.utf8.reset();
                        }
                        let data = self.utf8.decode(frame.payload(), info.last)?;
                        Ok(Incoming::Text {
                            data,
                            first: info.first,
                            last: info.last,
                        })
                    }
                    _ => Ok(Incoming::Binary {
                        data: frame.into_payload(),
                        first: info.first,
                        last: info.last,
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RSV1;
    use crate::mask::FixedMaskGenerator;
    use crate::writer::MemoryWriter;
    use std::sync::atomic::{AtomicU16, Ordering};

    fn handler(role: Role) -> (Arc<ProtocolHandler>, Arc<MemoryWriter>) {
        let writer = Arc::new(MemoryWriter::new());
        let pipeline = Arc::new(ExtensionPipeline::empty(role.is_client()));
        let handler = ProtocolHandler::new(role, writer.clone(), pipeline)
            .with_mask_generator(Arc::new(FixedMaskGenerator([1, 2, 3, 4])));
        (Arc::new(handler), writer)
    }

    fn receiver(role: Role) -> FrameReceiver {
        FrameReceiver::new(
            role,
            1 << 20,
            Arc::new(ExtensionPipeline::empty(role.is_client())),
        )
    }

    fn drain(rx: &mut FrameReceiver, bytes: &[u8]) -> Vec<Incoming> {
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(event) = rx.read(&mut buf).unwrap() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_server_does_not_mask() {
        let (h, w) = handler(Role::Server);
        h.send_text("Hello").unwrap().wait().unwrap();
        assert_eq!(w.contents(), b"\x81\x05Hello");
    }

    #[test]
    fn test_client_masks() {
        let (h, w) = handler(Role::Client);
        h.send_binary(&b"abc"[..]).unwrap().wait().unwrap();
        let bytes = w.contents();
        assert_eq!(bytes[0], 0x82);
        assert_eq!(bytes[1], 0x80 | 3);
        assert_eq!(&bytes[2..6], &[1, 2, 3, 4]);

        let events = drain(&mut receiver(Role::Server), &bytes);
        assert_eq!(
            events,
            [Incoming::Binary {
                data: Bytes::from_static(b"abc"),
                first: true,
                last: true
            }]
        );
    }

    #[test]
    fn test_stream_rewrites_opcodes() {
        let (h, w) = handler(Role::Server);
        let _sent = h.stream_text("a", false).unwrap();
        assert_eq!(h.send_state(), SendState::SendingText);
        let _sent = h.stream_text("b", false).unwrap();
        let _sent = h.stream_text("c", true).unwrap();
        assert_eq!(h.send_state(), SendState::Idle);

        let chunks = w.take();
        assert_eq!(&chunks[0][..], b"\x01\x01a");
        assert_eq!(&chunks[1][..], b"\x00\x01b");
        assert_eq!(&chunks[2][..], b"\x80\x01c");
    }

    #[test]
    fn test_whole_send_times_out_during_partial() {
        let (h, _w) = handler(Role::Server);
        let h = Arc::new(
            Arc::try_unwrap(h)
                .unwrap()
                .with_send_timeout(Duration::from_millis(50)),
        );
        let _sent = h.stream_binary(&b"a"[..], false).unwrap();
        let err = h.send_text("x").unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        let err = h.stream_text("y", true).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        // Control frames are never held back
        assert!(h.send_ping("p").is_ok());
    }

    #[test]
    fn test_whole_send_waits_for_partial() {
        let (h, w) = handler(Role::Server);
        let _sent = h.stream_binary(&b"a"[..], false).unwrap();

        let other = Arc::clone(&h);
        let finisher = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let _sent = other.stream_binary(&b"b"[..], true).unwrap();
        });
        let _sent = h.send_text("x").unwrap();
        finisher.join().unwrap();

        let chunks = w.take();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1][0], 0x80);
        assert_eq!(chunks[2][0], 0x81);
    }

    #[test]
    fn test_close_remaps_codes() {
        for code in [1005, 1006, 1015] {
            let (h, w) = handler(Role::Server);
            let _sent = h.close(CloseReason::new(code, "")).unwrap();
            assert_eq!(w.contents(), [0x88, 0x02, 0x03, 0xE8]);
        }

        let (h, w) = handler(Role::Client);
        let (_, sent) = h.send_close(CloseReason::new(1013, "later")).unwrap();
        assert_eq!(sent.code, 1000);
        assert_eq!(drain(&mut receiver(Role::Server), &w.contents()), [
            Incoming::Close(Some(CloseReason::new(1000, "later")))
        ]);

        let (h, _) = handler(Role::Server);
        let (_, sent) = h.send_close(CloseReason::new(1013, "")).unwrap();
        assert_eq!(sent.code, 1013);

        let (h, _) = handler(Role::Server);
        assert!(matches!(
            h.close(CloseReason::new(999, "")),
            Err(Error::InvalidCloseCode(999))
        ));
    }

    #[test]
    fn test_close_listener_runs_immediately() {
        let (h, _) = handler(Role::Server);
        let seen = Arc::new(AtomicU16::new(0));
        let sink = Arc::clone(&seen);
        assert!(h.set_close_listener(move |r| sink.store(r.code, Ordering::SeqCst)));
        let _sent = h.close(CloseReason::new(1001, "bye")).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1001);
    }

    #[test]
    fn test_long_close_reason_truncated() {
        let (h, w) = handler(Role::Server);
        let (_, sent) = h.send_close(CloseReason::new(1000, "é".repeat(100))).unwrap();
        assert_eq!(sent.reason.len(), 122);
        assert_eq!(w.contents().len(), 2 + 2 + 122);
    }

    #[test]
    fn test_control_payload_limit() {
        let (h, _) = handler(Role::Server);
        assert!(h.send_pong(vec![0u8; 126]).is_err());
        assert!(h.send_pong(vec![0u8; 125]).is_ok());
    }

    #[test]
    fn test_ping_inside_fragmented_message() {
        let mut buf = BytesMut::new();
        Frame::new(OpCode::Text, &b"Hel"[..], false).encode(&mut buf);
        Frame::ping("p").encode(&mut buf);
        Frame::continuation(&b"lo"[..], true).encode(&mut buf);

        let mut rx = receiver(Role::Client);
        let events = drain(&mut rx, &buf);
        assert_eq!(events.len(), 3);
        assert_eq!(events[1], Incoming::Ping(Bytes::from_static(b"p")));
        assert_eq!(
            events[2],
            Incoming::Text {
                data: "lo".into(),
                first: false,
                last: true
            }
        );
        assert!(!rx.in_fragment());
    }

    #[test]
    fn test_text_split_code_point() {
        let bytes = "é!".as_bytes();
        let mut buf = BytesMut::new();
        Frame::new(OpCode::Text, Bytes::copy_from_slice(&bytes[..1]), false).encode(&mut buf);
        Frame::continuation(Bytes::copy_from_slice(&bytes[1..]), true).encode(&mut buf);

        let events = drain(&mut receiver(Role::Client), &buf);
        let text: String = events
            .into_iter()
            .map(|e| match e {
                Incoming::Text { data, .. } => data,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(text, "é!");
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut buf = BytesMut::new();
        Frame::text(Bytes::from_static(&[0xFF])).encode(&mut buf);
        let mut rx = receiver(Role::Client);
        assert!(matches!(rx.read(&mut buf), Err(Error::InvalidUtf8)));
    }

    #[test]
    fn test_server_rejects_client_restart_code() {
        let mut buf = BytesMut::new();
        Frame::close(1012, "").encode(&mut buf);
        let mut rx = receiver(Role::Server);
        assert!(matches!(rx.read(&mut buf.clone()), Err(Error::Protocol(_))));
        // Receiver is unusable after the failure
        assert!(rx.read(&mut BytesMut::new()).is_err());

        let events = drain(&mut receiver(Role::Client), &buf);
        assert_eq!(events, [Incoming::Close(Some(CloseReason::new(1012, "")))]);
    }

    #[test]
    fn test_rsv_without_extension() {
        let mut rx = receiver(Role::Client);
        let frame = Frame::text("x").to_builder().rsv1(true).build();
        assert_eq!(frame.rsv_bits(), RSV1);
        assert!(rx.process(frame).is_err());
    }

    #[test]
    fn test_unexpected_continuation() {
        let mut rx = receiver(Role::Client);
        assert!(rx.process(Frame::continuation(&b"x"[..], true)).is_err());
    }
}
