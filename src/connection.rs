//! Per-connection driver
//!
//! A [`Connection`] owns the receive side of one WebSocket: it buffers bytes
//! handed over by the transport, decodes them with a [`FrameReceiver`],
//! answers pings, runs the closing handshake and passes data to the
//! [`MessageDispatcher`]. Any error closes the connection with the matching
//! close code after the error callback ran.

use std::sync::Arc;

use bytes::BytesMut;

use crate::Config;
use crate::error::{CloseReason, Error, Result};
use crate::executor::{SharedExecutor, default_executor};
use crate::extension::{ExtensionContext, ExtensionPipeline, SharedExtension};
use crate::mask::SharedMaskGenerator;
use crate::protocol::{FrameReceiver, Incoming, ProtocolHandler, Role};
use crate::session::{ConnectionId, Handlers, MessageDispatcher, Session};
use crate::writer::{SendFuture, SharedWriter};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    /// Handshake done, not yet opened
    New = 0,
    /// Open for messages
    Connected = 1,
    /// Close frame sent, waiting for the peer's
    Closing = 2,
    /// Closed
    Closed = 3,
}

impl ConnectionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::New,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Assembles a [`Connection`] after a successful handshake
pub struct ConnectionBuilder {
    role: Role,
    writer: SharedWriter,
    config: Config,
    handlers: Handlers,
    executor: Option<SharedExecutor>,
    masks: Option<SharedMaskGenerator>,
    extensions: Vec<SharedExtension>,
    context: ExtensionContext,
    id: Option<ConnectionId>,
    path: String,
    subprotocol: Option<String>,
}

impl ConnectionBuilder {
    /// Start building a connection that writes to `writer`
    pub fn new(role: Role, writer: SharedWriter) -> Self {
        Self {
            role,
            writer,
            config: Config::default(),
            handlers: Handlers::default(),
            executor: None,
            masks: None,
            extensions: Vec::new(),
            context: ExtensionContext::new(),
            id: None,
            path: "/".into(),
            subprotocol: None,
        }
    }

    /// Limits and timeouts
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Callbacks
    pub fn handlers(mut self, handlers: Handlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Executor for streaming handlers
    pub fn executor(mut self, executor: SharedExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Masking key generator for client frames
    pub fn mask_generator(mut self, masks: SharedMaskGenerator) -> Self {
        self.masks = Some(masks);
        self
    }

    /// Negotiated extensions (header order) and their context
    pub fn extensions(mut self, extensions: Vec<SharedExtension>, context: ExtensionContext) -> Self {
        self.extensions = extensions;
        self.context = context;
        self
    }

    /// Connection id; a fresh one is allocated otherwise
    pub fn id(mut self, id: ConnectionId) -> Self {
        self.id = Some(id);
        self
    }

    /// Request target
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Negotiated subprotocol
    pub fn subprotocol(mut self, subprotocol: Option<String>) -> Self {
        self.subprotocol = subprotocol;
        self
    }

    /// Build the connection in state `New`
    pub fn build(self) -> Connection {
        let client = self.role.is_client();
        let pipeline = Arc::new(ExtensionPipeline::new(self.extensions, self.context, client));

        let mut handler = ProtocolHandler::new(self.role, self.writer, Arc::clone(&pipeline))
            .with_send_timeout(self.config.send_timeout);
        if let Some(masks) = self.masks {
            handler = handler.with_mask_generator(masks);
        }

        let receiver = FrameReceiver::new(self.role, self.config.max_frame_size, pipeline)
            .with_mask_policy(self.role.incoming_mask_policy(self.config.require_masked_frames));

        let session = Session::new(
            self.id.unwrap_or_else(ConnectionId::next),
            handler,
            self.path,
            self.subprotocol,
            self.handlers.close_handler(),
        );

        let dispatcher = MessageDispatcher::new(
            self.handlers,
            self.executor.unwrap_or_else(default_executor),
            self.config.max_text_message_buffer_size,
            self.config.max_binary_message_buffer_size,
        );

        Connection {
            session,
            receiver,
            dispatcher,
            buffer: BytesMut::with_capacity(crate::RECV_BUFFER_SIZE),
        }
    }
}

/// Receive-side driver of one connection
#[derive(Debug)]
pub struct Connection {
    session: Session,
    receiver: FrameReceiver,
    dispatcher: MessageDispatcher,
    buffer: BytesMut,
}

impl Connection {
    /// Start building a connection
    pub fn builder(role: Role, writer: SharedWriter) -> ConnectionBuilder {
        ConnectionBuilder::new(role, writer)
    }

    /// Handle used in callbacks
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Connection id
    pub fn id(&self) -> ConnectionId {
        self.session.id()
    }

    /// Lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Whether the connection reached `Closed`
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Move to `Connected` and run the open callback
    pub fn open(&mut self) -> Result<()> {
        self.session
            .transition(ConnectionState::New, ConnectionState::Connected)
            .map_err(|_| Error::InvalidState("connection already opened"))?;
        tracing::debug!(id = %self.id(), path = self.session.path(), "connection open");
        if let Some(on_open) = self.dispatcher.handlers().open_handler() {
            on_open(&self.session);
        }
        Ok(())
    }

    /// Buffer the transport reads into
    pub fn read_buffer(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Append received bytes and process every complete frame
    pub fn feed(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        self.process()
    }

    /// Process every complete frame already in the read buffer
    ///
    /// On error the connection is closed with the matching code before the
    /// error is returned.
    pub fn process(&mut self) -> Result<()> {
        loop {
            if self.is_closed() {
                self.buffer.clear();
                return Ok(());
            }
            let event = match self.receiver.read(&mut self.buffer) {
                Ok(Some(event)) => event,
                Ok(None) => return Ok(()),
                Err(err) => return Err(self.fail(err)),
            };
            if let Err(err) = self.handle(event) {
                return Err(self.fail(err));
            }
        }
    }

    /// Start the closing handshake locally
    pub fn close(&mut self, reason: CloseReason) -> Result<SendFuture> {
        self.session.close(reason)
    }

    /// The transport went away without a closing handshake
    pub fn terminate(&mut self) {
        if self.is_closed() {
            return;
        }
        self.session.set_state(ConnectionState::Closed);
        self.dispatcher.close();
        self.session.handler().writer().close();
        self.session.handler().pipeline().destroy();
        self.session
            .notify_closed(CloseReason::new(CloseReason::ABNORMAL, "connection lost"));
    }

    fn handle(&mut self, event: Incoming) -> Result<()> {
        match event {
            Incoming::Close(reason) => self.on_remote_close(reason),
            Incoming::Ping(payload) => {
                if self.session.is_open() {
                    // Write failures surface through the writer, not here
                    let _pong = self.session.handler().send_pong(payload.clone())?;
                }
                self.dispatcher.dispatch(&self.session, Incoming::Ping(payload))
            }
            Incoming::Pong(_) => self.dispatcher.dispatch(&self.session, event),
            data => {
                if self.session.is_open() {
                    self.dispatcher.dispatch(&self.session, data)
                } else {
                    tracing::trace!(id = %self.id(), "data frame ignored while closing");
                    Ok(())
                }
            }
        }
    }

    fn on_remote_close(&mut self, reason: Option<CloseReason>) -> Result<()> {
        let reported = reason.unwrap_or_else(CloseReason::no_status);
        match self.state() {
            ConnectionState::Connected | ConnectionState::New => {
                self.session.set_state(ConnectionState::Closed);
                match self.session.handler().send_close(reported.clone()) {
                    Ok((_echo, _)) => {}
                    Err(err) => tracing::debug!(id = %self.id(), %err, "close echo not sent"),
                }
                self.finish(reported);
            }
            ConnectionState::Closing => {
                self.session.set_state(ConnectionState::Closed);
                self.finish(reported);
            }
            ConnectionState::Closed => {}
        }
        Ok(())
    }

    fn finish(&mut self, reason: CloseReason) {
        self.dispatcher.close();
        self.session.handler().writer().close();
        self.session.handler().pipeline().destroy();
        self.session.notify_closed(reason);
    }

    fn fail(&mut self, err: Error) -> Error {
        tracing::debug!(id = %self.id(), %err, "closing connection after error");
        if let Some(on_error) = self.dispatcher.handlers().error_handler() {
            on_error(&self.session, &err);
        }

        let reason = CloseReason::new(err.close_code(), err.to_string());
        match self.state() {
            ConnectionState::Connected => {
                if let Err(close_err) = self.session.close(reason.clone()) {
                    tracing::debug!(id = %self.id(), %close_err, "close frame not sent");
                }
            }
            ConnectionState::New => {
                if let Err(close_err) = self.session.handler().send_close(reason.clone()) {
                    tracing::debug!(id = %self.id(), %close_err, "close frame not sent");
                }
            }
            _ => {}
        }
        // Frame boundaries cannot be trusted anymore; skip the peer's echo
        self.session.set_state(ConnectionState::Closed);
        self.finish(reason);
        err
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, OpCode};
    use crate::writer::MemoryWriter;
    use bytes::Bytes;
    use parking_lot::Mutex;

    const KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    fn client_bytes(frames: &[Frame]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for f in frames {
            f.to_builder().mask(Some(KEY)).build().encode(&mut buf);
        }
        buf.to_vec()
    }

    fn server(handlers: Handlers, config: Config) -> (Connection, Arc<MemoryWriter>) {
        let writer = Arc::new(MemoryWriter::new());
        let mut conn = Connection::builder(Role::Server, writer.clone())
            .config(config)
            .handlers(handlers)
            .path("/chat")
            .build();
        conn.open().unwrap();
        (conn, writer)
    }

    fn written_frames(writer: &MemoryWriter) -> Vec<Frame> {
        let mut parser = crate::frame::FrameParser::new(1 << 20);
        let mut buf = BytesMut::from(&writer.contents()[..]);
        let mut frames = Vec::new();
        while let Some(f) = parser.parse(&mut buf).unwrap() {
            frames.push(f);
        }
        frames
    }

    #[derive(Default)]
    struct Log(Mutex<Vec<String>>);

    impl Log {
        fn push(&self, entry: String) {
            self.0.lock().push(entry);
        }
        fn entries(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    fn logging_handlers(log: &Arc<Log>) -> Handlers {
        let (a, b, c, d, e, f) = (
            log.clone(),
            log.clone(),
            log.clone(),
            log.clone(),
            log.clone(),
            log.clone(),
        );
        Handlers::new()
            .on_open(move |s| a.push(format!("open {}", s.path())))
            .on_text(move |_, t| b.push(format!("text {}", t)))
            .on_binary(move |_, d| c.push(format!("binary {}", d.len())))
            .on_ping(move |_, p| d.push(format!("ping {}", p.len())))
            .on_close(move |_, r| e.push(format!("close {}", r.code)))
            .on_error(move |_, err| f.push(format!("error {}", err.close_code())))
    }

    #[test]
    fn test_text_message_and_open() {
        let log = Arc::new(Log::default());
        let (mut conn, _) = server(logging_handlers(&log), Config::default());
        conn.feed(&client_bytes(&[Frame::text("Hello")])).unwrap();
        assert_eq!(log.entries(), ["open /chat", "text Hello"]);
        assert!(conn.open().is_err());
    }

    #[test]
    fn test_split_reads() {
        let log = Arc::new(Log::default());
        let (mut conn, _) = server(logging_handlers(&log), Config::default());
        let bytes = client_bytes(&[Frame::binary(vec![7u8; 300])]);
        for chunk in bytes.chunks(7) {
            conn.feed(chunk).unwrap();
        }
        assert_eq!(log.entries().last().unwrap(), "binary 300");
    }

    #[test]
    fn test_ping_answered_inside_fragment() {
        let log = Arc::new(Log::default());
        let (mut conn, writer) = server(logging_handlers(&log), Config::default());
        conn.feed(&client_bytes(&[
            Frame::new(OpCode::Text, &b"Hel"[..], false),
            Frame::ping("abc"),
            Frame::continuation(&b"lo"[..], true),
        ]))
        .unwrap();

        let out = written_frames(&writer);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].opcode(), OpCode::Pong);
        assert_eq!(&out[0].payload()[..], b"abc");
        assert!(out[0].mask().is_none());
        assert_eq!(log.entries()[1..], ["ping 3", "text Hello"]);
    }

    #[test]
    fn test_remote_close_is_echoed() {
        let log = Arc::new(Log::default());
        let (mut conn, writer) = server(logging_handlers(&log), Config::default());
        conn.feed(&client_bytes(&[Frame::close(1001, "going")])).unwrap();

        assert!(conn.is_closed());
        assert!(writer.is_closed());
        let out = written_frames(&writer);
        assert_eq!(out[0].parse_close().unwrap().unwrap().code, 1001);
        assert_eq!(log.entries()[1..], ["close 1001"]);

        // Nothing is processed after the close
        conn.feed(&client_bytes(&[Frame::text("late")])).unwrap();
        assert_eq!(log.entries().len(), 2);
    }

    #[test]
    fn test_empty_close_reports_no_status() {
        let log = Arc::new(Log::default());
        let (mut conn, writer) = server(logging_handlers(&log), Config::default());
        conn.feed(&client_bytes(&[Frame::close_empty()])).unwrap();
        assert_eq!(log.entries()[1..], ["close 1005"]);
        let out = written_frames(&writer);
        assert_eq!(out[0].parse_close().unwrap().unwrap().code, 1000);
    }

    #[test]
    fn test_local_close_then_echo() {
        let log = Arc::new(Log::default());
        let (mut conn, writer) = server(logging_handlers(&log), Config::default());
        let _sent = conn.close(CloseReason::new(1000, "done")).unwrap();
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert_eq!(log.entries()[1..], ["close 1000"]);
        assert!(conn.session().send_text("nope").is_err());

        conn.feed(&client_bytes(&[Frame::close(1000, "")])).unwrap();
        assert!(conn.is_closed());
        assert!(writer.is_closed());
        // Only the local close frame went out
        assert_eq!(written_frames(&writer).len(), 1);
        assert_eq!(log.entries().len(), 2);
    }

    #[test]
    fn test_message_too_big_closes_with_1009() {
        let log = Arc::new(Log::default());
        let config = Config::builder().max_text_message_buffer_size(8).build();
        let (mut conn, writer) = server(logging_handlers(&log), config);
        let err = conn
            .feed(&client_bytes(&[
                Frame::new(OpCode::Text, &b"12345"[..], false),
                Frame::continuation(&b"67890"[..], true),
            ]))
            .unwrap_err();
        assert!(matches!(err, Error::MessageTooBig));
        assert!(conn.is_closed());

        let out = written_frames(&writer);
        assert_eq!(out[0].parse_close().unwrap().unwrap().code, 1009);
        assert_eq!(log.entries()[1..], ["error 1009", "close 1009"]);
    }

    #[test]
    fn test_protocol_error_closes_with_1002() {
        let log = Arc::new(Log::default());
        let (mut conn, writer) = server(logging_handlers(&log), Config::default());
        let err = conn
            .feed(&client_bytes(&[Frame::continuation(&b"x"[..], true)]))
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        let out = written_frames(&writer);
        assert_eq!(out[0].parse_close().unwrap().unwrap().code, 1002);
    }

    #[test]
    fn test_failure_before_open_still_sends_close() {
        let writer = Arc::new(MemoryWriter::new());
        let mut conn = Connection::builder(Role::Server, writer.clone()).build();
        assert_eq!(conn.state(), ConnectionState::New);
        assert!(conn
            .feed(&client_bytes(&[Frame::continuation(&b"x"[..], true)]))
            .is_err());
        assert!(conn.is_closed());
        let out = written_frames(&writer);
        assert_eq!(out[0].parse_close().unwrap().unwrap().code, 1002);
    }

    #[test]
    fn test_unmasked_frame_rejected_when_required() {
        let config = Config::builder().require_masked_frames(true).build();
        let (mut conn, _) = server(Handlers::new(), config);
        let mut buf = BytesMut::new();
        Frame::text("plain").encode(&mut buf);
        assert!(conn.feed(&buf).is_err());
        assert!(conn.is_closed());
    }

    #[test]
    fn test_invalid_utf8_closes_with_1007() {
        let (mut conn, writer) = server(Handlers::new(), Config::default());
        let bad = Frame::text(Bytes::from_static(&[0xC0, 0x80]));
        assert!(conn.feed(&client_bytes(&[bad])).is_err());
        let out = written_frames(&writer);
        assert_eq!(out[0].parse_close().unwrap().unwrap().code, 1007);
    }

    #[test]
    fn test_terminate_reports_abnormal() {
        let log = Arc::new(Log::default());
        let (mut conn, writer) = server(logging_handlers(&log), Config::default());
        conn.terminate();
        conn.terminate();
        assert!(writer.is_closed());
        assert_eq!(log.entries()[1..], ["close 1006"]);
    }

    struct Passthrough;

    impl crate::extension::Extension for Passthrough {
        fn name(&self) -> &str {
            "passthrough"
        }

        fn process_incoming(&self, _ctx: &mut ExtensionContext, frame: &Frame) -> Result<Frame> {
            Ok(frame.clone())
        }

        fn process_outgoing(&self, _ctx: &mut ExtensionContext, frame: &Frame) -> Result<Frame> {
            Ok(frame.clone())
        }
    }

    fn with_extension(handlers: Handlers) -> (Connection, Arc<MemoryWriter>) {
        let writer = Arc::new(MemoryWriter::new());
        let mut conn = Connection::builder(Role::Server, writer.clone())
            .handlers(handlers)
            .extensions(vec![Arc::new(Passthrough)], ExtensionContext::new())
            .build();
        conn.open().unwrap();
        (conn, writer)
    }

    #[test]
    fn test_extensions_destroyed_on_close_while_session_held() {
        let (mut conn, _) = with_extension(Handlers::new());
        let held = conn.session().clone();
        assert!(!held.handler().pipeline().is_destroyed());

        conn.feed(&client_bytes(&[Frame::close(1000, "")])).unwrap();
        assert!(held.handler().pipeline().is_destroyed());
        drop(conn);
        assert!(held.handler().pipeline().is_destroyed());
    }

    #[test]
    fn test_extensions_destroyed_on_terminate_while_session_held() {
        let (mut conn, _) = with_extension(Handlers::new());
        let held = conn.session().clone();
        conn.terminate();
        assert!(held.handler().pipeline().is_destroyed());
        assert_eq!(held.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_drop_without_close_terminates() {
        let log = Arc::new(Log::default());
        let (conn, writer) = server(logging_handlers(&log), Config::default());
        let held = conn.session().clone();
        drop(conn);
        assert!(writer.is_closed());
        assert_eq!(held.state(), ConnectionState::Closed);
        assert_eq!(log.entries()[1..], ["close 1006"]);
    }

    #[test]
    fn test_client_masks_and_accepts_unmasked() {
        let writer = Arc::new(MemoryWriter::new());
        let received = Arc::new(Log::default());
        let sink = received.clone();
        let mut conn = Connection::builder(Role::Client, writer.clone())
            .handlers(Handlers::new().on_text(move |s, t| {
                sink.push(t.clone());
                let _sent = s.send_text(&t).unwrap();
            }))
            .build();
        conn.open().unwrap();

        let mut buf = BytesMut::new();
        Frame::text("echo").encode(&mut buf);
        conn.feed(&buf).unwrap();

        assert_eq!(received.entries(), ["echo"]);
        let out = written_frames(&writer);
        assert!(out[0].mask().is_some());
        assert_eq!(&out[0].payload()[..], b"echo");
    }
}
