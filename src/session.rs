//! Session handle and message dispatch
//!
//! A [`Session`] is the cheap, clonable handle application code receives in
//! every callback. It identifies the connection and sends on it.
//!
//! [`MessageDispatcher`] routes decoded data frames to the registered
//! [`Handlers`]. Complete single-frame messages prefer the whole-message
//! handler. Frames of a fragmented message prefer the partial handler, then
//! the streaming handler (run on the executor), then the whole-message
//! handler fed through a [`TextBuffer`] or [`BinaryBuffer`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::buffer::{BinaryBuffer, InputStream, MessageReader, StreamBuffer, TextBuffer};
use crate::connection::ConnectionState;
use crate::error::{CloseReason, Error, Result};
use crate::executor::SharedExecutor;
use crate::protocol::{Incoming, ProtocolHandler, Role};
use crate::writer::SendFuture;

/// Stable identifier of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    /// Allocate a process-wide unique id
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ws-{}", self.0)
    }
}

/// Called when a session opens
pub type OpenHandler = Arc<dyn Fn(&Session) + Send + Sync>;
/// Called with a complete text message
pub type TextHandler = Arc<dyn Fn(&Session, String) + Send + Sync>;
/// Called with each piece of a text message and whether it is the last
pub type PartialTextHandler = Arc<dyn Fn(&Session, String, bool) + Send + Sync>;
/// Called on the executor with a reader over a text message
pub type ReaderHandler = Arc<dyn Fn(&Session, MessageReader) + Send + Sync>;
/// Called with a complete binary message
pub type BinaryHandler = Arc<dyn Fn(&Session, Bytes) + Send + Sync>;
/// Called with each piece of a binary message and whether it is the last
pub type PartialBinaryHandler = Arc<dyn Fn(&Session, Bytes, bool) + Send + Sync>;
/// Called on the executor with a stream over a binary message
pub type StreamHandler = Arc<dyn Fn(&Session, InputStream) + Send + Sync>;
/// Called with a ping or pong payload
pub type ControlHandler = Arc<dyn Fn(&Session, &Bytes) + Send + Sync>;
/// Called once when the session closes
pub type CloseHandler = Arc<dyn Fn(&Session, &CloseReason) + Send + Sync>;
/// Called with an error before the session is closed because of it
pub type ErrorHandler = Arc<dyn Fn(&Session, &Error) + Send + Sync>;

/// Callbacks registered for a connection
///
/// Cloning is cheap; an engine hands one clone to every connection.
#[derive(Clone, Default)]
pub struct Handlers {
    on_open: Option<OpenHandler>,
    text: Option<TextHandler>,
    partial_text: Option<PartialTextHandler>,
    text_reader: Option<ReaderHandler>,
    binary: Option<BinaryHandler>,
    partial_binary: Option<PartialBinaryHandler>,
    binary_stream: Option<StreamHandler>,
    on_ping: Option<ControlHandler>,
    on_pong: Option<ControlHandler>,
    on_close: Option<CloseHandler>,
    on_error: Option<ErrorHandler>,
}

impl Handlers {
    /// No handlers
    pub fn new() -> Self {
        Self::default()
    }

    /// Session opened
    pub fn on_open(mut self, f: impl Fn(&Session) + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(f));
        self
    }

    /// Whole text messages
    pub fn on_text(mut self, f: impl Fn(&Session, String) + Send + Sync + 'static) -> Self {
        self.text = Some(Arc::new(f));
        self
    }

    /// Text messages piece by piece
    pub fn on_partial_text(
        mut self,
        f: impl Fn(&Session, String, bool) + Send + Sync + 'static,
    ) -> Self {
        self.partial_text = Some(Arc::new(f));
        self
    }

    /// Text messages as a blocking reader on the executor
    pub fn on_text_reader(
        mut self,
        f: impl Fn(&Session, MessageReader) + Send + Sync + 'static,
    ) -> Self {
        self.text_reader = Some(Arc::new(f));
        self
    }

    /// Whole binary messages
    pub fn on_binary(mut self, f: impl Fn(&Session, Bytes) + Send + Sync + 'static) -> Self {
        self.binary = Some(Arc::new(f));
        self
    }

    /// Binary messages piece by piece
    pub fn on_partial_binary(
        mut self,
        f: impl Fn(&Session, Bytes, bool) + Send + Sync + 'static,
    ) -> Self {
        self.partial_binary = Some(Arc::new(f));
        self
    }

    /// Binary messages as a blocking stream on the executor
    pub fn on_binary_stream(
        mut self,
        f: impl Fn(&Session, InputStream) + Send + Sync + 'static,
    ) -> Self {
        self.binary_stream = Some(Arc::new(f));
        self
    }

    /// Pings, after the automatic pong went out
    pub fn on_ping(mut self, f: impl Fn(&Session, &Bytes) + Send + Sync + 'static) -> Self {
        self.on_ping = Some(Arc::new(f));
        self
    }

    /// Pongs
    pub fn on_pong(mut self, f: impl Fn(&Session, &Bytes) + Send + Sync + 'static) -> Self {
        self.on_pong = Some(Arc::new(f));
        self
    }

    /// Session closed
    pub fn on_close(
        mut self,
        f: impl Fn(&Session, &CloseReason) + Send + Sync + 'static,
    ) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }

    /// Error that is about to close the session
    pub fn on_error(mut self, f: impl Fn(&Session, &Error) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub(crate) fn open_handler(&self) -> Option<&OpenHandler> {
        self.on_open.as_ref()
    }

    pub(crate) fn close_handler(&self) -> Option<CloseHandler> {
        self.on_close.clone()
    }

    pub(crate) fn error_handler(&self) -> Option<&ErrorHandler> {
        self.on_error.as_ref()
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("text", &self.text.is_some())
            .field("partial_text", &self.partial_text.is_some())
            .field("text_reader", &self.text_reader.is_some())
            .field("binary", &self.binary.is_some())
            .field("partial_binary", &self.partial_binary.is_some())
            .field("binary_stream", &self.binary_stream.is_some())
            .finish_non_exhaustive()
    }
}

type TerminationHook = Box<dyn FnOnce(ConnectionId) + Send>;

struct SessionInner {
    id: ConnectionId,
    handler: ProtocolHandler,
    state: AtomicU8,
    path: String,
    subprotocol: Option<String>,
    close_reason: Mutex<Option<CloseReason>>,
    notified: AtomicBool,
    on_close: Option<CloseHandler>,
    on_terminated: Mutex<Option<TerminationHook>>,
}

/// Handle to one WebSocket connection
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Wrap a protocol handler in a new session in state `New`
    pub fn new(
        id: ConnectionId,
        handler: ProtocolHandler,
        path: impl Into<String>,
        subprotocol: Option<String>,
        on_close: Option<CloseHandler>,
    ) -> Self {
        let inner = Arc::new(SessionInner {
            id,
            handler,
            state: AtomicU8::new(ConnectionState::New as u8),
            path: path.into(),
            subprotocol,
            close_reason: Mutex::new(None),
            notified: AtomicBool::new(false),
            on_close,
            on_terminated: Mutex::new(None),
        });

        let weak: Weak<SessionInner> = Arc::downgrade(&inner);
        inner.handler.set_close_listener(move |reason| {
            if let Some(inner) = weak.upgrade() {
                Session { inner }.notify_closed(reason.clone());
            }
        });
        Self { inner }
    }

    /// Connection id
    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Lifecycle state
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Whether messages may be sent
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Endpoint role
    pub fn role(&self) -> Role {
        self.inner.handler.role()
    }

    /// Request target the session was opened with, including the query
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Negotiated subprotocol
    pub fn subprotocol(&self) -> Option<&str> {
        self.inner.subprotocol.as_deref()
    }

    /// Names of the negotiated extensions
    pub fn extensions(&self) -> Vec<String> {
        self.inner
            .handler
            .pipeline()
            .names()
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    /// Reason the session closed with, once closed
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason.lock().clone()
    }

    /// Send half of the connection
    pub fn handler(&self) -> &ProtocolHandler {
        &self.inner.handler
    }

    /// Send a whole text message
    pub fn send_text(&self, text: &str) -> Result<SendFuture> {
        self.ensure_open()?;
        self.inner.handler.send_text(text)
    }

    /// Send a whole binary message
    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<SendFuture> {
        self.ensure_open()?;
        self.inner.handler.send_binary(data)
    }

    /// Send one piece of a text message
    pub fn stream_text(&self, fragment: &str, last: bool) -> Result<SendFuture> {
        self.ensure_open()?;
        self.inner.handler.stream_text(fragment, last)
    }

    /// Send one piece of a binary message
    pub fn stream_binary(&self, fragment: impl Into<Bytes>, last: bool) -> Result<SendFuture> {
        self.ensure_open()?;
        self.inner.handler.stream_binary(fragment, last)
    }

    /// Send a ping
    pub fn send_ping(&self, payload: impl Into<Bytes>) -> Result<SendFuture> {
        self.ensure_open()?;
        self.inner.handler.send_ping(payload)
    }

    /// Send an unsolicited pong
    pub fn send_pong(&self, payload: impl Into<Bytes>) -> Result<SendFuture> {
        self.ensure_open()?;
        self.inner.handler.send_pong(payload)
    }

    /// Start the closing handshake
    ///
    /// The close callback runs right away. Closing an already closing or
    /// closed session is a no-op.
    pub fn close(&self, reason: CloseReason) -> Result<SendFuture> {
        match self.transition(ConnectionState::Connected, ConnectionState::Closing) {
            Ok(()) => self.inner.handler.close(reason).inspect_err(|_| {
                // Rejected before anything was written
                self.set_state(ConnectionState::Connected);
            }),
            Err(ConnectionState::New) => Err(Error::InvalidState("session is not open yet")),
            Err(_) => Ok(SendFuture::ready(Ok(()))),
        }
    }

    /// Register a hook run once after the close callback
    pub fn on_terminated(&self, hook: impl FnOnce(ConnectionId) + Send + 'static) {
        *self.inner.on_terminated.lock() = Some(Box::new(hook));
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn transition(
        &self,
        from: ConnectionState,
        to: ConnectionState,
    ) -> std::result::Result<(), ConnectionState> {
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ConnectionState::from_u8)
    }

    /// Run the close callback and termination hook, once
    pub(crate) fn notify_closed(&self, reason: CloseReason) {
        if self.inner.notified.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(id = %self.id(), %reason, "session closed");
        *self.inner.close_reason.lock() = Some(reason.clone());
        if let Some(on_close) = &self.inner.on_close {
            on_close(self, &reason);
        }
        let hook = self.inner.on_terminated.lock().take();
        if let Some(hook) = hook {
            hook(self.id());
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::InvalidState("session is not open"))
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("path", &self.inner.path)
            .field("subprotocol", &self.inner.subprotocol)
            .finish()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Session {}

/// Which data message is being received
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceiveState {
    /// Between messages
    #[default]
    Running,
    /// Inside a fragmented text message
    ReceivingText,
    /// Inside a fragmented binary message
    ReceivingBinary,
}

/// Routes decoded messages to handlers
pub struct MessageDispatcher {
    handlers: Handlers,
    executor: SharedExecutor,
    state: ReceiveState,
    text: TextBuffer,
    binary: BinaryBuffer,
    text_stream: StreamBuffer,
    binary_stream: StreamBuffer,
}

impl MessageDispatcher {
    /// Create a dispatcher with per-type buffer ceilings
    pub fn new(
        handlers: Handlers,
        executor: SharedExecutor,
        max_text_message: usize,
        max_binary_message: usize,
    ) -> Self {
        Self {
            handlers,
            executor,
            state: ReceiveState::Running,
            text: TextBuffer::new(max_text_message),
            binary: BinaryBuffer::new(max_binary_message),
            text_stream: StreamBuffer::new(max_text_message),
            binary_stream: StreamBuffer::new(max_binary_message),
        }
    }

    /// Registered handlers
    pub fn handlers(&self) -> &Handlers {
        &self.handlers
    }

    /// Current receive state
    pub fn state(&self) -> ReceiveState {
        self.state
    }

    /// Deliver one decoded event
    ///
    /// Close events are ignored here; the connection owns the closing
    /// handshake.
    pub fn dispatch(&mut self, session: &Session, event: Incoming) -> Result<()> {
        match event {
            Incoming::Text { data, first, last } => self.dispatch_text(session, data, first, last),
            Incoming::Binary { data, first, last } => {
                self.dispatch_binary(session, data, first, last)
            }
            Incoming::Ping(payload) => {
                if let Some(h) = &self.handlers.on_ping {
                    h(session, &payload);
                }
                Ok(())
            }
            Incoming::Pong(payload) => {
                if let Some(h) = &self.handlers.on_pong {
                    h(session, &payload);
                }
                Ok(())
            }
            Incoming::Close(_) => Ok(()),
        }
    }

    /// Abandon any message in progress and wake streaming readers
    pub fn close(&mut self) {
        self.text_stream.close();
        self.binary_stream.close();
        self.text.reset();
        self.binary.reset();
        self.state = ReceiveState::Running;
    }

    fn dispatch_text(&mut self, session: &Session, data: String, first: bool, last: bool) -> Result<()> {
        if first && last {
            if let Some(h) = &self.handlers.text {
                h(session, data);
            } else if let Some(h) = &self.handlers.partial_text {
                h(session, data, true);
            } else if let Some(h) = self.handlers.text_reader.clone() {
                let stream = self.text_stream.open();
                self.spawn_reader(session, h, stream);
                self.text_stream.append(Bytes::from(data), true)?;
            } else {
                tracing::warn!(id = %session.id(), "no text handler registered, message dropped");
            }
            return Ok(());
        }

        if self.state == ReceiveState::ReceivingBinary {
            return Err(Error::ProtocolOwned(format!(
                "text message received out of order on session {}",
                session.id()
            )));
        }
        if first {
            self.state = ReceiveState::ReceivingText;
            self.text.reset();
        }

        let result = self.text_piece(session, data, first, last);
        if last || result.is_err() {
            self.state = ReceiveState::Running;
        }
        result
    }

    fn text_piece(&mut self, session: &Session, data: String, first: bool, last: bool) -> Result<()> {
        if let Some(h) = &self.handlers.partial_text {
            h(session, data, last);
        } else if let Some(h) = self.handlers.text_reader.clone() {
            if first {
                let stream = self.text_stream.open();
                self.spawn_reader(session, h, stream);
            }
            self.text_stream.append(Bytes::from(data), last)?;
        } else if let Some(h) = &self.handlers.text {
            if let Some(message) = self.text.append(&data, last)? {
                h(session, message);
            }
        } else if first {
            tracing::warn!(id = %session.id(), "no text handler registered, message dropped");
        }
        Ok(())
    }

    fn dispatch_binary(&mut self, session: &Session, data: Bytes, first: bool, last: bool) -> Result<()> {
        if first && last {
            if let Some(h) = &self.handlers.binary {
                h(session, data);
            } else if let Some(h) = &self.handlers.partial_binary {
                h(session, data, true);
            } else if let Some(h) = self.handlers.binary_stream.clone() {
                let stream = self.binary_stream.open();
                self.spawn_stream(session, h, stream);
                self.binary_stream.append(data, true)?;
            } else {
                tracing::warn!(id = %session.id(), "no binary handler registered, message dropped");
            }
            return Ok(());
        }

        if self.state == ReceiveState::ReceivingText {
            return Err(Error::ProtocolOwned(format!(
                "binary message received out of order on session {}",
                session.id()
            )));
        }
        if first {
            self.state = ReceiveState::ReceivingBinary;
            self.binary.reset();
        }

        let result = self.binary_piece(session, data, first, last);
        if last || result.is_err() {
            self.state = ReceiveState::Running;
        }
        result
    }

    fn binary_piece(&mut self, session: &Session, data: Bytes, first: bool, last: bool) -> Result<()> {
        if let Some(h) = &self.handlers.partial_binary {
            h(session, data, last);
        } else if let Some(h) = self.handlers.binary_stream.clone() {
            if first {
                let stream = self.binary_stream.open();
                self.spawn_stream(session, h, stream);
            }
            self.binary_stream.append(data, last)?;
        } else if let Some(h) = &self.handlers.binary {
            if let Some(message) = self.binary.append(&data, last)? {
                h(session, message);
            }
        } else if first {
            tracing::warn!(id = %session.id(), "no binary handler registered, message dropped");
        }
        Ok(())
    }

    fn spawn_reader(&self, session: &Session, handler: ReaderHandler, stream: InputStream) {
        let session = session.clone();
        self.executor.execute(Box::new(move || {
            handler(&session, MessageReader::new(stream));
        }));
    }

    fn spawn_stream(&self, session: &Session, handler: StreamHandler, stream: InputStream) {
        let session = session.clone();
        self.executor.execute(Box::new(move || {
            handler(&session, stream);
        }));
    }
}

impl fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("handlers", &self.handlers)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ThreadExecutor;
    use crate::extension::ExtensionPipeline;
    use crate::writer::MemoryWriter;
    use std::sync::mpsc;

    fn session() -> Session {
        let writer = Arc::new(MemoryWriter::new());
        let handler = ProtocolHandler::new(
            Role::Server,
            writer,
            Arc::new(ExtensionPipeline::empty(false)),
        );
        let session = Session::new(ConnectionId::next(), handler, "/", None, None);
        session.set_state(ConnectionState::Connected);
        session
    }

    fn text(data: &str, first: bool, last: bool) -> Incoming {
        Incoming::Text {
            data: data.into(),
            first,
            last,
        }
    }

    fn binary(data: &'static [u8], first: bool, last: bool) -> Incoming {
        Incoming::Binary {
            data: Bytes::from_static(data),
            first,
            last,
        }
    }

    fn dispatcher(handlers: Handlers) -> MessageDispatcher {
        MessageDispatcher::new(handlers, Arc::new(ThreadExecutor), 16, 16)
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("ws-"));
    }

    #[test]
    fn test_whole_handler_preferred_for_complete_messages() {
        let (tx, rx) = mpsc::channel();
        let partial_tx = tx.clone();
        let handlers = Handlers::new()
            .on_text(move |_, t| tx.send(format!("whole:{}", t)).unwrap())
            .on_partial_text(move |_, t, last| {
                partial_tx.send(format!("partial:{}:{}", t, last)).unwrap()
            });
        let mut d = dispatcher(handlers);
        let s = session();

        d.dispatch(&s, text("hi", true, true)).unwrap();
        d.dispatch(&s, text("a", true, false)).unwrap();
        d.dispatch(&s, text("b", false, true)).unwrap();

        let seen: Vec<String> = rx.try_iter().collect();
        assert_eq!(seen, ["whole:hi", "partial:a:false", "partial:b:true"]);
    }

    #[test]
    fn test_whole_handler_through_buffer() {
        let (tx, rx) = mpsc::channel();
        let mut d = dispatcher(Handlers::new().on_binary(move |_, b| tx.send(b).unwrap()));
        let s = session();

        d.dispatch(&s, binary(b"ab", true, false)).unwrap();
        assert_eq!(d.state(), ReceiveState::ReceivingBinary);
        d.dispatch(&s, binary(b"cd", false, false)).unwrap();
        d.dispatch(&s, binary(b"ef", false, true)).unwrap();
        assert_eq!(d.state(), ReceiveState::Running);
        assert_eq!(&rx.try_recv().unwrap()[..], b"abcdef");
    }

    #[test]
    fn test_out_of_order_partial() {
        let mut d = dispatcher(Handlers::new().on_text(|_, _| {}).on_binary(|_, _| {}));
        let s = session();
        d.dispatch(&s, binary(b"ab", true, false)).unwrap();
        assert!(d.dispatch(&s, text("x", true, false)).is_err());
    }

    #[test]
    fn test_buffer_overflow_is_reported() {
        let mut d = dispatcher(Handlers::new().on_text(|_, _| {}));
        let s = session();
        d.dispatch(&s, text("0123456789", true, false)).unwrap();
        let err = d.dispatch(&s, text("0123456789", false, false)).unwrap_err();
        assert!(matches!(err, Error::MessageTooBig));
        assert_eq!(d.state(), ReceiveState::Running);
    }

    #[test]
    fn test_reader_runs_on_executor() {
        let (tx, rx) = mpsc::channel();
        let handlers = Handlers::new().on_text_reader(move |_, mut reader| {
            tx.send(reader.read_all().unwrap()).unwrap();
        });
        let mut d = dispatcher(handlers);
        let s = session();
        d.dispatch(&s, text("stream", true, false)).unwrap();
        d.dispatch(&s, text("ed", false, true)).unwrap();
        assert_eq!(
            rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap(),
            "streamed"
        );
    }

    #[test]
    fn test_close_aborts_stream_reader() {
        let (tx, rx) = mpsc::channel();
        let handlers = Handlers::new().on_binary_stream(move |_, mut stream| {
            let mut sink = Vec::new();
            tx.send(std::io::Read::read_to_end(&mut stream, &mut sink).is_err())
                .unwrap();
        });
        let mut d = dispatcher(handlers);
        let s = session();
        d.dispatch(&s, binary(b"ab", true, false)).unwrap();
        d.close();
        assert!(rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_session_close_notifies_once() {
        let s = session();
        let (tx, rx) = mpsc::channel();
        let writer = Arc::new(MemoryWriter::new());
        let handler = ProtocolHandler::new(
            Role::Server,
            writer,
            Arc::new(ExtensionPipeline::empty(false)),
        );
        let on_close: CloseHandler = Arc::new(move |_: &Session, r: &CloseReason| tx.send(r.code).unwrap());
        let closing = Session::new(ConnectionId::next(), handler, "/chat", None, Some(on_close));

        assert!(closing.close(CloseReason::new(1000, "")).is_err());
        closing.set_state(ConnectionState::Connected);
        assert!(matches!(
            closing.close(CloseReason::new(999, "")),
            Err(Error::InvalidCloseCode(999))
        ));
        assert!(closing.is_open());
        let _sent = closing.close(CloseReason::new(1001, "bye")).unwrap();
        let _sent = closing.close(CloseReason::new(1000, "again")).unwrap();
        closing.notify_closed(CloseReason::new(1006, ""));

        assert_eq!(rx.try_iter().collect::<Vec<_>>(), [1001]);
        assert_eq!(closing.state(), ConnectionState::Closing);
        assert!(closing.send_text("late").is_err());
        assert_eq!(closing.close_reason().unwrap().code, 1001);
        assert!(s.is_open());
    }
}
