//! Server engine: upgrade entry point, connection registry and broadcast
//!
//! The engine owns the registry of open sessions keyed by [`ConnectionId`].
//! A session is inserted when its upgrade succeeds and removed once it
//! closes. Broadcasts snapshot the registry, frame the message once for
//! every session without extensions, and fan the sends out across scoped
//! worker threads when the session count is large.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;

use crate::Config;
use crate::connection::Connection;
use crate::error::{CloseReason, Error, Result};
use crate::executor::{SharedExecutor, default_executor};
use crate::extension::ExtensionContext;
use crate::frame::{Frame, OpCode, encode_frame};
use crate::handshake::{ServerHandshake, UpgradeRequest, UpgradeResponse};
use crate::protocol::Role;
use crate::session::{ConnectionId, Handlers, Session};
use crate::writer::{SendFuture, SharedWriter};

/// Result of a successful upgrade
#[derive(Debug)]
pub struct Upgraded {
    /// 101 response to write before any frame
    pub response: UpgradeResponse,
    /// The new connection, in state `New`; call [`Connection::open`] once
    /// the response is written
    pub connection: Connection,
}

type Registry = RwLock<HashMap<ConnectionId, Session>>;

struct EngineInner {
    config: Config,
    handshake: ServerHandshake,
    handlers: Handlers,
    executor: SharedExecutor,
    registry: Registry,
}

/// Builder for [`Engine`]
pub struct EngineBuilder {
    config: Config,
    handshake: ServerHandshake,
    handlers: Handlers,
    executor: Option<SharedExecutor>,
}

impl EngineBuilder {
    /// Start with default configuration and no handlers
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            handshake: ServerHandshake::new(),
            handlers: Handlers::default(),
            executor: None,
        }
    }

    /// Limits, timeouts and compression
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Subprotocols, extensions and negotiation policy
    pub fn handshake(mut self, handshake: ServerHandshake) -> Self {
        self.handshake = handshake;
        self
    }

    /// Callbacks for every connection
    pub fn handlers(mut self, handlers: Handlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Executor for streaming handlers
    pub fn executor(mut self, executor: SharedExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Build the engine
    pub fn build(self) -> Engine {
        #[allow(unused_mut)]
        let mut handshake = self.handshake;
        #[cfg(feature = "permessage-deflate")]
        if let Some(deflate) = &self.config.compression {
            handshake = handshake.extension(Arc::new(crate::deflate::PerMessageDeflate::new(
                deflate.clone(),
            )));
        }

        Engine {
            inner: Arc::new(EngineInner {
                config: self.config,
                handshake,
                handlers: self.handlers,
                executor: self.executor.unwrap_or_else(default_executor),
                registry: RwLock::new(HashMap::new()),
            }),
        }
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Server-side WebSocket engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Start building an engine
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Configuration in use
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Validate an upgrade request and create the connection
    ///
    /// On failure nothing is registered; answer with
    /// [`UpgradeResponse::rejection`].
    pub fn upgrade(&self, request: &UpgradeRequest, writer: SharedWriter) -> Result<Upgraded> {
        let mut context = ExtensionContext::new();
        let negotiated = self.inner.handshake.negotiate(request, &mut context)?;

        let connection = Connection::builder(Role::Server, writer)
            .config(self.inner.config.clone())
            .handlers(self.inner.handlers.clone())
            .executor(Arc::clone(&self.inner.executor))
            .extensions(negotiated.extensions, context)
            .path(negotiated.path)
            .subprotocol(negotiated.subprotocol)
            .build();

        let session = connection.session().clone();
        let id = session.id();
        let registry: Weak<EngineInner> = Arc::downgrade(&self.inner);
        session.on_terminated(move |id| {
            if let Some(inner) = registry.upgrade() {
                inner.registry.write().remove(&id);
                tracing::trace!(%id, "connection unregistered");
            }
        });
        self.inner.registry.write().insert(id, session);
        tracing::debug!(%id, path = %request.path, "connection registered");

        Ok(Upgraded {
            response: negotiated.response,
            connection,
        })
    }

    /// Look up a session
    pub fn session(&self, id: ConnectionId) -> Option<Session> {
        self.inner.registry.read().get(&id).cloned()
    }

    /// Snapshot of every registered session
    pub fn sessions(&self) -> Vec<Session> {
        self.inner.registry.read().values().cloned().collect()
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.inner.registry.read().len()
    }

    /// Whether no session is registered
    pub fn is_empty(&self) -> bool {
        self.inner.registry.read().is_empty()
    }

    /// Send a text message to every open session
    pub fn broadcast_text(&self, text: &str) -> HashMap<ConnectionId, SendFuture> {
        self.broadcast(OpCode::Text, Bytes::copy_from_slice(text.as_bytes()))
    }

    /// Send a binary message to every open session
    pub fn broadcast_binary(&self, data: impl Into<Bytes>) -> HashMap<ConnectionId, SendFuture> {
        self.broadcast(OpCode::Binary, data.into())
    }

    /// Close every open session
    pub fn close_all(&self, reason: CloseReason) {
        for session in self.sessions() {
            if let Err(err) = session.close(reason.clone()) {
                tracing::debug!(id = %session.id(), %err, "close failed");
            }
        }
    }

    fn broadcast(&self, opcode: OpCode, payload: Bytes) -> HashMap<ConnectionId, SendFuture> {
        let sessions: Vec<Session> = self
            .sessions()
            .into_iter()
            .filter(Session::is_open)
            .collect();

        let mut framed = BytesMut::new();
        encode_frame(&mut framed, opcode, &payload, true, None);
        let framed = framed.freeze();

        let send_one = |session: &Session| -> (ConnectionId, SendFuture) {
            let handler = session.handler();
            let result = if handler.pipeline().is_empty() {
                handler.send_raw(framed.clone())
            } else {
                handler.send_message(Frame::new(opcode, payload.clone(), true))
            };
            let future = result.unwrap_or_else(|err| SendFuture::ready(Err(err)));
            (session.id(), future)
        };

        let config = &self.inner.config;
        if sessions.len() <= config.broadcast_parallel_threshold {
            return sessions.iter().map(&send_one).collect();
        }

        let chunk_size = config.broadcast_chunk_size.max(1);
        tracing::debug!(
            sessions = sessions.len(),
            chunk_size,
            "parallel broadcast"
        );
        let send_one = &send_one;
        std::thread::scope(|scope| {
            let workers: Vec<_> = sessions
                .chunks(chunk_size)
                .map(|chunk| scope.spawn(move || chunk.iter().map(send_one).collect::<Vec<_>>()))
                .collect();

            let mut results = HashMap::with_capacity(sessions.len());
            for worker in workers {
                match worker.join() {
                    Ok(sent) => results.extend(sent),
                    Err(_) => tracing::error!("broadcast worker panicked"),
                }
            }
            results
        })
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("sessions", &self.len())
            .finish_non_exhaustive()
    }
}

/// Answer for a failed upgrade
pub fn reject(err: &Error) -> UpgradeResponse {
    UpgradeResponse::rejection(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameParser;
    use crate::handshake::{ClientHandshake, parse_request};
    use crate::writer::MemoryWriter;

    fn request() -> UpgradeRequest {
        let bytes = ClientHandshake::new("localhost", "/feed?x=1")
            .request()
            .to_bytes();
        parse_request(&bytes, 8192).unwrap().unwrap().0
    }

    fn connect(engine: &Engine) -> (Connection, Arc<MemoryWriter>) {
        let writer = Arc::new(MemoryWriter::new());
        let Upgraded {
            response,
            mut connection,
        } = engine.upgrade(&request(), writer.clone()).unwrap();
        assert_eq!(response.status, 101);
        connection.open().unwrap();
        (connection, writer)
    }

    fn frames(writer: &MemoryWriter) -> Vec<Frame> {
        let mut parser = FrameParser::new(1 << 20);
        let mut buf = BytesMut::from(&writer.contents()[..]);
        std::iter::from_fn(|| parser.parse(&mut buf).unwrap()).collect()
    }

    #[test]
    fn test_registry_lifecycle() {
        let engine = Engine::builder().build();
        let (mut a, _) = connect(&engine);
        let (b, _) = connect(&engine);
        assert_eq!(engine.len(), 2);
        assert_eq!(engine.session(b.id()).unwrap().path(), "/feed?x=1");

        let _sent = a.close(CloseReason::new(1000, "")).unwrap();
        assert_eq!(engine.len(), 1);
        assert!(engine.session(a.id()).is_none());

        let b_id = b.id();
        drop(b);
        assert!(engine.is_empty());
        assert!(engine.session(b_id).is_none());
    }

    #[test]
    fn test_rejected_upgrade_not_registered() {
        let engine = Engine::builder().build();
        let mut req = request();
        req.headers.set("Sec-WebSocket-Version", "8");
        let err = engine
            .upgrade(&req, Arc::new(MemoryWriter::new()))
            .unwrap_err();
        assert_eq!(reject(&err).status, 426);
        assert!(engine.is_empty());
    }

    #[test]
    fn test_broadcast_sequential() {
        let engine = Engine::builder().build();
        let conns: Vec<_> = (0..3).map(|_| connect(&engine)).collect();
        let results = engine.broadcast_text("hi");
        assert_eq!(results.len(), 3);
        for (_, future) in results {
            future.wait().unwrap();
        }
        for (_, writer) in &conns {
            assert_eq!(writer.contents(), b"\x81\x02hi");
        }
    }

    #[test]
    fn test_broadcast_parallel_chunks() {
        let config = Config::builder()
            .broadcast_parallel_threshold(2)
            .broadcast_chunk_size(2)
            .build();
        let engine = Engine::builder().config(config).build();
        let mut conns: Vec<_> = (0..5).map(|_| connect(&engine)).collect();

        // A closed session is skipped
        conns[0].0.terminate();
        let results = engine.broadcast_binary(vec![1u8, 2, 3]);
        assert_eq!(results.len(), 4);
        for (_, future) in results {
            future.wait().unwrap();
        }
        for (conn, writer) in &conns[1..] {
            assert!(!conn.is_closed());
            let sent = frames(writer);
            assert_eq!(sent.len(), 1);
            assert_eq!(&sent[0].payload()[..], &[1, 2, 3]);
        }
    }

    #[cfg(feature = "permessage-deflate")]
    #[test]
    fn test_broadcast_through_extensions() {
        let config = Config::builder()
            .compression(crate::deflate::DeflateConfig::default())
            .build();
        let engine = Engine::builder().config(config).build();

        let mut req = request();
        req.headers
            .append("Sec-WebSocket-Extensions", "permessage-deflate");
        let writer = Arc::new(MemoryWriter::new());
        let mut up = engine.upgrade(&req, writer.clone()).unwrap();
        assert_eq!(
            up.response.headers.get("Sec-WebSocket-Extensions"),
            Some("permessage-deflate")
        );
        up.connection.open().unwrap();
        let (_plain, plain_writer) = connect(&engine);

        for (_, f) in engine.broadcast_text(&"compress me ".repeat(20)) {
            f.wait().unwrap();
        }
        assert!(frames(&writer)[0].rsv1());
        assert!(!frames(&plain_writer)[0].rsv1());
    }
}
