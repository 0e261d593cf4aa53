//! Tokio transport glue
//!
//! The engine itself never touches sockets. This module drives a
//! [`Connection`] over any `AsyncRead + AsyncWrite` stream: one task owns
//! the write half and drains a queue of encoded frames, the caller's task
//! reads into the connection buffer and lets it dispatch events.
//!
//! # Example
//!
//! ```ignore
//! use sockudo_ws_engine::{Engine, Handlers, transport};
//! use tokio::net::TcpListener;
//!
//! let engine = Engine::builder()
//!     .handlers(Handlers::new().on_text(|session, text| {
//!         let _ = session.send_text(text);
//!     }))
//!     .build();
//!
//! let listener = TcpListener::bind("127.0.0.1:9001").await?;
//! loop {
//!     let (stream, _) = listener.accept().await?;
//!     let engine = engine.clone();
//!     tokio::spawn(async move { transport::serve_connection(&engine, stream).await });
//! }
//! ```
//!
//! Handlers run on the reading task. They may queue sends but must not call
//! [`SendFuture::wait`](crate::writer::SendFuture::wait) there.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::Config;
use crate::connection::Connection;
use crate::engine::{Engine, Upgraded};
use crate::error::{Error, Result};
use crate::extension::ExtensionContext;
use crate::handshake::{
    ClientHandshake, UpgradeResponse, parse_request, parse_response, split_head,
};
use crate::protocol::Role;
use crate::session::{Handlers, Session};
use crate::writer::{SharedWriter, WriteCompletion, Writer};

enum WriteCommand {
    Data(Bytes, WriteCompletion),
    Close,
}

/// [`Writer`] backed by a task that owns the write half of a stream
#[derive(Clone)]
pub struct TokioWriter {
    tx: mpsc::UnboundedSender<WriteCommand>,
}

impl TokioWriter {
    /// Spawn the write task for `io`
    ///
    /// The task ends after a close request, a write error, or once every
    /// handle to the writer is dropped. Writes still queued at that point
    /// are cancelled.
    pub fn spawn<W>(io: W) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_loop(io, rx));
        (Self { tx }, task)
    }
}

impl std::fmt::Debug for TokioWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioWriter")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl Writer for TokioWriter {
    fn write(&self, data: Bytes, completion: WriteCompletion) {
        if let Err(mpsc::error::SendError(WriteCommand::Data(_, completion))) =
            self.tx.send(WriteCommand::Data(data, completion))
        {
            completion.cancelled();
        }
    }

    fn close(&self) {
        let _ = self.tx.send(WriteCommand::Close);
    }
}

async fn write_loop<W>(mut io: W, mut rx: mpsc::UnboundedReceiver<WriteCommand>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(command) = rx.recv().await {
        match command {
            WriteCommand::Data(data, completion) => {
                let written = match io.write_all(&data).await {
                    Ok(()) => io.flush().await,
                    Err(err) => Err(err),
                };
                match written {
                    Ok(()) => completion.completed(),
                    Err(err) => {
                        tracing::debug!(%err, "transport write failed");
                        completion.failed(err);
                        break;
                    }
                }
            }
            WriteCommand::Close => {
                if let Err(err) = io.shutdown().await {
                    tracing::debug!(%err, "transport shutdown failed");
                }
                break;
            }
        }
    }

    rx.close();
    while let Ok(command) = rx.try_recv() {
        if let WriteCommand::Data(_, completion) = command {
            completion.cancelled();
        }
    }
}

async fn read_head<R, T>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_size: usize,
    parse: fn(&[u8], usize) -> Result<Option<(T, usize)>>,
) -> Result<T>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(head) = split_head(buf, parse, Some(max_size))? {
            return Ok(head);
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(Error::ConnectionClosed);
        }
    }
}

fn queue(writer: &dyn Writer, data: Bytes) {
    let (completion, _done) = WriteCompletion::new();
    writer.write(data, completion);
}

/// Feed bytes from `reader` into `connection` until it closes
///
/// End of stream without a closing handshake terminates the connection
/// (close code 1006).
pub async fn run_connection<R>(connection: &mut Connection, mut reader: R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        if connection.is_closed() {
            return Ok(());
        }
        match reader.read_buf(connection.read_buffer()).await {
            Ok(0) => {
                connection.terminate();
                return Ok(());
            }
            Ok(_) => connection.process()?,
            Err(err) => {
                connection.terminate();
                return Err(err.into());
            }
        }
    }
}

/// Accept one client on `stream`: handshake, register, then run until closed
///
/// A request the engine refuses is answered with the matching HTTP error
/// response before the error is returned.
pub async fn serve_connection<S>(engine: &Engine, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, write_half) = tokio::io::split(stream);
    let (writer, write_task) = TokioWriter::spawn(write_half);
    let writer = Arc::new(writer);

    let mut buf = BytesMut::with_capacity(1024);
    let head = read_head(
        &mut reader,
        &mut buf,
        engine.config().max_handshake_size,
        parse_request,
    )
    .await;

    let upgraded = match head.and_then(|request| engine.upgrade(&request, writer.clone())) {
        Ok(upgraded) => upgraded,
        Err(err) => {
            if err.http_status().is_some() {
                queue(&*writer, UpgradeResponse::rejection(&err).to_bytes());
            }
            writer.close();
            let _ = write_task.await;
            return Err(err);
        }
    };
    drop(writer);

    let Upgraded {
        response,
        mut connection,
    } = upgraded;
    queue(&**connection.session().handler().writer(), response.to_bytes());
    connection.open()?;
    connection.read_buffer().extend_from_slice(&buf);
    connection.process()?;

    let result = run_connection(&mut connection, reader).await;
    let _ = write_task.await;
    result
}

/// Open a client connection to a `ws://` URI
///
/// `wss://` needs a TLS stream; establish one and use
/// [`connect_with_stream`].
pub async fn connect(
    uri: &str,
    config: Config,
    handlers: Handlers,
) -> Result<(Session, JoinHandle<Result<()>>)> {
    let handshake = ClientHandshake::from_uri(uri)?;
    if handshake.is_secure() {
        return Err(Error::InvalidState("wss requires a TLS stream"));
    }
    let stream = TcpStream::connect((handshake.host(), handshake.effective_port())).await?;
    stream.set_nodelay(true)?;
    connect_with_stream(handshake, stream, config, handlers).await
}

/// Run the client handshake over an established stream
///
/// Returns the open session and the task reading from the stream; the task
/// resolves once the connection is closed.
pub async fn connect_with_stream<S>(
    handshake: ClientHandshake,
    stream: S,
    config: Config,
    handlers: Handlers,
) -> Result<(Session, JoinHandle<Result<()>>)>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    #[cfg(feature = "permessage-deflate")]
    let handshake = match config.compression.clone() {
        Some(deflate) => {
            handshake.extension(Arc::new(crate::deflate::PerMessageDeflate::new(deflate)))
        }
        None => handshake,
    };

    let (mut reader, mut write_half) = tokio::io::split(stream);
    write_half.write_all(&handshake.request().to_bytes()).await?;
    write_half.flush().await?;

    let mut buf = BytesMut::with_capacity(1024);
    let response = read_head(
        &mut reader,
        &mut buf,
        config.max_handshake_size,
        parse_response,
    )
    .await?;
    let mut context = ExtensionContext::new();
    let negotiated = handshake.validate_response(&response, &mut context)?;

    let (writer, _write_task) = TokioWriter::spawn(write_half);
    let writer: SharedWriter = Arc::new(writer);
    let mut connection = Connection::builder(Role::Client, writer)
        .config(config)
        .handlers(handlers)
        .extensions(negotiated.extensions, context)
        .path(handshake.path())
        .subprotocol(negotiated.subprotocol)
        .build();
    connection.open()?;
    connection.read_buffer().extend_from_slice(&buf);
    connection.process()?;

    let session = connection.session().clone();
    let task = tokio::spawn(async move { run_connection(&mut connection, reader).await });
    Ok((session, task))
}
