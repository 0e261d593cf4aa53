//! Byte-oriented writer abstraction with per-write completion
//!
//! The protocol handler hands fully framed bytes to a [`Writer`] together
//! with a [`WriteCompletion`]. The writer resolves the completion once the
//! bytes reach the transport (or fail to), which in turn resolves the
//! [`SendFuture`] returned to the caller. A completion dropped without an
//! outcome resolves the future with [`Error::WriteCancelled`], so no send is
//! ever left pending.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Sink for framed bytes
pub trait Writer: Send + Sync {
    /// Queue `data` for writing and resolve `completion` when done
    fn write(&self, data: Bytes, completion: WriteCompletion);

    /// Close the underlying transport once queued writes are flushed
    fn close(&self);
}

/// Shared handle to a writer
pub type SharedWriter = Arc<dyn Writer>;

/// One-shot completion handle for a single write
#[derive(Debug)]
pub struct WriteCompletion {
    tx: Option<oneshot::Sender<Result<()>>>,
}

impl WriteCompletion {
    /// Create a completion and the future it resolves
    pub fn new() -> (Self, SendFuture) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, SendFuture { rx })
    }

    /// The write reached the transport
    pub fn completed(mut self) {
        self.resolve(Ok(()));
    }

    /// The write failed
    pub fn failed(mut self, err: io::Error) {
        self.resolve(Err(Error::Io(err)));
    }

    /// The write was abandoned
    pub fn cancelled(mut self) {
        self.resolve(Err(Error::WriteCancelled));
    }

    fn resolve(&mut self, result: Result<()>) {
        if let Some(tx) = self.tx.take() {
            // Receiver may already be gone; nobody is waiting then
            let _ = tx.send(result);
        }
    }
}

/// Outcome of a send, resolved by the writer
///
/// Await it from async code, or call [`wait`](Self::wait) from a plain
/// thread. `wait` must not be called from inside a tokio runtime.
#[derive(Debug)]
#[must_use = "a SendFuture reports write failures only when observed"]
pub struct SendFuture {
    rx: oneshot::Receiver<Result<()>>,
}

impl SendFuture {
    /// A future that is already resolved
    pub fn ready(result: Result<()>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// Block the current thread until the write resolves
    pub fn wait(self) -> Result<()> {
        self.rx.blocking_recv().unwrap_or(Err(Error::WriteCancelled))
    }

    /// Non-blocking check; `None` while the write is still pending
    pub fn try_result(&mut self) -> Option<Result<()>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::WriteCancelled)),
        }
    }
}

impl Future for SendFuture {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(Error::WriteCancelled)))
    }
}

/// In-memory writer that completes every write immediately
///
/// Useful for driving a connection without a socket.
#[derive(Debug, Default)]
pub struct MemoryWriter {
    inner: Mutex<MemoryWriterState>,
}

#[derive(Debug, Default)]
struct MemoryWriterState {
    chunks: Vec<Bytes>,
    closed: bool,
}

impl MemoryWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return every chunk written so far
    pub fn take(&self) -> Vec<Bytes> {
        std::mem::take(&mut self.inner.lock().chunks)
    }

    /// Concatenation of every chunk written so far, without removing them
    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().chunks.concat()
    }

    /// Whether [`Writer::close`] was called
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl Writer for MemoryWriter {
    fn write(&self, data: Bytes, completion: WriteCompletion) {
        let mut inner = self.inner.lock();
        if inner.closed {
            drop(inner);
            completion.failed(io::Error::new(io::ErrorKind::BrokenPipe, "writer closed"));
            return;
        }
        inner.chunks.push(data);
        drop(inner);
        completion.completed();
    }

    fn close(&self) {
        self.inner.lock().closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_states() {
        let (c, f) = WriteCompletion::new();
        c.completed();
        assert!(f.wait().is_ok());

        let (c, f) = WriteCompletion::new();
        c.failed(io::Error::other("boom"));
        assert!(matches!(f.wait(), Err(Error::Io(_))));

        let (c, f) = WriteCompletion::new();
        c.cancelled();
        assert!(matches!(f.wait(), Err(Error::WriteCancelled)));
    }

    #[test]
    fn test_dropped_completion_cancels() {
        let (c, mut f) = WriteCompletion::new();
        assert!(f.try_result().is_none());
        drop(c);
        assert!(matches!(f.try_result(), Some(Err(Error::WriteCancelled))));
    }

    #[tokio::test]
    async fn test_future_awaits() {
        let (c, f) = WriteCompletion::new();
        tokio::spawn(async move { c.completed() });
        assert!(f.await.is_ok());
        assert!(SendFuture::ready(Ok(())).await.is_ok());
    }

    #[test]
    fn test_memory_writer() {
        let writer = MemoryWriter::new();
        let (c, f) = WriteCompletion::new();
        writer.write(Bytes::from_static(b"ab"), c);
        assert!(f.wait().is_ok());
        assert_eq!(writer.contents(), b"ab");

        writer.close();
        let (c, f) = WriteCompletion::new();
        writer.write(Bytes::from_static(b"cd"), c);
        assert!(f.wait().is_err());
        assert_eq!(writer.take().len(), 1);
    }
}
