use std::io::{self, BufRead, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Buf, Bytes};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

#[derive(Debug)]
enum Chunk {
    Data(Bytes),
    End,
}

/// Producer side of a streamed message
///
/// The network thread appends frames as they arrive; the consumer reads
/// them through the [`InputStream`] returned by [`open`](Self::open),
/// usually on another thread. Closing the buffer (or dropping it) wakes a
/// blocked consumer with an I/O error.
#[derive(Debug)]
pub struct StreamBuffer {
    limit: usize,
    tx: Option<mpsc::UnboundedSender<Chunk>>,
    buffered: Arc<AtomicUsize>,
    received_last: bool,
}

impl StreamBuffer {
    /// Create a buffer holding at most `limit` unread bytes
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            tx: None,
            buffered: Arc::new(AtomicUsize::new(0)),
            received_last: true,
        }
    }

    /// Start a new message and return its consumer
    ///
    /// Any consumer of a previous message is cut off.
    pub fn open(&mut self) -> InputStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.tx = Some(tx);
        self.buffered = Arc::new(AtomicUsize::new(0));
        self.received_last = false;
        InputStream {
            rx,
            current: Bytes::new(),
            buffered: Arc::clone(&self.buffered),
            finished: false,
        }
    }

    /// Whether a message is open and still expecting frames
    pub fn is_open(&self) -> bool {
        self.tx.is_some() && !self.received_last
    }

    /// Whether the current message is finished (completed or abandoned)
    pub fn received_last(&self) -> bool {
        self.received_last
    }

    /// Bytes appended but not yet read
    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Append a frame's payload
    pub fn append(&mut self, data: Bytes, last: bool) -> Result<()> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };

        let pending = self.buffered.load(Ordering::Acquire);
        if pending + data.len() > self.limit {
            tracing::debug!(
                pending,
                incoming = data.len(),
                limit = self.limit,
                "streamed message exceeds buffer limit"
            );
            self.tx = None;
            self.received_last = true;
            return Err(Error::MessageTooBig);
        }

        self.buffered.fetch_add(data.len(), Ordering::AcqRel);
        // A consumer that hung up simply stops receiving
        let _ = tx.send(Chunk::Data(data));
        if last {
            let _ = tx.send(Chunk::End);
            self.tx = None;
            self.received_last = true;
        }
        Ok(())
    }

    /// Abandon the current message, failing any blocked reader
    pub fn close(&mut self) {
        self.tx = None;
        self.received_last = true;
    }
}

/// Blocking byte stream over one message
///
/// Reads block until the next frame arrives. End of message is reported as
/// end of file; a session that closes mid-message surfaces as
/// [`io::ErrorKind::ConnectionAborted`]. Must not be read from inside an
/// async runtime.
#[derive(Debug)]
pub struct InputStream {
    rx: mpsc::UnboundedReceiver<Chunk>,
    current: Bytes,
    buffered: Arc<AtomicUsize>,
    finished: bool,
}

impl InputStream {
    /// Block for the next chunk of the message; `Ok(None)` at its end
    pub fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        if !self.current.is_empty() {
            return Ok(Some(std::mem::take(&mut self.current)));
        }
        if self.finished {
            return Ok(None);
        }
        match self.rx.blocking_recv() {
            Some(Chunk::Data(data)) => {
                self.buffered.fetch_sub(data.len(), Ordering::AcqRel);
                Ok(Some(data))
            }
            Some(Chunk::End) => {
                self.finished = true;
                Ok(None)
            }
            None => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "message abandoned before its last frame",
            )),
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        while self.current.is_empty() && !self.finished {
            match self.next_chunk()? {
                Some(chunk) => self.current = chunk,
                None => break,
            }
        }
        Ok(())
    }
}

impl Read for InputStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.fill()?;
        let n = out.len().min(self.current.len());
        out[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

impl BufRead for InputStream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.fill()?;
        Ok(&self.current)
    }

    fn consume(&mut self, amt: usize) {
        self.current.advance(amt.min(self.current.len()));
    }
}

/// Blocking character stream over one text message
///
/// Chunks are produced on character boundaries, so every chunk is valid
/// UTF-8 on its own. [`Read`] also stops at a character boundary whenever
/// one whole character fits in the caller's buffer, so raw reads and
/// [`next_text`](Self::next_text) can be mixed. A buffer shorter than the
/// next character splits it, and a following `next_text` then fails with
/// [`io::ErrorKind::InvalidData`].
#[derive(Debug)]
pub struct MessageReader {
    inner: InputStream,
}

impl MessageReader {
    /// Wrap an input stream carrying UTF-8 chunks
    pub fn new(inner: InputStream) -> Self {
        Self { inner }
    }

    /// Block for the next piece of text; `Ok(None)` at the end of the message
    pub fn next_text(&mut self) -> io::Result<Option<String>> {
        match self.inner.next_chunk()? {
            Some(chunk) => String::from_utf8(chunk.to_vec())
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            None => Ok(None),
        }
    }

    /// Read the rest of the message into a string
    pub fn read_all(&mut self) -> io::Result<String> {
        let mut out = String::new();
        while let Some(piece) = self.next_text()? {
            out.push_str(&piece);
        }
        Ok(out)
    }
}

impl Read for MessageReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let available = self.inner.fill_buf()?;
        let mut n = out.len().min(available.len());
        if n < available.len() {
            // Back off to the start of the character that does not fit
            if let Some(start) = (1..=n).rev().find(|&i| available[i] & 0xC0 != 0x80) {
                n = start;
            }
        }
        out[..n].copy_from_slice(&available[..n]);
        self.inner.consume(n);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_reader_on_worker_thread() {
        let mut buffer = StreamBuffer::new(1024);
        let mut stream = buffer.open();
        let consumer = thread::spawn(move || {
            let mut all = Vec::new();
            stream.read_to_end(&mut all).unwrap();
            all
        });

        buffer.append(Bytes::from_static(b"hello "), false).unwrap();
        buffer.append(Bytes::from_static(b"world"), true).unwrap();
        assert!(buffer.received_last());
        assert_eq!(consumer.join().unwrap(), b"hello world");
    }

    #[test]
    fn test_close_wakes_reader() {
        let mut buffer = StreamBuffer::new(1024);
        let stream = buffer.open();
        let consumer = thread::spawn(move || MessageReader::new(stream).read_all());

        buffer.append(Bytes::from_static(b"partial"), false).unwrap();
        buffer.close();
        let err = consumer.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn test_overflow_abandons_message() {
        let mut buffer = StreamBuffer::new(4);
        let mut stream = buffer.open();
        buffer.append(Bytes::from_static(b"abc"), false).unwrap();
        assert!(matches!(
            buffer.append(Bytes::from_static(b"de"), false),
            Err(Error::MessageTooBig)
        ));
        assert!(buffer.received_last());
        assert!(!buffer.is_open());

        let mut first = [0u8; 3];
        stream.read_exact(&mut first).unwrap();
        assert_eq!(&first, b"abc");
        assert!(stream.read(&mut first).is_err());
    }

    #[test]
    fn test_read_frees_budget() {
        let mut buffer = StreamBuffer::new(4);
        let mut stream = buffer.open();
        buffer.append(Bytes::from_static(b"abcd"), false).unwrap();
        assert_eq!(buffer.buffered(), 4);
        assert_eq!(&stream.next_chunk().unwrap().unwrap()[..], b"abcd");
        assert_eq!(buffer.buffered(), 0);
        buffer.append(Bytes::from_static(b"efgh"), true).unwrap();
    }

    #[test]
    fn test_text_reader_chunks() {
        let mut buffer = StreamBuffer::new(64);
        let mut reader = MessageReader::new(buffer.open());
        buffer.append(Bytes::from("κό"), false).unwrap();
        buffer.append(Bytes::from("σμε"), true).unwrap();
        assert_eq!(reader.next_text().unwrap().as_deref(), Some("κό"));
        assert_eq!(reader.read_all().unwrap(), "σμε");
    }

    #[test]
    fn test_raw_read_keeps_characters_whole() {
        let mut buffer = StreamBuffer::new(64);
        let mut reader = MessageReader::new(buffer.open());
        buffer.append(Bytes::from("κόσμε"), true).unwrap();

        let mut out = [0u8; 3];
        let n = reader.read(&mut out).unwrap();
        assert_eq!(&out[..n], "κ".as_bytes());
        assert_eq!(reader.read_all().unwrap(), "όσμε");
    }

    #[test]
    fn test_tiny_read_splits_character() {
        let mut buffer = StreamBuffer::new(64);
        let mut reader = MessageReader::new(buffer.open());
        buffer.append(Bytes::from("é!"), true).unwrap();

        let mut out = [0u8; 1];
        assert_eq!(reader.read(&mut out).unwrap(), 1);
        let err = reader.next_text().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
