//! Line-delimited message streams.
//!
//! The relay core only ever sees these two halves: a reader that yields one
//! complete line per call (or a closed/timeout condition) and a writer that
//! puts one complete line on the wire per call. Where the bytes come from
//! (TCP, an in-memory pipe in tests) is the caller's business.

use std::{io, time::Duration};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::{error::RelayError, message::Message};

/// Read deadline applied when the caller does not configure one.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(50);

const LINE_ENDINGS: &[char] = &['\n', '\r'];

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

pub struct MessageReader {
    inner: BufReader<BoxedRead>,
    read_timeout: Duration,
    // Bytes of a line that has not been terminated yet. Kept across calls so
    // a read that hits its deadline halfway through a line loses nothing.
    pending: Vec<u8>,
}

impl MessageReader {
    pub fn new<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            inner: BufReader::new(Box::new(reader)),
            read_timeout: DEFAULT_READ_TIMEOUT,
            pending: Vec::new(),
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Waits for the next non-blank line.
    ///
    /// Fails with [`RelayError::ConnectionClosed`] at end of stream and with
    /// [`RelayError::ReadTimeout`] when no complete line arrives within the
    /// read deadline.
    pub async fn read_message(&mut self) -> Result<Message, RelayError> {
        match tokio::time::timeout(self.read_timeout, self.next_line()).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::ReadTimeout),
        }
    }

    async fn next_line(&mut self) -> Result<Message, RelayError> {
        loop {
            // `read_until` keeps partially read bytes in `pending` when the
            // deadline cancels it; `read_line` would not.
            let bytes = self.inner.read_until(b'\n', &mut self.pending).await?;
            let at_eof = bytes == 0 || self.pending.last() != Some(&b'\n');
            let line = String::from_utf8(std::mem::take(&mut self.pending))
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            let trimmed = line.trim_end_matches(LINE_ENDINGS);

            if !trimmed.trim().is_empty() {
                return Ok(Message::new(trimmed));
            }
            if at_eof {
                return Err(RelayError::ConnectionClosed);
            }
        }
    }
}

pub struct MessageWriter {
    inner: BoxedWrite,
}

impl MessageWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Box::new(writer),
        }
    }

    /// Writes the message and its terminator as one frame, then flushes.
    pub async fn write_message(&mut self, message: &Message) -> Result<(), RelayError> {
        let payload = message.as_str().trim_end_matches(LINE_ENDINGS);
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.extend_from_slice(payload.as_bytes());
        frame.push(b'\n');
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), RelayError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// The two directions of one participant's connection.
pub struct Endpoint {
    pub reader: MessageReader,
    pub writer: MessageWriter,
}

impl Endpoint {
    pub fn new(reader: MessageReader, writer: MessageWriter) -> Self {
        Self { reader, writer }
    }

    /// Splits a bidirectional stream into a reader and a writer.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(MessageReader::new(reader), MessageWriter::new(writer))
    }
}

/// The server side of a relay. The reader is optional because a one-way
/// server may never answer.
pub struct ServerEndpoint {
    pub writer: MessageWriter,
    pub reader: Option<MessageReader>,
}

impl ServerEndpoint {
    pub fn send_only(writer: MessageWriter) -> Self {
        Self {
            writer,
            reader: None,
        }
    }

    pub fn with_replies(endpoint: Endpoint) -> Self {
        Self {
            writer: endpoint.writer,
            reader: Some(endpoint.reader),
        }
    }
}
