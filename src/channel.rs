//! Duplex byte channel with inbound backpressure accounting.

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::Poll;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::trace;

/// Marker for transports a connection can run over: anything that is a
/// duplex async byte stream.
pub trait Transport: AsyncRead + AsyncWrite + Send {}

impl<T: AsyncRead + AsyncWrite + Send> Transport for T {}

/// A boxed transport, as produced by a [`ChannelOpener`] or a TLS upgrade.
///
/// [`ChannelOpener`]: crate::ChannelOpener
pub type BoxedTransport = Pin<Box<dyn Transport>>;

/// Largest number of bytes pulled from the transport in a single read.
pub(crate) const READ_CHUNK: usize = 4096;

/// Inbound buffering thresholds.
///
/// Transport reads stop once more than `high` buffered bytes await the
/// consumer and resume when the backlog drains to `low` or less.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub high: usize,
    pub low: usize,
}

impl Default for Watermarks {
    fn default() -> Self {
        Self {
            high: 2048,
            low: 1024,
        }
    }
}

/// A latched transport failure, replayed to every subsequent operation.
#[derive(Debug)]
struct LatchedError {
    kind: io::ErrorKind,
    message: String,
}

impl LatchedError {
    fn to_error(&self) -> io::Error {
        io::Error::new(self.kind, self.message.clone())
    }
}

/// A duplex byte channel over a boxed transport.
///
/// Reads are chunked: each [`read`](ByteChannel::read) returns at most
/// [`READ_CHUNK`] bytes, `None` on EOF. After satisfying the caller the
/// channel opportunistically pulls more data from the transport while it is
/// immediately available, bounded by the [`Watermarks`]: buffering pauses
/// above the high mark and resumes once the consumer has drained the
/// backlog to the low mark.
///
/// A transport error is latched and reported to both the read and the write
/// side, whichever observes it first; a latched transport error takes
/// precedence over one synthesized by a later failed write.
pub struct ByteChannel {
    stream: Option<BoxedTransport>,
    inbound: BytesMut,
    paused: bool,
    eof: bool,
    marks: Watermarks,
    failed: Option<LatchedError>,
}

impl ByteChannel {
    pub fn new(stream: BoxedTransport) -> Self {
        Self::with_watermarks(stream, Watermarks::default())
    }

    pub fn with_watermarks(stream: BoxedTransport, marks: Watermarks) -> Self {
        ByteChannel {
            stream: Some(stream),
            inbound: BytesMut::new(),
            paused: false,
            eof: false,
            marks,
            failed: None,
        }
    }

    /// Bytes received from the transport but not yet handed to the consumer.
    pub fn unconsumed(&self) -> usize {
        self.inbound.len()
    }

    fn check_failed(&self) -> io::Result<()> {
        match &self.failed {
            Some(err) => Err(err.to_error()),
            None => Ok(()),
        }
    }

    fn latch(&mut self, err: io::Error) -> io::Error {
        if self.failed.is_none() {
            self.failed = Some(LatchedError {
                kind: err.kind(),
                message: err.to_string(),
            });
        }
        self.failed.as_ref().unwrap().to_error()
    }

    fn after_fill(&mut self, n: usize) {
        if n == 0 {
            self.eof = true;
        } else if self.inbound.len() > self.marks.high && !self.paused {
            self.paused = true;
            trace!(
                buffered = self.inbound.len(),
                high = self.marks.high,
                "inbound buffering paused"
            );
        }
    }

    /// One blocking transport read of at most [`READ_CHUNK`] bytes.
    async fn fill(&mut self) -> io::Result<usize> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "channel is closed",
            ));
        };
        let mut chunk = [0u8; READ_CHUNK];
        let n = stream.read(&mut chunk).await?;
        self.inbound.extend_from_slice(&chunk[..n]);
        self.after_fill(n);
        Ok(n)
    }

    /// Pulls further chunks without waiting, until the transport has nothing
    /// ready or the high watermark pauses buffering.
    async fn prefetch(&mut self) {
        while !self.paused && !self.eof {
            let Some(stream) = self.stream.as_mut() else {
                return;
            };
            let mut chunk = [0u8; READ_CHUNK];
            let polled = poll_fn(|cx| {
                let mut buf = ReadBuf::new(&mut chunk);
                match stream.as_mut().poll_read(cx, &mut buf) {
                    Poll::Ready(res) => Poll::Ready(Some(res.map(|()| buf.filled().len()))),
                    Poll::Pending => Poll::Ready(None),
                }
            })
            .await;

            match polled {
                Some(Ok(n)) => {
                    self.inbound.extend_from_slice(&chunk[..n]);
                    self.after_fill(n);
                    if n == 0 {
                        return;
                    }
                }
                Some(Err(err)) => {
                    self.latch(err);
                    return;
                }
                None => return,
            }
        }
    }

    /// Returns the next chunk of inbound bytes, or `None` on EOF.
    pub async fn read(&mut self) -> io::Result<Option<Bytes>> {
        self.check_failed()?;

        if self.inbound.is_empty() {
            if self.eof {
                return Ok(None);
            }
            let n = match self.fill().await {
                Ok(n) => n,
                Err(err) => return Err(self.latch(err)),
            };
            if n == 0 {
                return Ok(None);
            }
        }
        self.prefetch().await;

        let take = self.inbound.len().min(READ_CHUNK);
        let chunk = self.inbound.split_to(take).freeze();
        if self.paused && self.inbound.len() <= self.marks.low {
            self.paused = false;
            trace!(buffered = self.inbound.len(), "inbound buffering resumed");
        }
        Ok(Some(chunk))
    }

    /// Writes the given bytes to the transport and flushes them.
    pub async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.check_failed()?;

        let Some(stream) = self.stream.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "channel is closed",
            ));
        };
        let result = async {
            stream.write_all(bytes).await?;
            stream.flush().await
        }
        .await;
        result.map_err(|err| self.latch(err))
    }

    /// Drops the transport. Buffered inbound bytes are discarded.
    pub fn close(&mut self) {
        self.stream = None;
        self.inbound.clear();
        self.eof = true;
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}
