//! Message codec: frontend frame building and backend frame decoding over a
//! [`ByteChannel`].

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tracing::trace;

use crate::channel::ByteChannel;
use crate::messages::backend::{self, Frame};
use crate::messages::frontend::{MessageCode, put_cstring};

/// A buffered protocol codec.
///
/// Frontend messages accumulate in the write buffer through the `put_*`
/// builders and go out together on [`flush`](Codec::flush), minimizing
/// syscalls. Backend frames are reassembled from the channel's inbound
/// chunks in the read buffer.
pub(crate) struct Codec {
    channel: ByteChannel,
    rbuf: BytesMut,
    wbuf: BytesMut,
}

impl Codec {
    pub fn new(channel: ByteChannel) -> Self {
        Codec {
            channel,
            rbuf: BytesMut::new(),
            wbuf: BytesMut::new(),
        }
    }

    /// Writes raw bytes directly to the buffer without framing.
    pub fn put_bytes(&mut self, src: &[u8]) -> &mut Self {
        self.wbuf.put(src);
        self
    }

    /// Adds a simple query message.
    pub fn put_query(&mut self, stmt: &str) -> &mut Self {
        MessageCode::QUERY.frame(&mut self.wbuf, |b| {
            put_cstring(b, stmt.as_bytes());
        });
        self
    }

    /// Adds a Parse message. Parameter types are left for the server to
    /// infer.
    pub fn put_parse(&mut self, name: &str, stmt: &str) -> &mut Self {
        MessageCode::PARSE.frame(&mut self.wbuf, |b| {
            put_cstring(b, name.as_bytes());
            put_cstring(b, stmt.as_bytes());
            b.put_u16(0);
        });
        self
    }

    /// Adds a Describe message for a prepared statement.
    pub fn put_describe_statement(&mut self, name: &str) -> &mut Self {
        MessageCode::DESCRIBE.frame(&mut self.wbuf, |b| {
            b.put_u8(b'S');
            put_cstring(b, name.as_bytes());
        });
        self
    }

    /// Adds a Bind message with all parameters and results in text format.
    pub fn put_bind(
        &mut self,
        portal_name: &str,
        stmt_name: &str,
        params: &[Option<String>],
    ) -> &mut Self {
        MessageCode::BIND.frame(&mut self.wbuf, |b| {
            put_cstring(b, portal_name.as_bytes());
            put_cstring(b, stmt_name.as_bytes());

            // No per-parameter format codes: all default to text.
            b.put_u16(0);

            b.put_u16(params.len() as u16);
            for param in params {
                match param {
                    Some(value) => {
                        b.put_u32(value.len() as u32);
                        b.put_slice(value.as_bytes());
                    }
                    None => {
                        b.put_i32(-1);
                    }
                }
            }

            // One result format code applying to all columns: text.
            b.put_u16(1);
            b.put_u16(0);
        });
        self
    }

    /// Adds an Execute message for a bound portal. `max_rows` 0 means
    /// unlimited.
    pub fn put_execute(&mut self, name: &str, max_rows: u32) -> &mut Self {
        MessageCode::EXECUTE.frame(&mut self.wbuf, |b| {
            put_cstring(b, name.as_bytes());
            b.put_u32(max_rows);
        });
        self
    }

    /// Adds a Close message for a prepared statement.
    pub fn put_close_statement(&mut self, name: &str) -> &mut Self {
        MessageCode::CLOSE.frame(&mut self.wbuf, |b| {
            b.put_u8(b'S');
            put_cstring(b, name.as_bytes());
        });
        self
    }

    /// Adds a Flush message to force sending pending responses.
    pub fn put_flush(&mut self) -> &mut Self {
        MessageCode::FLUSH.frame(&mut self.wbuf, |_| {});
        self
    }

    /// Adds a Sync message to end an extended query protocol sequence.
    pub fn put_sync(&mut self) -> &mut Self {
        MessageCode::SYNC.frame(&mut self.wbuf, |_| {});
        self
    }

    /// Adds a Terminate message.
    pub fn put_terminate(&mut self) -> &mut Self {
        MessageCode::TERMINATE.frame(&mut self.wbuf, |_| {});
        self
    }

    /// Adds a PasswordMessage carrying a cleartext or md5-hashed password.
    pub fn put_password(&mut self, password: &str) -> &mut Self {
        MessageCode::PASSWORD_MESSAGE.frame(&mut self.wbuf, |b| {
            put_cstring(b, password.as_bytes());
        });
        self
    }

    /// Adds a SASLInitialResponse with the given mechanism and
    /// client-first-message.
    pub fn put_sasl_initial(&mut self, mechanism: &str, response: &str) -> &mut Self {
        MessageCode::SASL_INITIAL_RESPONSE.frame(&mut self.wbuf, |b| {
            put_cstring(b, mechanism.as_bytes());
            b.put_u32(response.len() as u32);
            b.put_slice(response.as_bytes());
        });
        self
    }

    /// Adds a SASLResponse with the given client message.
    pub fn put_sasl_response(&mut self, response: &str) -> &mut Self {
        MessageCode::SASL_RESPONSE.frame(&mut self.wbuf, |b| {
            b.put_slice(response.as_bytes());
        });
        self
    }

    /// Flushes the buffered messages to the channel.
    pub async fn flush(&mut self) -> io::Result<()> {
        if self.wbuf.is_empty() {
            return Ok(());
        }
        let out = self.wbuf.split();
        self.channel.write(&out).await
    }

    /// Buffers at least `n` unread bytes, or fails with `UnexpectedEof`.
    async fn fill_rbuf(&mut self, n: usize) -> io::Result<()> {
        while self.rbuf.len() < n {
            match self.channel.read().await? {
                Some(chunk) => self.rbuf.extend_from_slice(&chunk),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by server",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Reads the next backend frame.
    pub async fn read_frame(&mut self) -> io::Result<Frame> {
        self.fill_rbuf(5).await?;
        let code: backend::MessageCode = self.rbuf.get_u8().into();
        let len = self.rbuf.get_u32() as usize;

        if len > backend::MAX_FRAME_SIZE_BYTES {
            let err_msg = format!("frame size exceeds {}B", backend::MAX_FRAME_SIZE_BYTES);
            return Err(io::Error::new(io::ErrorKind::QuotaExceeded, err_msg));
        }
        if len < size_of::<u32>() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame length below minimum",
            ));
        }

        let body_len = len - size_of::<u32>();
        self.fill_rbuf(body_len).await?;
        let frame = Frame::new(code, self.rbuf.split_to(body_len).freeze());
        trace!(%frame.code, len = body_len, "read frame");
        Ok(frame)
    }

    /// Drains inbound data until the server closes the stream. Errors are
    /// ignored; this runs during orderly teardown.
    pub async fn drain(&mut self) {
        while let Ok(Some(_)) = self.channel.read().await {}
    }

    /// Closes the underlying channel.
    pub fn close(&mut self) {
        self.channel.close();
    }
}
