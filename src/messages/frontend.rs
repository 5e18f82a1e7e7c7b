//! Logic for building and representing Postgres frontend messages.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

/// The SSLRequest pseudo-message sent before the startup message when TLS
/// is requested. It carries no message code, only a length and a magic
/// request code.
pub const SSL_REQUEST: &[u8] = &[
    0x00, 0x00, 0x00, 0x08, // length: 8
    0x04, 0xD2, 0x16, 0x2F, // code: 80877103
];

/// Protocol version sent in the startup message: 3.0.
pub const PROTOCOL_VERSION: u32 = 3 << 16;

/// Postgres frontend messages are framed by a 1 byte message code,
/// followed by a u32 integer delineating the length of the rest of
/// the message.
///
/// The message code identifies the type of message and format of its
/// payload. The startup message and SSLRequest omit the code byte.
///
/// For more information, see the official Postgres docs:
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html>
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageCode(u8);

impl MessageCode {
    pub const BIND: Self = Self(b'B');
    pub const CLOSE: Self = Self(b'C');
    pub const DESCRIBE: Self = Self(b'D');
    pub const EXECUTE: Self = Self(b'E');
    pub const FLUSH: Self = Self(b'H');
    pub const PARSE: Self = Self(b'P');
    pub const PASSWORD_MESSAGE: Self = Self(b'p');
    pub const QUERY: Self = Self(b'Q');
    pub const SASL_INITIAL_RESPONSE: Self = Self(b'p');
    pub const SASL_RESPONSE: Self = Self(b'p');
    pub const SYNC: Self = Self(b'S');
    pub const TERMINATE: Self = Self(b'X');

    #[inline]
    pub fn frame(self, buf: &mut BytesMut, payload_fn: impl FnOnce(&mut BytesMut)) {
        buf.put_u8(self.0);
        frame(buf, payload_fn);
    }
}

impl From<u8> for MessageCode {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<MessageCode> for u8 {
    fn from(value: MessageCode) -> Self {
        value.0
    }
}

impl PartialEq<u8> for MessageCode {
    fn eq(&self, other: &u8) -> bool {
        self.0 == *other
    }
}

impl PartialEq<MessageCode> for u8 {
    fn eq(&self, other: &MessageCode) -> bool {
        *self == other.0
    }
}

impl std::fmt::Display for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            MessageCode::BIND => "Bind",
            MessageCode::CLOSE => "Close",
            MessageCode::DESCRIBE => "Describe",
            MessageCode::EXECUTE => "Execute",
            MessageCode::FLUSH => "Flush",
            MessageCode::PARSE => "Parse",
            #[allow(unreachable_patterns, reason = "messages all use the same char")]
            MessageCode::PASSWORD_MESSAGE
            | MessageCode::SASL_INITIAL_RESPONSE
            | MessageCode::SASL_RESPONSE => "PasswordMessage|SASLResponse",
            MessageCode::QUERY => "Query",
            MessageCode::SYNC => "Sync",
            MessageCode::TERMINATE => "Terminate",
            _ => "Unknown",
        };
        write!(f, "{name}({})", self.0 as char)
    }
}

impl std::fmt::Debug for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageCode({})", self.0 as char)
    }
}

/// Writes an untagged frame: a u32 length (including itself) followed by
/// the payload produced by `payload_fn`. The length is back-patched once
/// the payload size is known.
#[inline]
pub fn frame(buf: &mut BytesMut, payload_fn: impl FnOnce(&mut BytesMut)) {
    let base = buf.len();
    buf.put_u32(0);

    payload_fn(buf);

    let len = (buf.len() - base) as u32;
    buf[base..base + size_of::<u32>()].copy_from_slice(&len.to_be_bytes());
}

#[inline]
pub(crate) fn put_cstring(b: &mut impl BufMut, src: &[u8]) {
    b.put_slice(src);
    b.put_u8(0);
}

/// Builds the startup message from the given parameters.
///
/// The parameter map is expected to carry at least `user`; the list is
/// terminated with an extra NUL byte.
pub fn startup_message(parameters: &BTreeMap<String, String>) -> Bytes {
    let mut buf = BytesMut::new();
    frame(&mut buf, |buf| {
        buf.put_u32(PROTOCOL_VERSION);

        for (key, val) in parameters {
            put_cstring(buf, key.as_bytes());
            put_cstring(buf, val.as_bytes());
        }

        buf.put_u8(0);
    });

    buf.freeze()
}
