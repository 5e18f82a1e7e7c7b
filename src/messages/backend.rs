//! Logic for parsing and representing Postgres backend messages.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum allowed frame size from Postgres (1GiB).
///
/// This is an upper bound to prevent misbehaving servers from
/// allocating excessive memory or causing OOMs.
/// See: <https://github.com/postgres/postgres/blob/879c492480d0e9ad8155c4269f95c5e8add41901/src/include/utils/memutils.h#L40>
pub(crate) const MAX_FRAME_SIZE_BYTES: usize = 1 << 30; // 1GiB

/// Postgres backend messages are framed by a 1-byte message code,
/// followed by a u32 length for the rest of the message body.
///
/// The message code identifies the type of message and the structure
/// of its payload.
///
/// See: <https://www.postgresql.org/docs/current/protocol-message-formats.html>
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageCode(u8);

impl MessageCode {
    pub const AUTHENTICATION: Self = Self(b'R');
    pub const BACKEND_KEY_DATA: Self = Self(b'K');
    pub const BIND_COMPLETE: Self = Self(b'2');
    pub const CLOSE_COMPLETE: Self = Self(b'3');
    pub const COMMAND_COMPLETE: Self = Self(b'C');
    pub const DATA_ROW: Self = Self(b'D');
    pub const EMPTY_QUERY_RESPONSE: Self = Self(b'I');
    pub const ERROR_RESPONSE: Self = Self(b'E');
    pub const NO_DATA: Self = Self(b'n');
    pub const NOTICE_RESPONSE: Self = Self(b'N');
    pub const NOTIFICATION_RESPONSE: Self = Self(b'A');
    pub const PARAMETER_DESCRIPTION: Self = Self(b't');
    pub const PARAMETER_STATUS: Self = Self(b'S');
    pub const PARSE_COMPLETE: Self = Self(b'1');
    pub const PORTAL_SUSPENDED: Self = Self(b's');
    pub const READY_FOR_QUERY: Self = Self(b'Z');
    pub const ROW_DESCRIPTION: Self = Self(b'T');
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
            MessageCode::AUTHENTICATION => "Authentication",
            MessageCode::BACKEND_KEY_DATA => "BackendKeyData",
            MessageCode::BIND_COMPLETE => "BindComplete",
            MessageCode::CLOSE_COMPLETE => "CloseComplete",
            MessageCode::COMMAND_COMPLETE => "CommandComplete",
            MessageCode::DATA_ROW => "DataRow",
            MessageCode::EMPTY_QUERY_RESPONSE => "EmptyQueryResponse",
            MessageCode::ERROR_RESPONSE => "ErrorResponse",
            MessageCode::NO_DATA => "NoData",
            MessageCode::NOTICE_RESPONSE => "NoticeResponse",
            MessageCode::NOTIFICATION_RESPONSE => "NotificationResponse",
            MessageCode::PARAMETER_DESCRIPTION => "ParameterDescription",
            MessageCode::PARAMETER_STATUS => "ParameterStatus",
            MessageCode::PARSE_COMPLETE => "ParseComplete",
            MessageCode::PORTAL_SUSPENDED => "PortalSuspended",
            MessageCode::READY_FOR_QUERY => "ReadyForQuery",
            MessageCode::ROW_DESCRIPTION => "RowDescription",
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

/// A single Postgres protocol frame, containing the message code and the
/// message body.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The type of the message
    pub code: MessageCode,
    /// The payload of the message
    pub body: Bytes,
}

impl Frame {
    /// Constructs a new `Frame` with the given message code and body.
    pub fn new(code: impl Into<MessageCode>, body: impl Into<Bytes>) -> Self {
        Self {
            code: code.into(),
            body: body.into(),
        }
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:?}", self.code, self.body)
    }
}

/// Reads a single Postgres frame from an asynchronous `AsyncRead` stream.
pub async fn read_frame(mut stream: impl AsyncRead + Unpin) -> std::io::Result<Frame> {
    let mut buf = [0; 1];
    stream.read_exact(&mut buf).await?;
    let code: MessageCode = buf[0].into();

    let mut buf = [0; 4];
    stream.read_exact(&mut buf).await?;
    let len = u32::from_be_bytes(buf) as usize;

    if len > MAX_FRAME_SIZE_BYTES {
        let err_msg = format!("frame size exceeds {MAX_FRAME_SIZE_BYTES}B");
        return Err(std::io::Error::new(
            std::io::ErrorKind::QuotaExceeded,
            err_msg,
        ));
    }
    if len < size_of::<u32>() {
        return Err(protocol_error("frame length below minimum"));
    }

    let mut body = BytesMut::zeroed(len - size_of::<u32>());
    stream.read_exact(&mut body).await?;

    Ok(Frame::new(code, body))
}

fn protocol_error(msg: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.into())
}

/// Reads a null-terminated string from a `Bytes` buffer.
///
/// The returned string excludes the null terminator. Returns an error
/// if no null terminator is found or if the bytes are not valid UTF-8.
pub(crate) fn read_cstring(bytes: &mut Bytes) -> std::io::Result<String> {
    let Some(end) = bytes.iter().position(|&b| b == 0) else {
        return Err(protocol_error("null terminator missing"));
    };

    let bytes = bytes.split_to(end + 1);
    match String::from_utf8(bytes[..end].to_vec()) {
        Ok(string) => Ok(string),
        Err(err) => Err(std::io::Error::other(err)),
    }
}

fn ensure_remaining(bytes: &Bytes, n: usize) -> std::io::Result<()> {
    if bytes.remaining() < n {
        return Err(protocol_error("message body truncated"));
    }
    Ok(())
}

/// Transaction status reported by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// `I`: no transaction is open.
    Idle,
    /// `T`: an explicit transaction is open.
    InTransaction,
    /// `E`: the open transaction has failed and awaits ROLLBACK.
    Failed,
}

impl TransactionStatus {
    pub fn as_char(self) -> char {
        match self {
            TransactionStatus::Idle => 'I',
            TransactionStatus::InTransaction => 'T',
            TransactionStatus::Failed => 'E',
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Parses a ReadyForQuery body.
pub fn parse_ready_for_query(body: &mut Bytes) -> std::io::Result<TransactionStatus> {
    ensure_remaining(body, 1)?;
    match body.get_u8() {
        b'I' => Ok(TransactionStatus::Idle),
        b'T' => Ok(TransactionStatus::InTransaction),
        b'E' => Ok(TransactionStatus::Failed),
        status => Err(protocol_error(format!(
            "unknown transaction status {:?}",
            status as char
        ))),
    }
}

/// Parses a ParameterStatus body into its name/value pair.
pub fn parse_parameter_status(body: &mut Bytes) -> std::io::Result<(String, String)> {
    let name = read_cstring(body)?;
    let value = read_cstring(body)?;
    Ok((name, value))
}

/// Backend process id and cancellation secret from BackendKeyData.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKey {
    pub process_id: u32,
    pub secret_key: u32,
}

/// Parses a BackendKeyData body.
pub fn parse_backend_key_data(body: &mut Bytes) -> std::io::Result<BackendKey> {
    ensure_remaining(body, 8)?;
    Ok(BackendKey {
        process_id: body.get_u32(),
        secret_key: body.get_u32(),
    })
}

/// Metadata for one column of a result set, from RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub name: String,
    pub table_oid: u32,
    pub column_attribute_number: i16,
    pub data_type_oid: u32,
    pub data_type_size: i16,
    pub data_type_modifier: i32,
}

/// Parses a RowDescription body into per-column metadata.
///
/// The trailing format code of each field is consumed and discarded;
/// results are always requested in text format.
pub fn parse_row_description(body: &mut Bytes) -> std::io::Result<Vec<ColumnMetadata>> {
    ensure_remaining(body, 2)?;
    let count = body.get_u16();

    let mut columns = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = read_cstring(body)?;
        ensure_remaining(body, 18)?;
        columns.push(ColumnMetadata {
            name,
            table_oid: body.get_u32(),
            column_attribute_number: body.get_i16(),
            data_type_oid: body.get_u32(),
            data_type_size: body.get_i16(),
            data_type_modifier: body.get_i32(),
        });
        body.advance(2); // format code
    }

    if body.has_remaining() {
        return Err(protocol_error("trailing bytes after RowDescription"));
    }
    Ok(columns)
}

/// Parses a DataRow body into its raw column values; `None` marks NULL.
pub fn parse_data_row(body: &mut Bytes) -> std::io::Result<Vec<Option<Bytes>>> {
    ensure_remaining(body, 2)?;
    let count = body.get_u16();

    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        ensure_remaining(body, 4)?;
        let len = body.get_i32();
        if len < 0 {
            values.push(None);
        } else {
            ensure_remaining(body, len as usize)?;
            values.push(Some(body.split_to(len as usize)));
        }
    }

    if body.has_remaining() {
        return Err(protocol_error("trailing bytes after DataRow"));
    }
    Ok(values)
}

/// Parses a ParameterDescription body into parameter type OIDs.
pub fn parse_parameter_description(body: &mut Bytes) -> std::io::Result<Vec<u32>> {
    ensure_remaining(body, 2)?;
    let count = body.get_u16();
    ensure_remaining(body, count as usize * 4)?;
    Ok((0..count).map(|_| body.get_u32()).collect())
}

/// Parses a CommandComplete body into its command tag and, when the tag
/// carries one, the affected-row count (`SELECT 3`, `DELETE 1`,
/// `INSERT 0 5`, ...).
pub fn parse_command_complete(body: &mut Bytes) -> std::io::Result<(String, Option<u64>)> {
    let tag = read_cstring(body)?;
    let rows = tag
        .rsplit(' ')
        .next()
        .and_then(|count| count.parse::<u64>().ok());
    Ok((tag, rows))
}

/// An asynchronous notification from NotificationResponse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub process_id: u32,
    pub channel: String,
    pub payload: String,
}

/// Parses a NotificationResponse body.
pub fn parse_notification(body: &mut Bytes) -> std::io::Result<Notification> {
    ensure_remaining(body, 4)?;
    let process_id = body.get_u32();
    let channel = read_cstring(body)?;
    let payload = read_cstring(body)?;
    Ok(Notification {
        process_id,
        channel,
        payload,
    })
}

/// An authentication request from the backend (`R` messages).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    Ok,
    KerberosV5,
    CleartextPassword,
    Md5Password([u8; 4]),
    Gss,
    GssContinue,
    Sspi,
    /// SASL with the mechanisms the server offers, in server order.
    Sasl(Vec<String>),
    SaslContinue(String),
    SaslFinal(String),
}

impl AuthRequest {
    /// Parses an Authentication message body.
    pub fn parse(body: &mut Bytes) -> std::io::Result<Self> {
        ensure_remaining(body, 4)?;
        let code = body.get_u32();
        let req = match code {
            0 => AuthRequest::Ok,
            2 => AuthRequest::KerberosV5,
            3 => AuthRequest::CleartextPassword,
            5 => {
                ensure_remaining(body, 4)?;
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&body.split_to(4));
                AuthRequest::Md5Password(salt)
            }
            7 => AuthRequest::Gss,
            8 => AuthRequest::GssContinue,
            9 => AuthRequest::Sspi,
            10 => {
                let mut mechanisms = Vec::new();
                while body.has_remaining() && body[0] != 0 {
                    mechanisms.push(read_cstring(body)?);
                }
                AuthRequest::Sasl(mechanisms)
            }
            11 => AuthRequest::SaslContinue(String::from_utf8_lossy(body).to_string()),
            12 => AuthRequest::SaslFinal(String::from_utf8_lossy(body).to_string()),
            code => {
                return Err(protocol_error(format!("unknown auth request code {code}")));
            }
        };
        Ok(req)
    }

    /// The descriptive name used when reporting unsupported methods.
    pub fn name(&self) -> &'static str {
        match self {
            AuthRequest::Ok => "AuthenticationOk",
            AuthRequest::KerberosV5 => "AuthenticationKerberosV5",
            AuthRequest::CleartextPassword => "AuthenticationCleartextPassword",
            AuthRequest::Md5Password(_) => "AuthenticationMD5Password",
            AuthRequest::Gss => "AuthenticationGSS",
            AuthRequest::GssContinue => "AuthenticationGSSContinue",
            AuthRequest::Sspi => "AuthenticationSSPI",
            AuthRequest::Sasl(_) => "AuthenticationSASL",
            AuthRequest::SaslContinue(_) => "AuthenticationSASLContinue",
            AuthRequest::SaslFinal(_) => "AuthenticationSASLFinal",
        }
    }
}

impl std::fmt::Display for AuthRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
