//! The crate error taxonomy and the server error/notice field view.

use std::{borrow::Cow, ops::Range};

use bytes::Bytes;
use thiserror::Error;

use crate::messages::backend::{self, Frame};

pub type Result<T> = std::result::Result<T, Error>;

/// The error type for all Postgres client operations.
///
/// Every failure a connection, statement, cursor or pool can produce maps to
/// exactly one variant.
#[derive(Debug, Error)]
pub enum Error {
    /// The transport could not be established or was lost.
    #[error("socket error: {0}")]
    Socket(#[source] std::io::Error),

    /// The server declined SSL during negotiation.
    #[error("server does not support SSL")]
    SslNotSupported,

    /// The server requested cleartext password authentication but the
    /// credential is of a different kind.
    #[error("server requires a cleartext password credential")]
    CleartextPasswordCredentialRequired,

    /// The server requested MD5 password authentication but the credential
    /// is of a different kind.
    #[error("server requires an md5 password credential")]
    Md5PasswordCredentialRequired,

    /// The server requested SCRAM-SHA-256 authentication but the credential
    /// is of a different kind.
    #[error("server requires a scram-sha-256 credential")]
    ScramSha256CredentialRequired,

    /// The server requires trust authentication but the credential is of a
    /// different kind.
    #[error("server requires a trust credential")]
    TrustCredentialRequired,

    /// The server demanded an authentication method this client does not
    /// implement.
    #[error("unsupported authentication type: {0}")]
    UnsupportedAuthenticationType(String),

    /// The server violated the SCRAM-SHA-256 mechanism, e.g. by returning a
    /// combined nonce that does not extend the client nonce.
    #[error("scram-sha-256 mechanism violated")]
    ScramSha256MechanismViolated,

    /// The server signature did not match the locally computed value.
    #[error("scram-sha-256 server verification failed")]
    ScramSha256ServerVerificationFailed,

    /// The server reported an error in response to a command.
    #[error("server error: {0}")]
    Sql(ServerError),

    /// An operation was attempted on a closed connection.
    #[error("connection is closed")]
    ConnectionClosed,

    /// An operation was attempted on a closed statement.
    #[error("statement is closed")]
    StatementClosed,

    /// An operation was attempted on a closed cursor.
    #[error("cursor is closed")]
    CursorClosed,

    /// Commit or rollback was requested with no transaction open.
    #[error("no transaction is open")]
    NotInTransaction,

    /// A request was made after the pool shut down.
    #[error("connection pool is closed")]
    ConnectionPoolClosed,

    /// The pool's pending-request queue is full.
    #[error("too many requests for connections")]
    TooManyRequestsForConnections,

    /// A pending pool request timed out before a connection became
    /// available.
    #[error("timed out acquiring connection")]
    TimedOutAcquiringConnection,

    /// A text-format value could not be converted.
    #[error("value conversion failed: {0}")]
    ValueConversion(String),
}

impl Error {
    /// Whether this error is fatal to the connection it occurred on.
    ///
    /// SQL errors recover to the next ReadyForQuery; socket and protocol
    /// failures do not.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Socket(_) | Error::ConnectionClosed)
    }
}

/// A zero-copy representation of a Postgres ErrorResponse or NoticeResponse.
///
/// Notices delivered to a [`ConnectionDelegate`] use the same shape as
/// errors; both bodies are a sequence of tagged, NUL-terminated fields.
///
/// [`ConnectionDelegate`]: crate::ConnectionDelegate
#[derive(Clone)]
pub struct ServerError {
    body: Bytes,
    local_severity: Option<Range<usize>>,    // S
    severity: Option<Range<usize>>,          // V
    code: Option<Range<usize>>,              // C
    message: Option<Range<usize>>,           // M
    detail: Option<Range<usize>>,            // D
    hint: Option<Range<usize>>,              // H
    position: Option<Range<usize>>,          // P
    internal_position: Option<Range<usize>>, // p
    internal_query: Option<Range<usize>>,    // q
    r#where: Option<Range<usize>>,           // W
    schema: Option<Range<usize>>,            // s
    table: Option<Range<usize>>,             // t
    column: Option<Range<usize>>,            // c
    datatype: Option<Range<usize>>,          // d
    constraint: Option<Range<usize>>,        // n
    file: Option<Range<usize>>,              // F
    line: Option<Range<usize>>,              // L
    routine: Option<Range<usize>>,           // R
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sev = self.local_severity().unwrap_or("UNKNOWN".into());
        let code = self.code().unwrap_or("?????".into());
        let msg = self.message().unwrap_or("<no message>".into());
        write!(f, "[{sev}] {code}: {msg}")
    }
}

impl std::fmt::Debug for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerError")
            .field("local_severity", &self.local_severity())
            .field("severity", &self.severity())
            .field("code", &self.code())
            .field("message", &self.message())
            .field("detail", &self.detail())
            .field("hint", &self.hint())
            .field("position", &self.position())
            .field("where", &self.r#where())
            .field("file", &self.file())
            .field("line", &self.line())
            .field("routine", &self.routine())
            .finish_non_exhaustive()
    }
}

impl ServerError {
    pub(crate) fn new(body: Bytes) -> Self {
        let mut resp = ServerError {
            body: body.clone(),
            local_severity: None,
            severity: None,
            code: None,
            message: None,
            detail: None,
            hint: None,
            position: None,
            internal_position: None,
            internal_query: None,
            r#where: None,
            schema: None,
            table: None,
            column: None,
            datatype: None,
            constraint: None,
            file: None,
            line: None,
            routine: None,
        };

        let mut offset = 0;
        for field in body.split(|b| *b == 0) {
            if field.is_empty() {
                break;
            }

            // field[0] = tag, field[1..] = value
            let tag = field[0];
            let start = offset + 1;
            let end = start + field.len() - 1; // minus tag

            let range = start..end;
            match tag {
                b'S' => resp.local_severity = Some(range),
                b'V' => resp.severity = Some(range),
                b'C' => resp.code = Some(range),
                b'M' => resp.message = Some(range),
                b'D' => resp.detail = Some(range),
                b'H' => resp.hint = Some(range),
                b'P' => resp.position = Some(range),
                b'p' => resp.internal_position = Some(range),
                b'q' => resp.internal_query = Some(range),
                b'W' => resp.r#where = Some(range),
                b's' => resp.schema = Some(range),
                b't' => resp.table = Some(range),
                b'c' => resp.column = Some(range),
                b'd' => resp.datatype = Some(range),
                b'n' => resp.constraint = Some(range),
                b'F' => resp.file = Some(range),
                b'L' => resp.line = Some(range),
                b'R' => resp.routine = Some(range),
                _ => {}
            }

            offset += field.len() + 1; // +1 for the null terminator
        }

        resp
    }

    fn field(&self, range: &Option<Range<usize>>) -> Option<Cow<'_, str>> {
        range
            .as_ref()
            .map(|r| String::from_utf8_lossy(&self.body[r.start..r.end]))
    }

    pub fn local_severity(&self) -> Option<Cow<'_, str>> {
        self.field(&self.local_severity)
    }

    pub fn severity(&self) -> Option<Cow<'_, str>> {
        self.field(&self.severity)
    }

    pub fn code(&self) -> Option<Cow<'_, str>> {
        self.field(&self.code)
    }

    pub fn message(&self) -> Option<Cow<'_, str>> {
        self.field(&self.message)
    }

    pub fn detail(&self) -> Option<Cow<'_, str>> {
        self.field(&self.detail)
    }

    pub fn hint(&self) -> Option<Cow<'_, str>> {
        self.field(&self.hint)
    }

    pub fn position(&self) -> Option<Cow<'_, str>> {
        self.field(&self.position)
    }

    pub fn internal_position(&self) -> Option<Cow<'_, str>> {
        self.field(&self.internal_position)
    }

    pub fn internal_query(&self) -> Option<Cow<'_, str>> {
        self.field(&self.internal_query)
    }

    pub fn r#where(&self) -> Option<Cow<'_, str>> {
        self.field(&self.r#where)
    }

    pub fn schema(&self) -> Option<Cow<'_, str>> {
        self.field(&self.schema)
    }

    pub fn table(&self) -> Option<Cow<'_, str>> {
        self.field(&self.table)
    }

    pub fn column(&self) -> Option<Cow<'_, str>> {
        self.field(&self.column)
    }

    pub fn datatype(&self) -> Option<Cow<'_, str>> {
        self.field(&self.datatype)
    }

    pub fn constraint(&self) -> Option<Cow<'_, str>> {
        self.field(&self.constraint)
    }

    pub fn file(&self) -> Option<Cow<'_, str>> {
        self.field(&self.file)
    }

    pub fn line(&self) -> Option<Cow<'_, str>> {
        self.field(&self.line)
    }

    pub fn routine(&self) -> Option<Cow<'_, str>> {
        self.field(&self.routine)
    }
}

impl TryFrom<Frame> for ServerError {
    type Error = Frame;

    fn try_from(frame: Frame) -> std::result::Result<Self, Frame> {
        if frame.code == backend::MessageCode::ERROR_RESPONSE
            || frame.code == backend::MessageCode::NOTICE_RESPONSE
        {
            Ok(ServerError::new(frame.body))
        } else {
            Err(frame)
        }
    }
}
