//! Connection establishment and the connection state machine.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use md5::{Digest, Md5};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::channel::{BoxedTransport, ByteChannel, Watermarks};
use crate::codec::Codec;
use crate::error::{Error, Result, ServerError};
use crate::messages::backend::{self, AuthRequest, BackendKey, Frame, TransactionStatus};
use crate::messages::frontend;
use crate::scram::{ScramClient, ScramError};
use crate::statement::{Cursor, Statement, ToSqlText};

/// How a connection authenticates itself to the server.
#[derive(Clone)]
pub enum Credential {
    /// No authentication material; the server must accept the session as-is.
    Trust,
    /// A password sent in cleartext (use only over TLS).
    CleartextPassword(String),
    /// A password hashed with the server-provided salt via double MD5.
    Md5Password(String),
    /// A password proven via SCRAM-SHA-256.
    ScramSha256(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the password itself.
        let name = match self {
            Credential::Trust => "Trust",
            Credential::CleartextPassword(_) => "CleartextPassword",
            Credential::Md5Password(_) => "Md5Password",
            Credential::ScramSha256(_) => "ScramSha256",
        };
        write!(f, "Credential::{name}")
    }
}

/// Opens transports to the database host.
pub trait ChannelOpener: Send + Sync {
    fn open(&self) -> BoxFuture<'_, io::Result<BoxedTransport>>;
}

/// The default opener: a TCP connection with Nagle disabled.
pub struct TcpChannelOpener {
    host: String,
    port: u16,
}

impl TcpChannelOpener {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        TcpChannelOpener {
            host: host.into(),
            port,
        }
    }
}

impl ChannelOpener for TcpChannelOpener {
    fn open(&self) -> BoxFuture<'_, io::Result<BoxedTransport>> {
        Box::pin(async move {
            let stream = tokio::net::TcpStream::connect((self.host.as_str(), self.port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::pin(stream) as BoxedTransport)
        })
    }
}

/// Upgrades an accepted SSL negotiation to an encrypted transport.
///
/// Implemented for any `Fn(BoxedTransport) -> BoxFuture<io::Result<BoxedTransport>>`,
/// so a TLS library adapter can be passed as a closure.
pub trait TlsUpgrader: Send + Sync {
    fn upgrade(&self, stream: BoxedTransport) -> BoxFuture<'static, io::Result<BoxedTransport>>;
}

impl<F> TlsUpgrader for F
where
    F: Fn(BoxedTransport) -> BoxFuture<'static, io::Result<BoxedTransport>> + Send + Sync,
{
    fn upgrade(&self, stream: BoxedTransport) -> BoxFuture<'static, io::Result<BoxedTransport>> {
        self(stream)
    }
}

/// Whether and how to tunnel the connection through TLS.
#[derive(Clone, Default)]
pub enum TlsMode {
    #[default]
    Disabled,
    /// Negotiate SSL before startup; fail if the server declines.
    Required(Arc<dyn TlsUpgrader>),
}

/// Receives out-of-band events from a connection.
pub trait ConnectionDelegate: Send + Sync {
    /// A NoticeResponse arrived.
    fn notice_received(&self, _notice: &ServerError) {}

    /// The server reported a run-time parameter, at startup or after a
    /// `SET`.
    fn parameter_status_changed(&self, _name: &str, _value: &str) {}
}

/// Configuration for new connections.
///
/// The startup parameters default to `database` = user,
/// `application_name` = `pg_client`, UTF8 client encoding, ISO/MDY date
/// style, and the GMT time zone.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    credential: Credential,
    watermarks: Watermarks,
    options: BTreeMap<String, String>,
}

impl ConnectionConfig {
    /// Creates a configuration for the specified user, defaulting to trust
    /// authentication.
    pub fn new(user: impl Into<String>) -> Self {
        let user = user.into();

        let mut options = BTreeMap::new();
        options.insert("application_name".into(), "pg_client".into());
        options.insert("client_encoding".into(), "UTF8".into());
        options.insert("database".into(), user.clone());
        options.insert("user".into(), user);
        options.insert("DateStyle".into(), "ISO, MDY".into());
        options.insert("TimeZone".into(), "GMT".into());

        ConnectionConfig {
            credential: Credential::Trust,
            watermarks: Watermarks::default(),
            options,
        }
    }

    /// Sets the database name to connect to.
    ///
    /// If not specified, defaults to the username.
    pub fn database(self, db: impl Into<String>) -> Self {
        self.add_option("database", db)
    }

    /// Sets the username.
    pub fn user(self, user: impl Into<String>) -> Self {
        self.add_option("user", user)
    }

    /// Sets the application name reported to the server.
    pub fn application_name(self, app: impl Into<String>) -> Self {
        self.add_option("application_name", app)
    }

    /// Sets the credential presented during authentication.
    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }

    /// Overrides the inbound buffering watermarks.
    pub fn watermarks(mut self, watermarks: Watermarks) -> Self {
        self.watermarks = watermarks;
        self
    }

    /// Adds a startup parameter option.
    pub fn add_option(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.options.insert(key.into(), val.into());
        self
    }

    fn get_user(&self) -> &str {
        self.options.get("user").expect("user should always be set")
    }
}

/// Creates configured, authenticated connections.
pub struct ConnectionFactory {
    opener: Arc<dyn ChannelOpener>,
    config: ConnectionConfig,
    tls: TlsMode,
    delegate: Option<Arc<dyn ConnectionDelegate>>,
}

impl ConnectionFactory {
    pub fn new(opener: impl ChannelOpener + 'static, config: ConnectionConfig) -> Self {
        ConnectionFactory {
            opener: Arc::new(opener),
            config,
            tls: TlsMode::Disabled,
            delegate: None,
        }
    }

    /// Requires TLS, upgrading the transport with the given upgrader once
    /// the server accepts the SSL request.
    pub fn tls(mut self, upgrader: impl TlsUpgrader + 'static) -> Self {
        self.tls = TlsMode::Required(Arc::new(upgrader));
        self
    }

    /// Sets the delegate handed to every connection this factory creates.
    pub fn delegate(mut self, delegate: Arc<dyn ConnectionDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Opens a transport, negotiates TLS if required, performs the startup
    /// handshake and authentication, and waits for the server to become
    /// ready.
    pub async fn connect(&self) -> Result<Connection> {
        let stream = self.opener.open().await.map_err(Error::Socket)?;
        let stream = match &self.tls {
            TlsMode::Disabled => stream,
            TlsMode::Required(upgrader) => negotiate_tls(stream, upgrader.as_ref()).await?,
        };

        let channel = ByteChannel::with_watermarks(stream, self.config.watermarks);
        let mut codec = Codec::new(channel);

        codec.put_bytes(&frontend::startup_message(&self.config.options));
        codec.flush().await.map_err(Error::Socket)?;

        self.authenticate(&mut codec).await?;

        let mut conn = Connection::new(codec, self.delegate.clone());
        match conn.read_until_ready().await? {
            Some(err) => Err(Error::Sql(err)),
            None => {
                debug!(id = %conn.id, user = self.config.get_user(), "connection established");
                Ok(conn)
            }
        }
    }

    /// Drives the authentication exchange until the server reports
    /// AuthenticationOk.
    async fn authenticate(&self, codec: &mut Codec) -> Result<()> {
        loop {
            match self.read_auth_request(codec).await? {
                AuthRequest::Ok => return Ok(()),
                AuthRequest::CleartextPassword => {
                    let Credential::CleartextPassword(password) = &self.config.credential else {
                        return Err(Error::CleartextPasswordCredentialRequired);
                    };
                    codec.put_password(password);
                    codec.flush().await.map_err(Error::Socket)?;
                }
                AuthRequest::Md5Password(salt) => {
                    let Credential::Md5Password(password) = &self.config.credential else {
                        return Err(Error::Md5PasswordCredentialRequired);
                    };
                    codec.put_password(&md5_response(self.config.get_user(), password, salt));
                    codec.flush().await.map_err(Error::Socket)?;
                }
                AuthRequest::Sasl(mechanisms) => {
                    if !mechanisms.iter().any(|m| m == "SCRAM-SHA-256") {
                        return Err(Error::UnsupportedAuthenticationType(mechanisms.join(", ")));
                    }
                    let Credential::ScramSha256(password) = &self.config.credential else {
                        return Err(Error::ScramSha256CredentialRequired);
                    };
                    self.scram_exchange(codec, password).await?;
                }
                req @ (AuthRequest::SaslContinue(_) | AuthRequest::SaslFinal(_)) => {
                    error!(%req, "authentication continuation outside a SASL exchange");
                    codec.close();
                    return Err(Error::ConnectionClosed);
                }
                req => {
                    return Err(Error::UnsupportedAuthenticationType(req.name().to_string()));
                }
            }
        }
    }

    /// Runs the SCRAM-SHA-256 exchange up to (but not including) the final
    /// AuthenticationOk.
    async fn scram_exchange(&self, codec: &mut Codec, password: &str) -> Result<()> {
        let (scram, client_first) = ScramClient::new(password).client_first();
        codec.put_sasl_initial("SCRAM-SHA-256", &client_first);
        codec.flush().await.map_err(Error::Socket)?;

        let server_first = match self.read_auth_request(codec).await? {
            AuthRequest::SaslContinue(message) => message,
            req => {
                error!(%req, "expected SASLContinue");
                codec.close();
                return Err(Error::ConnectionClosed);
            }
        };
        let (scram, client_final) = scram
            .handle_server_first(&server_first)
            .map_err(Error::from)?;

        codec.put_sasl_response(&client_final);
        codec.flush().await.map_err(Error::Socket)?;

        let server_final = match self.read_auth_request(codec).await? {
            AuthRequest::SaslFinal(message) => message,
            req => {
                error!(%req, "expected SASLFinal");
                codec.close();
                return Err(Error::ConnectionClosed);
            }
        };
        scram.handle_server_final(&server_final).map_err(Error::from)
    }

    /// Reads the next Authentication message, forwarding notices and
    /// surfacing server errors.
    async fn read_auth_request(&self, codec: &mut Codec) -> Result<AuthRequest> {
        loop {
            let frame = codec.read_frame().await.map_err(Error::Socket)?;
            match frame.code {
                backend::MessageCode::AUTHENTICATION => {
                    let mut body = frame.body;
                    return AuthRequest::parse(&mut body).map_err(|err| {
                        error!(%err, "malformed authentication request");
                        codec.close();
                        Error::ConnectionClosed
                    });
                }
                backend::MessageCode::ERROR_RESPONSE => {
                    return Err(Error::Sql(ServerError::new(frame.body)));
                }
                backend::MessageCode::NOTICE_RESPONSE => {
                    if let Some(delegate) = &self.delegate {
                        delegate.notice_received(&ServerError::new(frame.body));
                    }
                }
                code => {
                    error!(%code, "unexpected message during authentication");
                    codec.close();
                    return Err(Error::ConnectionClosed);
                }
            }
        }
    }
}

impl From<ScramError> for Error {
    fn from(err: ScramError) -> Self {
        match err {
            ScramError::MechanismViolated => Error::ScramSha256MechanismViolated,
            ScramError::ServerVerificationFailed => Error::ScramSha256ServerVerificationFailed,
        }
    }
}

/// Sends the SSL request and upgrades the transport if the server accepts.
async fn negotiate_tls(
    mut stream: BoxedTransport,
    upgrader: &dyn TlsUpgrader,
) -> Result<BoxedTransport> {
    stream
        .write_all(frontend::SSL_REQUEST)
        .await
        .map_err(Error::Socket)?;
    stream.flush().await.map_err(Error::Socket)?;

    let mut buf = [0; 1];
    stream.read_exact(&mut buf).await.map_err(Error::Socket)?;

    const SSL_SUCCESS: u8 = b'S';
    const SSL_FAILURE: u8 = b'N';

    match buf[0] {
        SSL_SUCCESS => upgrader.upgrade(stream).await.map_err(Error::Socket),
        SSL_FAILURE => Err(Error::SslNotSupported),
        code => Err(Error::Socket(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected SSL response code '{}'", code as char),
        ))),
    }
}

/// Computes the MD5 password response: `md5` + hex(md5(hex(md5(pw || user)) || salt)).
fn md5_response(user: &str, password: &str, salt: [u8; 4]) -> String {
    let inner = Md5::new_with_prefix(password.as_bytes())
        .chain_update(user.as_bytes())
        .finalize();
    let outer = Md5::new_with_prefix(hex(inner.as_slice()).as_bytes())
        .chain_update(salt)
        .finalize();
    format!("md5{}", hex(outer.as_slice()))
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(
        String::with_capacity(bytes.len() * 2),
        |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        },
    )
}

/// An authenticated Postgres session.
///
/// A connection is a sequential resource: its operations borrow it mutably
/// and must not be interleaved. At most one prepared statement and one
/// cursor are open at a time; preparing a new statement closes its
/// predecessor on the server.
pub struct Connection {
    id: String,
    codec: Codec,
    delegate: Option<Arc<dyn ConnectionDelegate>>,
    parameters: HashMap<String, String>,
    backend_key: Option<BackendKey>,
    tx_status: TransactionStatus,
    open_statement: Option<String>,
    /// A portal is mid-execution and the server is owed a Sync.
    pending_sync: bool,
    /// A round-trip is in progress; still set at the next operation means
    /// the previous operation's future was cancelled mid-protocol.
    in_flight: bool,
    stmt_counter: u64,
    closed: bool,
    kill: Arc<AtomicBool>,
}

impl Connection {
    fn new(codec: Codec, delegate: Option<Arc<dyn ConnectionDelegate>>) -> Self {
        Connection {
            id: Uuid::new_v4().to_string(),
            codec,
            delegate,
            parameters: HashMap::new(),
            backend_key: None,
            tx_status: TransactionStatus::Idle,
            open_statement: None,
            pending_sync: false,
            in_flight: false,
            stmt_counter: 0,
            closed: false,
            kill: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The unique id of this connection.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether this connection has been closed, locally or by force.
    pub fn is_closed(&self) -> bool {
        self.closed || self.kill.load(Ordering::Acquire)
    }

    /// The transaction status reported by the latest ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.tx_status
    }

    /// A server run-time parameter, as last reported by ParameterStatus.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(|v| v.as_str())
    }

    /// The backend process id and cancellation secret, if reported.
    pub fn backend_key(&self) -> Option<BackendKey> {
        self.backend_key
    }

    /// Replaces the delegate receiving out-of-band events.
    pub fn set_delegate(&mut self, delegate: Option<Arc<dyn ConnectionDelegate>>) {
        self.delegate = delegate;
    }

    /// Shared latch through which the pool force-closes an allocated
    /// connection it no longer trusts.
    pub(crate) fn kill_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.kill)
    }

    /// Prepares `text` as a server-side statement and describes its result
    /// columns.
    ///
    /// Any previously open statement is closed first; any previously open
    /// cursor has its portal drained.
    pub async fn prepare(&mut self, text: &str) -> Result<Statement> {
        self.ensure_ready().await?;

        let superseded = self.open_statement.take();
        if let Some(name) = &superseded {
            self.codec.put_close_statement(name);
        }

        self.in_flight = true;
        let result = self.do_prepare(text, superseded.is_some()).await;
        self.in_flight = false;
        result
    }

    async fn do_prepare(&mut self, text: &str, closed_previous: bool) -> Result<Statement> {
        self.stmt_counter += 1;
        let name = format!("s{}", self.stmt_counter);

        self.codec
            .put_parse(&name, text)
            .put_describe_statement(&name)
            .put_sync();
        self.codec.flush().await.map_err(|e| self.fatal_io(e))?;

        let mut expect_close_complete = closed_previous;
        let frame = loop {
            let frame = self.next_relevant_frame().await?;
            match frame.code {
                backend::MessageCode::CLOSE_COMPLETE if expect_close_complete => {
                    expect_close_complete = false;
                }
                _ => break frame,
            }
        };

        match frame.code {
            backend::MessageCode::PARSE_COMPLETE => {}
            backend::MessageCode::ERROR_RESPONSE => {
                let err = ServerError::new(frame.body);
                self.read_until_ready().await?;
                return Err(Error::Sql(err));
            }
            code => return Err(self.fatal_protocol(code)),
        }

        let frame = self.next_relevant_frame().await?;
        match frame.code {
            backend::MessageCode::PARAMETER_DESCRIPTION => {
                let mut body = frame.body;
                self.check_parse(backend::parse_parameter_description(&mut body))?;
            }
            code => return Err(self.fatal_protocol(code)),
        }

        let frame = self.next_relevant_frame().await?;
        let columns = match frame.code {
            backend::MessageCode::ROW_DESCRIPTION => {
                let mut body = frame.body;
                self.check_parse(backend::parse_row_description(&mut body))?
            }
            backend::MessageCode::NO_DATA => Vec::new(),
            code => return Err(self.fatal_protocol(code)),
        };

        if let Some(err) = self.read_until_ready().await? {
            return Err(Error::Sql(err));
        }

        self.open_statement = Some(name.clone());
        trace!(id = %self.id, statement = %name, "prepared statement");
        Ok(Statement::new(name, text.to_string(), columns))
    }

    /// Binds `params` to a prepared statement, executes it, and returns a
    /// lazy cursor over the result rows.
    ///
    /// Parameters are sent in text format; results are requested in text
    /// format. The Sync closing the exchange is deferred until the cursor
    /// is exhausted or closed.
    pub async fn query<'a>(
        &'a mut self,
        statement: &Statement,
        params: &[&(dyn ToSqlText + Sync)],
    ) -> Result<Cursor<'a>> {
        self.ensure_ready().await?;
        if statement.is_closed() || self.open_statement.as_deref() != Some(statement.name()) {
            return Err(Error::StatementClosed);
        }

        let values: Vec<Option<String>> = params.iter().map(|p| p.to_sql_text()).collect();

        self.in_flight = true;
        let result = self.do_execute(statement.name(), &values).await;
        self.in_flight = false;
        result?;
        Ok(Cursor::new(self))
    }

    async fn do_execute(&mut self, stmt_name: &str, values: &[Option<String>]) -> Result<()> {
        self.codec
            .put_bind("", stmt_name, values)
            .put_execute("", 0)
            .put_flush();
        self.codec.flush().await.map_err(|e| self.fatal_io(e))?;

        let frame = self.next_relevant_frame().await?;
        match frame.code {
            backend::MessageCode::BIND_COMPLETE => {
                self.pending_sync = true;
                Ok(())
            }
            backend::MessageCode::ERROR_RESPONSE => {
                let err = ServerError::new(frame.body);
                self.sync_to_ready().await?;
                Err(Error::Sql(err))
            }
            code => Err(self.fatal_protocol(code)),
        }
    }

    /// Executes a prepared statement to completion and returns the
    /// affected-row count reported by the server.
    pub async fn execute(
        &mut self,
        statement: &Statement,
        params: &[&(dyn ToSqlText + Sync)],
    ) -> Result<u64> {
        let mut cursor = self.query(statement, params).await?;
        while let Some(row) = cursor.next().await {
            row?;
        }
        Ok(cursor.row_count().unwrap_or(0))
    }

    /// Closes a prepared statement on the server.
    ///
    /// Closing an already-closed or superseded statement is a no-op.
    pub async fn close_statement(&mut self, statement: &mut Statement) -> Result<()> {
        if statement.is_closed() {
            return Ok(());
        }
        statement.mark_closed();

        if self.is_closed() || self.open_statement.as_deref() != Some(statement.name()) {
            return Ok(());
        }
        self.ensure_ready().await?;
        self.open_statement = None;

        self.in_flight = true;
        let result = self.do_close_statement(statement.name()).await;
        self.in_flight = false;
        result
    }

    async fn do_close_statement(&mut self, name: &str) -> Result<()> {
        self.codec.put_close_statement(name).put_sync();
        self.codec.flush().await.map_err(|e| self.fatal_io(e))?;

        let frame = self.next_relevant_frame().await?;
        match frame.code {
            backend::MessageCode::CLOSE_COMPLETE => {
                self.read_until_ready().await?;
                Ok(())
            }
            backend::MessageCode::ERROR_RESPONSE => {
                let err = ServerError::new(frame.body);
                self.read_until_ready().await?;
                Err(Error::Sql(err))
            }
            code => Err(self.fatal_protocol(code)),
        }
    }

    /// Opens an explicit transaction with `BEGIN`.
    pub async fn begin_transaction(&mut self) -> Result<()> {
        self.simple_query("BEGIN").await
    }

    /// Commits the open transaction.
    pub async fn commit_transaction(&mut self) -> Result<()> {
        self.ensure_ready().await?;
        if self.tx_status == TransactionStatus::Idle {
            return Err(Error::NotInTransaction);
        }
        self.simple_query("COMMIT").await
    }

    /// Rolls back the open transaction.
    pub async fn rollback_transaction(&mut self) -> Result<()> {
        self.ensure_ready().await?;
        if self.tx_status == TransactionStatus::Idle {
            return Err(Error::NotInTransaction);
        }
        self.simple_query("ROLLBACK").await
    }

    /// Runs a single simple-protocol statement, discarding any rows.
    async fn simple_query(&mut self, sql: &str) -> Result<()> {
        self.ensure_ready().await?;

        self.in_flight = true;
        let result = self.do_simple_query(sql).await;
        self.in_flight = false;
        result
    }

    async fn do_simple_query(&mut self, sql: &str) -> Result<()> {
        self.codec.put_query(sql);
        self.codec.flush().await.map_err(|e| self.fatal_io(e))?;

        match self.read_until_ready().await? {
            Some(err) => Err(Error::Sql(err)),
            None => Ok(()),
        }
    }

    /// Closes the connection, sending Terminate and draining the channel.
    /// Idempotent. An open transaction is discarded by the server.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        debug!(id = %self.id, "closing connection");
        self.codec.put_terminate();
        if self.codec.flush().await.is_ok() {
            self.codec.drain().await;
        }
        self.finish_close();
    }

    /// Closes the transport without sending Terminate. Idempotent.
    pub fn close_abruptly(&mut self) {
        if self.closed {
            return;
        }
        debug!(id = %self.id, "closing connection abruptly");
        self.finish_close();
    }

    fn finish_close(&mut self) {
        self.codec.close();
        self.closed = true;
        self.open_statement = None;
        self.pending_sync = false;
        self.in_flight = false;
    }

    /// Verifies the connection is usable and quiesced before a new
    /// operation.
    async fn ensure_ready(&mut self) -> Result<()> {
        self.check_open()?;
        if self.in_flight {
            warn!(id = %self.id, "previous operation cancelled mid-protocol");
            self.finish_close();
            return Err(Error::ConnectionClosed);
        }
        if self.pending_sync {
            self.drain_portal().await?;
        }
        Ok(())
    }

    fn check_open(&mut self) -> Result<()> {
        if self.kill.load(Ordering::Acquire) && !self.closed {
            debug!(id = %self.id, "connection was force-closed");
            self.finish_close();
        }
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    /// Whether the connection still owes the server a Sync for an
    /// interrupted portal.
    pub(crate) fn has_pending_sync(&self) -> bool {
        self.pending_sync
    }

    /// Consumes the remainder of an executing portal, then Syncs back to
    /// ready.
    pub(crate) async fn drain_portal(&mut self) -> Result<()> {
        loop {
            let frame = self.next_relevant_frame().await?;
            match frame.code {
                backend::MessageCode::DATA_ROW => {}
                backend::MessageCode::COMMAND_COMPLETE
                | backend::MessageCode::EMPTY_QUERY_RESPONSE
                | backend::MessageCode::PORTAL_SUSPENDED
                | backend::MessageCode::ERROR_RESPONSE => break,
                code => return Err(self.fatal_protocol(code)),
            }
        }
        self.sync_to_ready().await
    }

    /// Sends Sync and absorbs messages up to ReadyForQuery.
    pub(crate) async fn sync_to_ready(&mut self) -> Result<()> {
        self.codec.put_sync();
        self.codec.flush().await.map_err(|e| self.fatal_io(e))?;
        self.read_until_ready().await?;
        Ok(())
    }

    /// Absorbs messages up to the next ReadyForQuery, returning the first
    /// ErrorResponse seen along the way, if any.
    pub(crate) async fn read_until_ready(&mut self) -> Result<Option<ServerError>> {
        let mut sql_error = None;
        loop {
            let frame = self.next_relevant_frame().await?;
            match frame.code {
                backend::MessageCode::READY_FOR_QUERY => {
                    let mut body = frame.body;
                    self.tx_status = self.check_parse(backend::parse_ready_for_query(&mut body))?;
                    self.pending_sync = false;
                    return Ok(sql_error);
                }
                backend::MessageCode::ERROR_RESPONSE => {
                    if sql_error.is_none() {
                        sql_error = Some(ServerError::new(frame.body));
                    }
                }
                _ => {}
            }
        }
    }

    /// Reads the next frame, transparently absorbing parameter statuses,
    /// notices, notifications and backend key data.
    pub(crate) async fn next_relevant_frame(&mut self) -> Result<Frame> {
        loop {
            let frame = match self.codec.read_frame().await {
                Ok(frame) => frame,
                Err(err) => return Err(self.fatal_io(err)),
            };
            match frame.code {
                backend::MessageCode::PARAMETER_STATUS => {
                    let mut body = frame.body;
                    let (name, value) =
                        self.check_parse(backend::parse_parameter_status(&mut body))?;
                    if let Some(delegate) = &self.delegate {
                        delegate.parameter_status_changed(&name, &value);
                    }
                    self.parameters.insert(name, value);
                }
                backend::MessageCode::NOTICE_RESPONSE => {
                    let notice = ServerError::new(frame.body);
                    trace!(id = %self.id, %notice, "notice received");
                    if let Some(delegate) = &self.delegate {
                        delegate.notice_received(&notice);
                    }
                }
                backend::MessageCode::NOTIFICATION_RESPONSE => {
                    // LISTEN/NOTIFY is not surfaced; drop it.
                }
                backend::MessageCode::BACKEND_KEY_DATA => {
                    let mut body = frame.body;
                    self.backend_key =
                        Some(self.check_parse(backend::parse_backend_key_data(&mut body))?);
                }
                _ => return Ok(frame),
            }
        }
    }

    /// Marks a byte-level parse failure fatal.
    fn check_parse<T>(&mut self, result: io::Result<T>) -> Result<T> {
        result.map_err(|err| {
            error!(id = %self.id, %err, "malformed backend message");
            self.finish_close();
            Error::ConnectionClosed
        })
    }

    /// A transport failure: latch it, close, and report.
    fn fatal_io(&mut self, err: io::Error) -> Error {
        error!(id = %self.id, %err, "fatal connection error");
        self.finish_close();
        Error::Socket(err)
    }

    /// A protocol desynchronization: close and report.
    pub(crate) fn fatal_protocol(&mut self, code: backend::MessageCode) -> Error {
        error!(id = %self.id, %code, "unexpected message for connection state");
        self.finish_close();
        Error::ConnectionClosed
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("transaction_status", &self.tx_status)
            .finish_non_exhaustive()
    }
}
