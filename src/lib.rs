//! pg_client.
//!
//! An async client for the Postgres frontend/backend protocol with prepared
//! statements, lazy row streaming, transaction tracking, and a FIFO
//! connection pool.
//!
//! # Overview
//!
//! The crate is organized around a few core concepts:
//!
//! - **Connection establishment** via [`ConnectionFactory`] with support for
//!   trust, cleartext, MD5 and SCRAM-SHA-256 authentication and TLS
//! - **Prepared statements** executed through [`Connection::prepare`] and
//!   [`Connection::query`], streaming rows through a [`Cursor`]
//! - **Connection pooling** via [`ConnectionPool`] with FIFO request
//!   ordering, capacity bounds, timeouts and periodic metrics
//!
//! # Example: Prepared Query
//!
//! ```no_run
//! use pg_client::{ConnectionConfig, ConnectionFactory, Credential, TcpChannelOpener};
//!
//! # async fn example() -> pg_client::Result<()> {
//! let config = ConnectionConfig::new("postgres")
//!     .database("mydb")
//!     .credential(Credential::ScramSha256("secret".into()));
//! let factory = ConnectionFactory::new(TcpChannelOpener::new("localhost", 5432), config);
//!
//! let mut conn = factory.connect().await?;
//! let stmt = conn.prepare("SELECT $1").await?;
//! let mut cursor = conn.query(&stmt, &[&123_i32]).await?;
//! while let Some(row) = cursor.next().await {
//!     let row = row?;
//!     println!("value: {:?}", row.get(0));
//! }
//! conn.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Example: Pooling
//!
//! ```no_run
//! use pg_client::{ConnectionConfig, ConnectionFactory, ConnectionPool, PoolConfig,
//!     TcpChannelOpener};
//!
//! # async fn example() -> pg_client::Result<()> {
//! let factory = ConnectionFactory::new(
//!     TcpChannelOpener::new("localhost", 5432),
//!     ConnectionConfig::new("postgres"),
//! );
//! let pool = ConnectionPool::new(factory, PoolConfig::default());
//!
//! let mut conn = pool.acquire().await?;
//! conn.begin_transaction().await?;
//! // ...
//! conn.commit_transaction().await?;
//! pool.release(conn).await;
//!
//! pool.close(false).await;
//! # Ok(())
//! # }
//! ```
//!
//! # Transactions
//!
//! [`Connection::begin_transaction`], [`Connection::commit_transaction`] and
//! [`Connection::rollback_transaction`] issue the corresponding simple-query
//! commands; the connection tracks the transaction status reported by every
//! ReadyForQuery. Committing or rolling back outside a transaction fails
//! with [`Error::NotInTransaction`].
//!
//! # TLS Support
//!
//! TLS is negotiated with the SSLRequest handshake when the factory is
//! given a [`TlsUpgrader`]; if the server declines, connecting fails with
//! [`Error::SslNotSupported`]. The upgrader is an async function from
//! transport to transport, so any TLS implementation can be plugged in.
//!
//! # Text Format
//!
//! Parameters are bound in Postgres text format through the [`ToSqlText`]
//! seam and results are requested in text format; [`Row::parse`] converts
//! values with `FromStr`.
//!
//! # Backpressure
//!
//! Inbound bytes buffer in a [`ByteChannel`] governed by a
//! [`Watermarks`] pair: transport reads pause above the high mark and
//! resume once the consumer drains the backlog to the low mark.
//!
//! # Safety and Error Handling
//!
//! - SQL errors ([`Error::Sql`]) recover to the next ReadyForQuery and
//!   leave the connection usable
//! - Socket errors and protocol desynchronization close the connection;
//!   later operations fail with [`Error::ConnectionClosed`]
//! - A connection is a sequential resource: the pool allocates it to one
//!   requestor at a time, and cursors borrow it exclusively

mod channel;
mod codec;
mod connection;
mod error;
pub mod messages;
mod pool;
mod scram;
mod statement;

pub use channel::{BoxedTransport, ByteChannel, Transport, Watermarks};
pub use connection::{
    ChannelOpener, Connection, ConnectionConfig, ConnectionDelegate, ConnectionFactory,
    Credential, TcpChannelOpener, TlsMode, TlsUpgrader,
};
pub use error::{Error, Result, ServerError};
pub use messages::backend::{BackendKey, ColumnMetadata, Notification, TransactionStatus};
pub use pool::{ConnectionPool, PoolConfig, PoolMetrics};
pub use statement::{Cursor, Row, Statement, ToSqlText};
