//! Prepared statements, result rows, and lazy cursors.

use tracing::trace;

use crate::connection::Connection;
use crate::error::{Error, Result, ServerError};
use crate::messages::backend::{self, ColumnMetadata};

/// Encodes a value into Postgres text format; `None` encodes SQL NULL.
///
/// This is the seam for value encoding: the connection itself never
/// interprets parameter values beyond passing their text form through.
pub trait ToSqlText {
    fn to_sql_text(&self) -> Option<String>;
}

impl ToSqlText for str {
    fn to_sql_text(&self) -> Option<String> {
        Some(self.to_string())
    }
}

impl ToSqlText for &str {
    fn to_sql_text(&self) -> Option<String> {
        Some(self.to_string())
    }
}

impl ToSqlText for String {
    fn to_sql_text(&self) -> Option<String> {
        Some(self.clone())
    }
}

impl ToSqlText for bool {
    fn to_sql_text(&self) -> Option<String> {
        Some(if *self { "true" } else { "false" }.to_string())
    }
}

macro_rules! to_sql_text_via_display {
    ($($ty:ty),*) => {
        $(
            impl ToSqlText for $ty {
                fn to_sql_text(&self) -> Option<String> {
                    Some(self.to_string())
                }
            }
        )*
    };
}

to_sql_text_via_display!(i16, i32, i64, u32, f32, f64);

impl<T: ToSqlText> ToSqlText for Option<T> {
    fn to_sql_text(&self) -> Option<String> {
        self.as_ref().and_then(|v| v.to_sql_text())
    }
}

/// A server-side prepared statement.
///
/// A statement is a plain handle: it names the server-side entry and
/// carries the column metadata from Describe. Its lifetime is bounded by
/// its connection; preparing another statement on the same connection
/// closes this one on the server.
#[derive(Debug, Clone)]
pub struct Statement {
    name: String,
    text: String,
    columns: Vec<ColumnMetadata>,
    closed: bool,
}

impl Statement {
    pub(crate) fn new(name: String, text: String, columns: Vec<ColumnMetadata>) -> Self {
        Statement {
            name,
            text,
            columns,
            closed: false,
        }
    }

    /// The server-side statement name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The SQL text this statement was prepared from.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Metadata for the columns the statement produces; empty when it
    /// returns no rows.
    pub fn columns(&self) -> &[ColumnMetadata] {
        &self.columns
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }
}

/// One result row, with every value in text format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    values: Vec<Option<String>>,
}

impl Row {
    pub(crate) fn new(values: Vec<Option<String>>) -> Self {
        Row { values }
    }

    /// Number of columns in the row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The text value of column `index`; `None` for SQL NULL or an
    /// out-of-range index.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.values.get(index).and_then(|v| v.as_deref())
    }

    /// Whether column `index` is SQL NULL.
    pub fn is_null(&self, index: usize) -> bool {
        matches!(self.values.get(index), Some(None))
    }

    /// Parses the text value of column `index` into `T`.
    pub fn parse<T>(&self, index: usize) -> Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(value) = self.get(index) else {
            return Err(Error::ValueConversion(format!(
                "column {index} is null or out of range"
            )));
        };
        value
            .parse()
            .map_err(|err| Error::ValueConversion(format!("column {index}: {err}")))
    }

    /// All values of the row, in column order.
    pub fn values(&self) -> &[Option<String>] {
        &self.values
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    /// The portal is executing; rows may still arrive.
    Streaming,
    /// The result set completed (or failed); nothing more to read.
    Finished,
    /// `close` was called.
    Closed,
}

/// A lazy, forward-only, non-restartable iterator over the rows of one
/// statement execution.
///
/// The cursor mutably borrows its connection, so no other operation can
/// interleave with row streaming. Dropping a cursor without closing it
/// leaves the remaining rows on the wire; the next connection operation
/// drains and discards them.
pub struct Cursor<'a> {
    conn: &'a mut Connection,
    state: CursorState,
    rows_retrieved: u64,
    row_count: Option<u64>,
}

impl<'a> std::fmt::Debug for Cursor<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("state", &self.state)
            .field("rows_retrieved", &self.rows_retrieved)
            .field("row_count", &self.row_count)
            .finish()
    }
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(conn: &'a mut Connection) -> Self {
        Cursor {
            conn,
            state: CursorState::Streaming,
            rows_retrieved: 0,
            row_count: None,
        }
    }

    /// Returns the next row, `None` once the result set is exhausted.
    ///
    /// A server error ends the result set and is surfaced exactly once;
    /// subsequent calls return `None`.
    pub async fn next(&mut self) -> Option<Result<Row>> {
        if self.state != CursorState::Streaming {
            return None;
        }

        loop {
            let frame = match self.conn.next_relevant_frame().await {
                Ok(frame) => frame,
                Err(err) => {
                    self.state = CursorState::Finished;
                    return Some(Err(err));
                }
            };

            match frame.code {
                backend::MessageCode::DATA_ROW => {
                    let mut body = frame.body;
                    let raw = match backend::parse_data_row(&mut body) {
                        Ok(raw) => raw,
                        Err(_) => {
                            self.state = CursorState::Finished;
                            return Some(Err(self
                                .conn
                                .fatal_protocol(backend::MessageCode::DATA_ROW)));
                        }
                    };

                    let mut values = Vec::with_capacity(raw.len());
                    for (index, value) in raw.into_iter().enumerate() {
                        match value {
                            None => values.push(None),
                            Some(bytes) => match String::from_utf8(bytes.to_vec()) {
                                Ok(text) => values.push(Some(text)),
                                Err(err) => {
                                    // The row is consumed; the cursor keeps
                                    // streaming.
                                    self.rows_retrieved += 1;
                                    return Some(Err(Error::ValueConversion(format!(
                                        "column {index}: {err}"
                                    ))));
                                }
                            },
                        }
                    }
                    self.rows_retrieved += 1;
                    return Some(Ok(Row::new(values)));
                }
                backend::MessageCode::COMMAND_COMPLETE => {
                    let mut body = frame.body;
                    if let Ok((tag, rows)) = backend::parse_command_complete(&mut body) {
                        trace!(%tag, "command complete");
                        self.row_count = rows;
                    }
                    return self.finish().await;
                }
                backend::MessageCode::EMPTY_QUERY_RESPONSE
                | backend::MessageCode::PORTAL_SUSPENDED => {
                    return self.finish().await;
                }
                backend::MessageCode::ERROR_RESPONSE => {
                    let err = ServerError::new(frame.body);
                    self.state = CursorState::Finished;
                    if let Err(sync_err) = self.conn.sync_to_ready().await {
                        return Some(Err(sync_err));
                    }
                    return Some(Err(Error::Sql(err)));
                }
                code => {
                    self.state = CursorState::Finished;
                    return Some(Err(self.conn.fatal_protocol(code)));
                }
            }
        }
    }

    /// Sends the deferred Sync and restores the connection to ready.
    async fn finish(&mut self) -> Option<Result<Row>> {
        self.state = CursorState::Finished;
        if let Err(err) = self.conn.sync_to_ready().await {
            return Some(Err(err));
        }
        None
    }

    /// Closes the cursor, discarding any unread rows and restoring the
    /// connection to ready. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        match self.state {
            CursorState::Closed => Ok(()),
            CursorState::Finished => {
                self.state = CursorState::Closed;
                Ok(())
            }
            CursorState::Streaming => {
                self.state = CursorState::Closed;
                if self.conn.has_pending_sync() {
                    self.conn.drain_portal().await
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Rows retrieved through this cursor so far.
    pub fn rows_retrieved(&self) -> u64 {
        self.rows_retrieved
    }

    /// The affected-row count from CommandComplete, once the result set has
    /// completed and when the command reports one.
    pub fn row_count(&self) -> Option<u64> {
        self.row_count
    }

    pub fn is_closed(&self) -> bool {
        self.state == CursorState::Closed
    }
}
