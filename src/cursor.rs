//! Cursors.
//!
//! An unnamed cursor buffers the whole result of its last query on the
//! client. A named cursor declares a server-side cursor (`DECLARE`) and
//! pulls rows in pages of [`Cursor::itersize`] rows.
//!
//! Cursors do not borrow their connection. Every operation takes the
//! connection (or anything implementing [`AsConnection`]) as an argument and
//! checks that it is the one the cursor was created by.

use std::sync::Arc;

use tracing::debug;

use crate::conn::{AsConnection, Connection};
use crate::error::{Error, Result, SQLSTATE_INVALID_CURSOR_NAME};
use crate::handler::{QueryResult, ResultSlot, lock_slot};
use crate::protocol::types::TransactionStatus;
use crate::row::{Column, Row};
use crate::transport::Transport;
use crate::value::{ToParams, bind_params, quote_ident, quote_literal};

/// How [`Cursor::scroll`] interprets its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScrollMode {
    /// Move relative to the current position
    #[default]
    Relative,
    /// Move to a 0-based row offset
    Absolute,
}

/// Cursor configuration.
///
/// ```
/// use pgcursor::CursorConfig;
///
/// let config = CursorConfig::named("big_scan").withhold(true).scrollable(false);
/// assert_eq!(config.name.as_deref(), Some("big_scan"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorConfig {
    /// Server-side cursor name. `None` for an unnamed cursor.
    pub name: Option<String>,
    /// Keep the server-side cursor open after the transaction commits.
    pub withhold: bool,
    /// `Some(true)` declares `SCROLL`, `Some(false)` declares `NO SCROLL`,
    /// `None` leaves the server default.
    pub scrollable: Option<bool>,
}

impl CursorConfig {
    /// Configuration of a named cursor.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Set `withhold`.
    pub fn withhold(mut self, withhold: bool) -> Self {
        self.withhold = withhold;
        self
    }

    /// Set `scrollable`.
    pub fn scrollable(mut self, scrollable: bool) -> Self {
        self.scrollable = Some(scrollable);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Uninitialized,
    /// An asynchronous query of this cursor was dispatched
    Pending,
    /// DECLARE succeeded, nothing fetched yet
    Declared,
    HasResult,
}

/// Database cursor.
#[derive(Debug)]
pub struct Cursor {
    conn_id: u64,
    config: CursorConfig,
    itersize: usize,
    state: CursorState,
    /// Whether this handle issued the DECLARE
    declared: bool,
    /// Transaction mark of the connection at DECLARE time
    mark: u64,
    columns: Option<Arc<[Column]>>,
    rows: Vec<Row>,
    pos: usize,
    /// The server cursor ran past its last row while filling `rows`
    at_end: bool,
    rowcount: i64,
    statusmessage: Option<String>,
    query: Option<String>,
    closed: bool,
    /// Receives the result of an asynchronous query
    result: ResultSlot,
}

impl Cursor {
    pub(crate) fn new(conn_id: u64, config: CursorConfig, itersize: usize) -> Self {
        Self {
            conn_id,
            config,
            itersize,
            state: CursorState::Uninitialized,
            declared: false,
            mark: 0,
            columns: None,
            rows: Vec::new(),
            pos: 0,
            at_end: false,
            rowcount: -1,
            statusmessage: None,
            query: None,
            closed: false,
            result: ResultSlot::default(),
        }
    }

    /// Server-side cursor name.
    pub fn name(&self) -> Option<&str> {
        self.config.name.as_deref()
    }

    /// Whether the cursor survives the end of its transaction.
    pub fn withhold(&self) -> bool {
        self.config.withhold
    }

    /// Requested scroll behaviour.
    pub fn scrollable(&self) -> Option<bool> {
        self.config.scrollable
    }

    /// Rows a named cursor fetches per round trip.
    pub fn itersize(&self) -> usize {
        self.itersize
    }

    /// Columns of the current result, if it has any.
    pub fn description(&self) -> Option<&[Column]> {
        self.columns.as_deref()
    }

    /// Rows in the current result (or page, for a named cursor), or rows
    /// affected by the last statement. `-1` when unknown.
    pub fn rowcount(&self) -> i64 {
        self.rowcount
    }

    /// Position within the buffered rows. For a named cursor this restarts
    /// at every page.
    pub fn rownumber(&self) -> usize {
        self.pos
    }

    /// Command tag of the last statement, e.g. `SELECT 3`.
    pub fn statusmessage(&self) -> Option<&str> {
        self.statusmessage.as_deref()
    }

    /// Text of the last executed query, parameters included.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Whether [`close`](Self::close) was called.
    pub fn closed(&self) -> bool {
        self.closed
    }

    /// Change the page size of a named cursor. Values below 1 become 1.
    pub fn set_itersize(&mut self, itersize: usize) {
        self.itersize = itersize.max(1);
    }

    /// Change `withhold` before the first execute.
    pub fn set_withhold(&mut self, withhold: bool) -> Result<()> {
        if withhold && self.config.name.is_none() {
            return Err(Error::usage("trying to set .withhold on unnamed cursor"));
        }
        self.check_not_declared("withhold")?;
        self.config.withhold = withhold;
        Ok(())
    }

    /// Change `scrollable` before the first execute.
    pub fn set_scrollable(&mut self, scrollable: Option<bool>) -> Result<()> {
        if scrollable.is_some() && self.config.name.is_none() {
            return Err(Error::usage("trying to set .scrollable on unnamed cursor"));
        }
        self.check_not_declared("scrollable")?;
        self.config.scrollable = scrollable;
        Ok(())
    }

    /// Query text `execute` would send for `sql` and `params`.
    pub fn mogrify<P: ToParams>(&self, sql: &str, params: P) -> Result<String> {
        bind_params(sql, &params).map(|sql| sql.into_owned())
    }

    /// Execute a query.
    ///
    /// `$1`, `$2`, ... in `sql` are replaced by the quoted `params`.
    ///
    /// An unnamed cursor on a synchronous connection buffers the result
    /// before returning. On an asynchronous connection the query is only
    /// sent; the result is available once `poll()` returned `Ok`.
    ///
    /// A named cursor declares the server-side cursor, opening a transaction
    /// first unless the connection autocommits and the cursor is withhold.
    pub fn execute<C, P>(&mut self, conn: &mut C, sql: &str, params: P) -> Result<()>
    where
        C: AsConnection + ?Sized,
        P: ToParams,
    {
        let conn = conn.connection_mut();
        self.check_usable(conn)?;
        let sql = bind_params(sql, &params)?;
        match self.config.name.clone() {
            None => self.execute_unnamed(conn, &sql),
            Some(name) => self.declare(conn, &name, &sql),
        }
    }

    /// Execute a query once per parameter set.
    ///
    /// Results are discarded; [`rowcount`](Self::rowcount) is the total of
    /// affected rows, or `-1` if any statement did not report one.
    pub fn executemany<C, I>(&mut self, conn: &mut C, sql: &str, params: I) -> Result<()>
    where
        C: AsConnection + ?Sized,
        I: IntoIterator,
        I::Item: ToParams,
    {
        let conn = conn.connection_mut();
        self.check_usable(conn)?;
        if self.config.name.is_some() {
            return Err(Error::usage("can't call .executemany() on named cursors"));
        }
        if conn.is_async() {
            return Err(Error::usage(
                "executemany cannot be used in asynchronous mode",
            ));
        }

        let mut total: i64 = 0;
        for p in params {
            self.execute(&mut *conn, sql, p)?;
            total = if total < 0 || self.rowcount < 0 {
                -1
            } else {
                total + self.rowcount
            };
        }
        self.columns = None;
        self.rows.clear();
        self.pos = 0;
        self.rowcount = total;
        Ok(())
    }

    /// Fetch the next row.
    pub fn fetchone<C: AsConnection + ?Sized>(&mut self, conn: &mut C) -> Result<Option<Row>> {
        let conn = conn.connection_mut();
        self.check_usable(conn)?;
        match self.config.name.clone() {
            None => self.check_result(conn)?,
            Some(name) => {
                self.check_named(conn)?;
                if self.pos >= self.rows.len() {
                    self.fetch_page(conn, &name, Some(self.itersize))?;
                }
            }
        }
        let row = self.rows.get(self.pos).cloned();
        if row.is_some() {
            self.pos += 1;
        }
        Ok(row)
    }

    /// Fetch up to `size` rows.
    pub fn fetchmany<C: AsConnection + ?Sized>(
        &mut self,
        conn: &mut C,
        size: usize,
    ) -> Result<Vec<Row>> {
        let conn = conn.connection_mut();
        self.check_usable(conn)?;
        match self.config.name.clone() {
            None => {
                self.check_result(conn)?;
                Ok(self.take_local(size))
            }
            Some(name) => {
                self.check_named(conn)?;
                let mut rows = self.take_local(size);
                if rows.len() < size {
                    self.fetch_page(conn, &name, Some(size - rows.len()))?;
                    rows.extend(self.take_local(usize::MAX));
                }
                Ok(rows)
            }
        }
    }

    /// Fetch every remaining row.
    pub fn fetchall<C: AsConnection + ?Sized>(&mut self, conn: &mut C) -> Result<Vec<Row>> {
        let conn = conn.connection_mut();
        self.check_usable(conn)?;
        match self.config.name.clone() {
            None => {
                self.check_result(conn)?;
                Ok(self.take_local(usize::MAX))
            }
            Some(name) => {
                self.check_named(conn)?;
                let mut rows = self.take_local(usize::MAX);
                self.fetch_page(conn, &name, None)?;
                rows.extend(self.take_local(usize::MAX));
                Ok(rows)
            }
        }
    }

    /// Iterate over the remaining rows.
    ///
    /// A named cursor fetches [`itersize`](Self::itersize) rows per round
    /// trip. The iterator stops after the first error.
    pub fn iter<'a, C: AsConnection + ?Sized>(&'a mut self, conn: &'a mut C) -> Rows<'a, C> {
        Rows {
            cursor: self,
            conn,
            done: false,
        }
    }

    /// Move the cursor.
    ///
    /// An unnamed cursor moves within its buffered result and fails with
    /// [`Error::OutOfRange`] if the destination is outside it. A named
    /// cursor sends `MOVE`; moving backward on a `NO SCROLL` cursor fails on
    /// the server.
    pub fn scroll<C: AsConnection + ?Sized>(
        &mut self,
        conn: &mut C,
        value: i64,
        mode: ScrollMode,
    ) -> Result<()> {
        let conn = conn.connection_mut();
        self.check_usable(conn)?;
        match self.config.name.clone() {
            None => {
                self.check_result(conn)?;
                let pos = i64::try_from(self.pos).unwrap_or(i64::MAX);
                let newpos = match mode {
                    ScrollMode::Relative => pos.saturating_add(value),
                    ScrollMode::Absolute => value,
                };
                match usize::try_from(newpos) {
                    Ok(newpos) if newpos < self.rows.len() => {
                        self.pos = newpos;
                        Ok(())
                    }
                    _ => Err(Error::OutOfRange("scroll destination out of bounds".into())),
                }
            }
            Some(name) => {
                self.check_named(conn)?;
                self.move_named(conn, &name, value, mode)
            }
        }
    }

    /// Close the cursor.
    ///
    /// A named cursor closes its server-side cursor, unless the cursor is
    /// already gone with its transaction. Closing a handle that never
    /// executed closes a cursor of the same name declared elsewhere, if one
    /// exists. Closing twice is a no-op.
    pub fn close<C: AsConnection + ?Sized>(&mut self, conn: &mut C) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let conn = conn.connection_mut();
        self.check_connection(conn)?;
        if let Some(name) = self.config.name.clone()
            && !conn.is_closed()
        {
            conn.check_not_executing("close")?;
            self.close_server_cursor(conn, &name)?;
        }
        // A query still in flight delivers into the old slot and is dropped.
        self.result = ResultSlot::default();
        self.closed = true;
        self.columns = None;
        self.rows.clear();
        self.pos = 0;
        debug!(conn_id = self.conn_id, cursor = ?self.config.name, "cursor closed");
        Ok(())
    }

    // === Checks ===

    fn check_connection<T: Transport>(&self, conn: &Connection<T>) -> Result<()> {
        if conn.connection_id() != self.conn_id {
            return Err(Error::usage(format!(
                "connection mismatch: expected {}, got {}",
                self.conn_id,
                conn.connection_id()
            )));
        }
        Ok(())
    }

    fn check_usable<T: Transport>(&self, conn: &Connection<T>) -> Result<()> {
        self.check_connection(conn)?;
        if self.closed {
            return Err(Error::usage("cursor already closed"));
        }
        conn.check_open()
    }

    fn check_not_declared(&self, what: &str) -> Result<()> {
        if self.query.is_some() {
            return Err(Error::usage(format!(
                "can't change .{} after the cursor was executed",
                what
            )));
        }
        Ok(())
    }

    /// Make sure an unnamed cursor has a result with rows to read, claiming
    /// the result of a finished asynchronous query.
    fn check_result<T: Transport>(&mut self, conn: &mut Connection<T>) -> Result<()> {
        if self.state == CursorState::Pending {
            conn.check_not_executing("fetch")?;
            let delivered = lock_slot(&self.result).take();
            match delivered {
                Some(result) => self.install(result),
                None => self.state = CursorState::Uninitialized,
            }
        } else {
            conn.check_not_executing("fetch")?;
        }
        if self.state != CursorState::HasResult || self.columns.is_none() {
            return Err(Error::usage("no results to fetch"));
        }
        Ok(())
    }

    fn check_named<T: Transport>(&self, conn: &Connection<T>) -> Result<()> {
        conn.check_not_executing("fetch")?;
        if self.declared && !self.config.withhold && self.mark != conn.mark() {
            return Err(Error::usage("named cursor isn't valid anymore"));
        }
        Ok(())
    }

    // === Unnamed cursor ===

    fn execute_unnamed<T: Transport>(&mut self, conn: &mut Connection<T>, sql: &str) -> Result<()> {
        conn.check_not_executing("execute")?;
        self.columns = None;
        self.rows.clear();
        self.pos = 0;
        self.rowcount = -1;
        self.statusmessage = None;
        self.state = CursorState::Uninitialized;
        self.query = Some(sql.to_string());

        match conn.execute_for(&self.result, sql)? {
            Some(result) => self.install(result),
            None => self.state = CursorState::Pending,
        }
        Ok(())
    }

    fn install(&mut self, result: QueryResult) {
        self.rowcount = match (&result.columns, result.rows_affected) {
            (Some(_), _) => i64::try_from(result.rows.len()).unwrap_or(i64::MAX),
            (None, Some(n)) => i64::try_from(n).unwrap_or(i64::MAX),
            (None, None) => -1,
        };
        self.columns = result.columns;
        self.rows = result.rows;
        self.pos = 0;
        self.statusmessage = result.command_tag;
        self.state = CursorState::HasResult;
    }

    fn take_local(&mut self, limit: usize) -> Vec<Row> {
        let end = self.pos.saturating_add(limit).min(self.rows.len());
        let rows = self.rows.get(self.pos..end).map(<[Row]>::to_vec).unwrap_or_default();
        self.pos = end.max(self.pos);
        rows
    }

    // === Named cursor ===

    fn declare<T: Transport>(
        &mut self,
        conn: &mut Connection<T>,
        name: &str,
        sql: &str,
    ) -> Result<()> {
        if self.query.is_some() {
            return Err(Error::usage(
                "can't call .execute() on named cursors more than once",
            ));
        }
        conn.check_not_executing("execute")?;
        if !(conn.autocommit() && self.config.withhold) {
            conn.begin_transaction()?;
        }

        let mut stmt = format!("DECLARE {} ", quote_ident(name));
        match self.config.scrollable {
            Some(true) => stmt.push_str("SCROLL "),
            Some(false) => stmt.push_str("NO SCROLL "),
            None => {}
        }
        stmt.push_str(if self.config.withhold {
            "CURSOR WITH HOLD FOR "
        } else {
            "CURSOR WITHOUT HOLD FOR "
        });
        stmt.push_str(sql);

        self.query = Some(sql.to_string());
        debug!(conn_id = self.conn_id, cursor = name, withhold = self.config.withhold, "declare");
        let result = conn.run_query(&stmt)?;
        self.declared = true;
        self.mark = conn.mark();
        self.state = CursorState::Declared;
        self.statusmessage = result.command_tag;
        self.columns = None;
        self.rows.clear();
        self.pos = 0;
        self.at_end = false;
        self.rowcount = -1;
        Ok(())
    }

    /// Replace the local page with the next `count` rows (`None` for all).
    fn fetch_page<T: Transport>(
        &mut self,
        conn: &mut Connection<T>,
        name: &str,
        count: Option<usize>,
    ) -> Result<()> {
        let sql = match count {
            Some(n) => format!("FETCH FORWARD {} FROM {}", n, quote_ident(name)),
            None => format!("FETCH FORWARD ALL FROM {}", quote_ident(name)),
        };
        debug!(conn_id = self.conn_id, cursor = name, ?count, "fetch");
        let result = conn.run_query(&sql)?;
        self.at_end = count.is_none_or(|n| result.rows.len() < n);
        self.install(result);
        Ok(())
    }

    fn move_named<T: Transport>(
        &mut self,
        conn: &mut Connection<T>,
        name: &str,
        value: i64,
        mode: ScrollMode,
    ) -> Result<()> {
        let unread = self.rows.len().saturating_sub(self.pos);
        let sql = match mode {
            ScrollMode::Relative => {
                if let Ok(step) = usize::try_from(value)
                    && step <= unread
                {
                    self.pos += step;
                    return Ok(());
                }
                // The server sits after the local page, or past the last
                // row if the page hit the end.
                let behind = i64::try_from(unread).unwrap_or(i64::MAX) + i64::from(self.at_end);
                format!("MOVE RELATIVE {} IN {}", value.saturating_sub(behind), quote_ident(name))
            }
            ScrollMode::Absolute => {
                if value < 0 {
                    return Err(Error::OutOfRange("scroll destination out of bounds".into()));
                }
                format!("MOVE ABSOLUTE {} IN {}", value, quote_ident(name))
            }
        };
        debug!(conn_id = self.conn_id, cursor = name, value, ?mode, "move");
        let result = conn.run_query(&sql)?;
        self.rows.clear();
        self.pos = 0;
        self.at_end = false;
        self.statusmessage = result.command_tag;
        Ok(())
    }

    fn close_server_cursor<T: Transport>(
        &self,
        conn: &mut Connection<T>,
        name: &str,
    ) -> Result<()> {
        if conn.transaction_status() == TransactionStatus::InError {
            debug!(cursor = name, "transaction aborted, not closing cursor");
            return Ok(());
        }
        if self.declared && !self.config.withhold && self.mark != conn.mark() {
            // Ended together with its transaction.
            return Ok(());
        }
        if !self.declared {
            let mut sql = String::from("SELECT 1 FROM pg_catalog.pg_cursors WHERE name = ");
            quote_literal(name, &mut sql);
            if conn.run_query(&sql)?.rows.is_empty() {
                return Ok(());
            }
        }
        match conn.run_query(&format!("CLOSE {}", quote_ident(name))) {
            Err(e) if e.sqlstate() == Some(SQLSTATE_INVALID_CURSOR_NAME) => {
                debug!(cursor = name, "cursor already closed on the server");
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }
}

/// Iterator over the rows of a cursor. See [`Cursor::iter`].
pub struct Rows<'a, C: ?Sized> {
    cursor: &'a mut Cursor,
    conn: &'a mut C,
    done: bool,
}

impl<C: AsConnection + ?Sized> Iterator for Rows<'_, C> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.cursor.fetchone(&mut *self.conn) {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
