//! PostgreSQL connection.
//!
//! A [`Connection`] owns the transport and runs one operation at a time:
//! the startup handshake or a query. In [`Mode::Sync`] every call blocks
//! until the server answered. In [`Mode::Async`] the handshake and queries
//! started by a cursor return immediately and the caller advances them with
//! [`Connection::poll`], waiting on [`Connection::fileno`] whenever poll
//! asks for [`PollState::Read`] or [`PollState::Write`].
//!
//! ```no_run
//! use pgcursor::{Connection, wait_select};
//!
//! let mut conn = Connection::connect("postgres://postgres@localhost/postgres?async=1")?;
//! wait_select(&mut conn)?;
//!
//! let mut cur = conn.cursor()?;
//! cur.execute(&mut conn, "select 1", ())?;
//! assert!(conn.isexecuting());
//! wait_select(&mut conn)?;
//! let row = cur.fetchone(&mut conn)?.unwrap();
//! assert_eq!(row.get::<i32>(0)?, 1);
//! # Ok::<(), pgcursor::Error>(())
//! ```

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, trace, warn};

use crate::buffer_set::BufferSet;
use crate::cursor::{Cursor, CursorConfig};
use crate::error::{Error, ErrorFields, Result};
use crate::handler::{QueryResult, ResultCollector, ResultSlot, lock_slot};
use crate::lobject::{LargeObject, LoMode};
use crate::opts::{Mode, Opts};
use crate::protocol::backend::{ErrorResponse, RawMessage, msg_type};
use crate::protocol::frontend::write_terminate;
use crate::protocol::types::TransactionStatus;
use crate::state::{Action, AsyncMessage, SimpleQueryStateMachine, StartupStateMachine};
use crate::transport::{Flush, Stream, Transport, Wire};
use crate::value::quote_literal;
use crate::wait::wait_fd;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Number of server notices kept.
const MAX_NOTICES: usize = 50;

/// Result of one [`Connection::poll`] step.
///
/// Failures are reported as `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// The pending operation completed, or there was none.
    Ok,
    /// Wait until the socket is readable, then poll again.
    Read,
    /// Wait until the socket is writable, then poll again.
    Write,
}

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Asynchronous handshake still in progress
    Connecting,
    /// Connected, no transaction opened by the driver
    Ready,
    /// The driver issued BEGIN and the transaction is still open
    Begin,
    /// Closed by [`Connection::close`]
    ClosedNormally,
    /// The server or the network ended the connection
    ClosedAbnormally,
}

impl Status {
    /// Whether the connection is closed, normally or not.
    pub fn is_closed(self) -> bool {
        matches!(self, Status::ClosedNormally | Status::ClosedAbnormally)
    }
}

/// Transaction isolation level used for the BEGIN the driver issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Switch the connection to autocommit
    Autocommit,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
    /// Server default
    #[default]
    Default,
}

impl IsolationLevel {
    fn begin_statement(self) -> &'static str {
        match self {
            IsolationLevel::Autocommit | IsolationLevel::Default => "BEGIN",
            IsolationLevel::ReadUncommitted => "BEGIN ISOLATION LEVEL READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "BEGIN ISOLATION LEVEL READ COMMITTED",
            IsolationLevel::RepeatableRead => "BEGIN ISOLATION LEVEL REPEATABLE READ",
            IsolationLevel::Serializable => "BEGIN ISOLATION LEVEL SERIALIZABLE",
        }
    }
}

/// Notification received through LISTEN/NOTIFY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// PID of the notifying backend process
    pub pid: u32,
    /// Channel name
    pub channel: String,
    /// Notification payload
    pub payload: String,
}

/// Access to the [`Connection`] inside a user type.
///
/// [`connect_with`] builds such a type around a fresh connection, and
/// cursors accept anything implementing it.
pub trait AsConnection {
    /// Transport of the wrapped connection.
    type Transport: Transport;

    /// Borrow the connection.
    fn connection(&self) -> &Connection<Self::Transport>;

    /// Mutably borrow the connection.
    fn connection_mut(&mut self) -> &mut Connection<Self::Transport>;
}

impl<T: Transport> AsConnection for Connection<T> {
    type Transport = T;

    fn connection(&self) -> &Connection<T> {
        self
    }

    fn connection_mut(&mut self) -> &mut Connection<T> {
        self
    }
}

/// Connect and hand the connection to `factory`.
///
/// ```no_run
/// use pgcursor::{AsConnection, Connection, connect_with};
///
/// struct Audited {
///     conn: Connection,
///     queries: usize,
/// }
///
/// impl AsConnection for Audited {
///     type Transport = pgcursor::Stream;
///     fn connection(&self) -> &Connection { &self.conn }
///     fn connection_mut(&mut self) -> &mut Connection { &mut self.conn }
/// }
///
/// let audited = connect_with("postgres://localhost/app", |conn| Audited { conn, queries: 0 })?;
/// # Ok::<(), pgcursor::Error>(())
/// ```
pub fn connect_with<O, C, F>(opts: O, factory: F) -> Result<C>
where
    O: TryInto<Opts>,
    Error: From<O::Error>,
    F: FnOnce(Connection) -> C,
    C: AsConnection,
{
    Connection::connect(opts).map(factory)
}

/// What the connection is doing on the wire.
enum ExecState {
    Idle,
    Connecting(Box<StartupStateMachine>),
    Executing {
        /// Slot of the cursor that runs an asynchronous query. `None` for
        /// statements whose result the connection returns itself.
        target: Option<Weak<Mutex<Option<QueryResult>>>>,
        query: SimpleQueryStateMachine<ResultCollector>,
    },
}

/// PostgreSQL connection.
pub struct Connection<T: Transport = Stream> {
    id: u64,
    wire: Wire<T>,
    buffer_set: BufferSet,
    exec: ExecState,
    mode: Mode,
    status: Status,
    transaction_status: TransactionStatus,
    autocommit: bool,
    default_autocommit: bool,
    isolation_level: IsolationLevel,
    itersize: usize,
    backend_pid: Option<u32>,
    server_params: Vec<(String, String)>,
    notifications: VecDeque<Notification>,
    notices: VecDeque<ErrorFields>,
    /// Advanced at every end of transaction
    mark: u64,
}

impl Connection<Stream> {
    /// Connect to a PostgreSQL server.
    ///
    /// A synchronous connection is ready on return. An asynchronous one is
    /// in [`Status::Connecting`] until [`poll`](Self::poll) returns
    /// [`PollState::Ok`].
    pub fn connect<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let opts = opts.try_into()?;
        let stream = Stream::connect(&opts)?;
        Self::with_transport(stream, opts)
    }
}

impl<T: Transport> Connection<T> {
    /// Run the startup handshake over an already open transport.
    pub fn with_transport(transport: T, opts: Opts) -> Result<Self> {
        let autocommit = opts.mode == Mode::Async || opts.autocommit;
        let mut conn = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            wire: Wire::new(transport),
            buffer_set: BufferSet::new(),
            exec: ExecState::Idle,
            mode: opts.mode,
            status: Status::Connecting,
            transaction_status: TransactionStatus::Idle,
            autocommit,
            default_autocommit: autocommit,
            isolation_level: IsolationLevel::Default,
            itersize: opts.itersize.max(1),
            backend_pid: None,
            server_params: Vec::new(),
            notifications: VecDeque::new(),
            notices: VecDeque::new(),
            mark: 0,
        };

        let mut startup = StartupStateMachine::new(&opts);
        startup.start(&mut conn.buffer_set);
        conn.queue_writes();
        conn.exec = ExecState::Connecting(Box::new(startup));
        debug!(conn_id = conn.id, mode = ?conn.mode, "connecting");

        match conn.mode {
            Mode::Sync => {
                conn.drive()?;
                conn.complete()?;
            }
            Mode::Async => {
                conn.wire
                    .set_nonblocking(true)
                    .map_err(|e| conn.fail(e))?;
            }
        }
        Ok(conn)
    }

    /// Process-unique identifier of this connection.
    pub fn connection_id(&self) -> u64 {
        self.id
    }

    /// Execution mode chosen at connect time.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Whether this is an asynchronous connection.
    pub fn is_async(&self) -> bool {
        self.mode == Mode::Async
    }

    /// Connection status.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Whether the connection is closed, normally or abnormally.
    pub fn is_closed(&self) -> bool {
        self.status.is_closed()
    }

    /// Transaction status. `Active` while a query is in flight.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Whether the handshake or a query is still in progress.
    pub fn isexecuting(&self) -> bool {
        !matches!(self.exec, ExecState::Idle)
    }

    /// Whether statements run outside a driver-managed transaction.
    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    /// Isolation level of the transactions the driver begins.
    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    /// Backend process ID.
    pub fn backend_pid(&self) -> Option<u32> {
        self.backend_pid
    }

    /// Server parameters reported with ParameterStatus.
    pub fn server_params(&self) -> &[(String, String)] {
        &self.server_params
    }

    /// Current value of a server parameter.
    pub fn parameter_status(&self, name: &str) -> Option<&str> {
        self.server_params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Queue of received notifications, oldest first.
    pub fn notifications(&mut self) -> &mut VecDeque<Notification> {
        &mut self.notifications
    }

    /// The most recent server notices, oldest first.
    pub fn notices(&mut self) -> &mut VecDeque<ErrorFields> {
        &mut self.notices
    }

    /// Socket descriptor to wait on between polls.
    pub fn fileno(&self) -> RawFd {
        self.wire.transport().raw_fd()
    }

    /// Advance the pending operation without blocking.
    ///
    /// With nothing pending, reads whatever the server sent on its own
    /// (notifications, notices) and returns [`PollState::Ok`]. This works
    /// on synchronous connections too.
    pub fn poll(&mut self) -> Result<PollState> {
        self.check_open()?;
        let state = match self.exec {
            ExecState::Idle => self.poll_idle(),
            ExecState::Connecting(_) | ExecState::Executing { .. } => self.poll_operation(),
        };
        trace!(conn_id = self.id, ?state, "poll");
        state
    }

    /// Create an unnamed (client-side) cursor.
    pub fn cursor(&mut self) -> Result<Cursor> {
        self.cursor_with(CursorConfig::default())
    }

    /// Create a named (server-side) cursor.
    pub fn named_cursor(&mut self, name: &str) -> Result<Cursor> {
        self.cursor_with(CursorConfig::named(name))
    }

    /// Create a cursor from a full configuration.
    pub fn cursor_with(&mut self, config: CursorConfig) -> Result<Cursor> {
        self.check_open()?;
        if config.name.is_none() {
            if config.withhold {
                return Err(Error::usage("trying to create a withhold unnamed cursor"));
            }
            if config.scrollable.is_some() {
                return Err(Error::usage("trying to create a scrollable unnamed cursor"));
            }
        } else if self.mode == Mode::Async {
            return Err(Error::usage(
                "asynchronous connections cannot produce named cursors",
            ));
        }
        self.check_not_executing("cursor")?;
        Ok(Cursor::new(self.id, config, self.itersize))
    }

    /// Open a large object, creating one if `oid` is 0.
    pub fn lobject(&mut self, oid: u32, mode: LoMode) -> Result<LargeObject> {
        LargeObject::open(self, oid, mode)
    }

    /// Commit the transaction the driver opened.
    ///
    /// Does nothing on the wire unless [`status`](Self::status) is
    /// [`Status::Begin`].
    pub fn commit(&mut self) -> Result<()> {
        self.end_transaction("commit", "COMMIT")
    }

    /// Roll back the transaction the driver opened.
    pub fn rollback(&mut self) -> Result<()> {
        self.end_transaction("rollback", "ROLLBACK")
    }

    /// Switch autocommit on or off.
    pub fn set_autocommit(&mut self, autocommit: bool) -> Result<()> {
        self.check_open()?;
        self.check_not_executing("set_autocommit")?;
        if self.mode == Mode::Async && !autocommit {
            return Err(Error::usage(
                "autocommit cannot be disabled in asynchronous mode",
            ));
        }
        if self.status == Status::Begin {
            return Err(Error::usage(
                "set_autocommit cannot be used inside a transaction",
            ));
        }
        self.autocommit = autocommit;
        Ok(())
    }

    /// Set the isolation level of subsequent transactions.
    ///
    /// An open transaction is rolled back first.
    pub fn set_isolation_level(&mut self, level: IsolationLevel) -> Result<()> {
        self.check_sync("set_isolation_level")?;
        if self.status == Status::Begin {
            self.end_transaction("set_isolation_level", "ROLLBACK")?;
        }
        if level == IsolationLevel::Autocommit {
            self.autocommit = true;
        } else {
            self.autocommit = false;
            self.isolation_level = level;
        }
        debug!(conn_id = self.id, ?level, "isolation level set");
        Ok(())
    }

    /// Change the client encoding.
    ///
    /// An open transaction is rolled back first.
    pub fn set_client_encoding(&mut self, encoding: &str) -> Result<()> {
        self.check_open()?;
        self.check_not_executing("set_client_encoding")?;
        if self.status == Status::Begin {
            self.end_transaction("set_client_encoding", "ROLLBACK")?;
        }
        let mut sql = String::from("SET client_encoding = ");
        quote_literal(encoding, &mut sql);
        self.run_query(&sql)?;
        Ok(())
    }

    /// Current client encoding, as reported by the server.
    pub fn client_encoding(&self) -> Option<&str> {
        self.parameter_status("client_encoding")
    }

    /// Roll back, reset every session parameter, and restore the
    /// connection defaults.
    pub fn reset(&mut self) -> Result<()> {
        self.check_sync("reset")?;
        debug!(conn_id = self.id, "reset");
        self.mark += 1;
        if self.status == Status::Begin || self.transaction_status.in_transaction() {
            self.run_query("ABORT")?;
        }
        self.status = Status::Ready;
        self.run_query("RESET ALL; SET SESSION AUTHORIZATION DEFAULT")?;
        self.autocommit = self.default_autocommit;
        self.isolation_level = IsolationLevel::Default;
        Ok(())
    }

    /// Send Terminate and close the connection.
    ///
    /// Closing twice is a no-op.
    pub fn close(&mut self) {
        if self.status.is_closed() {
            return;
        }
        debug!(conn_id = self.id, "closing connection");
        self.exec = ExecState::Idle;
        self.wire.discard();
        write_terminate(&mut self.buffer_set.write_buffer);
        self.queue_writes();
        let sent = self
            .wire
            .set_nonblocking(false)
            .and_then(|()| self.wire.flush());
        if let Err(e) = sent {
            debug!(conn_id = self.id, error = %e, "terminate not sent");
        }
        self.status = Status::ClosedNormally;
        self.transaction_status = TransactionStatus::Unknown;
    }

    // === Crate-internal operations used by cursors and large objects ===

    pub(crate) fn mark(&self) -> u64 {
        self.mark
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.status.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    pub(crate) fn check_not_executing(&self, what: &str) -> Result<()> {
        if self.isexecuting() {
            return Err(Error::usage(format!(
                "{} cannot be used while an asynchronous query is underway",
                what
            )));
        }
        Ok(())
    }

    /// Checks for operations that need a synchronous connection.
    pub(crate) fn check_sync(&self, what: &str) -> Result<()> {
        self.check_open()?;
        self.check_not_executing(what)?;
        if self.mode == Mode::Async {
            return Err(Error::usage(format!(
                "{} cannot be used in asynchronous mode",
                what
            )));
        }
        Ok(())
    }

    /// Issue BEGIN unless a transaction is already open.
    pub(crate) fn begin_transaction(&mut self) -> Result<()> {
        if self.status != Status::Ready || self.transaction_status.in_transaction() {
            return Ok(());
        }
        let sql = self.isolation_level.begin_statement();
        debug!(conn_id = self.id, sql, "begin");
        self.run_query(sql)?;
        self.status = Status::Begin;
        Ok(())
    }

    /// Issue BEGIN if the connection is not in autocommit.
    pub(crate) fn begin_if_needed(&mut self) -> Result<()> {
        if self.autocommit {
            return Ok(());
        }
        self.begin_transaction()
    }

    /// Execute a user statement for a cursor.
    ///
    /// Synchronous connections return the result. Asynchronous ones only
    /// dispatch the query; `poll()` stores the result in `slot` once it
    /// returns `Ok`.
    pub(crate) fn execute_for(
        &mut self,
        slot: &ResultSlot,
        sql: &str,
    ) -> Result<Option<QueryResult>> {
        self.check_open()?;
        self.check_not_executing("execute")?;
        match self.mode {
            Mode::Sync => {
                self.begin_if_needed()?;
                self.run_query(sql).map(Some)
            }
            Mode::Async => {
                *lock_slot(slot) = None;
                self.dispatch(Some(Arc::downgrade(slot)), sql);
                // poll() writes whatever the socket did not take now.
                self.wire.flush().map_err(|e| self.fail(e))?;
                Ok(None)
            }
        }
    }

    /// Run a statement to completion, blocking even on an asynchronous
    /// connection. No transaction is started.
    pub(crate) fn run_query(&mut self, sql: &str) -> Result<QueryResult> {
        let restore = self.wire.is_nonblocking();
        if restore {
            self.wire
                .set_nonblocking(false)
                .map_err(|e| self.fail(e))?;
        }
        self.dispatch(None, sql);
        let outcome = self.drive().and_then(|()| self.complete());
        if restore && !self.status.is_closed() {
            self.wire
                .set_nonblocking(true)
                .map_err(|e| self.fail(e))?;
        }
        match outcome? {
            Some(result) => Ok(result),
            None => Err(Error::Protocol("query produced no result".into())),
        }
    }

    // === Execution state machine ===

    fn end_transaction(&mut self, what: &str, sql: &str) -> Result<()> {
        self.check_sync(what)?;
        self.mark += 1;
        if self.status != Status::Begin {
            return Ok(());
        }
        debug!(conn_id = self.id, sql, "ending transaction");
        let outcome = self.run_query(sql);
        if !self.status.is_closed() {
            self.status = Status::Ready;
        }
        outcome.map(|_| ())
    }

    fn queue_writes(&mut self) {
        self.wire.queue(&self.buffer_set.write_buffer);
        self.buffer_set.write_buffer.clear();
    }

    fn dispatch(&mut self, target: Option<Weak<Mutex<Option<QueryResult>>>>, sql: &str) {
        debug!(conn_id = self.id, sql, asynchronous = target.is_some(), "dispatch");
        let mut query = SimpleQueryStateMachine::new(ResultCollector::new());
        query.start(&mut self.buffer_set, sql);
        self.queue_writes();
        self.transaction_status = TransactionStatus::Active;
        self.exec = ExecState::Executing { target, query };
    }

    /// Step the current operation as far as the socket allows.
    fn pump(&mut self) -> Result<PollState> {
        loop {
            if self.wire.flush()? == Flush::WouldBlock {
                return Ok(PollState::Write);
            }
            if !self.wire.read_message(&mut self.buffer_set)? {
                return Ok(PollState::Read);
            }
            let action = match &mut self.exec {
                ExecState::Connecting(startup) => startup.step(&mut self.buffer_set)?,
                ExecState::Executing { query, .. } => query.step(&mut self.buffer_set)?,
                ExecState::Idle => {
                    return Err(Error::Protocol("no operation in progress".into()));
                }
            };
            match action {
                Action::ReadMessage => {}
                Action::WriteAndReadMessage => self.queue_writes(),
                Action::HandleAsyncMessageAndReadMessage(msg) => self.handle_async(msg),
                Action::Finished => return Ok(PollState::Ok),
            }
        }
    }

    /// Pump until the current operation finished, waiting on the socket.
    fn drive(&mut self) -> Result<()> {
        loop {
            let state = self.pump().map_err(|e| self.fail(e))?;
            if state == PollState::Ok {
                return Ok(());
            }
            wait_fd(self.fileno(), state, None).map_err(|e| self.fail(e))?;
        }
    }

    /// Leave the finished operation and publish its outcome.
    ///
    /// The result of a cursor's asynchronous query goes to the cursor's
    /// slot, if the cursor still exists; any other result is returned.
    fn complete(&mut self) -> Result<Option<QueryResult>> {
        match std::mem::replace(&mut self.exec, ExecState::Idle) {
            ExecState::Idle => Ok(None),
            ExecState::Connecting(startup) => {
                self.backend_pid = startup.backend_pid();
                self.transaction_status = startup.transaction_status();
                self.status = Status::Ready;
                debug!(conn_id = self.id, backend_pid = ?self.backend_pid, "connected");
                Ok(None)
            }
            ExecState::Executing { target, mut query } => {
                self.transaction_status = query.transaction_status();
                if self.status == Status::Begin && !self.transaction_status.in_transaction() {
                    // The transaction was ended by a statement of the user.
                    self.status = Status::Ready;
                    self.mark += 1;
                }
                if let Some(err) = query.take_error() {
                    debug!(conn_id = self.id, error = %err, "query failed");
                    return Err(err);
                }
                let result = query.into_handler().into_result();
                let Some(target) = target else {
                    return Ok(Some(result));
                };
                match target.upgrade() {
                    Some(slot) => *lock_slot(&slot) = Some(result),
                    None => debug!(conn_id = self.id, "cursor dropped, result discarded"),
                }
                Ok(None)
            }
        }
    }

    fn poll_operation(&mut self) -> Result<PollState> {
        let state = self.pump().map_err(|e| self.fail(e))?;
        if state != PollState::Ok {
            return Ok(state);
        }
        self.complete()?;
        Ok(PollState::Ok)
    }

    fn poll_idle(&mut self) -> Result<PollState> {
        let restore = !self.wire.is_nonblocking();
        if restore {
            self.wire.set_nonblocking(true).map_err(|e| self.fail(e))?;
        }
        if let Err(e) = self.drain_async_messages() {
            return Err(self.fail(e));
        }
        if restore {
            self.wire.set_nonblocking(false).map_err(|e| self.fail(e))?;
        }
        Ok(PollState::Ok)
    }

    /// Read every message the server sent on its own.
    fn drain_async_messages(&mut self) -> Result<()> {
        while self.wire.read_message(&mut self.buffer_set)? {
            let type_byte = self.buffer_set.type_byte;
            if RawMessage::is_async_type(type_byte) {
                let msg = AsyncMessage::parse(type_byte, &self.buffer_set.read_buffer)?;
                self.handle_async(msg);
            } else if type_byte == msg_type::ERROR_RESPONSE {
                // e.g. FATAL 57P01 before the server hangs up
                return Err(ErrorResponse::parse(&self.buffer_set.read_buffer)?.into_error());
            } else {
                return Err(Error::Protocol(format!(
                    "Unexpected message while idle: '{}'",
                    type_byte as char
                )));
            }
        }
        Ok(())
    }

    fn handle_async(&mut self, msg: AsyncMessage) {
        match msg {
            AsyncMessage::Notification {
                pid,
                channel,
                payload,
            } => {
                debug!(conn_id = self.id, pid, channel = %channel, "notification");
                self.notifications.push_back(Notification {
                    pid,
                    channel,
                    payload,
                });
            }
            AsyncMessage::Notice(fields) => {
                trace!(conn_id = self.id, notice = %fields, "notice");
                if self.notices.len() == MAX_NOTICES {
                    self.notices.pop_front();
                }
                self.notices.push_back(fields);
            }
            AsyncMessage::ParameterChanged { name, value } => {
                match self.server_params.iter_mut().find(|(k, _)| *k == name) {
                    Some((_, v)) => *v = value,
                    None => self.server_params.push((name, value)),
                }
            }
        }
    }

    /// Record that the connection is gone and return the error to report.
    ///
    /// A FATAL error the server sent before hanging up is preferred over
    /// the end-of-stream it caused.
    fn fail(&mut self, err: Error) -> Error {
        let captured = match std::mem::replace(&mut self.exec, ExecState::Idle) {
            ExecState::Executing { mut query, .. } => query.take_error(),
            ExecState::Idle | ExecState::Connecting(_) => None,
        };
        let err = match captured {
            Some(server) if server.is_connection_broken() => server,
            _ => err,
        };
        if !self.status.is_closed() {
            warn!(conn_id = self.id, error = %err, "connection terminated abnormally");
            self.status = Status::ClosedAbnormally;
        }
        self.transaction_status = TransactionStatus::Unknown;
        self.wire.discard();
        err
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        self.close();
    }
}
