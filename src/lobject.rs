//! Large objects.
//!
//! A [`LargeObject`] is a descriptor opened with `lo_open` inside the
//! current transaction. It becomes invalid when that transaction ends.

use std::io::SeekFrom;

use tracing::debug;

use crate::conn::{AsConnection, Connection};
use crate::error::{Error, Result};
use crate::row::Row;
use crate::transport::Transport;
use crate::value::ToSqlLiteral;

const INV_WRITE: i32 = 0x0002_0000;
const INV_READ: i32 = 0x0004_0000;

/// Access mode of a large object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoMode {
    Read,
    Write,
    #[default]
    ReadWrite,
}

impl LoMode {
    fn flags(self) -> i32 {
        match self {
            LoMode::Read => INV_READ,
            LoMode::Write => INV_WRITE,
            LoMode::ReadWrite => INV_READ | INV_WRITE,
        }
    }
}

/// Open large object.
#[derive(Debug)]
pub struct LargeObject {
    conn_id: u64,
    oid: u32,
    fd: i32,
    mode: LoMode,
    mark: u64,
    closed: bool,
}

fn query_row<T: Transport>(conn: &mut Connection<T>, sql: &str) -> Result<Row> {
    conn.run_query(sql)?
        .rows
        .into_iter()
        .next()
        .ok_or_else(|| Error::Protocol(format!("no row returned by: {}", sql)))
}

impl LargeObject {
    /// Open large object `oid`, creating a new one if `oid` is 0.
    ///
    /// Needs a synchronous connection outside autocommit; a transaction is
    /// started if none is open.
    pub fn open<T: Transport>(conn: &mut Connection<T>, oid: u32, mode: LoMode) -> Result<Self> {
        conn.check_sync("lobject")?;
        if conn.autocommit() {
            return Err(Error::usage("can't use a lobject outside of transactions"));
        }
        conn.begin_transaction()?;

        let oid = if oid == 0 {
            query_row(conn, "SELECT lo_creat(-1)")?.get::<u32>(0)?
        } else {
            oid
        };
        let fd = query_row(conn, &format!("SELECT lo_open({}, {})", oid, mode.flags()))?
            .get::<i32>(0)?;
        debug!(conn_id = conn.connection_id(), oid, fd, "large object opened");
        Ok(Self {
            conn_id: conn.connection_id(),
            oid,
            fd,
            mode,
            mark: conn.mark(),
            closed: false,
        })
    }

    /// OID of the large object.
    pub fn oid(&self) -> u32 {
        self.oid
    }

    /// Access mode.
    pub fn mode(&self) -> LoMode {
        self.mode
    }

    /// Whether the descriptor was closed.
    pub fn closed(&self) -> bool {
        self.closed
    }

    /// Read up to `size` bytes from the current position.
    pub fn read<C: AsConnection + ?Sized>(&mut self, conn: &mut C, size: usize) -> Result<Vec<u8>> {
        let conn = conn.connection_mut();
        self.check(conn, "read")?;
        query_row(conn, &format!("SELECT loread({}, {})", self.fd, size))?.get::<Vec<u8>>(0)
    }

    /// Write `data` at the current position and return the bytes written.
    pub fn write<C: AsConnection + ?Sized>(&mut self, conn: &mut C, data: &[u8]) -> Result<usize> {
        let conn = conn.connection_mut();
        self.check(conn, "write")?;
        let mut sql = format!("SELECT lowrite({}, ", self.fd);
        data.write_literal(&mut sql);
        sql.push(')');
        let written = query_row(conn, &sql)?.get::<i32>(0)?;
        usize::try_from(written)
            .map_err(|e| Error::Protocol(format!("lowrite returned {}: {}", written, e)))
    }

    /// Move the current position and return the new one.
    pub fn seek<C: AsConnection + ?Sized>(&mut self, conn: &mut C, pos: SeekFrom) -> Result<i64> {
        let conn = conn.connection_mut();
        self.check(conn, "seek")?;
        let (offset, whence) = match pos {
            SeekFrom::Start(n) => (
                i64::try_from(n)
                    .map_err(|e| Error::OutOfRange(format!("seek offset {}: {}", n, e)))?,
                libc::SEEK_SET,
            ),
            SeekFrom::Current(n) => (n, libc::SEEK_CUR),
            SeekFrom::End(n) => (n, libc::SEEK_END),
        };
        query_row(
            conn,
            &format!("SELECT lo_lseek64({}, {}, {})", self.fd, offset, whence),
        )?
        .get::<i64>(0)
    }

    /// Current position.
    pub fn tell<C: AsConnection + ?Sized>(&mut self, conn: &mut C) -> Result<i64> {
        let conn = conn.connection_mut();
        self.check(conn, "tell")?;
        query_row(conn, &format!("SELECT lo_tell64({})", self.fd))?.get::<i64>(0)
    }

    /// Close the descriptor. Closing twice, or after the transaction ended,
    /// is a no-op.
    pub fn close<C: AsConnection + ?Sized>(&mut self, conn: &mut C) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let conn = conn.connection_mut();
        self.check_connection(conn)?;
        if !conn.is_closed() && self.mark == conn.mark() {
            conn.check_sync("lobject close")?;
            conn.run_query(&format!("SELECT lo_close({})", self.fd))?;
        }
        self.closed = true;
        debug!(conn_id = self.conn_id, oid = self.oid, "large object closed");
        Ok(())
    }

    /// Close the descriptor and delete the large object.
    pub fn unlink<C: AsConnection + ?Sized>(&mut self, conn: &mut C) -> Result<()> {
        let conn = conn.connection_mut();
        self.close(&mut *conn)?;
        conn.check_sync("lobject unlink")?;
        conn.run_query(&format!("SELECT lo_unlink({})", self.oid))?;
        debug!(conn_id = self.conn_id, oid = self.oid, "large object unlinked");
        Ok(())
    }

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

    fn check<T: Transport>(&self, conn: &Connection<T>, what: &str) -> Result<()> {
        self.check_connection(conn)?;
        if self.closed {
            return Err(Error::usage("lobject already closed"));
        }
        conn.check_sync(what)?;
        if self.mark != conn.mark() {
            return Err(Error::usage("lobject isn't valid anymore"));
        }
        Ok(())
    }
}
