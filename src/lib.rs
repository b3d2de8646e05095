//! A poll-driven PostgreSQL client core with server-side cursors.
//!
//! # Features
//!
//! - **Sans-I/O state machines**: protocol logic is separated from I/O, so a
//!   query can run to completion on a blocking socket or be advanced one
//!   [`Connection::poll`] step at a time on a non-blocking one
//! - **Named cursors**: `DECLARE`d server-side cursors with paged fetching,
//!   `WITH HOLD` and `SCROLL` control
//! - **Session tracking**: transaction status, LISTEN/NOTIFY queue, notices,
//!   and detection of backends terminated by the server
//!
//! # Example
//!
//! ```no_run
//! use pgcursor::{Connection, CursorConfig, Opts};
//!
//! fn main() -> pgcursor::Result<()> {
//!     let opts = Opts {
//!         host: "localhost".into(),
//!         user: "postgres".into(),
//!         database: Some("mydb".into()),
//!         password: Some("secret".into()),
//!         ..Default::default()
//!     };
//!
//!     let mut conn = Connection::connect(opts)?;
//!
//!     let mut cur = conn.cursor_with(CursorConfig::named("numbers").withhold(true))?;
//!     cur.set_itersize(100);
//!     cur.execute(&mut conn, "SELECT generate_series(1, $1)", (1000,))?;
//!     conn.commit()?;
//!
//!     for row in cur.iter(&mut conn) {
//!         let (n,): (i32,) = row?.decode()?;
//!         println!("{}", n);
//!     }
//!     cur.close(&mut conn)?;
//!     conn.close();
//!     Ok(())
//! }
//! ```

pub mod buffer_set;
pub mod conn;
pub mod cursor;
pub mod error;
pub mod handler;
pub mod lobject;
pub mod opts;
pub mod protocol;
pub mod row;
pub mod state;
pub mod transport;
pub mod value;
pub mod wait;

pub use buffer_set::BufferSet;
pub use conn::{
    AsConnection, Connection, IsolationLevel, Notification, PollState, Status, connect_with,
};
pub use cursor::{Cursor, CursorConfig, Rows, ScrollMode};
pub use error::{Error, ErrorFields, Result};
pub use handler::{QueryResult, ResultCollector, TextHandler};
pub use lobject::{LargeObject, LoMode};
pub use opts::{Mode, Opts};
pub use protocol::types::{FormatCode, Oid, TransactionStatus};
pub use row::{Column, FromRow, Row};
pub use transport::{Stream, Transport};
pub use value::{FromWireValue, ToParams, ToSqlLiteral};
pub use wait::{wait_fd, wait_select};
