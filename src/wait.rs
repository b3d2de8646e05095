//! Blocking readiness wait for asynchronous connections.

use std::os::fd::RawFd;
use std::time::Duration;

use tracing::trace;

use crate::conn::{AsConnection, PollState};
use crate::error::Result;

/// Block until `fd` is ready for the I/O that `state` asks for.
///
/// Returns `false` if `timeout` elapsed first. A negative descriptor (a
/// transport without a socket) is reported ready immediately.
pub fn wait_fd(fd: RawFd, state: PollState, timeout: Option<Duration>) -> Result<bool> {
    let events = match state {
        PollState::Ok => return Ok(true),
        PollState::Read => libc::POLLIN,
        PollState::Write => libc::POLLOUT,
    };
    if fd < 0 {
        return Ok(true);
    }
    let timeout_ms = timeout.map_or(-1, |t| i32::try_from(t.as_millis()).unwrap_or(i32::MAX));
    let mut pollfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    loop {
        // SAFETY: `pollfd` is a single valid, initialized entry that outlives the call.
        let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if rc >= 0 {
            return Ok(rc > 0);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err.into());
        }
    }
}

/// Drive `conn.poll()` until it returns [`PollState::Ok`], sleeping on the
/// socket in between.
pub fn wait_select<C: AsConnection + ?Sized>(conn: &mut C) -> Result<()> {
    loop {
        let conn = conn.connection_mut();
        let state = conn.poll()?;
        trace!(?state, "wait_select");
        if state == PollState::Ok {
            return Ok(());
        }
        wait_fd(conn.fileno(), state, None)?;
    }
}
