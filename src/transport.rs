//! Byte transport and message framing.
//!
//! [`Transport`] is a raw byte pipe that can be switched between blocking
//! and non-blocking mode. [`Wire`] sits on top of it and turns the byte
//! stream into backend messages, buffering partial input and pending
//! output so that a non-blocking caller can resume where it stopped.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use tracing::trace;

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::codec::read_u32;

/// Bytes requested from the transport per read.
const READ_CHUNK: usize = 8192;

/// Messages larger than this are treated as a protocol violation.
const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Raw byte pipe to the server.
pub trait Transport {
    /// Read available bytes. `Ok(0)` means the peer closed the connection.
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Write some bytes, returning how many were accepted.
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize>;

    /// Switch between blocking and non-blocking operation.
    fn set_nonblocking(&mut self, nonblocking: bool) -> std::io::Result<()>;

    /// File descriptor to wait on for readiness.
    fn raw_fd(&self) -> RawFd;
}

/// TCP or Unix domain socket.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    /// Open the socket described by `opts`.
    pub fn connect(opts: &Opts) -> Result<Self> {
        if let Some(socket_path) = &opts.socket {
            return Ok(Stream::Unix(UnixStream::connect(socket_path)?));
        }
        if opts.host.is_empty() {
            return Err(Error::InvalidUsage("host is empty".into()));
        }
        let tcp = TcpStream::connect((opts.host.as_str(), opts.port))?;
        tcp.set_nodelay(true)?;
        Ok(Stream::Tcp(tcp))
    }
}

impl Transport for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_nonblocking(nonblocking),
            Stream::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    fn raw_fd(&self) -> RawFd {
        match self {
            Stream::Tcp(s) => s.as_raw_fd(),
            Stream::Unix(s) => s.as_raw_fd(),
        }
    }
}

/// Outcome of a flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// All pending output was written.
    Done,
    /// The transport would block; output remains queued.
    WouldBlock,
}

/// Outcome of a fill attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// This many bytes were read.
    Data(usize),
    /// The transport would block.
    WouldBlock,
}

/// Message framing over a [`Transport`].
#[derive(Debug)]
pub struct Wire<T> {
    transport: T,
    input: Vec<u8>,
    consumed: usize,
    output: Vec<u8>,
    written: usize,
    nonblocking: bool,
}

impl<T: Transport> Wire<T> {
    /// Wrap a blocking transport.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            input: Vec::with_capacity(READ_CHUNK),
            consumed: 0,
            output: Vec::with_capacity(READ_CHUNK),
            written: 0,
            nonblocking: false,
        }
    }

    /// Borrow the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Whether the transport is in non-blocking mode.
    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    /// Switch the transport between blocking and non-blocking mode.
    pub fn set_nonblocking(&mut self, nonblocking: bool) -> Result<()> {
        if self.nonblocking != nonblocking {
            self.transport.set_nonblocking(nonblocking)?;
            self.nonblocking = nonblocking;
        }
        Ok(())
    }

    /// Queue encoded frontend messages for sending.
    pub fn queue(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
    }

    /// Drop buffered input and output.
    pub fn discard(&mut self) {
        self.input.clear();
        self.consumed = 0;
        self.output.clear();
        self.written = 0;
    }

    /// Write queued output.
    ///
    /// In blocking mode this returns only once everything is written.
    pub fn flush(&mut self) -> Result<Flush> {
        while let Some(pending) = self.output.get(self.written..).filter(|p| !p.is_empty()) {
            match self.transport.write(pending) {
                Ok(0) => {
                    return Err(Error::Io(std::io::Error::new(
                        ErrorKind::WriteZero,
                        "failed to write to server",
                    )));
                }
                Ok(n) => self.written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Flush::WouldBlock),
                Err(e) => return Err(e.into()),
            }
        }
        self.output.clear();
        self.written = 0;
        Ok(Flush::Done)
    }

    /// Read whatever the transport has available.
    ///
    /// End of stream is reported as [`Error::ConnectionBroken`].
    pub fn fill(&mut self) -> Result<Fill> {
        if self.consumed > 0 {
            self.input.drain(..self.consumed);
            self.consumed = 0;
        }
        let filled = self.input.len();
        self.input.resize(filled + READ_CHUNK, 0);
        loop {
            let buf = self.input.get_mut(filled..).unwrap_or_default();
            match self.transport.read(buf) {
                Ok(0) => {
                    self.input.truncate(filled);
                    trace!("socket read: end of stream");
                    return Err(Error::ConnectionBroken);
                }
                Ok(n) => {
                    self.input.truncate(filled + n);
                    trace!(bytes = n, "socket read");
                    return Ok(Fill::Data(n));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.input.truncate(filled);
                    trace!("socket read: would block");
                    return Ok(Fill::WouldBlock);
                }
                Err(e) => {
                    self.input.truncate(filled);
                    return Err(e.into());
                }
            }
        }
    }

    /// Move one complete buffered message into `buffer_set` without doing I/O.
    pub fn next_buffered(&mut self, buffer_set: &mut BufferSet) -> Result<bool> {
        let available = self.input.get(self.consumed..).unwrap_or_default();
        let (Some(&type_byte), Some(header)) = (available.first(), available.get(1..5)) else {
            return Ok(false);
        };
        let (length, _) = read_u32(header)?;
        let length = length as usize;
        if !(4..=MAX_MESSAGE_LEN).contains(&length) {
            return Err(Error::Protocol(format!(
                "Invalid message length: {}",
                length
            )));
        }
        let Some(payload) = available.get(5..1 + length) else {
            return Ok(false);
        };

        buffer_set.type_byte = type_byte;
        buffer_set.read_buffer.clear();
        buffer_set.read_buffer.extend_from_slice(payload);
        self.consumed += 1 + length;
        if self.consumed == self.input.len() {
            self.input.clear();
            self.consumed = 0;
        }
        Ok(true)
    }

    /// Read one message, reading from the transport as needed.
    ///
    /// Returns `Ok(false)` if the transport would block before a complete
    /// message arrived; the partial message stays buffered. In blocking
    /// mode this only returns once a message was read.
    pub fn read_message(&mut self, buffer_set: &mut BufferSet) -> Result<bool> {
        loop {
            if self.next_buffered(buffer_set)? {
                return Ok(true);
            }
            if self.fill()? == Fill::WouldBlock {
                return Ok(false);
            }
        }
    }
}
