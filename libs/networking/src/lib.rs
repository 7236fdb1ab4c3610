//! Socket utilities for the relay.
//!
//! This library provides helpers for:
//! - Non-blocking listen, accept and dial over `mio` sockets
//! - Non-blocking recv/send with explicit would-block and end-of-stream results
//! - Socket options (no-delay, quick-ack)
//! - Kernel-side zero-copy moves through a pipe (`splice`, Linux only)

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};

use mio::net::{TcpListener, TcpStream};
use thiserror::Error;

pub mod splice;

pub use splice::{Moved, SplicePipe, SPLICE_CHUNK};

/// Networking errors.
#[derive(Debug, Error)]
pub enum NetError {
    /// Could not bind a listening socket.
    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Could not start a connect to a remote address.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A socket option could not be applied.
    #[error("setting {option} failed: {source}")]
    SocketOption {
        option: &'static str,
        #[source]
        source: io::Error,
    },

    /// Pipe creation for zero-copy moves failed.
    #[error("pipe creation failed: {0}")]
    Pipe(#[source] io::Error),

    /// Zero-copy moves are not available on this platform.
    #[error("zero-copy moves are not supported on this platform")]
    Unsupported,
}

// ============================================================================
// Results of non-blocking operations
// ============================================================================

/// Outcome of a non-blocking accept.
#[derive(Debug)]
pub enum Accepted {
    /// A new connection.
    Stream(TcpStream, SocketAddr),
    /// No pending connection right now; try again on the next readiness event.
    WouldBlock,
}

/// Outcome of a non-blocking receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recv {
    /// `n` bytes were written into the buffer (`n > 0`).
    Data(usize),
    /// The peer closed its write side.
    Closed,
    /// Nothing to read right now.
    WouldBlock,
}

/// State of an outgoing non-blocking connect.
#[derive(Debug)]
pub enum ConnectStatus {
    /// The connection is established.
    Connected,
    /// The handshake is still in flight.
    Pending,
    /// The connect failed.
    Failed(io::Error),
}

// ============================================================================
// Stream abstraction
// ============================================================================

/// A non-blocking byte stream as seen by the relay engine.
///
/// Implemented for `mio::net::TcpStream`; tests substitute an in-memory stream.
pub trait NonBlockingStream {
    /// Receive into `buf`. `buf` must not be empty.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Recv>;

    /// Send from `buf`, returning how many bytes the kernel accepted.
    /// `Ok(0)` on a non-empty buffer means the socket would block.
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Shut the write half down so the peer observes end-of-stream.
    fn shutdown_write(&mut self) -> io::Result<()>;

    /// Report the state of an outgoing connect.
    fn connect_status(&mut self) -> ConnectStatus;

    /// Raw descriptor for kernel-side moves, if the stream has one.
    fn raw_fd(&self) -> Option<RawFd>;
}

impl NonBlockingStream for TcpStream {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Recv> {
        recv_nonblocking(self, buf)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        send_nonblocking(self, buf)
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        match self.shutdown(Shutdown::Write) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn connect_status(&mut self) -> ConnectStatus {
        is_connected(self)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }
}

// ============================================================================
// Socket operations
// ============================================================================

/// Bind a non-blocking listening socket.
///
/// The std listener is returned so callers can clone the descriptor for
/// several pollers before wrapping each copy in `mio::net::TcpListener`.
pub fn listen(addr: SocketAddr) -> Result<std::net::TcpListener, NetError> {
    let listener =
        std::net::TcpListener::bind(addr).map_err(|source| NetError::Bind { addr, source })?;
    listener
        .set_nonblocking(true)
        .map_err(|source| NetError::SocketOption {
            option: "O_NONBLOCK",
            source,
        })?;
    Ok(listener)
}

/// Start a non-blocking connect.
///
/// Returns the stream and whether the handshake is still pending. A pending
/// connect completes when the socket reports write readiness.
pub fn connect_nonblocking(addr: SocketAddr) -> Result<(TcpStream, bool), NetError> {
    let mut stream = TcpStream::connect(addr).map_err(|source| NetError::Connect { addr, source })?;
    match is_connected(&mut stream) {
        ConnectStatus::Connected => Ok((stream, false)),
        ConnectStatus::Pending => Ok((stream, true)),
        ConnectStatus::Failed(source) => Err(NetError::Connect { addr, source }),
    }
}

/// Check whether a non-blocking connect has completed.
pub fn is_connected(stream: &mut TcpStream) -> ConnectStatus {
    match stream.take_error() {
        Ok(Some(e)) | Err(e) => return ConnectStatus::Failed(e),
        Ok(None) => {}
    }

    match stream.peer_addr() {
        Ok(_) => ConnectStatus::Connected,
        Err(e) if e.kind() == io::ErrorKind::NotConnected => ConnectStatus::Pending,
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => ConnectStatus::Pending,
        Err(e) => ConnectStatus::Failed(e),
    }
}

/// Accept one connection without blocking.
///
/// Connections reset by the client while still queued are skipped. Any
/// other error leaves the backlog untouched and is returned.
pub fn accept_nonblocking(listener: &TcpListener) -> io::Result<Accepted> {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => return Ok(Accepted::Stream(stream, peer)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Accepted::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_aborted_accept(&e) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Accept failed for one queued connection only; the next one may succeed.
pub fn is_aborted_accept(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    ) || err.raw_os_error() == Some(libc::EPROTO)
}

/// Receive without blocking.
pub fn recv_nonblocking<R: Read>(stream: &mut R, buf: &mut [u8]) -> io::Result<Recv> {
    debug_assert!(!buf.is_empty(), "recv into an empty buffer reads as end-of-stream");
    loop {
        match stream.read(buf) {
            Ok(0) => return Ok(Recv::Closed),
            Ok(n) => return Ok(Recv::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Recv::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Send without blocking. Returns 0 when the socket cannot take more bytes.
pub fn send_nonblocking<W: Write>(stream: &mut W, buf: &[u8]) -> io::Result<usize> {
    loop {
        match stream.write(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// Socket options
// ============================================================================

/// Disable Nagle's algorithm.
pub fn set_nodelay(stream: &TcpStream) -> Result<(), NetError> {
    stream
        .set_nodelay(true)
        .map_err(|source| NetError::SocketOption {
            option: "TCP_NODELAY",
            source,
        })
}

/// Ask the kernel to acknowledge immediately instead of delaying ACKs.
#[cfg(target_os = "linux")]
pub fn set_quickack(stream: &TcpStream) -> Result<(), NetError> {
    let enable: libc::c_int = 1;
    // SAFETY: the descriptor is owned by `stream` for the duration of the call
    // and `enable` outlives it.
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_QUICKACK,
            &enable as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(NetError::SocketOption {
            option: "TCP_QUICKACK",
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Quick-ack is Linux specific; elsewhere this is a no-op.
#[cfg(not(target_os = "linux"))]
pub fn set_quickack(_stream: &TcpStream) -> Result<(), NetError> {
    Ok(())
}
