//! Kernel-side zero-copy moves.
//!
//! Bytes travel socket -> pipe -> socket with `splice(2)` and never enter
//! user space. Both steps are non-blocking; the pipe keeps whatever the
//! destination could not take yet.

use std::io;
use std::os::fd::RawFd;

use crate::NetError;

/// Upper bound for a single move into the pipe.
pub const SPLICE_CHUNK: usize = 16 * 1024;

/// Result of moving bytes from a socket into a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Moved {
    /// `n` bytes now sit in the pipe.
    Bytes(usize),
    /// The source reached end-of-stream.
    Closed,
    /// The source has nothing to offer, or the pipe is full.
    WouldBlock,
}

#[cfg(target_os = "linux")]
mod imp {
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    use crate::NetError;

    pub(super) struct Pipe {
        read: OwnedFd,
        write: OwnedFd,
    }

    impl Pipe {
        pub(super) fn new() -> Result<Self, NetError> {
            let mut fds = [0 as libc::c_int; 2];
            // SAFETY: `fds` has room for the two descriptors pipe2 writes.
            let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
            if rc != 0 {
                return Err(NetError::Pipe(io::Error::last_os_error()));
            }
            // SAFETY: pipe2 succeeded, so both descriptors are open and owned by us.
            let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
            Ok(Self { read, write })
        }

        pub(super) fn read_end(&self) -> RawFd {
            self.read.as_raw_fd()
        }

        pub(super) fn write_end(&self) -> RawFd {
            self.write.as_raw_fd()
        }
    }

    /// One non-blocking `splice(2)` call. `Ok(None)` means it would block.
    pub(super) fn splice(fd_in: RawFd, fd_out: RawFd, len: usize) -> io::Result<Option<usize>> {
        loop {
            // SAFETY: both descriptors stay open for the call; null offsets are
            // required for sockets and pipes.
            let n = unsafe {
                libc::splice(
                    fd_in,
                    std::ptr::null_mut(),
                    fd_out,
                    std::ptr::null_mut(),
                    len,
                    libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK,
                )
            };
            if n >= 0 {
                return Ok(Some(n as usize));
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return Ok(None),
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err),
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use std::io;
    use std::os::fd::RawFd;

    use crate::NetError;

    pub(super) struct Pipe;

    impl Pipe {
        pub(super) fn new() -> Result<Self, NetError> {
            Err(NetError::Unsupported)
        }

        pub(super) fn read_end(&self) -> RawFd {
            -1
        }

        pub(super) fn write_end(&self) -> RawFd {
            -1
        }
    }

    pub(super) fn splice(_fd_in: RawFd, _fd_out: RawFd, _len: usize) -> io::Result<Option<usize>> {
        Err(io::ErrorKind::Unsupported.into())
    }
}

/// A kernel pipe carrying one direction of a relayed connection.
pub struct SplicePipe {
    pipe: imp::Pipe,
    pending: usize,
}

impl SplicePipe {
    /// Create a non-blocking pipe.
    pub fn new() -> Result<Self, NetError> {
        Ok(Self {
            pipe: imp::Pipe::new()?,
            pending: 0,
        })
    }

    /// Bytes moved in but not yet moved out.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Move up to `max` bytes from `src` into the pipe.
    pub fn fill_from(&mut self, src: RawFd, max: usize) -> io::Result<Moved> {
        match imp::splice(src, self.pipe.write_end(), max)? {
            None => Ok(Moved::WouldBlock),
            Some(0) => Ok(Moved::Closed),
            Some(n) => {
                self.pending += n;
                Ok(Moved::Bytes(n))
            }
        }
    }

    /// Move pending bytes out to `dst`. Returns how many moved; 0 means the
    /// destination would block.
    pub fn drain_to(&mut self, dst: RawFd) -> io::Result<usize> {
        if self.pending == 0 {
            return Ok(0);
        }
        match imp::splice(self.pipe.read_end(), dst, self.pending)? {
            None => Ok(0),
            Some(n) => {
                self.pending -= n;
                Ok(n)
            }
        }
    }
}

impl std::fmt::Debug for SplicePipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplicePipe")
            .field("pending", &self.pending)
            .finish()
    }
}
