//! Test doubles for the relay engine.
//!
//! [`FakeStream`] is an in-memory [`NonBlockingStream`]. The test keeps the
//! matching [`FakeRemote`] handle to feed bytes the relay will read, collect
//! bytes the relay wrote, and script partial writes, would-block and errors.

use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};

use tcprelay_networking::{ConnectStatus, NonBlockingStream, Recv};

/// Scripted outcome for `connect_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectScript {
    Connected,
    Pending,
    Refused,
}

#[derive(Debug)]
struct FakeState {
    inbound: VecDeque<u8>,
    inbound_closed: bool,
    read_error: Option<io::ErrorKind>,
    outbound: Vec<u8>,
    write_budget: Option<usize>,
    max_chunk: Option<usize>,
    write_error: Option<io::ErrorKind>,
    write_shut: bool,
    connect: ConnectScript,
    recv_calls: usize,
    send_calls: usize,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            inbound: VecDeque::new(),
            inbound_closed: false,
            read_error: None,
            outbound: Vec::new(),
            write_budget: None,
            max_chunk: None,
            write_error: None,
            write_shut: false,
            connect: ConnectScript::Connected,
            recv_calls: 0,
            send_calls: 0,
        }
    }
}

fn lock(state: &Mutex<FakeState>) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The relay's end of a scripted connection.
#[derive(Debug)]
pub struct FakeStream {
    state: Arc<Mutex<FakeState>>,
}

/// The test's end of a scripted connection.
#[derive(Debug, Clone)]
pub struct FakeRemote {
    state: Arc<Mutex<FakeState>>,
}

impl FakeStream {
    /// Create a connected stream and its remote handle.
    pub fn pair() -> (FakeStream, FakeRemote) {
        let state = Arc::new(Mutex::new(FakeState::default()));
        (
            FakeStream {
                state: Arc::clone(&state),
            },
            FakeRemote { state },
        )
    }
}

impl NonBlockingStream for FakeStream {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Recv> {
        let mut state = lock(&self.state);
        state.recv_calls += 1;
        if let Some(kind) = state.read_error {
            return Err(kind.into());
        }
        if state.inbound.is_empty() {
            return Ok(if state.inbound_closed {
                Recv::Closed
            } else {
                Recv::WouldBlock
            });
        }
        let n = buf.len().min(state.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(Recv::Data(n))
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        state.send_calls += 1;
        if let Some(kind) = state.write_error {
            return Err(kind.into());
        }
        if state.write_shut {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let mut n = buf.len();
        if let Some(chunk) = state.max_chunk {
            n = n.min(chunk);
        }
        if let Some(budget) = state.write_budget {
            n = n.min(budget);
            state.write_budget = Some(budget - n);
        }
        state.outbound.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        lock(&self.state).write_shut = true;
        Ok(())
    }

    fn connect_status(&mut self) -> ConnectStatus {
        match lock(&self.state).connect {
            ConnectScript::Connected => ConnectStatus::Connected,
            ConnectScript::Pending => ConnectStatus::Pending,
            ConnectScript::Refused => {
                ConnectStatus::Failed(io::ErrorKind::ConnectionRefused.into())
            }
        }
    }

    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

impl FakeRemote {
    /// Queue bytes for the relay to read.
    pub fn feed(&self, bytes: &[u8]) {
        lock(&self.state).inbound.extend(bytes.iter().copied());
    }

    /// Signal end-of-stream once queued bytes are consumed.
    pub fn close(&self) {
        lock(&self.state).inbound_closed = true;
    }

    /// Make every subsequent recv fail.
    pub fn fail_reads(&self, kind: io::ErrorKind) {
        lock(&self.state).read_error = Some(kind);
    }

    /// Make every subsequent send fail.
    pub fn fail_writes(&self, kind: io::ErrorKind) {
        lock(&self.state).write_error = Some(kind);
    }

    /// Accept at most `chunk` bytes per send call.
    pub fn set_max_chunk(&self, chunk: usize) {
        lock(&self.state).max_chunk = Some(chunk);
    }

    /// Limit the bytes accepted before sends start returning 0.
    /// `None` removes the limit.
    pub fn set_write_budget(&self, budget: Option<usize>) {
        lock(&self.state).write_budget = budget;
    }

    /// Let `n` more bytes through a limited write budget.
    pub fn grant(&self, n: usize) {
        let mut state = lock(&self.state);
        state.write_budget = Some(state.write_budget.unwrap_or(0) + n);
    }

    /// Script the result of the next `connect_status` calls.
    pub fn set_connect(&self, script: ConnectScript) {
        lock(&self.state).connect = script;
    }

    /// Bytes written by the relay so far.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).outbound.clone()
    }

    /// Number of bytes written by the relay so far.
    pub fn written_len(&self) -> usize {
        lock(&self.state).outbound.len()
    }

    /// Bytes fed but not yet read by the relay.
    pub fn unread(&self) -> usize {
        lock(&self.state).inbound.len()
    }

    /// Whether the relay shut its write side down.
    pub fn is_write_shut(&self) -> bool {
        lock(&self.state).write_shut
    }

    pub fn recv_calls(&self) -> usize {
        lock(&self.state).recv_calls
    }

    pub fn send_calls(&self) -> usize {
        lock(&self.state).send_calls
    }
}
