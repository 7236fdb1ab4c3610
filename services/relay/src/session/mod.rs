//! Relay sessions.
//!
//! A [`Session`] pairs one client with one backend and moves bytes both ways.
//! Each side owns the queue of packets read *from* it; a flush sends that
//! queue to the opposite side. A send that completes only partially parks the
//! packet in the queue's `blocked` slot and marks the destination blocked,
//! which stops reading from the source until the destination drains.
//!
//! Sockets are edge-triggered, so [`Session::drive`] attempts every possible
//! move speculatively until a full pass makes no progress.

pub mod table;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use tcprelay_networking::{ConnectStatus, Moved, NonBlockingStream, Recv, SplicePipe, SPLICE_CHUNK};
use tracing::debug;

use crate::error::{invariant_violated, RelayError};
use crate::pool::{Packet, PacketPool};
use crate::queue::PacketQueue;
use crate::stats::Stats;

pub use table::{SessionId, SessionTable};

/// Passes per [`Session::drive`] call before yielding to other sessions.
pub const MAX_DRIVE_PASSES: usize = 8;

/// One end of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Backend,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Client, Side::Backend];

    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Backend,
            Side::Backend => Side::Client,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Side::Client => 0,
            Side::Backend => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Backend => "backend",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable lifecycle state.
///
/// `ClientBlocked` means sends *to* the client are blocked (and reading from
/// the backend has stopped); `BackendBlocked` is the mirror image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepting,
    Connecting,
    Relaying,
    ClientBlocked,
    BackendBlocked,
    BothBlocked,
    Closing,
}

/// Readiness interest for one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    pub const NONE: Readiness = Readiness {
        readable: false,
        writable: false,
    };

    pub fn is_none(self) -> bool {
        !self.readable && !self.writable
    }
}

/// Per-session flow-control limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Ceiling on bytes read from one side and not yet sent to the other.
    pub max_pending_bytes: usize,
}

/// Outcome of one [`Session::drive`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drive {
    /// Nothing more can move until the next readiness event.
    Idle,
    /// The pass limit was hit while still making progress; drive again soon.
    Yielded,
}

#[derive(Debug)]
struct Peer<S> {
    side: Side,
    stream: Option<S>,
    addr: Option<SocketAddr>,
    /// Packets read from this side, bound for the other.
    inbound: PacketQueue,
    /// Pipe carrying bytes read from this side (zero-copy mode).
    pipe: Option<SplicePipe>,
    /// Bytes read from this side and not yet sent on.
    pending: usize,
    eof: bool,
    error: bool,
    /// Sends to this side are blocked.
    blocked: bool,
    write_shut: bool,
    connecting: bool,
    registered: Readiness,
}

impl<S> Peer<S> {
    fn new(side: Side) -> Self {
        Self {
            side,
            stream: None,
            addr: None,
            inbound: PacketQueue::new(),
            pipe: None,
            pending: 0,
            eof: false,
            error: false,
            blocked: false,
            write_shut: false,
            connecting: false,
            registered: Readiness::NONE,
        }
    }

    /// Connected, healthy and able to take sends.
    fn writable(&self) -> bool {
        self.stream.is_some() && !self.connecting && !self.error && !self.write_shut
    }

    fn set_blocked(&mut self, blocked: bool, stats: &Stats) {
        if self.blocked == blocked {
            return;
        }
        self.blocked = blocked;
        if blocked {
            stats.direction_blocked();
        } else {
            stats.direction_unblocked();
        }
    }
}

/// One client-backend relay.
#[derive(Debug)]
pub struct Session<S> {
    id: SessionId,
    peers: [Peer<S>; 2],
    splice: bool,
    /// Packets acquired from the pool and not yet released.
    outstanding: usize,
    closing: bool,
    /// Direction served first on the next pass.
    first: Side,
}

impl<S: NonBlockingStream> Session<S> {
    /// Session for a freshly accepted client.
    pub fn new(id: SessionId, client: S, client_addr: Option<SocketAddr>) -> Self {
        let mut peers = [Peer::new(Side::Client), Peer::new(Side::Backend)];
        peers[0].stream = Some(client);
        peers[0].addr = client_addr;
        Self {
            id,
            peers,
            splice: false,
            outstanding: 0,
            closing: false,
            first: Side::Client,
        }
    }

    /// Switch to kernel-side relaying through one pipe per direction.
    /// Must be called before any byte moves.
    pub fn enable_splice(&mut self) -> Result<(), RelayError> {
        if self.peer(Side::Client).stream.as_ref().and_then(|s| s.raw_fd()).is_none() {
            return Err(RelayError::ZeroCopyUnavailable);
        }
        for peer in &mut self.peers {
            peer.pipe = Some(SplicePipe::new()?);
        }
        self.splice = true;
        Ok(())
    }

    /// Attach a dialed backend. `pending` is true while its connect is in flight.
    pub fn attach_backend(
        &mut self,
        stream: S,
        addr: SocketAddr,
        pending: bool,
    ) -> Result<(), RelayError> {
        if self.splice && stream.raw_fd().is_none() {
            return Err(RelayError::ZeroCopyUnavailable);
        }
        let id = self.id;
        let backend = self.peer_mut(Side::Backend);
        if backend.stream.is_some() {
            return Err(RelayError::InvariantViolation(format!(
                "session {id} already has a backend"
            )));
        }
        backend.stream = Some(stream);
        backend.addr = Some(addr);
        backend.connecting = pending;
        debug!(session_id = %id, backend_addr = %addr, pending, "Backend attached");
        Ok(())
    }

    /// Check an in-flight backend connect. Returns true once connected.
    pub fn poll_connect(&mut self) -> Result<bool, RelayError> {
        let id = self.id;
        let backend = self.peer_mut(Side::Backend);
        if !backend.connecting {
            return Ok(backend.stream.is_some());
        }
        let Some(stream) = backend.stream.as_mut() else {
            return Ok(false);
        };
        match stream.connect_status() {
            ConnectStatus::Connected => {
                backend.connecting = false;
                debug!(session_id = %id, backend_addr = ?backend.addr, "Backend connected");
                Ok(true)
            }
            ConnectStatus::Pending => Ok(false),
            ConnectStatus::Failed(source) => {
                backend.error = true;
                match backend.addr {
                    Some(addr) => Err(RelayError::BackendDialFailed { addr, source }),
                    None => Err(RelayError::InvariantViolation(format!(
                        "session {id} connecting without a backend address"
                    ))),
                }
            }
        }
    }

    /// Move as many bytes as the sockets allow, in both directions.
    ///
    /// On error the session is marked closing and the error is returned for
    /// the caller to log; the session must then be torn down.
    pub fn drive(
        &mut self,
        pool: &mut PacketPool,
        stats: &Stats,
        limits: &SessionLimits,
    ) -> Result<Drive, RelayError> {
        if self.closing {
            return Ok(Drive::Idle);
        }
        match self.pump(pool, stats, limits) {
            Ok(drive) => {
                self.settle(stats);
                Ok(drive)
            }
            Err(err) => {
                self.fail(&err, stats);
                Err(err)
            }
        }
    }

    fn pump(
        &mut self,
        pool: &mut PacketPool,
        stats: &Stats,
        limits: &SessionLimits,
    ) -> Result<Drive, RelayError> {
        self.poll_connect()?;

        for _ in 0..MAX_DRIVE_PASSES {
            let order = [self.first, self.first.peer()];
            self.first = self.first.peer();

            let mut progress = false;
            for src in order {
                progress |= self.relay(src, pool, stats, limits)?;
            }
            if !progress {
                return Ok(Drive::Idle);
            }
        }
        Ok(Drive::Yielded)
    }

    /// One direction: bytes read from `src` go to its peer.
    fn relay(
        &mut self,
        src: Side,
        pool: &mut PacketPool,
        stats: &Stats,
        limits: &SessionLimits,
    ) -> Result<bool, RelayError> {
        let id = self.id;
        let splice = self.splice;
        let outstanding = &mut self.outstanding;
        let [client, backend] = &mut self.peers;
        let (src, dst) = match src {
            Side::Client => (client, backend),
            Side::Backend => (backend, client),
        };

        if splice {
            return relay_splice(id, src, dst, stats, limits);
        }

        let mut progress = flush(id, src, dst, outstanding, pool, stats)?;
        progress |= fill(id, src, dst, outstanding, pool, stats, limits)?;
        progress |= flush(id, src, dst, outstanding, pool, stats)?;
        Ok(progress)
    }

    /// Apply half-close and close rules after a successful pump.
    fn settle(&mut self, stats: &Stats) {
        let id = self.id;
        // Zero-copy sessions close outright once a pipe drains after EOF.
        for side in Side::BOTH {
            if self.splice {
                break;
            }
            let [client, backend] = &mut self.peers;
            let (src, dst) = match side {
                Side::Client => (client, backend),
                Side::Backend => (backend, client),
            };
            if !(src.eof && src.pending == 0 && dst.writable()) {
                continue;
            }
            dst.write_shut = true;
            if let Some(stream) = dst.stream.as_mut() {
                match stream.shutdown_write() {
                    Ok(()) => debug!(session_id = %id, side = %dst.side, "Write side shut"),
                    Err(e) => {
                        debug!(session_id = %id, side = %dst.side, error = %e, "Shutdown failed");
                        dst.error = true;
                        stats.record_error(dst.side);
                    }
                }
            }
        }

        let client = self.peer(Side::Client);
        let backend = self.peer(Side::Backend);
        let drained = |peer: &Peer<S>| peer.eof && peer.pending == 0;

        let reason = if client.error || backend.error {
            Some("peer_error")
        } else if drained(client) && drained(backend) {
            Some("both_closed")
        } else if drained(client) && backend.stream.is_none() {
            Some("client_closed_before_backend")
        } else if self.splice && (drained(client) || drained(backend)) {
            Some("pipe_drained_after_close")
        } else {
            None
        };
        if let Some(reason) = reason {
            debug!(session_id = %id, reason, "Session closing");
            self.closing = true;
        }
    }

    /// Mark the session closing because of `err` and count it.
    pub fn fail(&mut self, err: &RelayError, stats: &Stats) {
        self.closing = true;
        match err {
            RelayError::BackendDialFailed { .. } => {
                stats.backend_dial_failed.fetch_add(1, Ordering::Relaxed);
            }
            RelayError::PoolExhausted => {
                stats.pool_exhausted.fetch_add(1, Ordering::Relaxed);
            }
            RelayError::PeerRead { side, .. } | RelayError::PeerWrite { side, .. } => {
                stats.record_error(*side);
            }
            RelayError::InvariantViolation(_) => invariant_violated(err),
            _ => {}
        }
    }

    /// The reactor reported an error condition on `side`'s socket. Fails the
    /// session with the socket's pending error, whether or not a read or send
    /// would have surfaced it.
    pub fn socket_error(&mut self, side: Side, stats: &Stats) -> RelayError {
        let peer = self.peer_mut(side);
        let source = match peer.stream.as_mut().map(|s| s.connect_status()) {
            Some(ConnectStatus::Failed(e)) => e,
            _ => io::Error::other("error condition reported on socket"),
        };
        peer.error = true;
        let err = match (side, peer.connecting, peer.addr) {
            (Side::Backend, true, Some(addr)) => RelayError::BackendDialFailed { addr, source },
            _ => RelayError::PeerRead { side, source },
        };
        self.fail(&err, stats);
        err
    }

    /// Release every packet and drop both sockets.
    ///
    /// Returns an invariant violation if packets were still unaccounted for.
    pub fn teardown(self, pool: &mut PacketPool, stats: &Stats) -> Result<(), RelayError> {
        let Session {
            id,
            peers,
            mut outstanding,
            ..
        } = self;

        let mut result = Ok(());
        for mut peer in peers {
            peer.set_blocked(false, stats);
            for packet in peer.inbound.drain() {
                match pool.release(packet) {
                    Ok(()) => outstanding = outstanding.saturating_sub(1),
                    Err(e) => result = Err(RelayError::from(e)),
                }
            }
        }
        result?;

        if outstanding != 0 {
            return Err(RelayError::InvariantViolation(format!(
                "session {id} freed with {outstanding} outstanding packets"
            )));
        }
        Ok(())
    }

    /// Interest the sockets need given the current state.
    pub fn desired(&self, side: Side) -> Readiness {
        let peer = self.peer(side);
        if self.closing || peer.stream.is_none() || peer.error {
            return Readiness::NONE;
        }
        if peer.connecting {
            return Readiness {
                readable: false,
                writable: true,
            };
        }
        Readiness {
            readable: !peer.eof && !self.peer(side.peer()).blocked,
            writable: peer.blocked,
        }
    }

    pub fn registered(&self, side: Side) -> Readiness {
        self.peer(side).registered
    }

    pub fn set_registered(&mut self, side: Side, interest: Readiness) {
        self.peer_mut(side).registered = interest;
    }

    pub fn stream_mut(&mut self, side: Side) -> Option<&mut S> {
        self.peer_mut(side).stream.as_mut()
    }

    /// Client bytes are waiting and no backend has been dialed yet.
    pub fn needs_backend(&self) -> bool {
        let backend = self.peer(Side::Backend);
        !self.closing
            && backend.stream.is_none()
            && !backend.error
            && self.peer(Side::Client).pending > 0
    }

    pub fn state(&self) -> SessionState {
        let client = self.peer(Side::Client);
        let backend = self.peer(Side::Backend);
        if self.closing {
            return SessionState::Closing;
        }
        if backend.stream.is_none() {
            return SessionState::Accepting;
        }
        if backend.connecting {
            return SessionState::Connecting;
        }
        match (client.blocked, backend.blocked) {
            (true, true) => SessionState::BothBlocked,
            (true, false) => SessionState::ClientBlocked,
            (false, true) => SessionState::BackendBlocked,
            (false, false) => SessionState::Relaying,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn is_splice(&self) -> bool {
        self.splice
    }

    /// Bytes read from `side` and not yet delivered to its peer.
    pub fn pending_bytes(&self, side: Side) -> usize {
        self.peer(side).pending
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn addr(&self, side: Side) -> Option<SocketAddr> {
        self.peer(side).addr
    }

    fn peer(&self, side: Side) -> &Peer<S> {
        &self.peers[side.index()]
    }

    fn peer_mut(&mut self, side: Side) -> &mut Peer<S> {
        &mut self.peers[side.index()]
    }
}

// ============================================================================
// Copy path
// ============================================================================

fn acquire(pool: &mut PacketPool, outstanding: &mut usize) -> Result<Packet, RelayError> {
    let packet = pool.acquire()?;
    *outstanding += 1;
    Ok(packet)
}

fn release(
    pool: &mut PacketPool,
    outstanding: &mut usize,
    packet: Packet,
) -> Result<(), RelayError> {
    pool.release(packet)?;
    *outstanding -= 1;
    Ok(())
}

/// Seal the packet being filled: queue it if it holds bytes, else return it.
fn seal<S>(
    src: &mut Peer<S>,
    packet: Packet,
    pool: &mut PacketPool,
    outstanding: &mut usize,
) -> Result<(), RelayError> {
    if pool.is_empty(&packet) {
        release(pool, outstanding, packet)
    } else {
        src.inbound.push_tail(packet);
        Ok(())
    }
}

/// Send queued bytes from `src` to `dst`, blocked packet first.
fn flush<S: NonBlockingStream>(
    id: SessionId,
    src: &mut Peer<S>,
    dst: &mut Peer<S>,
    outstanding: &mut usize,
    pool: &mut PacketPool,
    stats: &Stats,
) -> Result<bool, RelayError> {
    if !dst.writable() {
        return Ok(false);
    }
    let Some(stream) = dst.stream.as_mut() else {
        return Ok(false);
    };

    let mut progress = false;
    while let Some(packet) = src.inbound.next_to_send() {
        let unsent = pool.unsent(&packet);
        if unsent.is_empty() {
            release(pool, outstanding, packet)?;
            continue;
        }
        match stream.send(unsent) {
            Ok(n) => {
                if n > 0 {
                    pool.advance(&packet, n);
                    src.pending -= n;
                    stats.record_send(dst.side, n);
                    progress = true;
                }
                if pool.is_drained(&packet) {
                    release(pool, outstanding, packet)?;
                    continue;
                }
                src.inbound.park_blocked(packet);
                if !dst.blocked {
                    debug!(session_id = %id, side = %dst.side, pending = src.pending, "Destination blocked");
                }
                dst.set_blocked(true, stats);
                return Ok(progress);
            }
            Err(source) => {
                src.inbound.park_blocked(packet);
                dst.error = true;
                return Err(RelayError::PeerWrite {
                    side: dst.side,
                    source,
                });
            }
        }
    }

    if dst.blocked {
        debug!(session_id = %id, side = %dst.side, "Destination drained");
    }
    dst.set_blocked(false, stats);
    Ok(progress)
}

/// Read from `src` into its queue until it would block, closes, or the
/// pending ceiling is reached. Stops while `dst` is blocked.
fn fill<S: NonBlockingStream>(
    id: SessionId,
    src: &mut Peer<S>,
    dst: &mut Peer<S>,
    outstanding: &mut usize,
    pool: &mut PacketPool,
    stats: &Stats,
    limits: &SessionLimits,
) -> Result<bool, RelayError> {
    let mut progress = false;
    loop {
        if src.eof || src.error || src.connecting || dst.blocked {
            break;
        }
        let room = limits.max_pending_bytes.saturating_sub(src.pending);
        if room == 0 {
            break;
        }
        let Some(stream) = src.stream.as_mut() else {
            break;
        };

        let packet = match src.inbound.take_current() {
            Some(packet) => packet,
            None => acquire(pool, outstanding)?,
        };
        let spare = pool.spare_mut(&packet);
        let want = spare.len().min(room);

        match stream.recv(&mut spare[..want]) {
            Ok(Recv::Data(n)) => {
                pool.commit(&packet, n);
                src.pending += n;
                stats.record_recv(src.side, n);
                progress = true;
                if pool.is_full(&packet) {
                    src.inbound.push_tail(packet);
                } else {
                    src.inbound.set_current(packet);
                }
            }
            Ok(Recv::WouldBlock) => {
                seal(src, packet, pool, outstanding)?;
                return Ok(progress);
            }
            Ok(Recv::Closed) => {
                seal(src, packet, pool, outstanding)?;
                src.eof = true;
                stats.record_close(src.side);
                debug!(session_id = %id, side = %src.side, pending = src.pending, "Peer closed");
                return Ok(true);
            }
            Err(source) => {
                seal(src, packet, pool, outstanding)?;
                src.error = true;
                return Err(RelayError::PeerRead {
                    side: src.side,
                    source,
                });
            }
        }
    }

    // Stopped at the ceiling with a partly filled packet: queue it for sending.
    if let Some(packet) = src.inbound.take_current() {
        seal(src, packet, pool, outstanding)?;
    }
    Ok(progress)
}

// ============================================================================
// Zero-copy path
// ============================================================================

/// Move bytes from `src` to `dst` through the source's pipe.
fn relay_splice<S: NonBlockingStream>(
    id: SessionId,
    src: &mut Peer<S>,
    dst: &mut Peer<S>,
    stats: &Stats,
    limits: &SessionLimits,
) -> Result<bool, RelayError> {
    let Some(pipe) = src.pipe.as_mut() else {
        return Err(RelayError::ZeroCopyUnavailable);
    };
    let src_fd = src.stream.as_ref().and_then(|s| s.raw_fd());
    let dst_fd = if dst.writable() {
        dst.stream.as_ref().and_then(|s| s.raw_fd())
    } else {
        None
    };

    let mut progress = false;
    loop {
        if let Some(fd) = dst_fd {
            if pipe.pending() > 0 {
                match pipe.drain_to(fd) {
                    Ok(n) => {
                        if n > 0 {
                            stats.record_send(dst.side, n);
                            progress = true;
                        }
                    }
                    Err(source) => {
                        dst.error = true;
                        src.pending = pipe.pending();
                        return Err(RelayError::PeerWrite {
                            side: dst.side,
                            source,
                        });
                    }
                }
                if pipe.pending() > 0 && !dst.blocked {
                    debug!(session_id = %id, side = %dst.side, pending = pipe.pending(), "Destination blocked");
                }
                dst.set_blocked(pipe.pending() > 0, stats);
            }
        }
        src.pending = pipe.pending();

        let Some(fd) = src_fd else {
            return Ok(progress);
        };
        let room = limits.max_pending_bytes.saturating_sub(pipe.pending());
        if src.eof || src.error || dst.blocked || room == 0 {
            return Ok(progress);
        }

        match pipe.fill_from(fd, room.min(SPLICE_CHUNK)) {
            Ok(Moved::Bytes(n)) => {
                stats.record_recv(src.side, n);
                src.pending = pipe.pending();
                progress = true;
            }
            Ok(Moved::WouldBlock) => return Ok(progress),
            Ok(Moved::Closed) => {
                src.eof = true;
                stats.record_close(src.side);
                debug!(session_id = %id, side = %src.side, pending = pipe.pending(), "Peer closed");
                return Ok(true);
            }
            Err(source) => {
                src.error = true;
                return Err(RelayError::PeerRead {
                    side: src.side,
                    source,
                });
            }
        }
    }
}
