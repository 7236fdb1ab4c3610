//! Worker event loop.
//!
//! A worker is one thread running one reactor. It owns its packet pool,
//! session table, backend policy and every session it accepted; nothing here
//! is shared except the statistics block and the shutdown flag.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use tcprelay_networking::{
    accept_nonblocking, connect_nonblocking, set_nodelay, set_quickack, Accepted, NetError,
};
use tracing::{debug, error, info, info_span, warn};

use super::backend::BackendPolicy;
use super::dispatch::Inbox;
use crate::config::{ConnectOn, ProxyConfig, ZeroCopyMode};
use crate::error::{invariant_violated, RelayError};
use crate::pool::{PacketPool, PoolConfig};
use crate::reactor::{Reactor, ReadyEvent, Tag};
use crate::session::{Drive, Readiness, Session, SessionId, SessionLimits, SessionTable, Side};
use crate::stats::Stats;

/// Where a worker gets new connections from.
#[derive(Debug)]
enum Intake {
    /// Accepts on its own copy of the shared listening socket.
    Listener(TcpListener),
    /// Receives connections accepted by the dispatcher.
    Inbox(Arc<Inbox>),
}

#[derive(Debug)]
pub(crate) struct Worker {
    index: usize,
    reactor: Reactor,
    intake: Intake,
    sessions: SessionTable<Session<TcpStream>>,
    pool: PacketPool,
    policy: BackendPolicy,
    limits: SessionLimits,
    connect_on: ConnectOn,
    splice: bool,
    max_sessions: usize,
    accept_batch: usize,
    poll_timeout: Duration,
    stats: Arc<Stats>,
    shutdown: Arc<AtomicBool>,
    /// Accepts may be pending without a new readiness edge.
    accept_backlog: bool,
    /// The last accept failed hard; retry after a full poll timeout.
    accept_stalled: bool,
    /// Sessions that hit the pass limit and must be driven again.
    yielded: VecDeque<SessionId>,
    events: Vec<ReadyEvent>,
}

impl Worker {
    /// Worker accepting on a shared listening socket.
    pub(crate) fn with_listener(
        index: usize,
        mut listener: TcpListener,
        config: &ProxyConfig,
        stats: Arc<Stats>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, RelayError> {
        let reactor = Reactor::new()?;
        reactor.register(
            &mut listener,
            Tag::Listener,
            Readiness {
                readable: true,
                writable: false,
            },
        )?;
        Self::new(index, reactor, Intake::Listener(listener), config, stats, shutdown)
    }

    /// Worker fed by the dispatcher. Returns the inbox to hand connections to.
    pub(crate) fn with_inbox(
        index: usize,
        config: &ProxyConfig,
        stats: Arc<Stats>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<(Self, Arc<Inbox>), RelayError> {
        let reactor = Reactor::new()?;
        let inbox = Arc::new(Inbox::new(config.inbox_capacity, reactor.waker()?));
        let worker = Self::new(
            index,
            reactor,
            Intake::Inbox(Arc::clone(&inbox)),
            config,
            stats,
            shutdown,
        )?;
        Ok((worker, inbox))
    }

    fn new(
        index: usize,
        reactor: Reactor,
        intake: Intake,
        config: &ProxyConfig,
        stats: Arc<Stats>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, RelayError> {
        let policy = BackendPolicy::new(config.listen, config.backends.clone())?;
        let pool = PacketPool::new(PoolConfig {
            packet_size: config.packet_size,
            cache_capacity: config.cache_capacity,
            max_packets: None,
        });
        Ok(Self {
            index,
            reactor,
            intake,
            sessions: SessionTable::new(),
            pool,
            policy,
            limits: SessionLimits {
                max_pending_bytes: config.max_pending_bytes,
            },
            connect_on: config.effective_connect_on(),
            splice: config.zero_copy == ZeroCopyMode::Splice,
            max_sessions: config.max_sessions,
            accept_batch: config.accept_batch.max(1),
            poll_timeout: config.poll_timeout,
            stats,
            shutdown,
            // Clients may have connected before the listener was registered.
            accept_backlog: true,
            accept_stalled: false,
            yielded: VecDeque::new(),
            events: Vec::new(),
        })
    }

    /// Run until the shutdown flag is set.
    pub(crate) fn run(mut self) {
        let span = info_span!("worker", index = self.index);
        let _enter = span.enter();
        info!(
            backends = self.policy.len(),
            splice = self.splice,
            "Worker started"
        );

        while !self.shutdown.load(Ordering::Acquire) {
            if let Err(e) = self.turn() {
                error!(error = %e, "Reactor poll failed");
                break;
            }
        }

        info!(
            sessions = self.sessions.len(),
            pool_allocated = self.pool.allocated(),
            "Worker stopped"
        );
    }

    /// One loop iteration: wait, route events, resume leftovers.
    fn turn(&mut self) -> io::Result<()> {
        let resume_accepts = self.accept_backlog && !self.accept_stalled;
        let timeout = if resume_accepts || !self.yielded.is_empty() {
            Duration::ZERO
        } else {
            self.poll_timeout
        };

        let mut events = std::mem::take(&mut self.events);
        events.clear();
        self.reactor.poll(Some(timeout), &mut events)?;
        for event in &events {
            self.dispatch(*event);
        }
        self.events = events;

        if self.accept_backlog {
            self.accept_batch();
        }
        for id in std::mem::take(&mut self.yielded) {
            self.service(id);
        }
        Ok(())
    }

    fn dispatch(&mut self, event: ReadyEvent) {
        match event.tag {
            Tag::Listener | Tag::Inbox => self.accept_backlog = true,
            Tag::Session { id, side } => {
                if event.error {
                    self.socket_error(id, side);
                } else if event.readable || event.writable {
                    self.service(id);
                }
            }
        }
    }

    /// Close a session whose socket reported an error condition.
    fn socket_error(&mut self, id: SessionId, side: Side) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        if session.is_closing() {
            return;
        }
        let err = session.socket_error(side, &self.stats);
        debug!(
            session_id = %id,
            side = %side,
            reason = err.reason_code(),
            error = %err,
            "Socket error event"
        );
        self.sync_interest(id);
    }

    /// Take up to `accept_batch` new connections.
    fn accept_batch(&mut self) {
        self.accept_stalled = false;
        for _ in 0..self.accept_batch {
            let next = match &self.intake {
                Intake::Listener(listener) => match accept_nonblocking(listener) {
                    Ok(Accepted::Stream(stream, peer)) => Some((stream, peer)),
                    Ok(Accepted::WouldBlock) => None,
                    Err(e) => {
                        // The backlog is still queued; no new edge will report it.
                        warn!(error = %e, "Accept failed");
                        self.accept_stalled = true;
                        return;
                    }
                },
                Intake::Inbox(inbox) => inbox.pop(),
            };
            let Some((stream, peer)) = next else {
                self.accept_backlog = false;
                return;
            };
            self.admit(stream, peer);
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        if !self.stats.try_admit(self.max_sessions) {
            self.stats
                .connections_rejected
                .fetch_add(1, Ordering::Relaxed);
            let err = RelayError::CapacityExceeded {
                max: self.max_sessions,
            };
            warn!(peer_addr = %peer, reason = err.reason_code(), "Connection rejected: max sessions reached");
            return;
        }
        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);

        if let Err(e) = set_nodelay(&stream).and_then(|()| set_quickack(&stream)) {
            debug!(peer_addr = %peer, error = %e, "Socket option not applied");
        }

        let splice = self.splice;
        let inserted = self.sessions.try_insert_with(|id| {
            let mut session = Session::new(id, stream, Some(peer));
            if splice {
                session.enable_splice()?;
            }
            Ok::<_, RelayError>(session)
        });
        let id = match inserted {
            Ok(id) => id,
            Err(err) => {
                self.stats.revoke_admission();
                warn!(peer_addr = %peer, reason = err.reason_code(), error = %err, "Session setup failed");
                return;
            }
        };
        debug!(session_id = %id, peer_addr = %peer, "Session accepted");

        if self.connect_on == ConnectOn::Accept {
            self.dial(id);
        }
        self.service(id);
    }

    /// Dial the next backend for a session.
    fn dial(&mut self, id: SessionId) {
        let addr = self.policy.next();
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };

        let result = connect_nonblocking(addr)
            .map_err(|e| match e {
                NetError::Connect { addr, source } => {
                    RelayError::BackendDialFailed { addr, source }
                }
                other => RelayError::Net(other),
            })
            .and_then(|(stream, pending)| {
                if let Err(e) = set_nodelay(&stream) {
                    debug!(session_id = %id, error = %e, "Socket option not applied");
                }
                session.attach_backend(stream, addr, pending)
            });

        match result {
            Ok(()) => debug!(session_id = %id, backend_addr = %addr, "Dialing backend"),
            Err(err) => {
                warn!(
                    session_id = %id,
                    backend_addr = %addr,
                    reason = err.reason_code(),
                    error = %err,
                    "Backend dial failed"
                );
                session.fail(&err, &self.stats);
            }
        }
    }

    fn drive(&mut self, id: SessionId) -> Option<Result<Drive, RelayError>> {
        let session = self.sessions.get_mut(id)?;
        Some(session.drive(&mut self.pool, &self.stats, &self.limits))
    }

    /// Drive a session, dial its backend when due, then settle its interest.
    fn service(&mut self, id: SessionId) {
        let mut outcome = self.drive(id);
        if matches!(outcome, Some(Ok(_))) && self.sessions.get(id).is_some_and(Session::needs_backend)
        {
            self.dial(id);
            outcome = self.drive(id);
        }

        match outcome {
            None => return,
            Some(Ok(Drive::Idle)) => {}
            Some(Ok(Drive::Yielded)) => self.yielded.push_back(id),
            Some(Err(err)) => match err.side() {
                Some(side) => debug!(
                    session_id = %id,
                    side = %side,
                    reason = err.reason_code(),
                    error = %err,
                    "Session failed"
                ),
                None => warn!(
                    session_id = %id,
                    reason = err.reason_code(),
                    error = %err,
                    "Session failed"
                ),
            },
        }
        self.sync_interest(id);
    }

    /// Bring reactor registrations in line with what the session needs, or
    /// close it.
    fn sync_interest(&mut self, id: SessionId) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        if !session.is_closing() {
            for side in Side::BOTH {
                let current = session.registered(side);
                let desired = session.desired(side);
                if current == desired {
                    continue;
                }
                let Some(stream) = session.stream_mut(side) else {
                    continue;
                };
                match self
                    .reactor
                    .update(stream, Tag::Session { id, side }, current, desired)
                {
                    Ok(()) => session.set_registered(side, desired),
                    Err(e) => {
                        let err = RelayError::Io(e);
                        warn!(session_id = %id, side = %side, error = %err, "Registration failed");
                        session.fail(&err, &self.stats);
                        break;
                    }
                }
            }
        }
        if session.is_closing() {
            self.close(id);
        }
    }

    /// Deregister, release every packet and free the session.
    fn close(&mut self, id: SessionId) {
        let Some(mut session) = self.sessions.remove(id) else {
            return;
        };
        for side in Side::BOTH {
            if session.registered(side).is_none() {
                continue;
            }
            if let Some(stream) = session.stream_mut(side) {
                if let Err(e) = self.reactor.unregister(stream) {
                    debug!(session_id = %id, side = %side, error = %e, "Deregister failed");
                }
            }
            session.set_registered(side, Readiness::NONE);
        }

        let client = session.addr(Side::Client);
        let backend = session.addr(Side::Backend);
        if let Err(err) = session.teardown(&mut self.pool, &self.stats) {
            invariant_violated(&err);
        }
        self.stats.session_freed();
        debug!(
            session_id = %id,
            client_addr = ?client,
            backend_addr = ?backend,
            live = self.sessions.len(),
            "Session freed"
        );
    }
}
