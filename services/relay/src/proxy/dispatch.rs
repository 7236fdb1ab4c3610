//! Dispatch accept mode.
//!
//! One dispatcher thread owns the listening socket, accepts in batches and
//! hands each connection to the next worker's [`Inbox`] in round-robin order.
//! A full inbox closes the connection.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::Waker;
use tcprelay_networking::{accept_nonblocking, Accepted};
use tracing::{debug, error, info, info_span, warn};

use crate::reactor::{Reactor, ReadyEvent, Tag};
use crate::session::Readiness;
use crate::stats::Stats;

type Handoff = (TcpStream, SocketAddr);

/// Bounded handoff queue feeding one worker.
pub struct Inbox {
    queue: Mutex<VecDeque<Handoff>>,
    capacity: usize,
    waker: Waker,
}

impl Inbox {
    pub fn new(capacity: usize, waker: Waker) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            waker,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Handoff>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a connection and wake the worker. Hands the connection back
    /// when the inbox is full.
    pub fn push(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), Handoff> {
        {
            let mut queue = self.lock();
            if queue.len() >= self.capacity {
                return Err((stream, peer));
            }
            queue.push_back((stream, peer));
        }
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake worker");
        }
        Ok(())
    }

    pub fn pop(&self) -> Option<Handoff> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl std::fmt::Debug for Inbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbox")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Accepting thread for dispatch mode.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    reactor: Reactor,
    listener: TcpListener,
    inboxes: Vec<Arc<Inbox>>,
    cursor: usize,
    stats: Arc<Stats>,
    accept_batch: usize,
    poll_timeout: Duration,
    shutdown: Arc<AtomicBool>,
    backlog: bool,
    /// The last accept failed hard; retry after a full poll timeout.
    stalled: bool,
}

impl Dispatcher {
    pub(crate) fn new(
        mut listener: TcpListener,
        inboxes: Vec<Arc<Inbox>>,
        stats: Arc<Stats>,
        accept_batch: usize,
        poll_timeout: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> std::io::Result<Self> {
        let reactor = Reactor::new()?;
        reactor.register(
            &mut listener,
            Tag::Listener,
            Readiness {
                readable: true,
                writable: false,
            },
        )?;
        Ok(Self {
            reactor,
            listener,
            inboxes,
            cursor: 0,
            stats,
            accept_batch: accept_batch.max(1),
            poll_timeout,
            shutdown,
            // Connections may already be queued before registration.
            backlog: true,
            stalled: false,
        })
    }

    pub(crate) fn run(mut self) {
        let span = info_span!("dispatcher", workers = self.inboxes.len());
        let _enter = span.enter();
        info!("Dispatcher started");

        let mut events: Vec<ReadyEvent> = Vec::new();
        while !self.shutdown.load(Ordering::Acquire) {
            let timeout = if self.backlog && !self.stalled {
                Duration::ZERO
            } else {
                self.poll_timeout
            };
            events.clear();
            if let Err(e) = self.reactor.poll(Some(timeout), &mut events) {
                error!(error = %e, "Reactor poll failed");
                break;
            }
            if events.iter().any(|e| e.tag == Tag::Listener) {
                self.backlog = true;
            }
            if self.backlog {
                self.accept_batch();
            }
        }

        info!("Dispatcher stopped");
    }

    fn accept_batch(&mut self) {
        self.stalled = false;
        for _ in 0..self.accept_batch {
            match accept_nonblocking(&self.listener) {
                Ok(Accepted::Stream(stream, peer)) => self.hand_off(stream, peer),
                Ok(Accepted::WouldBlock) => {
                    self.backlog = false;
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    self.stalled = true;
                    return;
                }
            }
        }
    }

    fn hand_off(&mut self, stream: TcpStream, peer: SocketAddr) {
        let index = self.cursor;
        self.cursor = (self.cursor + 1) % self.inboxes.len().max(1);
        let Some(inbox) = self.inboxes.get(index) else {
            return;
        };
        match inbox.push(stream, peer) {
            Ok(()) => debug!(peer_addr = %peer, worker = index, "Connection dispatched"),
            Err(_rejected) => {
                self.stats
                    .connections_rejected
                    .fetch_add(1, Ordering::Relaxed);
                warn!(peer_addr = %peer, worker = index, "Connection rejected: worker inbox full");
            }
        }
    }
}
