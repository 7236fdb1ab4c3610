//! Readiness multiplexer.
//!
//! Thin wrapper over `mio::Poll`. Every registration carries a [`Tag`]
//! encoded in the token, so the worker routes events without a lookup table.
//! Registrations are edge-triggered.

use std::io;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::session::{Readiness, SessionId, Side};

/// Events fetched per wait.
pub const EVENT_CAPACITY: usize = 1024;

const LISTENER_TOKEN: usize = 0;
const INBOX_TOKEN: usize = 1;
const FIRST_SESSION_TOKEN: usize = 2;

/// What a readiness event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Listener,
    Inbox,
    Session { id: SessionId, side: Side },
}

impl Tag {
    pub fn token(self) -> Token {
        match self {
            Tag::Listener => Token(LISTENER_TOKEN),
            Tag::Inbox => Token(INBOX_TOKEN),
            Tag::Session { id, side } => {
                Token(FIRST_SESSION_TOKEN + id.index() * 2 + side.index())
            }
        }
    }

    pub fn from_token(token: Token) -> Tag {
        match token.0 {
            LISTENER_TOKEN => Tag::Listener,
            INBOX_TOKEN => Tag::Inbox,
            n => {
                let n = n - FIRST_SESSION_TOKEN;
                let side = if n % 2 == 0 { Side::Client } else { Side::Backend };
                Tag::Session {
                    id: SessionId::new(n / 2),
                    side,
                }
            }
        }
    }
}

/// One readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub tag: Tag,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

fn interest(readiness: Readiness) -> Option<Interest> {
    match (readiness.readable, readiness.writable) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

fn empty_interest() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "empty readiness interest")
}

pub struct Reactor {
    poll: Poll,
    events: Events,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
        })
    }

    pub fn register<S>(&self, source: &mut S, tag: Tag, readiness: Readiness) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        let interest = interest(readiness).ok_or_else(empty_interest)?;
        self.poll.registry().register(source, tag.token(), interest)
    }

    pub fn modify<S>(&self, source: &mut S, tag: Tag, readiness: Readiness) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        let interest = interest(readiness).ok_or_else(empty_interest)?;
        self.poll.registry().reregister(source, tag.token(), interest)
    }

    pub fn unregister<S>(&self, source: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().deregister(source)
    }

    /// Move a registration from `current` to `desired` interest.
    pub fn update<S>(
        &self,
        source: &mut S,
        tag: Tag,
        current: Readiness,
        desired: Readiness,
    ) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        if current == desired {
            return Ok(());
        }
        match (current.is_none(), desired.is_none()) {
            (true, false) => self.register(source, tag, desired),
            (false, false) => self.modify(source, tag, desired),
            (false, true) => self.unregister(source),
            (true, true) => Ok(()),
        }
    }

    /// Waker that raises an [`Tag::Inbox`] event on this reactor.
    pub fn waker(&self) -> io::Result<Waker> {
        Waker::new(self.poll.registry(), Tag::Inbox.token())
    }

    /// Wait up to `timeout` and append what became ready to `out`.
    pub fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<ReadyEvent>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }
        out.extend(self.events.iter().map(|event| ReadyEvent {
            tag: Tag::from_token(event.token()),
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable() || event.is_write_closed(),
            error: event.is_error(),
        }));
        Ok(())
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const READ: Readiness = Readiness {
        readable: true,
        writable: false,
    };

    #[test]
    fn test_session_tags_survive_the_token() {
        let tag = Tag::Session {
            id: SessionId::new(41),
            side: Side::Backend,
        };
        assert_eq!(Tag::from_token(tag.token()), tag);
        assert_eq!(Tag::from_token(Tag::Listener.token()), Tag::Listener);
        assert_eq!(Tag::from_token(Tag::Inbox.token()), Tag::Inbox);
        assert_ne!(
            Tag::Session {
                id: SessionId::new(0),
                side: Side::Client
            }
            .token(),
            Tag::Inbox.token()
        );
    }

    #[test]
    fn test_listener_readiness_is_reported() {
        let mut reactor = Reactor::new().unwrap();
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        std_listener.set_nonblocking(true).unwrap();
        let addr = std_listener.local_addr().unwrap();
        let mut listener = mio::net::TcpListener::from_std(std_listener);
        reactor.register(&mut listener, Tag::Listener, READ).unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"x").unwrap();

        let mut events = Vec::new();
        for _ in 0..50 {
            reactor
                .poll(Some(Duration::from_millis(100)), &mut events)
                .unwrap();
            if !events.is_empty() {
                break;
            }
        }
        assert!(events
            .iter()
            .any(|e| e.tag == Tag::Listener && e.readable));
    }

    #[test]
    fn test_waker_raises_inbox_event() {
        let mut reactor = Reactor::new().unwrap();
        let waker = reactor.waker().unwrap();
        waker.wake().unwrap();

        let mut events = Vec::new();
        reactor
            .poll(Some(Duration::from_secs(1)), &mut events)
            .unwrap();
        assert!(events.iter().any(|e| e.tag == Tag::Inbox));
    }

    #[test]
    fn test_empty_interest_is_rejected() {
        let reactor = Reactor::new().unwrap();
        let mut listener = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let err = reactor
            .register(&mut listener, Tag::Listener, Readiness::NONE)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
