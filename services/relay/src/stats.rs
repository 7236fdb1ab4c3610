//! Process-wide relay statistics.
//!
//! Plain atomic counters shared by every worker. Reads never block the data
//! path; a [`StatsSnapshot`] is a consistent-enough copy for operators.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::session::Side;

/// Statistics for a relay process.
#[derive(Debug, Default)]
pub struct Stats {
    /// Connections admitted as sessions.
    pub connections_accepted: AtomicU64,
    /// Connections closed at accept because of the session ceiling or a full inbox.
    pub connections_rejected: AtomicU64,
    /// Sessions currently alive.
    pub sessions_live: AtomicU64,
    /// Sessions torn down.
    pub sessions_freed: AtomicU64,
    /// Backend connects that failed.
    pub backend_dial_failed: AtomicU64,
    /// Sessions torn down because the packet pool could not grow.
    pub pool_exhausted: AtomicU64,
    /// Directions currently blocked on a slow destination.
    pub blocked_directions: AtomicU64,
    /// Bytes received from clients.
    pub client_bytes_received: AtomicU64,
    /// Bytes sent to clients.
    pub client_bytes_sent: AtomicU64,
    /// Bytes received from backends.
    pub backend_bytes_received: AtomicU64,
    /// Bytes sent to backends.
    pub backend_bytes_sent: AtomicU64,
    /// Clients that closed their write side.
    pub client_closed: AtomicU64,
    /// Backends that closed their write side.
    pub backend_closed: AtomicU64,
    /// Client socket errors.
    pub client_errors: AtomicU64,
    /// Backend socket errors.
    pub backend_errors: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one more live session unless `max` are already alive.
    pub fn try_admit(&self, max: usize) -> bool {
        self.sessions_live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < max as u64).then_some(live + 1)
            })
            .is_ok()
    }

    /// Undo an admission whose session never came to life.
    pub fn revoke_admission(&self) {
        self.sessions_live.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn session_freed(&self) {
        self.sessions_live.fetch_sub(1, Ordering::AcqRel);
        self.sessions_freed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recv(&self, side: Side, bytes: usize) {
        let counter = match side {
            Side::Client => &self.client_bytes_received,
            Side::Backend => &self.backend_bytes_received,
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_send(&self, side: Side, bytes: usize) {
        let counter = match side {
            Side::Client => &self.client_bytes_sent,
            Side::Backend => &self.backend_bytes_sent,
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_close(&self, side: Side) {
        let counter = match side {
            Side::Client => &self.client_closed,
            Side::Backend => &self.backend_closed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, side: Side) {
        let counter = match side {
            Side::Client => &self.client_errors,
            Side::Backend => &self.backend_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn direction_blocked(&self) {
        self.blocked_directions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn direction_unblocked(&self) {
        self.blocked_directions.fetch_sub(1, Ordering::Relaxed);
    }

    /// Copy every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            connections_accepted: load(&self.connections_accepted),
            connections_rejected: load(&self.connections_rejected),
            sessions_live: load(&self.sessions_live),
            sessions_freed: load(&self.sessions_freed),
            backend_dial_failed: load(&self.backend_dial_failed),
            pool_exhausted: load(&self.pool_exhausted),
            blocked_directions: load(&self.blocked_directions),
            client_bytes_received: load(&self.client_bytes_received),
            client_bytes_sent: load(&self.client_bytes_sent),
            backend_bytes_received: load(&self.backend_bytes_received),
            backend_bytes_sent: load(&self.backend_bytes_sent),
            client_closed: load(&self.client_closed),
            backend_closed: load(&self.backend_closed),
            client_errors: load(&self.client_errors),
            backend_errors: load(&self.backend_errors),
        }
    }
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub sessions_live: u64,
    pub sessions_freed: u64,
    pub backend_dial_failed: u64,
    pub pool_exhausted: u64,
    pub blocked_directions: u64,
    pub client_bytes_received: u64,
    pub client_bytes_sent: u64,
    pub backend_bytes_received: u64,
    pub backend_bytes_sent: u64,
    pub client_closed: u64,
    pub backend_closed: u64,
    pub client_errors: u64,
    pub backend_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_stops_at_ceiling() {
        let stats = Stats::new();
        assert!(stats.try_admit(2));
        assert!(stats.try_admit(2));
        assert!(!stats.try_admit(2));
        assert_eq!(stats.sessions_live.load(Ordering::Relaxed), 2);

        stats.session_freed();
        assert!(stats.try_admit(2));
        assert_eq!(stats.snapshot().sessions_freed, 1);
    }

    #[test]
    fn test_per_side_counters() {
        let stats = Stats::new();
        stats.record_recv(Side::Client, 9);
        stats.record_send(Side::Backend, 9);
        stats.record_recv(Side::Backend, 19);
        stats.record_send(Side::Client, 19);
        stats.record_close(Side::Backend);
        stats.record_error(Side::Client);

        let snap = stats.snapshot();
        assert_eq!(snap.client_bytes_received, 9);
        assert_eq!(snap.backend_bytes_sent, 9);
        assert_eq!(snap.backend_bytes_received, 19);
        assert_eq!(snap.client_bytes_sent, 19);
        assert_eq!(snap.backend_closed, 1);
        assert_eq!(snap.client_errors, 1);
    }

    #[test]
    fn test_snapshot_serializes_to_json() {
        let stats = Stats::new();
        stats.connections_accepted.fetch_add(3, Ordering::Relaxed);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["connections_accepted"], 3);
        assert_eq!(json["sessions_live"], 0);
    }
}
