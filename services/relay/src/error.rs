//! Error types for the relay.

use std::io;
use std::net::SocketAddr;

use tcprelay_networking::NetError;
use thiserror::Error;
use tracing::error;

use crate::config::ConfigError;
use crate::pool::PoolError;
use crate::session::Side;

/// Relay errors with standardized reason codes.
///
/// Everything except `InvariantViolation` is scoped to one session or one
/// connection: the offending session is torn down and the worker carries on.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Live-session ceiling reached; the client socket is closed.
    #[error("capacity_exceeded: {max} live sessions")]
    CapacityExceeded { max: usize },

    /// Backend connect failed before any data was exchanged.
    #[error("backend_dial_failed: {addr}: {source}")]
    BackendDialFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Receiving from a peer failed.
    #[error("peer_read_error: {side}: {source}")]
    PeerRead {
        side: Side,
        #[source]
        source: io::Error,
    },

    /// Sending to a peer failed.
    #[error("peer_write_error: {side}: {source}")]
    PeerWrite {
        side: Side,
        #[source]
        source: io::Error,
    },

    /// The packet pool could not grow.
    #[error("pool_exhausted")]
    PoolExhausted,

    /// Broken bookkeeping. Indicates a bug, never a peer's fault.
    #[error("invariant_violation: {0}")]
    InvariantViolation(String),

    /// Zero-copy relaying needs streams backed by descriptors.
    #[error("zero_copy_unavailable: stream has no descriptor")]
    ZeroCopyUnavailable,

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Socket utility failure.
    #[error("network error: {0}")]
    Net(#[from] NetError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RelayError::CapacityExceeded { .. } => "capacity_exceeded",
            RelayError::BackendDialFailed { .. } => "backend_dial_failed",
            RelayError::PeerRead { .. } => "peer_read_error",
            RelayError::PeerWrite { .. } => "peer_write_error",
            RelayError::PoolExhausted => "pool_exhausted",
            RelayError::InvariantViolation(_) => "invariant_violation",
            RelayError::ZeroCopyUnavailable => "zero_copy_unavailable",
            RelayError::Config(_) => "config_error",
            RelayError::Net(_) => "net_error",
            RelayError::Io(_) => "io_error",
        }
    }

    /// The side whose socket failed, if the error belongs to one.
    pub fn side(&self) -> Option<Side> {
        match self {
            RelayError::PeerRead { side, .. } | RelayError::PeerWrite { side, .. } => Some(*side),
            RelayError::BackendDialFailed { .. } => Some(Side::Backend),
            _ => None,
        }
    }
}

impl From<PoolError> for RelayError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::OutOfMemory => RelayError::PoolExhausted,
            other => RelayError::InvariantViolation(other.to_string()),
        }
    }
}

/// Report a bookkeeping bug: abort in debug builds, log and carry on in release.
pub(crate) fn invariant_violated(err: &RelayError) {
    error!(reason = err.reason_code(), error = %err, "Invariant violated");
    debug_assert!(false, "{err}");
}
