//! Backend selection.
//!
//! A policy is one listen address, an ordered non-empty backend list and a
//! rotating cursor. Each worker owns its own copy; only the cursor mutates.

use std::net::SocketAddr;

use crate::config::ConfigError;

/// Round-robin backend policy.
#[derive(Debug, Clone)]
pub struct BackendPolicy {
    listen: SocketAddr,
    backends: Vec<SocketAddr>,
    cursor: usize,
}

impl BackendPolicy {
    /// Create a policy. An empty backend list is rejected.
    pub fn new(listen: SocketAddr, backends: Vec<SocketAddr>) -> Result<Self, ConfigError> {
        if backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        Ok(Self {
            listen,
            backends,
            cursor: 0,
        })
    }

    /// Take the backend under the cursor and advance it.
    pub fn next(&mut self) -> SocketAddr {
        let addr = self.backends[self.cursor];
        self.cursor = (self.cursor + 1) % self.backends.len();
        addr
    }

    pub fn listen(&self) -> SocketAddr {
        self.listen
    }

    pub fn backends(&self) -> &[SocketAddr] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
