//! tcprelay
//!
//! Non-blocking TCP reverse proxy. Clients are accepted on one address and
//! relayed byte for byte to a backend chosen round robin, with bounded
//! per-direction buffering so slow peers never stall the worker.
//!
//! Layers, leaves first:
//! - [`pool`]: slab pool of fixed-size packets addressed by index
//! - [`queue`]: per-direction packet FIFO with `current` and `blocked` slots
//! - [`session`]: session state machine and dense session table
//! - [`reactor`]: readiness multiplexer with tagged registrations
//! - [`proxy`]: workers, accept modes, backend selection

pub mod config;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod queue;
pub mod reactor;
pub mod session;
pub mod stats;

pub use config::{AcceptMode, Config, ConfigError, ConnectOn, ProxyConfig, ZeroCopyMode};
pub use error::RelayError;
pub use pool::{Packet, PacketPool, PoolConfig, PoolError};
pub use proxy::{BackendPolicy, Relay, RelayHandle};
pub use session::{Session, SessionId, SessionState, Side};
pub use stats::{Stats, StatsSnapshot};
