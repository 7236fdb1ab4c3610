//! Relay configuration.
//!
//! [`ProxyConfig`] is what the engine consumes; [`Config`] wraps it with the
//! process-level settings the binary reads from the environment.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;

use crate::pool::{DEFAULT_CACHE_CAPACITY, DEFAULT_PACKET_SIZE};

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8000";
pub const DEFAULT_MAX_SESSIONS: usize = 1024;
pub const DEFAULT_MAX_PENDING_BYTES: usize = 64 * 1024;
pub const DEFAULT_ACCEPT_BATCH: usize = 32;
pub const DEFAULT_INBOX_CAPACITY: usize = 256;
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("at least one backend address is required")]
    NoBackends,

    #[error("{field} must be at least 1")]
    Zero { field: &'static str },

    #[error("invalid {field}: {value:?}")]
    InvalidValue { field: &'static str, value: String },

    #[error("zero-copy mode {0} is not available in this build")]
    ZeroCopyUnsupported(ZeroCopyMode),
}

/// How bytes move between the two sockets of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZeroCopyMode {
    /// Through pooled user-space packets.
    #[default]
    Off,
    /// Kernel-side through a pipe with `splice(2)` (Linux only).
    Splice,
    /// Through a dedicated kernel module. Recognized, never available.
    KernelModule,
}

impl ZeroCopyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ZeroCopyMode::Off => "off",
            ZeroCopyMode::Splice => "splice",
            ZeroCopyMode::KernelModule => "module",
        }
    }
}

impl fmt::Display for ZeroCopyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ZeroCopyMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "0" => Ok(ZeroCopyMode::Off),
            "splice" => Ok(ZeroCopyMode::Splice),
            "module" | "kernel" | "kernel-module" => Ok(ZeroCopyMode::KernelModule),
            _ => Err(ConfigError::InvalidValue {
                field: "zero_copy",
                value: s.to_string(),
            }),
        }
    }
}

/// When the backend is dialed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectOn {
    /// Right after the client is accepted.
    Accept,
    /// Once the client has sent its first byte.
    #[default]
    FirstByte,
}

impl FromStr for ConnectOn {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accept" | "eager" => Ok(ConnectOn::Accept),
            "first-byte" | "first_byte" | "lazy" => Ok(ConnectOn::FirstByte),
            _ => Err(ConfigError::InvalidValue {
                field: "connect_on",
                value: s.to_string(),
            }),
        }
    }
}

/// How accepted connections reach workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcceptMode {
    /// Every worker polls and accepts on the same listening socket.
    #[default]
    Shared,
    /// A dispatcher thread accepts and hands connections to worker inboxes.
    Dispatch,
}

impl FromStr for AcceptMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shared" => Ok(AcceptMode::Shared),
            "dispatch" => Ok(AcceptMode::Dispatch),
            _ => Err(ConfigError::InvalidValue {
                field: "accept_mode",
                value: s.to_string(),
            }),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Address to accept clients on.
    pub listen: SocketAddr,
    /// Backends, selected round robin.
    pub backends: Vec<SocketAddr>,
    /// Ceiling on live sessions across all workers.
    pub max_sessions: usize,
    /// Worker threads.
    pub workers: usize,
    pub zero_copy: ZeroCopyMode,
    pub connect_on: ConnectOn,
    pub accept_mode: AcceptMode,
    /// Bytes per pooled packet.
    pub packet_size: usize,
    /// Packets per pool cache block.
    pub cache_capacity: usize,
    /// Per-direction ceiling on bytes read but not yet delivered.
    pub max_pending_bytes: usize,
    /// Upper bound on one reactor wait.
    pub poll_timeout: Duration,
    /// Accepts per readiness event before yielding to sessions.
    pub accept_batch: usize,
    /// Connections a worker inbox holds in dispatch mode.
    pub inbox_capacity: usize,
    /// How often the binary logs a statistics snapshot.
    pub stats_interval: Duration,
}

impl ProxyConfig {
    /// Defaults for everything but the addresses.
    pub fn new(listen: SocketAddr, backends: Vec<SocketAddr>) -> Self {
        Self {
            listen,
            backends,
            max_sessions: DEFAULT_MAX_SESSIONS,
            workers: 1,
            zero_copy: ZeroCopyMode::Off,
            connect_on: ConnectOn::default(),
            accept_mode: AcceptMode::default(),
            packet_size: DEFAULT_PACKET_SIZE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            accept_batch: DEFAULT_ACCEPT_BATCH,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        for (field, value) in [
            ("max_sessions", self.max_sessions),
            ("workers", self.workers),
            ("packet_size", self.packet_size),
            ("cache_capacity", self.cache_capacity),
            ("max_pending_bytes", self.max_pending_bytes),
            ("accept_batch", self.accept_batch),
            ("inbox_capacity", self.inbox_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        match self.zero_copy {
            ZeroCopyMode::Off => {}
            ZeroCopyMode::Splice if cfg!(target_os = "linux") => {}
            mode => return Err(ConfigError::ZeroCopyUnsupported(mode)),
        }
        Ok(())
    }

    /// Dial policy actually applied. Zero-copy sessions always dial at accept.
    pub fn effective_connect_on(&self) -> ConnectOn {
        match self.zero_copy {
            ZeroCopyMode::Off => self.connect_on,
            _ => ConnectOn::Accept,
        }
    }
}

/// Process configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    pub proxy: ProxyConfig,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen: SocketAddr = std::env::var("RELAY_LISTEN")
            .unwrap_or_else(|_| DEFAULT_LISTEN.to_string())
            .parse()
            .context("RELAY_LISTEN must be a socket address (example: 0.0.0.0:8000).")?;

        let backends = std::env::var("RELAY_BACKENDS")
            .context("Missing backends. Set RELAY_BACKENDS (comma separated socket addresses).")?;
        let backends = parse_backends(&backends)
            .context("RELAY_BACKENDS must be comma separated socket addresses.")?;

        let mut proxy = ProxyConfig::new(listen, backends);

        if let Some(max) = env_parse("RELAY_MAX_SESSIONS")
            .context("RELAY_MAX_SESSIONS must be an integer.")?
        {
            proxy.max_sessions = max;
        }
        if let Some(workers) =
            env_parse("RELAY_WORKERS").context("RELAY_WORKERS must be an integer.")?
        {
            proxy.workers = workers;
        }
        if let Some(mode) = env_parse("RELAY_ZERO_COPY")
            .context("RELAY_ZERO_COPY must be one of off, splice, module.")?
        {
            proxy.zero_copy = mode;
        }
        if let Some(connect_on) = env_parse("RELAY_CONNECT_ON")
            .context("RELAY_CONNECT_ON must be accept or first-byte.")?
        {
            proxy.connect_on = connect_on;
        }
        if let Some(mode) = env_parse("RELAY_ACCEPT_MODE")
            .context("RELAY_ACCEPT_MODE must be shared or dispatch.")?
        {
            proxy.accept_mode = mode;
        }
        if let Some(size) =
            env_parse("RELAY_PACKET_SIZE").context("RELAY_PACKET_SIZE must be an integer (bytes).")?
        {
            proxy.packet_size = size;
        }
        if let Some(limit) = env_parse("RELAY_MAX_PENDING_BYTES")
            .context("RELAY_MAX_PENDING_BYTES must be an integer (bytes).")?
        {
            proxy.max_pending_bytes = limit;
        }
        if let Some(ms) = env_parse::<u64>("RELAY_STATS_INTERVAL_MS")
            .context("RELAY_STATS_INTERVAL_MS must be an integer (milliseconds).")?
        {
            proxy.stats_interval = Duration::from_millis(ms.max(100));
        }

        proxy.validate().context("Invalid relay configuration.")?;

        let log_level = std::env::var("RELAY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self { proxy, log_level })
    }
}

/// Parse a comma separated list of socket addresses. Blank entries are skipped.
pub fn parse_backends(raw: &str) -> Result<Vec<SocketAddr>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry.parse().map_err(|_| ConfigError::InvalidValue {
                field: "backends",
                value: entry.to_string(),
            })
        })
        .collect()
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    std::env::var(name)
        .ok()
        .map(|v| v.parse::<T>())
        .transpose()
        .with_context(|| format!("failed to parse {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn config() -> ProxyConfig {
        ProxyConfig::new(addr("127.0.0.1:0"), vec![addr("127.0.0.1:9000")])
    }

    #[test]
    fn test_defaults_validate() {
        let config = config();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.packet_size, DEFAULT_PACKET_SIZE);
        assert_eq!(config.effective_connect_on(), ConnectOn::FirstByte);
    }

    #[test]
    fn test_empty_backend_list_rejected() {
        let mut config = config();
        config.backends.clear();
        assert_eq!(config.validate(), Err(ConfigError::NoBackends));
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut config = config();
        config.max_sessions = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "max_sessions"
            })
        );

        let mut config = self::config();
        config.workers = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero { field: "workers" })
        );
    }

    #[test]
    fn test_kernel_module_mode_rejected() {
        let mut config = config();
        config.zero_copy = "module".parse().unwrap();
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroCopyUnsupported(ZeroCopyMode::KernelModule))
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_splice_forces_eager_connect() {
        let mut config = config();
        config.zero_copy = ZeroCopyMode::Splice;
        config.connect_on = ConnectOn::FirstByte;
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.effective_connect_on(), ConnectOn::Accept);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("Splice".parse(), Ok(ZeroCopyMode::Splice));
        assert_eq!("off".parse(), Ok(ZeroCopyMode::Off));
        assert_eq!("lazy".parse(), Ok(ConnectOn::FirstByte));
        assert_eq!("accept".parse(), Ok(ConnectOn::Accept));
        assert_eq!("dispatch".parse(), Ok(AcceptMode::Dispatch));
        assert!("sometimes".parse::<AcceptMode>().is_err());
    }

    #[test]
    fn test_parse_backends() {
        let backends = parse_backends("127.0.0.1:9000, 127.0.0.1:9001,").unwrap();
        assert_eq!(backends, vec![addr("127.0.0.1:9000"), addr("127.0.0.1:9001")]);

        assert!(matches!(
            parse_backends("127.0.0.1:9000,nowhere"),
            Err(ConfigError::InvalidValue { field: "backends", .. })
        ));
        assert_eq!(parse_backends(" , "), Ok(vec![]));
    }
}
