//! Non-blocking TCP relay.
//!
//! This module provides:
//! - Listener setup and worker threads (one reactor each)
//! - Shared-socket or dispatcher-fed accepting
//! - Round-robin backend selection
//! - Graceful stop through a shared flag
//!
//! ## Architecture
//!
//! ```text
//!                      +-> Worker 0 (reactor, pool, sessions) -> Backends
//! Client -> Listener --+-> Worker 1
//!                      +-> ...
//! ```
//!
//! In dispatch mode a single dispatcher thread owns the listener and feeds
//! the workers' inboxes instead.
//!
//! ## Usage
//!
//! ```ignore
//! let config = ProxyConfig::new("0.0.0.0:8000".parse()?, vec!["10.0.0.2:80".parse()?]);
//! let handle = Relay::bind(config)?.spawn()?;
//! // ...
//! handle.shutdown();
//! ```

mod backend;
mod dispatch;
mod worker;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tcprelay_networking::listen;
use tracing::{error, info};

pub use backend::BackendPolicy;
pub use dispatch::Inbox;

use crate::config::{AcceptMode, ProxyConfig};
use crate::error::RelayError;
use crate::stats::Stats;
use dispatch::Dispatcher;
use worker::Worker;

/// A bound, not yet running relay.
#[derive(Debug)]
pub struct Relay {
    config: ProxyConfig,
    listener: std::net::TcpListener,
    local_addr: SocketAddr,
    stats: Arc<Stats>,
    shutdown: Arc<AtomicBool>,
}

impl Relay {
    /// Validate the configuration and bind the listening socket.
    pub fn bind(config: ProxyConfig) -> Result<Self, RelayError> {
        config.validate()?;
        let listener = listen(config.listen)?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            backends = config.backends.len(),
            workers = config.workers,
            max_sessions = config.max_sessions,
            zero_copy = %config.zero_copy,
            "Listener bound"
        );

        Ok(Self {
            config,
            listener,
            local_addr,
            stats: Arc::new(Stats::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Start the worker (and dispatcher) threads.
    pub fn spawn(self) -> Result<RelayHandle, RelayError> {
        let mut threads = Vec::new();
        if let Err(err) = self.start(&mut threads) {
            self.shutdown.store(true, Ordering::Release);
            join_all(threads);
            return Err(err);
        }

        info!(
            bind_addr = %self.local_addr,
            threads = threads.len(),
            "Relay started"
        );
        Ok(RelayHandle {
            local_addr: self.local_addr,
            stats: self.stats,
            shutdown: self.shutdown,
            threads,
        })
    }

    fn start(&self, threads: &mut Vec<JoinHandle<()>>) -> Result<(), RelayError> {
        match self.config.accept_mode {
            AcceptMode::Shared => {
                for index in 0..self.config.workers {
                    let listener = mio::net::TcpListener::from_std(self.listener.try_clone()?);
                    let worker = Worker::with_listener(
                        index,
                        listener,
                        &self.config,
                        Arc::clone(&self.stats),
                        Arc::clone(&self.shutdown),
                    )?;
                    threads.push(spawn_named(format!("relay-worker-{index}"), move || {
                        worker.run()
                    })?);
                }
            }
            AcceptMode::Dispatch => {
                let mut inboxes = Vec::with_capacity(self.config.workers);
                for index in 0..self.config.workers {
                    let (worker, inbox) = Worker::with_inbox(
                        index,
                        &self.config,
                        Arc::clone(&self.stats),
                        Arc::clone(&self.shutdown),
                    )?;
                    inboxes.push(inbox);
                    threads.push(spawn_named(format!("relay-worker-{index}"), move || {
                        worker.run()
                    })?);
                }
                let listener = mio::net::TcpListener::from_std(self.listener.try_clone()?);
                let dispatcher = Dispatcher::new(
                    listener,
                    inboxes,
                    Arc::clone(&self.stats),
                    self.config.accept_batch,
                    self.config.poll_timeout,
                    Arc::clone(&self.shutdown),
                )?;
                threads.push(spawn_named("relay-dispatch".to_string(), move || {
                    dispatcher.run()
                })?);
            }
        }
        Ok(())
    }
}

/// Handle to a running relay.
#[derive(Debug)]
pub struct RelayHandle {
    local_addr: SocketAddr,
    stats: Arc<Stats>,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// The flag workers check once per loop iteration.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Ask every thread to stop and wait for them. Blocks for up to one poll
    /// timeout.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Release);
        join_all(self.threads);
        info!(bind_addr = %self.local_addr, "Relay stopped");
    }
}

fn spawn_named<F>(name: String, body: F) -> Result<JoinHandle<()>, RelayError>
where
    F: FnOnce() + Send + 'static,
{
    Ok(thread::Builder::new().name(name).spawn(body)?)
}

fn join_all(threads: Vec<JoinHandle<()>>) {
    for thread in threads {
        let name = thread.thread().name().unwrap_or("relay").to_string();
        if thread.join().is_err() {
            error!(thread = %name, "Relay thread panicked");
        }
    }
}
