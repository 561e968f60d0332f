//! Engine configuration, passed explicitly to [`RelayEngine`](crate::RelayEngine).

use crate::error::{TeeError, TeeResult};
use crate::relay::{RelayOptions, DEFAULT_BUFFER_SIZE};
use crate::transport::{Endpoint, Protocol};
use std::time::Duration;

/// Everything the engine needs to know before it binds.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub protocol: Protocol,
    /// Local endpoint to listen on. Port `0` picks an ephemeral port.
    pub bind: Endpoint,
    /// Fixed remote every accepted connection is paired with.
    pub remote: Endpoint,
    /// Keep accepting after the first connection.
    pub keep_listening: bool,
    /// Maximum simultaneous relays; `0` means unbounded.
    ///
    /// A non-zero value also keeps the engine listening.
    pub max_connections: usize,
    pub idle_timeout: Option<Duration>,
    pub buffer_size: usize,
}

impl RelayConfig {
    /// Single-shot TCP config with default tunables.
    pub fn new(bind: Endpoint, remote: Endpoint) -> Self {
        Self {
            protocol: Protocol::Tcp,
            bind,
            remote,
            keep_listening: false,
            max_connections: 0,
            idle_timeout: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// One connection pair, then drain.
    pub fn single_shot(&self) -> bool {
        !self.keep_listening && self.max_connections == 0
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            idle_timeout: self.idle_timeout,
            buffer_size: self.buffer_size,
        }
    }

    pub fn validate(&self) -> TeeResult<()> {
        if self.buffer_size == 0 {
            return Err(TeeError::Config("buffer_size must be positive".into()));
        }
        if self.idle_timeout == Some(Duration::ZERO) {
            return Err(TeeError::Config("idle_timeout must be positive".into()));
        }
        if self.remote.host.is_empty() {
            return Err(TeeError::Config("remote host is empty".into()));
        }
        Ok(())
    }
}
