//! Configuration surface consumed by the [`dispatcher`](crate::dispatcher),
//! [`pool`](crate::pool), and [`cache`](crate::cache) modules.
//!
//! These are plain data types; there is no CLI or file-format surface here,
//! matching the teacher crate's builder-driven configuration style (see
//! `ClientBuilder` in the teacher crate) without exposing a public builder
//! beyond what each module already needs.

use std::time::Duration;

use crate::error::Error;

/// Configuration for a [`Dispatcher`](crate::dispatcher::Dispatcher).
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Global concurrency cap across all hosts. Default `64`.
    pub max_requests: usize,
    /// Per-host concurrency cap. Default `5`.
    pub max_requests_per_host: usize,
}

impl DispatcherConfig {
    /// Validates the configuration, rejecting non-positive caps.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_requests < 1 {
            return Err(Error::configuration("max_requests must be >= 1"));
        }
        if self.max_requests_per_host < 1 {
            return Err(Error::configuration("max_requests_per_host must be >= 1"));
        }
        Ok(())
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            max_requests: 64,
            max_requests_per_host: 5,
        }
    }
}

/// Configuration for a [`ConnectionPool`](crate::pool::ConnectionPool).
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Maximum number of idle connections retained at steady state.
    /// Default `5`.
    pub max_idle_connections: usize,
    /// How long an idle connection may sit before it becomes evictable;
    /// also the sweeper's default sleep. Default `5` minutes.
    pub keep_alive_duration: Duration,
    /// How long a non-zero allocation count may persist without
    /// byte-level progress before the sweeper logs a leak warning and
    /// poisons the connection. Default `2 *` a notional 150s read
    /// timeout, i.e. `5` minutes — see `DESIGN.md` for the rationale.
    pub leak_detection_threshold: Duration,
}

impl PoolConfig {
    /// Validates the configuration, rejecting non-positive caps.
    pub fn validate(&self) -> Result<(), Error> {
        if self.keep_alive_duration.is_zero() {
            return Err(Error::configuration("keep_alive_duration must be > 0"));
        }
        if self.leak_detection_threshold.is_zero() {
            return Err(Error::configuration(
                "leak_detection_threshold must be > 0",
            ));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_idle_connections: 5,
            keep_alive_duration: Duration::from_secs(5 * 60),
            leak_detection_threshold: Duration::from_secs(5 * 60),
        }
    }
}

/// Configuration consumed by the interceptor chain's follow-up handling
/// and, indirectly, by [`cache`](crate::cache).
#[derive(Debug, Clone, Copy)]
pub struct ChainConfig {
    /// Maximum number of redirect/auth follow-ups per call. Default `20`.
    pub follow_up_limit: u32,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig { follow_up_limit: 20 }
    }
}
