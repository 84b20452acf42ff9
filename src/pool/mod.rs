//! A reuse cache of live transport connections, with idle-eviction, leak
//! detection, and multiplexing awareness.
//!
//! [`ConnectionPool`] holds connections keyed by [`Route`] and hands out
//! [`StreamAllocation`] handles instead of bare connection references, so
//! that dropping a handle (or, in the leaked case, forgetting to) is
//! exactly how the pool learns a connection became idle — see
//! `DESIGN.md`'s note on the weak-reference-to-explicit-handle redesign.

mod connection;

pub use connection::{RealConnection, Route, Transport};

use std::{
    collections::HashSet,
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use crate::{
    config::PoolConfig,
    error::Error,
    rt::{Executor, Timer},
    sync::Mutex,
};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct PoolState<T: Transport, R: Route> {
    connections: Vec<Arc<RealConnection<T, R>>>,
    cleanup_running: bool,
    route_database: HashSet<R>,
}

struct Inner<T: Transport, R: Route> {
    config: PoolConfig,
    state: Mutex<PoolState<T, R>>,
    notify: tokio::sync::Notify,
    executor: Box<dyn Executor<BoxFuture> + Send + Sync>,
    timer: Box<dyn Timer + Send + Sync>,
}

/// The outcome of one `cleanup` pass, telling the sweeper what to do next.
///
/// Maps directly onto the source design's nanosecond-encoded return value
/// (`0` / positive / `-1`) but as a proper enum rather than a magic
/// number, per `SPEC_FULL.md`'s ambient-stack idiom of preferring typed
/// Rust constructs over the source's overloaded sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// A connection was just evicted; call `cleanup` again immediately.
    ImmediateRetry,
    /// Sleep for this long before the next pass, unless woken early.
    SleepFor(Duration),
    /// No connections remain; the sweeper should terminate.
    Terminate,
}

/// A reuse cache of live transport connections.
///
/// Cheaply cloneable: clones share the same connection set and sweeper.
pub struct ConnectionPool<T: Transport, R: Route> {
    inner: Arc<Inner<T, R>>,
}

impl<T: Transport, R: Route> Clone for ConnectionPool<T, R> {
    fn clone(&self) -> Self {
        ConnectionPool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport, R: Route> ConnectionPool<T, R> {
    /// Creates a new, empty pool. The sweeper is not started until the
    /// first connection is `put`.
    pub fn new(
        config: PoolConfig,
        executor: impl Executor<BoxFuture> + Send + Sync + 'static,
        timer: impl Timer + Send + Sync + 'static,
    ) -> Result<Self, Error> {
        config.validate()?;
        Ok(ConnectionPool {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(PoolState {
                    connections: Vec::new(),
                    cleanup_running: false,
                    route_database: HashSet::new(),
                }),
                notify: tokio::sync::Notify::new(),
                executor: Box::new(executor),
                timer: Box::new(timer),
            }),
        })
    }

    /// Returns a reusable connection for `route`, if one exists, as a
    /// [`StreamAllocation`] handle that occupies one allocation slot.
    ///
    /// First-fit scan in insertion order, matching the contract's
    /// "caller must hold the lock" semantics by doing the scan and the
    /// allocation atomically under this pool's own lock.
    pub fn get(&self, route: &R) -> Option<StreamAllocation<T, R>> {
        let guard = self.inner.state.lock();
        let connection = guard
            .connections
            .iter()
            .find(|c| c.is_reusable_for(route))
            .cloned()?;
        drop(guard);

        let now = Instant::now();
        let id = connection.allocate(now);
        trace!(?route, allocation = id, "checked out pooled connection");
        Some(StreamAllocation {
            connection,
            pool: Arc::downgrade(&self.inner),
            id,
        })
    }

    /// Inserts a newly created connection and starts the sweeper if it
    /// isn't already running.
    pub fn put(&self, connection: Arc<RealConnection<T, R>>) {
        let mut guard = self.inner.state.lock();
        guard.connections.push(connection);
        let should_spawn = !guard.cleanup_running;
        if should_spawn {
            guard.cleanup_running = true;
        }
        drop(guard);

        if should_spawn {
            let inner = Arc::clone(&self.inner);
            self.inner.executor.execute(Box::pin(run_sweeper(inner)));
        }
    }

    /// Notifies the pool that the last stream on `connection` finished.
    ///
    /// Returns `true` if the pool refused to retain the connection — the
    /// caller must close it. Refusal happens when the connection is
    /// already marked `no_new_streams` or the pool retains zero idle
    /// connections by configuration.
    pub fn connection_became_idle(&self, connection: &Arc<RealConnection<T, R>>) -> bool {
        if connection.no_new_streams() || self.inner.config.max_idle_connections == 0 {
            return true;
        }
        connection.set_idle_at(Instant::now());
        self.inner.notify.notify_one();
        false
    }

    /// Atomically drains and returns every currently-idle connection.
    /// Callers must close the returned connections' sockets themselves,
    /// outside of any lock.
    pub fn evict_all(&self) -> Vec<Arc<RealConnection<T, R>>> {
        let mut guard = self.inner.state.lock();
        let (idle, busy): (Vec<_>, Vec<_>) = std::mem::take(&mut guard.connections)
            .into_iter()
            .partition(|c| c.allocation_count() == 0);
        guard.connections = busy;
        idle
    }

    /// Number of connections held by the pool, idle and in-use.
    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    /// Number of currently idle connections.
    pub fn idle_connection_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .connections
            .iter()
            .filter(|c| c.allocation_count() == 0)
            .count()
    }

    /// Whether `route` is in the set of recently failed routes and should
    /// be avoided by the connector if an alternative exists.
    pub fn should_avoid_route(&self, route: &R) -> bool {
        self.inner.state.lock().route_database.contains(route)
    }

    /// Records that a connection attempt to `route` failed.
    pub fn record_route_failure(&self, route: R) {
        self.inner.state.lock().route_database.insert(route);
    }

    /// Records that a connection attempt to `route` succeeded, clearing
    /// any prior failure memory for it.
    pub fn record_route_success(&self, route: &R) {
        self.inner.state.lock().route_database.remove(route);
    }

    /// Runs one `cleanup` pass directly, without going through the
    /// sweeper task. Exposed for deterministic testing of the eviction
    /// algorithm (see `S3` in `SPEC_FULL.md` §8).
    pub fn cleanup_once(&self, now: Instant) -> CleanupOutcome {
        let mut guard = self.inner.state.lock();
        cleanup(&mut guard, &self.inner.config, now)
    }
}

impl<T: Transport, R: Route> fmt::Debug for ConnectionPool<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.inner.state.lock();
        f.debug_struct("ConnectionPool")
            .field("connections", &guard.connections.len())
            .field("cleanup_running", &guard.cleanup_running)
            .finish()
    }
}

/// A handle representing one in-flight HTTP exchange bound to a pooled
/// connection. Dropping it returns the allocation slot to the connection
/// and, if that was the last one, notifies the pool.
pub struct StreamAllocation<T: Transport, R: Route> {
    connection: Arc<RealConnection<T, R>>,
    pool: Weak<Inner<T, R>>,
    id: u64,
}

impl<T: Transport, R: Route> StreamAllocation<T, R> {
    /// The connection backing this allocation.
    pub fn connection(&self) -> &Arc<RealConnection<T, R>> {
        &self.connection
    }

    /// Records byte-level progress, resetting this allocation's leak
    /// detection clock.
    pub fn touch(&self) {
        self.connection.touch(self.id, Instant::now());
    }
}

impl<T: Transport, R: Route> Drop for StreamAllocation<T, R> {
    fn drop(&mut self) {
        let released = self.connection.release(self.id);
        if released && self.connection.allocation_count() == 0 {
            if let Some(inner) = self.pool.upgrade() {
                let pool = ConnectionPool { inner };
                let refused = pool.connection_became_idle(&self.connection);
                if refused {
                    debug!(route = ?self.connection.route(), "connection refused retention on idle");
                }
            }
        }
    }
}

impl<T: Transport, R: Route> fmt::Debug for StreamAllocation<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamAllocation")
            .field("route", self.connection.route())
            .field("id", &self.id)
            .finish()
    }
}

fn cleanup<T: Transport, R: Route>(
    state: &mut PoolState<T, R>,
    config: &PoolConfig,
    now: Instant,
) -> CleanupOutcome {
    let mut in_use = 0usize;
    let mut idle = 0usize;
    let mut longest_idle: Option<(usize, Duration)> = None;

    for (i, connection) in state.connections.iter().enumerate() {
        let (remaining, removed_any) =
            connection.prune_leaked(config.leak_detection_threshold, now);
        if remaining == 0 && removed_any {
            // The last leaked allocation was just reclaimed: force
            // immediate eviction eligibility rather than waiting out a
            // full keep-alive window for a connection nobody will use.
            connection.set_idle_at(now.checked_sub(config.keep_alive_duration).unwrap_or(now));
        }

        if remaining > 0 {
            in_use += 1;
            continue;
        }

        idle += 1;
        let idle_for = now.saturating_duration_since(connection.idle_at());
        let replace = match longest_idle {
            Some((_, longest)) => idle_for > longest,
            None => true,
        };
        if replace {
            longest_idle = Some((i, idle_for));
        }
    }

    if let Some((index, idle_for)) = longest_idle {
        if idle_for >= config.keep_alive_duration || idle > config.max_idle_connections {
            state.connections.remove(index);
            return CleanupOutcome::ImmediateRetry;
        }
        return CleanupOutcome::SleepFor(config.keep_alive_duration - idle_for);
    }

    if in_use > 0 {
        return CleanupOutcome::SleepFor(config.keep_alive_duration);
    }

    state.cleanup_running = false;
    CleanupOutcome::Terminate
}

async fn run_sweeper<T: Transport, R: Route>(inner: Arc<Inner<T, R>>) {
    loop {
        let outcome = {
            let mut guard = inner.state.lock();
            cleanup(&mut guard, &inner.config, Instant::now())
        };

        match outcome {
            CleanupOutcome::ImmediateRetry => continue,
            CleanupOutcome::SleepFor(duration) => {
                let sleep = inner.timer.sleep(duration);
                tokio::select! {
                    _ = sleep => {}
                    _ = inner.notify.notified() => {}
                }
            }
            CleanupOutcome::Terminate => break,
        }
    }
}
