use std::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Instant,
};

use crate::sync::Mutex;

/// A transport (a live socket, an HTTP/2 session, anything byte-framing
/// and TLS own — out of this crate's scope) that the pool can keep alive
/// and hand back out.
///
/// Grounded in hyper-util's `Poolable` trait: the pool only needs to know
/// whether a transport still looks usable and whether it multiplexes.
pub trait Transport: fmt::Debug + Send + Sync + 'static {
    /// Whether this transport still appears usable, i.e. the peer has not
    /// half-closed it and it has not errored out from under the pool.
    fn is_open(&self) -> bool;

    /// Whether this transport can carry more than one concurrent stream
    /// (e.g. HTTP/2). Defaults to `false` (HTTP/1.1 semantics).
    fn is_multiplexed(&self) -> bool {
        false
    }
}

/// The tuple identifying one network path to an origin: address, proxy,
/// and socket family/bind choice. Left abstract here — byte-level
/// addressing is out of this crate's scope — but must be usable as a
/// pool lookup key.
pub trait Route: Clone + Eq + std::hash::Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> Route for T where T: Clone + Eq + std::hash::Hash + fmt::Debug + Send + Sync + 'static {}

struct Allocation {
    id: u64,
    last_use: Instant,
}

/// An owned, live transport connection kept by the pool.
///
/// Reusability invariant: a connection is reusable for route `R` iff its
/// live allocation count is below `allocation_limit`, its route matches,
/// and it has not been marked `no_new_streams`.
pub struct RealConnection<T: Transport, R: Route> {
    route: R,
    transport: T,
    allocation_limit: usize,
    no_new_streams: AtomicBool,
    idle_at: Mutex<Instant>,
    allocations: Mutex<Vec<Allocation>>,
    next_allocation_id: AtomicU64,
}

impl<T: Transport, R: Route> RealConnection<T, R> {
    /// Creates a new connection record for a transport just opened to
    /// `route`. `max_multiplexed_streams` bounds the allocation limit when
    /// `transport.is_multiplexed()` is true; non-multiplexed transports
    /// always get a limit of 1.
    pub fn new(route: R, transport: T, max_multiplexed_streams: usize) -> Self {
        let allocation_limit = if transport.is_multiplexed() {
            max_multiplexed_streams.max(1)
        } else {
            1
        };
        RealConnection {
            route,
            transport,
            allocation_limit,
            no_new_streams: AtomicBool::new(false),
            idle_at: Mutex::new(Instant::now()),
            allocations: Mutex::new(Vec::new()),
            next_allocation_id: AtomicU64::new(0),
        }
    }

    /// The route this connection was opened to.
    pub fn route(&self) -> &R {
        &self.route
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Whether this connection multiplexes streams.
    pub fn is_multiplexed(&self) -> bool {
        self.allocation_limit > 1
    }

    /// Current live allocation count.
    pub fn allocation_count(&self) -> usize {
        self.allocations.lock().len()
    }

    /// Whether this connection will refuse any further streams.
    pub fn no_new_streams(&self) -> bool {
        self.no_new_streams.load(Ordering::SeqCst)
    }

    pub(super) fn mark_no_new_streams(&self) {
        self.no_new_streams.store(true, Ordering::SeqCst);
    }

    pub(super) fn idle_at(&self) -> Instant {
        *self.idle_at.lock()
    }

    pub(super) fn set_idle_at(&self, at: Instant) {
        *self.idle_at.lock() = at;
    }

    /// Whether this connection can currently serve a request to `route`.
    pub fn is_reusable_for(&self, route: &R) -> bool {
        self.transport.is_open()
            && self.allocation_count() < self.allocation_limit
            && &self.route == route
            && !self.no_new_streams()
    }

    pub(super) fn allocate(self: &std::sync::Arc<Self>, now: Instant) -> u64 {
        let id = self.next_allocation_id.fetch_add(1, Ordering::Relaxed);
        self.allocations.lock().push(Allocation {
            id,
            last_use: now,
        });
        id
    }

    /// Marks byte-level progress on `allocation_id`, resetting its leak
    /// clock.
    pub fn touch(&self, allocation_id: u64, now: Instant) {
        if let Some(a) = self
            .allocations
            .lock()
            .iter_mut()
            .find(|a| a.id == allocation_id)
        {
            a.last_use = now;
        }
    }

    /// Removes `allocation_id`; returns `true` if it was present (i.e.
    /// this call is the one actually releasing it, not a no-op against an
    /// allocation the sweeper already reclaimed as leaked).
    pub(super) fn release(&self, allocation_id: u64) -> bool {
        let mut allocations = self.allocations.lock();
        let before = allocations.len();
        allocations.retain(|a| a.id != allocation_id);
        allocations.len() < before
    }

    /// Scans allocations for ones with no byte-level progress in longer
    /// than `threshold` and reclaims them as leaked. Returns the
    /// remaining live count and whether any were reclaimed this pass.
    pub(super) fn prune_leaked(&self, threshold: std::time::Duration, now: Instant) -> (usize, bool) {
        let mut allocations = self.allocations.lock();
        let before = allocations.len();
        let route = &self.route;
        allocations.retain(|a| {
            let age = now.saturating_duration_since(a.last_use);
            let leaked = age > threshold;
            if leaked {
                warn!(?route, allocation = a.id, "leaked stream allocation detected");
            }
            !leaked
        });
        let remaining = allocations.len();
        drop(allocations);
        let removed_any = remaining < before;
        if removed_any {
            self.mark_no_new_streams();
        }
        (remaining, removed_any)
    }
}

impl<T: Transport, R: Route> fmt::Debug for RealConnection<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealConnection")
            .field("route", &self.route)
            .field("allocation_count", &self.allocation_count())
            .field("allocation_limit", &self.allocation_limit)
            .field("no_new_streams", &self.no_new_streams())
            .finish()
    }
}
