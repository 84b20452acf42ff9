//! Bounded admission and scheduling of calls.
//!
//! [`Dispatcher`] enforces a global concurrency cap and a per-host
//! concurrency cap over asynchronous calls, and hands admitted calls to an
//! injected [`CallExecutor`]. All bookkeeping — the `ready`, `running_async`,
//! and `running_sync` queues — lives behind one mutex; the worker executor
//! only reacquires that mutex to report `finished`, which is the single
//! point from which queued calls are promoted (see module rationale in
//! `DESIGN.md`).

use std::{
    collections::VecDeque,
    fmt,
    sync::Arc,
};

use crate::{
    call::{AsyncCall, CallState, SyncCall, Tag},
    config::DispatcherConfig,
    error::Error,
    rt::CallExecutor,
    sync::Mutex,
};

struct State {
    config: DispatcherConfig,
    ready: VecDeque<AsyncCall>,
    running_async: Vec<Arc<CallState>>,
    running_sync: Vec<Arc<CallState>>,
}

impl State {
    fn running_host_count(&self, host: &str) -> usize {
        self.running_async
            .iter()
            .filter(|s| s.host() == host)
            .count()
    }

    /// Moves as many ready calls into `running_async` as the global and
    /// per-host caps allow, preserving FIFO order and skipping calls whose
    /// host is currently saturated. Returns the promoted calls so the
    /// caller can hand them to the executor after releasing the lock.
    fn promote_calls(&mut self) -> Vec<AsyncCall> {
        let mut promoted = Vec::new();
        let mut i = 0;
        while i < self.ready.len() {
            if self.running_async.len() >= self.config.max_requests {
                break;
            }
            let host_count = self.running_host_count(self.ready[i].state().host());
            if host_count < self.config.max_requests_per_host {
                let call = self.ready.remove(i).expect("index in bounds");
                self.running_async.push(Arc::clone(call.state()));
                promoted.push(call);
            } else {
                i += 1;
            }
        }
        promoted
    }

    fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.running_async.is_empty() && self.running_sync.is_empty()
    }
}

struct Shared {
    state: Mutex<State>,
    executor: Box<dyn CallExecutor + Send + Sync>,
    idle_callback: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

/// Bounded admission and scheduling of async and sync calls.
///
/// Cheaply cloneable: clones share the same queues and executor.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Shared>,
}

impl Dispatcher {
    /// Creates a dispatcher with the given configuration, running admitted
    /// calls on `executor`.
    pub fn new(
        config: DispatcherConfig,
        executor: impl CallExecutor + Send + Sync + 'static,
    ) -> Result<Self, Error> {
        config.validate()?;
        Ok(Dispatcher {
            inner: Arc::new(Shared {
                state: Mutex::new(State {
                    config,
                    ready: VecDeque::new(),
                    running_async: Vec::new(),
                    running_sync: Vec::new(),
                }),
                executor: Box::new(executor),
                idle_callback: Mutex::new(None),
            }),
        })
    }

    /// Registers a callback invoked (outside the lock) whenever the
    /// dispatcher transitions to fully idle — `ready`, `running_async`,
    /// and `running_sync` all empty at once.
    pub fn set_idle_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.inner.idle_callback.lock() = Some(Box::new(callback));
    }

    /// Admits an async call.
    ///
    /// If the global cap and this call's per-host cap both have capacity,
    /// the call is handed directly to the executor; otherwise it is
    /// appended to the ready queue.
    pub fn enqueue(&self, call: AsyncCall) {
        let mut guard = self.inner.state.lock();
        let host_count = guard.running_host_count(call.state().host());
        if guard.running_async.len() < guard.config.max_requests
            && host_count < guard.config.max_requests_per_host
        {
            guard.running_async.push(Arc::clone(call.state()));
            drop(guard);
            trace!(host = call.state().host(), "admitting call directly");
            self.run(call);
        } else {
            trace!(host = call.state().host(), "queueing call");
            guard.ready.push_back(call);
        }
    }

    /// Records that a synchronous call has begun executing on the
    /// caller's thread.
    pub fn executed(&self, call: &SyncCall) {
        self.inner
            .state
            .lock()
            .running_sync
            .push(Arc::clone(call.state()));
    }

    /// Reports that an async call has reached a terminal state (success,
    /// failure, or cancellation) and runs `promote_calls`.
    ///
    /// # Panics
    ///
    /// Panics if `state` is not present in `running_async` — this
    /// indicates `finished` was called twice for the same call, or for a
    /// call that was never admitted, both of which are programmer bugs
    /// per the error-handling design (state/assertion errors).
    fn finished_async(&self, state: &Arc<CallState>) {
        let mut guard = self.inner.state.lock();
        let pos = guard
            .running_async
            .iter()
            .position(|s| Arc::ptr_eq(s, state));
        match pos {
            Some(i) => {
                guard.running_async.remove(i);
            }
            None => panic!("Dispatcher::finished called for a call not in running_async"),
        }
        let promoted = guard.promote_calls();
        let went_idle = guard.is_idle();
        drop(guard);

        for call in promoted {
            self.run(call);
        }
        if went_idle {
            self.fire_idle_callback();
        }
    }

    /// Reports that a synchronous call has returned from `execute` on the
    /// caller's thread.
    ///
    /// # Panics
    ///
    /// Panics if `call` is not present in `running_sync`.
    pub fn finished_sync(&self, call: &SyncCall) {
        let mut guard = self.inner.state.lock();
        let pos = guard
            .running_sync
            .iter()
            .position(|s| Arc::ptr_eq(s, call.state()));
        match pos {
            Some(i) => {
                guard.running_sync.remove(i);
            }
            None => panic!("Dispatcher::finished called for a call not in running_sync"),
        }
        let went_idle = guard.is_idle();
        drop(guard);
        if went_idle {
            self.fire_idle_callback();
        }
    }

    /// Marks every call (ready, running async, running sync) whose tag
    /// equals `tag` as cancelled.
    ///
    /// Cancelling a ready call does not remove it from the ready queue;
    /// the worker observes cancellation when it eventually runs the call
    /// body, and the callback still fires exactly once with a
    /// cancellation error.
    pub fn cancel(&self, tag: &Tag) {
        let guard = self.inner.state.lock();
        for call in guard.ready.iter() {
            if call.state().tag() == tag {
                call.state().cancel();
            }
        }
        for state in guard.running_async.iter().chain(guard.running_sync.iter()) {
            if state.tag() == tag {
                state.cancel();
            }
        }
    }

    /// Updates the global concurrency cap and runs `promote_calls`.
    pub fn set_max_requests(&self, n: usize) -> Result<(), Error> {
        if n < 1 {
            return Err(Error::configuration("max_requests must be >= 1"));
        }
        let mut guard = self.inner.state.lock();
        guard.config.max_requests = n;
        let promoted = guard.promote_calls();
        drop(guard);
        for call in promoted {
            self.run(call);
        }
        Ok(())
    }

    /// Updates the per-host concurrency cap and runs `promote_calls`.
    pub fn set_max_requests_per_host(&self, n: usize) -> Result<(), Error> {
        if n < 1 {
            return Err(Error::configuration(
                "max_requests_per_host must be >= 1",
            ));
        }
        let mut guard = self.inner.state.lock();
        guard.config.max_requests_per_host = n;
        let promoted = guard.promote_calls();
        drop(guard);
        for call in promoted {
            self.run(call);
        }
        Ok(())
    }

    /// Number of async calls waiting in the ready queue.
    pub fn queued_call_count(&self) -> usize {
        self.inner.state.lock().ready.len()
    }

    /// Number of calls currently running, async and sync combined.
    pub fn running_call_count(&self) -> usize {
        let guard = self.inner.state.lock();
        guard.running_async.len() + guard.running_sync.len()
    }

    /// Number of async calls currently running for `host`.
    pub fn running_call_count_for_host(&self, host: &str) -> usize {
        self.inner.state.lock().running_host_count(host)
    }

    fn run(&self, call: AsyncCall) {
        let (state, body) = call.into_parts();
        let this = self.clone();
        let state_for_finish = Arc::clone(&state);
        self.inner.executor.execute(Box::new(move || {
            // A panicking call body must still reach `finished_async` —
            // it is the single enforced post-condition (§7): skipping it
            // would leave this call's state in `running_async` forever,
            // permanently shrinking its host's concurrency budget.
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                body(state);
            }));
            if outcome.is_err() {
                error!(host = state_for_finish.host(), "call body panicked");
            }
            this.finished_async(&state_for_finish);
        }));
    }

    fn fire_idle_callback(&self) {
        if let Some(callback) = self.inner.idle_callback.lock().as_deref() {
            callback();
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.inner.state.lock();
        f.debug_struct("Dispatcher")
            .field("max_requests", &guard.config.max_requests)
            .field("max_requests_per_host", &guard.config.max_requests_per_host)
            .field("ready", &guard.ready.len())
            .field("running_async", &guard.running_async.len())
            .field("running_sync", &guard.running_sync.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use super::*;
    use crate::rt::CachedThreadExecutor;

    fn dispatcher(max_requests: usize, max_requests_per_host: usize) -> Dispatcher {
        Dispatcher::new(
            DispatcherConfig {
                max_requests,
                max_requests_per_host,
            },
            CachedThreadExecutor::new(),
        )
        .unwrap()
    }

    fn make_call(host: &str, on_run: impl FnOnce() + Send + 'static) -> AsyncCall {
        let state = Arc::new(CallState::new(host, Tag::new("t")));
        AsyncCall::new(state, move |_state| on_run())
    }

    #[test]
    fn respects_global_and_per_host_caps() {
        let d = dispatcher(64, 5);
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = std::sync::mpsc::channel();

        for i in 0..70 {
            let host = format!("host-{}", i % 20);
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            let tx = tx.clone();
            let call = make_call(&host, move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
                let _ = tx.send(());
            });
            d.enqueue(call);
        }

        for _ in 0..70 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 64);
    }

    #[test]
    fn fifo_within_a_saturated_host() {
        let d = dispatcher(64, 1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = std::sync::mpsc::channel();

        for i in 0..3 {
            let order = Arc::clone(&order);
            let tx = tx.clone();
            let call = make_call("h1", move || {
                order.lock().push(i);
                std::thread::sleep(Duration::from_millis(10));
                let _ = tx.send(());
            });
            d.enqueue(call);
        }

        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn cancel_marks_ready_calls() {
        let d = dispatcher(64, 1);
        let tag = Tag::new("group-a");
        let state = Arc::new(CallState::new("h1", tag.clone()));
        let blocker_state = Arc::new(CallState::new("h1", Tag::new("other")));
        let (block_tx, block_rx) = std::sync::mpsc::channel::<()>();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        // Saturate h1 with a call that waits to be released so the next
        // call to h1 stays in `ready` long enough to cancel.
        d.enqueue(AsyncCall::new(blocker_state, move |_| {
            block_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        }));
        block_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        d.enqueue(AsyncCall::new(Arc::clone(&state), |_| {}));
        assert_eq!(d.queued_call_count(), 1);

        d.cancel(&tag);
        assert!(state.is_cancelled());

        release_tx.send(()).unwrap();
    }

    #[test]
    fn set_max_requests_rejects_zero() {
        let d = dispatcher(64, 5);
        assert!(d.set_max_requests(0).is_err());
    }

    #[test]
    fn finished_runs_even_if_call_body_panics() {
        let d = dispatcher(64, 1);
        d.enqueue(make_call("h1", || panic!("boom")));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while d.running_call_count() > 0 {
            assert!(
                std::time::Instant::now() < deadline,
                "finished_async never ran after the call body panicked"
            );
            std::thread::sleep(Duration::from_millis(10));
        }

        // The panicking call must have been promoted out of running_async
        // so a later call to the same (per-host-saturated) host can run.
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_body = Arc::clone(&ran);
        d.enqueue(make_call("h1", move || {
            ran_in_body.fetch_add(1, Ordering::SeqCst);
        }));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ran.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "later call never ran");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
