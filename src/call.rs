//! Units of work the [`dispatcher`](crate::dispatcher) admits and schedules.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::error::Error;

/// Opaque identity used to group calls for cancellation.
///
/// `Tag` is compared by value; callers typically derive it from a request
/// ID, a user session, or anything else that groups related calls.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Tag(Arc<str>);

impl Tag {
    /// Creates a new tag from any string-like value.
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Tag(value.into())
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The result handed back to a call's callback: a successful response body
/// (opaque to this crate — it is whatever the transport engine produces),
/// or an error.
pub type CallResult<B> = std::result::Result<B, Error>;

/// Shared bookkeeping for one unit of work, common to [`AsyncCall`] and
/// [`SyncCall`].
///
/// Attributes mirror the data model directly: the call's derived host (for
/// per-host admission), a monotonic cancellation flag, and an at-most-once
/// executed flag. There is deliberately no `request` field here — the
/// request itself is opaque to the dispatcher and lives with the caller's
/// closure; the dispatcher only needs the host to admit and schedule.
pub struct CallState {
    host: Arc<str>,
    tag: Tag,
    cancelled: AtomicBool,
    executed: AtomicBool,
}

impl CallState {
    /// Creates call bookkeeping for a request bound to `host` and `tag`.
    pub fn new(host: impl Into<Arc<str>>, tag: Tag) -> Self {
        CallState {
            host: host.into(),
            tag,
            cancelled: AtomicBool::new(false),
            executed: AtomicBool::new(false),
        }
    }

    /// The host this call is scheduled against.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The call's cancellation group.
    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    /// Marks this call cancelled. Monotonic: once true, stays true.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns whether this call has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Marks this call as having started execution exactly once.
    ///
    /// Returns `false` if the call had already been marked executed,
    /// which the caller must treat as a state-invariant violation (the
    /// same call body must never run twice).
    pub fn mark_executed(&self) -> bool {
        !self.executed.swap(true, Ordering::SeqCst)
    }
}

impl fmt::Debug for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallState")
            .field("host", &self.host)
            .field("tag", &self.tag)
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .field("executed", &self.executed.load(Ordering::Relaxed))
            .finish()
    }
}

/// A unit of work submitted to [`Dispatcher::enqueue`](crate::dispatcher::Dispatcher::enqueue).
///
/// The body is a boxed closure rather than a future: call bodies in this
/// model are synchronous, running on a worker thread handed out by the
/// dispatcher's [`CallExecutor`](crate::rt::CallExecutor) (see §4.1's
/// worker executor contract).
pub struct AsyncCall {
    state: Arc<CallState>,
    body: Option<Box<dyn FnOnce(Arc<CallState>) + Send + 'static>>,
}

impl AsyncCall {
    /// Creates a new async call.
    ///
    /// `body` receives the call's `CallState` so it can observe
    /// cancellation before starting I/O and before invoking the user's
    /// callback.
    pub fn new(
        state: Arc<CallState>,
        body: impl FnOnce(Arc<CallState>) + Send + 'static,
    ) -> Self {
        AsyncCall {
            state,
            body: Some(Box::new(body)),
        }
    }

    /// The call's bookkeeping state.
    pub fn state(&self) -> &Arc<CallState> {
        &self.state
    }

    /// Consumes the call, returning its state and runnable body.
    pub(crate) fn into_parts(
        mut self,
    ) -> (Arc<CallState>, Box<dyn FnOnce(Arc<CallState>) + Send + 'static>) {
        let body = self.body.take().expect("AsyncCall body taken twice");
        (self.state, body)
    }
}

impl fmt::Debug for AsyncCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCall").field("state", &self.state).finish()
    }
}

/// A unit of work that runs synchronously on the caller's own thread.
///
/// `SyncCall` never queues: `Dispatcher::executed` merely records that it
/// has begun so concurrency accounting (`running_sync`) stays correct, and
/// `Dispatcher::finished` removes it again when the caller's thread
/// returns from the blocking call.
pub struct SyncCall {
    state: Arc<CallState>,
}

impl SyncCall {
    /// Creates a new sync call.
    pub fn new(state: Arc<CallState>) -> Self {
        SyncCall { state }
    }

    /// The call's bookkeeping state.
    pub fn state(&self) -> &Arc<CallState> {
        &self.state
    }
}

impl fmt::Debug for SyncCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCall").field("state", &self.state).finish()
    }
}

/// Derives the per-host admission key from a request's authority.
///
/// The dispatcher only needs `request.url.host`; full URL parsing is out
/// of scope (see `SPEC_FULL.md` §12), so callers pass the already-resolved
/// host in directly when constructing a [`CallState`].
pub fn host_key(uri: &http::Uri) -> Arc<str> {
    Arc::from(uri.host().unwrap_or_default())
}
