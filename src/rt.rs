//! Runtime abstractions.
//!
//! The pool's background sweeper is a future and needs something that can
//! spawn futures ([`Executor`]). The dispatcher's calls are synchronous
//! bodies that block on the transport engine and need something that can
//! run blocking closures on a managed thread pool ([`CallExecutor`]).

use std::{fmt, future::Future, pin::Pin, time::Duration};

/// An executor of futures, used by the [`pool`](crate::pool) to run its
/// background sweeper.
pub trait Executor<Fut> {
    /// Place the future into the executor to be run.
    fn execute(&self, fut: Fut);
}

impl<E, F> Executor<F> for &E
where
    E: Executor<F>,
{
    fn execute(&self, fut: F) {
        (**self).execute(fut)
    }
}

/// Executes futures on the current Tokio runtime.
#[derive(Clone, Copy, Debug)]
pub struct TokioExecutor;

impl<F> Executor<F> for TokioExecutor
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        tokio::spawn(fut);
    }
}

/// A future that resolves after some amount of time.
pub trait Sleep: Future<Output = ()> + Send + Sync {}

/// A timer that produces [`Sleep`] futures, used by the pool's sweeper to
/// wait between cleanup passes.
pub trait Timer {
    /// Return a future that resolves in `duration` from now.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Sleep>>;
}

/// A [`Timer`] backed by `tokio::time::sleep`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Sleep>> {
        Box::pin(TokioSleep {
            inner: tokio::time::sleep(duration),
        })
    }
}

pin_project_lite::pin_project! {
    struct TokioSleep {
        #[pin]
        inner: tokio::time::Sleep,
    }
}

impl Future for TokioSleep {
    type Output = ();

    fn poll(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        self.project().inner.poll(cx)
    }
}

impl Sleep for TokioSleep {}

/// Runs the boxed closures submitted by the [`dispatcher`](crate::dispatcher)
/// for each admitted call.
///
/// Call bodies are synchronous: they block the calling thread on the
/// transport engine exactly as described for the dispatcher's worker pool.
/// Implementors own how those threads are created, reused, and retired.
pub trait CallExecutor: fmt::Debug {
    /// Run `task` to completion on a worker owned by this executor.
    ///
    /// Must not block the caller; the task runs asynchronously with respect
    /// to `execute`'s return.
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>);
}

mod cached;
pub use cached::CachedThreadExecutor;

#[cfg(not(target_arch = "wasm32"))]
mod blocking;
#[cfg(not(target_arch = "wasm32"))]
pub use blocking::TokioBlockingExecutor;
