use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    time::Duration,
};

use super::CallExecutor;
use crate::sync::Mutex;

const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    sender: mpsc::Sender<Task>,
    // `mpsc::Receiver` is `Send` but not `Sync`; every worker thread holds
    // its own `Arc<Inner>` clone and locks this to pull the next task, the
    // same pattern as a textbook Rust thread pool.
    receiver: Mutex<mpsc::Receiver<Task>>,
    thread_count: AtomicUsize,
    pending_count: AtomicUsize,
}

/// An unbounded thread pool that creates threads on demand and lets idle
/// threads terminate after [`IDLE_TIMEOUT`].
///
/// Submission never blocks: `execute` hands the task to an `mpsc` channel
/// and, if the queue is deeper than the current thread count, spawns one
/// more worker. At least one worker is always kept alive.
pub struct CachedThreadExecutor {
    inner: Arc<Inner>,
}

impl CachedThreadExecutor {
    /// Creates a new executor with a single initial worker thread.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        let inner = Arc::new(Inner {
            sender,
            receiver: Mutex::new(receiver),
            thread_count: AtomicUsize::new(0),
            pending_count: AtomicUsize::new(0),
        });
        spawn_worker(&inner);
        CachedThreadExecutor { inner }
    }

    /// Returns the number of worker threads currently alive.
    pub fn thread_count(&self) -> usize {
        self.inner.thread_count.load(Ordering::Relaxed)
    }
}

impl Default for CachedThreadExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for CachedThreadExecutor {
    fn clone(&self) -> Self {
        CachedThreadExecutor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl fmt::Debug for CachedThreadExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedThreadExecutor")
            .field("threads", &self.inner.thread_count.load(Ordering::Relaxed))
            .field("pending", &self.inner.pending_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl CallExecutor for CachedThreadExecutor {
    fn execute(&self, task: Task) {
        let prev_pending = self.inner.pending_count.fetch_add(1, Ordering::Relaxed);
        let threads = self.inner.thread_count.load(Ordering::Acquire);

        // Hidden queue depth is growing faster than we have workers to
        // drain it: scale up, bounded only by the caller's own admission
        // limits (this pool itself is unbounded, per the dispatcher's
        // worker executor contract).
        if prev_pending >= threads
            && self
                .inner
                .thread_count
                .compare_exchange(threads, threads + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            spawn_worker_already_counted(&self.inner);
        }

        // The channel is unbounded; send only fails if every worker has
        // exited, which cannot happen while `self.inner` is still alive
        // (the last worker always keeps itself counted).
        let _ = self.inner.sender.send(task);
    }
}

fn spawn_worker(inner: &Arc<Inner>) {
    inner.thread_count.fetch_add(1, Ordering::AcqRel);
    spawn_worker_already_counted(inner);
}

fn spawn_worker_already_counted(inner: &Arc<Inner>) {
    let inner = Arc::clone(inner);
    let _ = std::thread::Builder::new()
        .name("reqcore-call-worker".into())
        .spawn(move || worker_loop(&inner));
}

fn worker_loop(inner: &Inner) {
    loop {
        // Lock only long enough to pop the next task off the channel; the
        // guard is dropped here, before `task()` runs, so other idle
        // workers aren't blocked out of `recv_timeout` while this one works.
        let received = inner.receiver.lock().recv_timeout(IDLE_TIMEOUT);
        match received {
            Ok(task) => {
                task();
                inner.pending_count.fetch_sub(1, Ordering::Relaxed);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let mut count = inner.thread_count.load(Ordering::Relaxed);
                loop {
                    if count <= 1 {
                        // Last worker alive: keep running rather than let
                        // the pool go to zero threads.
                        break;
                    }
                    match inner.thread_count.compare_exchange_weak(
                        count,
                        count - 1,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => return,
                        Err(actual) => count = actual,
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                inner.thread_count.fetch_sub(1, Ordering::AcqRel);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;

    use super::*;

    #[test]
    fn runs_submitted_task() {
        let exec = CachedThreadExecutor::new();
        let (tx, rx) = channel();
        exec.execute(Box::new(move || {
            tx.send(42).unwrap();
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 42);
    }

    #[test]
    fn scales_up_under_load() {
        let exec = CachedThreadExecutor::new();
        let (tx, rx) = channel();
        for _ in 0..8 {
            let tx = tx.clone();
            exec.execute(Box::new(move || {
                std::thread::sleep(Duration::from_millis(50));
                tx.send(()).unwrap();
            }));
        }
        for _ in 0..8 {
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }
        assert!(exec.thread_count() >= 1);
    }
}
