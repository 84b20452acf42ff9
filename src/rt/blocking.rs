use super::CallExecutor;

/// Runs submitted call bodies on the ambient Tokio runtime's blocking pool
/// via [`tokio::task::spawn_blocking`].
///
/// Useful when embedding the dispatcher inside an application that already
/// runs a Tokio runtime and would rather not manage a second thread pool.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioBlockingExecutor;

impl CallExecutor for TokioBlockingExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>) {
        tokio::task::spawn_blocking(task);
    }
}
