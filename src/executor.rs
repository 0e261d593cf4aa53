//! Executors for handlers that may block
//!
//! Streaming handlers read their message through a blocking
//! [`InputStream`](crate::buffer::InputStream), so they cannot run on the
//! thread that feeds bytes into the connection. The session hands them to an
//! [`Executor`] instead.

use std::sync::Arc;

/// Unit of work handed to an executor
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs blocking handler invocations away from the I/O thread
pub trait Executor: Send + Sync {
    /// Run `task` on some other thread
    fn execute(&self, task: Task);
}

/// Shared handle to an executor
pub type SharedExecutor = Arc<dyn Executor>;

/// Spawns one OS thread per task
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadExecutor;

impl Executor for ThreadExecutor {
    fn execute(&self, task: Task) {
        let spawned = std::thread::Builder::new()
            .name("ws-handler".into())
            .spawn(task);
        if let Err(err) = spawned {
            tracing::error!(%err, "failed to spawn handler thread");
        }
    }
}

/// Runs tasks on tokio's blocking thread pool
#[cfg(feature = "tokio-runtime")]
#[derive(Debug, Clone)]
pub struct TokioBlockingExecutor {
    handle: tokio::runtime::Handle,
}

#[cfg(feature = "tokio-runtime")]
impl TokioBlockingExecutor {
    /// Use the runtime the caller is running in
    ///
    /// Returns `None` outside of a tokio runtime.
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current()
            .ok()
            .map(|handle| Self { handle })
    }

    /// Use a specific runtime
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }
}

#[cfg(feature = "tokio-runtime")]
impl Executor for TokioBlockingExecutor {
    fn execute(&self, task: Task) {
        // The JoinHandle is dropped; the task still runs to completion
        drop(self.handle.spawn_blocking(task));
    }
}

/// Executor used when none is configured
pub fn default_executor() -> SharedExecutor {
    Arc::new(ThreadExecutor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_thread_executor_runs_off_thread() {
        let (tx, rx) = mpsc::channel();
        let caller = std::thread::current().id();
        ThreadExecutor.execute(Box::new(move || {
            tx.send(std::thread::current().id()).unwrap();
        }));
        let worker = rx.recv().unwrap();
        assert_ne!(worker, caller);
    }

    #[cfg(feature = "tokio-runtime")]
    #[tokio::test]
    async fn test_tokio_blocking_executor() {
        let executor = TokioBlockingExecutor::current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        executor.execute(Box::new(move || {
            let _ = tx.send(42);
        }));
        assert_eq!(rx.await.unwrap(), 42);
    }
}
