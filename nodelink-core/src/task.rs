//! Task spawning abstraction.

use std::future::Future;

/// Provider for spawning background tasks.
///
/// Every socket driver, dial attempt, keepalive probe and scheduled
/// reconnect is spawned through this trait so it carries a name in logs.
pub trait TaskProvider: Clone + Send + Sync + 'static {
    /// Spawn a named task on the runtime.
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Tokio-based task provider.
#[derive(Debug, Clone, Default)]
pub struct TokioTaskProvider;

impl TaskProvider for TokioTaskProvider {
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task_name = name.to_string();
        tokio::spawn(async move {
            tracing::trace!(task = %task_name, "task started");
            future.await;
            tracing::trace!(task = %task_name, "task finished");
        })
    }
}
