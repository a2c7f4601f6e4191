//! Owned registry of fire-and-forget background tasks.
//!
//! Replaces the source's process-wide "hold a strong ref so the future
//! doesn't get collected" set with an owned registry: the connections
//! manager holds one, tasks deregister themselves on completion, and
//! dropping the registry aborts anything still in flight.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

#[derive(Default)]
pub struct BackgroundTasks {
    handles: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
    next_id: AtomicU64,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `fut`, tracking it until it completes.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handles = self.handles.clone();
        let handle = tokio::spawn(async move {
            fut.await;
            handles.lock().unwrap().remove(&id);
        });
        self.handles.lock().unwrap().insert(id, handle);
    }

    pub fn len(&self) -> usize {
        self.handles.lock().unwrap().len()
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for (_, handle) in self.handles.lock().unwrap().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[tokio::test]
    async fn spawned_task_runs_and_deregisters() {
        let tasks = BackgroundTasks::new();
        let done = Arc::new(AtomicBool::new(false));
        let done_clone = done.clone();
        tasks.spawn(async move {
            done_clone.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(tasks.len(), 0);
    }

    #[tokio::test]
    async fn dropping_registry_aborts_pending_tasks() {
        let done = Arc::new(AtomicBool::new(false));
        {
            let tasks = BackgroundTasks::new();
            let done_clone = done.clone();
            tasks.spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                done_clone.store(true, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!done.load(Ordering::SeqCst));
    }
}
