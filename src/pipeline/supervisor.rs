//! Background task supervisor.
//!
//! Memory persistence runs after the response stream has ended and must
//! never surface failures to the user. The supervisor tracks the spawned
//! jobs per request so tests can deterministically await them.

use crate::error::Result;
use std::future::Future;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Default)]
pub struct TaskSupervisor {
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a fire-and-forget background job. The job's outcome is
    /// logged; it is never propagated.
    pub fn spawn<F>(&self, label: &str, job: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let label = label.to_string();
        let log_label = label.clone();
        let handle = tokio::spawn(async move {
            match job.await {
                Ok(()) => info!("{} completed successfully", log_label),
                Err(e) => error!("{} failed: {}", log_label, e),
            }
        });
        self.handles.lock().unwrap().push((label, handle));
    }

    /// Number of jobs spawned so far (finished or not).
    pub fn spawned_count(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    /// Await every tracked job. Test hook: production callers never join.
    pub async fn join_all(&self) {
        let handles: Vec<_> = {
            let mut guard = self.handles.lock().unwrap();
            guard.drain(..).collect()
        };
        for (label, handle) in handles {
            if let Err(e) = handle.await {
                error!("background task {} panicked: {}", label, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Text2SqlError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_spawned_jobs_run_to_completion() {
        let supervisor = TaskSupervisor::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            supervisor.spawn("save-query-memory", async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        supervisor.join_all().await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(supervisor.spawned_count(), 0);
    }

    #[tokio::test]
    async fn test_failures_are_contained() {
        let supervisor = TaskSupervisor::new();
        supervisor.spawn("save-conversation-summary", async {
            Err(Text2SqlError::Internal("memory backend down".to_string()))
        });
        // join_all must not panic or propagate the error
        supervisor.join_all().await;
    }
}
