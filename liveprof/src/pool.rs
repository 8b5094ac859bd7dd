use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::SessionError;

/// Runs CPU-heavy jobs (symbolication, encoding, file writes) on tokio's
/// blocking threads, at most `size` at a time. Callers await the result, so
/// request tasks never do this work themselves.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        WorkerPool {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn idle_workers(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn run<T, F>(&self, job: F) -> Result<T, SessionError>
    where
        F: FnOnce() -> Result<T, SessionError> + Send + 'static,
        T: Send + 'static,
    {
        if self.idle_workers() == 0 {
            log::debug!("All {} workers are busy, queueing the job", self.size);
        }
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SessionError::Worker("the worker pool has shut down".to_string()))?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| SessionError::Worker(e.to_string()))?
    }
}
