use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::warn;

/// Bounded runner for best-effort side effects.
///
/// At most `capacity` jobs run at once; a job submitted while the runner is
/// full is rejected. Every job gets its own timeout. Rejections, failures
/// and timeouts are logged and counted.
#[derive(Clone)]
pub struct BackgroundTasks {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    timeout: Duration,
}

impl BackgroundTasks {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            tracker: TaskTracker::new(),
            timeout,
        }
    }

    /// Returns false if the job was rejected because the runner is full.
    pub fn spawn<F>(&self, name: &'static str, job: F) -> bool
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(task = name, "Background runner is full, dropping task");
                metrics::counter!("background_tasks_rejected_total", "task" => name).increment(1);
                return false;
            }
        };

        let timeout = self.timeout;
        self.tracker.spawn(async move {
            let _permit = permit;
            match tokio::time::timeout(timeout, job).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(task = name, "Background task failed: {:#}", e);
                    metrics::counter!("background_tasks_failed_total", "task" => name).increment(1);
                }
                Err(_) => {
                    warn!(task = name, timeout_ms = timeout.as_millis() as u64, "Background task timed out");
                    metrics::counter!("background_tasks_timed_out_total", "task" => name).increment(1);
                }
            }
        });
        true
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Waits up to `grace` for in-flight jobs; stragglers are abandoned.
    pub async fn shutdown(&self, grace: Duration) {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(remaining = self.tracker.len(), "Abandoning unfinished background tasks");
        }
    }
}
