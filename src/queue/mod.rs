//! The `execute` job queue
//!
//! Jobs carry only a run id. Each job is delivered to one consumer and is
//! attempted once: a failed run is never re-queued.

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "redis")]
pub use self::redis::RedisQueue;

use crate::execution::{RunOrchestrator, RunOutcome};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Job name used by both the API and the scheduler
pub const EXECUTE_JOB: &str = "execute";

/// Payload of an `execute` job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteJob {
    pub run_id: Uuid,
}

impl ExecuteJob {
    pub fn new(run_id: Uuid) -> Self {
        Self { run_id }
    }
}

/// Queue of `execute` jobs
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: ExecuteJob) -> Result<()>;

    /// Wait for the next job. `None` means nothing arrived in this poll.
    async fn next_job(&self) -> Result<Option<ExecuteJob>>;
}

/// In-process queue for single-process deployments and tests
pub struct MemoryQueue {
    tx: mpsc::UnboundedSender<ExecuteJob>,
    rx: Mutex<mpsc::UnboundedReceiver<ExecuteJob>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Jobs waiting to be consumed
    pub async fn len(&self) -> usize {
        self.rx.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: ExecuteJob) -> Result<()> {
        self.tx
            .send(job)
            .map_err(|_| anyhow::anyhow!("Job queue is closed"))
    }

    async fn next_job(&self) -> Result<Option<ExecuteJob>> {
        Ok(self.rx.lock().await.recv().await)
    }
}

/// Consume jobs until `cancel` fires, running up to `concurrency` runs at once
pub async fn run_consumer(
    queue: Arc<dyn JobQueue>,
    orchestrator: Arc<RunOrchestrator>,
    concurrency: usize,
    cancel: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    info!("Job consumer started with concurrency {}", concurrency.max(1));

    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = queue.next_job() => job,
        };

        let job = match job {
            Ok(Some(job)) => job,
            Ok(None) => continue,
            Err(e) => {
                error!("Failed to read from job queue: {:#}", e);
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
        };

        debug!(run_id = %job.run_id, "Received {} job", EXECUTE_JOB);
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            let _permit = permit;
            match orchestrator.execute_run(job.run_id).await {
                Ok(RunOutcome::Completed { .. }) => {
                    info!(run_id = %job.run_id, "Run completed")
                }
                Ok(outcome) => info!(run_id = %job.run_id, "Run finished: {}", outcome.label()),
                Err(e) => error!(run_id = %job.run_id, "Run could not be executed: {}", e),
            }
        });
    }

    // Wait for in-flight runs
    let _ = permits.acquire_many(concurrency.max(1) as u32).await;
    info!("Job consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_wire_format() {
        let run_id = Uuid::new_v4();
        let json = serde_json::to_value(ExecuteJob::new(run_id)).unwrap();
        assert_eq!(json, serde_json::json!({"runId": run_id.to_string()}));
    }

    #[tokio::test]
    async fn test_memory_queue_is_fifo() {
        let queue = MemoryQueue::new();
        let first = ExecuteJob::new(Uuid::new_v4());
        let second = ExecuteJob::new(Uuid::new_v4());
        queue.enqueue(first).await.unwrap();
        queue.enqueue(second).await.unwrap();

        assert_eq!(queue.len().await, 2);
        assert_eq!(queue.next_job().await.unwrap(), Some(first));
        assert_eq!(queue.next_job().await.unwrap(), Some(second));
        assert!(queue.is_empty().await);
    }
}
