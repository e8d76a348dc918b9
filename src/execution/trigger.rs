//! Run creation shared by manual triggers and the scheduler

use crate::core::{NewRun, Run, RunTotals, TriggerType};
use crate::persistence::Store;
use crate::queue::{ExecuteJob, JobQueue};
use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;

/// Insert a `pending` run pinned to the pipeline's current version and
/// enqueue an `execute` job for it.
///
/// If the enqueue fails the run is marked failed, since no worker will
/// ever pick it up.
pub async fn create_and_enqueue_run(
    store: &dyn Store,
    queue: &dyn JobQueue,
    pipeline_id: Uuid,
    trigger_type: TriggerType,
    input_data: Value,
) -> Result<Run> {
    let pipeline = store
        .get_pipeline(pipeline_id)
        .await?
        .with_context(|| format!("Pipeline {} not found", pipeline_id))?;

    let run = store
        .create_run(NewRun {
            pipeline_id,
            pipeline_version: pipeline.current_version,
            user_id: pipeline.user_id.clone(),
            trigger_type,
            input_data,
        })
        .await?;

    if let Err(e) = queue.enqueue(ExecuteJob::new(run.id)).await {
        let message = format!("Failed to enqueue run: {:#}", e);
        error!(run_id = %run.id, "{}", message);
        if let Err(fail_err) = store.fail_run(run.id, &message, RunTotals::default()).await {
            error!(run_id = %run.id, "Run left pending after enqueue failure: {:#}", fail_err);
        }
        return Err(e).with_context(|| format!("Failed to enqueue run {}", run.id));
    }

    info!(
        run_id = %run.id,
        "Created {} run of {} v{}",
        trigger_type.as_str(),
        pipeline.name,
        pipeline.current_version
    );
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Pipeline, RunStatus};
    use crate::persistence::InMemoryStore;
    use crate::queue::MemoryQueue;
    use serde_json::json;

    #[tokio::test]
    async fn test_run_is_pinned_and_enqueued() {
        let store = InMemoryStore::new();
        let queue = MemoryQueue::new();
        let pipeline_id = Uuid::new_v4();
        store
            .insert_pipeline(
                Pipeline {
                    id: pipeline_id,
                    user_id: "u1".into(),
                    name: "Digest".into(),
                    current_version: 4,
                },
                json!({"name": "Digest", "steps": []}),
            )
            .await;

        let run = create_and_enqueue_run(
            &store,
            &queue,
            pipeline_id,
            TriggerType::Api,
            json!({"q": 1}),
        )
        .await
        .unwrap();

        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.pipeline_version, 4);
        assert_eq!(run.user_id, "u1");
        assert_eq!(queue.next_job().await.unwrap(), Some(ExecuteJob::new(run.id)));
    }

    struct BrokenQueue;

    #[async_trait::async_trait]
    impl JobQueue for BrokenQueue {
        async fn enqueue(&self, _job: ExecuteJob) -> Result<()> {
            anyhow::bail!("queue unavailable")
        }

        async fn next_job(&self) -> Result<Option<ExecuteJob>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_enqueue_failure_fails_the_run() {
        let store = InMemoryStore::new();
        let pipeline_id = Uuid::new_v4();
        store
            .insert_pipeline(
                Pipeline {
                    id: pipeline_id,
                    user_id: "u1".into(),
                    name: "Digest".into(),
                    current_version: 1,
                },
                json!({"name": "Digest", "steps": []}),
            )
            .await;

        let result =
            create_and_enqueue_run(&store, &BrokenQueue, pipeline_id, TriggerType::Cron, json!({}))
                .await;
        assert!(result.is_err());

        let runs = store.list_runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(runs[0].error.as_deref().unwrap().contains("queue unavailable"));
    }

    #[tokio::test]
    async fn test_unknown_pipeline_creates_nothing() {
        let store = InMemoryStore::new();
        let queue = MemoryQueue::new();
        let result =
            create_and_enqueue_run(&store, &queue, Uuid::new_v4(), TriggerType::Manual, json!({}))
                .await;
        assert!(result.is_err());
        assert!(queue.is_empty().await);
        assert!(store.list_runs().await.is_empty());
    }
}
