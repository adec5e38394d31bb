mod common;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use common::{start_time, test_config, Harness};
use taskqueue_core::config::{StoreBackend, StoreConfig};
use taskqueue_core::models::{TaskId, TaskOutcome, TaskPriority, TaskStatus, TaskSubmission};
use taskqueue_core::traits::{ManualClock, TaskQueueService};
use taskqueue_core::ScoreFunction;
use taskqueue_dispatcher::TaskQueueScheduler;
use taskqueue_infrastructure::QueueStoreFactory;

const TASKS: usize = 60;
const WORKERS: usize = 8;

/// 多个Worker并发轮询直到队列清空，返回每个Worker认领到的任务
async fn drain_concurrently(
    scheduler: Arc<TaskQueueScheduler>,
    worker_ids: Vec<String>,
) -> Result<Vec<TaskId>> {
    let mut handles = Vec::new();
    for worker_id in worker_ids {
        let scheduler = Arc::clone(&scheduler);
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                let tasks = scheduler.poll(&worker_id, 2).await?;
                if tasks.is_empty() {
                    break;
                }
                for task in tasks {
                    scheduler
                        .report_start(&worker_id, task.id, task.attempt)
                        .await?;
                    scheduler
                        .report_result(
                            &worker_id,
                            task.id,
                            task.attempt,
                            TaskOutcome::success(None),
                        )
                        .await?;
                    claimed.push(task.id);
                }
            }
            Ok::<_, taskqueue_core::SchedulerError>(claimed)
        }));
    }

    let mut all = Vec::new();
    for claimed in futures::future::try_join_all(handles).await? {
        all.extend(claimed?);
    }
    Ok(all)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pollers_never_share_a_task() -> Result<()> {
    let h = Harness::new();
    h.at(0);
    let mut submitted = HashSet::new();
    for i in 0..TASKS {
        let priority = TaskPriority::ALL[i % TaskPriority::ALL.len()];
        submitted.insert(h.submit(priority).await);
    }
    let mut worker_ids = Vec::new();
    for i in 0..WORKERS {
        worker_ids.push(h.worker(&format!("w{i}"), 2).await);
    }

    let claimed = drain_concurrently(Arc::clone(&h.scheduler), worker_ids).await?;
    let unique: HashSet<_> = claimed.iter().copied().collect();
    assert_eq!(claimed.len(), TASKS);
    assert_eq!(unique, submitted);

    let counters = h.scheduler.counters();
    assert_eq!(counters.claimed, TASKS as u64);
    assert_eq!(counters.completed, TASKS as u64);
    assert_eq!(counters.stale_reports, 0);
    for worker in h.scheduler.worker_stats().await? {
        assert_eq!(worker.load, 0);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pollers_on_sqlite_store() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = test_config();
    let store_config = StoreConfig {
        backend: StoreBackend::Sqlite,
        sqlite_url: format!("sqlite://{}?mode=rwc", dir.path().join("queue.db").display()),
        ..StoreConfig::default()
    };
    let store =
        QueueStoreFactory::create(&store_config, ScoreFunction::from_config(&config.queue)).await?;
    let scheduler = Arc::new(TaskQueueScheduler::new(
        store,
        Arc::new(ManualClock::new(start_time())),
        &config,
    ));

    let mut submitted = HashSet::new();
    for i in 0..TASKS / 2 {
        let submission = TaskSubmission::new(TaskPriority::Medium)
            .with_payload(serde_json::json!({ "seq": i }));
        submitted.insert(scheduler.submit(submission).await?.task_id);
    }
    let mut worker_ids = Vec::new();
    for i in 0..WORKERS / 2 {
        let registration =
            taskqueue_core::models::WorkerRegistration::new(2).with_id(format!("sqlite-w{i}"));
        worker_ids.push(scheduler.register_worker(registration).await?.id);
    }

    let claimed = drain_concurrently(Arc::clone(&scheduler), worker_ids).await?;
    let unique: HashSet<_> = claimed.iter().copied().collect();
    assert_eq!(claimed.len(), submitted.len());
    assert_eq!(unique, submitted);

    for task_id in submitted {
        let task = scheduler.get_status(task_id).await?;
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.assigned_worker.is_none());
    }
    Ok(())
}
