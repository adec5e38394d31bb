//! 两种存储实现必须表现一致的行为

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use taskqueue_core::config::{QueueConfig, StoreBackend, StoreConfig};
use taskqueue_core::models::{
    ClaimOutcome, NoopKind, RetryPolicy, Task, TaskPriority, TaskStatus, TaskSubmission,
    Transition, TransitionOutcome, TransitionReason, WorkerRegistration,
};
use taskqueue_core::traits::{QueueStore, WorkerRecovery};
use taskqueue_core::ScoreFunction;
use taskqueue_infrastructure::QueueStoreFactory;
use tempfile::TempDir;

fn scorer() -> ScoreFunction {
    ScoreFunction::new(Duration::seconds(60), Duration::seconds(600))
}

fn start() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn reregistered() -> WorkerRecovery {
    WorkerRecovery::reregistered(RetryPolicy::default())
}

async fn backends(dir: &TempDir) -> Result<Vec<(&'static str, Arc<dyn QueueStore>)>> {
    let memory = QueueStoreFactory::create(&StoreConfig::default(), scorer()).await?;
    let sqlite_config = StoreConfig {
        backend: StoreBackend::Sqlite,
        sqlite_url: format!("sqlite://{}?mode=rwc", dir.path().join("contract.db").display()),
        ..StoreConfig::default()
    };
    let sqlite = QueueStoreFactory::create(&sqlite_config, scorer()).await?;
    Ok(vec![("memory", memory), ("sqlite", sqlite)])
}

fn new_task(priority: TaskPriority, created_at: DateTime<Utc>) -> Task {
    Task::from_submission(
        TaskSubmission::new(priority),
        &QueueConfig::default(),
        created_at,
    )
}

#[tokio::test]
async fn test_priority_order_with_aging() -> Result<()> {
    let dir = tempfile::tempdir()?;
    for (name, store) in backends(&dir).await? {
        let now = start();
        let old_low = new_task(TaskPriority::Low, now);
        let high = new_task(TaskPriority::High, now + Duration::seconds(700));
        let medium = new_task(TaskPriority::Medium, now + Duration::seconds(700));
        for task in [&old_low, &high, &medium] {
            store.insert_task(task.clone(), now).await?;
        }

        // 低优先级任务已等待超过最大等待时间，排在最前
        let at = now + Duration::seconds(701);
        let ids: Vec<_> = store
            .peek_visible(at, 10, &HashSet::new())
            .await?
            .into_iter()
            .map(|entry| entry.task_id)
            .collect();
        assert_eq!(ids, vec![old_low.id, high.id, medium.id], "backend {name}");

        let exclude: HashSet<_> = [old_low.id].into_iter().collect();
        let ids: Vec<_> = store
            .peek_visible(at, 1, &exclude)
            .await?
            .into_iter()
            .map(|entry| entry.task_id)
            .collect();
        assert_eq!(ids, vec![high.id], "backend {name}");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_have_single_winner() -> Result<()> {
    let dir = tempfile::tempdir()?;
    for (name, store) in backends(&dir).await? {
        let now = start();
        let task = new_task(TaskPriority::High, now);
        store.insert_task(task.clone(), now).await?;
        for i in 0..8 {
            store
                .register_worker(
                    WorkerRegistration::new(1).with_id(format!("w{i}")),
                    reregistered(),
                    now,
                )
                .await?;
        }

        let handles = (0..8).map(|i| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .claim(task.id, &format!("w{i}"), now, now + Duration::seconds(30))
                    .await
            })
        });
        let results = futures::future::join_all(handles).await;

        let mut winners = 0;
        for result in results {
            if let ClaimOutcome::Claimed(claimed) = result?? {
                assert_eq!(claimed.status, TaskStatus::Claimed);
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "backend {name}");
        assert!(store
            .peek_visible(now, 10, &HashSet::new())
            .await?
            .is_empty());
    }
    Ok(())
}

#[tokio::test]
async fn test_reports_are_classified() -> Result<()> {
    let dir = tempfile::tempdir()?;
    for (name, store) in backends(&dir).await? {
        let now = start();
        let task = new_task(TaskPriority::Medium, now);
        store.insert_task(task.clone(), now).await?;
        store
            .register_worker(WorkerRegistration::new(2).with_id("owner"), reregistered(), now)
            .await?;
        store
            .claim(task.id, "owner", now, now + Duration::seconds(30))
            .await?;

        let complete = Transition::Complete {
            worker_id: "owner".to_string(),
            attempt: 1,
            output: Some(serde_json::json!({"ok": true})),
        };
        let first = store
            .apply_transition(task.id, complete.clone(), now + Duration::seconds(1))
            .await?;
        assert!(first.is_applied(), "backend {name}");
        assert_eq!(first.task().status, TaskStatus::Completed);

        let repeat = store
            .apply_transition(task.id, complete, now + Duration::seconds(2))
            .await?;
        assert!(
            matches!(
                repeat,
                TransitionOutcome::Noop {
                    kind: NoopKind::AlreadyApplied,
                    ..
                }
            ),
            "backend {name}"
        );

        let late = store
            .apply_transition(
                task.id,
                Transition::Fail {
                    worker_id: "someone-else".to_string(),
                    attempt: 1,
                    error: "boom".to_string(),
                    retriable: true,
                    policy: RetryPolicy::default(),
                },
                now + Duration::seconds(3),
            )
            .await?;
        assert!(
            matches!(
                late,
                TransitionOutcome::Noop {
                    kind: NoopKind::Stale,
                    ..
                }
            ),
            "backend {name}"
        );

        let worker = store.get_worker("owner").await?.unwrap();
        assert_eq!(worker.load, 0, "backend {name}");
    }
    Ok(())
}

#[tokio::test]
async fn test_unknown_task_is_not_found() -> Result<()> {
    let dir = tempfile::tempdir()?;
    for (name, store) in backends(&dir).await? {
        let missing = new_task(TaskPriority::Low, start());
        let result = store
            .apply_transition(missing.id, Transition::Cancel { reason: None }, start())
            .await;
        assert!(result.is_err(), "backend {name}");
        assert!(store.get_task(missing.id).await?.is_none());
    }
    Ok(())
}

#[tokio::test]
async fn test_reregistration_recovers_tasks_of_previous_instance() -> Result<()> {
    let dir = tempfile::tempdir()?;
    for (name, store) in backends(&dir).await? {
        let now = start();
        let first = new_task(TaskPriority::High, now);
        let second = new_task(TaskPriority::High, now);
        store.insert_task(first.clone(), now).await?;
        store.insert_task(second.clone(), now).await?;
        store
            .register_worker(WorkerRegistration::new(2).with_id("w1"), reregistered(), now)
            .await?;
        let until = now + Duration::seconds(30);
        for task in [&first, &second] {
            assert!(matches!(
                store.claim(task.id, "w1", now, until).await?,
                ClaimOutcome::Claimed(_)
            ));
        }

        // 同一ID以更小的容量重新注册，旧实例持有的任务全部回收
        let later = now + Duration::seconds(5);
        let outcome = store
            .register_worker(WorkerRegistration::new(1).with_id("w1"), reregistered(), later)
            .await?;
        assert_eq!(outcome.recovered.len(), 2, "backend {name}");
        assert_eq!(outcome.worker.capacity, 1, "backend {name}");
        assert_eq!(outcome.worker.load, 0, "backend {name}");
        assert!(store.tasks_owned_by("w1").await?.is_empty(), "backend {name}");

        for task in [&first, &second] {
            let recovered = store.get_task(task.id).await?.unwrap();
            assert_eq!(recovered.status, TaskStatus::Queued, "backend {name}");
            assert_eq!(recovered.retry_count, 1, "backend {name}");
            assert_eq!(
                recovered.history.iter().rev().nth(1).map(|r| r.reason),
                Some(TransitionReason::WorkerReregistered),
                "backend {name}"
            );
        }

        // 新实例按新容量认领
        assert!(matches!(
            store.claim(first.id, "w1", later, later + Duration::seconds(30)).await?,
            ClaimOutcome::Claimed(_)
        ));
        assert_eq!(
            store.claim(second.id, "w1", later, later + Duration::seconds(30)).await?,
            ClaimOutcome::WorkerFull,
            "backend {name}"
        );
    }
    Ok(())
}
