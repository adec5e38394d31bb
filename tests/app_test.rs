use std::time::Duration;

use taskqueue::app::{submit_demo_burst, AppMode, Application};
use taskqueue::shutdown::ShutdownManager;
use taskqueue_core::config::{AppConfig, StoreBackend};
use taskqueue_core::traits::TaskQueueService;

fn demo_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.worker.poll_interval_ms = 20;
    config
}

#[test]
fn test_app_mode_parsing() {
    assert_eq!("supervisor".parse::<AppMode>().unwrap(), AppMode::Supervisor);
    assert_eq!("demo".parse::<AppMode>().unwrap(), AppMode::Demo);
    assert!("dispatcher".parse::<AppMode>().is_err());
}

#[tokio::test]
async fn test_demo_burst_is_idempotent() {
    let app = Application::new(AppConfig::default(), AppMode::Supervisor)
        .await
        .unwrap();
    let scheduler = app.scheduler();

    assert_eq!(submit_demo_burst(scheduler.as_ref(), 10).await.unwrap(), 10);
    assert_eq!(submit_demo_burst(scheduler.as_ref(), 10).await.unwrap(), 0);

    let stats = scheduler.queue_stats().await.unwrap();
    assert_eq!(stats.queued, 10);
    assert_eq!(scheduler.counters().deduplicated, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_demo_mode_drains_burst_and_shuts_down() {
    let app = std::sync::Arc::new(
        Application::new(demo_config(), AppMode::Demo)
            .await
            .unwrap(),
    );
    let scheduler = app.scheduler();
    let shutdown = ShutdownManager::new();

    let handle = {
        let app = app.clone();
        let shutdown_rx = shutdown.subscribe().await;
        tokio::spawn(async move { app.run(shutdown_rx).await })
    };

    let mut finished = false;
    for _ in 0..500 {
        let counters = scheduler.counters();
        if counters.submitted == 30 && counters.completed + counters.dead_lettered == 30 {
            finished = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(finished, "demo burst did not drain: {:?}", scheduler.counters());

    shutdown.shutdown().await;
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let stats = scheduler.queue_stats().await.unwrap();
    assert_eq!(stats.queued + stats.claimed + stats.executing, 0);
    assert_eq!(stats.dead_letter as u64, scheduler.counters().dead_lettered);
}

#[tokio::test]
async fn test_supervisor_mode_on_sqlite_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.store.backend = StoreBackend::Sqlite;
    config.store.sqlite_url = format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("queue.db").display()
    );

    let app = Application::new(config.clone(), AppMode::Supervisor)
        .await
        .unwrap();
    assert_eq!(submit_demo_burst(app.scheduler().as_ref(), 5).await.unwrap(), 5);
    drop(app);

    // 重新打开同一个数据库文件，已提交的任务仍然在队列中
    let reopened = Application::new(config, AppMode::Supervisor).await.unwrap();
    let stats = reopened.scheduler().queue_stats().await.unwrap();
    assert_eq!(stats.queued, 5);
    assert_eq!(
        submit_demo_burst(reopened.scheduler().as_ref(), 5).await.unwrap(),
        0
    );
}
