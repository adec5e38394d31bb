use chrono::{DateTime, Utc};
use taskqueue_core::config::QueueConfig;

pub fn start_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

pub fn queue_config() -> QueueConfig {
    QueueConfig {
        priority_gap_seconds: 60,
        max_wait_seconds: 600,
        ..QueueConfig::default()
    }
}
