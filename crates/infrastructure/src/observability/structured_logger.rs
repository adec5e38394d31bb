//! Structured logging utilities
//!
//! Event helpers for task lifecycle, worker membership and recovery actions.
//! Every helper emits an `event` field so that JSON logs can be filtered by kind.

use chrono::{DateTime, Utc};
use taskqueue_core::models::{RetryDecision, Task, TransitionReason, WorkerInfo};
use tracing::{debug, error, info, warn};

/// Structured logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_location: bool,
    pub include_thread_id: bool,
    pub include_thread_name: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// 未知格式回退为 pretty
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_location: false,
            include_thread_id: false,
            include_thread_name: false,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: impl Into<String>, format: &str) -> Self {
        Self {
            level: level.into(),
            format: LogFormat::parse(format),
            ..Self::default()
        }
    }
}

/// Structured logging utilities
pub struct StructuredLogger;

impl StructuredLogger {
    /// Log task submission
    pub fn log_task_submitted(task: &Task, created: bool) {
        if created {
            info!(
                event = "task_submitted",
                task.id = %task.id,
                task.priority = task.priority.as_str(),
                task.timeout_ms = task.timeout_ms,
                task.max_retries = task.max_retries,
                "Task submitted"
            );
        } else {
            debug!(
                event = "task_deduplicated",
                task.id = %task.id,
                task.idempotency_key = task.idempotency_key.as_deref().unwrap_or_default(),
                "Submission matched an existing idempotency key"
            );
        }
    }

    /// Log task claim by a worker
    pub fn log_task_claimed(task: &Task, worker_id: &str, promoted: bool) {
        info!(
            event = "task_claimed",
            task.id = %task.id,
            task.priority = task.priority.as_str(),
            task.retry_count = task.retry_count,
            task.promoted = promoted,
            worker.id = worker_id,
            "Task claimed"
        );
    }

    /// Log a terminal or retried task report
    pub fn log_task_finished(task: &Task, worker_id: &str, success: bool, duration_ms: Option<i64>) {
        if success {
            info!(
                event = "task_completed",
                task.id = %task.id,
                worker.id = worker_id,
                task.duration_ms = duration_ms,
                "Task completed successfully"
            );
        } else {
            warn!(
                event = "task_failed",
                task.id = %task.id,
                worker.id = worker_id,
                task.duration_ms = duration_ms,
                task.error = task.last_error.as_deref().unwrap_or("Unknown error"),
                "Task execution failed"
            );
        }
    }

    /// Log the retry decision taken after a failure or a recovery
    pub fn log_retry_decision(task: &Task, decision: &RetryDecision) {
        match decision {
            RetryDecision::Requeue {
                retry_count,
                timeout_ms,
                counted,
            } => {
                info!(
                    event = "task_requeued",
                    task.id = %task.id,
                    task.retry_count = retry_count,
                    task.max_retries = task.max_retries,
                    task.timeout_ms = timeout_ms,
                    task.counted = counted,
                    "Task requeued"
                );
            }
            RetryDecision::DeadLetter {
                retry_count,
                reason,
            } => {
                error!(
                    event = "task_dead_lettered",
                    task.id = %task.id,
                    task.retry_count = retry_count,
                    task.reason = reason.as_str(),
                    task.error = task.last_error.as_deref().unwrap_or_default(),
                    "Task moved to dead letter"
                );
            }
        }
    }

    /// Log recovery of an abandoned task
    pub fn log_task_recovered(task: &Task, worker_id: &str, reason: TransitionReason) {
        warn!(
            event = "task_recovered",
            task.id = %task.id,
            task.status = task.status.as_str(),
            worker.id = worker_id,
            recovery.reason = reason.as_str(),
            "Abandoned task recovered"
        );
    }

    /// Log worker registration
    pub fn log_worker_registered(worker: &WorkerInfo) {
        info!(
            event = "worker_registered",
            worker.id = %worker.id,
            worker.hostname = worker.hostname.as_deref().unwrap_or_default(),
            worker.capabilities = ?worker.capabilities,
            worker.capacity = worker.capacity,
            "Worker registered"
        );
    }

    /// Log worker heartbeat
    pub fn log_worker_heartbeat(worker: &WorkerInfo) {
        debug!(
            event = "worker_heartbeat",
            worker.id = %worker.id,
            worker.load = worker.load,
            worker.reported_load = worker.reported_load,
            worker.capacity = worker.capacity,
            "Worker heartbeat received"
        );
    }

    /// Log a worker being declared unreachable
    pub fn log_worker_unreachable(
        worker: &WorkerInfo,
        last_heartbeat: DateTime<Utc>,
        recovered: usize,
    ) {
        error!(
            event = "worker_unreachable",
            worker.id = %worker.id,
            worker.last_heartbeat = %last_heartbeat,
            worker.reason = worker.unreachable_reason.as_deref().unwrap_or_default(),
            recovery.tasks = recovered,
            "Worker marked unreachable"
        );
    }

    /// Log a late or repeated report that was ignored
    pub fn log_ignored_report(task: &Task, worker_id: &str, kind: &str) {
        debug!(
            event = "report_ignored",
            task.id = %task.id,
            task.status = task.status.as_str(),
            task.attempt = task.attempt,
            worker.id = worker_id,
            report.kind = kind,
            "Report ignored"
        );
    }

    /// Log system error
    pub fn log_system_error(component: &str, operation: &str, error: &dyn std::error::Error) {
        error!(
            event = "system_error",
            error.component = component,
            error.operation = operation,
            error.message = %error,
            "System error occurred"
        );
    }
}
