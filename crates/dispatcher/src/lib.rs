//! # taskqueue-dispatcher
//!
//! 调度核心的行为层：认领协议、失败重试与死信重放、Worker失效检测、
//! 超时恢复扫描，以及把它们组合起来的 `TaskQueueScheduler` 和
//! `RecoverySupervisor`。

pub mod claim_protocol;
pub mod recovery_service;
pub mod retry_service;
pub mod scheduler;
pub mod supervisor;
pub mod worker_failure_detector;

#[cfg(test)]
pub mod test_utils;

pub use claim_protocol::{ClaimProtocol, ClaimReport};
pub use recovery_service::{RecoveryReport, RecoveryService, TaskRecoveryService};
pub use retry_service::{RetryService, TaskRetryService};
pub use scheduler::TaskQueueScheduler;
pub use supervisor::{RecoverySupervisor, SupervisorReport};
pub use worker_failure_detector::{
    HealthProbe, HealthScanReport, WorkerFailureDetector, WorkerFailureDetectorService,
};
