//! Observability module
//!
//! - 队列计数器与Prometheus指标
//! - 结构化日志事件
//! - 日志与指标导出器的初始化

pub mod metrics_collector;
pub mod structured_logger;
pub mod telemetry_setup;

pub use metrics_collector::MetricsCollector;
pub use structured_logger::{LogFormat, LoggingConfig, StructuredLogger};
pub use telemetry_setup::{init_metrics, init_structured_logging};
