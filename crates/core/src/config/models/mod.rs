pub mod app_config;
pub mod observability;
pub mod queue_retry;
pub mod recovery_worker;
pub mod store;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use observability::ObservabilityConfig;
pub use queue_retry::{QueueConfig, RetryConfig};
pub use recovery_worker::{RecoveryConfig, WorkerConfig};
pub use store::{StoreBackend, StoreConfig};
