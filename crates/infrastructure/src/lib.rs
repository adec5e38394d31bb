//! # taskqueue-infrastructure
//!
//! 队列存储的内存与SQLite实现、存储工厂，以及日志和指标设施。

pub mod database;
pub mod in_memory_store;
pub mod observability;
pub mod store_factory;

pub use database::*;
pub use in_memory_store::InMemoryQueueStore;
pub use observability::*;
pub use store_factory::QueueStoreFactory;
