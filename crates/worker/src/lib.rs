//! # taskqueue-worker
//!
//! Worker侧代理：注册、心跳、按容量轮询认领、执行任务并上报结果，
//! 根据心跳回执中止已被取消或回收的任务。

pub mod agent;
pub mod components;
pub mod handler;

pub use agent::{WorkerAgent, WorkerAgentBuilder};
pub use components::{HeartbeatManager, TaskExecutionManager, WorkerLifecycle};
pub use handler::{HandlerError, SimulatedHandler, TaskHandler};
