//! taskqueue 可执行程序的应用装配与关闭管理

pub mod app;
pub mod shutdown;
