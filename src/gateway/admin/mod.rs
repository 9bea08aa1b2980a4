//! 管理接口：Cookie 与运行时配置。

pub mod handler;

pub use handler::*;
