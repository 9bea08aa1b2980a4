pub mod health_task;
pub mod pool;
pub mod types;

pub use health_task::{HealthChecker, HealthCheckerHandle};
pub use pool::CredentialPool;
