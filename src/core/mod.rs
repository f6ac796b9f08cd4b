// Core module - Retry, shutdown and bridge orchestration
pub mod backoff;
pub mod bridge;
pub mod shutdown;

pub use backoff::{BackoffPolicy, RetryError, RetryState};
pub use bridge::Bridge;
pub use shutdown::Shutdown;
