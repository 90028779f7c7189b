//! # Utility Modules
//!
//! Supporting utilities used by the server and client orchestration.
//!
//! ## Components
//! - **Tasks**: named countdown tasks advanced by tick (auth timeout, delayed disconnect)
//! - **Metrics**: thread-safe observability counters
//! - **Logging**: tracing-subscriber setup driven by `LoggingConfig`

pub mod logging;
pub mod metrics;
pub mod tasks;

pub use metrics::{Metrics, MetricsSnapshot};
pub use tasks::TaskManager;
