//! # Groupbuy Runtime
//!
//! Runtime plumbing shared by the reservation engine and its worker.
//!
//! ## Components
//!
//! - **Retry**: bounded exponential backoff for operations that lose
//!   optimistic-concurrency races
//! - **Metrics**: Prometheus exporter and per-component recorders
//! - **Tasks**: periodic background jobs with broadcast shutdown

/// Retry logic with exponential backoff
pub mod retry;

/// Prometheus metrics for observability
pub mod metrics;

/// Periodic background tasks and graceful shutdown
pub mod tasks;

pub use retry::{RetryPolicy, retry_with_predicate};
pub use tasks::{Shutdown, shutdown_signal};
