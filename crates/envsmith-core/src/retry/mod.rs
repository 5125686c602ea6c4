//! Retry execution engine with policy-based configuration
//!
//! Used by the download pipeline to retry a single URL with backoff before
//! falling through to mirrors.
//!
//! - Strategies: None, Fixed, Exponential, Linear backoff, capped, with optional jitter
//! - `RetryPredicate` short-circuits errors that retrying cannot fix
//! - `RetryObserver` receives attempt callbacks; `TracingObserver` logs them
//! - Cooperative cancellation through a `CancellationToken`, honoured between
//!   attempts and during backoff sleeps
//!
//! # Example
//!
//! ```rust,no_run
//! use envsmith_core::retry::{retry_with_policy, RetryError};
//! use envsmith_core::types::RetryPolicy;
//!
//! async fn example() -> Result<String, RetryError<std::io::Error>> {
//!     let policy = RetryPolicy::default();
//!
//!     retry_with_policy(&policy, || async {
//!         Ok("success".to_string())
//!     }).await
//! }
//! ```

mod error;
mod executor;
mod observer;
mod strategies;

pub use error::RetryError;
pub use executor::{retry_with_policy, RetryExecutor, RetryExecutorBuilder};
pub use observer::{NoOpObserver, RetryObserver, StatsObserver, TracingObserver};
pub use strategies::{calculate_delay, AlwaysRetry, ClosurePredicate, RetryPredicate};
