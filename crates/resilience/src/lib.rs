//! embedgate resilience
//!
//! Everything that stands between the engine and a flaky device backend lives
//! here. A [`ResilienceGuard`] owns one [`CircuitBreaker`] and one
//! [`RetryConfig`] and wraps every backend call made against a single device.
//!
//! The moving parts:
//!
//! - **Circuit breaker** - `Closed` → `Open` after too many failures, a single
//!   `HalfOpen` probe after the recovery timeout, back to `Closed` on success.
//! - **Retry** - exponential backoff (`base * 2^attempt`, capped) with ±10%
//!   jitter. Only transient errors are retried.
//! - **Request context** - cancellation signal plus optional deadline. Retry
//!   sleeps wake up early when the caller gives up.
//!
//! ## Quick example
//!
//! ```no_run
//! use resilience::{BackendError, RequestContext, ResilienceGuard, ResilienceConfig};
//!
//! # async fn demo() {
//! let guard = ResilienceGuard::new("gpu:0", ResilienceConfig::default());
//! let ctx = RequestContext::background();
//!
//! let vectors = guard
//!     .call(&ctx, |_attempt| async { Ok::<_, BackendError>(vec![vec![0.0f32; 4]]) })
//!     .await;
//! assert!(vectors.is_ok());
//! # }
//! ```

pub mod circuit_breaker;
pub mod context;
pub mod error;
pub mod guard;
pub mod retry;
pub mod serde_millis;

pub use crate::circuit_breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState, Permit,
};
pub use crate::context::{CancelHandle, RequestContext};
pub use crate::error::{default_classifier, BackendError, CallOutcome, Classifier, GuardError};
pub use crate::guard::{ResilienceConfig, ResilienceGuard};
pub use crate::retry::{is_retryable_error, RetryConfig};
