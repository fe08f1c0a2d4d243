//! One guard per device: breaker check, retry loop, one breaker signal per call.

use serde::{Deserialize, Serialize};
use std::future::Future;

use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::context::RequestContext;
use crate::error::{default_classifier, BackendError, CallOutcome, Classifier, GuardError};
use crate::retry::RetryConfig;

/// Breaker + retry settings for one guard.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResilienceConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
}

impl ResilienceConfig {
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }
}

/// Wraps every backend call made against one device.
pub struct ResilienceGuard {
    name: String,
    breaker: CircuitBreaker,
    retry: RetryConfig,
    classifier: Classifier,
}

impl std::fmt::Debug for ResilienceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceGuard")
            .field("name", &self.name)
            .field("breaker", &self.breaker)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ResilienceGuard {
    pub fn new(name: impl Into<String>, config: ResilienceConfig) -> Self {
        Self::with_classifier(name, config, default_classifier())
    }

    pub fn with_classifier(
        name: impl Into<String>,
        config: ResilienceConfig,
        classifier: Classifier,
    ) -> Self {
        let name = name.into();
        Self {
            breaker: CircuitBreaker::new(name.clone(), config.circuit_breaker),
            name,
            retry: config.retry,
            classifier,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn state(&self) -> CircuitState {
        self.breaker.current_state()
    }

    /// Whether the scheduler may route work here.
    pub fn is_available(&self) -> bool {
        self.breaker.is_available()
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    /// Run `operation` under the breaker and retry policy.
    ///
    /// `operation` receives the 0-indexed attempt number. An in-flight attempt
    /// is always awaited to completion; cancellation is observed before each
    /// attempt and during backoff sleeps. The breaker receives exactly one
    /// success or failure for the whole call, or none if it was cancelled.
    pub async fn call<T, F, Fut>(&self, ctx: &RequestContext, mut operation: F) -> Result<T, GuardError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let permit = match self.breaker.try_acquire() {
            Some(permit) => permit,
            None => {
                tracing::debug!(device = %self.name, "circuit open, failing fast");
                return Err(GuardError::CircuitOpen {
                    name: self.name.clone(),
                });
            }
        };

        let mut attempt = 0u32;
        loop {
            if ctx.is_cancelled() {
                self.breaker.release(permit);
                return Err(GuardError::Cancelled);
            }

            match CallOutcome::classify(operation(attempt).await, &self.classifier) {
                CallOutcome::Ok(value) => {
                    self.breaker.record_success(permit);
                    return Ok(value);
                }
                CallOutcome::Permanent(error) => {
                    tracing::debug!(device = %self.name, %error, "permanent backend failure");
                    self.breaker.record_failure(permit);
                    return Err(GuardError::Permanent {
                        name: self.name.clone(),
                        error,
                    });
                }
                CallOutcome::Transient(error) => {
                    if attempt >= self.retry.max_retries {
                        tracing::warn!(
                            device = %self.name,
                            attempts = attempt + 1,
                            %error,
                            "retries exhausted"
                        );
                        self.breaker.record_failure(permit);
                        return Err(GuardError::Exhausted {
                            name: self.name.clone(),
                            attempts: attempt + 1,
                            last: error,
                        });
                    }

                    let delay = self.retry.backoff_delay(attempt);
                    tracing::debug!(
                        device = %self.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "transient failure, backing off"
                    );

                    let cancelled = tokio::select! {
                        _ = tokio::time::sleep(delay) => false,
                        _ = ctx.cancelled() => true,
                    };
                    if cancelled {
                        self.breaker.release(permit);
                        return Err(GuardError::Cancelled);
                    }
                    attempt += 1;
                }
            }
        }
    }
}
