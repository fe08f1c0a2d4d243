//! Circuit breaker pattern for device backends.
//!
//! Stops sending work to a failing device once a threshold of failures is
//! reached, then lets exactly one probe through after the recovery timeout to
//! check whether the device came back.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// States of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests allowed.
    Closed,
    /// Failing fast - requests immediately rejected.
    Open,
    /// Recovery probe in progress - one request allowed.
    HalfOpen,
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is allowed, in milliseconds.
    #[serde(with = "crate::serde_millis")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }
}

/// Admission ticket handed out by [`CircuitBreaker::try_acquire`].
///
/// Hand it back through exactly one of `record_success`, `record_failure` or
/// `release`. Dropping it unresolved behaves like `release`, so a call
/// future abandoned mid-attempt cannot hold the half-open slot forever.
#[derive(Debug)]
#[must_use = "a permit must be resolved with record_success, record_failure or release"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    resolved: bool,
}

impl Permit<'_> {
    /// Whether this call is the half-open recovery probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    fn resolve(&mut self) -> bool {
        self.resolved = true;
        self.probe
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.probe {
            let mut inner = self.breaker.lock();
            if inner.state == CircuitState::HalfOpen {
                inner.probe_in_flight = false;
                tracing::debug!(breaker = %self.breaker.name, "recovery slot released");
            }
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    last_state_change: Instant,
    last_failure_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Point-in-time view of one breaker, for health reports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u64,
    pub success_count: u64,
    pub rejected_count: u64,
    /// Milliseconds since the last recorded failure, if any.
    pub last_failure_ms_ago: Option<u64>,
}

/// Circuit breaker for a single device.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    failure_count: AtomicU64,
    success_count: AtomicU64,
    rejected_count: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                last_state_change: Instant::now(),
                last_failure_at: None,
                probe_in_flight: false,
            }),
            failure_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            rejected_count: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask to send one call through. `None` means fail fast.
    ///
    /// An open circuit whose recovery timeout has elapsed moves to `HalfOpen`
    /// here and the caller receives the single probe permit.
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => Some(self.permit(false)),
            CircuitState::Open => {
                if inner.last_state_change.elapsed() >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.last_state_change = Instant::now();
                    inner.probe_in_flight = true;
                    tracing::info!(breaker = %self.name, "circuit half-open, sending probe");
                    Some(self.permit(true))
                } else {
                    self.rejected_count.fetch_add(1, Ordering::Relaxed);
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    self.rejected_count.fetch_add(1, Ordering::Relaxed);
                    None
                } else {
                    inner.probe_in_flight = true;
                    Some(self.permit(true))
                }
            }
        }
    }

    fn permit(&self, probe: bool) -> Permit<'_> {
        Permit {
            breaker: self,
            probe,
            resolved: false,
        }
    }

    /// Read-only health check used by the scheduler; never changes state.
    pub fn is_available(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                inner.last_state_change.elapsed() >= self.config.recovery_timeout
            }
            CircuitState::HalfOpen => !inner.probe_in_flight,
        }
    }

    /// Record a successful call.
    pub fn record_success(&self, mut permit: Permit<'_>) {
        let probe = permit.resolve();
        self.success_count.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();

        match inner.state {
            CircuitState::HalfOpen if probe => {
                inner.state = CircuitState::Closed;
                inner.last_state_change = Instant::now();
                inner.probe_in_flight = false;
                self.failure_count.store(0, Ordering::SeqCst);
                tracing::info!(breaker = %self.name, "circuit closed after successful probe");
            }
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            // A straggler admitted before the circuit opened; its success
            // says nothing about recovery.
            _ => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, mut permit: Permit<'_>) {
        let probe = permit.resolve();
        let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        let mut inner = self.lock();
        inner.last_failure_at = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen if probe => {
                inner.state = CircuitState::Open;
                inner.last_state_change = Instant::now();
                inner.probe_in_flight = false;
                tracing::warn!(breaker = %self.name, "probe failed, circuit re-opened");
            }
            CircuitState::Closed => {
                if failures >= self.config.failure_threshold as u64 {
                    inner.state = CircuitState::Open;
                    inner.last_state_change = Instant::now();
                    tracing::warn!(
                        breaker = %self.name,
                        failures,
                        "failure threshold reached, circuit opened"
                    );
                }
            }
            _ => {}
        }
    }

    /// Give the permit back without an outcome (the call was cancelled).
    pub fn release(&self, permit: Permit<'_>) {
        drop(permit);
    }

    /// Get current state (for monitoring).
    pub fn current_state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::SeqCst)
    }

    pub fn time_in_current_state(&self) -> Duration {
        self.lock().last_state_change.elapsed()
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: self.failure_count.load(Ordering::SeqCst),
            success_count: self.success_count.load(Ordering::Relaxed),
            rejected_count: self.rejected_count.load(Ordering::Relaxed),
            last_failure_ms_ago: inner
                .last_failure_at
                .map(|at| at.elapsed().as_millis() as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_recovery_timeout(timeout),
        )
    }

    fn fail(cb: &CircuitBreaker) {
        let permit = cb.try_acquire().expect("call should be admitted");
        cb.record_failure(permit);
    }

    #[test]
    fn test_circuit_breaker_starts_closed() {
        let cb = CircuitBreaker::new("cpu", CircuitBreakerConfig::default());
        assert_eq!(cb.current_state(), CircuitState::Closed);
        assert!(cb.is_available());
        let permit = cb.try_acquire().unwrap();
        assert!(!permit.is_probe());
        cb.record_success(permit);
    }

    #[test]
    fn test_circuit_opens_after_exact_threshold() {
        let cb = breaker(3, Duration::from_secs(60));

        fail(&cb);
        fail(&cb);
        assert_eq!(cb.current_state(), CircuitState::Closed);

        fail(&cb);
        assert_eq!(cb.current_state(), CircuitState::Open);
        assert!(cb.try_acquire().is_none());
        assert!(!cb.is_available());
        assert_eq!(cb.snapshot().rejected_count, 1);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let cb = breaker(3, Duration::from_secs(60));
        fail(&cb);
        fail(&cb);
        let permit = cb.try_acquire().unwrap();
        cb.record_success(permit);
        assert_eq!(cb.failure_count(), 0);

        fail(&cb);
        fail(&cb);
        assert_eq!(cb.current_state(), CircuitState::Closed);
    }

    #[test]
    fn test_single_probe_success_closes() {
        let cb = breaker(1, Duration::from_millis(0));
        fail(&cb);
        assert_eq!(cb.current_state(), CircuitState::Open);

        let probe = cb.try_acquire().expect("probe after timeout");
        assert!(probe.is_probe());
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);

        // Only one probe at a time.
        assert!(cb.try_acquire().is_none());

        cb.record_success(probe);
        assert_eq!(cb.current_state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_probe_failure_reopens_and_resets_clock() {
        let cb = breaker(1, Duration::from_millis(30));
        fail(&cb);
        std::thread::sleep(Duration::from_millis(40));

        let probe = cb.try_acquire().expect("probe");
        cb.record_failure(probe);
        assert_eq!(cb.current_state(), CircuitState::Open);
        assert!(cb.time_in_current_state() < Duration::from_millis(30));
        assert!(cb.try_acquire().is_none());
    }

    #[test]
    fn test_released_probe_can_be_retried() {
        let cb = breaker(1, Duration::from_millis(0));
        fail(&cb);
        let probe = cb.try_acquire().unwrap();
        cb.release(probe);
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);
        let again = cb.try_acquire().expect("probe slot freed");
        assert!(again.is_probe());
        cb.record_success(again);
        assert_eq!(cb.current_state(), CircuitState::Closed);
    }

    #[test]
    fn test_dropped_probe_frees_the_slot() {
        let cb = breaker(1, Duration::from_millis(0));
        fail(&cb);
        let probe = cb.try_acquire().unwrap();
        assert!(!cb.is_available());

        drop(probe);
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);
        assert!(cb.is_available());
        let again = cb.try_acquire().expect("slot freed by drop");
        cb.record_failure(again);
        assert_eq!(cb.current_state(), CircuitState::Open);
    }

    #[test]
    fn test_resolved_probe_is_not_released_twice() {
        let cb = breaker(1, Duration::from_millis(50));
        fail(&cb);
        std::thread::sleep(Duration::from_millis(60));
        let probe = cb.try_acquire().unwrap();
        cb.record_failure(probe);
        // Re-opened, and the resolved permit's drop must not reopen the slot.
        assert_eq!(cb.current_state(), CircuitState::Open);
        assert!(cb.try_acquire().is_none());
    }

    #[test]
    fn test_straggler_success_does_not_close_half_open() {
        let cb = breaker(1, Duration::from_millis(0));
        let straggler = cb.try_acquire().unwrap();
        fail(&cb);
        let probe = cb.try_acquire().unwrap();
        cb.record_success(straggler);
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);
        cb.record_success(probe);
        assert_eq!(cb.current_state(), CircuitState::Closed);
    }

    #[test]
    fn test_config_serde_uses_millis() {
        let cfg = CircuitBreakerConfig::default().with_recovery_timeout(Duration::from_millis(1500));
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("1500"));
        let back: CircuitBreakerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
