use resilience::{BreakerSnapshot, ResilienceGuard};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::backend::Backend;

const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

impl DeviceKind {
    pub fn default_weight(self) -> f64 {
        match self {
            DeviceKind::Cpu => 1.0,
            DeviceKind::Gpu => 4.0,
        }
    }

    /// Seconds per item assumed until the device has completed a batch.
    pub fn prior_latency_per_item(self) -> f64 {
        match self {
            DeviceKind::Cpu => 0.010,
            DeviceKind::Gpu => 0.002,
        }
    }
}

/// A device as configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub id: String,
    pub kind: DeviceKind,
    /// Overrides the per-kind base weight.
    #[serde(default)]
    pub weight: Option<f64>,
}

impl DeviceSpec {
    pub fn cpu() -> Self {
        Self {
            id: "cpu".into(),
            kind: DeviceKind::Cpu,
            weight: None,
        }
    }

    pub fn gpu(index: usize) -> Self {
        Self {
            id: format!("gpu:{index}"),
            kind: DeviceKind::Gpu,
            weight: None,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn base_weight(&self) -> f64 {
        self.weight
            .filter(|w| w.is_finite() && *w > 0.0)
            .unwrap_or_else(|| self.kind.default_weight())
    }
}

/// Rolling view of one device, updated after every completed unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub id: String,
    pub kind: DeviceKind,
    pub weight: f64,
    /// EMA of batch wall time, seconds.
    pub rolling_load: f64,
    /// EMA of items per second.
    pub rolling_throughput: f64,
    /// EMA of seconds per item; `None` until the first success.
    pub rolling_latency_per_item: Option<f64>,
    pub request_count: u64,
    pub failure_count: u64,
}

fn ema(previous: f64, sample: f64, alpha: f64) -> f64 {
    alpha * sample + (1.0 - alpha) * previous
}

impl DeviceState {
    pub fn new(spec: &DeviceSpec) -> Self {
        Self {
            id: spec.id.clone(),
            kind: spec.kind,
            weight: spec.base_weight(),
            rolling_load: 0.0,
            rolling_throughput: 0.0,
            rolling_latency_per_item: None,
            request_count: 0,
            failure_count: 0,
        }
    }

    pub fn latency_per_item(&self) -> f64 {
        self.rolling_latency_per_item
            .unwrap_or_else(|| self.kind.prior_latency_per_item())
    }

    pub fn estimated_cost(&self, items: usize) -> f64 {
        items as f64 * self.latency_per_item()
    }

    /// `weight / (rolling_load + estimated_cost + ε)`; higher is better.
    pub fn score(&self, items: usize) -> f64 {
        self.weight / (self.rolling_load + self.estimated_cost(items) + EPSILON)
    }

    pub(crate) fn record_success(&mut self, alpha: f64, base_weight: f64, items: usize, elapsed: Duration) {
        let seconds = elapsed.as_secs_f64();
        self.request_count += 1;
        self.rolling_load = ema(self.rolling_load, seconds, alpha);
        self.weight = ema(self.weight, base_weight, alpha);

        if items > 0 {
            let per_item = seconds / items as f64;
            self.rolling_latency_per_item = Some(match self.rolling_latency_per_item {
                Some(previous) => ema(previous, per_item, alpha),
                None => per_item,
            });
            self.rolling_throughput = ema(
                self.rolling_throughput,
                items as f64 / seconds.max(EPSILON),
                alpha,
            );
        }
    }

    pub(crate) fn record_failure(
        &mut self,
        alpha: f64,
        base_weight: f64,
        penalty: f64,
        elapsed: Duration,
    ) {
        self.request_count += 1;
        self.failure_count += 1;
        self.rolling_load = ema(self.rolling_load, elapsed.as_secs_f64(), alpha);
        self.weight = ema(self.weight, base_weight * penalty, alpha);
    }
}

/// A registered device: its backend, its breaker/retry guard and its state.
pub struct Device {
    spec: DeviceSpec,
    backend: Arc<dyn Backend>,
    guard: ResilienceGuard,
    state: Mutex<DeviceState>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("spec", &self.spec)
            .field("backend", &self.backend.name())
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a device for health and stats reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    #[serde(flatten)]
    pub state: DeviceState,
    pub healthy: bool,
    pub breaker: BreakerSnapshot,
    /// Share of all device calls this device served.
    pub utilization: f64,
}

impl Device {
    pub fn new(spec: DeviceSpec, backend: Arc<dyn Backend>, guard: ResilienceGuard) -> Self {
        let state = DeviceState::new(&spec);
        Self {
            spec,
            backend,
            guard,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn kind(&self) -> DeviceKind {
        self.spec.kind
    }

    pub fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn guard(&self) -> &ResilienceGuard {
        &self.guard
    }

    /// Healthy unless the breaker is open and still inside its recovery timeout.
    pub fn is_healthy(&self) -> bool {
        self.guard.is_available()
    }

    pub fn state(&self) -> DeviceState {
        self.lock().clone()
    }

    pub(crate) fn record_success(&self, alpha: f64, items: usize, elapsed: Duration) {
        let base = self.spec.base_weight();
        self.lock().record_success(alpha, base, items, elapsed);
    }

    pub(crate) fn record_failure(&self, alpha: f64, penalty: f64, elapsed: Duration) {
        let base = self.spec.base_weight();
        self.lock().record_failure(alpha, base, penalty, elapsed);
    }

    pub(crate) fn snapshot(&self, total_requests: u64) -> DeviceSnapshot {
        let state = self.state();
        let utilization = if total_requests == 0 {
            0.0
        } else {
            state.request_count as f64 / total_requests as f64
        };
        DeviceSnapshot {
            state,
            healthy: self.is_healthy(),
            breaker: self.guard.snapshot(),
            utilization,
        }
    }
}
