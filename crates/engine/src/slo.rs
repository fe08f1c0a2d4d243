//! Service-level objectives over rolling time windows.
//!
//! Every SLO keeps its own windowed sample buffer. The SLI is compared
//! against the target on every sample; entering violation logs at `warn` and
//! bumps that SLO's violation counter. Ratio SLIs come from running totals
//! and the latency percentile from an ordered copy of the window, so a
//! sample never re-sorts the buffer.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::telemetry::RequestOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SloKind {
    /// p95 request latency in milliseconds.
    Latency,
    /// Share of requests that succeeded.
    Availability,
    /// Share of requests that failed.
    ErrorRate,
    /// Share of lookups served from any cache tier.
    CacheHitRate,
}

impl SloKind {
    fn higher_is_better(self) -> bool {
        matches!(self, SloKind::Availability | SloKind::CacheHitRate)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SloDefinition {
    pub name: String,
    pub kind: SloKind,
    /// Milliseconds for latency SLOs, a ratio in `[0, 1]` otherwise.
    pub target: f64,
    #[serde(with = "resilience::serde_millis")]
    pub window: Duration,
}

impl SloDefinition {
    pub fn new(name: impl Into<String>, kind: SloKind, target: f64, window: Duration) -> Self {
        Self {
            name: name.into(),
            kind,
            target,
            window,
        }
    }

    pub fn defaults() -> Vec<Self> {
        const HOUR: Duration = Duration::from_secs(3600);
        vec![
            Self::new("encode_latency_p95", SloKind::Latency, 500.0, Duration::from_secs(300)),
            Self::new("availability", SloKind::Availability, 0.999, HOUR),
            Self::new("error_rate", SloKind::ErrorRate, 0.01, HOUR),
            Self::new("cache_hit_rate", SloKind::CacheHitRate, 0.5, HOUR),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SloStatus {
    pub name: String,
    pub kind: SloKind,
    pub target: f64,
    /// `None` until the window holds a sample that counts toward it.
    pub sli: Option<f64>,
    pub error_budget: Option<f64>,
    pub violated: bool,
    pub violations: u64,
    /// Samples in the window, cancelled ones included.
    pub samples: usize,
    /// Samples in the window from cancelled requests.
    pub cancelled: usize,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    value: f64,
    at: Instant,
    cancelled: bool,
}

#[derive(Debug)]
struct SloState {
    definition: SloDefinition,
    samples: VecDeque<Sample>,
    /// Sum and count of the samples that feed the SLI.
    sum: f64,
    counted: usize,
    /// Window values in ascending order; latency SLOs only.
    ordered: Vec<f64>,
    cancelled: usize,
    violated: bool,
    violations: u64,
}

impl SloState {
    fn new(definition: SloDefinition) -> Self {
        Self {
            definition,
            samples: VecDeque::new(),
            sum: 0.0,
            counted: 0,
            ordered: Vec::new(),
            cancelled: 0,
            violated: false,
            violations: 0,
        }
    }

    /// Cancelled requests carry a latency but sit outside every ratio.
    fn counts(&self, sample: &Sample) -> bool {
        self.definition.kind == SloKind::Latency || !sample.cancelled
    }

    fn push(&mut self, sample: Sample) {
        if sample.cancelled {
            self.cancelled += 1;
        }
        if self.counts(&sample) {
            self.counted += 1;
            self.sum += sample.value;
        }
        if self.definition.kind == SloKind::Latency {
            let at = self.ordered.partition_point(|value| *value < sample.value);
            self.ordered.insert(at, sample.value);
        }
        self.samples.push_back(sample);
    }

    fn pop_front(&mut self) {
        let Some(sample) = self.samples.pop_front() else {
            return;
        };
        if sample.cancelled {
            self.cancelled -= 1;
        }
        if self.counts(&sample) {
            self.counted -= 1;
            self.sum -= sample.value;
        }
        if self.definition.kind == SloKind::Latency {
            let at = self.ordered.partition_point(|value| *value < sample.value);
            if self.ordered.get(at).is_some_and(|value| *value == sample.value) {
                self.ordered.remove(at);
            }
        }
        if self.counted == 0 {
            self.sum = 0.0;
        }
    }

    fn prune(&mut self, now: Instant) {
        let window = self.definition.window;
        while self
            .samples
            .front()
            .is_some_and(|sample| now.saturating_duration_since(sample.at) > window)
        {
            self.pop_front();
        }
    }

    fn sli(&self) -> Option<f64> {
        if self.counted == 0 {
            return None;
        }
        Some(match self.definition.kind {
            SloKind::Latency => quantile(&self.ordered, 0.95),
            _ => self.sum / self.counted as f64,
        })
    }

    fn error_budget(&self, sli: f64) -> f64 {
        match self.definition.kind {
            SloKind::Availability => 1.0 - sli,
            _ => self.definition.target - sli,
        }
    }

    fn is_violating(&self, sli: f64) -> bool {
        if self.definition.kind.higher_is_better() {
            sli < self.definition.target
        } else {
            sli > self.definition.target
        }
    }

    fn status(&self, sli: Option<f64>) -> SloStatus {
        SloStatus {
            name: self.definition.name.clone(),
            kind: self.definition.kind,
            target: self.definition.target,
            sli,
            error_budget: sli.map(|sli| self.error_budget(sli)),
            violated: sli.is_some_and(|sli| self.is_violating(sli)),
            violations: self.violations,
            samples: self.samples.len(),
            cancelled: self.cancelled,
        }
    }
}

#[derive(Debug)]
pub struct SloTracker {
    slos: Vec<Mutex<SloState>>,
    max_samples: usize,
}

impl Default for SloTracker {
    fn default() -> Self {
        Self::new(SloDefinition::defaults())
    }
}

impl SloTracker {
    pub fn new(definitions: Vec<SloDefinition>) -> Self {
        Self {
            slos: definitions
                .into_iter()
                .map(|definition| Mutex::new(SloState::new(definition)))
                .collect(),
            max_samples: 10_000,
        }
    }

    /// Cap on samples kept per SLO, oldest dropped first.
    pub fn with_max_samples(mut self, max_samples: usize) -> Self {
        self.max_samples = max_samples.max(1);
        self
    }

    /// Latency counts every request. Cancelled requests are sampled with a
    /// `cancelled` mark that keeps them out of availability and error rate;
    /// rejected ones are not sampled there at all.
    pub fn record_request(&self, latency: Duration, outcome: RequestOutcome) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let cancelled = outcome == RequestOutcome::Cancelled;
        let (availability, failure) = match outcome {
            RequestOutcome::Success => (Some(1.0), Some(0.0)),
            RequestOutcome::Failure => (Some(0.0), Some(1.0)),
            RequestOutcome::Cancelled => (Some(0.0), Some(0.0)),
            RequestOutcome::Rejected => (None, None),
        };

        self.record(SloKind::Latency, Some(latency_ms), cancelled);
        self.record(SloKind::Availability, availability, cancelled);
        self.record(SloKind::ErrorRate, failure, cancelled);
    }

    pub fn record_cache(&self, hit: bool) {
        self.record(SloKind::CacheHitRate, Some(if hit { 1.0 } else { 0.0 }), false);
    }

    fn record(&self, kind: SloKind, value: Option<f64>, cancelled: bool) {
        let Some(value) = value else {
            return;
        };
        let now = Instant::now();
        for slo in &self.slos {
            let mut state = lock(slo);
            if state.definition.kind != kind {
                continue;
            }
            state.push(Sample {
                value,
                at: now,
                cancelled,
            });
            while state.samples.len() > self.max_samples {
                state.pop_front();
            }
            state.prune(now);
            check_violation(&mut state);
        }
    }

    pub fn status(&self) -> Vec<SloStatus> {
        let now = Instant::now();
        self.slos
            .iter()
            .map(|slo| {
                let mut state = lock(slo);
                state.prune(now);
                let sli = check_violation(&mut state);
                state.status(sli)
            })
            .collect()
    }

    /// Current violation flag for the named SLO.
    pub fn is_violated(&self, name: &str) -> Option<bool> {
        let now = Instant::now();
        self.slos.iter().find_map(|slo| {
            let mut state = lock(slo);
            if state.definition.name != name {
                return None;
            }
            state.prune(now);
            check_violation(&mut state);
            Some(state.violated)
        })
    }
}

/// Interpolated quantile (Hyndman-Fan type 8) of ascending `sorted`.
fn quantile(sorted: &[f64], tau: f64) -> f64 {
    let (Some(&min), Some(&max)) = (sorted.first(), sorted.last()) else {
        return f64::NAN;
    };
    let len = sorted.len() as f64;
    let h = (len + 1.0 / 3.0) * tau + 1.0 / 3.0;
    let floor = h.floor();
    if floor < 1.0 {
        return min;
    }
    if floor >= len {
        return max;
    }
    let below = sorted[floor as usize - 1];
    let above = sorted[floor as usize];
    below + (h - floor) * (above - below)
}

fn lock(slo: &Mutex<SloState>) -> MutexGuard<'_, SloState> {
    slo.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Re-evaluates the SLI, logging transitions into and out of violation.
fn check_violation(state: &mut SloState) -> Option<f64> {
    let Some(sli) = state.sli() else {
        state.violated = false;
        return None;
    };
    let violating = state.is_violating(sli);
    if violating && !state.violated {
        state.violations += 1;
        tracing::warn!(
            slo = %state.definition.name,
            sli,
            target = state.definition.target,
            error_budget = state.error_budget(sli),
            "SLO violated"
        );
    } else if !violating && state.violated {
        tracing::info!(slo = %state.definition.name, sli, "SLO recovered");
    }
    state.violated = violating;
    Some(sli)
}
