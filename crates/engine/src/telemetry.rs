//! Telemetry hooks.
//!
//! The engine reports through a [`TelemetrySink`] handed to its builder.
//! [`MetricsSink`] forwards to the `metrics` facade; installing an exporter
//! (Prometheus or otherwise) is left to the host process.

use cache::Tier;
use metrics::{counter, gauge, histogram};
use resilience::{CircuitState, GuardError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How an `encode` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    Success,
    /// No device could serve the request.
    Failure,
    Cancelled,
    /// Rejected by input validation.
    Rejected,
}

impl RequestOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestOutcome::Success => "success",
            RequestOutcome::Failure => "failure",
            RequestOutcome::Cancelled => "cancelled",
            RequestOutcome::Rejected => "rejected",
        }
    }
}

pub trait TelemetrySink: Send + Sync {
    fn record_request(&self, latency: Duration, texts: usize, outcome: RequestOutcome);

    /// `None` is a miss across every tier.
    fn record_cache(&self, tier: Option<Tier>);

    fn record_device_call(
        &self,
        device: &str,
        items: usize,
        latency: Duration,
        result: Result<(), &GuardError>,
    );

    fn record_breaker(&self, device: &str, state: CircuitState);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn record_request(&self, _latency: Duration, _texts: usize, _outcome: RequestOutcome) {}

    fn record_cache(&self, _tier: Option<Tier>) {}

    fn record_device_call(
        &self,
        _device: &str,
        _items: usize,
        _latency: Duration,
        _result: Result<(), &GuardError>,
    ) {
    }

    fn record_breaker(&self, _device: &str, _state: CircuitState) {}
}

/// Counters, histograms and gauges through the `metrics` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsSink;

fn tier_label(tier: Option<Tier>) -> &'static str {
    match tier {
        Some(Tier::L1) => "l1",
        Some(Tier::L2) => "l2",
        Some(Tier::Semantic) => "semantic",
        None => "miss",
    }
}

fn breaker_level(state: CircuitState) -> f64 {
    match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    }
}

impl TelemetrySink for MetricsSink {
    fn record_request(&self, latency: Duration, texts: usize, outcome: RequestOutcome) {
        counter!("embedgate_requests_total", "outcome" => outcome.as_str()).increment(1);
        counter!("embedgate_texts_total").increment(texts as u64);
        histogram!("embedgate_request_duration_seconds").record(latency.as_secs_f64());
    }

    fn record_cache(&self, tier: Option<Tier>) {
        counter!("embedgate_cache_lookups_total", "tier" => tier_label(tier)).increment(1);
    }

    fn record_device_call(
        &self,
        device: &str,
        items: usize,
        latency: Duration,
        result: Result<(), &GuardError>,
    ) {
        let status = match result {
            Ok(()) => "ok",
            Err(GuardError::CircuitOpen { .. }) => "circuit_open",
            Err(GuardError::Cancelled) => "cancelled",
            Err(_) => "error",
        };
        counter!(
            "embedgate_device_calls_total",
            "device" => device.to_string(),
            "status" => status
        )
        .increment(1);
        counter!("embedgate_device_items_total", "device" => device.to_string())
            .increment(items as u64);
        histogram!("embedgate_device_call_duration_seconds", "device" => device.to_string())
            .record(latency.as_secs_f64());
    }

    fn record_breaker(&self, device: &str, state: CircuitState) {
        gauge!("embedgate_breaker_state", "device" => device.to_string()).set(breaker_level(state));
    }
}
