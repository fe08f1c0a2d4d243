//! embedgate engine
//!
//! The [`Engine`] turns texts into vectors. It sits on top of the
//! [`cache`] hierarchy and the [`resilience`] guards and adds the parts that
//! decide where and how work runs:
//!
//! - [`scheduler`] scores devices by weight, rolling load and expected cost,
//!   splits mixed batches across them and falls back once on failure.
//! - [`batch`] caps every sub-batch by a memory budget and a batch length
//!   learned from past timings.
//! - [`slo`] keeps rolling SLIs for latency, availability, error rate and
//!   cache hit rate.
//! - [`telemetry`] reports requests, lookups, device calls and breaker states
//!   to a pluggable sink.
//!
//! ## Quick example
//!
//! ```no_run
//! use std::sync::Arc;
//! use engine::{DeviceSpec, EncodeOptions, Engine, EngineConfig, StubBackend};
//! use resilience::RequestContext;
//!
//! # async fn demo() -> Result<(), engine::EngineError> {
//! let engine = Engine::builder(EngineConfig::default().with_dimension(64))
//!     .device(DeviceSpec::cpu(), Arc::new(StubBackend::new(64)))
//!     .build()?;
//!
//! let texts = vec!["hello world".to_string()];
//! let vectors = engine
//!     .encode(&RequestContext::background(), &texts, &EncodeOptions::default())
//!     .await?;
//! assert_eq!(vectors[0].len(), 64);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod scheduler;
pub mod slo;
pub mod telemetry;

pub use crate::backend::{l2_normalize_in_place, stub_vector, Backend, StubBackend};
#[cfg(feature = "http")]
pub use crate::backend::{ApiProvider, HttpBackend, HttpBackendConfig};
pub use crate::batch::{
    BatchObservation, MemoryAwareBatcher, OptimizerStats, PredictiveBatchOptimizer,
    PredictiveConfig,
};
pub use crate::config::EngineConfig;
pub use crate::engine::{
    EncodeOptions, Engine, EngineBuilder, HealthReport, RequestStats, StatsSnapshot,
};
pub use crate::error::{EngineError, ValidationError};
pub use crate::scheduler::{
    BatchPlan, Device, DeviceKind, DeviceScheduler, DeviceSnapshot, DeviceSpec, DeviceState,
    Executed, PlanItem, SchedulerConfig, SubBatch,
};
pub use crate::slo::{SloDefinition, SloKind, SloStatus, SloTracker};
pub use crate::telemetry::{MetricsSink, NoopSink, RequestOutcome, TelemetrySink};
