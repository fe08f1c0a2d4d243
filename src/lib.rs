//! Workspace umbrella crate for embedgate.
//!
//! Re-exports the engine, cache and resilience crates under one roof and
//! adds [`GatewayConfig`], the operator-facing configuration, plus
//! [`build_engine`] to assemble an [`Engine`] from it.

pub mod config;

pub use crate::config::{BackendKind, BackendSection, ConfigLoadError, GatewayConfig, L2Kind, L2Section};

pub use cache::{
    CacheConfig, CacheError, CacheHealth, CacheHierarchy, CacheKey, CacheLookup, CacheStats, Dtype,
    InMemoryL2, Invalidated, L2Store, LinearScanIndex, QuantizationCodec, QuantizationConfig,
    SemanticBackend, SemanticIndex, SemanticRecord, Tier,
};
pub use engine::{
    Backend, DeviceKind, DeviceSpec, EncodeOptions, Engine, EngineBuilder, EngineConfig,
    EngineError, HealthReport, MemoryAwareBatcher, MetricsSink, NoopSink,
    PredictiveBatchOptimizer, SloDefinition, SloKind, SloStatus, StatsSnapshot, StubBackend,
    TelemetrySink, ValidationError, stub_vector,
};
#[cfg(feature = "http")]
pub use engine::{ApiProvider, HttpBackend, HttpBackendConfig};
pub use resilience::{
    BackendError, CancelHandle, CircuitBreakerConfig, CircuitState, GuardError, RequestContext,
    ResilienceConfig, ResilienceGuard, RetryConfig,
};

use std::sync::Arc;

/// Build an [`Engine`] for `config`: one backend per configured device, the
/// configured L2 store, and `telemetry` as the sink.
pub fn build_engine(
    config: &GatewayConfig,
    telemetry: Arc<dyn TelemetrySink>,
) -> Result<Engine, EngineError> {
    let mut builder = Engine::builder(config.engine_config()).telemetry(telemetry);

    for spec in &config.devices {
        let backend = backend_for(config, spec)?;
        builder = builder.device(spec.clone(), backend);
    }

    match config.l2.kind {
        L2Kind::None => {}
        L2Kind::Memory => builder = builder.l2(Arc::new(InMemoryL2::new())),
        L2Kind::Redis => builder = builder.l2(redis_store(config)?),
    }

    builder.build()
}

fn backend_for(config: &GatewayConfig, spec: &DeviceSpec) -> Result<Arc<dyn Backend>, EngineError> {
    match config.backend.kind {
        BackendKind::Stub => Ok(Arc::new(
            StubBackend::new(config.dimension).with_name(spec.id.clone()),
        )),
        #[cfg(feature = "http")]
        BackendKind::Http => {
            let http = config.backend.http.clone().ok_or_else(|| {
                EngineError::Config("backend.http is required for the http backend".into())
            })?;
            let backend = HttpBackend::new(spec.id.clone(), http)
                .map_err(|err| EngineError::Config(err.to_string()))?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "http"))]
        BackendKind::Http => Err(EngineError::Config(
            "the http backend needs the `http` feature".into(),
        )),
    }
}

#[cfg(feature = "redis")]
fn redis_store(config: &GatewayConfig) -> Result<Arc<dyn L2Store>, EngineError> {
    let url = config
        .l2
        .url
        .as_deref()
        .ok_or_else(|| EngineError::Config("l2.url is required for the redis store".into()))?;
    let store = cache::RedisL2::from_url(url).map_err(|err| EngineError::Config(err.to_string()))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
fn redis_store(_config: &GatewayConfig) -> Result<Arc<dyn L2Store>, EngineError> {
    Err(EngineError::Config(
        "the redis L2 store needs the `redis` feature".into(),
    ))
}
