//! Shared fakes for the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use embedgate::{
    Backend, BackendError, CacheConfig, CacheError, CircuitBreakerConfig, DeviceSpec, Engine,
    EngineConfig, InMemoryL2, L2Store, RequestContext, ResilienceConfig, RetryConfig, stub_vector,
};

pub const DIM: usize = 16;

/// Backend that replays a script of failures before answering normally.
pub struct ScriptedBackend {
    dimension: usize,
    script: Mutex<VecDeque<BackendError>>,
    calls: AtomicU32,
    delay: Duration,
}

impl ScriptedBackend {
    pub fn healthy() -> Self {
        Self::failing_with(Vec::new())
    }

    /// Fails with each error in order, then succeeds forever.
    pub fn failing_with(errors: Vec<BackendError>) -> Self {
        Self {
            dimension: DIM,
            script: Mutex::new(errors.into()),
            calls: AtomicU32::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn failing_times(times: usize, error: BackendError) -> Self {
        Self::failing_with(vec![error; times])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn compute_vectors(
        &self,
        _ctx: &RequestContext,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        match next {
            Some(error) => Err(error),
            None => Ok(texts
                .iter()
                .map(|text| stub_vector(text, self.dimension, true))
                .collect()),
        }
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// L2 that can be switched off to simulate an unreachable store.
#[derive(Default)]
pub struct SwitchableL2 {
    inner: InMemoryL2,
    down: AtomicBool,
    pub reads: AtomicU32,
}

impl SwitchableL2 {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.down.load(Ordering::SeqCst) {
            Err(CacheError::unavailable("switchable", "connection refused"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl L2Store for SwitchableL2 {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.get(key).await
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.check()?;
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check()?;
        self.inner.delete(key).await
    }

    fn name(&self) -> &str {
        "switchable"
    }
}

/// L2 whose writes stall, so a request can be cancelled mid-store.
pub struct SlowWriteL2 {
    pub inner: InMemoryL2,
    delay: Duration,
}

impl SlowWriteL2 {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: InMemoryL2::new(),
            delay,
        }
    }
}

#[async_trait]
impl L2Store for SlowWriteL2 {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.inner.get(key).await
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        tokio::time::sleep(self.delay).await;
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.inner.delete(key).await
    }

    fn name(&self) -> &str {
        "slow-write"
    }
}

/// Engine config with a fast breaker and no retries unless asked.
pub fn config(failure_threshold: u32, recovery: Duration, retries: u32) -> EngineConfig {
    EngineConfig::default().with_dimension(DIM).with_resilience(
        ResilienceConfig::default()
            .with_circuit_breaker(
                CircuitBreakerConfig::default()
                    .with_failure_threshold(failure_threshold)
                    .with_recovery_timeout(recovery),
            )
            .with_retry(
                RetryConfig::default()
                    .with_max_retries(retries)
                    .with_base_delay(Duration::from_millis(1))
                    .with_jitter(false),
            ),
    )
}

pub fn cache_config(max_cache_size: usize) -> CacheConfig {
    CacheConfig {
        dimension: DIM,
        max_cache_size,
        ..CacheConfig::default()
    }
}

pub fn single_device(config: EngineConfig, backend: Arc<dyn Backend>) -> Engine {
    Engine::builder(config)
        .device(DeviceSpec::cpu(), backend)
        .build()
        .unwrap()
}

pub fn texts(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
