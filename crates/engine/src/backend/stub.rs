use async_trait::async_trait;
use fxhash::hash64;
use resilience::{BackendError, RequestContext};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::normalize::l2_normalize_in_place;
use super::Backend;

/// Deterministic sinusoid vector seeded by a hash of `text`.
///
/// Same text, same vector, on every process; costs one hash and `dimension`
/// `sin` calls.
pub fn stub_vector(text: &str, dimension: usize, normalize: bool) -> Vec<f32> {
    let mut v = vec![0f32; dimension];
    let h = hash64(text.as_bytes());
    for (idx, value) in v.iter_mut().enumerate() {
        *value = ((h >> (idx % 32)) as f32 * 0.0001).sin();
    }
    if normalize {
        l2_normalize_in_place(&mut v);
    }
    v
}

/// In-process fake device. Used by the CLI and by tests that need a real
/// [`Backend`] without a model behind it.
#[derive(Debug)]
pub struct StubBackend {
    name: String,
    dimension: usize,
    normalize: bool,
    per_call: Duration,
    per_item: Duration,
    calls: AtomicU64,
    items: AtomicU64,
}

impl StubBackend {
    pub fn new(dimension: usize) -> Self {
        Self {
            name: "stub".into(),
            dimension,
            normalize: true,
            per_call: Duration::ZERO,
            per_item: Duration::ZERO,
            calls: AtomicU64::new(0),
            items: AtomicU64::new(0),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    /// Simulated cost: a fixed per-call overhead plus a per-item charge.
    pub fn with_latency(mut self, per_call: Duration, per_item: Duration) -> Self {
        self.per_call = per_call;
        self.per_item = per_item;
        self
    }

    /// Number of `compute_vectors` calls served.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Number of texts embedded across all calls.
    pub fn items(&self) -> u64 {
        self.items.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Backend for StubBackend {
    async fn compute_vectors(
        &self,
        _ctx: &RequestContext,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, BackendError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.items.fetch_add(texts.len() as u64, Ordering::Relaxed);

        let delay = self.per_call + self.per_item * texts.len() as u32;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        Ok(texts
            .iter()
            .map(|text| stub_vector(text, self.dimension, self.normalize))
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        &self.name
    }
}
