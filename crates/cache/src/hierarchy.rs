//! L1 → L2 → semantic lookup and write-through.

use dashmap::DashMap;
use resilience::RequestContext;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::entry::{now_millis, CacheEntry, CacheKey, Dtype};
use crate::error::CacheError;
use crate::l1::{L1Cache, TierCounters, TierStats};
use crate::l2::L2Store;
use crate::quantize::{QuantizationCodec, QuantizationConfig, QuantizationProfile};
#[cfg(feature = "hnsw")]
use crate::semantic::{HnswIndex, HnswParams};
use crate::semantic::{LinearScanIndex, SemanticIndex, SemanticRecord};

const HEALTH_PROBE_KEY: &str = "__health__";

/// Which [`SemanticIndex`] the hierarchy builds for itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticBackend {
    #[default]
    Linear,
    /// Needs the `hnsw` feature; falls back to linear without it.
    Hnsw,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Vector dimension every tier expects.
    pub dimension: usize,
    /// L1 capacity in entries.
    pub max_cache_size: usize,
    /// Entry lifetime in milliseconds; `None` never expires.
    #[serde(with = "resilience::serde_millis::option")]
    pub ttl: Option<Duration>,
    pub semantic_enabled: bool,
    /// Minimum cosine similarity for a semantic hit.
    pub semantic_threshold: f32,
    pub semantic_capacity: usize,
    /// Candidates examined per semantic lookup.
    pub semantic_k: usize,
    pub semantic_backend: SemanticBackend,
    /// Namespace for every L2 key.
    pub key_prefix: String,
    pub quantization: QuantizationConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            max_cache_size: 10_000,
            ttl: Some(Duration::from_secs(3600)),
            semantic_enabled: true,
            semantic_threshold: 0.95,
            semantic_capacity: 10_000,
            semantic_k: 4,
            semantic_backend: SemanticBackend::Linear,
            key_prefix: "embedgate:v1:".to_string(),
            quantization: QuantizationConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn with_max_cache_size(mut self, size: usize) -> Self {
        self.max_cache_size = size;
        self
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_semantic(mut self, enabled: bool, threshold: f32) -> Self {
        self.semantic_enabled = enabled;
        self.semantic_threshold = threshold;
        self
    }

    pub fn with_semantic_backend(mut self, backend: SemanticBackend) -> Self {
        self.semantic_backend = backend;
        self
    }

    pub fn with_quantization(mut self, quantization: QuantizationConfig) -> Self {
        self.quantization = quantization;
        self
    }
}

/// Tier that served a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    L1,
    L2,
    Semantic,
}

/// Outcome of a hierarchy lookup. Tier errors never escape; they become `Miss`.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit {
        vector: Vec<f32>,
        tier: Tier,
        /// Cosine similarity for semantic hits.
        similarity: Option<f32>,
    },
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit { .. })
    }

    pub fn tier(&self) -> Option<Tier> {
        match self {
            CacheLookup::Hit { tier, .. } => Some(*tier),
            CacheLookup::Miss => None,
        }
    }
}

/// What an invalidation removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidated {
    pub l1: usize,
    pub semantic: usize,
    /// L2 deletes issued for keys found in L1.
    pub l2_deleted: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub l1: TierStats,
    pub l2: TierStats,
    pub semantic: TierStats,
    pub quantization_errors: u64,
    pub profile: QuantizationProfile,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierHealth {
    pub name: String,
    pub healthy: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheHealth {
    pub healthy: bool,
    pub l1_entries: usize,
    pub l2: Option<TierHealth>,
    pub semantic_entries: Option<usize>,
}

/// Composes the three tiers and the quantization codec.
pub struct CacheHierarchy {
    config: CacheConfig,
    l1: L1Cache,
    l2: Option<Arc<dyn L2Store>>,
    semantic: Option<Arc<dyn SemanticIndex>>,
    codec: QuantizationCodec,
    hits: AtomicU64,
    misses: AtomicU64,
    quantization_errors: AtomicU64,
    l2_counters: TierCounters,
    semantic_counters: TierCounters,
    tag_watermarks: DashMap<String, u64>,
    dtype_watermarks: DashMap<Dtype, u64>,
}

impl std::fmt::Debug for CacheHierarchy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHierarchy")
            .field("config", &self.config)
            .field("l1", &self.l1)
            .field("l2", &self.l2.as_ref().map(|store| store.name().to_string()))
            .field("semantic", &self.semantic.as_ref().map(|index| index.kind()))
            .finish_non_exhaustive()
    }
}

impl CacheHierarchy {
    /// L1 only, plus a semantic index when enabled. Attach L2 with [`with_l2`](Self::with_l2).
    pub fn new(config: CacheConfig) -> Self {
        let semantic = config
            .semantic_enabled
            .then(|| default_semantic_index(&config));
        Self {
            l1: L1Cache::new(config.max_cache_size),
            l2: None,
            semantic,
            codec: QuantizationCodec::new(config.quantization),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            quantization_errors: AtomicU64::new(0),
            l2_counters: TierCounters::default(),
            semantic_counters: TierCounters::default(),
            tag_watermarks: DashMap::new(),
            dtype_watermarks: DashMap::new(),
            config,
        }
    }

    pub fn with_l2(mut self, store: Arc<dyn L2Store>) -> Self {
        self.l2 = Some(store);
        self
    }

    /// Replace the semantic index (e.g. with a custom ANN). Enables the tier.
    pub fn with_semantic_index(mut self, index: Arc<dyn SemanticIndex>) -> Self {
        self.semantic = Some(index);
        self.config.semantic_enabled = true;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn l1(&self) -> &L1Cache {
        &self.l1
    }

    pub fn codec(&self) -> &QuantizationCodec {
        &self.codec
    }

    fn l2_key(&self, key: &CacheKey) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Ordered lookup, stopping at the first tier that hits.
    ///
    /// `probe` is the query vector for the semantic tier; without one only the
    /// exact tiers are consulted. A cancelled context ends the lookup as a miss.
    pub async fn lookup(
        &self,
        ctx: &RequestContext,
        key: &CacheKey,
        probe: Option<&[f32]>,
    ) -> CacheLookup {
        if let Some(vector) = self.lookup_l1(key) {
            return self.hit(vector, Tier::L1, None, key);
        }

        if let Some(vector) = self.lookup_l2(ctx, key).await {
            return self.hit(vector, Tier::L2, None, key);
        }

        if let Some((vector, similarity)) = self.lookup_semantic(probe) {
            return self.hit(vector, Tier::Semantic, Some(similarity), key);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key = %key, "cache miss");
        CacheLookup::Miss
    }

    fn hit(&self, vector: Vec<f32>, tier: Tier, similarity: Option<f32>, key: &CacheKey) -> CacheLookup {
        self.hits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key = %key, tier = ?tier, "cache hit");
        CacheLookup::Hit {
            vector,
            tier,
            similarity,
        }
    }

    fn lookup_l1(&self, key: &CacheKey) -> Option<Vec<f32>> {
        let entry = self.l1.get(key)?;
        match self.decode_vector(&entry) {
            Ok(vector) => Some(vector),
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "dropping corrupt L1 entry");
                self.l1.remove(key);
                None
            }
        }
    }

    async fn lookup_l2(&self, ctx: &RequestContext, key: &CacheKey) -> Option<Vec<f32>> {
        let store = self.l2.as_ref()?;
        let l2_key = self.l2_key(key);

        let bytes = match cancellable(ctx, store.get(&l2_key)).await {
            None => return None,
            Some(Ok(Some(bytes))) => bytes,
            Some(Ok(None)) => {
                self.l2_counters.miss();
                return None;
            }
            Some(Err(err)) => {
                self.l2_counters.error();
                tracing::warn!(key = %key, store = store.name(), error = %err, "L2 read failed, treating as miss");
                return None;
            }
        };

        let mut entry = match decode_entry(&bytes) {
            Ok(entry) => entry,
            Err(err) => {
                self.quantization_errors.fetch_add(1, Ordering::Relaxed);
                self.l2_counters.miss();
                tracing::warn!(key = %key, error = %err, "undecodable L2 entry");
                return None;
            }
        };

        if entry.key != *key || entry.is_expired() || self.is_invalidated(&entry) {
            self.l2_counters.miss();
            return None;
        }

        let vector = match self.decode_vector(&entry) {
            Ok(vector) => vector,
            Err(err) => {
                self.l2_counters.miss();
                tracing::warn!(key = %key, error = %err, "corrupt L2 vector");
                return None;
            }
        };

        self.l2_counters.hit();
        entry.touch();
        if let Err(err) = self.l1.insert(entry) {
            tracing::debug!(key = %key, error = %err, "L2 hit not promoted");
        }
        Some(vector)
    }

    fn lookup_semantic(&self, probe: Option<&[f32]>) -> Option<(Vec<f32>, f32)> {
        let index = self.semantic.as_ref()?;
        let probe = probe?;

        match index.search(probe, self.config.semantic_k, self.config.semantic_threshold) {
            Ok(Some(found)) => {
                self.semantic_counters.hit();
                Some((found.vector, found.similarity))
            }
            Ok(None) => {
                self.semantic_counters.miss();
                None
            }
            Err(err) => {
                self.semantic_counters.error();
                tracing::debug!(error = %err, "semantic lookup failed");
                None
            }
        }
    }

    fn decode_vector(&self, entry: &CacheEntry) -> Result<Vec<f32>, CacheError> {
        let result = if entry.payload.len() != self.config.dimension {
            Err(CacheError::DimensionMismatch {
                expected: self.config.dimension,
                got: entry.payload.len(),
            })
        } else {
            self.codec.dequantize(&entry.payload, entry.scale)
        };
        if result.is_err() {
            self.quantization_errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn is_invalidated(&self, entry: &CacheEntry) -> bool {
        let by_dtype = self
            .dtype_watermarks
            .get(&entry.dtype)
            .is_some_and(|at| *at >= entry.created_at_ms);
        by_dtype
            || entry.tags.iter().any(|tag| {
                self.tag_watermarks
                    .get(tag)
                    .is_some_and(|at| *at >= entry.created_at_ms)
            })
    }

    /// Moves `created_at_ms` past any local watermark it would otherwise
    /// fall under, so a write landing in the same millisecond as an
    /// invalidation is not rejected on read.
    fn stamp_after_watermarks(&self, entry: &mut CacheEntry) {
        let latest = self
            .dtype_watermarks
            .get(&entry.dtype)
            .map(|at| *at)
            .into_iter()
            .chain(
                entry
                    .tags
                    .iter()
                    .filter_map(|tag| self.tag_watermarks.get(tag).map(|at| *at)),
            )
            .max();
        if let Some(at) = latest.filter(|at| *at >= entry.created_at_ms) {
            let shift = at + 1 - entry.created_at_ms;
            entry.created_at_ms += shift;
            entry.expires_at_ms = entry.expires_at_ms.map(|expires| expires.saturating_add(shift));
        }
    }

    /// Write a freshly computed vector to every tier. Failures are logged and
    /// counted, never returned. A cancelled context stops the write before
    /// L1 and the semantic index are touched.
    pub async fn store(
        &self,
        ctx: &RequestContext,
        key: &CacheKey,
        text: &str,
        vector: &[f32],
        tags: &BTreeSet<String>,
    ) {
        if vector.len() != self.config.dimension {
            tracing::warn!(
                key = %key,
                expected = self.config.dimension,
                got = vector.len(),
                "refusing to cache vector of wrong dimension"
            );
            return;
        }

        let quantized = match self.codec.quantize(vector) {
            Ok(quantized) => quantized,
            Err(err) => {
                self.quantization_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, error = %err, "quantization failed, not caching");
                return;
            }
        };

        let mut entry =
            CacheEntry::new(key.clone(), quantized.payload, quantized.scale, self.config.ttl)
                .with_tags(tags.iter().cloned());
        self.stamp_after_watermarks(&mut entry);
        let expires_at_ms = entry.expires_at_ms;

        if ctx.is_cancelled() {
            tracing::debug!(key = %key, "store skipped, request cancelled");
            return;
        }

        if let Some(store) = self.l2.as_ref() {
            match encode_entry(&entry) {
                Ok(bytes) => {
                    let l2_key = self.l2_key(key);
                    let write = store.set_with_ttl(&l2_key, bytes, self.config.ttl);
                    match cancellable(ctx, write).await {
                        Some(Ok(())) => {}
                        Some(Err(err)) => {
                            self.l2_counters.error();
                            tracing::warn!(key = %key, store = store.name(), error = %err, "L2 write failed");
                        }
                        None => {
                            tracing::debug!(key = %key, "store abandoned during L2 write");
                            return;
                        }
                    }
                }
                Err(err) => tracing::warn!(key = %key, error = %err, "entry encoding failed"),
            }
        }

        if ctx.is_cancelled() {
            return;
        }

        if let Err(err) = self.l1.insert(entry) {
            tracing::debug!(key = %key, error = %err, "L1 insert refused");
        }

        if let Some(index) = self.semantic.as_ref() {
            let record = SemanticRecord {
                key: key.clone(),
                text: text.to_string(),
                vector: vector.to_vec(),
                tags: tags.clone(),
                expires_at_ms,
            };
            if let Err(err) = index.add(record) {
                self.semantic_counters.error();
                tracing::debug!(key = %key, error = %err, "semantic insert failed");
            }
        }
    }

    /// Feed a completed batch into quantization calibration.
    pub fn observe(&self, vectors: &[Vec<f32>]) -> bool {
        self.codec.observe(vectors)
    }

    /// Pin or unpin the L1 entry for `key`. Returns false when it is not resident.
    pub fn set_pinned(&self, key: &CacheKey, pinned: bool) -> bool {
        self.l1.set_pinned(key, pinned)
    }

    /// Remove every entry whose tag set intersects `tags`.
    ///
    /// L1 and the semantic index are purged directly. L2 entries are deleted
    /// for keys found in L1, and any other L2 entry carrying one of the tags
    /// and created before now is rejected on read.
    pub async fn invalidate_tags(&self, ctx: &RequestContext, tags: &[String]) -> Invalidated {
        let now = now_millis();
        for tag in tags {
            self.tag_watermarks.insert(tag.clone(), now);
        }

        let removed = self.l1.invalidate_tags(tags);
        let semantic = self
            .semantic
            .as_ref()
            .map(|index| {
                index.remove_where(&|record: &SemanticRecord| {
                    tags.iter().any(|tag| record.tags.contains(tag))
                })
            })
            .unwrap_or(0);
        let l2_deleted = self.delete_from_l2(ctx, &removed).await;

        tracing::info!(tags = ?tags, l1 = removed.len(), semantic, "invalidated by tag");
        Invalidated {
            l1: removed.len(),
            semantic,
            l2_deleted,
        }
    }

    /// Remove every entry stored as `dtype`.
    pub async fn invalidate_dtype(&self, ctx: &RequestContext, dtype: Dtype) -> Invalidated {
        self.dtype_watermarks.insert(dtype, now_millis());
        let removed = self.l1.invalidate_dtype(dtype);
        let l2_deleted = self.delete_from_l2(ctx, &removed).await;

        tracing::info!(dtype = %dtype, l1 = removed.len(), "invalidated by dtype");
        Invalidated {
            l1: removed.len(),
            semantic: 0,
            l2_deleted,
        }
    }

    async fn delete_from_l2(&self, ctx: &RequestContext, keys: &[CacheKey]) -> usize {
        let Some(store) = self.l2.as_ref() else {
            return 0;
        };
        let mut deleted = 0;
        for key in keys {
            match cancellable(ctx, store.delete(&self.l2_key(key))).await {
                Some(Ok(())) => deleted += 1,
                Some(Err(err)) => {
                    self.l2_counters.error();
                    tracing::warn!(key = %key, error = %err, "L2 delete failed");
                }
                None => break,
            }
        }
        deleted
    }

    /// Physically drop expired entries from L1 and the semantic index.
    pub fn purge_expired(&self) -> usize {
        let l1 = self.l1.purge_expired();
        let semantic = self
            .semantic
            .as_ref()
            .map(|index| index.purge_expired())
            .unwrap_or(0);
        self.semantic_counters
            .expirations
            .fetch_add(semantic as u64, Ordering::Relaxed);
        l1 + semantic
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            l1: self.l1.stats(),
            l2: self.l2_counters.snapshot(0),
            semantic: self
                .semantic_counters
                .snapshot(self.semantic.as_ref().map(|index| index.len()).unwrap_or(0)),
            quantization_errors: self.quantization_errors.load(Ordering::Relaxed),
            profile: *self.codec.profile(),
        }
    }

    /// Probe L2 with a read of a reserved key. L1 and the semantic index are
    /// in-process and always healthy.
    pub async fn health(&self, ctx: &RequestContext) -> CacheHealth {
        let l2 = match self.l2.as_ref() {
            Some(store) => {
                let probe = format!("{}{}", self.config.key_prefix, HEALTH_PROBE_KEY);
                let (healthy, error) = match cancellable(ctx, store.get(&probe)).await {
                    Some(Ok(_)) => (true, None),
                    Some(Err(err)) => (false, Some(err.to_string())),
                    None => (false, Some("health check cancelled".to_string())),
                };
                Some(TierHealth {
                    name: store.name().to_string(),
                    healthy,
                    error,
                })
            }
            None => None,
        };

        CacheHealth {
            healthy: l2.as_ref().map(|tier| tier.healthy).unwrap_or(true),
            l1_entries: self.l1.len(),
            l2,
            semantic_entries: self.semantic.as_ref().map(|index| index.len()),
        }
    }
}

fn default_semantic_index(config: &CacheConfig) -> Arc<dyn SemanticIndex> {
    match config.semantic_backend {
        #[cfg(feature = "hnsw")]
        SemanticBackend::Hnsw => Arc::new(HnswIndex::new(
            config.dimension,
            config.semantic_capacity,
            HnswParams::default(),
        )),
        #[cfg(not(feature = "hnsw"))]
        SemanticBackend::Hnsw => {
            tracing::warn!("hnsw feature disabled, using linear semantic index");
            Arc::new(LinearScanIndex::new(config.dimension, config.semantic_capacity))
        }
        SemanticBackend::Linear => {
            Arc::new(LinearScanIndex::new(config.dimension, config.semantic_capacity))
        }
    }
}

/// Await `fut` unless the request is cancelled first.
async fn cancellable<F: Future>(ctx: &RequestContext, fut: F) -> Option<F::Output> {
    tokio::select! {
        output = fut => Some(output),
        _ = ctx.cancelled() => None,
    }
}

pub(crate) fn encode_entry(entry: &CacheEntry) -> Result<Vec<u8>, CacheError> {
    Ok(bincode::serde::encode_to_vec(entry, bincode::config::standard())?)
}

pub(crate) fn decode_entry(bytes: &[u8]) -> Result<CacheEntry, CacheError> {
    let (entry, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l2::InMemoryL2;

    fn config(dim: usize) -> CacheConfig {
        CacheConfig::default()
            .with_dimension(dim)
            .with_max_cache_size(8)
    }

    fn tags(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[tokio::test]
    async fn l1_hit_after_store() {
        let cache = CacheHierarchy::new(config(3));
        let ctx = RequestContext::background();
        let key = CacheKey::for_text("hello");

        assert_eq!(cache.lookup(&ctx, &key, None).await, CacheLookup::Miss);
        cache.store(&ctx, &key, "hello", &[0.1, 0.2, 0.3], &tags(&[])).await;

        let hit = cache.lookup(&ctx, &key, None).await;
        assert_eq!(hit.tier(), Some(Tier::L1));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test]
    async fn l2_hit_promotes_into_l1() {
        let l2 = Arc::new(InMemoryL2::new());
        let writer = CacheHierarchy::new(config(3)).with_l2(l2.clone());
        let reader = CacheHierarchy::new(config(3)).with_l2(l2.clone());
        let ctx = RequestContext::background();
        let key = CacheKey::for_text("shared");

        writer.store(&ctx, &key, "shared", &[1.0, 0.0, 0.5], &tags(&[])).await;
        assert_eq!(l2.len(), 1);

        let first = reader.lookup(&ctx, &key, None).await;
        assert_eq!(first.tier(), Some(Tier::L2));
        let second = reader.lookup(&ctx, &key, None).await;
        assert_eq!(second.tier(), Some(Tier::L1));
    }

    #[tokio::test]
    async fn corrupt_l2_bytes_are_a_miss() {
        let l2 = Arc::new(InMemoryL2::new());
        let cache = CacheHierarchy::new(config(3)).with_l2(l2.clone());
        let key = CacheKey::for_text("broken");
        l2.put_raw(&format!("embedgate:v1:{key}"), vec![0xff, 0x00, 0x13]);

        let lookup = cache.lookup(&RequestContext::background(), &key, None).await;
        assert_eq!(lookup, CacheLookup::Miss);
        assert_eq!(cache.stats().quantization_errors, 1);
    }

    #[tokio::test]
    async fn quantized_entries_round_trip_through_l2() {
        let l2 = Arc::new(InMemoryL2::new());
        let cfg = config(4).with_quantization(QuantizationConfig::default().with_enabled(true));
        let writer = CacheHierarchy::new(cfg.clone()).with_l2(l2.clone());
        let reader = CacheHierarchy::new(cfg).with_l2(l2);
        let ctx = RequestContext::background();
        let key = CacheKey::for_text("q");
        let v = [0.5, -0.25, 0.125, 1.0];

        writer.store(&ctx, &key, "q", &v, &tags(&[])).await;
        match reader.lookup(&ctx, &key, None).await {
            CacheLookup::Hit { vector, .. } => {
                for (a, b) in vector.iter().zip(v.iter()) {
                    assert!((a - b).abs() <= 1.0 / 127.0 + 1e-6);
                }
            }
            CacheLookup::Miss => panic!("expected L2 hit"),
        }
    }

    #[tokio::test]
    async fn semantic_hit_requires_probe() {
        let cache = CacheHierarchy::new(config(2));
        let ctx = RequestContext::background();
        cache
            .store(&ctx, &CacheKey::for_text("search data"), "search data", &[1.0, 0.0], &tags(&[]))
            .await;

        let other = CacheKey::for_text("find data");
        assert_eq!(cache.lookup(&ctx, &other, None).await, CacheLookup::Miss);

        let near = cache.lookup(&ctx, &other, Some(&[0.99, 0.1])).await;
        assert_eq!(near.tier(), Some(Tier::Semantic));

        let far = cache.lookup(&ctx, &other, Some(&[0.5, 0.866])).await;
        assert_eq!(far, CacheLookup::Miss);
    }

    #[tokio::test]
    async fn tag_invalidation_reaches_every_tier() {
        let l2 = Arc::new(InMemoryL2::new());
        let cache = CacheHierarchy::new(config(2)).with_l2(l2.clone());
        let ctx = RequestContext::background();

        let a = CacheKey::for_text("a");
        let b = CacheKey::for_text("b");
        cache.store(&ctx, &a, "a", &[1.0, 0.0], &tags(&["tenant:1"])).await;
        cache.store(&ctx, &b, "b", &[0.0, 1.0], &tags(&["tenant:2"])).await;

        let report = cache.invalidate_tags(&ctx, &["tenant:1".to_string()]).await;
        assert_eq!(report, Invalidated { l1: 1, semantic: 1, l2_deleted: 1 });

        assert_eq!(cache.lookup(&ctx, &a, Some(&[1.0, 0.0])).await, CacheLookup::Miss);
        assert!(cache.lookup(&ctx, &b, None).await.is_hit());
    }

    #[tokio::test]
    async fn l2_entry_older_than_tag_watermark_is_rejected() {
        let l2 = Arc::new(InMemoryL2::new());
        let writer = CacheHierarchy::new(config(2)).with_l2(l2.clone());
        let other = CacheHierarchy::new(config(2)).with_l2(l2.clone());
        let ctx = RequestContext::background();
        let key = CacheKey::for_text("x");

        writer.store(&ctx, &key, "x", &[1.0, 1.0], &tags(&["stale"])).await;
        // `other` never held the key in L1, so only the watermark can catch it.
        other.invalidate_tags(&ctx, &["stale".to_string()]).await;
        assert_eq!(other.lookup(&ctx, &key, None).await, CacheLookup::Miss);
    }

    #[tokio::test]
    async fn entry_written_right_after_invalidation_survives() {
        let l2 = Arc::new(InMemoryL2::new());
        let cache = CacheHierarchy::new(config(2)).with_l2(l2);
        let ctx = RequestContext::background();
        let key = CacheKey::for_text("fresh");

        cache.invalidate_tags(&ctx, &["fresh".to_string()]).await;
        cache.store(&ctx, &key, "fresh", &[1.0, 0.0], &tags(&["fresh"])).await;

        // Force the read through L2, where the watermark applies.
        cache.l1().remove(&key);
        assert_eq!(cache.lookup(&ctx, &key, None).await.tier(), Some(Tier::L2));
    }

    /// L2 whose writes take a while, so a cancel can land mid-write.
    struct SlowWrites {
        inner: InMemoryL2,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl L2Store for SlowWrites {
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
            "slow"
        }
    }

    #[tokio::test]
    async fn cancelled_store_leaves_every_tier_empty() {
        let l2 = Arc::new(SlowWrites {
            inner: InMemoryL2::new(),
            delay: Duration::from_millis(300),
        });
        let cache = CacheHierarchy::new(config(2)).with_l2(l2.clone());
        let (ctx, handle) = RequestContext::with_cancel();
        let key = CacheKey::for_text("abandoned");

        let cancel = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        };
        let no_tags = tags(&[]);
        tokio::join!(
            cache.store(&ctx, &key, "abandoned", &[1.0, 0.0], &no_tags),
            cancel
        );

        assert!(!cache.l1().contains(&key));
        assert_eq!(l2.inner.len(), 0);
        assert_eq!(cache.stats().semantic.size, 0);
    }

    #[tokio::test]
    async fn store_on_cancelled_context_is_a_no_op() {
        let cache = CacheHierarchy::new(config(2));
        let (ctx, handle) = RequestContext::with_cancel();
        handle.cancel();
        let key = CacheKey::for_text("late");

        cache.store(&ctx, &key, "late", &[0.0, 1.0], &tags(&[])).await;
        assert!(!cache.l1().contains(&key));
        assert_eq!(cache.stats().semantic.size, 0);
    }

    #[tokio::test]
    async fn ttl_expires_across_tiers() {
        let l2 = Arc::new(InMemoryL2::new());
        let cache = CacheHierarchy::new(config(2).with_ttl(Some(Duration::from_millis(30))))
            .with_l2(l2);
        let ctx = RequestContext::background();
        let key = CacheKey::for_text("ttl");

        cache.store(&ctx, &key, "ttl", &[1.0, 0.0], &tags(&[])).await;
        assert!(cache.lookup(&ctx, &key, None).await.is_hit());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.lookup(&ctx, &key, Some(&[1.0, 0.0])).await, CacheLookup::Miss);
    }

    #[tokio::test]
    async fn health_reports_l2() {
        let cache = CacheHierarchy::new(config(2)).with_l2(Arc::new(InMemoryL2::new()));
        let health = cache.health(&RequestContext::background()).await;
        assert!(health.healthy);
        assert_eq!(health.l2.unwrap().name, "memory");
    }
}
