//! The [`Engine`] facade.
//!
//! `encode` runs every request through the same pipeline: validate, key and
//! de-duplicate the texts, look each one up in the cache hierarchy, plan the
//! misses onto devices, run one task per device partition, write fresh vectors
//! back to the cache and finally report the request to the SLO tracker and
//! the telemetry sink. The last step happens on every path, errors included.

use cache::{
    CacheHealth, CacheHierarchy, CacheKey, CacheLookup, CacheStats, Dtype, Invalidated, L2Store,
    SemanticIndex,
};
use futures::future::join_all;
use resilience::{default_classifier, Classifier, RequestContext, ResilienceGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

use crate::backend::Backend;
use crate::batch::{budget_bytes, BatchObservation, OptimizerStats, PredictiveBatchOptimizer};
use crate::config::EngineConfig;
use crate::error::{EngineError, ValidationError};
use crate::scheduler::{
    Device, DeviceKind, DeviceScheduler, DeviceSnapshot, DeviceSpec, PlanItem, SubBatch,
};
use crate::slo::{SloStatus, SloTracker};
use crate::telemetry::{NoopSink, RequestOutcome, TelemetrySink};

/// Per-request knobs for [`Engine::encode`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodeOptions {
    /// Caps sub-batch length instead of the optimizer's prediction.
    pub batch_size_hint: Option<usize>,
    /// Pins the request to this device while it is healthy.
    pub device_hint: Option<String>,
    /// Attached to every cache entry this request writes.
    pub tags: BTreeSet<String>,
    /// One query vector per text for the semantic tier.
    pub probes: Option<Vec<Vec<f32>>>,
}

impl EncodeOptions {
    pub fn with_batch_size_hint(mut self, batch_size: usize) -> Self {
        self.batch_size_hint = Some(batch_size);
        self
    }

    pub fn with_device_hint(mut self, device: impl Into<String>) -> Self {
        self.device_hint = Some(device.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_probes(mut self, probes: Vec<Vec<f32>>) -> Self {
        self.probes = Some(probes);
        self
    }
}

/// Answer to [`Engine::health_check`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    /// At least one device can serve and the cache tiers answer.
    pub healthy: bool,
    /// `None` when no device of that kind is registered.
    pub cpu: Option<bool>,
    pub gpu: Option<bool>,
    pub cache: CacheHealth,
    /// Per-device breaker state and rolling load.
    pub devices: Vec<DeviceSnapshot>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub texts: u64,
    /// Distinct texts that went to a device.
    pub computed: u64,
    pub fallbacks: u64,
}

/// Answer to [`Engine::stats`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsSnapshot {
    pub requests: RequestStats,
    pub cache: CacheStats,
    pub devices: Vec<DeviceSnapshot>,
    pub slos: Vec<SloStatus>,
    pub batching: OptimizerStats,
}

#[derive(Debug, Default)]
struct RequestCounters {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    rejected: AtomicU64,
    texts: AtomicU64,
    computed: AtomicU64,
    fallbacks: AtomicU64,
}

impl RequestCounters {
    fn record(&self, outcome: RequestOutcome, texts: usize) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.texts.fetch_add(texts as u64, Ordering::Relaxed);
        let counter = match outcome {
            RequestOutcome::Success => &self.succeeded,
            RequestOutcome::Failure => &self.failed,
            RequestOutcome::Cancelled => &self.cancelled,
            RequestOutcome::Rejected => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RequestStats {
        RequestStats {
            total: self.total.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            texts: self.texts.load(Ordering::Relaxed),
            computed: self.computed.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
        }
    }
}

/// Collects collaborators for an [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    devices: Vec<(DeviceSpec, Arc<dyn Backend>)>,
    l2: Option<Arc<dyn L2Store>>,
    semantic: Option<Arc<dyn SemanticIndex>>,
    telemetry: Arc<dyn TelemetrySink>,
    classifier: Classifier,
}

impl EngineBuilder {
    pub fn device(mut self, spec: DeviceSpec, backend: Arc<dyn Backend>) -> Self {
        self.devices.push((spec, backend));
        self
    }

    pub fn l2(mut self, store: Arc<dyn L2Store>) -> Self {
        self.l2 = Some(store);
        self
    }

    pub fn semantic_index(mut self, index: Arc<dyn SemanticIndex>) -> Self {
        self.semantic = Some(index);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Transient/permanent predicate used by every device guard.
    pub fn classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        let config = self.config;
        config.validate()?;
        if self.devices.is_empty() {
            return Err(EngineError::Config("at least one device is required".into()));
        }

        let mut cache = CacheHierarchy::new(config.cache.clone());
        if let Some(store) = self.l2 {
            cache = cache.with_l2(store);
        }
        if let Some(index) = self.semantic {
            cache = cache.with_semantic_index(index);
        }

        let mut scheduler = DeviceScheduler::new(config.scheduler).with_telemetry(self.telemetry.clone());
        for (spec, backend) in self.devices {
            if backend.dimension() != config.dimension {
                return Err(EngineError::Config(format!(
                    "device `{}` produces {}-dim vectors, engine expects {}",
                    spec.id,
                    backend.dimension(),
                    config.dimension
                )));
            }
            let guard =
                ResilienceGuard::with_classifier(spec.id.clone(), config.resilience, self.classifier.clone());
            scheduler.register(Device::new(spec, backend, guard))?;
        }

        let optimizer = PredictiveBatchOptimizer::new(
            config.batching.clone(),
            config.memory_budget_mb,
            config.dimension,
        );
        let slo = SloTracker::new(config.slos.clone());

        tracing::info!(
            dimension = config.dimension,
            devices = scheduler.devices().len(),
            hybrid = config.scheduler.hybrid_mode_enabled,
            multi_gpu = config.scheduler.multi_gpu_enabled,
            quantization = ?config.cache.quantization.dtype,
            semantic = config.cache.semantic_enabled,
            "engine ready"
        );

        Ok(Engine {
            config,
            cache,
            scheduler: Arc::new(scheduler),
            optimizer: Arc::new(optimizer),
            slo,
            telemetry: self.telemetry,
            counters: RequestCounters::default(),
        })
    }
}

/// A distinct text of one request and every position it fills.
struct Distinct<'a> {
    key: CacheKey,
    text: &'a str,
    probe: Option<&'a [f32]>,
    positions: Vec<usize>,
}

/// Embedding generation behind a cache hierarchy and a device scheduler.
///
/// Construct once with [`Engine::builder`] and share by reference (or `Arc`);
/// every method takes `&self`.
pub struct Engine {
    config: EngineConfig,
    cache: CacheHierarchy,
    scheduler: Arc<DeviceScheduler>,
    optimizer: Arc<PredictiveBatchOptimizer>,
    slo: SloTracker,
    telemetry: Arc<dyn TelemetrySink>,
    counters: RequestCounters,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            devices: Vec::new(),
            l2: None,
            semantic: None,
            telemetry: Arc::new(NoopSink),
            classifier: default_classifier(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheHierarchy {
        &self.cache
    }

    pub fn scheduler(&self) -> &DeviceScheduler {
        &self.scheduler
    }

    pub fn slo(&self) -> &SloTracker {
        &self.slo
    }

    /// One vector per input text, in input order.
    ///
    /// Validation failures return before any tier is touched. A device
    /// failure that survives retries and the single fallback returns
    /// [`EngineError::BackendUnavailable`]; a cancelled request returns
    /// [`EngineError::Cancelled`] and writes nothing to the cache.
    pub async fn encode(
        &self,
        ctx: &RequestContext,
        texts: &[String],
        options: &EncodeOptions,
    ) -> Result<Vec<Vec<f32>>, EngineError> {
        let started = Instant::now();
        let result = self.encode_inner(ctx, texts, options).await;

        let outcome = match &result {
            Ok(_) => RequestOutcome::Success,
            Err(EngineError::Validation(_)) => RequestOutcome::Rejected,
            Err(EngineError::Cancelled) => RequestOutcome::Cancelled,
            Err(_) => RequestOutcome::Failure,
        };
        let latency = started.elapsed();
        self.slo.record_request(latency, outcome);
        self.telemetry.record_request(latency, texts.len(), outcome);
        self.counters.record(outcome, texts.len());

        match &result {
            Ok(_) => tracing::debug!(texts = texts.len(), latency_ms = latency.as_millis() as u64, "encode finished"),
            Err(err) if err.is_validation() => tracing::debug!(error = %err, "encode rejected"),
            Err(EngineError::Cancelled) => tracing::debug!(texts = texts.len(), "encode cancelled"),
            Err(err) => tracing::warn!(texts = texts.len(), error = %err, "encode failed"),
        }
        result
    }

    async fn encode_inner(
        &self,
        ctx: &RequestContext,
        texts: &[String],
        options: &EncodeOptions,
    ) -> Result<Vec<Vec<f32>>, EngineError> {
        self.validate(texts, options)?;
        if ctx.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let distinct = self.distinct(texts, options);
        let lookups = join_all(
            distinct
                .iter()
                .map(|entry| self.cache.lookup(ctx, &entry.key, entry.probe)),
        )
        .await;

        let mut slots: Vec<Option<Vec<f32>>> = vec![None; distinct.len()];
        let mut misses = Vec::new();
        for (slot, lookup) in lookups.into_iter().enumerate() {
            self.telemetry.record_cache(lookup.tier());
            self.slo.record_cache(lookup.is_hit());
            match lookup {
                CacheLookup::Hit { vector, .. } => slots[slot] = Some(vector),
                CacheLookup::Miss => misses.push(PlanItem::new(slot, distinct[slot].text)),
            }
        }

        if !misses.is_empty() {
            if ctx.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let computed = self.compute(ctx, misses, options).await?;
            self.counters
                .computed
                .fetch_add(computed.len() as u64, Ordering::Relaxed);

            let mut fresh = Vec::with_capacity(computed.len());
            for (slot, vector) in computed {
                if ctx.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                let entry = &distinct[slot];
                self.cache
                    .store(ctx, &entry.key, entry.text, &vector, &options.tags)
                    .await;
                fresh.push(vector.clone());
                slots[slot] = Some(vector);
            }
            if ctx.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if self.cache.observe(&fresh) {
                tracing::debug!(vectors = fresh.len(), "quantization profile recalibrated");
            }
        }

        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        for (entry, vector) in distinct.iter().zip(slots) {
            let vector = vector.ok_or_else(|| {
                EngineError::Internal(format!("no vector produced for key {}", entry.key))
            })?;
            for &position in &entry.positions {
                vectors[position] = Some(vector.clone());
            }
        }
        vectors
            .into_iter()
            .map(|vector| vector.ok_or_else(|| EngineError::Internal("unfilled result slot".into())))
            .collect()
    }

    fn validate(&self, texts: &[String], options: &EncodeOptions) -> Result<(), ValidationError> {
        if texts.is_empty() {
            return Err(ValidationError::EmptyRequest);
        }
        if texts.len() > self.config.max_batch_texts {
            return Err(ValidationError::TooManyTexts {
                count: texts.len(),
                max: self.config.max_batch_texts,
            });
        }
        for (index, text) in texts.iter().enumerate() {
            if text.trim().is_empty() {
                return Err(ValidationError::EmptyText { index });
            }
            let len = text.chars().count();
            if len > self.config.max_text_length {
                return Err(ValidationError::TextTooLong {
                    index,
                    len,
                    max: self.config.max_text_length,
                });
            }
        }
        if let Some(probes) = options.probes.as_ref() {
            if probes.len() != texts.len()
                || probes.iter().any(|probe| probe.len() != self.config.dimension)
            {
                return Err(ValidationError::ProbeCountMismatch);
            }
        }
        Ok(())
    }

    /// Collapse texts with the same key, keeping the first probe seen.
    fn distinct<'a>(&self, texts: &'a [String], options: &'a EncodeOptions) -> Vec<Distinct<'a>> {
        let mut distinct: Vec<Distinct<'a>> = Vec::new();
        let mut by_key: HashMap<CacheKey, usize> = HashMap::new();
        for (position, text) in texts.iter().enumerate() {
            let key = CacheKey::for_text(text);
            match by_key.get(&key) {
                Some(&slot) => distinct[slot].positions.push(position),
                None => {
                    by_key.insert(key.clone(), distinct.len());
                    distinct.push(Distinct {
                        key,
                        text,
                        probe: options
                            .probes
                            .as_ref()
                            .map(|probes| probes[position].as_slice()),
                        positions: vec![position],
                    });
                }
            }
        }
        distinct
    }

    /// Run the misses on their devices, one task per device partition.
    async fn compute(
        &self,
        ctx: &RequestContext,
        misses: Vec<PlanItem>,
        options: &EncodeOptions,
    ) -> Result<Vec<(usize, Vec<f32>)>, EngineError> {
        let mean_length =
            misses.iter().map(|item| item.text.chars().count()).sum::<usize>() as f64 / misses.len() as f64;
        let max_batch = options
            .batch_size_hint
            .filter(|hint| *hint > 0)
            .unwrap_or_else(|| self.optimizer.optimal_batch_size(mean_length));

        let plan = self.scheduler.plan(
            misses,
            options.device_hint.as_deref(),
            max_batch,
            budget_bytes(self.config.memory_budget_mb),
            self.config.dimension,
        )?;
        tracing::debug!(
            sub_batches = plan.len(),
            max_batch,
            devices = ?plan.devices(),
            "dispatching cache misses"
        );

        let mut handles: Vec<JoinHandle<PartitionResult>> = Vec::new();
        for (device_id, batches) in plan.into_partitions() {
            let device = self.scheduler.device(&device_id).cloned().ok_or_else(|| {
                EngineError::Internal(format!("planned onto unknown device `{device_id}`"))
            })?;
            handles.push(tokio::spawn(run_partition(
                self.scheduler.clone(),
                self.optimizer.clone(),
                ctx.clone(),
                device,
                batches,
            )));
        }

        let joined = tokio::select! {
            joined = join_all(handles) => joined,
            _ = ctx.cancelled() => {
                // In-flight backend calls finish on their own; their results are dropped.
                return Err(EngineError::Cancelled);
            }
        };

        let mut computed = Vec::new();
        let mut failure: Option<EngineError> = None;
        for result in joined {
            let partition = match result {
                Ok(partition) => partition,
                Err(join_error) => Err(EngineError::Internal(format!(
                    "device task failed: {join_error}"
                ))),
            };
            match partition {
                Ok(done) => {
                    self.counters
                        .fallbacks
                        .fetch_add(done.fallbacks, Ordering::Relaxed);
                    computed.extend(done.vectors);
                }
                // Cancellation wins over any other failure.
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(computed),
        }
    }

    /// Breaker, device and cache tier health.
    pub async fn health_check(&self, ctx: &RequestContext) -> HealthReport {
        let devices = self.scheduler.snapshots();
        let kind_health = |kind: DeviceKind| {
            let mut of_kind = devices.iter().filter(|d| d.state.kind == kind).peekable();
            of_kind.peek()?;
            Some(of_kind.any(|d| d.healthy))
        };
        let cpu = kind_health(DeviceKind::Cpu);
        let gpu = kind_health(DeviceKind::Gpu);
        let cache = self.cache.health(ctx).await;
        let healthy = devices.iter().any(|d| d.healthy) && cache.healthy;

        if !healthy {
            tracing::warn!(?cpu, ?gpu, cache = cache.healthy, "engine unhealthy");
        }
        HealthReport {
            healthy,
            cpu,
            gpu,
            cache,
            devices,
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.counters.snapshot(),
            cache: self.cache.stats(),
            devices: self.scheduler.snapshots(),
            slos: self.slo.status(),
            batching: self.optimizer.stats(),
        }
    }

    pub async fn invalidate_tags(&self, ctx: &RequestContext, tags: &[String]) -> Invalidated {
        self.cache.invalidate_tags(ctx, tags).await
    }

    pub async fn invalidate_dtype(&self, ctx: &RequestContext, dtype: Dtype) -> Invalidated {
        self.cache.invalidate_dtype(ctx, dtype).await
    }

    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    /// Exempt the L1 entry for `text` from LRU eviction, or release it.
    /// False when the text is not resident in L1.
    pub fn pin(&self, text: &str, pinned: bool) -> bool {
        self.cache.set_pinned(&CacheKey::for_text(text), pinned)
    }
}

struct PartitionDone {
    vectors: Vec<(usize, Vec<f32>)>,
    fallbacks: u64,
}

type PartitionResult = Result<PartitionDone, EngineError>;

/// Sub-batches for one device, run one after another.
async fn run_partition(
    scheduler: Arc<DeviceScheduler>,
    optimizer: Arc<PredictiveBatchOptimizer>,
    ctx: RequestContext,
    device: Arc<Device>,
    batches: Vec<SubBatch>,
) -> PartitionResult {
    let mut done = PartitionDone {
        vectors: Vec::new(),
        fallbacks: 0,
    };
    for batch in batches {
        let texts = batch.texts();
        let executed = scheduler.execute(&ctx, &device, &texts).await?;
        if executed.fell_back {
            done.fallbacks += 1;
        }
        optimizer.observe(BatchObservation {
            text_length: batch.mean_text_length(),
            batch_size: batch.len(),
            actual_time: executed.elapsed,
            memory_used: batch.estimated_memory,
        });
        done.vectors.extend(
            batch
                .items
                .iter()
                .map(|item| item.slot)
                .zip(executed.vectors),
        );
    }
    Ok(done)
}
