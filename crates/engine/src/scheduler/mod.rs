//! Device selection, batch partitioning and guarded execution.
//!
//! Every device carries its own [`ResilienceGuard`](resilience::ResilienceGuard)
//! and rolling [`DeviceState`]. A request's cache misses are planned onto the
//! healthy devices the policy allows, in proportion to how fast each device
//! has been, and each sub-batch runs under its device's guard with exactly one
//! fallback to another healthy device.

mod device;
mod plan;

pub use device::{Device, DeviceKind, DeviceSnapshot, DeviceSpec, DeviceState};
pub use plan::{BatchPlan, PlanItem, SubBatch};

use resilience::{BackendError, GuardError, RequestContext};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::check_response;
use crate::batch::{estimate_item_bytes, MemoryAwareBatcher};
use crate::error::EngineError;
use crate::telemetry::{NoopSink, TelemetrySink};
use plan::{mean_chars, proportional_counts};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Schedule CPU and GPUs together. When off, only one device class is
    /// used: GPU if any is registered, otherwise CPU.
    pub hybrid_mode_enabled: bool,
    /// When off, only the first registered GPU is used.
    pub multi_gpu_enabled: bool,
    pub ema_alpha: f64,
    /// Weight target multiplier after a failure.
    pub failure_weight_factor: f64,
    /// Items longer than this multiple of the mean go to the fastest device.
    pub large_item_factor: f64,
    /// Requests smaller than this many items per candidate stay on one device.
    pub min_items_per_device: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            hybrid_mode_enabled: true,
            multi_gpu_enabled: true,
            ema_alpha: 0.25,
            failure_weight_factor: 0.1,
            large_item_factor: 3.0,
            min_items_per_device: 4,
        }
    }
}

impl SchedulerConfig {
    pub fn with_hybrid_mode(mut self, enabled: bool) -> Self {
        self.hybrid_mode_enabled = enabled;
        self
    }

    pub fn with_multi_gpu(mut self, enabled: bool) -> Self {
        self.multi_gpu_enabled = enabled;
        self
    }

    pub fn with_min_items_per_device(mut self, items: usize) -> Self {
        self.min_items_per_device = items.max(1);
        self
    }
}

/// Vectors for one sub-batch and the device that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct Executed {
    pub device: String,
    pub vectors: Vec<Vec<f32>>,
    pub fell_back: bool,
    pub elapsed: Duration,
}

pub struct DeviceScheduler {
    config: SchedulerConfig,
    devices: Vec<Arc<Device>>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl std::fmt::Debug for DeviceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceScheduler")
            .field("config", &self.config)
            .field("devices", &self.devices)
            .finish_non_exhaustive()
    }
}

impl DeviceScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            devices: Vec::new(),
            telemetry: Arc::new(NoopSink),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Device ids must be unique.
    pub fn register(&mut self, device: Device) -> Result<(), EngineError> {
        if self.device(device.id()).is_some() {
            return Err(EngineError::Config(format!(
                "device `{}` registered twice",
                device.id()
            )));
        }
        tracing::debug!(device = %device.id(), kind = ?device.kind(), "device registered");
        self.devices.push(Arc::new(device));
        Ok(())
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn device(&self, id: &str) -> Option<&Arc<Device>> {
        self.devices.iter().find(|device| device.id() == id)
    }

    /// Devices the hybrid/multi-GPU policy allows, healthy or not.
    pub fn eligible(&self) -> Vec<Arc<Device>> {
        let has_gpu = self.devices.iter().any(|d| d.kind() == DeviceKind::Gpu);
        let mut first_gpu_seen = false;

        self.devices
            .iter()
            .filter(|device| {
                self.config.hybrid_mode_enabled
                    || (device.kind() == DeviceKind::Gpu) == has_gpu
            })
            .filter(|device| {
                if self.config.multi_gpu_enabled || device.kind() != DeviceKind::Gpu {
                    return true;
                }
                let first = !first_gpu_seen;
                first_gpu_seen = true;
                first
            })
            .cloned()
            .collect()
    }

    /// Healthy devices a request may use. A healthy hinted device pins the
    /// request to itself.
    pub fn candidates(&self, hint: Option<&str>) -> Vec<Arc<Device>> {
        if let Some(hint) = hint {
            match self.device(hint) {
                Some(device) if device.is_healthy() => return vec![device.clone()],
                Some(_) => tracing::debug!(device = %hint, "hinted device unhealthy, ignoring hint"),
                None => tracing::debug!(device = %hint, "hinted device unknown, ignoring hint"),
            }
        }
        self.eligible()
            .into_iter()
            .filter(|device| device.is_healthy())
            .collect()
    }

    /// Highest-scoring device for `items` items; ties go to the device that
    /// has served fewer requests.
    pub fn select(&self, candidates: &[Arc<Device>], items: usize) -> Option<Arc<Device>> {
        let states: Vec<DeviceState> = candidates.iter().map(|d| d.state()).collect();
        best_index(&states, items).map(|index| candidates[index].clone())
    }

    /// Best healthy device other than `failed`, ignoring class policy.
    pub fn fallback_for(&self, failed: &str, items: usize) -> Option<Arc<Device>> {
        let others: Vec<Arc<Device>> = self
            .devices
            .iter()
            .filter(|device| device.id() != failed && device.is_healthy())
            .cloned()
            .collect();
        self.select(&others, items)
    }

    /// Partition `items` across devices, then cut each device's share into
    /// sub-batches of at most `max_batch` items within `budget_bytes`.
    pub fn plan(
        &self,
        items: Vec<PlanItem>,
        hint: Option<&str>,
        max_batch: usize,
        budget_bytes: usize,
        dimension: usize,
    ) -> Result<BatchPlan, EngineError> {
        if items.is_empty() {
            return Ok(BatchPlan::default());
        }

        let mut candidates = self.candidates(hint);
        if candidates.is_empty() {
            // Nothing healthy: route to the policy's best device and let its
            // breaker answer, so the caller sees why.
            let eligible = self.eligible();
            candidates = self.select(&eligible, items.len()).into_iter().collect();
        }
        if candidates.is_empty() {
            return Err(EngineError::Config("no devices registered".into()));
        }

        let assignments = if candidates.len() == 1
            || items.len() < candidates.len() * self.config.min_items_per_device
        {
            let device = self
                .select(&candidates, items.len())
                .ok_or_else(|| EngineError::Config("no devices registered".into()))?;
            vec![(device, items)]
        } else {
            self.split(&candidates, items)
        };

        let mut plan = BatchPlan::default();
        for (device, items) in assignments {
            let mut batcher = MemoryAwareBatcher::with_budget_bytes(budget_bytes, dimension)
                .with_max_items(max_batch);
            let mut push = |items: Vec<PlanItem>| {
                let estimated_memory = items
                    .iter()
                    .map(|item| estimate_item_bytes(item.text.chars().count(), dimension))
                    .sum();
                plan.sub_batches.push(SubBatch {
                    device: device.id().to_string(),
                    items,
                    estimated_memory,
                });
            };
            for item in items {
                if let Some(full) = batcher.add(item) {
                    push(full);
                }
            }
            if let Some(rest) = batcher.flush() {
                push(rest);
            }
        }

        tracing::debug!(
            sub_batches = plan.len(),
            items = plan.total_items(),
            devices = ?plan.devices(),
            "batch plan ready"
        );
        Ok(plan)
    }

    fn split(&self, candidates: &[Arc<Device>], items: Vec<PlanItem>) -> Vec<(Arc<Device>, Vec<PlanItem>)> {
        let latencies: Vec<f64> = candidates
            .iter()
            .map(|device| device.state().latency_per_item())
            .collect();
        let fastest = latencies
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(index, _)| index)
            .unwrap_or(0);

        let threshold = mean_chars(&items) * self.config.large_item_factor;
        let (large, regular): (Vec<PlanItem>, Vec<PlanItem>) = items
            .into_iter()
            .partition(|item| item.text.chars().count() as f64 > threshold);

        let counts = proportional_counts(regular.len(), &latencies);
        let mut buckets: Vec<Vec<PlanItem>> = vec![Vec::new(); candidates.len()];
        let mut rest = regular.into_iter();
        for (bucket, count) in buckets.iter_mut().zip(counts) {
            bucket.extend(rest.by_ref().take(count));
        }
        if !large.is_empty() {
            tracing::debug!(
                large = large.len(),
                device = %candidates[fastest].id(),
                "routing large items to fastest device"
            );
            buckets[fastest].extend(large);
        }

        candidates
            .iter()
            .cloned()
            .zip(buckets)
            .filter(|(_, bucket)| !bucket.is_empty())
            .collect()
    }

    /// Run `texts` on `device`; on failure try exactly one alternate healthy
    /// device.
    pub async fn execute(
        &self,
        ctx: &RequestContext,
        device: &Arc<Device>,
        texts: &[String],
    ) -> Result<Executed, EngineError> {
        let started = Instant::now();
        let cause = match self.run_on(ctx, device, texts).await {
            Ok(vectors) => {
                return Ok(Executed {
                    device: device.id().to_string(),
                    vectors,
                    fell_back: false,
                    elapsed: started.elapsed(),
                })
            }
            Err(cause) if cause.allows_fallback() => cause,
            Err(_) => return Err(EngineError::Cancelled),
        };

        let Some(alternate) = self.fallback_for(device.id(), texts.len()) else {
            tracing::warn!(device = %device.id(), error = %cause, "device failed and no alternate is healthy");
            return Err(EngineError::BackendUnavailable {
                device: device.id().to_string(),
                cause,
            });
        };

        tracing::warn!(
            from = %device.id(),
            to = %alternate.id(),
            error = %cause,
            "falling back to alternate device"
        );
        match self.run_on(ctx, &alternate, texts).await {
            Ok(vectors) => Ok(Executed {
                device: alternate.id().to_string(),
                vectors,
                fell_back: true,
                elapsed: started.elapsed(),
            }),
            Err(GuardError::Cancelled) => Err(EngineError::Cancelled),
            Err(cause) => Err(EngineError::BackendUnavailable {
                device: alternate.id().to_string(),
                cause,
            }),
        }
    }

    async fn run_on(
        &self,
        ctx: &RequestContext,
        device: &Device,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, GuardError> {
        let backend = device.backend();
        let dimension = backend.dimension();
        let started = Instant::now();

        let result = device
            .guard()
            .call(ctx, move |_attempt| async move {
                let vectors = backend.compute_vectors(ctx, texts).await?;
                check_response(&vectors, texts.len(), dimension)?;
                Ok::<_, BackendError>(vectors)
            })
            .await;
        let elapsed = started.elapsed();

        match &result {
            Ok(_) => device.record_success(self.config.ema_alpha, texts.len(), elapsed),
            // Nothing ran on the device.
            Err(GuardError::CircuitOpen { .. }) | Err(GuardError::Cancelled) => {}
            Err(_) => device.record_failure(
                self.config.ema_alpha,
                self.config.failure_weight_factor,
                elapsed,
            ),
        }
        self.telemetry.record_device_call(
            device.id(),
            texts.len(),
            elapsed,
            result.as_ref().map(|_| ()),
        );
        self.telemetry.record_breaker(device.id(), device.guard().state());
        result
    }

    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let total: u64 = self
            .devices
            .iter()
            .map(|device| device.state().request_count)
            .sum();
        self.devices
            .iter()
            .map(|device| device.snapshot(total))
            .collect()
    }
}

fn best_index(states: &[DeviceState], items: usize) -> Option<usize> {
    let mut best: Option<(usize, f64, u64)> = None;
    for (index, state) in states.iter().enumerate() {
        let score = state.score(items);
        let better = match best {
            None => true,
            Some((_, best_score, best_count)) => {
                let tie = (score - best_score).abs() <= 1e-12 * best_score.abs().max(1.0);
                if tie {
                    state.request_count < best_count
                } else {
                    score > best_score
                }
            }
        };
        if better {
            best = Some((index, score, state.request_count));
        }
    }
    best.map(|(index, _, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, StubBackend};
    use async_trait::async_trait;
    use resilience::{
        CircuitBreakerConfig, CircuitState, ResilienceConfig, ResilienceGuard, RetryConfig,
    };
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailingBackend {
        error: BackendError,
        calls: AtomicU32,
    }

    impl FailingBackend {
        fn new(error: BackendError) -> Self {
            Self {
                error,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Backend for FailingBackend {
        async fn compute_vectors(
            &self,
            _ctx: &RequestContext,
            _texts: &[String],
        ) -> Result<Vec<Vec<f32>>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(self.error.clone())
        }

        fn dimension(&self) -> usize {
            8
        }
    }

    fn guard(id: &str, threshold: u32) -> ResilienceGuard {
        ResilienceGuard::new(
            id,
            ResilienceConfig::default()
                .with_circuit_breaker(
                    CircuitBreakerConfig::default()
                        .with_failure_threshold(threshold)
                        .with_recovery_timeout(Duration::from_secs(60)),
                )
                .with_retry(RetryConfig::default().with_max_retries(0)),
        )
    }

    fn scheduler(config: SchedulerConfig, devices: Vec<(DeviceSpec, Arc<dyn Backend>)>) -> DeviceScheduler {
        let mut scheduler = DeviceScheduler::new(config);
        for (spec, backend) in devices {
            let guard = guard(&spec.id, 1);
            scheduler.register(Device::new(spec, backend, guard)).unwrap();
        }
        scheduler
    }

    fn stub() -> Arc<dyn Backend> {
        Arc::new(StubBackend::new(8))
    }

    fn items(n: usize) -> Vec<PlanItem> {
        (0..n).map(|i| PlanItem::new(i, format!("text {i:03}"))).collect()
    }

    fn ids(devices: &[Arc<Device>]) -> Vec<&str> {
        devices.iter().map(|d| d.id()).collect()
    }

    #[test]
    fn gpu_scores_above_cpu() {
        let s = scheduler(
            SchedulerConfig::default(),
            vec![(DeviceSpec::cpu(), stub()), (DeviceSpec::gpu(0), stub())],
        );
        let chosen = s.select(&s.candidates(None), 10).unwrap();
        assert_eq!(chosen.id(), "gpu:0");
    }

    #[test]
    fn ties_go_to_fewest_requests() {
        let mut busy = DeviceState::new(&DeviceSpec::cpu());
        busy.request_count = 5;
        let idle = DeviceState {
            id: "cpu:1".into(),
            request_count: 1,
            ..busy.clone()
        };
        assert_eq!(best_index(&[busy, idle], 4), Some(1));
        assert_eq!(best_index(&[], 4), None);
    }

    #[test]
    fn hybrid_off_keeps_one_class() {
        let devices = || vec![(DeviceSpec::cpu(), stub()), (DeviceSpec::gpu(0), stub()), (DeviceSpec::gpu(1), stub())];

        let hybrid = scheduler(SchedulerConfig::default(), devices());
        assert_eq!(ids(&hybrid.eligible()), vec!["cpu", "gpu:0", "gpu:1"]);

        let gpu_only = scheduler(SchedulerConfig::default().with_hybrid_mode(false), devices());
        assert_eq!(ids(&gpu_only.eligible()), vec!["gpu:0", "gpu:1"]);

        let single_gpu = scheduler(
            SchedulerConfig::default().with_hybrid_mode(false).with_multi_gpu(false),
            devices(),
        );
        assert_eq!(ids(&single_gpu.eligible()), vec!["gpu:0"]);

        let cpu_only = scheduler(
            SchedulerConfig::default().with_hybrid_mode(false),
            vec![(DeviceSpec::cpu(), stub())],
        );
        assert_eq!(ids(&cpu_only.eligible()), vec!["cpu"]);
    }

    #[test]
    fn hint_pins_to_healthy_device() {
        let s = scheduler(
            SchedulerConfig::default(),
            vec![(DeviceSpec::cpu(), stub()), (DeviceSpec::gpu(0), stub())],
        );
        assert_eq!(ids(&s.candidates(Some("cpu"))), vec!["cpu"]);
        assert_eq!(ids(&s.candidates(Some("tpu"))), vec!["cpu", "gpu:0"]);

        let plan = s.plan(items(40), Some("cpu"), 256, usize::MAX / 2, 8).unwrap();
        assert_eq!(plan.devices(), vec!["cpu"]);
    }

    #[tokio::test]
    async fn open_breaker_excludes_device() {
        let failing: Arc<dyn Backend> = Arc::new(FailingBackend::new(BackendError::Rejected("no".into())));
        let s = scheduler(
            SchedulerConfig::default(),
            vec![(DeviceSpec::cpu(), stub()), (DeviceSpec::gpu(0), failing)],
        );
        let gpu = s.device("gpu:0").unwrap().clone();
        let texts = vec!["a".to_string()];

        // Threshold 1: one failure opens the breaker, the fallback serves it.
        let executed = s.execute(&RequestContext::background(), &gpu, &texts).await.unwrap();
        assert_eq!(executed.device, "cpu");
        assert!(executed.fell_back);
        assert_eq!(gpu.guard().state(), CircuitState::Open);

        assert_eq!(ids(&s.candidates(None)), vec!["cpu"]);
        assert_eq!(ids(&s.candidates(Some("gpu:0"))), vec!["cpu"]);
        let snapshot = s.snapshots();
        assert!(!snapshot[1].healthy);
        assert_eq!(snapshot[1].state.failure_count, 1);
    }

    #[test]
    fn mixed_batch_splits_by_inverse_latency() {
        let s = scheduler(
            SchedulerConfig::default(),
            vec![(DeviceSpec::cpu(), stub()), (DeviceSpec::gpu(0), stub())],
        );
        let plan = s.plan(items(60), None, 256, usize::MAX / 2, 8).unwrap();

        let per_device: Vec<(String, usize)> = plan
            .clone()
            .into_partitions()
            .into_iter()
            .map(|(device, batches)| (device, batches.iter().map(SubBatch::len).sum()))
            .collect();
        assert_eq!(per_device, vec![("cpu".to_string(), 10), ("gpu:0".to_string(), 50)]);
    }

    #[test]
    fn large_items_go_to_fastest_device() {
        let s = scheduler(
            SchedulerConfig::default(),
            vec![(DeviceSpec::cpu(), stub()), (DeviceSpec::gpu(0), stub())],
        );
        let mut batch = items(30);
        batch.push(PlanItem::new(30, "x".repeat(2000)));
        let plan = s.plan(batch, None, 256, usize::MAX / 2, 8).unwrap();

        let holder = plan
            .sub_batches
            .iter()
            .find(|b| b.items.iter().any(|item| item.slot == 30))
            .unwrap();
        assert_eq!(holder.device, "gpu:0");
        assert_eq!(plan.total_items(), 31);
    }

    #[test]
    fn sub_batches_respect_max_batch_and_budget() {
        let s = scheduler(SchedulerConfig::default(), vec![(DeviceSpec::cpu(), stub())]);
        let plan = s.plan(items(20), None, 8, usize::MAX / 2, 8).unwrap();
        let lengths: Vec<usize> = plan.sub_batches.iter().map(SubBatch::len).collect();
        assert_eq!(lengths, vec![8, 8, 4]);

        // Each item costs 2*8 + 4*8 + 256 = 304 bytes; two fit in 700.
        let tight = s.plan(items(5), None, 256, 700, 8).unwrap();
        assert!(tight.sub_batches.iter().all(|b| b.len() <= 2 && b.estimated_memory <= 700));
        assert_eq!(tight.total_items(), 5);
    }

    #[tokio::test]
    async fn only_one_fallback_is_attempted() {
        let first = Arc::new(FailingBackend::new(BackendError::Timeout("slow".into())));
        let second = Arc::new(FailingBackend::new(BackendError::Timeout("slow".into())));
        let third = Arc::new(FailingBackend::new(BackendError::Timeout("slow".into())));
        let s = scheduler(
            SchedulerConfig::default(),
            vec![
                (DeviceSpec::gpu(0), first.clone() as Arc<dyn Backend>),
                (DeviceSpec::gpu(1), second.clone() as Arc<dyn Backend>),
                (DeviceSpec::cpu(), third.clone() as Arc<dyn Backend>),
            ],
        );
        let gpu0 = s.device("gpu:0").unwrap().clone();

        let err = s
            .execute(&RequestContext::background(), &gpu0, &["a".to_string()])
            .await
            .unwrap_err();
        match err {
            EngineError::BackendUnavailable { device, cause } => {
                assert_eq!(device, "gpu:1");
                assert!(matches!(cause, GuardError::Exhausted { attempts: 1, .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
        assert_eq!(third.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_request_skips_fallback() {
        let failing = Arc::new(FailingBackend::new(BackendError::Timeout("slow".into())));
        let s = scheduler(
            SchedulerConfig::default(),
            vec![(DeviceSpec::gpu(0), failing.clone() as Arc<dyn Backend>), (DeviceSpec::cpu(), stub())],
        );
        let (ctx, handle) = RequestContext::with_cancel();
        handle.cancel();

        let gpu = s.device("gpu:0").unwrap().clone();
        let err = s.execute(&ctx, &gpu, &["a".to_string()]).await.unwrap_err();
        assert_eq!(err, EngineError::Cancelled);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 0);
        assert_eq!(gpu.guard().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn malformed_response_is_a_permanent_failure() {
        struct ShortBackend;

        #[async_trait]
        impl Backend for ShortBackend {
            async fn compute_vectors(
                &self,
                _ctx: &RequestContext,
                _texts: &[String],
            ) -> Result<Vec<Vec<f32>>, BackendError> {
                Ok(vec![vec![0.0; 3]])
            }

            fn dimension(&self) -> usize {
                8
            }
        }

        let s = scheduler(SchedulerConfig::default(), vec![(DeviceSpec::cpu(), Arc::new(ShortBackend) as Arc<dyn Backend>)]);
        let cpu = s.device("cpu").unwrap().clone();
        let err = s
            .execute(&RequestContext::background(), &cpu, &["a".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::BackendUnavailable { cause: GuardError::Permanent { .. }, .. }
        ));
    }

    #[test]
    fn duplicate_device_ids_are_rejected() {
        let mut s = scheduler(SchedulerConfig::default(), vec![(DeviceSpec::cpu(), stub())]);
        let err = s
            .register(Device::new(DeviceSpec::cpu(), stub(), guard("cpu", 1)))
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
