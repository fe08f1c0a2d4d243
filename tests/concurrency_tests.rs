mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{DIM, ScriptedBackend, SlowWriteL2, config, single_device, texts};
use embedgate::{
    BackendError, CacheKey, DeviceSpec, EncodeOptions, Engine, EngineConfig, EngineError,
    GuardError, RequestContext, SemanticBackend, stub_vector,
};
use futures::future::join_all;

fn two_devices(
    config: EngineConfig,
    cpu: Arc<ScriptedBackend>,
    gpu: Arc<ScriptedBackend>,
) -> Engine {
    Engine::builder(config)
        .device(DeviceSpec::cpu(), cpu)
        .device(DeviceSpec::gpu(0), gpu)
        .build()
        .unwrap()
}

fn numbered(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("text {i:03}")).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_engine() {
    let backend = Arc::new(ScriptedBackend::healthy());
    let engine = Arc::new(single_device(
        config(5, Duration::from_secs(30), 0),
        backend.clone(),
    ));

    let handles: Vec<_> = (0..16)
        .map(|task| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let mut input = texts(&["shared one", "shared two", "shared three"]);
                input.push(format!("unique {task}"));
                let vectors = engine
                    .encode(&RequestContext::background(), &input, &EncodeOptions::default())
                    .await
                    .unwrap();
                (input, vectors)
            })
        })
        .collect();

    for (input, vectors) in join_all(handles).await.into_iter().map(Result::unwrap) {
        assert_eq!(vectors.len(), input.len());
        for (text, vector) in input.iter().zip(&vectors) {
            assert_eq!(vector, &stub_vector(text, DIM, true));
        }
    }

    let stats = engine.stats();
    assert_eq!(stats.requests.succeeded, 16);
    assert_eq!(stats.requests.texts, 64);
    assert!(engine.cache().l1().contains(&CacheKey::for_text("shared one")));
    assert!(engine.cache().l1().contains(&CacheKey::for_text("unique 15")));
}

#[tokio::test]
async fn hybrid_mode_splits_work_across_cpu_and_gpu() {
    let cpu = Arc::new(ScriptedBackend::healthy());
    let gpu = Arc::new(ScriptedBackend::healthy());
    let engine = two_devices(config(5, Duration::from_secs(30), 0), cpu.clone(), gpu.clone());
    let input = numbered(60);

    let vectors = engine
        .encode(&RequestContext::background(), &input, &EncodeOptions::default())
        .await
        .unwrap();

    assert!(cpu.calls() >= 1);
    assert!(gpu.calls() >= 1);
    for (text, vector) in input.iter().zip(&vectors) {
        assert_eq!(vector, &stub_vector(text, DIM, true), "{text} out of order");
    }
    assert_eq!(engine.stats().requests.computed, 60);
}

#[tokio::test]
async fn without_hybrid_mode_only_the_gpu_runs() {
    let cpu = Arc::new(ScriptedBackend::healthy());
    let gpu = Arc::new(ScriptedBackend::healthy());
    let mut cfg = config(5, Duration::from_secs(30), 0);
    cfg.scheduler = cfg.scheduler.with_hybrid_mode(false);
    let engine = two_devices(cfg, cpu.clone(), gpu.clone());

    engine
        .encode(&RequestContext::background(), &numbered(60), &EncodeOptions::default())
        .await
        .unwrap();
    assert_eq!(cpu.calls(), 0);
    assert!(gpu.calls() >= 1);
}

#[tokio::test]
async fn device_hint_pins_the_request() {
    let cpu = Arc::new(ScriptedBackend::healthy());
    let gpu = Arc::new(ScriptedBackend::healthy());
    let engine = two_devices(config(5, Duration::from_secs(30), 0), cpu.clone(), gpu.clone());

    engine
        .encode(
            &RequestContext::background(),
            &numbered(60),
            &EncodeOptions::default().with_device_hint("cpu"),
        )
        .await
        .unwrap();
    assert!(cpu.calls() >= 1);
    assert_eq!(gpu.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_mid_flight_returns_promptly() {
    let backend = Arc::new(ScriptedBackend::healthy().with_delay(Duration::from_millis(500)));
    let engine = Arc::new(single_device(
        config(5, Duration::from_secs(30), 0),
        backend.clone(),
    ));
    let (ctx, cancel) = RequestContext::with_cancel();

    let started = Instant::now();
    let request = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .encode(&ctx, &texts(&["in flight"]), &EncodeOptions::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();

    let result = request.await.unwrap();
    assert_eq!(result, Err(EngineError::Cancelled));
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(backend.calls(), 1);

    // The abandoned attempt finishing later must not populate the cache.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!engine.cache().l1().contains(&CacheKey::for_text("in flight")));
    assert_eq!(engine.stats().requests.cancelled, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_during_the_store_leaves_every_tier_empty() {
    let mut cfg = config(5, Duration::from_secs(30), 0);
    cfg.cache.semantic_enabled = true;
    cfg.cache.semantic_backend = SemanticBackend::Linear;
    let l2 = Arc::new(SlowWriteL2::new(Duration::from_millis(300)));
    let backend = Arc::new(ScriptedBackend::healthy());
    let engine = Arc::new(
        Engine::builder(cfg)
            .device(DeviceSpec::cpu(), backend.clone())
            .l2(l2.clone())
            .build()
            .unwrap(),
    );
    let (ctx, cancel) = RequestContext::with_cancel();

    let request = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .encode(&ctx, &texts(&["half written"]), &EncodeOptions::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.calls(), 1);
    cancel.cancel();

    assert_eq!(request.await.unwrap(), Err(EngineError::Cancelled));
    tokio::time::sleep(Duration::from_millis(350)).await;

    assert!(!engine.cache().l1().contains(&CacheKey::for_text("half written")));
    assert!(l2.inner.is_empty());
    let stats = engine.stats();
    assert_eq!(stats.cache.l1.size, 0);
    assert_eq!(stats.cache.semantic.size, 0);
    assert_eq!(stats.requests.cancelled, 1);
    assert_eq!(stats.requests.succeeded, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn open_breaker_rejects_a_burst_without_backend_calls() {
    let backend = Arc::new(ScriptedBackend::failing_times(
        100,
        BackendError::Connection("refused".into()),
    ));
    let engine = Arc::new(single_device(
        config(3, Duration::from_secs(30), 0),
        backend.clone(),
    ));

    for i in 0..3 {
        let input = vec![format!("warmup {i}")];
        assert!(engine
            .encode(&RequestContext::background(), &input, &EncodeOptions::default())
            .await
            .is_err());
    }
    assert_eq!(backend.calls(), 3);

    let burst = (0..10).map(|i| {
        let engine = engine.clone();
        async move {
            let input = vec![format!("burst {i}")];
            engine
                .encode(&RequestContext::background(), &input, &EncodeOptions::default())
                .await
        }
    });
    for result in join_all(burst).await {
        assert!(matches!(
            result,
            Err(EngineError::BackendUnavailable { cause: GuardError::CircuitOpen { .. }, .. })
        ));
    }
    assert_eq!(backend.calls(), 3);
    assert_eq!(engine.stats().requests.failed, 13);
}
