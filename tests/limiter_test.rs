use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use queue_throttle::strategy::{ConcurrencyLimiter, ThresholdLimiter, DEFAULT_CONCURRENCY_TTL};
use queue_throttle::{
    Decision, DecisionEvent, JobIdentity, LimiterKind, MemoryStore, StrategyCatalog,
    StrategyConfig, StrategyRegistry,
};
use serde_json::json;

fn collector() -> (Arc<Mutex<Vec<DecisionEvent>>>, Arc<dyn queue_throttle::Observer>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let observer: Arc<dyn queue_throttle::Observer> =
        Arc::new(move |event: &DecisionEvent| sink.lock().push(event.clone()));
    (events, observer)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_report_job_concurrency_two() {
    let store = Arc::new(MemoryStore::new());
    let limiter = ConcurrencyLimiter::new(2, DEFAULT_CONCURRENCY_TTL);

    let mut handles = Vec::new();
    for _ in 0..3 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            limiter.acquire(store.as_ref(), "ReportJob").await.unwrap()
        }));
    }
    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 2);

    limiter.release(store.as_ref(), "ReportJob").await.unwrap();
    assert!(limiter.acquire(store.as_ref(), "ReportJob").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_notify_job_three_per_minute() {
    let store = MemoryStore::new();
    let limiter = ThresholdLimiter::new(3, Duration::from_secs(60));

    let results = [
        limiter.allow(&store, "NotifyJob").await.unwrap(),
        limiter.allow(&store, "NotifyJob").await.unwrap(),
        limiter.allow(&store, "NotifyJob").await.unwrap(),
        limiter.allow(&store, "NotifyJob").await.unwrap(),
    ];
    assert_eq!(results, [true, true, true, false]);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(limiter.allow(&store, "NotifyJob").await.unwrap());
}

#[tokio::test]
async fn test_registry_reports_decisions_per_class_and_globally() {
    let store = Arc::new(MemoryStore::new());
    let (class_events, class_observer) = collector();
    let (global_events, global_observer) = collector();

    let catalog = StrategyCatalog::new()
        .with(
            "ReportJob",
            StrategyConfig::new().concurrency(1).observer(class_observer),
        )
        .unwrap();
    let registry =
        StrategyRegistry::new(catalog, store, "throttled").with_observer(global_observer);

    let first = JobIdentity::new("ReportJob", "1", "default", vec![]);
    let second = JobIdentity::new("ReportJob", "2", "default", vec![]);
    assert!(!registry.throttled(&first).await);
    assert!(registry.throttled(&second).await);

    let decisions: Vec<Decision> = class_events.lock().iter().map(|e| e.decision).collect();
    assert_eq!(decisions, vec![Decision::Allowed, Decision::Throttled]);
    assert_eq!(global_events.lock().len(), 2);
    assert_eq!(global_events.lock()[1].limiter_kind, LimiterKind::Concurrency);
    assert_eq!(global_events.lock()[1].key, "ReportJob");
}

#[tokio::test]
async fn test_store_unreachable_is_not_throttled() {
    let store = Arc::new(MemoryStore::new());
    let (events, observer) = collector();
    let catalog = StrategyCatalog::new()
        .with(
            "NotifyJob",
            StrategyConfig::new().threshold(1, Duration::from_secs(60)),
        )
        .unwrap();
    let registry = StrategyRegistry::new(catalog, store.clone(), "throttled").with_observer(observer);

    store.set_available(false);
    for i in 0..3 {
        let job = JobIdentity::new("NotifyJob", i.to_string(), "default", vec![]);
        assert!(!registry.throttled(&job).await);
    }
    assert!(events.lock().iter().all(|e| e.decision == Decision::Degraded));

    // 降级放行的任务结束时不会去归还不存在的槽位
    store.set_available(true);
    let job = JobIdentity::new("NotifyJob", "0", "default", vec![]);
    registry.finalize(&job).await;
    assert_eq!(registry.leases_held(), 2);
}

#[tokio::test]
async fn test_composite_charges_threshold_on_concurrency_rejection() {
    let store = Arc::new(MemoryStore::new());
    let catalog = StrategyCatalog::new()
        .with(
            "ExportJob",
            StrategyConfig::new()
                .concurrency(1)
                .threshold(2, Duration::from_secs(60)),
        )
        .unwrap();
    let registry = StrategyRegistry::new(catalog, store, "throttled");

    let a = JobIdentity::new("ExportJob", "a", "default", vec![]);
    let b = JobIdentity::new("ExportJob", "b", "default", vec![]);
    let c = JobIdentity::new("ExportJob", "c", "default", vec![]);

    assert!(!registry.throttled(&a).await);
    // b 被并发拒绝，但已占用一次阈值额度
    assert!(registry.throttled(&b).await);
    registry.finalize(&a).await;

    // 并发槽位已空，但阈值窗口已满
    assert!(registry.throttled(&c).await);

    let status = registry.status("ExportJob", &[]).await.unwrap().unwrap();
    assert_eq!(status.kind, LimiterKind::Composite);
    assert_eq!(status.in_flight, Some(0));
    assert_eq!(status.recent_attempts, Some(3));
}

#[tokio::test]
async fn test_key_function_isolates_tenants() {
    let store = Arc::new(MemoryStore::new());
    let catalog = StrategyCatalog::new()
        .with(
            "SyncTenantJob",
            StrategyConfig::new()
                .concurrency(1)
                .key_fn(|args| args.first().map(|v| v.to_string())),
        )
        .unwrap();
    let registry = StrategyRegistry::new(catalog, store, "throttled");

    let acme = JobIdentity::new("SyncTenantJob", "1", "default", vec![json!(1)]);
    let globex = JobIdentity::new("SyncTenantJob", "2", "default", vec![json!(2)]);
    let acme_again = JobIdentity::new("SyncTenantJob", "3", "default", vec![json!(1)]);

    assert!(!registry.throttled(&acme).await);
    assert!(!registry.throttled(&globex).await);
    assert!(registry.throttled(&acme_again).await);
}

#[test]
fn test_invalid_strategy_is_rejected_at_registration() {
    let mut catalog = StrategyCatalog::new();
    assert!(catalog.register("EmptyJob", StrategyConfig::new()).is_err());
    assert!(catalog
        .register("ZeroJob", StrategyConfig::new().concurrency(0))
        .is_err());
    assert!(catalog.is_empty());
}
