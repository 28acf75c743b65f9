//! 策略注册表
//!
//! 按任务类名惰性构建并缓存策略实例，负责把限流决策通知给观察者，
//! 并维护本进程的准入账本（任务 ID -> 持有的并发租约）。

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{Admission, Strategy, StrategyCatalog};
use crate::error::Result;
use crate::infra::metrics;
use crate::job::JobIdentity;
use crate::observer::{Decision, DecisionEvent, LimiterKind, Observer};
use crate::store::CounterStore;

/// 已准入任务持有的资源
struct Admitted {
    strategy: Arc<Strategy>,
    /// 并发槽位对应的存储键；纯阈值策略或降级放行时为 None
    lease: Option<String>,
}

/// 某个限流键的当前状态（管理查询用）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThrottleStatus {
    pub class: String,
    pub key: String,
    pub kind: LimiterKind,
    pub concurrency_limit: Option<u32>,
    pub in_flight: Option<u64>,
    pub threshold_limit: Option<u32>,
    pub period_secs: Option<u64>,
    pub recent_attempts: Option<u64>,
}

pub struct StrategyRegistry {
    catalog: StrategyCatalog,
    prefix: String,
    store: Arc<dyn CounterStore>,
    cache: DashMap<String, Option<Arc<Strategy>>>,
    ledger: DashMap<String, Admitted>,
    observers: Vec<Arc<dyn Observer>>,
}

impl StrategyRegistry {
    pub fn new(
        catalog: StrategyCatalog,
        store: Arc<dyn CounterStore>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            prefix: prefix.into(),
            store,
            cache: DashMap::new(),
            ledger: DashMap::new(),
            observers: Vec::new(),
        }
    }

    /// 注册全局观察者（对所有任务类生效）
    pub fn add_observer(&mut self, observer: Arc<dyn Observer>) {
        self.observers.push(observer);
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.add_observer(observer);
        self
    }

    pub fn catalog(&self) -> &StrategyCatalog {
        &self.catalog
    }

    /// 解析任务类的策略；未配置的任务类返回 None（永不限流）
    ///
    /// 每个类名只构建一次，首次构建在 DashMap 条目锁内完成。
    pub fn resolve(&self, class: &str) -> Option<Arc<Strategy>> {
        if let Some(cached) = self.cache.get(class) {
            return cached.value().clone();
        }

        self.cache
            .entry(class.to_string())
            .or_insert_with(|| {
                let strategy = self
                    .catalog
                    .get(class)
                    .and_then(|config| Strategy::from_config(&self.prefix, class, config))
                    .map(Arc::new);
                debug!(class, configured = strategy.is_some(), "策略已解析");
                strategy
            })
            .value()
            .clone()
    }

    /// 判断任务是否需要限流
    ///
    /// 同一任务 ID 只准入一次：已在账本里的任务直接放行（仍以 `Allowed` 通知观察者），
    /// 不会再次计数。
    /// 存储故障时按放行处理，并以 `Degraded` 通知观察者。
    pub async fn throttled(&self, job: &JobIdentity) -> bool {
        let Some(strategy) = self.resolve(&job.class) else {
            return false;
        };
        let key = strategy.key_for(&job.args);

        if self.ledger.contains_key(&job.id) {
            self.notify(
                &strategy,
                &DecisionEvent {
                    job_class: job.class.clone(),
                    key: key.scope().to_string(),
                    decision: Decision::Allowed,
                    limiter_kind: strategy.kind(),
                },
            );
            return false;
        }

        let (decision, kind, throttled) = match strategy.admit(self.store.as_ref(), &key).await {
            Ok(Admission::Granted { lease }) => {
                self.record(
                    &job.id,
                    Admitted {
                        strategy: strategy.clone(),
                        lease,
                    },
                )
                .await;
                (Decision::Allowed, strategy.kind(), false)
            }
            Ok(Admission::Throttled { by }) => {
                debug!(class = %job.class, jid = %job.id, key = key.scope(), "任务被限流: limiter={}", by.as_str());
                (Decision::Throttled, by, true)
            }
            Err(e) => {
                warn!(class = %job.class, jid = %job.id, "⚠️ 限流存储不可用，降级放行: {}", e);
                self.record(
                    &job.id,
                    Admitted {
                        strategy: strategy.clone(),
                        lease: None,
                    },
                )
                .await;
                (Decision::Degraded, strategy.kind(), false)
            }
        };

        metrics::record_leases_held(self.ledger.len());
        self.notify(
            &strategy,
            &DecisionEvent {
                job_class: job.class.clone(),
                key: key.scope().to_string(),
                decision,
                limiter_kind: kind,
            },
        );
        throttled
    }

    /// 任务结束（成功、失败或 panic）后归还租约；重复调用无副作用
    pub async fn finalize(&self, job: &JobIdentity) {
        let Some((_, admitted)) = self.ledger.remove(&job.id) else {
            return;
        };
        self.release(&job.id, admitted).await;
        metrics::record_leases_held(self.ledger.len());
    }

    /// 归还本进程持有的全部租约（关闭时调用），返回归还的任务数
    pub async fn release_all(&self) -> usize {
        let ids: Vec<String> = self.ledger.iter().map(|entry| entry.key().clone()).collect();
        let mut released = 0;
        for id in ids {
            if let Some((id, admitted)) = self.ledger.remove(&id) {
                self.release(&id, admitted).await;
                released += 1;
            }
        }
        metrics::record_leases_held(self.ledger.len());
        released
    }

    /// 本进程当前持有的准入记录数
    pub fn leases_held(&self) -> usize {
        self.ledger.len()
    }

    /// 查询任务类在给定参数下的限流状态；未配置的类返回 None
    pub async fn status(&self, class: &str, args: &[Value]) -> Result<Option<ThrottleStatus>> {
        let Some(strategy) = self.resolve(class) else {
            return Ok(None);
        };
        let key = strategy.key_for(args);
        let store = self.store.as_ref();

        let mut status = ThrottleStatus {
            class: class.to_string(),
            key: key.scope().to_string(),
            kind: strategy.kind(),
            concurrency_limit: None,
            in_flight: None,
            threshold_limit: None,
            period_secs: None,
            recent_attempts: None,
        };
        if let Some(concurrency) = strategy.limiter().concurrency() {
            status.concurrency_limit = Some(concurrency.limit());
            status.in_flight = Some(concurrency.in_flight(store, &key.concurrency_key()).await?);
        }
        if let Some(threshold) = strategy.limiter().threshold() {
            status.threshold_limit = Some(threshold.limit());
            status.period_secs = Some(threshold.period().as_secs());
            status.recent_attempts = Some(threshold.recent(store, &key.threshold_key()).await?);
        }
        Ok(Some(status))
    }

    /// 写入账本；同一任务被并发准入两次时，归还被顶替的那份租约
    async fn record(&self, job_id: &str, admitted: Admitted) {
        if let Some(displaced) = self.ledger.insert(job_id.to_string(), admitted) {
            debug!(jid = job_id, "重复准入，归还多占的槽位");
            self.release(job_id, displaced).await;
        }
    }

    async fn release(&self, job_id: &str, admitted: Admitted) {
        let Some(lease) = admitted.lease else {
            return;
        };
        // 归还失败时由计数 TTL 兜底
        if let Err(e) = admitted.strategy.release(self.store.as_ref(), &lease).await {
            warn!(jid = job_id, key = %lease, "归还并发槽位失败: {}", e);
        }
    }

    fn notify(&self, strategy: &Strategy, event: &DecisionEvent) {
        if let Some(observer) = strategy.observer() {
            observer.on_decision(event);
        }
        for observer in &self.observers {
            observer.on_decision(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::strategy::StrategyConfig;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    fn registry(store: Arc<MemoryStore>) -> StrategyRegistry {
        let catalog = StrategyCatalog::new()
            .with("ReportJob", StrategyConfig::new().concurrency(1))
            .unwrap()
            .with(
                "NotifyJob",
                StrategyConfig::new().threshold(1, Duration::from_secs(60)),
            )
            .unwrap();
        StrategyRegistry::new(catalog, store, "test")
    }

    fn job(class: &str, id: &str) -> JobIdentity {
        JobIdentity::new(class, id, "default", vec![])
    }

    #[tokio::test]
    async fn test_unknown_class_is_never_throttled() {
        let registry = registry(Arc::new(MemoryStore::new()));
        assert!(registry.resolve("Unknown").is_none());
        for i in 0..10 {
            assert!(!registry.throttled(&job("Unknown", &i.to_string())).await);
        }
        assert_eq!(registry.leases_held(), 0);
    }

    #[tokio::test]
    async fn test_resolve_is_memoized() {
        let registry = registry(Arc::new(MemoryStore::new()));
        let a = registry.resolve("ReportJob").unwrap();
        let b = registry.resolve("ReportJob").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_admission_is_idempotent_per_job() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        let first = job("ReportJob", "j1");

        assert!(!registry.throttled(&first).await);
        // 同一任务的二次检查不会再占一个槽位
        assert!(!registry.throttled(&first).await);
        assert!(registry.throttled(&job("ReportJob", "j2")).await);

        registry.finalize(&first).await;
        registry.finalize(&first).await;
        assert_eq!(store.get("test:concurrency:ReportJob").await.unwrap(), Some(0));
        assert!(!registry.throttled(&job("ReportJob", "j3")).await);
    }

    #[tokio::test]
    async fn test_threshold_job_not_charged_twice() {
        let registry = registry(Arc::new(MemoryStore::new()));
        let first = job("NotifyJob", "n1");

        assert!(!registry.throttled(&first).await);
        assert!(!registry.throttled(&first).await);
        assert!(registry.throttled(&job("NotifyJob", "n2")).await);
    }

    #[tokio::test]
    async fn test_store_outage_fails_open_with_degraded_event() {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let registry = registry(store.clone()).with_observer(Arc::new(
            move |event: &DecisionEvent| sink.lock().push(event.clone()),
        ));

        store.set_available(false);
        assert!(!registry.throttled(&job("NotifyJob", "n1")).await);

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].decision, Decision::Degraded);
        assert_eq!(events[0].job_class, "NotifyJob");
    }

    #[tokio::test]
    async fn test_release_all_returns_every_slot() {
        let store = Arc::new(MemoryStore::new());
        let catalog = StrategyCatalog::new()
            .with(
                "SyncJob",
                StrategyConfig::new()
                    .concurrency(5)
                    .key_fn(|args| args.first().and_then(Value::as_str).map(str::to_string)),
            )
            .unwrap();
        let registry = StrategyRegistry::new(catalog, store.clone(), "test");

        for (i, tenant) in ["a", "a", "b"].iter().enumerate() {
            let job = JobIdentity::new("SyncJob", i.to_string(), "default", vec![json!(tenant)]);
            assert!(!registry.throttled(&job).await);
        }
        assert_eq!(registry.leases_held(), 3);

        assert_eq!(registry.release_all().await, 3);
        assert_eq!(store.get("test:concurrency:SyncJob:a").await.unwrap(), Some(0));
        assert_eq!(store.get("test:concurrency:SyncJob:b").await.unwrap(), Some(0));
        assert_eq!(registry.leases_held(), 0);
    }

    #[tokio::test]
    async fn test_status_reports_counts() {
        let registry = registry(Arc::new(MemoryStore::new()));
        assert!(!registry.throttled(&job("ReportJob", "r1")).await);

        let status = registry.status("ReportJob", &[]).await.unwrap().unwrap();
        assert_eq!(status.kind, LimiterKind::Concurrency);
        assert_eq!(status.concurrency_limit, Some(1));
        assert_eq!(status.in_flight, Some(1));
        assert_eq!(status.recent_attempts, None);

        assert!(registry.status("Unknown", &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_admission_returns_displaced_slot() {
        let store = Arc::new(MemoryStore::new());
        let catalog = StrategyCatalog::new()
            .with("ReportJob", StrategyConfig::new().concurrency(2))
            .unwrap();
        let registry = StrategyRegistry::new(catalog, store.clone(), "test");
        let first = job("ReportJob", "dup");

        assert!(!registry.throttled(&first).await);
        // 同一 jid 的另一次并发准入也拿到了槽位
        let strategy = registry.resolve("ReportJob").unwrap();
        let key = strategy.key_for(&[]);
        let lease = match strategy.admit(store.as_ref(), &key).await.unwrap() {
            Admission::Granted { lease } => lease,
            other => panic!("unexpected admission: {:?}", other),
        };
        assert_eq!(store.get("test:concurrency:ReportJob").await.unwrap(), Some(2));

        registry
            .record(&first.id, Admitted { strategy, lease })
            .await;
        assert_eq!(store.get("test:concurrency:ReportJob").await.unwrap(), Some(1));
        assert_eq!(registry.leases_held(), 1);

        registry.finalize(&first).await;
        assert_eq!(store.get("test:concurrency:ReportJob").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_ledger_hit_is_reported_as_allowed() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let registry = registry(Arc::new(MemoryStore::new())).with_observer(Arc::new(
            move |event: &DecisionEvent| sink.lock().push(event.clone()),
        ));
        let first = job("ReportJob", "r1");

        assert!(!registry.throttled(&first).await);
        assert!(!registry.throttled(&first).await);

        let decisions: Vec<Decision> = events.lock().iter().map(|e| e.decision).collect();
        assert_eq!(decisions, vec![Decision::Allowed, Decision::Allowed]);
    }
}
