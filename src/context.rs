//! 组装入口
//!
//! `ThrottleContext` 在进程启动时构建一次，显式传给宿主的取出/执行路径。

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::config::ThrottleConfig;
use crate::error::{Result, ThrottleError};
use crate::gate::{ExecutionGate, FetchGate, HostQueue};
use crate::infra::redis::RedisStore;
use crate::observer::Observer;
use crate::pause::{Communicator, QueuePauser};
use crate::store::{CounterStore, MemoryStore};
use crate::strategy::{StrategyCatalog, StrategyConfig, StrategyRegistry, ThrottleStatus};

pub struct ThrottleContextBuilder {
    config: ThrottleConfig,
    catalog: StrategyCatalog,
    store: Option<Arc<dyn CounterStore>>,
    observers: Vec<Arc<dyn Observer>>,
}

impl ThrottleContextBuilder {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            catalog: StrategyCatalog::new(),
            store: None,
            observers: Vec::new(),
        }
    }

    /// 代码中注册的策略；与配置文件中的同名任务类冲突时以代码为准
    pub fn catalog(mut self, catalog: StrategyCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn strategy(mut self, class: impl Into<String>, config: StrategyConfig) -> Result<Self> {
        self.catalog.register(class, config)?;
        Ok(self)
    }

    /// 指定存储（测试或自定义后端）；不指定时按配置选择 Redis 或内存存储
    pub fn store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 全局观察者
    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    pub async fn build(self) -> Result<ThrottleContext> {
        self.config
            .validate()
            .map_err(|e| ThrottleError::Configuration(format!("{:#}", e)))?;

        let store: Arc<dyn CounterStore> = match (self.store, &self.config.redis) {
            (Some(store), _) => store,
            (None, Some(redis)) => Arc::new(RedisStore::new(redis).await?),
            (None, None) => {
                warn!("⚠️ 未配置 Redis，使用进程内存储（限流与暂停只在本进程内生效）");
                Arc::new(MemoryStore::new())
            }
        };

        let mut catalog = self
            .config
            .catalog()
            .map_err(|e| ThrottleError::Configuration(format!("{:#}", e)))?;
        for class in self.catalog.classes() {
            if let Some(config) = self.catalog.get(class) {
                catalog.register(class, config.clone())?;
            }
        }

        let prefix = self.config.throttle.key_prefix.clone();
        let mut registry = StrategyRegistry::new(catalog, store.clone(), prefix.clone());
        for observer in self.observers {
            registry.add_observer(observer);
        }

        let communicator = Arc::new(
            Communicator::new(store.clone(), self.config.pause.topic.clone()).with_backoff(
                self.config.pause.backoff_min(),
                self.config.pause.backoff_max(),
            ),
        );
        let pauser = Arc::new(QueuePauser::new(
            store.clone(),
            communicator.clone(),
            &prefix,
            self.config.pause.sync_interval(),
        ));

        info!(
            "✅ 限流上下文已创建: {} 个任务类, 键前缀 {}",
            registry.catalog().len(),
            prefix
        );

        Ok(ThrottleContext {
            config: self.config,
            store,
            registry: Arc::new(registry),
            communicator,
            pauser,
        })
    }
}

pub struct ThrottleContext {
    config: ThrottleConfig,
    store: Arc<dyn CounterStore>,
    registry: Arc<StrategyRegistry>,
    communicator: Arc<Communicator>,
    pauser: Arc<QueuePauser>,
}

impl ThrottleContext {
    pub fn builder(config: ThrottleConfig) -> ThrottleContextBuilder {
        ThrottleContextBuilder::new(config)
    }

    /// 加载暂停快照并启动后台同步
    pub async fn start(&self) {
        self.pauser.start().await;
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<StrategyRegistry> {
        &self.registry
    }

    pub fn pauser(&self) -> &Arc<QueuePauser> {
        &self.pauser
    }

    pub fn communicator(&self) -> &Arc<Communicator> {
        &self.communicator
    }

    pub fn fetch_gate(&self, host: Arc<dyn HostQueue>) -> FetchGate {
        FetchGate::new(host, self.registry.clone(), self.pauser.clone())
            .with_cooldown(self.config.fetch.cooldown())
    }

    pub fn execution_gate(&self, host: Arc<dyn HostQueue>) -> ExecutionGate {
        ExecutionGate::new(host, self.registry.clone())
    }

    pub async fn pause(&self, queue: &str) -> Result<()> {
        self.pauser.pause(queue).await
    }

    pub async fn resume(&self, queue: &str) -> Result<()> {
        self.pauser.resume(queue).await
    }

    pub fn is_paused(&self, queue: &str) -> bool {
        self.pauser.is_paused(queue)
    }

    pub fn paused_queues(&self) -> Vec<String> {
        self.pauser.paused_queues()
    }

    pub async fn status(&self, class: &str, args: &[Value]) -> Result<Option<ThrottleStatus>> {
        self.registry.status(class, args).await
    }

    /// 停止后台任务并归还本进程持有的租约
    pub async fn shutdown(&self) {
        self.pauser.stop().await;
        self.communicator.stop().await;
        let released = self.registry.release_all().await;
        info!("🛑 限流上下文已关闭，归还 {} 个租约", released);
    }
}
