//! 限流策略
//!
//! 每个任务类对应一个 `Strategy`：并发、阈值或两者组合。
//! 策略对象本身无状态，所有计数都在共享存储里。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::{Result, ThrottleError};
use crate::observer::{LimiterKind, Observer};
use crate::store::CounterStore;

pub mod concurrency;
pub mod registry;
pub mod threshold;

pub use concurrency::{ConcurrencyLimiter, DEFAULT_CONCURRENCY_TTL};
pub use registry::{StrategyRegistry, ThrottleStatus};
pub use threshold::ThresholdLimiter;

/// 从任务参数派生限流键后缀（例如按租户限流）
pub type KeyFn = Arc<dyn Fn(&[Value]) -> Option<String> + Send + Sync>;

/// 单个任务类的限流配置
#[derive(Clone, Default)]
pub struct StrategyConfig {
    pub concurrency: Option<ConcurrencyLimiter>,
    pub threshold: Option<ThresholdLimiter>,
    pub key: Option<KeyFn>,
    pub observer: Option<Arc<dyn Observer>>,
}

impl fmt::Debug for StrategyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyConfig")
            .field("concurrency", &self.concurrency)
            .field("threshold", &self.threshold)
            .field("key", &self.key.is_some())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl StrategyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn concurrency(self, limit: u32) -> Self {
        self.concurrency_with_ttl(limit, DEFAULT_CONCURRENCY_TTL)
    }

    pub fn concurrency_with_ttl(mut self, limit: u32, ttl: Duration) -> Self {
        self.concurrency = Some(ConcurrencyLimiter::new(limit, ttl));
        self
    }

    pub fn threshold(mut self, limit: u32, period: Duration) -> Self {
        self.threshold = Some(ThresholdLimiter::new(limit, period));
        self
    }

    pub fn key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Value]) -> Option<String> + Send + Sync + 'static,
    {
        self.key = Some(Arc::new(f));
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// 检查配置是否合法
    pub fn validate(&self, class: &str) -> Result<()> {
        if self.concurrency.is_none() && self.threshold.is_none() {
            return Err(ThrottleError::Configuration(format!(
                "{}: at least one of concurrency or threshold is required",
                class
            )));
        }
        if let Some(c) = &self.concurrency {
            if c.limit() == 0 {
                return Err(ThrottleError::Configuration(format!(
                    "{}: concurrency limit must be positive",
                    class
                )));
            }
            if c.ttl().is_zero() {
                return Err(ThrottleError::Configuration(format!(
                    "{}: concurrency ttl must be positive",
                    class
                )));
            }
        }
        if let Some(t) = &self.threshold {
            if t.limit() == 0 {
                return Err(ThrottleError::Configuration(format!(
                    "{}: threshold limit must be positive",
                    class
                )));
            }
            if t.period().is_zero() {
                return Err(ThrottleError::Configuration(format!(
                    "{}: threshold period must be positive",
                    class
                )));
            }
        }
        Ok(())
    }
}

/// 应用提供的全部限流配置（任务类名 -> 配置）
#[derive(Debug, Clone, Default)]
pub struct StrategyCatalog {
    entries: HashMap<String, StrategyConfig>,
}

impl StrategyCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个任务类；配置不合法时拒绝
    pub fn register(&mut self, class: impl Into<String>, config: StrategyConfig) -> Result<()> {
        let class = class.into();
        config.validate(&class)?;
        self.entries.insert(class, config);
        Ok(())
    }

    /// 链式注册
    pub fn with(mut self, class: impl Into<String>, config: StrategyConfig) -> Result<Self> {
        self.register(class, config)?;
        Ok(self)
    }

    pub fn get(&self, class: &str) -> Option<&StrategyConfig> {
        self.entries.get(class)
    }

    pub fn contains(&self, class: &str) -> bool {
        self.entries.contains_key(class)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// 限流器组合
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limiter {
    Concurrency(ConcurrencyLimiter),
    Threshold(ThresholdLimiter),
    Composite {
        concurrency: ConcurrencyLimiter,
        threshold: ThresholdLimiter,
    },
}

impl Limiter {
    pub fn kind(&self) -> LimiterKind {
        match self {
            Limiter::Concurrency(_) => LimiterKind::Concurrency,
            Limiter::Threshold(_) => LimiterKind::Threshold,
            Limiter::Composite { .. } => LimiterKind::Composite,
        }
    }

    pub fn concurrency(&self) -> Option<&ConcurrencyLimiter> {
        match self {
            Limiter::Concurrency(c) | Limiter::Composite { concurrency: c, .. } => Some(c),
            Limiter::Threshold(_) => None,
        }
    }

    pub fn threshold(&self) -> Option<&ThresholdLimiter> {
        match self {
            Limiter::Threshold(t) | Limiter::Composite { threshold: t, .. } => Some(t),
            Limiter::Concurrency(_) => None,
        }
    }
}

/// 限流键：类名 + 可选后缀。各段转义后再拼接，保证不同实体不会撞键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimiterKey {
    prefix: String,
    scope: String,
}

/// 转义键分段中的 `%` 和 `:`
pub fn escape_component(raw: &str) -> String {
    raw.replace('%', "%25").replace(':', "%3A")
}

impl LimiterKey {
    pub fn new(prefix: &str, class: &str, suffix: Option<&str>) -> Self {
        let scope = match suffix {
            Some(suffix) => format!("{}:{}", escape_component(class), escape_component(suffix)),
            None => escape_component(class),
        };
        Self {
            prefix: prefix.to_string(),
            scope,
        }
    }

    /// 用于日志和观察者的可读键
    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn concurrency_key(&self) -> String {
        format!("{}:concurrency:{}", self.prefix, self.scope)
    }

    pub fn threshold_key(&self) -> String {
        format!("{}:threshold:{}", self.prefix, self.scope)
    }
}

/// 准入结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// 放行；持有并发槽位时带上需要归还的存储键
    Granted { lease: Option<String> },
    Throttled { by: LimiterKind },
}

/// 已解析的策略实例
pub struct Strategy {
    class: String,
    prefix: String,
    limiter: Limiter,
    key_fn: Option<KeyFn>,
    observer: Option<Arc<dyn Observer>>,
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strategy")
            .field("class", &self.class)
            .field("limiter", &self.limiter)
            .finish()
    }
}

impl Strategy {
    /// 由配置构建；配置里一个限流器都没有时返回 None
    pub fn from_config(prefix: &str, class: &str, config: &StrategyConfig) -> Option<Self> {
        let limiter = match (config.concurrency, config.threshold) {
            (Some(concurrency), Some(threshold)) => Limiter::Composite {
                concurrency,
                threshold,
            },
            (Some(c), None) => Limiter::Concurrency(c),
            (None, Some(t)) => Limiter::Threshold(t),
            (None, None) => return None,
        };
        Some(Self {
            class: class.to_string(),
            prefix: prefix.to_string(),
            limiter,
            key_fn: config.key.clone(),
            observer: config.observer.clone(),
        })
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn limiter(&self) -> &Limiter {
        &self.limiter
    }

    pub fn kind(&self) -> LimiterKind {
        self.limiter.kind()
    }

    pub fn observer(&self) -> Option<&Arc<dyn Observer>> {
        self.observer.as_ref()
    }

    pub fn key_for(&self, args: &[Value]) -> LimiterKey {
        let suffix = self.key_fn.as_ref().and_then(|f| f(args));
        LimiterKey::new(&self.prefix, &self.class, suffix.as_deref())
    }

    /// 准入判断
    ///
    /// 组合策略先检查阈值（无需补偿），再尝试获取并发槽位；
    /// 并发获取失败时，阈值已经计入的这次尝试不退还。
    pub async fn admit(&self, store: &dyn CounterStore, key: &LimiterKey) -> Result<Admission> {
        match &self.limiter {
            Limiter::Concurrency(concurrency) => {
                acquire_slot(concurrency, store, key, LimiterKind::Concurrency).await
            }
            Limiter::Threshold(threshold) => {
                if threshold.allow(store, &key.threshold_key()).await? {
                    Ok(Admission::Granted { lease: None })
                } else {
                    Ok(Admission::Throttled {
                        by: LimiterKind::Threshold,
                    })
                }
            }
            Limiter::Composite {
                concurrency,
                threshold,
            } => {
                if !threshold.allow(store, &key.threshold_key()).await? {
                    return Ok(Admission::Throttled {
                        by: LimiterKind::Threshold,
                    });
                }
                acquire_slot(concurrency, store, key, LimiterKind::Concurrency).await
            }
        }
    }

    /// 归还并发槽位
    pub async fn release(&self, store: &dyn CounterStore, lease: &str) -> Result<()> {
        match self.limiter.concurrency() {
            Some(concurrency) => concurrency.release(store, lease).await,
            None => Ok(()),
        }
    }
}

async fn acquire_slot(
    concurrency: &ConcurrencyLimiter,
    store: &dyn CounterStore,
    key: &LimiterKey,
    kind: LimiterKind,
) -> Result<Admission> {
    let slot = key.concurrency_key();
    if concurrency.acquire(store, &slot).await? {
        Ok(Admission::Granted { lease: Some(slot) })
    } else {
        Ok(Admission::Throttled { by: kind })
    }
}
