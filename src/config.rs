use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::gate::Cooldown;
use crate::strategy::{escape_component, StrategyCatalog, StrategyConfig};

/// 默认配置文件名
pub const DEFAULT_CONFIG_FILE: &str = "throttle.toml";

/// 完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// 共享存储；未配置时使用进程内存储（仅适合单进程）
    pub redis: Option<RedisConfig>,
    pub throttle: ThrottleSection,
    pub pause: PauseConfig,
    pub fetch: FetchConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    /// 任务类名 -> 限流配置
    pub jobs: HashMap<String, JobThrottleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleSection {
    /// 所有存储键的前缀
    pub key_prefix: String,
    /// 并发计数默认 TTL（秒）
    pub concurrency_ttl_secs: u64,
}

impl Default for ThrottleSection {
    fn default() -> Self {
        Self {
            key_prefix: "throttled".to_string(),
            concurrency_ttl_secs: 900,
        }
    }
}

impl ThrottleSection {
    pub fn concurrency_ttl(&self) -> Duration {
        Duration::from_secs(self.concurrency_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PauseConfig {
    /// 广播频道名
    pub topic: String,
    /// 全量同步间隔（秒）
    pub sync_interval_secs: u64,
    /// 重连退避下限（毫秒）
    pub reconnect_backoff_min_ms: u64,
    /// 重连退避上限（毫秒）
    pub reconnect_backoff_max_ms: u64,
}

impl Default for PauseConfig {
    fn default() -> Self {
        Self {
            topic: "throttled:pause".to_string(),
            sync_interval_secs: 30,
            reconnect_backoff_min_ms: 100,
            reconnect_backoff_max_ms: 5000,
        }
    }
}

impl PauseConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn backoff_min(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_min_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_max_ms)
    }
}

/// 取出门配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// 连续多少个限流任务后让队列冷却（0 = 关闭）
    pub cooldown_threshold: u32,
    /// 冷却时长（毫秒）
    pub cooldown_period_ms: u64,
}

impl FetchConfig {
    pub fn cooldown(&self) -> Cooldown {
        Cooldown::new(
            self.cooldown_threshold,
            Duration::from_millis(self.cooldown_period_ms),
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<String>,
    pub file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub pool_size: u32,
    pub min_idle: u32,
    pub connection_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub command_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 16,
            min_idle: 2,
            connection_timeout_secs: 5,
            idle_timeout_secs: 300,
            command_timeout_ms: 500,
        }
    }
}

impl RedisConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// `[jobs.<Class>]` 段
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobThrottleConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<ConcurrencySection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<ThresholdSection>,
    /// 参与限流键的参数下标
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_args: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencySection {
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdSection {
    pub limit: u32,
    pub period_secs: u64,
}

impl JobThrottleConfig {
    /// 转成策略配置
    pub fn to_strategy(&self, default_ttl: Duration) -> StrategyConfig {
        let mut config = StrategyConfig::new();
        if let Some(c) = &self.concurrency {
            let ttl = c.ttl_secs.map(Duration::from_secs).unwrap_or(default_ttl);
            config = config.concurrency_with_ttl(c.limit, ttl);
        }
        if let Some(t) = &self.threshold {
            config = config.threshold(t.limit, Duration::from_secs(t.period_secs));
        }
        if !self.key_args.is_empty() {
            let indices = self.key_args.clone();
            config = config.key_fn(move |args| key_from_args(&indices, args));
        }
        config
    }
}

/// 取出指定下标的参数拼成键后缀；任一参数缺失时不加后缀
fn key_from_args(indices: &[usize], args: &[Value]) -> Option<String> {
    let parts = indices
        .iter()
        .map(|&i| {
            args.get(i).map(|value| match value {
                Value::String(s) => escape_component(s),
                other => escape_component(&other.to_string()),
            })
        })
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join(":"))
}

impl ThrottleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 TOML 文件加载配置
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("无法读取配置文件: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| "配置文件格式错误")
    }

    /// 从环境变量合并（THROTTLE_ 前缀，Redis 另外支持 REDIS_URL）
    pub fn merge_from_env(&mut self) -> Result<()> {
        if let Ok(url) = env::var("THROTTLE_REDIS_URL").or_else(|_| env::var("REDIS_URL")) {
            self.redis_mut().url = url;
        }
        if let Ok(size) = env::var("THROTTLE_REDIS_POOL_SIZE") {
            let redis = self.redis_mut();
            redis.pool_size = size.parse().unwrap_or(redis.pool_size);
        }
        if let Ok(prefix) = env::var("THROTTLE_KEY_PREFIX") {
            self.throttle.key_prefix = prefix;
        }
        if let Ok(ttl) = env::var("THROTTLE_CONCURRENCY_TTL_SECS") {
            self.throttle.concurrency_ttl_secs =
                ttl.parse().unwrap_or(self.throttle.concurrency_ttl_secs);
        }
        if let Ok(topic) = env::var("THROTTLE_PAUSE_TOPIC") {
            self.pause.topic = topic;
        }
        if let Ok(interval) = env::var("THROTTLE_SYNC_INTERVAL_SECS") {
            self.pause.sync_interval_secs =
                interval.parse().unwrap_or(self.pause.sync_interval_secs);
        }
        if let Ok(level) = env::var("THROTTLE_LOG_LEVEL") {
            self.logging.level = Some(level);
        }
        if let Ok(format) = env::var("THROTTLE_LOG_FORMAT") {
            self.logging.format = Some(format);
        }
        if let Ok(file) = env::var("THROTTLE_LOG_FILE") {
            self.logging.file = Some(file);
        }
        Ok(())
    }

    /// 从命令行参数合并（最高优先级）
    pub fn merge_from_cli(&mut self, cli: &crate::cli::Cli) {
        if let Some(url) = &cli.redis_url {
            self.redis_mut().url = url.clone();
        }
        if let Some(prefix) = &cli.key_prefix {
            self.throttle.key_prefix = prefix.clone();
        }
        if let Some(level) = cli.get_log_level() {
            self.logging.level = Some(level);
        }
        if let Some(format) = cli.get_log_format() {
            self.logging.format = Some(format);
        }
        if let Some(file) = &cli.log_file {
            self.logging.file = Some(file.clone());
        }
        if cli.enable_metrics {
            self.metrics.enabled = true;
        }
        if let Some(port) = cli.metrics_port {
            self.metrics.port = port;
        }
    }

    /// 加载配置（按优先级：命令行 > 环境变量 > 配置文件 > 默认值）
    pub fn load(cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = match &cli.config_file {
            Some(config_file) if Path::new(config_file).exists() => {
                info!("📄 从配置文件加载: {}", config_file);
                Self::from_toml_file(config_file)?
            }
            Some(config_file) => {
                tracing::warn!("⚠️ 配置文件不存在: {}", config_file);
                Self::new()
            }
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                info!("📄 从默认配置文件加载: {}", DEFAULT_CONFIG_FILE);
                Self::from_toml_file(DEFAULT_CONFIG_FILE)?
            }
            None => Self::new(),
        };

        config.merge_from_env()?;
        config.merge_from_cli(cli);
        config.validate()?;

        Ok(config)
    }

    /// 检查配置是否合法（含每个任务类的限流配置）
    pub fn validate(&self) -> Result<()> {
        if self.throttle.key_prefix.is_empty() {
            anyhow::bail!("throttle.key_prefix 不能为空");
        }
        if self.throttle.concurrency_ttl_secs == 0 {
            anyhow::bail!("throttle.concurrency_ttl_secs 必须大于 0");
        }
        if self.pause.topic.is_empty() {
            anyhow::bail!("pause.topic 不能为空");
        }
        if self.pause.sync_interval_secs == 0 {
            anyhow::bail!("pause.sync_interval_secs 必须大于 0");
        }
        if self.pause.reconnect_backoff_min_ms > self.pause.reconnect_backoff_max_ms {
            anyhow::bail!("pause.reconnect_backoff_min_ms 不能大于 reconnect_backoff_max_ms");
        }
        if let Some(redis) = &self.redis {
            if redis.url.is_empty() {
                anyhow::bail!("redis.url 不能为空");
            }
            if redis.pool_size == 0 {
                anyhow::bail!("redis.pool_size 必须大于 0");
            }
        }
        self.catalog()?;
        Ok(())
    }

    /// 由 `[jobs.*]` 构建策略目录
    pub fn catalog(&self) -> Result<StrategyCatalog> {
        let mut catalog = StrategyCatalog::new();
        let default_ttl = self.throttle.concurrency_ttl();
        for (class, job) in &self.jobs {
            catalog
                .register(class.clone(), job.to_strategy(default_ttl))
                .with_context(|| format!("任务类 {} 的限流配置无效", class))?;
        }
        Ok(catalog)
    }

    fn redis_mut(&mut self) -> &mut RedisConfig {
        self.redis.get_or_insert_with(RedisConfig::default)
    }
}

/// 只读取 `[logging]` 段，用于在加载完整配置之前初始化日志
pub fn load_early_logging_config(config_file: Option<&str>) -> LoggingConfig {
    #[derive(Deserialize, Default)]
    struct EarlyConfig {
        #[serde(default)]
        logging: LoggingConfig,
    }

    let path = config_file.unwrap_or(DEFAULT_CONFIG_FILE);
    fs::read_to_string(path)
        .ok()
        .and_then(|content| toml::from_str::<EarlyConfig>(&content).ok())
        .map(|early| early.logging)
        .unwrap_or_default()
}
