// Infrastructure layer - 基础设施层
// Redis 存储后端与 Prometheus 指标

pub mod metrics;
pub mod redis;

pub use self::metrics::MetricsObserver;
pub use self::redis::RedisStore;
