// RedisStore - 共享计数存储的 Redis 实现
// 基于 bb8-redis 连接池；订阅使用独立的 PubSub 连接

use async_trait::async_trait;
use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use futures::StreamExt;
use redis::{AsyncCommands, Script};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::config::RedisConfig;
use crate::error::{Result, ThrottleError};
use crate::infra::metrics;
use crate::store::{CounterStore, Subscription};

/// INCR + PEXPIRE，每次自增都刷新 TTL
const INCR_WITH_TTL: &str = r#"
local value = redis.call('INCR', KEYS[1])
redis.call('PEXPIRE', KEYS[1], ARGV[1])
return value
"#;

/// 下限为 0 的 DECR
const DECR_FLOOR_ZERO: &str = r#"
local value = tonumber(redis.call('GET', KEYS[1]) or '0')
if value <= 0 then
  return 0
end
return redis.call('DECR', KEYS[1])
"#;

/// 滚动窗口：有序集合按服务端时间记录尝试，只保留最近 cap 条
const RECORD_ATTEMPT: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local period = tonumber(ARGV[1])
local cap = tonumber(ARGV[2])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - period)
redis.call('ZADD', KEYS[1], now, ARGV[3])
redis.call('ZREMRANGEBYRANK', KEYS[1], 0, -(cap + 1))
redis.call('PEXPIRE', KEYS[1], period)
return redis.call('ZCARD', KEYS[1])
"#;

const WINDOW_COUNT: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
return redis.call('ZCOUNT', KEYS[1], '(' .. (now - tonumber(ARGV[1])), '+inf')
"#;

struct Scripts {
    incr_with_ttl: Script,
    decr_floor_zero: Script,
    record_attempt: Script,
    window_count: Script,
}

fn scripts() -> &'static Scripts {
    static SCRIPTS: OnceLock<Scripts> = OnceLock::new();
    SCRIPTS.get_or_init(|| Scripts {
        incr_with_ttl: Script::new(INCR_WITH_TTL),
        decr_floor_zero: Script::new(DECR_FLOOR_ZERO),
        record_attempt: Script::new(RECORD_ATTEMPT),
        window_count: Script::new(WINDOW_COUNT),
    })
}

/// Redis 存储（基于连接池）
pub struct RedisStore {
    pool: Arc<Pool<RedisConnectionManager>>,
    /// PubSub 需要独占连接，不走连接池
    client: redis::Client,
    /// 单条 Redis 命令的执行超时
    command_timeout: Duration,
}

impl RedisStore {
    /// 创建新的 Redis 存储（从 RedisConfig 配置）
    pub async fn new(config: &RedisConfig) -> Result<Self> {
        let manager = RedisConnectionManager::new(config.url.clone()).map_err(|e| {
            ThrottleError::Store(format!("Failed to create Redis manager: {}", e))
        })?;
        let client = redis::Client::open(config.url.clone())?;

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .min_idle(Some(config.min_idle))
            .connection_timeout(config.connection_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .build(manager)
            .await
            .map_err(|e| ThrottleError::Store(format!("Failed to create Redis pool: {}", e)))?;

        // 测试连接
        {
            let mut conn = pool.get().await.map_err(|e| {
                ThrottleError::Store(format!("Failed to get Redis connection: {}", e))
            })?;
            let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        }

        tracing::info!(
            "✅ Redis 连接池已创建 (pool_size={}, min_idle={}, conn_timeout={}s, cmd_timeout={}ms)",
            config.pool_size,
            config.min_idle,
            config.connection_timeout_secs,
            config.command_timeout_ms,
        );

        Ok(Self {
            pool: Arc::new(pool),
            client,
            command_timeout: config.command_timeout(),
        })
    }

    /// 获取连接池状态（活跃连接数、空闲连接数）
    pub fn pool_state(&self) -> bb8::State {
        self.pool.state()
    }

    async fn get_conn(&self) -> Result<bb8::PooledConnection<'_, RedisConnectionManager>> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| ThrottleError::Store(format!("Failed to get Redis connection: {}", e)))?;
        let state = self.pool.state();
        metrics::record_redis_pool(
            state.connections.saturating_sub(state.idle_connections),
            state.idle_connections,
        );
        Ok(conn)
    }

    /// 执行带超时的 Redis 操作
    async fn with_timeout<F, T>(&self, op: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.command_timeout, op)
            .await
            .map_err(|_| {
                ThrottleError::Timeout(format!(
                    "Redis command timeout ({}ms)",
                    self.command_timeout.as_millis()
                ))
            })?
    }
}

fn millis(duration: Duration) -> u64 {
    (duration.as_millis() as u64).max(1)
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let value: i64 = scripts()
                .incr_with_ttl
                .key(key)
                .arg(millis(ttl))
                .invoke_async(&mut *conn)
                .await?;
            Ok(value)
        })
        .await
    }

    async fn decr_floor_zero(&self, key: &str) -> Result<i64> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let value: i64 = scripts()
                .decr_floor_zero
                .key(key)
                .invoke_async(&mut *conn)
                .await?;
            Ok(value)
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let value: Option<i64> = conn.get(key).await?;
            Ok(value)
        })
        .await
    }

    async fn record_attempt(&self, key: &str, period: Duration, cap: u64) -> Result<u64> {
        // 同一毫秒内的多次尝试需要不同的 member
        let member = uuid::Uuid::new_v4().to_string();
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let count: u64 = scripts()
                .record_attempt
                .key(key)
                .arg(millis(period))
                .arg(cap.max(1))
                .arg(member)
                .invoke_async(&mut *conn)
                .await?;
            Ok(count)
        })
        .await
    }

    async fn window_count(&self, key: &str, period: Duration) -> Result<u64> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let count: u64 = scripts()
                .window_count
                .key(key)
                .arg(millis(period))
                .invoke_async(&mut *conn)
                .await?;
            Ok(count)
        })
        .await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            conn.sadd::<_, _, ()>(key, member).await?;
            Ok(())
        })
        .await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            conn.srem::<_, _, ()>(key, member).await?;
            Ok(())
        })
        .await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let members: Vec<String> = conn.smembers(key).await?;
            Ok(members)
        })
        .await
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            conn.publish::<_, _, ()>(topic, payload).await?;
            Ok(())
        })
        .await
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let topic = topic.to_string();
        let mut pubsub = self
            .with_timeout(async { Ok(self.client.get_async_pubsub().await?) })
            .await?;
        self.with_timeout(async { Ok(pubsub.subscribe(&topic).await?) })
            .await?;

        tracing::debug!("📡 Redis 订阅已建立: {}", topic);

        Ok(pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                match msg.get_payload::<String>() {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        tracing::warn!("Redis 消息解码失败: {}", e);
                        None
                    }
                }
            })
            .boxed())
    }
}
