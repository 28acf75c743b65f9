//! 共享计数存储抽象
//!
//! 所有限流状态都保存在跨进程共享的存储里，进程内只保留无状态的策略对象。
//! 每个写操作都必须是一次原子操作（Redis 上是单条命令或 Lua 脚本），
//! 不允许"先读后写"两次往返。

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

pub mod memory;

pub use memory::MemoryStore;

/// 订阅得到的消息流；连接断开时流结束
pub type Subscription = BoxStream<'static, String>;

/// 共享计数存储接口
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// 原子自增并刷新过期时间，返回自增后的值
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64>;

    /// 原子自减，下限为 0（值已为 0 时不做任何修改），返回自减后的值
    async fn decr_floor_zero(&self, key: &str) -> Result<i64>;

    /// 读取计数，不存在时返回 None
    async fn get(&self, key: &str) -> Result<Option<i64>>;

    /// 在滚动窗口中记录一次尝试，返回窗口内（含本次）的尝试次数。
    ///
    /// 存储只需保留最近 `cap` 条记录，因此返回值不会超过 `cap`。
    async fn record_attempt(&self, key: &str, period: Duration, cap: u64) -> Result<u64>;

    /// 读取滚动窗口内的尝试次数，不记录新的尝试
    async fn window_count(&self, key: &str, period: Duration) -> Result<u64>;

    /// SADD
    async fn set_add(&self, key: &str, member: &str) -> Result<()>;

    /// SREM
    async fn set_remove(&self, key: &str, member: &str) -> Result<()>;

    /// SMEMBERS
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// 向频道发布消息
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;

    /// 订阅频道
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}
