//! 并发限流器：限制同一限流键下同时在途的任务数
//!
//! 计数保存在共享存储中。TTL 只是进程崩溃后的兜底回收，
//! 必须长于最长任务执行时间，正常路径一定通过 `release` 归还。

use std::time::Duration;

use crate::error::Result;
use crate::store::CounterStore;

/// 默认计数 TTL（15 分钟）
pub const DEFAULT_CONCURRENCY_TTL: Duration = Duration::from_secs(900);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyLimiter {
    limit: u32,
    ttl: Duration,
}

impl ConcurrencyLimiter {
    pub fn new(limit: u32, ttl: Duration) -> Self {
        Self { limit, ttl }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 尝试获取一个槽位。
    ///
    /// 先原子自增；自增后超过上限则立即减回并返回 false。
    /// 计数值始终不小于实际持有者数量，所以任意交错下持有者都不会超过上限。
    pub async fn acquire(&self, store: &dyn CounterStore, key: &str) -> Result<bool> {
        let value = store.incr_with_ttl(key, self.ttl).await?;
        if value <= i64::from(self.limit) {
            return Ok(true);
        }

        // 回滚失败时多出来的计数由 TTL 回收；任务仍按限流处理
        if let Err(e) = store.decr_floor_zero(key).await {
            tracing::warn!(key, "并发槽位回滚失败: {}", e);
        }
        Ok(false)
    }

    /// 归还槽位（下限为 0，重复归还不会变成负数）
    pub async fn release(&self, store: &dyn CounterStore, key: &str) -> Result<()> {
        store.decr_floor_zero(key).await?;
        Ok(())
    }

    /// 当前在途数量
    pub async fn in_flight(&self, store: &dyn CounterStore, key: &str) -> Result<u64> {
        Ok(store.get(key).await?.unwrap_or(0).max(0) as u64)
    }
}
