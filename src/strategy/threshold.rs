//! 阈值（速率）限流器：限制滚动窗口内被接受的尝试次数
//!
//! 每次调用都会记入窗口，包括被限流的调用；限制的是尝试次数，
//! 而不是并发占用，因此被拒绝的尝试不会"退还"额度。

use std::time::Duration;

use crate::error::Result;
use crate::store::CounterStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdLimiter {
    limit: u32,
    period: Duration,
}

impl ThresholdLimiter {
    pub fn new(limit: u32, period: Duration) -> Self {
        Self { limit, period }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// 记录一次尝试，窗口内（含本次）尝试数不超过上限时放行
    pub async fn allow(&self, store: &dyn CounterStore, key: &str) -> Result<bool> {
        let cap = u64::from(self.limit) + 1;
        let count = store.record_attempt(key, self.period, cap).await?;
        Ok(count <= u64::from(self.limit))
    }

    /// `allow` 的反面；同样会记录一次尝试并占用窗口额度。
    /// 只读查询请用 [`recent`](Self::recent)。
    pub async fn throttled(&self, store: &dyn CounterStore, key: &str) -> Result<bool> {
        Ok(!self.allow(store, key).await?)
    }

    /// 当前窗口内的尝试数（不记录新的尝试）
    pub async fn recent(&self, store: &dyn CounterStore, key: &str) -> Result<u64> {
        store.window_count(key, self.period).await
    }
}
