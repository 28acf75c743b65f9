//! 宿主队列接入点：取出门（fetch）与执行门（execution）
//!
//! 两个门都保证任务不会丢失：出口只有“派发”或“恰好一次放回队首”；
//! 放回失败时工作单元随 `ThrottleError::RequeueFailed` 交还宿主。

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{Result, ThrottleError};
use crate::infra::metrics;
use crate::job::JobIdentity;

pub mod cooldown;
pub mod execution;
pub mod fetch;
pub mod memory;

pub use cooldown::Cooldown;
pub use execution::{ExecutionGate, ExecutionOutcome};
pub use fetch::FetchGate;
pub use memory::MemoryQueue;

/// 宿主队列取出的一个工作单元
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOfWork {
    pub queue: String,
    /// 原始任务负载（JSON）
    pub payload: String,
}

impl UnitOfWork {
    pub fn new(queue: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            payload: payload.into(),
        }
    }

    /// 解析任务身份；负载无法解析时返回错误，由调用方决定如何处理
    pub fn identity(&self) -> Result<JobIdentity> {
        JobIdentity::parse(&self.payload, &self.queue)
    }
}

/// 宿主队列接口
#[async_trait]
pub trait HostQueue: Send + Sync {
    /// 按给定顺序从这些队列中取出一个工作单元
    async fn fetch_next(&self, queues: &[String]) -> Result<Option<UnitOfWork>>;

    /// 放回原队列队首；失败时工作单元仍归调用方所有
    async fn requeue_front(&self, work: &UnitOfWork) -> Result<()>;

    /// 确认任务完成
    async fn ack(&self, work: &UnitOfWork) -> Result<()>;
}

/// 放回队列的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueReason {
    Paused,
    Throttled,
}

impl RequeueReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequeueReason::Paused => "paused",
            RequeueReason::Throttled => "throttled",
        }
    }
}

/// 放回队首；失败时把工作单元包进错误返回，不会在本层丢失
pub(crate) async fn requeue(
    host: &dyn HostQueue,
    work: UnitOfWork,
    reason: RequeueReason,
) -> Result<()> {
    if let Err(e) = host.requeue_front(&work).await {
        warn!(queue = %work.queue, reason = reason.as_str(), "放回队首失败，交还宿主: {}", e);
        return Err(ThrottleError::RequeueFailed {
            work: Box::new(work),
            reason: e.to_string(),
        });
    }
    metrics::record_requeue(&work.queue, reason.as_str());
    debug!(queue = %work.queue, reason = reason.as_str(), "任务已放回队首");
    Ok(())
}
