use thiserror::Error;

use crate::gate::UnitOfWork;

/// 限流层错误类型
///
/// 决策路径（throttled / is_paused）上的错误不会向调用方抛出，
/// 而是降级为放行（fail open）；只有管理操作和配置加载会返回这些错误。
#[derive(Debug, Clone, Error)]
pub enum ThrottleError {
    /// 共享存储不可达或命令失败
    #[error("Store error: {0}")]
    Store(String),
    /// 存储命令超时
    #[error("Timeout error: {0}")]
    Timeout(String),
    /// 配置错误
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// 无法解析的任务负载
    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),
    /// 宿主队列操作失败
    #[error("Host queue error: {0}")]
    HostQueue(String),
    /// 放回队首失败；工作单元随错误交还宿主，由宿主重试或按自身策略处理
    #[error("Requeue failed for queue {}: {reason}", .work.queue)]
    RequeueFailed {
        work: Box<UnitOfWork>,
        reason: String,
    },
    /// 内部错误
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ThrottleError {
    /// 是否属于存储不可达类错误（触发 fail-open）
    pub fn is_store_failure(&self) -> bool {
        matches!(self, ThrottleError::Store(_) | ThrottleError::Timeout(_))
    }

    /// 取回随错误返回的工作单元（仅 `RequeueFailed` 携带）
    pub fn into_work(self) -> Option<UnitOfWork> {
        match self {
            ThrottleError::RequeueFailed { work, .. } => Some(*work),
            _ => None,
        }
    }
}

impl From<redis::RedisError> for ThrottleError {
    fn from(err: redis::RedisError) -> Self {
        ThrottleError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for ThrottleError {
    fn from(err: serde_json::Error) -> Self {
        ThrottleError::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ThrottleError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        ThrottleError::Timeout(err.to_string())
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, ThrottleError>;
