//! 决策观察钩子
//!
//! 每次限流决策（放行 / 限流 / 存储故障降级放行）都会通知观察者，
//! 供指标采集使用。观察者在决策路径上同步调用，实现必须足够轻量。

use serde::Serialize;

/// 决策结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allowed,
    Throttled,
    /// 存储不可达，按 fail-open 放行
    Degraded,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allowed => "allowed",
            Decision::Throttled => "throttled",
            Decision::Degraded => "degraded",
        }
    }
}

/// 做出决策的限流器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterKind {
    Concurrency,
    Threshold,
    Composite,
}

impl LimiterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimiterKind::Concurrency => "concurrency",
            LimiterKind::Threshold => "threshold",
            LimiterKind::Composite => "composite",
        }
    }
}

/// 决策事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecisionEvent {
    pub job_class: String,
    /// 限流键（类名 + 参数派生后缀）
    pub key: String,
    pub decision: Decision,
    /// 组合策略被某个子限流器拒绝时，这里是该子限流器的类型
    pub limiter_kind: LimiterKind,
}

/// 观察者接口
pub trait Observer: Send + Sync {
    fn on_decision(&self, event: &DecisionEvent);
}

impl<F> Observer for F
where
    F: Fn(&DecisionEvent) + Send + Sync,
{
    fn on_decision(&self, event: &DecisionEvent) {
        self(event)
    }
}
