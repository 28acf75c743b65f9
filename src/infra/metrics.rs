//! Prometheus 指标：限流决策、回队次数、降级放行、暂停事件等
//!
//! 通过 `init()` / `init_with_listener()` 安装全局 Recorder。
//! 未安装 Recorder 时，`metrics` 宏是空操作，库代码可以无条件调用。

use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::OnceLock;

use crate::observer::{Decision, DecisionEvent, Observer};

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// 指标名称
const COUNTER_DECISIONS: &str = "throttle_decisions_total";
const COUNTER_REQUEUES: &str = "throttle_requeues_total";
const COUNTER_FAIL_OPEN: &str = "throttle_fail_open_total";
const COUNTER_PAUSE_EVENTS: &str = "throttle_pause_events_total";
const COUNTER_RESUBSCRIBES: &str = "throttle_communicator_resubscribes_total";
const GAUGE_PAUSED_QUEUES: &str = "throttle_paused_queues";
const GAUGE_LEASES_HELD: &str = "throttle_leases_held";
const GAUGE_REDIS_POOL_ACTIVE: &str = "throttle_redis_pool_active";
const GAUGE_REDIS_POOL_IDLE: &str = "throttle_redis_pool_idle";

/// 初始化 Prometheus 指标（安装全局 Recorder，返回 Handle 用于渲染）。
/// 仅需在进程内调用一次；重复调用会返回 Err。
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;
    HANDLE
        .set(handle)
        .map_err(|_| "metrics already initialized")?;
    Ok(())
}

/// 安装 Recorder 并在 `addr` 上开启 `/metrics` 抓取端点
pub fn init_with_listener(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    Ok(())
}

/// 渲染当前指标为 Prometheus 文本格式
pub fn render_metrics() -> Option<String> {
    HANDLE.get().map(|h| h.render())
}

/// 记录一次限流决策
pub fn record_decision(class: &str, kind: &str, decision: &str) {
    metrics::counter!(
        COUNTER_DECISIONS,
        "class" => class.to_string(),
        "kind" => kind.to_string(),
        "decision" => decision.to_string()
    )
    .increment(1);
}

/// 记录一次回队（reason: paused / throttled）
pub fn record_requeue(queue: &str, reason: &str) {
    metrics::counter!(
        COUNTER_REQUEUES,
        "queue" => queue.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// 存储不可达导致的降级放行 +1
pub fn record_fail_open() {
    metrics::counter!(COUNTER_FAIL_OPEN).increment(1);
}

/// 记录暂停/恢复事件（action: pause / resume）
pub fn record_pause_event(action: &str) {
    metrics::counter!(COUNTER_PAUSE_EVENTS, "action" => action.to_string()).increment(1);
}

/// 订阅重建次数 +1
pub fn record_resubscribe() {
    metrics::counter!(COUNTER_RESUBSCRIBES).increment(1);
}

/// 更新本地暂停队列数（Gauge）
pub fn record_paused_queues(count: usize) {
    metrics::gauge!(GAUGE_PAUSED_QUEUES).set(count as f64);
}

/// 更新本进程持有的并发租约数（Gauge）
pub fn record_leases_held(count: usize) {
    metrics::gauge!(GAUGE_LEASES_HELD).set(count as f64);
}

/// 更新 Redis 连接池状态（Gauge）
pub fn record_redis_pool(active: u32, idle: u32) {
    metrics::gauge!(GAUGE_REDIS_POOL_ACTIVE).set(active as f64);
    metrics::gauge!(GAUGE_REDIS_POOL_IDLE).set(idle as f64);
}

/// 把每个决策写入 Prometheus 计数器的观察者
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsObserver;

impl Observer for MetricsObserver {
    fn on_decision(&self, event: &DecisionEvent) {
        record_decision(
            &event.job_class,
            event.limiter_kind.as_str(),
            event.decision.as_str(),
        );
        if event.decision == Decision::Degraded {
            record_fail_open();
        }
    }
}
