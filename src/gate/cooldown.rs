//! 队列冷却
//!
//! 同一队列连续取出 `threshold` 个被限流的任务后，该队列在 `period` 内不再参与取出，
//! 避免反复取出、放回同一批任务。`threshold` 为 0 时关闭。

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
pub struct Cooldown {
    threshold: u32,
    period: Duration,
    streaks: DashMap<String, u32>,
    cooling: DashMap<String, Instant>,
}

impl Cooldown {
    pub fn new(threshold: u32, period: Duration) -> Self {
        Self {
            threshold,
            period,
            streaks: DashMap::new(),
            cooling: DashMap::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn is_enabled(&self) -> bool {
        self.threshold > 0 && !self.period.is_zero()
    }

    /// 队列是否处于冷却期；冷却期已过的记录会被清除
    pub fn is_cooling(&self, queue: &str) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let now = Instant::now();
        self.cooling
            .remove_if(queue, |_, until| now >= *until)
            .is_none()
            && self.cooling.contains_key(queue)
    }

    /// 记录一次限流放回
    pub fn record_throttled(&self, queue: &str) {
        if !self.is_enabled() {
            return;
        }
        let streak = {
            let mut entry = self.streaks.entry(queue.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        if streak >= self.threshold {
            self.streaks.remove(queue);
            self.cooling
                .insert(queue.to_string(), Instant::now() + self.period);
            debug!(queue, streak, "队列进入冷却: {}ms", self.period.as_millis());
        }
    }

    /// 记录一次正常派发，清零连续限流计数
    pub fn record_dispatched(&self, queue: &str) {
        if self.is_enabled() {
            self.streaks.remove(queue);
        }
    }
}
