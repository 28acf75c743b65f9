//! 进程内存储实现
//!
//! 语义与 Redis 实现一致，用于单进程部署和测试。
//! 每个 key 的修改都在 DashMap 分片锁内完成，因此与 Redis 脚本一样是原子的。
//! `set_available(false)` 模拟存储不可达：所有操作返回错误，已有订阅被断开。
//! 过期的计数和窗口与 Redis TTL 一样会被清除（每 `SWEEP_EVERY` 次写入扫描一次）。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use super::{CounterStore, Subscription};
use crate::error::{Result, ThrottleError};

const CHANNEL_CAPACITY: usize = 1024;
const SWEEP_EVERY: u64 = 1024;

struct Counter {
    value: i64,
    expires_at: Instant,
}

impl Counter {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// 滚动窗口：最后一次尝试过去一个周期后整体过期
#[derive(Default)]
struct Window {
    attempts: VecDeque<Instant>,
    expires_at: Option<Instant>,
}

impl Window {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now >= at)
    }
}

/// 内存版共享存储
pub struct MemoryStore {
    counters: DashMap<String, Counter>,
    windows: DashMap<String, Window>,
    sets: DashMap<String, HashSet<String>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    available: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            windows: DashMap::new(),
            sets: DashMap::new(),
            channels: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            writes: AtomicU64::new(0),
        }
    }

    /// 清除已过期的计数和窗口，返回清除的键数
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.key_count();
        self.counters.retain(|_, counter| !counter.is_expired(now));
        self.windows.retain(|_, window| !window.is_expired(now));
        before.saturating_sub(self.key_count())
    }

    /// 当前保存的计数键和窗口键总数
    pub fn key_count(&self) -> usize {
        self.counters.len() + self.windows.len()
    }

    /// 写操作计数，定期触发过期清理；调用时不能持有任何条目锁
    fn after_write(&self) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.purge_expired();
        }
    }

    /// 切换可用状态；置为不可用时会断开所有订阅
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            self.channels.lock().clear();
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(ThrottleError::Store("memory store is unavailable".to_string()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn prune(attempts: &mut VecDeque<Instant>, now: Instant, period: Duration) {
    while let Some(oldest) = attempts.front() {
        if now.duration_since(*oldest) >= period {
            attempts.pop_front();
        } else {
            break;
        }
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64> {
        self.ensure_available()?;
        let now = Instant::now();
        let value = {
            let mut entry = self.counters.entry(key.to_string()).or_insert(Counter {
                value: 0,
                expires_at: now + ttl,
            });
            if entry.is_expired(now) {
                entry.value = 0;
            }
            entry.value += 1;
            entry.expires_at = now + ttl;
            entry.value
        };
        self.after_write();
        Ok(value)
    }

    async fn decr_floor_zero(&self, key: &str) -> Result<i64> {
        self.ensure_available()?;
        let now = Instant::now();
        let Some(mut entry) = self.counters.get_mut(key) else {
            return Ok(0);
        };
        if entry.is_expired(now) {
            entry.value = 0;
        }
        if entry.value > 0 {
            entry.value -= 1;
        }
        Ok(entry.value)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        self.ensure_available()?;
        let now = Instant::now();
        Ok(self
            .counters
            .get(key)
            .filter(|c| !c.is_expired(now))
            .map(|c| c.value))
    }

    async fn record_attempt(&self, key: &str, period: Duration, cap: u64) -> Result<u64> {
        self.ensure_available()?;
        let now = Instant::now();
        let count = {
            let mut window = self.windows.entry(key.to_string()).or_default();
            prune(&mut window.attempts, now, period);
            window.attempts.push_back(now);
            while window.attempts.len() as u64 > cap.max(1) {
                window.attempts.pop_front();
            }
            window.expires_at = Some(now + period);
            window.attempts.len() as u64
        };
        self.after_write();
        Ok(count)
    }

    async fn window_count(&self, key: &str, period: Duration) -> Result<u64> {
        self.ensure_available()?;
        let now = Instant::now();
        Ok(self
            .windows
            .get(key)
            .map(|window| {
                window
                    .attempts
                    .iter()
                    .filter(|t| now.duration_since(**t) < period)
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        self.ensure_available()?;
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        self.ensure_available()?;
        if let Some(mut members) = self.sets.get_mut(key) {
            members.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.ensure_available()?;
        Ok(self
            .sets
            .get(key)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        self.ensure_available()?;
        if let Some(sender) = self.channels.lock().get(topic) {
            // 没有订阅者时 send 返回 Err，与 Redis PUBLISH 返回 0 等价
            let _ = sender.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.ensure_available()?;
        let receiver = self
            .channels
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        Ok(BroadcastStream::new(receiver)
            .filter_map(|msg| async move { msg.ok() })
            .boxed())
    }
}
