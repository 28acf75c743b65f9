//! 队列暂停器
//!
//! 权威的暂停集合保存在共享存储（`{prefix}:paused`），每个进程持有一份本地快照，
//! 热路径上的 `is_paused` 只读快照。快照通过广播事件和定期全量同步收敛。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::communicator::{Communicator, CommunicatorEvent};
use crate::error::Result;
use crate::infra::metrics;
use crate::store::CounterStore;

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseAction {
    Pause,
    Resume,
}

impl PauseAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseAction::Pause => "pause",
            PauseAction::Resume => "resume",
        }
    }
}

/// 广播消息体
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseMessage {
    pub action: PauseAction,
    pub queue: String,
    /// 发送进程标识，用于忽略自己发出的消息
    pub origin: String,
    /// 毫秒时间戳
    pub at: i64,
}

pub struct QueuePauser {
    store: Arc<dyn CounterStore>,
    communicator: Arc<Communicator>,
    set_key: String,
    origin: String,
    sync_interval: Duration,
    paused: RwLock<Arc<HashSet<String>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl QueuePauser {
    pub fn new(
        store: Arc<dyn CounterStore>,
        communicator: Arc<Communicator>,
        prefix: &str,
        sync_interval: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let sync_interval = if sync_interval.is_zero() {
            warn!("同步间隔不能为 0，改用默认值 {:?}", DEFAULT_SYNC_INTERVAL);
            DEFAULT_SYNC_INTERVAL
        } else {
            sync_interval
        };
        Self {
            store,
            communicator,
            set_key: format!("{}:paused", prefix),
            origin: uuid::Uuid::new_v4().to_string(),
            sync_interval,
            paused: RwLock::new(Arc::new(HashSet::new())),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// 启动：先从存储加载快照再返回，然后在后台应用广播并定期同步
    ///
    /// 存储不可达时以空快照启动（不暂停任何队列），由后续同步补齐。
    pub async fn start(self: &Arc<Self>) {
        match self.sync().await {
            Ok(count) => info!("⏸️ 队列暂停器已启动，当前暂停 {} 个队列", count),
            Err(e) => warn!("⚠️ 加载暂停队列失败，以空集合启动: {}", e),
        }

        let events = self.communicator.subscribe();
        let pauser = self.clone();
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move { pauser.run(events, shutdown).await });

        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// 停止后台任务
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<CommunicatorEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval_at(Instant::now() + self.sync_interval, self.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(CommunicatorEvent::Message(payload)) => self.apply_message(&payload),
                    Some(CommunicatorEvent::Resubscribed) => {
                        if let Err(e) = self.sync().await {
                            warn!("重新订阅后同步暂停队列失败: {}", e);
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.sync().await {
                        warn!("定期同步暂停队列失败: {}", e);
                    }
                }
            }
        }
        debug!("队列暂停器后台任务已退出");
    }

    /// 队列是否暂停（只读本地快照）
    pub fn is_paused(&self, queue: &str) -> bool {
        self.paused.read().contains(queue)
    }

    /// 当前快照
    pub fn snapshot(&self) -> Arc<HashSet<String>> {
        self.paused.read().clone()
    }

    /// 暂停中的队列（已排序）
    pub fn paused_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.snapshot().iter().cloned().collect();
        queues.sort();
        queues
    }

    /// 暂停队列：写权威集合 -> 更新本地快照 -> 广播
    pub async fn pause(&self, queue: &str) -> Result<()> {
        self.store.set_add(&self.set_key, queue).await?;
        self.apply(PauseAction::Pause, queue);
        self.broadcast(PauseAction::Pause, queue).await;
        info!(queue, "⏸️ 队列已暂停");
        Ok(())
    }

    /// 恢复队列
    pub async fn resume(&self, queue: &str) -> Result<()> {
        self.store.set_remove(&self.set_key, queue).await?;
        self.apply(PauseAction::Resume, queue);
        self.broadcast(PauseAction::Resume, queue).await;
        info!(queue, "▶️ 队列已恢复");
        Ok(())
    }

    /// 用权威集合整体替换本地快照，返回暂停队列数
    pub async fn sync(&self) -> Result<usize> {
        let members = self.store.set_members(&self.set_key).await?;
        let snapshot: HashSet<String> = members.into_iter().collect();
        let count = snapshot.len();
        *self.paused.write() = Arc::new(snapshot);
        metrics::record_paused_queues(count);
        Ok(count)
    }

    async fn broadcast(&self, action: PauseAction, queue: &str) {
        metrics::record_pause_event(action.as_str());
        let message = PauseMessage {
            action,
            queue: queue.to_string(),
            origin: self.origin.clone(),
            at: Utc::now().timestamp_millis(),
        };
        let payload = match serde_json::to_string(&message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("序列化暂停消息失败: {}", e);
                return;
            }
        };
        // 广播失败时其他进程依靠定期同步收敛
        if let Err(e) = self.communicator.publish(&payload).await {
            warn!(queue, "广播暂停消息失败: {}", e);
        }
    }

    fn apply_message(&self, payload: &str) {
        match serde_json::from_str::<PauseMessage>(payload) {
            Ok(message) if message.origin == self.origin => {}
            Ok(message) => {
                debug!(queue = %message.queue, action = message.action.as_str(), "收到暂停广播");
                self.apply(message.action, &message.queue);
            }
            Err(e) => warn!("无法解析暂停广播: {}", e),
        }
    }

    fn apply(&self, action: PauseAction, queue: &str) {
        let mut guard = self.paused.write();
        let present = guard.contains(queue);
        let changed = match action {
            PauseAction::Pause => !present,
            PauseAction::Resume => present,
        };
        if !changed {
            return;
        }

        let mut next = HashSet::clone(&guard);
        match action {
            PauseAction::Pause => {
                next.insert(queue.to_string());
            }
            PauseAction::Resume => {
                next.remove(queue);
            }
        }
        metrics::record_paused_queues(next.len());
        *guard = Arc::new(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn pauser(store: Arc<MemoryStore>) -> Arc<QueuePauser> {
        let communicator = Arc::new(Communicator::new(store.clone(), "test:pause"));
        Arc::new(QueuePauser::new(
            store,
            communicator,
            "test",
            DEFAULT_SYNC_INTERVAL,
        ))
    }

    #[tokio::test]
    async fn test_pause_and_resume_update_local_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let pauser = pauser(store.clone());

        pauser.pause("low-priority").await.unwrap();
        assert!(pauser.is_paused("low-priority"));
        assert!(!pauser.is_paused("default"));
        assert_eq!(
            store.set_members("test:paused").await.unwrap(),
            vec!["low-priority".to_string()]
        );

        // 重复操作是幂等的
        pauser.pause("low-priority").await.unwrap();
        assert_eq!(pauser.paused_queues(), vec!["low-priority".to_string()]);

        pauser.resume("low-priority").await.unwrap();
        pauser.resume("low-priority").await.unwrap();
        assert!(!pauser.is_paused("low-priority"));
    }

    #[tokio::test]
    async fn test_start_seeds_snapshot_from_store() {
        let store = Arc::new(MemoryStore::new());
        store.set_add("test:paused", "mailers").await.unwrap();

        let pauser = pauser(store);
        pauser.start().await;
        assert!(pauser.is_paused("mailers"));
        pauser.stop().await;
    }

    #[tokio::test]
    async fn test_start_with_unreachable_store_is_empty() {
        let store = Arc::new(MemoryStore::new());
        store.set_add("test:paused", "mailers").await.unwrap();
        store.set_available(false);

        let pauser = pauser(store);
        pauser.start().await;
        assert!(!pauser.is_paused("mailers"));
        pauser.stop().await;
    }

    #[test]
    fn test_ignores_own_and_malformed_messages() {
        let store = Arc::new(MemoryStore::new());
        let pauser = pauser(store);

        let own = PauseMessage {
            action: PauseAction::Pause,
            queue: "a".to_string(),
            origin: pauser.origin.clone(),
            at: 0,
        };
        pauser.apply_message(&serde_json::to_string(&own).unwrap());
        assert!(!pauser.is_paused("a"));

        pauser.apply_message("garbage");
        let remote = PauseMessage {
            origin: "other".to_string(),
            ..own
        };
        pauser.apply_message(&serde_json::to_string(&remote).unwrap());
        assert!(pauser.is_paused("a"));
    }

    #[tokio::test]
    async fn test_zero_sync_interval_falls_back_to_default() {
        let store = Arc::new(MemoryStore::new());
        let communicator = Arc::new(Communicator::new(store.clone(), "test:pause"));
        let b = Arc::new(QueuePauser::new(
            store.clone(),
            communicator,
            "test",
            Duration::ZERO,
        ));
        assert_eq!(b.sync_interval, DEFAULT_SYNC_INTERVAL);

        // 后台任务仍在运行，能收到其他进程的广播
        b.start().await;
        let a = pauser(store);
        a.pause("mailers").await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !b.is_paused("mailers") && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(b.is_paused("mailers"));
        b.stop().await;
    }
}
