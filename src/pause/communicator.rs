//! 跨进程广播通道
//!
//! 后台任务独占订阅连接。连接断开后按指数退避（带抖动）重连，
//! 每次订阅建立后发出 `Resubscribed`，让消费者重新拉取快照。
//! 投递语义：至多一次，尽力而为。

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::infra::metrics;
use crate::store::CounterStore;

pub const DEFAULT_BACKOFF_MIN: Duration = Duration::from_millis(100);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// 订阅端收到的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommunicatorEvent {
    Message(String),
    /// 订阅（重新）建立，期间可能丢过消息
    Resubscribed,
}

pub struct Communicator {
    store: Arc<dyn CounterStore>,
    topic: String,
    backoff_min: Duration,
    backoff_max: Duration,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Communicator {
    pub fn new(store: Arc<dyn CounterStore>, topic: impl Into<String>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            topic: topic.into(),
            backoff_min: DEFAULT_BACKOFF_MIN,
            backoff_max: DEFAULT_BACKOFF_MAX,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.backoff_min = min.max(Duration::from_millis(1));
        self.backoff_max = max.max(self.backoff_min);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 广播一条消息
    pub async fn publish(&self, payload: &str) -> Result<()> {
        self.store.publish(&self.topic, payload).await
    }

    /// 启动后台订阅任务，返回事件接收端。接收端被丢弃时任务自行退出。
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CommunicatorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Listener {
            store: self.store.clone(),
            topic: self.topic.clone(),
            backoff_min: self.backoff_min,
            backoff_max: self.backoff_max,
            events: tx,
            shutdown: self.shutdown.subscribe(),
        };
        let handle = tokio::spawn(listener.run());
        self.tasks.lock().push(handle);
        rx
    }

    /// 停止所有后台订阅任务
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        debug!(topic = %self.topic, "广播订阅已停止");
    }
}

struct Listener {
    store: Arc<dyn CounterStore>,
    topic: String,
    backoff_min: Duration,
    backoff_max: Duration,
    events: mpsc::UnboundedSender<CommunicatorEvent>,
    shutdown: watch::Receiver<bool>,
}

impl Listener {
    async fn run(mut self) {
        let mut delay = self.backoff_min;
        let mut connected_before = false;

        while !*self.shutdown.borrow() {
            match self.store.subscribe(&self.topic).await {
                Ok(mut subscription) => {
                    if connected_before {
                        metrics::record_resubscribe();
                        info!(topic = %self.topic, "🔄 广播订阅已恢复");
                    } else {
                        info!(topic = %self.topic, "📡 广播订阅已建立");
                    }
                    connected_before = true;
                    delay = self.backoff_min;

                    if self.events.send(CommunicatorEvent::Resubscribed).is_err() {
                        return;
                    }

                    loop {
                        tokio::select! {
                            _ = self.shutdown.changed() => return,
                            message = subscription.next() => match message {
                                Some(payload) => {
                                    if self.events.send(CommunicatorEvent::Message(payload)).is_err() {
                                        return;
                                    }
                                }
                                None => {
                                    warn!(topic = %self.topic, "广播订阅断开，准备重连");
                                    break;
                                }
                            },
                        }
                    }
                }
                Err(e) => {
                    warn!(topic = %self.topic, "广播订阅失败: {}, {}ms 后重试", e, delay.as_millis());
                }
            }

            tokio::select! {
                _ = self.shutdown.changed() => return,
                _ = tokio::time::sleep(jitter(delay)) => {}
            }
            delay = (delay * 2).min(self.backoff_max);
        }
    }
}

/// 在 [delay/2, delay] 区间内随机取值，避免大量进程同时重连
fn jitter(delay: Duration) -> Duration {
    let millis = delay.as_millis() as u64;
    let half = millis / 2;
    Duration::from_millis(half + fastrand::u64(0..=millis - half))
}
