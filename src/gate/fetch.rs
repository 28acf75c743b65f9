//! 取出门
//!
//! 单次取出的状态流转：`FETCHED -> {PAUSED-REQUEUE, THROTTLED-REQUEUE, DISPATCHED}`。
//! 暂停或被限流的任务放回原队列队首，并把该队列从本轮候选中剔除，
//! 因此一个队列堵住不会拖住其他队列。

use std::sync::Arc;

use tracing::debug;

use super::{requeue, Cooldown, HostQueue, RequeueReason, UnitOfWork};
use crate::error::Result;
use crate::pause::QueuePauser;
use crate::strategy::StrategyRegistry;

pub struct FetchGate {
    host: Arc<dyn HostQueue>,
    registry: Arc<StrategyRegistry>,
    pauser: Arc<QueuePauser>,
    cooldown: Cooldown,
}

impl FetchGate {
    pub fn new(
        host: Arc<dyn HostQueue>,
        registry: Arc<StrategyRegistry>,
        pauser: Arc<QueuePauser>,
    ) -> Self {
        Self {
            host,
            registry,
            pauser,
            cooldown: Cooldown::disabled(),
        }
    }

    pub fn with_cooldown(mut self, cooldown: Cooldown) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// 从给定队列（按优先顺序）取出第一个可以派发的任务
    ///
    /// 放回失败时返回 `ThrottleError::RequeueFailed`，工作单元随错误交还宿主。
    pub async fn fetch(&self, queues: &[String]) -> Result<Option<UnitOfWork>> {
        let paused = self.pauser.snapshot();
        let mut candidates: Vec<String> = queues
            .iter()
            .filter(|q| !paused.contains(q.as_str()) && !self.cooldown.is_cooling(q))
            .cloned()
            .collect();

        // 每轮至少剔除一个队列，取出次数不会超过候选队列数
        let mut attempts = candidates.len();
        while attempts > 0 && !candidates.is_empty() {
            attempts -= 1;

            let Some(work) = self.host.fetch_next(&candidates).await? else {
                return Ok(None);
            };
            let queue = work.queue.clone();

            if self.pauser.is_paused(&queue) {
                requeue(self.host.as_ref(), work, RequeueReason::Paused).await?;
                candidates.retain(|q| q != &queue);
                continue;
            }

            let job = match work.identity() {
                Ok(job) => job,
                Err(e) => {
                    debug!(queue = %queue, "任务负载无法解析，直接派发: {}", e);
                    return Ok(Some(work));
                }
            };

            if self.registry.throttled(&job).await {
                requeue(self.host.as_ref(), work, RequeueReason::Throttled).await?;
                self.cooldown.record_throttled(&queue);
                candidates.retain(|q| q != &queue);
                continue;
            }

            self.cooldown.record_dispatched(&queue);
            return Ok(Some(work));
        }
        Ok(None)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ThrottleError;
    use crate::gate::MemoryQueue;
    use crate::pause::Communicator;
    use crate::store::MemoryStore;
    use crate::strategy::{StrategyCatalog, StrategyConfig};
    use std::time::Duration;

    struct Fixture {
        host: Arc<MemoryQueue>,
        pauser: Arc<QueuePauser>,
        gate: FetchGate,
    }

    fn fixture(catalog: StrategyCatalog) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let host = Arc::new(MemoryQueue::new());
        let registry = Arc::new(StrategyRegistry::new(catalog, store.clone(), "test"));
        let communicator = Arc::new(Communicator::new(store.clone(), "test:pause"));
        let pauser = Arc::new(QueuePauser::new(
            store,
            communicator,
            "test",
            Duration::from_secs(30),
        ));
        let gate = FetchGate::new(host.clone(), registry, pauser.clone());
        Fixture { host, pauser, gate }
    }

    fn payload(class: &str, jid: &str) -> String {
        serde_json::json!({ "class": class, "jid": jid, "args": [] }).to_string()
    }

    fn queues(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_paused_queue_is_skipped() {
        let f = fixture(StrategyCatalog::new());
        f.host.push("low-priority", payload("CleanupJob", "1"));
        f.host.push("default", payload("MailJob", "2"));
        f.pauser.pause("low-priority").await.unwrap();

        let work = f
            .gate
            .fetch(&queues(&["low-priority", "default"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(work.queue, "default");
        assert_eq!(f.host.len("low-priority"), 1);
        assert!(f.host.requeued().is_empty());
    }

    #[tokio::test]
    async fn test_throttled_job_goes_back_to_front() {
        let catalog = StrategyCatalog::new()
            .with("ReportJob", StrategyConfig::new().concurrency(1))
            .unwrap();
        let f = fixture(catalog);
        f.host.push("reports", payload("ReportJob", "1"));
        f.host.push("reports", payload("ReportJob", "2"));
        f.host.push("default", payload("MailJob", "3"));

        let names = queues(&["reports", "default"]);
        let first = f.gate.fetch(&names).await.unwrap().unwrap();
        assert_eq!(first.identity().unwrap().id, "1");

        // 第二个 ReportJob 被限流，放回后本轮转向 default
        let second = f.gate.fetch(&names).await.unwrap().unwrap();
        assert_eq!(second.identity().unwrap().id, "3");
        assert_eq!(f.host.requeued().len(), 1);
        assert_eq!(f.host.peek("reports").unwrap().identity().unwrap().id, "2");

        assert!(f.gate.fetch(&names).await.unwrap().is_none());
        assert_eq!(f.host.len("reports"), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dispatched() {
        let f = fixture(StrategyCatalog::new());
        f.host.push("default", "{not json");

        let work = f.gate.fetch(&queues(&["default"])).await.unwrap().unwrap();
        assert_eq!(work.payload, "{not json");
    }

    #[tokio::test]
    async fn test_requeue_failure_hands_work_back() {
        let catalog = StrategyCatalog::new()
            .with(
                "NotifyJob",
                StrategyConfig::new().threshold(1, Duration::from_secs(60)),
            )
            .unwrap();
        let f = fixture(catalog);
        f.host.push("default", payload("NotifyJob", "1"));
        f.host.push("default", payload("NotifyJob", "2"));
        let names = queues(&["default"]);

        assert!(f.gate.fetch(&names).await.unwrap().is_some());
        f.host.set_reject_requeue(true);
        let err = f.gate.fetch(&names).await.unwrap_err();
        assert!(matches!(err, ThrottleError::RequeueFailed { .. }));

        // 宿主里已经没有这个任务，只能从错误中取回
        assert_eq!(f.host.len("default"), 0);
        assert!(f.host.requeued().is_empty());
        let work = err.into_work().unwrap();
        assert_eq!(work.queue, "default");
        assert_eq!(work.identity().unwrap().id, "2");
    }
}
