//! 执行门
//!
//! 执行前再检查一次限流（取出门已准入的任务不会重复计数），
//! 任务体结束后无论成功、失败还是 panic 都归还租约。

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, info};

use super::{requeue, HostQueue, RequeueReason, UnitOfWork};
use crate::error::Result;
use crate::strategy::StrategyRegistry;

/// 执行结果
#[derive(Debug)]
pub enum ExecutionOutcome<T, E> {
    /// 被限流，已放回队首，任务体未执行
    Requeued,
    /// 执行成功并已确认
    Completed(T),
    /// 任务体返回错误；工作单元交还宿主按自身的失败策略处理
    Failed { error: E, work: UnitOfWork },
}

pub struct ExecutionGate {
    host: Arc<dyn HostQueue>,
    registry: Arc<StrategyRegistry>,
}

impl ExecutionGate {
    pub fn new(host: Arc<dyn HostQueue>, registry: Arc<StrategyRegistry>) -> Self {
        Self { host, registry }
    }

    pub async fn run<F, Fut, T, E>(&self, work: UnitOfWork, body: F) -> Result<ExecutionOutcome<T, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let job = match work.identity() {
            Ok(job) => Some(job),
            Err(e) => {
                debug!(queue = %work.queue, "任务负载无法解析，跳过限流检查: {}", e);
                None
            }
        };

        if let Some(job) = &job {
            if self.registry.throttled(job).await {
                debug!(queue = %work.queue, jid = %job.id, "执行前被限流");
                requeue(self.host.as_ref(), work, RequeueReason::Throttled).await?;
                return Ok(ExecutionOutcome::Requeued);
            }
        }

        let result = AssertUnwindSafe(async move { body().await })
            .catch_unwind()
            .await;

        if let Some(job) = &job {
            self.registry.finalize(job).await;
        }

        match result {
            Ok(Ok(value)) => {
                self.host.ack(&work).await?;
                Ok(ExecutionOutcome::Completed(value))
            }
            Ok(Err(error)) => Ok(ExecutionOutcome::Failed { error, work }),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// 关闭时归还本进程仍持有的全部租约
    pub async fn shutdown(&self) {
        let released = self.registry.release_all().await;
        info!("🛑 执行门已关闭，归还 {} 个租约", released);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::MemoryQueue;
    use crate::store::{CounterStore, MemoryStore};
    use crate::strategy::{StrategyCatalog, StrategyConfig};
    use std::sync::atomic::{AtomicBool, Ordering};

    const SLOT: &str = "test:concurrency:ReportJob";

    fn setup() -> (Arc<MemoryStore>, Arc<MemoryQueue>, ExecutionGate) {
        let store = Arc::new(MemoryStore::new());
        let host = Arc::new(MemoryQueue::new());
        let catalog = StrategyCatalog::new()
            .with("ReportJob", StrategyConfig::new().concurrency(1))
            .unwrap();
        let registry = Arc::new(StrategyRegistry::new(catalog, store.clone(), "test"));
        let gate = ExecutionGate::new(host.clone(), registry);
        (store, host, gate)
    }

    fn work(jid: &str) -> UnitOfWork {
        UnitOfWork::new(
            "reports",
            serde_json::json!({ "class": "ReportJob", "jid": jid, "args": [] }).to_string(),
        )
    }

    #[tokio::test]
    async fn test_success_acks_and_releases() {
        let (store, host, gate) = setup();

        let outcome = gate
            .run(work("1"), || async { Ok::<_, String>(42) })
            .await
            .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Completed(42)));
        assert_eq!(host.acked().len(), 1);
        assert_eq!(store.get(SLOT).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_error_releases_without_ack() {
        let (store, host, gate) = setup();

        let outcome = gate
            .run(work("1"), || async { Err::<(), _>("boom".to_string()) })
            .await
            .unwrap();
        match outcome {
            ExecutionOutcome::Failed { error, work } => {
                assert_eq!(error, "boom");
                assert_eq!(work.queue, "reports");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(host.acked().is_empty());
        assert_eq!(store.get(SLOT).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_panic_releases_and_resumes() {
        let (store, _host, gate) = setup();

        let result = AssertUnwindSafe(gate.run(work("1"), || async {
            if true {
                panic!("job exploded");
            }
            Ok::<(), String>(())
        }))
        .catch_unwind()
        .await;

        assert!(result.is_err());
        assert_eq!(store.get(SLOT).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_throttled_job_is_requeued_without_running() {
        let (store, host, gate) = setup();
        store
            .incr_with_ttl(SLOT, std::time::Duration::from_secs(60))
            .await
            .unwrap();

        let ran = AtomicBool::new(false);
        let flag = &ran;
        let outcome = gate
            .run(work("2"), move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await
            .unwrap();

        assert!(matches!(outcome, ExecutionOutcome::Requeued));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(host.requeued().len(), 1);
        assert_eq!(store.get(SLOT).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_requeue_failure_returns_work_to_caller() {
        let (store, host, gate) = setup();
        store
            .incr_with_ttl(SLOT, std::time::Duration::from_secs(60))
            .await
            .unwrap();
        host.set_reject_requeue(true);

        let err = gate
            .run(work("2"), || async { Ok::<_, String>(()) })
            .await
            .unwrap_err();
        let work = err.into_work().unwrap();
        assert_eq!(work.identity().unwrap().id, "2");
        assert!(host.requeued().is_empty());
        assert!(host.acked().is_empty());
    }
}
