//! 进程内宿主队列，用于单进程部署和测试

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{HostQueue, UnitOfWork};
use crate::error::{Result, ThrottleError};

#[derive(Default)]
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, VecDeque<UnitOfWork>>>,
    acked: Mutex<Vec<UnitOfWork>>,
    requeues: Mutex<Vec<UnitOfWork>>,
    reject_requeue: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加到队尾
    pub fn push(&self, queue: &str, payload: impl Into<String>) {
        self.queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push_back(UnitOfWork::new(queue, payload));
    }

    pub fn len(&self, queue: &str) -> usize {
        self.queues.lock().get(queue).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.lock().values().all(VecDeque::is_empty)
    }

    /// 队首元素（不取出）
    pub fn peek(&self, queue: &str) -> Option<UnitOfWork> {
        self.queues.lock().get(queue).and_then(|q| q.front().cloned())
    }

    pub fn acked(&self) -> Vec<UnitOfWork> {
        self.acked.lock().clone()
    }

    /// 所有被放回过的工作单元（按发生顺序）
    pub fn requeued(&self) -> Vec<UnitOfWork> {
        self.requeues.lock().clone()
    }

    /// 模拟放回失败
    pub fn set_reject_requeue(&self, reject: bool) {
        self.reject_requeue.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl HostQueue for MemoryQueue {
    async fn fetch_next(&self, queues: &[String]) -> Result<Option<UnitOfWork>> {
        let mut all = self.queues.lock();
        for name in queues {
            if let Some(work) = all.get_mut(name).and_then(VecDeque::pop_front) {
                return Ok(Some(work));
            }
        }
        Ok(None)
    }

    async fn requeue_front(&self, work: &UnitOfWork) -> Result<()> {
        if self.reject_requeue.load(Ordering::SeqCst) {
            return Err(ThrottleError::HostQueue(format!(
                "requeue rejected for queue {}",
                work.queue
            )));
        }
        self.requeues.lock().push(work.clone());
        self.queues
            .lock()
            .entry(work.queue.clone())
            .or_default()
            .push_front(work.clone());
        Ok(())
    }

    async fn ack(&self, work: &UnitOfWork) -> Result<()> {
        self.acked.lock().push(work.clone());
        Ok(())
    }
}
