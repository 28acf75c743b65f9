//! 分布式后台任务队列的准入控制层
//!
//! - 按任务类配置的并发 / 阈值 / 组合限流
//! - 跨进程的队列暂停
//! - 接入宿主队列的取出门与执行门

pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod gate;
pub mod infra;
pub mod job;
pub mod logging;
pub mod observer;
pub mod pause;
pub mod store;
pub mod strategy;

pub use config::ThrottleConfig;
pub use context::{ThrottleContext, ThrottleContextBuilder};
pub use error::{Result, ThrottleError};
pub use gate::{ExecutionGate, ExecutionOutcome, FetchGate, HostQueue, MemoryQueue, UnitOfWork};
pub use job::JobIdentity;
pub use observer::{Decision, DecisionEvent, LimiterKind, Observer};
pub use pause::{Communicator, CommunicatorEvent, QueuePauser};
pub use store::{CounterStore, MemoryStore};
pub use strategy::{StrategyCatalog, StrategyConfig, StrategyRegistry, ThrottleStatus};
