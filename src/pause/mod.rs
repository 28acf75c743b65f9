//! 队列暂停：权威集合 + 广播 + 本地快照

pub mod communicator;
pub mod pauser;

pub use communicator::{Communicator, CommunicatorEvent};
pub use pauser::{PauseAction, PauseMessage, QueuePauser, DEFAULT_SYNC_INTERVAL};
