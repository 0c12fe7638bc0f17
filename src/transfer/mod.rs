// 传输引擎模块
//
// 分片并行传输核心：区间规划、有界并发调度、退避重试、
// 断点续传与进度聚合

pub mod coordinator;
pub mod manager;
pub mod plan;
pub mod progress;
pub mod retry;
pub mod types;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use coordinator::TransferCoordinator;
pub use manager::{StartOptions, TransferManager};
pub use plan::{plan, SegmentRange, DEFAULT_SEGMENT_SIZE};
pub use progress::ProgressAggregator;
pub use retry::{RetryError, RetryPolicy};
pub use types::{Progress, TransferError};
pub use worker::{SegmentWorker, SourceInfo};
