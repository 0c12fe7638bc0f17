// Segment Transfer Rust Library
// 可断点续传的分片并行传输引擎核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 持久化模块
pub mod persistence;

// 传输引擎模块
pub mod transfer;

// 导出常用类型
pub use config::{AppConfig, LogConfig, TransferConfig};
pub use logging::{init_logging, LogGuard};
pub use persistence::{
    FileStore, MemoryStore, SegmentRecord, SegmentStatus, StateStore, TransferMeta, TransferStatus,
};
pub use transfer::{
    plan, Progress, ProgressAggregator, RetryError, RetryPolicy, SegmentRange, SegmentWorker,
    SourceInfo, StartOptions, TransferCoordinator, TransferError, TransferManager,
    DEFAULT_SEGMENT_SIZE,
};
