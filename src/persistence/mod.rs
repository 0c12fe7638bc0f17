//! 任务持久化模块
//!
//! 该模块负责传输任务状态的持久化和恢复，包括：
//! - 存储抽象接口：协调器只依赖 `StateStore` trait，不感知底层引擎
//! - 元数据持久化：记录任务基本信息
//! - 分片结果持久化：记录每个分片的最终状态与字节内容
//! - 断点恢复：进程重启后按持久化状态恢复未完成任务
//!
//! ## 设计原则
//!
//! 1. **单任务原子性**: 每个调用对单个任务 ID 原子生效
//! 2. **单写者**: 同一 `(transfer_id, index)` 的写入串行化，由协调器统一发起
//! 3. **容错性**: 文件实现的 WAL 格式支持部分损坏恢复

pub mod file;
pub mod memory;
pub mod store;
pub mod types;

// 导出类型
pub use types::{SegmentRecord, SegmentStatus, TransferMeta, TransferStatus};

// 导出存储接口与实现
pub use file::FileStore;
pub use memory::MemoryStore;
pub use store::StateStore;
