//! 持久化存储抽象接口
//!
//! 协调器只依赖该 trait，不关心底层存储引擎的实现方式。
//! 接口约定：
//! - 每个调用对单个任务 ID 原子生效，调用方不会观察到写了一半的分片计划
//! - 同一 `(transfer_id, index)` 的写入必须串行化，不同任务之间允许并发
//! - 任何调用都可能以 `StorageUnavailable` 失败；已提交的状态仍然有效，
//!   任务之后依旧可以恢复

use async_trait::async_trait;

use super::types::{SegmentRecord, SegmentStatus, TransferMeta};
use crate::transfer::plan::SegmentRange;
use crate::transfer::types::TransferError;

/// 传输状态存储接口
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// 读取任务元数据，不存在时返回 `None`
    async fn load_meta(&self, transfer_id: &str) -> Result<Option<TransferMeta>, TransferError>;

    /// 写入任务元数据（upsert），同时覆盖 `updated_at`
    async fn save_meta(&self, meta: &TransferMeta) -> Result<(), TransferError>;

    /// 按索引顺序读取任务的全部分片记录
    ///
    /// 返回空列表表示分片计划尚未写入
    async fn load_segments(&self, transfer_id: &str) -> Result<Vec<SegmentRecord>, TransferError>;

    /// 写入分片计划，所有新记录初始状态为 Pending
    ///
    /// 幂等：已存在的记录（无论 pending/success/failed）不会被重置
    async fn save_segment_plan(
        &self,
        transfer_id: &str,
        ranges: &[SegmentRange],
    ) -> Result<(), TransferError>;

    /// 更新单个分片记录（单记录、单写者）
    ///
    /// `payload` 仅在 status = Success 时保留，其余状态下会被丢弃
    async fn update_segment(
        &self,
        transfer_id: &str,
        index: usize,
        status: SegmentStatus,
        payload: Option<Vec<u8>>,
    ) -> Result<(), TransferError>;

    /// 删除任务元数据及其全部分片记录
    async fn delete_transfer(&self, transfer_id: &str) -> Result<(), TransferError>;
}
