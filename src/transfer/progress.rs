use std::sync::Arc;

use crate::persistence::StateStore;
use crate::transfer::types::{Progress, TransferError};

/// 进度聚合器
///
/// 基于持久化状态派生 `{loaded, total, percent}`，纯读取、不修改任何状态，
/// 可以与活跃的调度循环并发调用（读到的是最近一次已提交的快照，
/// 最多落后一次在途写入）。
pub struct ProgressAggregator<S: StateStore> {
    store: Arc<S>,
}

impl<S: StateStore> ProgressAggregator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// 查询任务进度
    ///
    /// `loaded` 为已成功分片的字节宽度之和；任务不存在时返回 `NotFound`
    pub async fn progress(&self, transfer_id: &str) -> Result<Progress, TransferError> {
        let meta = self
            .store
            .load_meta(transfer_id)
            .await?
            .ok_or_else(|| TransferError::NotFound(transfer_id.to_string()))?;

        let segments = self.store.load_segments(transfer_id).await?;
        let loaded: u64 = segments
            .iter()
            .filter(|s| s.is_success())
            .map(|s| s.width())
            .sum();

        Ok(Progress::new(loaded, meta.total_size))
    }
}
