//! 内存存储实现
//!
//! 用于测试和嵌入场景的 `StateStore` 实现。每个任务一个条目，
//! 条目内部用 `parking_lot::Mutex` 保护，保证单任务调用的原子性；
//! 不同任务之间通过 `DashMap` 支持并发访问。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::store::StateStore;
use super::types::{SegmentRecord, SegmentStatus, TransferMeta};
use crate::transfer::plan::SegmentRange;
use crate::transfer::types::TransferError;

/// 单个任务的内存条目
#[derive(Default)]
struct TransferEntry {
    /// 任务元数据（save_meta 之前可能为空）
    meta: Option<TransferMeta>,
    /// 分片记录，BTreeMap 保证按索引顺序遍历
    segments: BTreeMap<usize, SegmentRecord>,
}

/// 内存版传输状态存储
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Arc<Mutex<TransferEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取（或创建）任务条目
    fn entry(&self, transfer_id: &str) -> Arc<Mutex<TransferEntry>> {
        self.entries
            .entry(transfer_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TransferEntry::default())))
            .clone()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_meta(&self, transfer_id: &str) -> Result<Option<TransferMeta>, TransferError> {
        match self.entries.get(transfer_id) {
            Some(entry) => Ok(entry.lock().meta.clone()),
            None => Ok(None),
        }
    }

    async fn save_meta(&self, meta: &TransferMeta) -> Result<(), TransferError> {
        let entry = self.entry(&meta.id);
        let mut guard = entry.lock();
        let mut stored = meta.clone();
        stored.updated_at = Utc::now();
        guard.meta = Some(stored);
        Ok(())
    }

    async fn load_segments(&self, transfer_id: &str) -> Result<Vec<SegmentRecord>, TransferError> {
        match self.entries.get(transfer_id) {
            Some(entry) => Ok(entry.lock().segments.values().cloned().collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn save_segment_plan(
        &self,
        transfer_id: &str,
        ranges: &[SegmentRange],
    ) -> Result<(), TransferError> {
        let entry = self.entry(transfer_id);
        let mut guard = entry.lock();
        for range in ranges {
            // 幂等：已有记录不重置为 pending
            guard.segments.entry(range.index).or_insert_with(|| {
                SegmentRecord::pending(transfer_id, range.index, range.start_byte, range.end_byte)
            });
        }
        Ok(())
    }

    async fn update_segment(
        &self,
        transfer_id: &str,
        index: usize,
        status: SegmentStatus,
        payload: Option<Vec<u8>>,
    ) -> Result<(), TransferError> {
        let entry = self.entry(transfer_id);
        let mut guard = entry.lock();
        let record = guard.segments.get_mut(&index).ok_or_else(|| {
            TransferError::StorageUnavailable(format!(
                "分片记录不存在: transfer_id={}, index={}",
                transfer_id, index
            ))
        })?;
        record.status = status;
        record.payload = if status == SegmentStatus::Success {
            payload
        } else {
            None
        };
        Ok(())
    }

    async fn delete_transfer(&self, transfer_id: &str) -> Result<(), TransferError> {
        self.entries.remove(transfer_id);
        Ok(())
    }
}
