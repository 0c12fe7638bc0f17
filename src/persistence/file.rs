//! 文件存储实现
//!
//! 跨进程重启的 `StateStore` 实现，沿用「元数据 + WAL 日志」的文件布局：
//!
//! ```text
//! {base_dir}/
//! ├── {transfer_id}.meta          # 任务元数据（JSON 格式）
//! ├── {transfer_id}.plan          # 分片计划（JSON 格式，只写一次）
//! ├── {transfer_id}.wal           # 分片结果日志（行格式，追加写入）
//! └── {transfer_id}.parts/
//!     └── {index}.part            # 成功分片的字节内容
//! ```
//!
//! ## 设计原则
//!
//! 1. **WAL 重放**: 读取时以计划为基线，逐行重放 WAL，同一索引以最后一条为准
//! 2. **容错性**: WAL 行损坏时跳过该行；success 记录缺少 .part 文件时降级为 pending
//! 3. **串行化**: 每个任务 ID 一把 `tokio::sync::Mutex`，保证单任务调用原子生效

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::store::StateStore;
use super::types::{SegmentRecord, SegmentStatus, TransferMeta};
use crate::transfer::plan::SegmentRange;
use crate::transfer::types::TransferError;

/// WAL 记录
///
/// 每条记录占一行，格式为：`{index},{status},{timestamp_ms}`
#[derive(Debug, Clone)]
struct SegmentWalRecord {
    /// 分片索引（0-based）
    index: usize,
    /// 分片状态
    status: SegmentStatus,
    /// 记录时间戳（Unix 毫秒）
    timestamp_ms: i64,
}

impl SegmentWalRecord {
    fn new(index: usize, status: SegmentStatus) -> Self {
        Self {
            index,
            status,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    /// 序列化为 WAL 行格式
    fn to_wal_line(&self) -> String {
        format!("{},{},{}", self.index, self.status.as_str(), self.timestamp_ms)
    }

    /// 从 WAL 行格式解析（容错）
    ///
    /// 支持格式：
    /// - `{index},{status},{timestamp_ms}` - 完整格式
    /// - `{index},{status}` - 无时间戳
    fn from_wal_line(line: &str) -> Option<Self> {
        let mut parts = line.trim().split(',');
        let index = parts.next()?.parse::<usize>().ok()?;
        let status = SegmentStatus::parse(parts.next()?)?;
        let timestamp_ms = parts
            .next()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        Some(Self {
            index,
            status,
            timestamp_ms,
        })
    }
}

/// 文件版传输状态存储
pub struct FileStore {
    /// 存储根目录
    base_dir: PathBuf,
    /// 任务级互斥锁（transfer_id -> Mutex）
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl FileStore {
    /// 创建文件存储，目录不存在时自动创建
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, TransferError> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)
            .map_err(|e| storage_err("创建存储目录失败", &e))?;
        Ok(Self {
            base_dir,
            locks: DashMap::new(),
        })
    }

    fn lock_for(&self, transfer_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(transfer_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn meta_path(&self, transfer_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.meta", transfer_id))
    }

    fn plan_path(&self, transfer_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.plan", transfer_id))
    }

    fn wal_path(&self, transfer_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.wal", transfer_id))
    }

    fn parts_dir(&self, transfer_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.parts", transfer_id))
    }

    fn part_path(&self, transfer_id: &str, index: usize) -> PathBuf {
        self.parts_dir(transfer_id).join(format!("{}.part", index))
    }

    /// 原子写入：先写临时文件再重命名，避免读到写了一半的内容
    async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), TransferError> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| storage_err("写入临时文件失败", &e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| storage_err("重命名临时文件失败", &e))?;
        Ok(())
    }

    /// 追加一条 WAL 记录
    async fn append_wal(&self, transfer_id: &str, record: &SegmentWalRecord) -> Result<(), TransferError> {
        let path = self.wal_path(transfer_id);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| storage_err("打开 WAL 文件失败", &e))?;
        let mut line = record.to_wal_line();
        line.push('\n');
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| storage_err("追加 WAL 记录失败", &e))?;
        file.flush()
            .await
            .map_err(|e| storage_err("刷写 WAL 失败", &e))?;
        Ok(())
    }

    /// 读取 WAL 并按索引重放，同一索引以最后一条记录为准
    async fn replay_wal(&self, transfer_id: &str) -> Result<Vec<SegmentWalRecord>, TransferError> {
        let path = self.wal_path(transfer_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_err("读取 WAL 文件失败", &e)),
        };

        let mut records = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match SegmentWalRecord::from_wal_line(line) {
                Some(record) => records.push(record),
                None => {
                    // 部分损坏的行不致命，跳过继续重放
                    warn!("跳过损坏的 WAL 行 (transfer_id={}): {}", transfer_id, line);
                }
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn load_meta(&self, transfer_id: &str) -> Result<Option<TransferMeta>, TransferError> {
        let lock = self.lock_for(transfer_id);
        let _guard = lock.lock().await;

        let content = match tokio::fs::read_to_string(self.meta_path(transfer_id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage_err("读取元数据文件失败", &e)),
        };
        let meta = serde_json::from_str(&content)
            .map_err(|e| storage_err("解析元数据失败", &e))?;
        Ok(Some(meta))
    }

    async fn save_meta(&self, meta: &TransferMeta) -> Result<(), TransferError> {
        let lock = self.lock_for(&meta.id);
        let _guard = lock.lock().await;

        let mut stored = meta.clone();
        stored.updated_at = Utc::now();
        let json = serde_json::to_string_pretty(&stored)
            .map_err(|e| storage_err("序列化元数据失败", &e))?;
        Self::write_atomic(&self.meta_path(&meta.id), json.as_bytes()).await?;
        debug!("已保存元数据: transfer_id={}, status={}", meta.id, stored.status);
        Ok(())
    }

    async fn load_segments(&self, transfer_id: &str) -> Result<Vec<SegmentRecord>, TransferError> {
        let lock = self.lock_for(transfer_id);
        let _guard = lock.lock().await;

        // 1. 计划文件是基线，不存在表示计划尚未写入
        let content = match tokio::fs::read_to_string(self.plan_path(transfer_id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_err("读取分片计划失败", &e)),
        };
        let ranges: Vec<SegmentRange> = serde_json::from_str(&content)
            .map_err(|e| storage_err("解析分片计划失败", &e))?;

        let mut records: Vec<SegmentRecord> = ranges
            .iter()
            .map(|r| SegmentRecord::pending(transfer_id, r.index, r.start_byte, r.end_byte))
            .collect();

        // 2. 重放 WAL，同一索引以最后一条为准
        for wal in self.replay_wal(transfer_id).await? {
            if let Some(record) = records.get_mut(wal.index) {
                record.status = wal.status;
            } else {
                warn!(
                    "WAL 中出现计划外的分片索引 (transfer_id={}): {}",
                    transfer_id, wal.index
                );
            }
        }

        // 3. 为成功分片加载字节内容
        for record in &mut records {
            if record.status != SegmentStatus::Success {
                continue;
            }
            let path = self.part_path(transfer_id, record.index);
            match tokio::fs::read(&path).await {
                Ok(payload) => record.payload = Some(payload),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // WAL 与 part 文件之间崩溃留下的缺口，降级为 pending 重新获取
                    warn!(
                        "分片 #{} 标记为成功但缺少数据文件，降级为 pending (transfer_id={})",
                        record.index, transfer_id
                    );
                    record.status = SegmentStatus::Pending;
                }
                Err(e) => return Err(storage_err("读取分片数据失败", &e)),
            }
        }

        Ok(records)
    }

    async fn save_segment_plan(
        &self,
        transfer_id: &str,
        ranges: &[SegmentRange],
    ) -> Result<(), TransferError> {
        let lock = self.lock_for(transfer_id);
        let _guard = lock.lock().await;

        // 幂等：计划文件只写一次，已有结果由 WAL 保留
        let path = self.plan_path(transfer_id);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!("分片计划已存在，跳过写入: transfer_id={}", transfer_id);
            return Ok(());
        }

        let json = serde_json::to_string(ranges)
            .map_err(|e| storage_err("序列化分片计划失败", &e))?;
        Self::write_atomic(&path, json.as_bytes()).await?;
        debug!(
            "已写入分片计划: transfer_id={}, 分片数量={}",
            transfer_id,
            ranges.len()
        );
        Ok(())
    }

    async fn update_segment(
        &self,
        transfer_id: &str,
        index: usize,
        status: SegmentStatus,
        payload: Option<Vec<u8>>,
    ) -> Result<(), TransferError> {
        let lock = self.lock_for(transfer_id);
        let _guard = lock.lock().await;

        if status == SegmentStatus::Success {
            let payload = payload.ok_or_else(|| {
                TransferError::StorageUnavailable(format!(
                    "成功分片缺少数据: transfer_id={}, index={}",
                    transfer_id, index
                ))
            })?;
            let parts_dir = self.parts_dir(transfer_id);
            tokio::fs::create_dir_all(&parts_dir)
                .await
                .map_err(|e| storage_err("创建分片数据目录失败", &e))?;
            // 先落数据再写 WAL，崩溃时重放不会指向不存在的数据文件
            Self::write_atomic(&self.part_path(transfer_id, index), &payload).await?;
        } else {
            let _ = tokio::fs::remove_file(self.part_path(transfer_id, index)).await;
        }

        self.append_wal(transfer_id, &SegmentWalRecord::new(index, status))
            .await
    }

    async fn delete_transfer(&self, transfer_id: &str) -> Result<(), TransferError> {
        {
            let lock = self.lock_for(transfer_id);
            let _guard = lock.lock().await;

            let _ = tokio::fs::remove_file(self.meta_path(transfer_id)).await;
            let _ = tokio::fs::remove_file(self.plan_path(transfer_id)).await;
            let _ = tokio::fs::remove_file(self.wal_path(transfer_id)).await;
            let _ = tokio::fs::remove_dir_all(self.parts_dir(transfer_id)).await;
            debug!("已删除任务状态: transfer_id={}", transfer_id);
        }
        self.locks.remove(transfer_id);
        Ok(())
    }
}

fn storage_err(context: &str, e: &dyn std::fmt::Display) -> TransferError {
    TransferError::StorageUnavailable(format!("{}: {}", context, e))
}
