//! 持久化模块核心类型定义
//!
//! 定义传输任务持久化所需的所有数据结构

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 传输任务状态
///
/// 统一的任务状态枚举，持久化与进度查询共用
/// 使用 snake_case 序列化以便 JSON 可读
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// 传输中
    Active,
    /// 已暂停
    Paused,
    /// 已完成
    Completed,
    /// 失败
    Failed,
}

impl TransferStatus {
    /// 是否为终态（完成或失败）
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// 是否可以恢复调度
    ///
    /// 失败的任务允许重新激活，复用已持久化的成功分片
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Active | Self::Paused | Self::Failed)
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// 传输任务元数据
///
/// 保存任务的基本信息，用于恢复时重建任务
/// 以 JSON 格式存储在 .meta 文件中（FileStore）
///
/// 不变式：`total_size` 与 `segment_size` 一经写入不再变更，
/// 变更分片大小会使已持久化的分片计划失效
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferMeta {
    /// 任务 ID（跨进程重启保持稳定）
    pub id: String,

    /// 源地址
    pub source_url: String,

    /// 逻辑输出文件名
    pub file_name: String,

    /// 资源总大小（字节），由探测一次性确定
    pub total_size: u64,

    /// 分片大小（字节）
    pub segment_size: u64,

    /// 任务状态
    pub status: TransferStatus,

    /// 创建时间
    pub created_at: DateTime<Utc>,

    /// 最后更新时间
    pub updated_at: DateTime<Utc>,
}

impl TransferMeta {
    /// 创建新的传输任务元数据，初始状态为传输中
    pub fn new(source_url: &str, file_name: &str, total_size: u64, segment_size: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            source_url: source_url.to_string(),
            file_name: file_name.to_string(),
            total_size,
            segment_size,
            status: TransferStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// 更新最后修改时间
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// 标记为传输中
    pub fn mark_active(&mut self) {
        self.status = TransferStatus::Active;
        self.touch();
    }

    /// 标记为已暂停
    pub fn mark_paused(&mut self) {
        self.status = TransferStatus::Paused;
        self.touch();
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self) {
        self.status = TransferStatus::Completed;
        self.touch();
    }

    /// 标记为失败
    pub fn mark_failed(&mut self) {
        self.status = TransferStatus::Failed;
        self.touch();
    }
}

/// 分片状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    /// 等待中
    Pending,
    /// 已成功
    Success,
    /// 失败（重试耗尽）
    Failed,
}

impl SegmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentStatus::Pending => "pending",
            SegmentStatus::Success => "success",
            SegmentStatus::Failed => "failed",
        }
    }

    /// 从字符串解析（WAL 行格式使用）
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SegmentStatus::Pending),
            "success" => Some(SegmentStatus::Success),
            "failed" => Some(SegmentStatus::Failed),
            _ => None,
        }
    }
}

/// 分片记录
///
/// 每个计划内的字节区间对应一条记录，以 `(transfer_id, index)` 为复合主键
/// 区间为闭区间，除最后一个分片外宽度均等于 `segment_size`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRecord {
    /// 所属任务 ID
    pub transfer_id: String,

    /// 分片索引（0-based，按区间顺序）
    pub index: usize,

    /// 起始字节（含）
    pub start_byte: u64,

    /// 结束字节（含）
    pub end_byte: u64,

    /// 分片状态
    pub status: SegmentStatus,

    /// 已获取的字节内容，仅在 status = Success 时存在
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
}

impl SegmentRecord {
    /// 创建等待中的分片记录
    pub fn pending(transfer_id: &str, index: usize, start_byte: u64, end_byte: u64) -> Self {
        Self {
            transfer_id: transfer_id.to_string(),
            index,
            start_byte,
            end_byte,
            status: SegmentStatus::Pending,
            payload: None,
        }
    }

    /// 分片字节宽度
    pub fn width(&self) -> u64 {
        self.end_byte - self.start_byte + 1
    }

    /// 是否已成功
    pub fn is_success(&self) -> bool {
        self.status == SegmentStatus::Success
    }
}
