// 传输引擎类型定义

use serde::{Deserialize, Serialize};

use crate::persistence::TransferStatus;

/// 传输进度快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// 已成功分片的字节总量
    pub loaded: u64,
    /// 资源总大小
    pub total: u64,
    /// 进度百分比，范围 [0, 100]
    pub percent: f64,
}

impl Progress {
    /// 根据已加载字节和总大小计算进度
    ///
    /// total 为 0（或未知）时百分比为 0
    pub fn new(loaded: u64, total: u64) -> Self {
        let percent = if total == 0 {
            0.0
        } else {
            ((loaded as f64 / total as f64) * 100.0).clamp(0.0, 100.0)
        };
        Self {
            loaded,
            total,
            percent,
        }
    }
}

/// 传输错误类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// 分片计划入参非法（总大小或分片大小为 0）
    InvalidPlanInput { total_size: u64, segment_size: u64 },
    /// 恢复时持久化分片与重新计算的计划不一致
    ///
    /// 意味着分片大小在任务中途被修改，无法自动恢复
    PlanCorrupted { transfer_id: String, detail: String },
    /// 存储不可用（瞬时或持续性故障）
    ///
    /// 对当前操作致命，但已提交的状态仍然有效，任务之后可恢复
    StorageUnavailable(String),
    /// 单次分片获取失败（网络或协议层面）
    SegmentFetchFailed { index: usize, reason: String },
    /// 重试耗尽，包装最后一次分片获取失败
    RetryExhausted {
        index: usize,
        source: Box<TransferError>,
    },
    /// 协作式取消
    Cancelled,
    /// 任务不存在
    NotFound(String),
    /// 任务状态不允许该操作（如恢复已完成的任务）
    InvalidState {
        transfer_id: String,
        status: TransferStatus,
    },
    /// 资源大小探测失败
    ProbeFailed(String),
    /// 源不支持 Range 请求，需要上层切换整体传输策略
    RangesUnsupported(String),
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::InvalidPlanInput {
                total_size,
                segment_size,
            } => write!(
                f,
                "分片计划入参非法: total_size={}, segment_size={}",
                total_size, segment_size
            ),
            TransferError::PlanCorrupted {
                transfer_id,
                detail,
            } => write!(f, "分片计划不一致，无法恢复任务 {}: {}", transfer_id, detail),
            TransferError::StorageUnavailable(msg) => write!(f, "存储不可用: {}", msg),
            TransferError::SegmentFetchFailed { index, reason } => {
                write!(f, "分片 #{} 获取失败: {}", index, reason)
            }
            TransferError::RetryExhausted { index, source } => {
                write!(f, "分片 #{} 重试耗尽: {}", index, source)
            }
            TransferError::Cancelled => write!(f, "任务已被取消"),
            TransferError::NotFound(id) => write!(f, "任务不存在: {}", id),
            TransferError::InvalidState {
                transfer_id,
                status,
            } => write!(f, "任务 {} 当前状态 {} 不允许该操作", transfer_id, status),
            TransferError::ProbeFailed(msg) => write!(f, "资源大小探测失败: {}", msg),
            TransferError::RangesUnsupported(url) => {
                write!(f, "源不支持 Range 请求: {}", url)
            }
        }
    }
}

impl std::error::Error for TransferError {}
