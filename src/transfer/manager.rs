use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::TransferConfig;
use crate::persistence::{StateStore, TransferStatus};
use crate::transfer::coordinator::TransferCoordinator;
use crate::transfer::progress::ProgressAggregator;
use crate::transfer::types::{Progress, TransferError};
use crate::transfer::worker::SegmentWorker;

/// 启动选项
///
/// 未指定的项回落到管理器的 `TransferConfig` 默认值
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// 逻辑输出文件名
    pub file_name: String,
    /// 分片大小（字节）
    pub segment_size: Option<u64>,
    /// 单任务并发上限
    pub parallel: Option<usize>,
    /// 最大重试次数
    pub max_retries: Option<u32>,
}

impl StartOptions {
    pub fn with_file_name(file_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            ..Default::default()
        }
    }
}

/// 传输管理器
///
/// 对外暴露 `start` / `resume` / `pause` / `progress` / `delete`，
/// 均以任务 ID 为键。每个活跃任务拥有独立的协调器实例与取消令牌，
/// 生命周期为「启动/恢复时创建，完成/失败/删除时销毁」，任务之间互不影响。
pub struct TransferManager<S: StateStore> {
    /// 状态存储
    store: Arc<S>,
    /// 分片获取工作器（所有任务共享同一个 HTTP 连接池）
    worker: Arc<SegmentWorker>,
    /// 默认传输配置
    config: TransferConfig,
    /// 任务取消令牌（transfer_id -> CancellationToken）
    cancellation_tokens: Arc<DashMap<String, CancellationToken>>,
    /// 调度循环句柄（transfer_id -> JoinHandle），暂停时用于等待在途排空
    run_handles: Arc<DashMap<String, JoinHandle<()>>>,
}

impl<S: StateStore> TransferManager<S> {
    /// 创建传输管理器
    pub fn new(store: Arc<S>, config: TransferConfig) -> Self {
        let worker = Arc::new(SegmentWorker::new(Duration::from_secs(
            config.request_timeout_secs,
        )));
        info!(
            "创建传输管理器: 分片大小={}, 单任务并发={}, 最大重试={}",
            config.segment_size, config.parallel, config.max_retries
        );
        Self {
            store,
            worker,
            config,
            cancellation_tokens: Arc::new(DashMap::new()),
            run_handles: Arc::new(DashMap::new()),
        }
    }

    /// 合并启动选项与默认配置
    fn effective_config(&self, options: &StartOptions) -> TransferConfig {
        let mut config = self.config.clone();
        if let Some(v) = options.segment_size {
            config.segment_size = v;
        }
        if let Some(v) = options.parallel {
            config.parallel = v;
        }
        if let Some(v) = options.max_retries {
            config.max_retries = v;
        }
        config
    }

    /// 启动新的传输任务，返回任务 ID
    ///
    /// 元数据与分片计划落盘后即返回，调度在后台进行；
    /// 之后可随时通过 `progress` 查询、通过 `pause` 暂停
    pub async fn start(
        &self,
        source_url: &str,
        options: StartOptions,
    ) -> Result<String, TransferError> {
        let config = self.effective_config(&options);
        let token = CancellationToken::new();
        let coordinator = TransferCoordinator::with_cancellation(
            self.store.clone(),
            self.worker.clone(),
            config,
            token.clone(),
        );

        let meta = coordinator.create(source_url, &options.file_name).await?;
        let id = meta.id.clone();
        self.spawn_run(id.clone(), coordinator, token);
        Ok(id)
    }

    /// 恢复已持久化的任务
    ///
    /// 无持久化元数据时返回 `NotFound`；已在调度中的任务幂等忽略
    pub async fn resume(&self, transfer_id: &str) -> Result<(), TransferError> {
        if self.cancellation_tokens.contains_key(transfer_id) {
            warn!("任务 {} 已在调度中，忽略重复恢复", transfer_id);
            return Ok(());
        }

        let meta = self
            .store
            .load_meta(transfer_id)
            .await?
            .ok_or_else(|| TransferError::NotFound(transfer_id.to_string()))?;
        if !meta.status.is_resumable() {
            return Err(TransferError::InvalidState {
                transfer_id: transfer_id.to_string(),
                status: meta.status,
            });
        }

        let token = CancellationToken::new();
        let coordinator = TransferCoordinator::with_cancellation(
            self.store.clone(),
            self.worker.clone(),
            self.config.clone(),
            token.clone(),
        );
        self.spawn_run(transfer_id.to_string(), coordinator, token);
        Ok(())
    }

    /// 在后台任务中驱动协调器，结束后清理注册表
    fn spawn_run(
        &self,
        transfer_id: String,
        coordinator: TransferCoordinator<S>,
        token: CancellationToken,
    ) {
        self.cancellation_tokens.insert(transfer_id.clone(), token);

        let tokens = self.cancellation_tokens.clone();
        let handles = self.run_handles.clone();
        let id = transfer_id.clone();
        let handle = tokio::spawn(async move {
            match coordinator.resume(&id).await {
                Ok(status) => info!("任务 {} 本轮调度结束: {}", id, status),
                Err(e) => error!("任务 {} 调度出错: {}", id, e),
            }
            tokens.remove(&id);
            handles.remove(&id);
        });
        self.run_handles.insert(transfer_id, handle);
    }

    /// 暂停任务
    ///
    /// 取消信号发出后等待在途尝试排空、Paused 状态落盘才返回；
    /// 已成功的分片全部保留
    pub async fn pause(&self, transfer_id: &str) -> Result<(), TransferError> {
        if let Some((_, token)) = self.cancellation_tokens.remove(transfer_id) {
            token.cancel();
            if let Some((_, handle)) = self.run_handles.remove(transfer_id) {
                let _ = handle.await;
            }
            info!("任务 {} 已暂停", transfer_id);
            return Ok(());
        }

        // 没有在途调度循环：处理进程崩溃残留的 active 状态
        let mut meta = self
            .store
            .load_meta(transfer_id)
            .await?
            .ok_or_else(|| TransferError::NotFound(transfer_id.to_string()))?;
        match meta.status {
            TransferStatus::Active => {
                meta.mark_paused();
                self.store.save_meta(&meta).await?;
                info!("任务 {} 无在途调度，状态直接落为 paused", transfer_id);
                Ok(())
            }
            TransferStatus::Paused => Ok(()),
            status => Err(TransferError::InvalidState {
                transfer_id: transfer_id.to_string(),
                status,
            }),
        }
    }

    /// 查询任务进度
    pub async fn progress(&self, transfer_id: &str) -> Result<Progress, TransferError> {
        ProgressAggregator::new(self.store.clone())
            .progress(transfer_id)
            .await
    }

    /// 删除任务及其全部持久化状态
    ///
    /// 任务仍在调度时先取消并等待排空
    pub async fn delete(&self, transfer_id: &str) -> Result<(), TransferError> {
        if let Some((_, token)) = self.cancellation_tokens.remove(transfer_id) {
            token.cancel();
            if let Some((_, handle)) = self.run_handles.remove(transfer_id) {
                let _ = handle.await;
            }
        }
        self.store.delete_transfer(transfer_id).await?;
        info!("任务 {} 已删除", transfer_id);
        Ok(())
    }

    /// 正在调度中的任务数量
    pub fn active_count(&self) -> usize {
        self.cancellation_tokens.len()
    }
}
