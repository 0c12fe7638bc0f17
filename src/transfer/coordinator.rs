use std::sync::Arc;
use std::time::Duration;

use bit_set::BitSet;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::persistence::{SegmentRecord, SegmentStatus, StateStore, TransferMeta, TransferStatus};
use crate::transfer::plan::{plan, SegmentRange};
use crate::transfer::retry::{RetryError, RetryPolicy};
use crate::transfer::types::TransferError;
use crate::transfer::worker::SegmentWorker;

/// 分片结果消息：工作器通过 channel 汇报，自己不写存储
///
/// 错误侧只会是 `RetryExhausted`（包装最后一次获取失败）或 `Cancelled`
type SegmentOutcome = (usize, Result<Vec<u8>, TransferError>);

/// 传输协调器
///
/// 负责单个传输任务的完整生命周期：
/// 1. 探测资源大小，生成并持久化分片计划
/// 2. 恢复时核对持久化分片与重新计算的计划
/// 3. 以有界并发调度分片获取，经 RetryPolicy 包装
/// 4. 汇总分片结果，判定任务终态
///
/// 状态机：active → {completed, failed, paused}；paused/failed → active（恢复）；
/// completed 为终态。
///
/// 协调器是该任务元数据状态与分片状态的唯一写者。
pub struct TransferCoordinator<S: StateStore> {
    /// 状态存储
    store: Arc<S>,
    /// 分片获取工作器
    worker: Arc<SegmentWorker>,
    /// 传输配置
    config: TransferConfig,
    /// 取消令牌（作用域为单个任务，每轮调度应使用新令牌）
    cancel: CancellationToken,
}

impl<S: StateStore> TransferCoordinator<S> {
    pub fn new(store: Arc<S>, worker: Arc<SegmentWorker>, config: TransferConfig) -> Self {
        Self::with_cancellation(store, worker, config, CancellationToken::new())
    }

    /// 使用外部提供的取消令牌创建协调器（由管理器按任务分配）
    pub fn with_cancellation(
        store: Arc<S>,
        worker: Arc<SegmentWorker>,
        config: TransferConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            worker,
            config,
            cancel,
        }
    }

    /// 获取该任务的取消令牌
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 创建新的传输任务：探测资源大小，持久化元数据与分片计划
    ///
    /// 不开始调度；计划落盘后任务即可被 `resume` 恢复
    pub async fn create(
        &self,
        source_url: &str,
        file_name: &str,
    ) -> Result<TransferMeta, TransferError> {
        let probed = self.worker.probe(source_url).await?;
        if !probed.accepts_ranges {
            // 分片引擎到此为止，整体单请求策略由上层选择
            return Err(TransferError::RangesUnsupported(source_url.to_string()));
        }

        let ranges = plan(probed.total_size, self.config.segment_size)?;
        let meta = TransferMeta::new(
            source_url,
            file_name,
            probed.total_size,
            self.config.segment_size,
        );
        self.store.save_meta(&meta).await?;
        self.store.save_segment_plan(&meta.id, &ranges).await?;

        info!(
            "创建传输任务: id={}, total_size={}, 分片数量={}",
            meta.id,
            probed.total_size,
            ranges.len()
        );
        Ok(meta)
    }

    /// 恢复（或首次启动）任务调度，返回本轮结束时的任务状态
    ///
    /// 要求持久化状态为 active/paused/failed；根据存储的
    /// `total_size`/`segment_size` 重新推导计划并核对分片边界，
    /// 只调度 status ≠ success 的分片。
    pub async fn resume(&self, transfer_id: &str) -> Result<TransferStatus, TransferError> {
        let mut meta = self
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

        let ranges = plan(meta.total_size, meta.segment_size)?;
        let stored = self.store.load_segments(transfer_id).await?;

        let pending: Vec<SegmentRange> = if stored.is_empty() {
            // 创建后写计划前崩溃：计划尚未落盘，此处补写
            self.store.save_segment_plan(transfer_id, &ranges).await?;
            ranges.clone()
        } else {
            verify_plan(transfer_id, &stored, &ranges)?;

            let mut completed = BitSet::with_capacity(ranges.len());
            for record in &stored {
                if record.is_success() {
                    completed.insert(record.index);
                }
            }
            ranges
                .iter()
                .filter(|r| !completed.contains(r.index))
                .cloned()
                .collect()
        };

        meta.mark_active();
        self.store.save_meta(&meta).await?;
        info!(
            "任务 {} 开始调度: 待获取分片 {}/{}",
            transfer_id,
            pending.len(),
            ranges.len()
        );

        let cancelled = self.dispatch(&meta, pending).await?;

        if cancelled {
            // 暂停不是失败：已成功的分片全部保留
            meta.mark_paused();
            self.store.save_meta(&meta).await?;
            info!("任务 {} 已暂停（在途尝试已排空）", transfer_id);
            return Ok(TransferStatus::Paused);
        }

        // 重新读取完整分片状态再判定终态，避免两个分片同时完成时
        // 各自以为自己是最后一个的竞态
        let segments = self.store.load_segments(transfer_id).await?;
        let all_success =
            segments.len() == ranges.len() && segments.iter().all(SegmentRecord::is_success);

        if all_success {
            meta.mark_completed();
            self.store.save_meta(&meta).await?;
            info!("✓ 任务 {} 全部分片完成", transfer_id);
            Ok(TransferStatus::Completed)
        } else {
            let remaining = segments.iter().filter(|s| !s.is_success()).count();
            meta.mark_failed();
            self.store.save_meta(&meta).await?;
            warn!(
                "✗ 任务 {} 本轮结束后仍有 {} 个分片未成功，标记为失败",
                transfer_id, remaining
            );
            Ok(TransferStatus::Failed)
        }
    }

    /// 创建并立即调度，运行到本轮结束
    pub async fn start(
        &self,
        source_url: &str,
        file_name: &str,
    ) -> Result<(String, TransferStatus), TransferError> {
        let meta = self.create(source_url, file_name).await?;
        let id = meta.id.clone();
        let status = self.resume(&id).await?;
        Ok((id, status))
    }

    /// 有界并发调度循环
    ///
    /// - 按索引顺序接纳待获取分片，同时在途数量以 Semaphore 限制在
    ///   `parallel` 以内（背压控制，不只是性能旋钮）
    /// - 每个分片的获取经 RetryPolicy 包装，结果通过 channel 汇报回来，
    ///   由协调器统一写存储（单写者）
    /// - 单个分片重试耗尽不阻塞其它分片
    /// - 收到取消信号后不再接纳新分片，在途尝试自然排空
    ///
    /// 返回本轮是否因取消而停止
    async fn dispatch(
        &self,
        meta: &TransferMeta,
        pending: Vec<SegmentRange>,
    ) -> Result<bool, TransferError> {
        if pending.is_empty() {
            return Ok(self.cancel.is_cancelled());
        }

        let parallel = self.config.parallel.max(1);
        let semaphore = Arc::new(Semaphore::new(parallel));
        let (tx, mut rx) = mpsc::unbounded_channel::<SegmentOutcome>();
        let policy = RetryPolicy::new(
            self.config.max_retries,
            Duration::from_millis(self.config.base_delay_ms),
        );

        let total = pending.len();
        let mut queue = pending.into_iter();
        let mut next = queue.next();
        let mut in_flight = 0usize;
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut stop_admitting = false;

        debug!(
            "任务 {} 调度开始: 分片 {} 个, 并发上限 {}",
            meta.id, total, parallel
        );

        loop {
            if self.cancel.is_cancelled() && !stop_admitting {
                info!("任务 {} 收到取消信号，停止接纳新分片", meta.id);
                stop_admitting = true;
            }
            if in_flight == 0 && (next.is_none() || stop_admitting) {
                break;
            }

            tokio::select! {
                biased;

                Some((index, outcome)) = rx.recv(), if in_flight > 0 => {
                    in_flight -= 1;
                    match outcome {
                        Ok(payload) => {
                            if let Err(e) = self
                                .store
                                .update_segment(&meta.id, index, SegmentStatus::Success, Some(payload))
                                .await
                            {
                                // 存储故障对本次操作致命；已提交的状态仍然有效
                                self.cancel.cancel();
                                return Err(e);
                            }
                            succeeded += 1;
                            debug!("✓ 分片 #{} 成功 ({}/{})", index, succeeded + failed, total);
                        }
                        Err(TransferError::Cancelled) => {
                            debug!("分片 #{} 已取消，保持原状态", index);
                        }
                        Err(err) => {
                            warn!("✗ {}", err);
                            if let Err(e) = self
                                .store
                                .update_segment(&meta.id, index, SegmentStatus::Failed, None)
                                .await
                            {
                                self.cancel.cancel();
                                return Err(e);
                            }
                            // 不中断兄弟分片，终态在整轮结束后判定
                            failed += 1;
                        }
                    }
                }

                permit = Arc::clone(&semaphore).acquire_owned(), if next.is_some() && !stop_admitting => {
                    let permit = match permit {
                        Ok(p) => p,
                        Err(_) => {
                            stop_admitting = true;
                            continue;
                        }
                    };
                    let segment = match next.take() {
                        Some(s) => s,
                        None => continue,
                    };
                    next = queue.next();
                    in_flight += 1;

                    let worker = Arc::clone(&self.worker);
                    let url = meta.source_url.clone();
                    let token = self.cancel.clone();
                    let policy = policy.clone();
                    let tx = tx.clone();

                    tokio::spawn(async move {
                        let index = segment.index;
                        let result = policy
                            .execute(&token, || {
                                let worker = Arc::clone(&worker);
                                let url = url.clone();
                                let segment = segment.clone();
                                async move {
                                    worker
                                        .fetch_range(&url, segment.index, segment.start_byte, segment.end_byte)
                                        .await
                                }
                            })
                            .await
                            .map_err(|e| match e {
                                // 单次获取失败只在 RetryPolicy 内部消化，
                                // 向上只暴露重试耗尽（携带最后一次失败）
                                RetryError::Exhausted(source) => TransferError::RetryExhausted {
                                    index,
                                    source: Box::new(source),
                                },
                                RetryError::Cancelled => TransferError::Cancelled,
                            });
                        drop(permit);
                        let _ = tx.send((index, result));
                    });
                }

                _ = self.cancel.cancelled(), if !stop_admitting => {
                    info!("任务 {} 收到取消信号，停止接纳新分片", meta.id);
                    stop_admitting = true;
                }
            }
        }

        debug!(
            "任务 {} 调度结束: 成功 {}, 失败 {}, 是否取消 {}",
            meta.id,
            succeeded,
            failed,
            self.cancel.is_cancelled()
        );
        Ok(self.cancel.is_cancelled())
    }
}

/// 核对持久化分片与重新计算的计划
///
/// 不一致意味着 `segment_size` 在任务中途被修改，不支持自动恢复
fn verify_plan(
    transfer_id: &str,
    stored: &[SegmentRecord],
    fresh: &[SegmentRange],
) -> Result<(), TransferError> {
    if stored.len() != fresh.len() {
        return Err(TransferError::PlanCorrupted {
            transfer_id: transfer_id.to_string(),
            detail: format!(
                "分片数量不一致: 持久化 {} vs 计算 {}",
                stored.len(),
                fresh.len()
            ),
        });
    }
    for (record, range) in stored.iter().zip(fresh) {
        if record.index != range.index
            || record.start_byte != range.start_byte
            || record.end_byte != range.end_byte
        {
            return Err(TransferError::PlanCorrupted {
                transfer_id: transfer_id.to_string(),
                detail: format!(
                    "分片 #{} 边界不一致: 持久化 [{}, {}] vs 计算 [{}, {}]",
                    record.index,
                    record.start_byte,
                    record.end_byte,
                    range.start_byte,
                    range.end_byte
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use crate::transfer::progress::ProgressAggregator;
    use crate::transfer::testutil::{RangeServer, ServerBehavior};

    fn test_body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn test_config(segment_size: u64, parallel: usize) -> TransferConfig {
        TransferConfig {
            segment_size,
            parallel,
            max_retries: 1,
            base_delay_ms: 10,
            request_timeout_secs: 5,
        }
    }

    fn coordinator(
        store: Arc<MemoryStore>,
        config: TransferConfig,
    ) -> TransferCoordinator<MemoryStore> {
        let worker = Arc::new(SegmentWorker::new(Duration::from_secs(5)));
        TransferCoordinator::new(store, worker, config)
    }

    #[tokio::test]
    async fn test_start_completes_transfer() {
        let body = test_body(2500);
        let server = RangeServer::spawn(body.clone(), ServerBehavior::Normal).await;
        let store = Arc::new(MemoryStore::new());

        let coord = coordinator(store.clone(), test_config(1000, 4));
        let (id, status) = coord.start(&server.url(), "file.bin").await.unwrap();
        assert_eq!(status, TransferStatus::Completed);

        let meta = store.load_meta(&id).await.unwrap().unwrap();
        assert_eq!(meta.status, TransferStatus::Completed);
        assert_eq!(meta.total_size, 2500);

        // 全部分片成功，且内容与源字节一致
        let segments = store.load_segments(&id).await.unwrap();
        assert_eq!(segments.len(), 3);
        for segment in &segments {
            assert_eq!(segment.status, SegmentStatus::Success);
            let expected = &body[segment.start_byte as usize..=segment.end_byte as usize];
            assert_eq!(segment.payload.as_deref().unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_dispatch_admits_in_index_order() {
        let body = test_body(5000);
        let server = RangeServer::spawn(body, ServerBehavior::Normal).await;
        let store = Arc::new(MemoryStore::new());

        // parallel=1 时接纳顺序即请求顺序
        let coord = coordinator(store, test_config(1000, 1));
        coord.start(&server.url(), "file.bin").await.unwrap();

        // 第一条是探测请求 bytes=0-0
        let ranges = server.served_ranges();
        assert_eq!(ranges[0], (0, 0));
        assert_eq!(
            &ranges[1..],
            &[
                (0, 999),
                (1000, 1999),
                (2000, 2999),
                (3000, 3999),
                (4000, 4999)
            ]
        );
    }

    #[tokio::test]
    async fn test_exhausted_segment_marks_failed_and_keeps_siblings() {
        let body = test_body(3000);
        // 分片 #1（起始字节 1000）始终 503，其余正常
        let server =
            RangeServer::spawn(body.clone(), ServerBehavior::FailRangesStartingAt(vec![1000]))
                .await;
        let store = Arc::new(MemoryStore::new());

        let coord = coordinator(store.clone(), test_config(1000, 2));
        let (id, status) = coord.start(&server.url(), "file.bin").await.unwrap();
        assert_eq!(status, TransferStatus::Failed);

        let segments = store.load_segments(&id).await.unwrap();
        assert_eq!(segments[0].status, SegmentStatus::Success);
        assert_eq!(segments[1].status, SegmentStatus::Failed);
        assert!(segments[1].payload.is_none());
        assert_eq!(segments[2].status, SegmentStatus::Success);

        // 失败不破坏已有进度
        let progress = ProgressAggregator::new(store.clone())
            .progress(&id)
            .await
            .unwrap();
        assert_eq!(progress.loaded, 2000);
        assert_eq!(progress.total, 3000);
    }

    #[tokio::test]
    async fn test_resume_refetches_only_missing_segments() {
        // 规格示例：10MB / 1MB 分片，前 6 片已成功，恢复只调度 6-9
        // 此处用 10KB / 1KB 等比缩小，边界语义相同
        let body = test_body(10_000);
        let server = RangeServer::spawn(body.clone(), ServerBehavior::Normal).await;
        let store = Arc::new(MemoryStore::new());

        let coord = coordinator(store.clone(), test_config(1000, 4));
        let meta = coord.create(&server.url(), "file.bin").await.unwrap();
        let id = meta.id.clone();

        // 模拟上一轮运行：前 6 片已成功落盘
        for index in 0..6usize {
            let start = index * 1000;
            store
                .update_segment(
                    &id,
                    index,
                    SegmentStatus::Success,
                    Some(body[start..start + 1000].to_vec()),
                )
                .await
                .unwrap();
        }

        let progress = ProgressAggregator::new(store.clone())
            .progress(&id)
            .await
            .unwrap();
        assert_eq!(progress.loaded, 6000);
        assert_eq!(progress.percent, 60.0);

        let before: Vec<Vec<u8>> = store
            .load_segments(&id)
            .await
            .unwrap()
            .iter()
            .take(6)
            .map(|s| s.payload.clone().unwrap())
            .collect();

        let status = coord.resume(&id).await.unwrap();
        assert_eq!(status, TransferStatus::Completed);

        // 只重新获取了 6-9 四个分片（探测请求除外）
        let fetched: Vec<(u64, u64)> = server
            .served_ranges()
            .into_iter()
            .filter(|&(s, e)| !(s == 0 && e == 0))
            .collect();
        assert_eq!(
            fetched,
            vec![(6000, 6999), (7000, 7999), (8000, 8999), (9000, 9999)]
        );

        // 已成功的分片原样保留，字节一致
        let segments = store.load_segments(&id).await.unwrap();
        for (index, payload) in before.iter().enumerate() {
            assert_eq!(segments[index].payload.as_ref().unwrap(), payload);
        }

        let progress = ProgressAggregator::new(store.clone())
            .progress(&id)
            .await
            .unwrap();
        assert_eq!(progress.loaded, 10_000);
        assert_eq!(progress.percent, 100.0);
    }

    #[tokio::test]
    async fn test_resume_unknown_transfer_not_found() {
        let store = Arc::new(MemoryStore::new());
        let coord = coordinator(store, test_config(1000, 4));

        let err = coord.resume("no-such-id").await.unwrap_err();
        assert!(matches!(err, TransferError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_resume_completed_transfer_rejected() {
        let body = test_body(1500);
        let server = RangeServer::spawn(body, ServerBehavior::Normal).await;
        let store = Arc::new(MemoryStore::new());

        let coord = coordinator(store.clone(), test_config(1000, 2));
        let (id, status) = coord.start(&server.url(), "file.bin").await.unwrap();
        assert_eq!(status, TransferStatus::Completed);

        let err = coord.resume(&id).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::InvalidState {
                status: TransferStatus::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_resume_failed_transfer_retries_failed_segments() {
        let body = test_body(3000);
        // 前 4 个分片请求失败：max_retries=1、parallel=1 时
        // 分片 #0 与 #1 的两次尝试都命中失败窗口，#2 正常
        let server = RangeServer::spawn(body.clone(), ServerBehavior::FailFirst(4)).await;
        let store = Arc::new(MemoryStore::new());

        let coord = coordinator(store.clone(), test_config(1000, 1));
        let (id, status) = coord.start(&server.url(), "file.bin").await.unwrap();
        assert_eq!(status, TransferStatus::Failed);

        // 失败的任务允许恢复，只重试未成功的分片
        let fresh = TransferCoordinator::new(
            store.clone(),
            Arc::new(SegmentWorker::new(Duration::from_secs(5))),
            test_config(1000, 1),
        );
        let status = fresh.resume(&id).await.unwrap();
        assert_eq!(status, TransferStatus::Completed);

        let segments = store.load_segments(&id).await.unwrap();
        for segment in &segments {
            let expected = &body[segment.start_byte as usize..=segment.end_byte as usize];
            assert_eq!(segment.payload.as_deref().unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_plan_corrupted_on_segment_size_change() {
        let body = test_body(5000);
        let server = RangeServer::spawn(body, ServerBehavior::Normal).await;
        let store = Arc::new(MemoryStore::new());

        let coord = coordinator(store.clone(), test_config(1000, 2));
        let meta = coord.create(&server.url(), "file.bin").await.unwrap();
        let id = meta.id.clone();

        // 模拟中途修改分片大小：重新计算的计划与持久化边界不一致
        let mut tampered = meta.clone();
        tampered.segment_size = 800;
        store.save_meta(&tampered).await.unwrap();

        let err = coord.resume(&id).await.unwrap_err();
        assert!(matches!(err, TransferError::PlanCorrupted { .. }));
    }

    #[tokio::test]
    async fn test_pause_drains_and_preserves_progress() {
        let body = test_body(8000);
        // 每个请求延迟 100ms，留出取消窗口
        let server = RangeServer::spawn(body.clone(), ServerBehavior::Slow(100)).await;
        let store = Arc::new(MemoryStore::new());

        let coord = Arc::new(coordinator(store.clone(), test_config(1000, 2)));
        let meta = coord.create(&server.url(), "file.bin").await.unwrap();
        let id = meta.id.clone();

        let token = coord.cancellation_token();
        let run = {
            let coord = coord.clone();
            let id = id.clone();
            tokio::spawn(async move { coord.resume(&id).await })
        };

        // 等待部分分片进入在途后取消
        tokio::time::sleep(Duration::from_millis(250)).await;
        token.cancel();

        let status = run.await.unwrap().unwrap();
        assert_eq!(status, TransferStatus::Paused);

        let meta = store.load_meta(&id).await.unwrap().unwrap();
        assert_eq!(meta.status, TransferStatus::Paused);

        // 暂停不破坏已成功的分片，也不会把剩余分片标记为失败
        let segments = store.load_segments(&id).await.unwrap();
        let succeeded = segments.iter().filter(|s| s.is_success()).count();
        assert!(succeeded >= 1);
        assert!(succeeded < segments.len());
        assert!(segments.iter().all(|s| s.status != SegmentStatus::Failed));

        // 换新令牌恢复，完成剩余分片
        let fresh = TransferCoordinator::new(
            store.clone(),
            Arc::new(SegmentWorker::new(Duration::from_secs(5))),
            test_config(1000, 4),
        );
        let status = fresh.resume(&id).await.unwrap();
        assert_eq!(status, TransferStatus::Completed);
    }

    #[tokio::test]
    async fn test_start_rejects_source_without_range_support() {
        let server = RangeServer::spawn(test_body(1000), ServerBehavior::IgnoreRange).await;
        let store = Arc::new(MemoryStore::new());

        let coord = coordinator(store, test_config(100, 2));
        let err = coord.start(&server.url(), "file.bin").await.unwrap_err();
        assert!(matches!(err, TransferError::RangesUnsupported(_)));
    }
}
