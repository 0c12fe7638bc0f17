use std::time::Duration;

use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use tracing::debug;

use crate::transfer::types::TransferError;

/// 资源探测结果
///
/// `accepts_ranges` 为 false 时本引擎无法分片传输，
/// 由上层决定是否切换整体单请求策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceInfo {
    /// 资源总大小（字节）
    pub total_size: u64,
    /// 源是否支持 Range 请求
    pub accepts_ranges: bool,
}

/// 分片获取工作器
///
/// 每次调用只发起一次 Range 请求，重试由调用方（RetryPolicy）负责
#[derive(Debug, Clone)]
pub struct SegmentWorker {
    /// HTTP 客户端（所有分片复用同一个 client 以复用连接池）
    client: Client,
}

impl SegmentWorker {
    /// 创建分片获取工作器
    pub fn new(request_timeout: Duration) -> Self {
        let client = Client::builder()
            .user_agent("segment-transfer-rust/1.3")
            .timeout(request_timeout)
            .pool_max_idle_per_host(64)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .expect("Failed to build HTTP client");

        Self { client }
    }

    /// 获取单个分片（单次尝试）
    ///
    /// 成功条件：
    /// 1. 服务器返回 206 Partial Content（200 表示不支持 Range，按失败处理）
    /// 2. 收到的字节数恰好等于 `end_byte - start_byte + 1`
    ///
    /// 字节数不匹配不是部分成功，而是失败
    pub async fn fetch_range(
        &self,
        url: &str,
        index: usize,
        start_byte: u64,
        end_byte: u64,
    ) -> Result<Vec<u8>, TransferError> {
        debug!("分片 #{}: 请求 bytes={}-{}", index, start_byte, end_byte);

        let resp = self
            .client
            .get(url)
            .header(
                header::RANGE,
                format!("bytes={}-{}", start_byte, end_byte),
            )
            .send()
            .await
            .map_err(|e| fetch_err(index, format!("发送HTTP请求失败: {}", e)))?;

        let status = resp.status();
        if status == StatusCode::OK {
            // 服务器忽略了 Range 头，返回完整内容
            return Err(fetch_err(index, "服务器返回完整内容，不支持 Range 请求".to_string()));
        }
        if status != StatusCode::PARTIAL_CONTENT {
            return Err(fetch_err(index, format!("HTTP错误: {}", status)));
        }

        // 流式读取响应体，字节数超出预期时立即失败
        let expected = end_byte - start_byte + 1;
        let mut stream = resp.bytes_stream();
        let mut buf: Vec<u8> = Vec::with_capacity(expected as usize);

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result
                .map_err(|e| fetch_err(index, format!("读取数据流失败: {}", e)))?;
            buf.extend_from_slice(&chunk);
            if buf.len() as u64 > expected {
                return Err(fetch_err(
                    index,
                    format!("字节数超出: 期望 {} bytes, 已收到 {} bytes", expected, buf.len()),
                ));
            }
        }

        if buf.len() as u64 != expected {
            return Err(fetch_err(
                index,
                format!("字节数不匹配: 期望 {} bytes, 实际 {} bytes", expected, buf.len()),
            ));
        }

        debug!("分片 #{}: 获取成功，大小 {} bytes", index, buf.len());
        Ok(buf)
    }

    /// 探测资源总大小与 Range 支持情况
    ///
    /// 发送 1 字节的 Range 请求：
    /// - 206 响应从 `Content-Range: bytes 0-0/{total}` 解析总大小
    /// - 200 响应说明源不支持 Range，退而使用 `Content-Length`
    pub async fn probe(&self, url: &str) -> Result<SourceInfo, TransferError> {
        debug!("探测资源: {}", url);

        let resp = self
            .client
            .get(url)
            .header(header::RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(|e| TransferError::ProbeFailed(format!("发送探测请求失败: {}", e)))?;

        let status = resp.status();
        match status {
            StatusCode::PARTIAL_CONTENT => {
                // 解析 Content-Range: bytes 0-0/1234567
                let content_range = resp
                    .headers()
                    .get(header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        TransferError::ProbeFailed("206 响应缺少 Content-Range 头".to_string())
                    })?;
                let total_size = content_range
                    .rsplit('/')
                    .next()
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or_else(|| {
                        TransferError::ProbeFailed(format!(
                            "无法从 Content-Range 解析总大小: {}",
                            content_range
                        ))
                    })?;

                debug!("探测成功: total_size={}, 支持 Range", total_size);
                Ok(SourceInfo {
                    total_size,
                    accepts_ranges: true,
                })
            }
            StatusCode::OK => {
                let total_size = resp.content_length().ok_or_else(|| {
                    TransferError::ProbeFailed("无法确定资源大小（缺少 Content-Length）".to_string())
                })?;

                debug!("探测成功: total_size={}, 不支持 Range", total_size);
                Ok(SourceInfo {
                    total_size,
                    accepts_ranges: false,
                })
            }
            _ => Err(TransferError::ProbeFailed(format!("HTTP错误: {}", status))),
        }
    }
}

fn fetch_err(index: usize, reason: String) -> TransferError {
    TransferError::SegmentFetchFailed { index, reason }
}
