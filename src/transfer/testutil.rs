//! 测试夹具：支持 Range 请求的内存 HTTP 服务
//!
//! 仅在测试中使用，用于模拟各类远端行为（正常分片、忽略 Range、
//! 短响应、瞬时失败等），并记录收到的 Range 请求便于断言。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

/// 服务端行为
#[derive(Debug, Clone)]
pub(crate) enum ServerBehavior {
    /// 正常响应 Range 请求
    Normal,
    /// 忽略 Range 头，始终返回 200 完整内容
    IgnoreRange,
    /// 返回 206 但响应体只有请求宽度的一半
    ShortBody,
    /// 始终返回 500
    AlwaysError,
    /// 前 n 个请求返回 503，之后正常
    FailFirst(u32),
    /// 起始字节命中集合的 Range 请求始终返回 503
    FailRangesStartingAt(Vec<u64>),
    /// 每个分片请求延迟指定毫秒后正常响应（探测请求不延迟）
    Slow(u64),
}

struct Inner {
    body: Vec<u8>,
    behavior: ServerBehavior,
    chunk_hits: AtomicU32,
    requests: Mutex<Vec<(u64, u64)>>,
}

/// 测试用 Range 服务器
pub(crate) struct RangeServer {
    addr: std::net::SocketAddr,
    inner: Arc<Inner>,
}

impl RangeServer {
    pub(crate) async fn spawn(body: Vec<u8>, behavior: ServerBehavior) -> Self {
        let inner = Arc::new(Inner {
            body,
            behavior,
            chunk_hits: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/file", get(file_handler))
            .with_state(inner.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let addr = listener.local_addr().expect("local addr");

        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, inner }
    }

    pub(crate) fn url(&self) -> String {
        format!("http://{}/file", self.addr)
    }

    /// 已收到的 Range 请求列表（按到达顺序）
    pub(crate) fn served_ranges(&self) -> Vec<(u64, u64)> {
        self.inner.requests.lock().unwrap().clone()
    }
}

/// 解析 `Range: bytes=start-end` 请求头
fn parse_range(headers: &HeaderMap) -> Option<(u64, u64)> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    let raw = value.strip_prefix("bytes=")?;
    let (start, end) = raw.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

async fn file_handler(State(inner): State<Arc<Inner>>, headers: HeaderMap) -> Response {
    let range = parse_range(&headers);
    if let Some(r) = range {
        inner.requests.lock().unwrap().push(r);
    }
    // 宽度为 1 的请求视为探测请求，不计入失败窗口
    let is_chunk_request = range.map(|(s, e)| e > s).unwrap_or(true);

    match &inner.behavior {
        ServerBehavior::AlwaysError => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        ServerBehavior::FailFirst(n) => {
            if is_chunk_request && inner.chunk_hits.fetch_add(1, Ordering::SeqCst) < *n {
                StatusCode::SERVICE_UNAVAILABLE.into_response()
            } else {
                serve_range(&inner.body, range, false)
            }
        }
        ServerBehavior::FailRangesStartingAt(starts)
            if range.map(|(s, _)| starts.contains(&s)).unwrap_or(false) =>
        {
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
        ServerBehavior::IgnoreRange => (StatusCode::OK, inner.body.clone()).into_response(),
        ServerBehavior::Slow(delay_ms) => {
            if is_chunk_request {
                tokio::time::sleep(std::time::Duration::from_millis(*delay_ms)).await;
            }
            serve_range(&inner.body, range, false)
        }
        ServerBehavior::ShortBody => serve_range(&inner.body, range, true),
        _ => serve_range(&inner.body, range, false),
    }
}

/// 响应 Range 请求：206 + Content-Range；无 Range 头时返回 200 完整内容
fn serve_range(body: &[u8], range: Option<(u64, u64)>, truncate_half: bool) -> Response {
    let total = body.len() as u64;
    match range {
        Some((start, end)) => {
            if start >= total {
                return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            }
            let end = end.min(total - 1);
            let mut slice = body[start as usize..=end as usize].to_vec();
            if truncate_half && slice.len() >= 2 {
                slice.truncate(slice.len() / 2);
            }
            (
                StatusCode::PARTIAL_CONTENT,
                [(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, end, total),
                )],
                slice,
            )
                .into_response()
        }
        None => (StatusCode::OK, body.to_vec()).into_response(),
    }
}
