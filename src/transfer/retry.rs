use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 重试失败的结果
///
/// 区分「重试耗尽」与「协作式取消」：耗尽时原样携带最后一次的
/// 底层错误，调用方可以据此与新发生的错误区别处理
#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// 全部尝试用尽，携带最后一次的原始错误
    Exhausted(E),
    /// 等待或尝试前收到取消信号，放弃后续尝试
    Cancelled,
}

/// 重试策略：有界重试 + 纯指数退避
///
/// 第 `i` 次尝试失败后等待 `base_delay * 2^i` 再重试（0-indexed），
/// 无抖动、无上限，需要上限的调用方自行在外层封装。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大重试次数（总尝试次数 = max_retries + 1）
    max_retries: u32,
    /// 首次退避时长
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// 第 attempt 次尝试失败后的退避时长
    fn backoff_delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }

    /// 执行可重试的异步操作
    ///
    /// 取消语义：每次尝试前、每次退避等待中都会检查取消信号；
    /// 取消后不再发起新的尝试，返回 `Cancelled` 而非底层错误。
    pub async fn execute<T, E, Op, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: Op,
    ) -> Result<T, RetryError<E>>
    where
        E: std::fmt::Display,
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt >= self.max_retries {
                        // 最后一次失败原样上抛，不包装
                        return Err(RetryError::Exhausted(e));
                    }

                    let delay = self.backoff_delay(attempt);
                    warn!(
                        "第 {}/{} 次尝试失败，{}ms 后重试: {}",
                        attempt + 1,
                        self.max_retries + 1,
                        delay.as_millis(),
                        e
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!("退避等待中收到取消信号，放弃重试");
                            return Err(RetryError::Cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }

                    attempt += 1;
                }
            }
        }
    }
}
