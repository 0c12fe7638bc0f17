use serde::{Deserialize, Serialize};

use crate::transfer::types::TransferError;

/// 默认分片大小: 5MB
pub const DEFAULT_SEGMENT_SIZE: u64 = 5 * 1024 * 1024;

/// 分片区间
///
/// 闭区间 `[start_byte, end_byte]`，对应一次 HTTP Range 请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRange {
    /// 分片索引（0-based，按区间顺序）
    pub index: usize,
    /// 起始字节（含）
    pub start_byte: u64,
    /// 结束字节（含）
    pub end_byte: u64,
}

impl SegmentRange {
    /// 分片字节宽度
    pub fn width(&self) -> u64 {
        self.end_byte - self.start_byte + 1
    }
}

/// 计算分片计划
///
/// 纯函数：相同入参永远产生相同计划，恢复流程依赖这一点来核对
/// 持久化分片的索引与字节边界。
///
/// 产生 `ceil(total_size / segment_size)` 个连续、不重叠的区间，
/// 并集恰好覆盖 `[0, total_size - 1]`；最后一个分片允许不满。
pub fn plan(total_size: u64, segment_size: u64) -> Result<Vec<SegmentRange>, TransferError> {
    if total_size == 0 || segment_size == 0 {
        return Err(TransferError::InvalidPlanInput {
            total_size,
            segment_size,
        });
    }

    let mut ranges = Vec::new();
    let mut offset = 0u64;
    let mut index = 0usize;

    while offset < total_size {
        let end = std::cmp::min(offset + segment_size, total_size) - 1;
        ranges.push(SegmentRange {
            index,
            start_byte: offset,
            end_byte: end,
        });
        offset = end + 1;
        index += 1;
    }

    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_plan_exact_split() {
        let ranges = plan(100, 10).unwrap();
        assert_eq!(ranges.len(), 10);
        assert_eq!(ranges[0].start_byte, 0);
        assert_eq!(ranges[0].end_byte, 9);
        assert_eq!(ranges[9].start_byte, 90);
        assert_eq!(ranges[9].end_byte, 99);
    }

    #[test]
    fn test_plan_uneven_tail() {
        let ranges = plan(105, 10).unwrap();
        assert_eq!(ranges.len(), 11);
        assert_eq!(ranges[10].start_byte, 100);
        assert_eq!(ranges[10].end_byte, 104);
        assert_eq!(ranges[10].width(), 5);
    }

    #[test]
    fn test_plan_single_segment() {
        // 分片大小超过总大小时只有一个分片
        let ranges = plan(100, 1000).unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start_byte, 0);
        assert_eq!(ranges[0].end_byte, 99);
    }

    #[test]
    fn test_plan_rejects_zero_inputs() {
        assert!(matches!(
            plan(0, 100),
            Err(TransferError::InvalidPlanInput { .. })
        ));
        assert!(matches!(
            plan(100, 0),
            Err(TransferError::InvalidPlanInput { .. })
        ));
    }

    #[test]
    fn test_plan_ten_megabyte_example() {
        let ranges = plan(10_000_000, 1_000_000).unwrap();
        assert_eq!(ranges.len(), 10);
        assert_eq!(ranges[9].index, 9);
        assert_eq!(ranges[9].start_byte, 9_000_000);
        assert_eq!(ranges[9].end_byte, 9_999_999);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let a = plan(123_456, 7_890).unwrap();
        let b = plan(123_456, 7_890).unwrap();
        assert_eq!(a, b);
    }

    proptest! {
        /// 任意合法入参下：区间连续、不重叠，且并集恰好为 [0, total_size-1]
        #[test]
        fn prop_plan_covers_everything(total_size in 1u64..5_000_000, segment_size in 1u64..500_000) {
            let ranges = plan(total_size, segment_size).unwrap();

            let expected_count = (total_size + segment_size - 1) / segment_size;
            prop_assert_eq!(ranges.len() as u64, expected_count);

            prop_assert_eq!(ranges[0].start_byte, 0);
            prop_assert_eq!(ranges[ranges.len() - 1].end_byte, total_size - 1);

            for window in ranges.windows(2) {
                // 相邻区间首尾相接
                prop_assert_eq!(window[1].start_byte, window[0].end_byte + 1);
                prop_assert_eq!(window[1].index, window[0].index + 1);
            }

            let width_sum: u64 = ranges.iter().map(SegmentRange::width).sum();
            prop_assert_eq!(width_sum, total_size);

            // 除最后一个分片外宽度均等于 segment_size
            for range in &ranges[..ranges.len() - 1] {
                prop_assert_eq!(range.width(), segment_size);
            }
            prop_assert!(ranges[ranges.len() - 1].width() <= segment_size);
        }
    }
}
