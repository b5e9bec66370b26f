//! 时间处理工具
//!
//! - **存储层**: 所有时间字段使用 UTC 毫秒时间戳
//! - **业务层**: 统一使用 `Utc::now().timestamp_millis()` 生成时间

use std::time::Duration;

use chrono::Utc;

/// 当前 UTC 毫秒时间戳
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 毫秒时间戳加上一段时长
pub fn millis_after(base: i64, delay: Duration) -> i64 {
    base.saturating_add(delay.as_millis().min(i64::MAX as u128) as i64)
}

/// 距离某个毫秒时间戳还有多久（已过去则为 0）
pub fn until_millis(deadline: i64) -> Duration {
    let remaining = deadline.saturating_sub(now_millis());
    if remaining <= 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(remaining as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_after() {
        assert_eq!(millis_after(1_000, Duration::from_millis(250)), 1_250);
        assert_eq!(millis_after(i64::MAX, Duration::from_secs(1)), i64::MAX);
    }

    #[test]
    fn test_until_millis() {
        assert_eq!(until_millis(now_millis() - 10), Duration::ZERO);
        let remaining = until_millis(now_millis() + 60_000);
        assert!(remaining > Duration::from_secs(50));
    }
}
