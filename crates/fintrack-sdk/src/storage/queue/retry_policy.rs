use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FintrackError, Result};

/// 重试策略配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大尝试次数（由 Dispatcher 执行，不由退避控制器判断）
    pub max_attempts: u32,
    /// 基础延迟时间（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟时间（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动上限，占计算延迟的比例 (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_factor: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(FintrackError::Config("max_attempts 必须大于 0".to_string()));
        }
        if self.base_delay_ms == 0 || self.max_delay_ms < self.base_delay_ms {
            return Err(FintrackError::Config(format!(
                "退避区间无效: base={}ms max={}ms",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if self.backoff_factor < 1.0 {
            return Err(FintrackError::Config("backoff_factor 不能小于 1.0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(FintrackError::Config("jitter_factor 必须在 [0, 1] 之间".to_string()));
        }
        Ok(())
    }
}

/// 退避控制器：只计算下次尝试的延迟，从不决定放弃
#[derive(Debug, Clone)]
pub struct BackoffController {
    policy: RetryPolicy,
}

impl BackoffController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// delay = min(max_delay, base * factor^attempts) + jitter
    pub fn next_delay(&self, attempts: u32) -> Duration {
        self.delay_with_jitter(attempts, rand::random::<f64>())
    }

    /// 不含抖动的退避包络
    pub fn capped_delay_ms(&self, attempts: u32) -> u64 {
        let exp = self.policy.backoff_factor.powi(attempts.min(64) as i32);
        let raw = self.policy.base_delay_ms as f64 * exp;
        if !raw.is_finite() || raw >= self.policy.max_delay_ms as f64 {
            self.policy.max_delay_ms
        } else {
            raw as u64
        }
    }

    /// 抖动的最大可能值
    pub fn jitter_bound(&self) -> Duration {
        Duration::from_millis((self.policy.max_delay_ms as f64 * self.policy.jitter_factor) as u64)
    }

    /// `sample` 取值 [0, 1)，决定本次抖动占上限的比例
    pub fn delay_with_jitter(&self, attempts: u32, sample: f64) -> Duration {
        let capped = self.capped_delay_ms(attempts);
        let sample = sample.clamp(0.0, 1.0);
        let jitter = (capped as f64 * self.policy.jitter_factor * sample) as u64;
        Duration::from_millis(capped + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let controller = BackoffController::new(RetryPolicy::default());

        assert_eq!(controller.capped_delay_ms(0), 1_000);
        assert_eq!(controller.capped_delay_ms(1), 2_000);
        assert_eq!(controller.capped_delay_ms(3), 8_000);
        assert_eq!(controller.capped_delay_ms(6), 60_000);
        assert_eq!(controller.capped_delay_ms(200), 60_000);
    }

    #[test]
    fn test_jitter_is_bounded() {
        let controller = BackoffController::new(RetryPolicy::default());
        for attempts in 0..12 {
            let floor = Duration::from_millis(controller.capped_delay_ms(attempts));
            for _ in 0..50 {
                let delay = controller.next_delay(attempts);
                assert!(delay >= floor);
                assert!(delay <= floor + floor.mul_f64(0.2));
            }
        }
    }

    #[test]
    fn test_backoff_monotonic_for_fixed_jitter() {
        let controller = BackoffController::new(RetryPolicy::default());
        let ceiling = Duration::from_millis(60_000) + controller.jitter_bound();

        for sample in [0.0, 0.25, 0.5, 0.99] {
            for n in 0..40 {
                let current = controller.delay_with_jitter(n, sample);
                let next = controller.delay_with_jitter(n + 1, sample);
                assert!(current <= next, "n={} sample={}", n, sample);
                assert!(next <= ceiling);
            }
        }
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());

        let bad = RetryPolicy { max_attempts: 0, ..RetryPolicy::default() };
        assert!(bad.validate().is_err());

        let bad = RetryPolicy { jitter_factor: 1.5, ..RetryPolicy::default() };
        assert!(bad.validate().is_err());

        let bad = RetryPolicy { base_delay_ms: 10, max_delay_ms: 5, ..RetryPolicy::default() };
        assert!(bad.validate().is_err());
    }
}
