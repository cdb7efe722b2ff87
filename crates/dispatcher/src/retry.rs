use chrono::{DateTime, Utc};
use std::time::Duration;

use vmfleet_core::config::RetryConfig;

/// 重新投递的退避策略
///
/// 间隔为 `base * multiplier^(attempt-1)`，上限为 `max`，再叠加 ±jitter 的随机抖动。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn immediate() -> Self {
        Self::new(RetryConfig::immediate())
    }

    /// 第 `attempts` 次失败之后的等待时间
    pub fn backoff(&self, attempts: u32) -> Duration {
        let base_interval = self.config.base_interval_ms as f64;
        if base_interval <= 0.0 {
            return Duration::ZERO;
        }
        let multiplier = self.config.backoff_multiplier;
        let max_interval = self.config.max_interval_ms as f64;
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;

        let exponential_interval = base_interval * multiplier.powi(exponent);
        let capped_interval = exponential_interval.min(max_interval);

        let jitter =
            capped_interval * self.config.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let final_interval = (capped_interval + jitter).clamp(0.0, max_interval);

        Duration::from_millis(final_interval as u64)
    }

    /// 下次可投递的时间，无需等待时返回 `None`
    pub fn next_attempt_at(&self, attempts: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let delay = self.backoff(attempts);
        if delay.is_zero() {
            return None;
        }
        chrono::Duration::from_std(delay).ok().map(|d| now + d)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
