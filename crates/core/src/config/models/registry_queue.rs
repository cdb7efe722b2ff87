use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub heartbeat_interval_seconds: u64,
    /// 心跳超过此时长的Worker视为离线，并可被清理
    pub deregister_threshold_seconds: u64,
    pub sweep_interval_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 10,
            deregister_threshold_seconds: 60,
            sweep_interval_seconds: 30,
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }

        if self.deregister_threshold_seconds <= self.heartbeat_interval_seconds {
            return Err(anyhow::anyhow!(
                "注销阈值({}s)必须大于心跳间隔({}s)",
                self.deregister_threshold_seconds,
                self.heartbeat_interval_seconds
            ));
        }

        if self.sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!("清理间隔必须大于0"));
        }

        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn deregister_threshold(&self) -> Duration {
        Duration::from_secs(self.deregister_threshold_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

/// 重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 基础重试间隔（毫秒）
    pub base_interval_ms: u64,
    /// 最大重试间隔（毫秒）
    pub max_interval_ms: u64,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 1_000,
            max_interval_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// 不退避，立即重新投递
    pub fn immediate() -> Self {
        Self {
            base_interval_ms: 0,
            max_interval_ms: 0,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_interval_ms < self.base_interval_ms {
            return Err(anyhow::anyhow!("最大重试间隔不能小于基础重试间隔"));
        }

        if self.backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!("退避倍数不能小于1.0"));
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(anyhow::anyhow!("抖动系数必须在0.0到1.0之间"));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 并发消费者数量，即同时执行的处理器上限
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    /// 租约在任务超时之外的宽限时间
    ///
    /// 也是停止队列时等待已超时处理器结束的上限，超过后中止。
    pub lease_grace_seconds: u64,
    pub reaper_interval_seconds: u64,
    pub default_max_retry: u32,
    pub default_timeout_seconds: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 200,
            lease_grace_seconds: 30,
            reaper_interval_seconds: 15,
            default_max_retry: 3,
            default_timeout_seconds: 300,
            retry: RetryConfig::default(),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.concurrency == 0 {
            return Err(anyhow::anyhow!("队列并发数必须大于0"));
        }

        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("队列轮询间隔必须大于0"));
        }

        if self.reaper_interval_seconds == 0 {
            return Err(anyhow::anyhow!("租约回收间隔必须大于0"));
        }

        if self.default_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("默认任务超时时间必须大于0"));
        }

        self.retry.validate()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_grace(&self) -> Duration {
        Duration::from_secs(self.lease_grace_seconds)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_seconds)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }
}
