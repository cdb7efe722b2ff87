use serde::{Deserialize, Serialize};

/// 存储/事件后端类型，启动时选定一次
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Memory,
    Redis,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::Redis => "redis",
        }
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// 所有键和频道的前缀
    pub key_prefix: String,
    pub connection_timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            key_prefix: "vmfleet".to_string(),
            connection_timeout_seconds: 10,
        }
    }
}

impl RedisConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.url.starts_with("redis://") && !self.url.starts_with("rediss://") {
            return Err(anyhow::anyhow!(
                "Redis URL必须以redis://或rediss://开头: {}",
                self.url
            ));
        }

        if self.key_prefix.is_empty() {
            return Err(anyhow::anyhow!("Redis键前缀不能为空"));
        }

        if self.key_prefix.contains(' ') {
            return Err(anyhow::anyhow!("Redis键前缀不能包含空格"));
        }

        if self.connection_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("Redis连接超时时间必须大于0"));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    #[serde(default)]
    pub redis: RedisConfig,
}

impl BackendConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.kind == BackendKind::Redis {
            self.redis.validate()?;
        }
        Ok(())
    }
}
