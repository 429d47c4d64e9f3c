//! Redis 后端配置

use super::split_warnings;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Redis 连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis 连接 URL
    ///
    /// 格式：redis://[username:password@]host[:port][/database]
    /// 示例：redis://localhost:6379/0
    #[serde(default = "default_url")]
    pub url: String,

    /// 节点 ID 键的命名空间
    ///
    /// 节点 ID 以 `{namespace}:{uid}` 的形式写入 Redis
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// 节点 ID 键的过期时间（秒）
    #[serde(default = "default_expire_secs")]
    pub expire_secs: u64,

    /// 节点 ID 键的续期间隔（毫秒）
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            namespace: default_namespace(),
            expire_secs: default_expire_secs(),
            refresh_interval_ms: default_refresh_interval_ms(),
        }
    }
}

impl RedisConfig {
    pub fn expire(&self) -> Duration {
        Duration::from_secs(self.expire_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    /// 单独验证 Redis 段，返回警告
    pub fn validate_strict(&self) -> Result<Vec<String>, ConfigError> {
        let mut errors = Vec::new();
        self.validate_into(&mut errors);
        split_warnings(errors)
    }

    pub(crate) fn validate_into(&self, errors: &mut Vec<String>) {
        if !["redis://", "rediss://", "unix://"]
            .iter()
            .any(|scheme| self.url.starts_with(scheme))
        {
            errors.push(format!(
                "redis.url must start with redis://, rediss:// or unix://, got: {}",
                self.url
            ));
        }

        if self.namespace.trim().is_empty() {
            errors.push("redis.namespace cannot be empty".to_string());
        } else if self.namespace.contains(['|', ':']) {
            errors.push(format!(
                "redis.namespace cannot contain '|' or ':': {}",
                self.namespace
            ));
        }

        if self.expire_secs == 0 {
            errors.push("redis.expire_secs must be greater than 0".to_string());
        }

        if self.refresh_interval_ms == 0 {
            errors.push("redis.refresh_interval_ms must be greater than 0".to_string());
        } else if self.expire_secs > 0 && self.refresh_interval_ms >= self.expire_secs * 1000 {
            errors.push(format!(
                "Warning: redis.refresh_interval_ms ({}) is not shorter than redis.expire_secs ({}s), node ids may expire between refreshes",
                self.refresh_interval_ms, self.expire_secs
            ));
        }
    }
}

fn default_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_namespace() -> String {
    "curium".to_string()
}

fn default_expire_secs() -> u64 {
    600
}

fn default_refresh_interval_ms() -> u64 {
    1000
}
