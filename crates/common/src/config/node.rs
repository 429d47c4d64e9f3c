//! 节点行为配置

use super::split_warnings;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 节点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// 仅发送模式
    ///
    /// 为 true 时节点不加入 `all` 频道，只能通过自身 nid 被寻址
    #[serde(default)]
    pub send_only: bool,

    /// 默认响应等待时间（毫秒）
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// 接收循环的轮询间隔（毫秒）
    #[serde(default = "default_recv_poll_ms")]
    pub recv_poll_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            send_only: false,
            response_timeout_ms: default_response_timeout_ms(),
            recv_poll_ms: default_recv_poll_ms(),
        }
    }
}

impl NodeConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn recv_poll_interval(&self) -> Duration {
        Duration::from_millis(self.recv_poll_ms)
    }

    /// 单独验证节点段，返回警告
    pub fn validate_strict(&self) -> Result<Vec<String>, ConfigError> {
        let mut errors = Vec::new();
        self.validate_into(&mut errors);
        split_warnings(errors)
    }

    pub(crate) fn validate_into(&self, errors: &mut Vec<String>) {
        if self.recv_poll_ms == 0 {
            errors.push("node.recv_poll_ms must be greater than 0".to_string());
        }
        if self.response_timeout_ms == 0 {
            errors.push(
                "Warning: node.response_timeout_ms is 0, requests will not wait for responses"
                    .to_string(),
            );
        }
    }
}

fn default_response_timeout_ms() -> u64 {
    5000
}

fn default_recv_poll_ms() -> u64 {
    1000
}
