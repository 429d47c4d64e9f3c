//! 统一错误处理模型
//!
//! 提供 curium 命令行程序的顶层错误类型，聚合各 crate 的错误

use curium_common::{ConfigError, CuriumError};
use thiserror::Error;

/// 主应用的统一错误枚举
#[derive(Debug, Error)]
pub enum Error {
    // ========== 配置相关错误 ==========
    /// 配置文件相关错误
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ========== 总线错误 ==========
    /// 节点、连接或序列化错误
    #[error("Curium error: {0}")]
    Curium(#[from] CuriumError),

    // ========== 系统级错误 ==========
    /// I/O 操作错误
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ========== 业务逻辑错误 ==========
    /// 节点启动失败
    #[error("Node startup failed: {message}")]
    NodeStartup { message: String },

    /// 配置验证失败
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String },

    // ========== 通用错误 ==========
    /// Anyhow 错误兼容层
    #[error("Legacy error: {0}")]
    Anyhow(#[from] anyhow::Error),

    /// 自定义错误消息
    #[error("Application error: {message}")]
    Custom { message: String },
}

/// 统一的 Result 类型
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// 创建自定义错误
    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom {
            message: message.into(),
        }
    }

    /// 创建节点启动失败错误
    pub fn node_startup(message: impl Into<String>) -> Self {
        Self::NodeStartup {
            message: message.into(),
        }
    }

    /// 创建配置验证失败错误
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }
}
