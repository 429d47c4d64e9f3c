//! 顶层错误枚举
//!
//! 聚合连接、序列化、配置等子类错误，提供 curium 统一的错误处理接口

use super::{ConfigError, ConnectionError, SerializationError};
use thiserror::Error;

/// curium 所有错误的根类型
///
/// 连接类错误与序列化类错误各自有独立的子枚举，调用方可以按类别匹配：
///
/// ```
/// use curium_common::error::{ConnectionError, CuriumError};
///
/// let err: CuriumError = ConnectionError::NotConnected.into();
/// assert!(err.is_connection_error());
/// ```
#[derive(Error, Debug)]
pub enum CuriumError {
    // ========== 连接错误 ==========
    /// 与后端服务器连接相关的错误
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// 频道名称对当前后端不可用
    #[error("{message}")]
    InvalidChannel { message: String },

    // ========== 序列化错误 ==========
    /// 命令编码/解码错误
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    // ========== 基础设施错误 ==========
    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ========== 调用错误 ==========
    /// 参数组合不合法
    #[error("{message}")]
    InvalidArgument { message: String },
}

impl CuriumError {
    /// 频道名中出现了分隔符 `|`
    pub fn channel_with_separator(channel: impl AsRef<str>) -> Self {
        Self::InvalidChannel {
            message: format!(
                "character '|' shouldn't appear in channel name: {}",
                channel.as_ref()
            ),
        }
    }

    /// 创建频道错误
    pub fn invalid_channel(message: impl Into<String>) -> Self {
        Self::InvalidChannel {
            message: message.into(),
        }
    }

    /// 创建参数错误
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// 是否属于连接类错误（对应 `CuriumConnectionError`）
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// 是否属于序列化类错误（对应 `CuriumSerializationError`）
    pub fn is_serialization_error(&self) -> bool {
        matches!(self, Self::Serialization(_))
    }

    /// 服务器在操作过程中断开
    pub fn is_server_disconnected(&self) -> bool {
        matches!(self, Self::Connection(ConnectionError::ServerDisconnected { .. }))
    }

    /// 操作发生在连接建立之前
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::Connection(ConnectionError::NotConnected))
    }
}

/// 统一的 Result 类型
pub type CuriumResult<T> = std::result::Result<T, CuriumError>;
