//! 连接相关错误类型
//!
//! 定义与后端服务器连接、断开、会话状态相关的错误

use thiserror::Error;

/// 连接相关错误（`CuriumConnectionError`）
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// 连接后端服务器失败
    #[error("Failed to connect to backend server: {reason}")]
    ConnectionFailed { reason: String },

    /// 调用操作时尚未连接
    #[error("operation before connect")]
    NotConnected,

    /// 操作过程中服务器断开
    #[error("Server disconnected: {reason}")]
    ServerDisconnected { reason: String },

    /// 后端返回的其他错误
    #[error("Backend error: {message}")]
    Backend { message: String },
}

impl ConnectionError {
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            reason: reason.into(),
        }
    }

    pub fn server_disconnected(reason: impl Into<String>) -> Self {
        Self::ServerDisconnected {
            reason: reason.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}
