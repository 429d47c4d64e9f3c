//! 序列化相关错误类型
//!
//! 定义命令编码、解码以及命令注册表相关的错误

use thiserror::Error;

/// 序列化相关错误（`CuriumSerializationError`）
#[derive(Error, Debug)]
pub enum SerializationError {
    /// 原始数据格式不正确
    #[error("{message}")]
    InvalidFormat { message: String },

    /// 同名命令已被另一个类型注册
    #[error("Register command {command} using a duplicated name with command {registered}'s name")]
    CommandHasRegistered {
        command: String,
        registered: String,
    },

    /// 命令名称未注册
    #[error("command {name} is not registered")]
    CommandNotRegistered { name: String },

    /// 对象无法编码
    #[error("Unsupported object: {message}")]
    UnsupportedObject { message: String },
}

impl SerializationError {
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    pub fn not_registered(name: impl Into<String>) -> Self {
        Self::CommandNotRegistered { name: name.into() }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedObject {
            message: message.into(),
        }
    }
}
