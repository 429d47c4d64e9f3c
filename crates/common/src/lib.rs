//! curium 基础设施库
//!
//! 为 curium 节点与命令行工具提供错误类型和配置管理

pub mod config;
pub mod error;

// Re-export commonly used types for convenience
pub use config::{CuriumConfig, LogConfig, NodeConfig, ObservabilityConfig, RedisConfig};
pub use error::{
    ConfigError, ConnectionError, CuriumError, CuriumResult, SerializationError,
};
