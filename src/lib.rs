//! # curium
//!
//! 基于 Redis 发布/订阅的分布式命令总线
//!
//! 节点加入频道、互相发送命令并收集响应。具体实现位于 `curium-node`，
//! 错误类型与配置位于 `curium-common`，这里统一导出。

pub use curium_common::{
    ConfigError, ConnectionError, CuriumConfig, CuriumError, CuriumResult, LogConfig, NodeConfig,
    ObservabilityConfig, RedisConfig, SerializationError,
};
pub use curium_node::{
    ALL_CHANNEL, AddResponse, AnyCommand, BlockUntilAllReceived, CMD_NAME_KEY, Callback, Command,
    CommandEntry, CommandWrapper, Connection, ErrorHandler, GetNodeInfos, JsonSerializer,
    MemoryBroker, MemoryConnection, Node, NodeInfos, RedisConnection, Reply, ResponseHandle,
    ResponseHandler, Responses, Serializer, UpdateTimeoutPerReceive, default_commands,
    error_logging,
};
