//! curium 节点
//!
//! 基于发布/订阅的命令总线：节点连接共享后端，加入频道，互相发送命令并收集响应。
//!
//! # Example
//!
//! ```ignore
//! let broker = MemoryBroker::new();
//! let node = Node::memory(&broker)?;
//! node.connect(false).await?;
//!
//! let handle = node
//!     .send(&GetNodeInfos {}, &["all"], None, Some(Duration::from_secs(1)))
//!     .await?;
//! for info in handle.wait().await?.values {
//!     println!("{}", info.nid);
//! }
//! node.close().await?;
//! ```

pub mod command;
pub mod commands;
pub mod connection;
pub mod node;
pub mod response;
pub mod serializer;

pub use command::{AnyCommand, Command, Reply};
pub use commands::{AddResponse, CommandWrapper, GetNodeInfos, NodeInfos, default_commands};
pub use connection::{
    ALL_CHANNEL, Connection, MemoryBroker, MemoryConnection, RedisConnection,
    normalize_destinations, validate_channel,
};
pub use node::{ErrorHandler, Node, error_logging};
pub use response::{
    BlockUntilAllReceived, Callback, ResponseHandle, ResponseHandler, Responses,
    UpdateTimeoutPerReceive,
};
pub use serializer::{CMD_NAME_KEY, CommandEntry, JsonSerializer, Serializer};

// 错误类型与配置来自 curium-common
pub use curium_common::{
    ConnectionError, CuriumConfig, CuriumError, CuriumResult, SerializationError,
};
