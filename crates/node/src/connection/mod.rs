//! 后端连接抽象接口
//!
//! 定义了所有连接后端必须实现的统一异步接口，以及各后端共享的频道校验逻辑

mod inbox;
pub mod memory;
pub mod redis;

pub use memory::{MemoryBroker, MemoryConnection};
pub use redis::RedisConnection;

use async_trait::async_trait;
use curium_common::{CuriumError, CuriumResult};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::warn;

/// 所有节点都会加入的广播频道
pub const ALL_CHANNEL: &str = "all";

/// 频道名称中不允许出现的分隔符
pub const CHANNEL_SEPARATOR: char = '|';

/// 后端连接抽象接口
///
/// 所有后端（Redis、进程内 broker）都需要实现此 trait。
/// 方法均以 `&self` 调用，实现方自行处理内部可变性，
/// 以便节点在接收循环与发送方之间共享同一个连接。
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// 连接后端服务器
    ///
    /// # Returns
    /// 节点的唯一 ID。已连接时返回现有 ID 并记录警告。
    ///
    /// # Errors
    /// * `ConnectionFailed` - 无法连接后端
    async fn connect(&self) -> CuriumResult<String>;

    /// 使用之前获得的唯一 ID 重新连接，并重新加入之前的频道
    ///
    /// # Errors
    /// * `ConnectionFailed` - 重连失败
    /// * `NotConnected` - 从未连接过
    async fn reconnect(&self) -> CuriumResult<()>;

    /// 断开连接并清理内部状态
    ///
    /// 未连接时调用不产生任何效果，清理过程中的后端错误只记录日志
    async fn close(&self) -> CuriumResult<()>;

    /// 加入频道
    ///
    /// # Errors
    /// * `NotConnected` / `InvalidChannel` / `ServerDisconnected`
    async fn join(&self, name: &str) -> CuriumResult<()>;

    /// 离开频道
    ///
    /// # Errors
    /// * `NotConnected` / `InvalidChannel` / `ServerDisconnected`
    async fn leave(&self, name: &str) -> CuriumResult<()>;

    /// 向目标频道发送数据
    ///
    /// # Returns
    /// 收到消息的节点数量，`None` 表示未知
    async fn send(&self, data: &[u8], destinations: &[String]) -> CuriumResult<Option<usize>>;

    /// 接收数据
    ///
    /// * `None` - 一直等待
    /// * `Some(Duration::ZERO)` - 不阻塞
    /// * `Some(timeout)` - 最多等待 `timeout`，超时返回 `Ok(None)`
    async fn recv(&self, timeout: Option<Duration>) -> CuriumResult<Option<Vec<u8>>>;
}

/// 校验频道名称
pub fn validate_channel(name: &str) -> CuriumResult<()> {
    if name.contains(CHANNEL_SEPARATOR) {
        return Err(CuriumError::channel_with_separator(name));
    }
    if name.is_empty() {
        return Err(CuriumError::invalid_channel(
            "channel name shouldn't be empty",
        ));
    }
    Ok(())
}

/// 规范化目标频道列表
///
/// 去重并排序；`all` 与其他频道同时出现时只保留 `all`。
pub fn normalize_destinations<S: AsRef<str>>(destinations: &[S]) -> CuriumResult<Vec<String>> {
    let mut unique = BTreeSet::new();
    for destination in destinations {
        let destination = destination.as_ref();
        validate_channel(destination)?;
        unique.insert(destination.to_string());
    }

    if unique.is_empty() {
        return Err(CuriumError::invalid_channel(
            "at least one destination is required",
        ));
    }

    if unique.len() > 1 && unique.contains(ALL_CHANNEL) {
        warn!(
            "Destinations {:?} contain '{}', the message is sent to '{}' only",
            unique, ALL_CHANNEL, ALL_CHANNEL
        );
        return Ok(vec![ALL_CHANNEL.to_string()]);
    }

    Ok(unique.into_iter().collect())
}
