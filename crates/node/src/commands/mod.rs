//! 内置命令
//!
//! `CommandWrapper` 与 `AddResponse` 由节点在构造时注册，
//! `default_commands` 中的命令也会被自动注册。

mod add_response;
mod command_wrapper;
mod get_node_infos;

pub use add_response::AddResponse;
pub use command_wrapper::CommandWrapper;
pub use get_node_infos::{GetNodeInfos, NodeInfos};

use crate::serializer::CommandEntry;

/// 节点构造时自动注册的命令
pub fn default_commands() -> Vec<CommandEntry> {
    vec![CommandEntry::of::<GetNodeInfos>()]
}
