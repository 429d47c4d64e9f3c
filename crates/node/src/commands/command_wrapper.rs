use super::AddResponse;
use crate::command::{Command, Reply};
use crate::node::Node;
use crate::serializer::Serializer;
use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// 包装一个需要响应的命令
///
/// `cmd` 是内层命令的线上格式。执行时先解码并执行内层命令，
/// 有响应时：发送方是本节点则直接记录，否则向 `nid` 发送 `AddResponse`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandWrapper {
    pub nid: String,
    pub cid: String,
    pub cmd: Value,
}

#[async_trait]
impl Command for CommandWrapper {
    const NAME: &'static str = "__cmd_wrapper__";
    type Response = ();

    async fn execute(&self, node: &Node) -> anyhow::Result<Reply<()>> {
        // 节点构造时以序列化器作为上下文注册
        let serializer = node
            .cmd_context::<Arc<dyn Serializer>>(Self::NAME)
            .ok_or_else(|| anyhow!("no serializer registered for {}", Self::NAME))?;
        let cmd = serializer.deserialize_value(self.cmd.clone())?;

        let Some(response) = cmd.execute_any(node).await? else {
            return Ok(Reply::NoResponse);
        };

        if node.nid().is_ok_and(|nid| nid == self.nid) {
            node.add_response(&self.cid, response);
        } else {
            let reply = AddResponse {
                cid: self.cid.clone(),
                response,
            };
            node.send_no_response(&reply, &[self.nid.as_str()]).await?;
        }
        Ok(Reply::NoResponse)
    }
}
