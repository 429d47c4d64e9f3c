use crate::command::{Command, Reply};
use crate::node::Node;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 把一个响应送回发送方
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddResponse {
    pub cid: String,
    pub response: Value,
}

#[async_trait]
impl Command for AddResponse {
    const NAME: &'static str = "__cmd_add_response__";
    type Response = ();

    async fn execute(&self, node: &Node) -> anyhow::Result<Reply<()>> {
        node.add_response(&self.cid, self.response.clone());
        Ok(Reply::NoResponse)
    }
}
