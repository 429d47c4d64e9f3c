use crate::command::{Command, Reply};
use crate::node::Node;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 查询节点信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetNodeInfos {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfos {
    pub nid: String,
}

#[async_trait]
impl Command for GetNodeInfos {
    const NAME: &'static str = "get_node_infos";
    type Response = NodeInfos;

    async fn execute(&self, node: &Node) -> anyhow::Result<Reply<NodeInfos>> {
        Ok(Reply::Response(NodeInfos {
            nid: node.nid()?.to_string(),
        }))
    }
}
