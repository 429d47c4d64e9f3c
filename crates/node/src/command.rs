//! 命令模型
//!
//! `Command` 是面向用户的强类型接口；`AnyCommand` 是它的类型擦除形式，
//! 供序列化器与接收循环在不知道具体类型时使用。

use crate::node::Node;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::fmt::Debug;

/// 命令执行结果
#[derive(Debug, Clone, PartialEq)]
pub enum Reply<R> {
    /// 需要回传给发送方的响应
    Response(R),
    /// 本次执行没有响应，发送方不会收到任何内容
    NoResponse,
}

/// 可在节点之间传递并执行的命令
///
/// 命令以 JSON 对象的形式传输，`NAME` 作为注册名写入 `__cmd_name__`。
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Serialize, Deserialize)]
/// struct Echo {
///     text: String,
/// }
///
/// #[async_trait]
/// impl Command for Echo {
///     const NAME: &'static str = "echo";
///     type Response = String;
///
///     async fn execute(&self, _node: &Node) -> anyhow::Result<Reply<String>> {
///         Ok(Reply::Response(self.text.clone()))
///     }
/// }
/// ```
#[async_trait]
pub trait Command: Serialize + DeserializeOwned + Debug + Send + Sync + 'static {
    /// 注册名，同一个序列化器中必须唯一
    const NAME: &'static str;

    /// 响应类型
    type Response: Serialize + DeserializeOwned + Send + 'static;

    /// 在收到命令的节点上执行
    async fn execute(&self, node: &Node) -> anyhow::Result<Reply<Self::Response>>;
}

/// 类型擦除后的命令
#[async_trait]
pub trait AnyCommand: Debug + Send + Sync + 'static {
    /// 注册名
    fn name(&self) -> &'static str;

    /// 编码命令字段（不含 `__cmd_name__`）
    fn to_value(&self) -> serde_json::Result<Value>;

    /// 执行命令，响应以 JSON 值返回；`None` 表示没有响应
    async fn execute_any(&self, node: &Node) -> anyhow::Result<Option<Value>>;

    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
impl<C: Command> AnyCommand for C {
    fn name(&self) -> &'static str {
        C::NAME
    }

    fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    async fn execute_any(&self, node: &Node) -> anyhow::Result<Option<Value>> {
        match self.execute(node).await? {
            Reply::Response(response) => Ok(Some(serde_json::to_value(response)?)),
            Reply::NoResponse => Ok(None),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn AnyCommand {
    /// 还原为具体的命令类型
    pub fn downcast_ref<C: Command>(&self) -> Option<&C> {
        self.as_any().downcast_ref::<C>()
    }

    pub fn is<C: Command>(&self) -> bool {
        self.as_any().is::<C>()
    }
}
