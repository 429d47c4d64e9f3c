//! 节点
//!
//! 节点把连接、序列化器和命令组合在一起：
//! - 发送命令并收集响应
//! - 在后台循环中接收并执行命令
//! - 把响应路由回对应的 `ResponseHandle`

use crate::command::{AnyCommand, Command};
use crate::commands::{AddResponse, CommandWrapper, default_commands};
use crate::connection::{ALL_CHANNEL, Connection, MemoryBroker, RedisConnection};
use crate::response::{BlockUntilAllReceived, PendingResponse, ResponseHandle, ResponseHandler};
use crate::serializer::{CommandEntry, JsonSerializer, Serializer};
use curium_common::{ConnectionError, CuriumConfig, CuriumError, CuriumResult, NodeConfig};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 命令执行失败时的回调
pub type ErrorHandler = Arc<dyn Fn(&dyn AnyCommand, &anyhow::Error) + Send + Sync>;

/// 默认的错误处理：记录错误日志
pub fn error_logging(cmd: &dyn AnyCommand, error: &anyhow::Error) {
    error!(
        "An Exception raised in the command execution: {:?}: {:#}",
        cmd, error
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Connected,
    Closed,
}

struct NodeInner {
    connection: Arc<dyn Connection>,
    serializer: Arc<dyn Serializer>,
    recv_poll: Duration,
    nid: OnceLock<String>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    closed: CancellationToken,
    next_cid: AtomicU64,
    pending: Mutex<HashMap<String, Weak<PendingResponse>>>,
    contexts: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    error_handler: RwLock<ErrorHandler>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

/// 命令总线上的一个节点
///
/// `Node` 可以廉价克隆，所有克隆共享同一个连接。
/// 最后一个克隆被丢弃时，接收循环停止，连接在后台关闭。
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("nid", &self.inner.nid.get())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn create_response_handler(
    response_handler: Option<Box<dyn ResponseHandler>>,
    response_timeout: Option<Duration>,
) -> CuriumResult<Box<dyn ResponseHandler>> {
    match (response_handler, response_timeout) {
        (Some(_), Some(_)) => Err(CuriumError::invalid_argument(
            "cannot set both response_handler and response_timeout",
        )),
        (Some(handler), None) => Ok(handler),
        (None, timeout) => Ok(Box::new(BlockUntilAllReceived::new(timeout))),
    }
}

impl Node {
    /// 创建节点并注册内置命令
    pub fn new(connection: Arc<dyn Connection>, serializer: Arc<dyn Serializer>) -> CuriumResult<Self> {
        Self::with_config(connection, serializer, &NodeConfig::default())
    }

    pub fn with_config(
        connection: Arc<dyn Connection>,
        serializer: Arc<dyn Serializer>,
        config: &NodeConfig,
    ) -> CuriumResult<Self> {
        for warning in config.validate_strict()? {
            warn!("{}", warning);
        }

        let node = Self {
            inner: Arc::new(NodeInner {
                connection,
                serializer: serializer.clone(),
                recv_poll: config.recv_poll_interval(),
                nid: OnceLock::new(),
                lifecycle: tokio::sync::Mutex::new(Lifecycle::Idle),
                closed: CancellationToken::new(),
                next_cid: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                contexts: RwLock::new(HashMap::new()),
                error_handler: RwLock::new(Arc::new(error_logging) as ErrorHandler),
                recv_task: Mutex::new(None),
            }),
        };

        node.register_cmd_with_context::<CommandWrapper, _>(serializer)?;
        node.register_cmd::<AddResponse>()?;
        for entry in default_commands() {
            node.register_entry(entry)?;
        }
        Ok(node)
    }

    /// 基于 Redis 的节点
    pub fn redis(client: redis::Client, config: &CuriumConfig) -> CuriumResult<Self> {
        let connection = RedisConnection::new(client, &config.redis)?;
        Self::with_config(
            Arc::new(connection),
            Arc::new(JsonSerializer::new()),
            &config.node,
        )
    }

    /// 根据配置创建基于 Redis 的节点
    pub fn from_config(config: &CuriumConfig) -> CuriumResult<Self> {
        let connection = RedisConnection::from_config(&config.redis)?;
        Self::with_config(
            Arc::new(connection),
            Arc::new(JsonSerializer::new()),
            &config.node,
        )
    }

    /// 基于进程内 broker 的节点
    pub fn memory(broker: &MemoryBroker) -> CuriumResult<Self> {
        Self::new(
            Arc::new(broker.connection()),
            Arc::new(JsonSerializer::new()),
        )
    }

    /// 连接后端并启动接收循环
    ///
    /// 节点会加入以自身 nid 命名的频道；非 `send_only` 时还会加入 `all`。
    /// 收到的命令由后台循环执行，失败时交给 `set_error_handler` 设置的处理函数。
    /// 已连接或已关闭时只记录警告。
    pub async fn connect(&self, send_only: bool) -> CuriumResult<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if *lifecycle != Lifecycle::Idle {
            warn!("connection already connected or closed");
            return Ok(());
        }

        let connection = &self.inner.connection;
        let nid = connection.connect().await?;
        if let Err(e) = self.join_initial(&nid, send_only).await {
            if let Err(close_err) = connection.close().await {
                warn!("Failed to close connection after join failure: {}", close_err);
            }
            return Err(e);
        }

        let _ = self.inner.nid.set(nid.clone());
        *lifecycle = Lifecycle::Connected;
        self.spawn_recv_loop();

        info!("Node {} connected (send_only: {})", nid, send_only);
        Ok(())
    }

    async fn join_initial(&self, nid: &str, send_only: bool) -> CuriumResult<()> {
        self.inner.connection.join(nid).await?;
        if !send_only {
            self.inner.connection.join(ALL_CHANNEL).await?;
        }
        Ok(())
    }

    /// 使用原来的 nid 重新连接，并重新启动接收循环
    ///
    /// 重连失败时接收循环保持停止，下一次成功的重连会再启动它。
    pub async fn reconnect(&self) -> CuriumResult<()> {
        let lifecycle = self.inner.lifecycle.lock().await;
        if *lifecycle != Lifecycle::Connected {
            return Err(ConnectionError::NotConnected.into());
        }

        // 旧循环读的是即将被替换的收件箱，必须在重连前停掉
        let task = lock(&self.inner.recv_task).take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        self.inner.connection.reconnect().await?;
        self.spawn_recv_loop();
        info!("Node {} reconnected", self.nid()?);
        Ok(())
    }

    /// 关闭节点，可重复调用
    pub async fn close(&self) -> CuriumResult<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if *lifecycle == Lifecycle::Closed {
            return Ok(());
        }
        *lifecycle = Lifecycle::Closed;
        self.inner.closed.cancel();

        let task = lock(&self.inner.recv_task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.connection.close().await?;

        info!("Node {} closed", self.inner.nid.get().map_or("-", String::as_str));
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    pub async fn join(&self, name: &str) -> CuriumResult<()> {
        self.inner.connection.join(name).await
    }

    pub async fn leave(&self, name: &str) -> CuriumResult<()> {
        self.inner.connection.leave(name).await
    }

    /// 发送命令并收集响应
    ///
    /// # Arguments
    /// * `response_handler` - 响应收集策略，默认为 `BlockUntilAllReceived`
    /// * `response_timeout` - 默认策略的超时时间，不能与 `response_handler` 同时指定
    pub async fn send<C, S>(
        &self,
        cmd: &C,
        destinations: &[S],
        response_handler: Option<Box<dyn ResponseHandler>>,
        response_timeout: Option<Duration>,
    ) -> CuriumResult<ResponseHandle<C::Response>>
    where
        C: Command,
        S: AsRef<str> + Sync,
    {
        let handler = create_response_handler(response_handler, response_timeout)?;
        let nid = self.nid()?.to_string();
        let cid = self.inner.next_cid.fetch_add(1, Ordering::SeqCst).to_string();

        let wrapper = CommandWrapper {
            nid,
            cid: cid.clone(),
            cmd: self.inner.serializer.to_value(cmd)?,
        };

        let pending = PendingResponse::new(handler);
        {
            let mut registry = lock(&self.inner.pending);
            registry.retain(|_, handle| handle.strong_count() > 0);
            registry.insert(cid.clone(), Arc::downgrade(&pending));
        }

        match self.send_no_response(&wrapper, destinations).await {
            Ok(num_receivers) => pending.set_num_receivers(num_receivers),
            Err(e) => {
                lock(&self.inner.pending).remove(&cid);
                return Err(e);
            }
        }

        debug!("Sent command {} as {}", C::NAME, cid);
        Ok(ResponseHandle::new(cid, pending))
    }

    /// 发送不需要响应的命令
    ///
    /// # Returns
    /// 收到命令的节点数量，`None` 表示未知
    pub async fn send_no_response<S>(
        &self,
        cmd: &dyn AnyCommand,
        destinations: &[S],
    ) -> CuriumResult<Option<usize>>
    where
        S: AsRef<str> + Sync,
    {
        let data = self.inner.serializer.serialize(cmd)?;
        let destinations: Vec<String> = destinations
            .iter()
            .map(|destination| destination.as_ref().to_string())
            .collect();
        self.inner.connection.send(&data, &destinations).await
    }

    /// 接收并解码一个命令，超时返回 `Ok(None)`
    pub async fn recv(&self, timeout: Option<Duration>) -> CuriumResult<Option<Box<dyn AnyCommand>>> {
        let Some(data) = self.inner.connection.recv(timeout).await? else {
            return Ok(None);
        };
        Ok(Some(self.inner.serializer.deserialize(&data)?))
    }

    async fn recv_step(&self, error_handler: &ErrorHandler) -> ControlFlow<CuriumResult<()>> {
        let received = tokio::select! {
            _ = self.inner.closed.cancelled() => return ControlFlow::Break(Ok(())),
            received = self.recv(Some(self.inner.recv_poll)) => received,
        };

        match received {
            Ok(Some(cmd)) => {
                self.spawn_execution(cmd, error_handler.clone());
                ControlFlow::Continue(())
            }
            Ok(None) => ControlFlow::Continue(()),
            Err(e) if e.is_serialization_error() => {
                warn!("Dropping a message that cannot be decoded: {}", e);
                ControlFlow::Continue(())
            }
            Err(_) if self.is_closed() => ControlFlow::Break(Ok(())),
            Err(e) => ControlFlow::Break(Err(e)),
        }
    }

    fn spawn_execution(&self, cmd: Box<dyn AnyCommand>, error_handler: ErrorHandler) {
        let node = self.clone();
        tokio::spawn(async move {
            debug!("Executing command {}", cmd.name());
            if let Err(e) = cmd.execute_any(&node).await {
                error_handler(cmd.as_ref(), &e);
            }
        });
    }

    fn spawn_recv_loop(&self) {
        let weak = Arc::downgrade(&self.inner);

        let task = tokio::spawn(async move {
            match recv_until_close(weak).await {
                Ok(()) => debug!("Receive loop finished"),
                Err(e) => error!("Receive loop stopped: {}", e),
            }
        });

        *lock(&self.inner.recv_task) = Some(task);
    }

    /// 把响应交给对应的响应句柄
    pub fn add_response(&self, cid: &str, response: Value) {
        let pending = {
            let mut registry = lock(&self.inner.pending);
            match registry.get(cid).map(Weak::upgrade) {
                Some(Some(pending)) => Some(pending),
                Some(None) => {
                    registry.remove(cid);
                    debug!("Response handle of command {} was dropped", cid);
                    return;
                }
                None => None,
            }
        };

        match pending {
            Some(pending) => pending.add(cid, response),
            None => warn!(
                "Received a response of command {}, but the command is not found",
                cid
            ),
        }
    }

    /// 注册命令类型
    pub fn register_cmd<C: Command>(&self) -> CuriumResult<()> {
        self.register_entry(CommandEntry::of::<C>())
    }

    fn register_entry(&self, entry: CommandEntry) -> CuriumResult<()> {
        self.inner.serializer.register(entry)?;
        Ok(())
    }

    /// 注册命令类型并附带执行上下文
    pub fn register_cmd_with_context<C, T>(&self, context: T) -> CuriumResult<()>
    where
        C: Command,
        T: Any + Send + Sync,
    {
        self.register_cmd::<C>()?;
        self.inner
            .contexts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(C::NAME.to_string(), Arc::new(context));
        Ok(())
    }

    /// 读取命令的执行上下文；不存在或类型不符时返回 `None`
    pub fn cmd_context<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let context = self
            .inner
            .contexts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()?;
        context.downcast::<T>().ok()
    }

    /// 节点 ID
    pub fn nid(&self) -> CuriumResult<&str> {
        self.inner
            .nid
            .get()
            .map(String::as_str)
            .ok_or_else(|| ConnectionError::NotConnected.into())
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.inner.serializer
    }

    /// 设置后台接收循环使用的错误处理
    pub fn set_error_handler(&self, handler: impl Fn(&dyn AnyCommand, &anyhow::Error) + Send + Sync + 'static) {
        *self
            .inner
            .error_handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(handler);
    }

    pub fn error_handler(&self) -> ErrorHandler {
        self.inner
            .error_handler
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// 循环接收并执行命令，直到节点关闭或被丢弃
///
/// 每个命令在独立的任务中执行，执行错误交给节点当前的错误处理函数。
/// 无法解码的消息会被跳过；连接错误会结束循环并返回该错误。
/// 每轮只临时持有强引用，节点被丢弃后循环随之结束。
async fn recv_until_close(weak: Weak<NodeInner>) -> CuriumResult<()> {
    while let Some(inner) = weak.upgrade() {
        let node = Node { inner };
        let error_handler = node.error_handler();
        if let ControlFlow::Break(result) = node.recv_step(&error_handler).await {
            return result;
        }
    }
    Ok(())
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        self.closed.cancel();

        let connected = self
            .lifecycle
            .try_lock()
            .is_ok_and(|lifecycle| *lifecycle == Lifecycle::Connected);
        if connected && let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let connection = self.connection.clone();
            runtime.spawn(async move {
                if let Err(e) = connection.close().await {
                    warn!("Failed to close connection of a dropped node: {}", e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Reply;
    use crate::commands::{GetNodeInfos, NodeInfos};
    use crate::connection::MemoryConnection;
    use crate::response::Callback;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeSet;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Debug, Serialize, Deserialize)]
    struct Fail {}

    #[async_trait]
    impl Command for Fail {
        const NAME: &'static str = "fail";
        type Response = ();

        async fn execute(&self, _node: &Node) -> anyhow::Result<Reply<()>> {
            anyhow::bail!("an Exception")
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct DoNothing {}

    #[async_trait]
    impl Command for DoNothing {
        const NAME: &'static str = "do_nothing";
        type Response = ();

        async fn execute(&self, _node: &Node) -> anyhow::Result<Reply<()>> {
            Ok(Reply::NoResponse)
        }
    }

    fn channels(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[tokio::test]
    async fn test_connect() {
        let broker = MemoryBroker::new();
        let node = Node::memory(&broker).unwrap();
        assert!(node.nid().unwrap_err().is_not_connected());

        node.connect(false).await.unwrap();
        let nid = node.nid().unwrap().to_string();
        assert_eq!(broker.channels_of(&nid), Some(channels(&[&nid, "all"])));

        node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_send_only() {
        let broker = MemoryBroker::new();
        let node = Node::memory(&broker).unwrap();

        node.connect(true).await.unwrap();
        let nid = node.nid().unwrap().to_string();
        assert_eq!(broker.channels_of(&nid), Some(channels(&[&nid])));

        node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_when_already_connected_or_closed() {
        let broker = MemoryBroker::new();
        let node = Node::memory(&broker).unwrap();

        node.connect(false).await.unwrap();
        let nid = node.nid().unwrap().to_string();
        node.connect(false).await.unwrap();
        assert_eq!(node.nid().unwrap(), nid);
        assert_eq!(broker.member_count(), 1);

        node.close().await.unwrap();
        node.connect(false).await.unwrap();
        assert_eq!(broker.member_count(), 0);
        assert!(node.is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = MemoryBroker::new();
        let node = Node::memory(&broker).unwrap();

        // close before connect has no effect on the broker
        node.close().await.unwrap();
        node.close().await.unwrap();

        let node = Node::memory(&broker).unwrap();
        node.connect(false).await.unwrap();
        assert_eq!(broker.member_count(), 1);
        node.close().await.unwrap();
        node.close().await.unwrap();
        assert_eq!(broker.member_count(), 0);
    }

    #[tokio::test]
    async fn test_join_and_leave() {
        let broker = MemoryBroker::new();
        let node = Node::memory(&broker).unwrap();
        node.connect(true).await.unwrap();
        let nid = node.nid().unwrap().to_string();

        node.join("name").await.unwrap();
        assert_eq!(broker.channels_of(&nid), Some(channels(&[&nid, "name"])));
        node.leave("name").await.unwrap();
        assert_eq!(broker.channels_of(&nid), Some(channels(&[&nid])));

        assert!(matches!(
            node.join("an|invalid|channel").await,
            Err(CuriumError::InvalidChannel { .. })
        ));
        node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_rejects_handler_and_timeout() {
        let broker = MemoryBroker::new();
        let node = Node::memory(&broker).unwrap();
        node.connect(false).await.unwrap();

        let handler: Box<dyn ResponseHandler> = Box::new(BlockUntilAllReceived::new(None));
        let err = node
            .send(&GetNodeInfos {}, &["all"], Some(handler), Some(WAIT))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot set both response_handler and response_timeout"
        );
        node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let broker = MemoryBroker::new();
        let node = Node::memory(&broker).unwrap();
        let err = node
            .send(&GetNodeInfos {}, &["all"], None, None)
            .await
            .unwrap_err();
        assert!(err.is_not_connected());

        let err = node
            .send_no_response(&GetNodeInfos {}, &["all"])
            .await
            .unwrap_err();
        assert!(err.is_not_connected());
    }

    #[tokio::test]
    async fn test_send_to_self() {
        let broker = MemoryBroker::new();
        let node = Node::memory(&broker).unwrap();
        node.connect(false).await.unwrap();
        let nid = node.nid().unwrap().to_string();

        let handle = node
            .send(&GetNodeInfos {}, &[nid.as_str()], None, Some(WAIT))
            .await
            .unwrap();
        assert_eq!(handle.cid(), "0");

        let responses = handle.wait().await.unwrap();
        assert!(responses.finished);
        assert_eq!(responses.values, vec![NodeInfos { nid: nid.clone() }]);

        // command ids keep increasing
        let handle = node
            .send(&GetNodeInfos {}, &[nid.as_str()], None, Some(WAIT))
            .await
            .unwrap();
        assert_eq!(handle.cid(), "1");
        node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_with_callback() {
        let broker = MemoryBroker::new();
        let node = Node::memory(&broker).unwrap();
        node.connect(false).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback = Callback::new(move |value: &Value| {
            let _ = tx.send(value.clone());
        }, Some(WAIT));
        let handle = node
            .send(&GetNodeInfos {}, &["all"], Some(Box::new(callback)), None)
            .await
            .unwrap();

        let responses = handle.wait().await.unwrap();
        let seen = rx.recv().await.unwrap();
        assert_eq!(seen["nid"], node.nid().unwrap());
        assert_eq!(responses.values.len(), 1);
        node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_response_with_unknown_cid() {
        let broker = MemoryBroker::new();
        let node = Node::memory(&broker).unwrap();
        // only logs a warning
        node.add_response("404", serde_json::json!(null));
    }

    #[tokio::test]
    async fn test_dropped_handle_ignores_late_responses() {
        let broker = MemoryBroker::new();
        let node = Node::memory(&broker).unwrap();
        node.connect(true).await.unwrap();

        // nobody listens on this channel
        let handle = node
            .send(&GetNodeInfos {}, &["nobody"], None, Some(WAIT))
            .await
            .unwrap();
        let cid = handle.cid().to_string();
        drop(handle);

        node.add_response(&cid, serde_json::json!({"nid": "late"}));
        assert!(!lock(&node.inner.pending).contains_key(&cid));
        node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cmd_context() {
        let broker = MemoryBroker::new();
        let node = Node::memory(&broker).unwrap();

        node.register_cmd_with_context::<DoNothing, _>("context".to_string())
            .unwrap();
        assert_eq!(
            node.cmd_context::<String>(DoNothing::NAME).as_deref(),
            Some(&"context".to_string())
        );
        assert!(node.cmd_context::<i32>(DoNothing::NAME).is_none());
        assert!(node.cmd_context::<String>("missing").is_none());

        // the wrapper always carries the serializer
        assert!(
            node.cmd_context::<Arc<dyn Serializer>>(CommandWrapper::NAME)
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_builtin_commands_are_registered() {
        let broker = MemoryBroker::new();
        let node = Node::memory(&broker).unwrap();
        let serializer = node.serializer();
        assert!(serializer.is_registered(CommandWrapper::NAME));
        assert!(serializer.is_registered(AddResponse::NAME));
        assert!(serializer.is_registered(GetNodeInfos::NAME));
    }

    /// A node whose connection is connected directly, without the background loop.
    async fn manual_node(broker: &MemoryBroker, channel: &str) -> Node {
        let connection = MemoryConnection::new(broker.clone());
        connection.connect().await.unwrap();
        connection.join(channel).await.unwrap();
        let node = Node::new(Arc::new(connection), Arc::new(JsonSerializer::new())).unwrap();
        node.register_cmd::<Fail>().unwrap();
        node.register_cmd::<DoNothing>().unwrap();
        node
    }

    #[tokio::test]
    async fn test_recv() {
        let broker = MemoryBroker::new();
        let receiver = manual_node(&broker, "x").await;
        let sender = Node::memory(&broker).unwrap();
        sender.connect(true).await.unwrap();

        assert!(receiver.recv(Some(Duration::ZERO)).await.unwrap().is_none());

        let count = sender
            .send_no_response(&DoNothing {}, &["x"])
            .await
            .unwrap();
        assert_eq!(count, Some(1));

        let cmd = receiver.recv(Some(WAIT)).await.unwrap().unwrap();
        assert!(cmd.is::<DoNothing>());
        sender.close().await.unwrap();
        receiver.close().await.unwrap();
    }

    fn run_receive_loop(node: &Node) -> JoinHandle<CuriumResult<()>> {
        tokio::spawn(recv_until_close(Arc::downgrade(&node.inner)))
    }

    #[tokio::test]
    async fn test_receive_loop_reports_execution_errors() {
        let broker = MemoryBroker::new();
        let receiver = manual_node(&broker, "x").await;
        let sender = Node::memory(&broker).unwrap();
        sender.connect(true).await.unwrap();

        sender.send_no_response(&Fail {}, &["x"]).await.unwrap();
        sender.send_no_response(&DoNothing {}, &["x"]).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        receiver.set_error_handler(move |cmd: &dyn AnyCommand, error: &anyhow::Error| {
            let _ = tx.send((cmd.name(), error.to_string()));
        });
        let running = run_receive_loop(&receiver);

        let (name, message) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(name, Fail::NAME);
        assert_eq!(message, "an Exception");

        receiver.close().await.unwrap();
        running.await.unwrap().unwrap();
        // the handler is called for the failing command only
        assert!(rx.try_recv().is_err());
        sender.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_loop_skips_undecodable_messages() {
        let broker = MemoryBroker::new();
        let receiver = manual_node(&broker, "x").await;
        let raw = MemoryConnection::new(broker.clone());
        raw.connect().await.unwrap();

        raw.send(b"not json", &["x".to_string()]).await.unwrap();
        raw.send(br#"{"__cmd_name__": "unknown"}"#, &["x".to_string()])
            .await
            .unwrap();
        raw.send(br#"{"__cmd_name__": "fail"}"#, &["x".to_string()])
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        receiver.set_error_handler(move |cmd: &dyn AnyCommand, _: &anyhow::Error| {
            let _ = tx.send(cmd.name());
        });
        let running = run_receive_loop(&receiver);

        let name = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(name, Fail::NAME);
        receiver.close().await.unwrap();
        running.await.unwrap().unwrap();
        raw.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_loop_stops_on_disconnect() {
        let broker = MemoryBroker::new();
        let receiver = manual_node(&broker, "x").await;

        let running = run_receive_loop(&receiver);
        tokio::task::yield_now().await;
        broker.shutdown();

        let err = running.await.unwrap().unwrap_err();
        assert!(err.is_server_disconnected());
    }

    #[tokio::test]
    async fn test_receive_loop_ends_when_node_is_dropped() {
        let broker = MemoryBroker::new();
        let receiver = manual_node(&broker, "x").await;

        let running = run_receive_loop(&receiver);
        drop(receiver);
        tokio::time::timeout(WAIT, running).await.unwrap().unwrap().unwrap();
    }

    #[test]
    fn test_zero_poll_interval_is_rejected() {
        let broker = MemoryBroker::new();
        let config = NodeConfig {
            recv_poll_ms: 0,
            ..NodeConfig::default()
        };
        let err = Node::with_config(
            Arc::new(broker.connection()),
            Arc::new(JsonSerializer::new()),
            &config,
        )
        .unwrap_err();
        assert!(matches!(err, CuriumError::Config(_)), "{err}");
    }

    #[test]
    fn test_redis_node_rejects_zero_refresh_interval() {
        let mut config = CuriumConfig::default();
        config.redis.refresh_interval_ms = 0;
        let err = Node::from_config(&config).unwrap_err();
        assert!(matches!(err, CuriumError::Config(_)), "{err}");

        let client = redis::Client::open(config.redis.url.as_str()).unwrap();
        let err = Node::redis(client, &config).unwrap_err();
        assert!(matches!(err, CuriumError::Config(_)), "{err}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reconnect_keeps_the_receive_loop_running() {
        let broker = MemoryBroker::new();
        let node = Node::memory(&broker).unwrap();
        node.connect(false).await.unwrap();
        let nid = node.nid().unwrap().to_string();

        for _ in 0..20 {
            node.reconnect().await.unwrap();
            let responses = node
                .send(&GetNodeInfos {}, &[nid.as_str()], None, Some(WAIT))
                .await
                .unwrap()
                .wait()
                .await
                .unwrap();
            assert!(responses.finished);
            assert_eq!(responses.values, vec![NodeInfos { nid: nid.clone() }]);
        }
        node.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reconnect_after_server_restart() {
        let broker = MemoryBroker::new();
        let node = Node::memory(&broker).unwrap();
        node.connect(false).await.unwrap();
        let nid = node.nid().unwrap().to_string();

        broker.shutdown();
        assert!(node.reconnect().await.is_err());
        broker.restart();
        node.reconnect().await.unwrap();

        let responses = node
            .send(&GetNodeInfos {}, &["all"], None, Some(WAIT))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(responses.values, vec![NodeInfos { nid }]);
        node.close().await.unwrap();
    }
}
