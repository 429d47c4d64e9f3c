//! 响应收集
//!
//! `Node::send` 为每个需要响应的命令创建一个 `PendingResponse`，
//! 由 `ResponseHandler` 决定何时结束收集。调用方通过 `ResponseHandle` 读取结果。

use curium_common::{CuriumResult, SerializationError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// 响应收集策略
pub trait ResponseHandler: Send + 'static {
    /// 每收到一个响应调用一次
    fn on_response(&mut self, _response: &Value) {}

    /// 设置接收命令的节点数量，`None` 表示未知
    fn set_num_receivers(&mut self, num_receivers: Option<usize>);

    /// 已收到 `received` 个响应时是否结束
    fn is_finished(&self, received: usize) -> bool;

    /// 当前的截止时间
    fn deadline(&self) -> Option<Instant>;
}

/// 收到全部响应或超时后结束
#[derive(Debug, Clone)]
pub struct BlockUntilAllReceived {
    num_receivers: Option<usize>,
    deadline: Option<Instant>,
}

impl BlockUntilAllReceived {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            num_receivers: None,
            deadline: timeout.map(|timeout| Instant::now() + timeout),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(Some(timeout))
    }

    fn extend_deadline(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
    }
}

impl ResponseHandler for BlockUntilAllReceived {
    fn set_num_receivers(&mut self, num_receivers: Option<usize>) {
        self.num_receivers = num_receivers;
        if num_receivers.is_none() && self.deadline.is_none() {
            warn!("Neither the number of receivers nor a timeout is known, responses won't be collected");
        }
    }

    fn is_finished(&self, received: usize) -> bool {
        match (self.num_receivers, self.deadline) {
            (None, None) => true,
            (num_receivers, deadline) => {
                num_receivers.is_some_and(|n| received >= n)
                    || deadline.is_some_and(|deadline| Instant::now() >= deadline)
            }
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// 每收到一个响应就调用回调
pub struct Callback {
    inner: BlockUntilAllReceived,
    callback: Box<dyn FnMut(&Value) + Send>,
}

impl Callback {
    pub fn new(callback: impl FnMut(&Value) + Send + 'static, timeout: Option<Duration>) -> Self {
        Self {
            inner: BlockUntilAllReceived::new(timeout),
            callback: Box::new(callback),
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").field("inner", &self.inner).finish()
    }
}

impl ResponseHandler for Callback {
    fn on_response(&mut self, response: &Value) {
        (self.callback)(response);
    }

    fn set_num_receivers(&mut self, num_receivers: Option<usize>) {
        self.inner.set_num_receivers(num_receivers);
    }

    fn is_finished(&self, received: usize) -> bool {
        self.inner.is_finished(received)
    }

    fn deadline(&self) -> Option<Instant> {
        self.inner.deadline()
    }
}

/// 每收到一个响应就把截止时间推迟 `timeout`
#[derive(Debug, Clone)]
pub struct UpdateTimeoutPerReceive {
    inner: BlockUntilAllReceived,
    timeout: Duration,
}

impl UpdateTimeoutPerReceive {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: BlockUntilAllReceived::with_timeout(timeout),
            timeout,
        }
    }
}

impl ResponseHandler for UpdateTimeoutPerReceive {
    fn on_response(&mut self, _response: &Value) {
        self.inner.extend_deadline(self.timeout);
    }

    fn set_num_receivers(&mut self, num_receivers: Option<usize>) {
        self.inner.set_num_receivers(num_receivers);
    }

    fn is_finished(&self, received: usize) -> bool {
        self.inner.is_finished(received)
    }

    fn deadline(&self) -> Option<Instant> {
        self.inner.deadline()
    }
}

struct PendingState {
    handler: Box<dyn ResponseHandler>,
    values: Vec<Value>,
    // 接收者数量确定之前不能结束
    receivers_known: bool,
    finished: bool,
}

/// 一次发送的响应收集状态，节点与 `ResponseHandle` 共享
pub(crate) struct PendingResponse {
    state: Mutex<PendingState>,
    finished: watch::Sender<bool>,
}

impl PendingResponse {
    pub(crate) fn new(handler: Box<dyn ResponseHandler>) -> Arc<Self> {
        let (finished, _) = watch::channel(false);
        Arc::new(Self {
            state: Mutex::new(PendingState {
                handler,
                values: Vec::new(),
                receivers_known: false,
                finished: false,
            }),
            finished,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self, state: &mut PendingState) -> bool {
        if !state.finished && state.receivers_known && state.handler.is_finished(state.values.len()) {
            state.finished = true;
            self.finished.send_replace(true);
        }
        state.finished
    }

    pub(crate) fn set_num_receivers(&self, num_receivers: Option<usize>) {
        let mut state = self.lock();
        state.handler.set_num_receivers(num_receivers);
        state.receivers_known = true;
        self.check(&mut state);
    }

    pub(crate) fn add(&self, cid: &str, response: Value) {
        let mut state = self.lock();
        if self.check(&mut state) {
            debug!("Dropping a late response of command {}", cid);
            return;
        }
        state.handler.on_response(&response);
        state.values.push(response);
        self.check(&mut state);
    }

    fn poll_finished(&self) -> bool {
        let mut state = self.lock();
        self.check(&mut state)
    }

    fn deadline(&self) -> Option<Instant> {
        self.lock().handler.deadline()
    }

    fn snapshot(&self) -> (bool, Vec<Value>) {
        let mut state = self.lock();
        let finished = self.check(&mut state);
        (finished, state.values.clone())
    }

    async fn wait_finished(&self) {
        let mut finished = self.finished.subscribe();
        loop {
            if self.poll_finished() {
                return;
            }
            match self.deadline() {
                Some(deadline) => {
                    tokio::select! {
                        _ = finished.changed() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => {
                    if finished.changed().await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// 收集到的响应
#[derive(Debug, Clone, PartialEq)]
pub struct Responses<R> {
    /// 收集是否已经结束
    pub finished: bool,
    pub values: Vec<R>,
}

/// 一次发送的响应句柄
///
/// 节点只持有弱引用：丢弃句柄后，之后到达的响应会被忽略。
pub struct ResponseHandle<R> {
    cid: String,
    pending: Arc<PendingResponse>,
    _response: PhantomData<fn() -> R>,
}

impl<R> fmt::Debug for ResponseHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("cid", &self.cid)
            .finish()
    }
}

impl<R: DeserializeOwned> ResponseHandle<R> {
    pub(crate) fn new(cid: String, pending: Arc<PendingResponse>) -> Self {
        Self {
            cid,
            pending,
            _response: PhantomData,
        }
    }

    /// 命令 ID
    pub fn cid(&self) -> &str {
        &self.cid
    }

    /// 等待收集结束
    pub async fn wait(&self) -> CuriumResult<Responses<R>> {
        self.pending.wait_finished().await;
        self.try_get()
    }

    /// 最多等待 `timeout`，返回时收集可能尚未结束
    pub async fn wait_timeout(&self, timeout: Duration) -> CuriumResult<Responses<R>> {
        let _ = tokio::time::timeout(timeout, self.pending.wait_finished()).await;
        self.try_get()
    }

    /// 立即返回当前收集到的响应
    pub fn try_get(&self) -> CuriumResult<Responses<R>> {
        let (finished, values) = self.pending.snapshot();
        let values = values
            .into_iter()
            .map(|value| {
                serde_json::from_value(value).map_err(|e| {
                    SerializationError::invalid_format(format!(
                        "invalid response of command {}: {e}",
                        self.cid
                    ))
                })
            })
            .collect::<Result<Vec<R>, _>>()?;
        Ok(Responses { finished, values })
    }
}
