//! 接收队列
//!
//! 后端把收到的消息推入无界队列，`Connection::recv` 从这里取出

use curium_common::{ConnectionError, CuriumResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};

/// 投递给接收方的事件
#[derive(Debug)]
pub(crate) enum Inbound {
    Message(Vec<u8>),
    Disconnected(String),
}

pub(crate) type InboundSender = UnboundedSender<Inbound>;

/// 一个连接会话的接收端
///
/// 关闭流程：先 `mark_closed`，再丢弃发送端，最后 `detach`。
/// 丢弃发送端会唤醒正在等待的 `recv`，使其释放锁。
#[derive(Default)]
pub(crate) struct Inbox {
    rx: Mutex<Option<UnboundedReceiver<Inbound>>>,
    open: AtomicBool,
}

impl Inbox {
    pub(crate) fn channel() -> (InboundSender, UnboundedReceiver<Inbound>) {
        mpsc::unbounded_channel()
    }

    pub(crate) async fn attach(&self, rx: UnboundedReceiver<Inbound>) {
        *self.rx.lock().await = Some(rx);
        self.open.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub(crate) async fn detach(&self) {
        self.mark_closed();
        self.rx.lock().await.take();
    }

    pub(crate) async fn recv(&self, timeout: Option<Duration>) -> CuriumResult<Option<Vec<u8>>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotConnected.into());
        }

        let mut guard = self.rx.lock().await;
        let Some(rx) = guard.as_mut() else {
            return Err(ConnectionError::NotConnected.into());
        };

        let next = match timeout {
            None => rx.recv().await,
            Some(timeout) if timeout.is_zero() => match rx.try_recv() {
                Ok(inbound) => Some(inbound),
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => None,
            },
            Some(timeout) => match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(inbound) => inbound,
                Err(_) => return Ok(None),
            },
        };

        match next {
            Some(Inbound::Message(data)) => Ok(Some(data)),
            Some(Inbound::Disconnected(reason)) => {
                Err(ConnectionError::server_disconnected(reason).into())
            }
            None if !self.open.load(Ordering::SeqCst) => Err(ConnectionError::NotConnected.into()),
            None => Err(ConnectionError::server_disconnected("message stream closed").into()),
        }
    }
}
