//! 进程内连接后端
//!
//! 使用共享的 `MemoryBroker` 在同一进程内的节点之间路由消息，
//! 语义与 Redis 后端一致，主要用于测试和单进程部署

use super::inbox::{Inbound, InboundSender, Inbox};
use super::{Connection, normalize_destinations, validate_channel};
use async_trait::async_trait;
use curium_common::{ConnectionError, CuriumResult};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 进程内消息代理
///
/// 克隆得到的是同一个代理的句柄
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    members: HashMap<String, Member>,
    shut_down: bool,
}

struct Member {
    channels: HashSet<String>,
    tx: InboundSender,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("members", &self.member_count())
            .finish()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建一个连接到此代理的新连接
    pub fn connection(&self) -> MemoryConnection {
        MemoryConnection::new(self.clone())
    }

    /// 当前在线的成员数量
    pub fn member_count(&self) -> usize {
        self.state().members.len()
    }

    /// 成员加入的频道（测试辅助）
    pub fn channels_of(&self, uid: &str) -> Option<BTreeSet<String>> {
        self.state()
            .members
            .get(uid)
            .map(|member| member.channels.iter().cloned().collect())
    }

    /// 模拟服务器宕机
    ///
    /// 所有成员收到断开通知，之后的连接请求失败，直到 `restart`
    pub fn shutdown(&self) {
        let mut state = self.state();
        state.shut_down = true;
        for (uid, member) in state.members.drain() {
            debug!("Disconnecting member {}", uid);
            let _ = member
                .tx
                .send(Inbound::Disconnected("broker shut down".to_string()));
        }
        info!("Memory broker shut down");
    }

    /// 恢复服务
    pub fn restart(&self) {
        self.state().shut_down = false;
        info!("Memory broker restarted");
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        // 锁内没有会 panic 的逻辑，中毒时继续使用内部数据
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, uid: Option<&str>, tx: InboundSender) -> CuriumResult<String> {
        let mut state = self.state();
        if state.shut_down {
            return Err(ConnectionError::connection_failed("broker is shut down").into());
        }

        let uid = match uid {
            Some(uid) => uid.to_string(),
            None => loop {
                let uid = Uuid::new_v4().to_string();
                if !state.members.contains_key(&uid) {
                    break uid;
                }
            },
        };

        state.members.insert(
            uid.clone(),
            Member {
                channels: HashSet::new(),
                tx,
            },
        );
        Ok(uid)
    }

    fn unregister(&self, uid: &str) -> bool {
        self.state().members.remove(uid).is_some()
    }

    fn update_channels(&self, uid: &str, name: &str, join: bool) -> CuriumResult<()> {
        let mut state = self.state();
        let member = state.members.get_mut(uid).ok_or_else(|| {
            ConnectionError::server_disconnected(format!("member {uid} is not registered"))
        })?;
        if join {
            member.channels.insert(name.to_string());
        } else {
            member.channels.remove(name);
        }
        Ok(())
    }

    fn publish(&self, sender: &str, data: &[u8], destinations: &[String]) -> CuriumResult<usize> {
        let state = self.state();
        if !state.members.contains_key(sender) {
            return Err(ConnectionError::server_disconnected(format!(
                "member {sender} is not registered"
            ))
            .into());
        }

        let mut delivered = 0;
        for (uid, member) in &state.members {
            if !destinations.iter().any(|d| member.channels.contains(d)) {
                continue;
            }
            if member.tx.send(Inbound::Message(data.to_vec())).is_ok() {
                delivered += 1;
            } else {
                debug!("Member {} dropped its receiver", uid);
            }
        }
        Ok(delivered)
    }
}

/// 连接到 `MemoryBroker` 的连接
pub struct MemoryConnection {
    broker: MemoryBroker,
    uid: Mutex<Option<String>>,
    last_uid: Mutex<Option<String>>,
    joined: Mutex<BTreeSet<String>>,
    inbox: Inbox,
}

impl MemoryConnection {
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            uid: Mutex::new(None),
            last_uid: Mutex::new(None),
            joined: Mutex::new(BTreeSet::new()),
            inbox: Inbox::default(),
        }
    }

    /// 当前会话的唯一 ID
    pub fn uid(&self) -> Option<String> {
        lock(&self.uid).clone()
    }

    fn current_uid(&self) -> CuriumResult<String> {
        self.uid().ok_or_else(|| ConnectionError::NotConnected.into())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn connect(&self) -> CuriumResult<String> {
        let (tx, rx) = Inbox::channel();
        let uid = {
            // 检查与注册在同一把锁内完成，并发的 connect 只会注册一个成员
            let mut current = lock(&self.uid);
            if let Some(uid) = current.as_ref() {
                warn!("Already connected. uid: {}", uid);
                return Ok(uid.clone());
            }
            let uid = self.broker.register(None, tx)?;
            *current = Some(uid.clone());
            uid
        };
        *lock(&self.last_uid) = Some(uid.clone());
        lock(&self.joined).clear();
        self.inbox.attach(rx).await;

        info!("Connected to memory broker, uid: {}", uid);
        Ok(uid)
    }

    async fn reconnect(&self) -> CuriumResult<()> {
        let uid = lock(&self.last_uid)
            .clone()
            .ok_or(ConnectionError::NotConnected)?;

        self.inbox.mark_closed();
        self.broker.unregister(&uid);
        self.inbox.detach().await;

        let (tx, rx) = Inbox::channel();
        self.broker.register(Some(&uid), tx)?;

        let joined: Vec<String> = lock(&self.joined).iter().cloned().collect();
        for name in &joined {
            self.broker.update_channels(&uid, name, true)?;
        }
        self.inbox.attach(rx).await;
        *lock(&self.uid) = Some(uid.clone());

        info!("Reconnected to memory broker, uid: {}, channels: {:?}", uid, joined);
        Ok(())
    }

    async fn close(&self) -> CuriumResult<()> {
        let Some(uid) = lock(&self.uid).take() else {
            return Ok(());
        };

        self.inbox.mark_closed();
        if !self.broker.unregister(&uid) {
            debug!("Member {} was already gone while closing", uid);
        }
        self.inbox.detach().await;
        lock(&self.joined).clear();

        info!("Closed memory connection, uid: {}", uid);
        Ok(())
    }

    async fn join(&self, name: &str) -> CuriumResult<()> {
        validate_channel(name)?;
        let uid = self.current_uid()?;
        self.broker.update_channels(&uid, name, true)?;
        lock(&self.joined).insert(name.to_string());
        Ok(())
    }

    async fn leave(&self, name: &str) -> CuriumResult<()> {
        validate_channel(name)?;
        let uid = self.current_uid()?;
        self.broker.update_channels(&uid, name, false)?;
        lock(&self.joined).remove(name);
        Ok(())
    }

    async fn send(&self, data: &[u8], destinations: &[String]) -> CuriumResult<Option<usize>> {
        let destinations = normalize_destinations(destinations)?;
        let uid = self.current_uid()?;
        let delivered = self.broker.publish(&uid, data, &destinations)?;
        Ok(Some(delivered))
    }

    async fn recv(&self, timeout: Option<Duration>) -> CuriumResult<Option<Vec<u8>>> {
        self.inbox.recv(timeout).await
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if let Some(uid) = lock(&self.uid).take() {
            self.broker.unregister(&uid);
        }
    }
}
