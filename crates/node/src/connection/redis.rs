//! Redis 连接后端
//!
//! 使用 Redis 发布/订阅在节点之间传递消息
//!
//! 数据结构设计：
//! - {namespace}:{uid} -> Integer，带过期时间，由后台任务定期续期，标识在线节点
//! - 频道 `x` 对应订阅模式 `*|x|*`
//! - 发送到 `[a, b]` 时发布到频道 `|a|b|`

use super::inbox::{Inbound, InboundSender, Inbox};
use super::{Connection, normalize_destinations, validate_channel};
use async_trait::async_trait;
use curium_common::{ConnectionError, CuriumError, CuriumResult, RedisConfig};
use redis::aio::{self, ConnectionLike, ConnectionManager};
use redis::{Client, Msg, RedisError, RedisResult, Value};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::io;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Redis 连接
pub struct RedisConnection {
    client: Client,
    namespace: String,
    expire_secs: u64,
    refresh_interval: Duration,
    session: tokio::sync::Mutex<Option<Session>>,
    last_uid: Mutex<Option<String>>,
    joined: Mutex<BTreeSet<String>>,
    inbox: Inbox,
}

/// 一次连接会话持有的资源
struct Session {
    uid: String,
    uid_key: String,
    commands: ConnectionManager,
    control: mpsc::UnboundedSender<Control>,
    shutdown: CancellationToken,
    pubsub_task: JoinHandle<()>,
    refresh_task: JoinHandle<()>,
}

impl Session {
    fn stop(&self) {
        self.shutdown.cancel();
        self.pubsub_task.abort();
        self.refresh_task.abort();
    }
}

type ControlReply = oneshot::Sender<Result<(), RedisError>>;

/// 发给发布/订阅任务的控制指令
enum Control {
    Subscribe(String, ControlReply),
    Unsubscribe(String, ControlReply),
}

impl std::fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnection")
            .field("namespace", &self.namespace)
            .field("expire_secs", &self.expire_secs)
            .finish()
    }
}

impl RedisConnection {
    /// 使用已有的 Redis 客户端创建连接
    ///
    /// 过期时间和续期间隔为 0 时返回配置错误
    pub fn new(client: Client, config: &RedisConfig) -> CuriumResult<Self> {
        for warning in config.validate_strict()? {
            warn!("{}", warning);
        }

        Ok(Self {
            client,
            namespace: config.namespace.clone(),
            expire_secs: config.expire_secs,
            refresh_interval: config.refresh_interval(),
            session: tokio::sync::Mutex::new(None),
            last_uid: Mutex::new(None),
            joined: Mutex::new(BTreeSet::new()),
            inbox: Inbox::default(),
        })
    }

    /// 根据配置中的 URL 创建连接
    pub fn from_config(config: &RedisConfig) -> CuriumResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| {
            ConnectionError::connection_failed(format!("Invalid Redis URL {}: {e}", config.url))
        })?;
        Self::new(client, config)
    }

    fn uid_key(&self, uid: &str) -> String {
        format!("{}:{}", self.namespace, uid)
    }

    /// 建立命令连接并测试
    async fn open_commands(&self) -> CuriumResult<ConnectionManager> {
        let mut commands = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| ConnectionError::connection_failed(format!("{e}")))?;

        redis::cmd("PING")
            .query_async::<_, String>(&mut commands)
            .await
            .map_err(|e| ConnectionError::connection_failed(format!("Redis PING failed: {e}")))?;

        Ok(commands)
    }

    /// 建立发布/订阅连接并启动后台任务
    ///
    /// 已加入的频道会在新连接上重新订阅，任一订阅失败时整个会话作废
    async fn start_session(&self, uid: String, commands: ConnectionManager) -> CuriumResult<Session> {
        let pubsub = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| ConnectionError::connection_failed(format!("{e}")))?;

        let uid_key = self.uid_key(&uid);
        let (tx, rx) = Inbox::channel();
        let (control, control_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let pubsub_task = tokio::spawn(pump_pubsub(pubsub, control_rx, tx, shutdown.clone()));
        let refresh_task = tokio::spawn(refresh_uid(
            commands.clone(),
            uid_key.clone(),
            self.expire_secs,
            self.refresh_interval,
            shutdown.clone(),
        ));
        let session = Session {
            uid,
            uid_key,
            commands,
            control,
            shutdown,
            pubsub_task,
            refresh_task,
        };
        self.inbox.attach(rx).await;

        let joined: Vec<String> = lock(&self.joined).iter().cloned().collect();
        for name in &joined {
            let pattern = channel_pattern(name);
            if let Err(e) = request(&session.control, |reply| Control::Subscribe(pattern, reply)).await {
                session.stop();
                self.inbox.detach().await;
                return Err(ConnectionError::connection_failed(format!(
                    "failed to subscribe {name}: {e}"
                ))
                .into());
            }
        }

        Ok(session)
    }

    async fn commands(&self) -> CuriumResult<ConnectionManager> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.commands.clone())
            .ok_or_else(|| ConnectionError::NotConnected.into())
    }

    async fn control(&self, make: impl FnOnce(ControlReply) -> Control) -> CuriumResult<()> {
        let sender = self
            .session
            .lock()
            .await
            .as_ref()
            .map(|session| session.control.clone())
            .ok_or(ConnectionError::NotConnected)?;

        request(&sender, make).await
    }
}

/// 把指令交给发布/订阅任务，等待服务器确认
async fn request(
    sender: &mpsc::UnboundedSender<Control>,
    make: impl FnOnce(ControlReply) -> Control,
) -> CuriumResult<()> {
    let (reply_tx, reply_rx) = oneshot::channel();
    sender
        .send(make(reply_tx))
        .map_err(|_| ConnectionError::server_disconnected("pub/sub task stopped"))?;

    match reply_rx.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(map_redis_error(e)),
        Err(_) => Err(ConnectionError::server_disconnected("pub/sub task stopped").into()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 频道对应的订阅模式，转义 glob 元字符
pub(crate) fn channel_pattern(name: &str) -> String {
    let mut pattern = String::with_capacity(name.len() + 4);
    pattern.push_str("*|");
    for c in name.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push_str("|*");
    pattern
}

/// 目标频道列表对应的发布频道
pub(crate) fn publish_channel(destinations: &[String]) -> String {
    format!("|{}|", destinations.join("|"))
}

fn is_disconnect(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

fn map_redis_error(e: RedisError) -> CuriumError {
    if is_disconnect(&e) {
        ConnectionError::server_disconnected(e.to_string()).into()
    } else {
        ConnectionError::backend(e.to_string()).into()
    }
}

/// 过滤一次发布因匹配多个订阅模式而产生的重复消息
///
/// Redis 对同一连接按模式逐条投递 pmessage，这些副本是连续到达的。
#[derive(Default)]
pub(crate) struct DuplicateFilter {
    last: Option<(String, Vec<u8>, HashSet<String>)>,
}

impl DuplicateFilter {
    pub(crate) fn accept(&mut self, channel: &str, pattern: Option<&str>, payload: &[u8]) -> bool {
        let Some(pattern) = pattern else {
            self.last = None;
            return true;
        };

        if let Some((last_channel, last_payload, patterns)) = self.last.as_mut()
            && last_channel == channel
            && last_payload == payload
            && !patterns.contains(pattern)
        {
            patterns.insert(pattern.to_string());
            return false;
        }

        self.last = Some((
            channel.to_string(),
            payload.to_vec(),
            HashSet::from([pattern.to_string()]),
        ));
        true
    }
}

/// PSUBSCRIBE / PUNSUBSCRIBE 的确认回复
fn is_subscription_ack(value: &Value) -> bool {
    let Value::Bulk(items) = value else {
        return false;
    };
    matches!(
        items.first(),
        Some(Value::Data(kind)) if kind.as_slice() == b"psubscribe" || kind.as_slice() == b"punsubscribe"
    )
}

/// 读取下一帧
///
/// 空管道只写入零字节，随后用连接自带的解码器读取一个回复。
/// 读取被 select 打断时，已收到的字节保留在解码器中。
async fn read_frame(conn: &mut aio::Connection) -> RedisResult<Value> {
    let mut frames = conn.req_packed_commands(&redis::Pipeline::new(), 0, 1).await?;
    frames
        .pop()
        .ok_or_else(|| RedisError::from(io::Error::from(io::ErrorKind::UnexpectedEof)))
}

enum PumpEvent {
    Shutdown,
    Control(Control),
    Frame(RedisResult<Value>),
}

/// 发布/订阅后台任务
///
/// 整个会话独占一条连接：转发收到的消息，并串行发出订阅指令。
/// 订阅确认按发出顺序依次回复给等待方。
async fn pump_pubsub(
    mut conn: aio::Connection,
    mut control: mpsc::UnboundedReceiver<Control>,
    inbound: InboundSender,
    shutdown: CancellationToken,
) {
    let mut duplicates = DuplicateFilter::default();
    let mut pending: VecDeque<ControlReply> = VecDeque::new();

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => PumpEvent::Shutdown,
            ctrl = control.recv() => match ctrl {
                Some(ctrl) => PumpEvent::Control(ctrl),
                None => PumpEvent::Shutdown,
            },
            frame = read_frame(&mut conn) => PumpEvent::Frame(frame),
        };

        match event {
            PumpEvent::Shutdown => break,
            PumpEvent::Control(ctrl) => {
                let (command, pattern, reply) = match ctrl {
                    Control::Subscribe(pattern, reply) => ("PSUBSCRIBE", pattern, reply),
                    Control::Unsubscribe(pattern, reply) => ("PUNSUBSCRIBE", pattern, reply),
                };
                debug!("{} {}", command, pattern);

                let mut pipe = redis::pipe();
                pipe.cmd(command).arg(&pattern);
                match conn.req_packed_commands(&pipe, 0, 0).await {
                    Ok(_) => pending.push_back(reply),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            PumpEvent::Frame(Ok(value)) => {
                if let Some(msg) = Msg::from_value(&value) {
                    let channel = msg.get_channel_name();
                    let pattern = msg.get_pattern::<String>().ok();
                    let payload = msg.get_payload_bytes();
                    if !duplicates.accept(channel, pattern.as_deref(), payload) {
                        debug!("Dropping duplicated message on {}", channel);
                        continue;
                    }
                    if inbound.send(Inbound::Message(payload.to_vec())).is_err() {
                        break;
                    }
                } else if is_subscription_ack(&value) {
                    match pending.pop_front() {
                        Some(reply) => {
                            let _ = reply.send(Ok(()));
                        }
                        None => debug!("Unsolicited subscription reply: {:?}", value),
                    }
                } else {
                    debug!("Ignoring pub/sub frame: {:?}", value);
                }
            }
            PumpEvent::Frame(Err(e)) if is_disconnect(&e) => {
                warn!("Server disconnected");
                debug!("Pub/sub connection error: {}", e);
                let _ = inbound.send(Inbound::Disconnected(format!(
                    "pub/sub connection closed: {e}"
                )));
                break;
            }
            PumpEvent::Frame(Err(e)) => match pending.pop_front() {
                Some(reply) => {
                    let _ = reply.send(Err(e));
                }
                None => warn!("Pub/sub error reply: {}", e),
            },
        }
    }
}

/// 节点 ID 续期后台任务
async fn refresh_uid(
    mut commands: ConnectionManager,
    uid_key: String,
    expire_secs: u64,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut disconnected = false;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = redis::cmd("SETEX")
            .arg(&uid_key)
            .arg(expire_secs)
            .arg(1)
            .query_async::<_, ()>(&mut commands)
            .await;

        match result {
            Ok(()) if disconnected => {
                warn!("Server reconnected");
                disconnected = false;
            }
            Ok(()) => {}
            Err(e) if !disconnected => {
                warn!("Server disconnected");
                debug!("Failed to refresh {}: {}", uid_key, e);
                disconnected = true;
            }
            Err(_) => {}
        }
    }
}

#[async_trait]
impl Connection for RedisConnection {
    async fn connect(&self) -> CuriumResult<String> {
        let mut session = self.session.lock().await;
        if let Some(current) = session.as_ref() {
            warn!("Already connected. uid: {}", current.uid);
            return Ok(current.uid.clone());
        }

        let mut commands = self.open_commands().await?;

        // 原子性获取唯一 ID：INCR 返回 1 说明键此前不存在
        let uid = loop {
            let uid = Uuid::new_v4().to_string();
            let uid_key = self.uid_key(&uid);
            let (uid_code, _): (i64, i64) = redis::pipe()
                .cmd("INCR")
                .arg(&uid_key)
                .cmd("EXPIRE")
                .arg(&uid_key)
                .arg(self.expire_secs)
                .arg("NX")
                .query_async(&mut commands)
                .await
                .map_err(|e| ConnectionError::connection_failed(format!("{e}")))?;

            if uid_code == 1 {
                break uid;
            }
            debug!("Node id {} is taken, retrying", uid);
        };

        lock(&self.joined).clear();
        let new_session = match self.start_session(uid.clone(), commands.clone()).await {
            Ok(new_session) => new_session,
            Err(e) => {
                // 会话没有建立起来，归还刚占用的 ID
                let uid_key = self.uid_key(&uid);
                if let Err(del) = redis::cmd("DEL")
                    .arg(&uid_key)
                    .query_async::<_, ()>(&mut commands)
                    .await
                {
                    warn!("Failed to release {}: {}", uid_key, del);
                }
                return Err(e);
            }
        };
        *session = Some(new_session);
        *lock(&self.last_uid) = Some(uid.clone());

        info!("Connected to Redis, uid: {}", uid);
        Ok(uid)
    }

    async fn reconnect(&self) -> CuriumResult<()> {
        let uid = lock(&self.last_uid)
            .clone()
            .ok_or(ConnectionError::NotConnected)?;

        let mut session = self.session.lock().await;
        self.inbox.mark_closed();
        if let Some(old) = session.take() {
            old.stop();
        }
        self.inbox.detach().await;

        let mut commands = self.open_commands().await?;
        let uid_key = self.uid_key(&uid);
        redis::cmd("SET")
            .arg(&uid_key)
            .arg(1)
            .arg("EX")
            .arg(self.expire_secs)
            .query_async::<_, ()>(&mut commands)
            .await
            .map_err(|e| ConnectionError::connection_failed(format!("{e}")))?;

        *session = Some(self.start_session(uid.clone(), commands).await?);
        info!("Reconnected to Redis, uid: {}", uid);
        Ok(())
    }

    async fn close(&self) -> CuriumResult<()> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };

        self.inbox.mark_closed();
        session.stop();
        self.inbox.detach().await;
        lock(&self.joined).clear();

        let mut commands = session.commands;
        if let Err(e) = redis::cmd("DEL")
            .arg(&session.uid_key)
            .query_async::<_, ()>(&mut commands)
            .await
        {
            warn!("Failed to delete {} while closing: {}", session.uid_key, e);
        }

        info!("Closed Redis connection, uid: {}", session.uid);
        Ok(())
    }

    async fn join(&self, name: &str) -> CuriumResult<()> {
        validate_channel(name)?;
        let pattern = channel_pattern(name);
        self.control(|reply| Control::Subscribe(pattern, reply)).await?;
        lock(&self.joined).insert(name.to_string());
        Ok(())
    }

    async fn leave(&self, name: &str) -> CuriumResult<()> {
        validate_channel(name)?;
        let pattern = channel_pattern(name);
        self.control(|reply| Control::Unsubscribe(pattern, reply)).await?;
        lock(&self.joined).remove(name);
        Ok(())
    }

    async fn send(&self, data: &[u8], destinations: &[String]) -> CuriumResult<Option<usize>> {
        let destinations = normalize_destinations(destinations)?;
        let mut commands = self.commands().await?;

        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(publish_channel(&destinations))
            .arg(data)
            .query_async(&mut commands)
            .await
            .map_err(map_redis_error)?;

        // 多个目标时 Redis 统计的是模式匹配次数而不是节点数
        if destinations.len() == 1 {
            Ok(Some(receivers.max(0) as usize))
        } else {
            Ok(None)
        }
    }

    async fn recv(&self, timeout: Option<Duration>) -> CuriumResult<Option<Vec<u8>>> {
        self.inbox.recv(timeout).await
    }
}

impl Drop for RedisConnection {
    fn drop(&mut self) {
        if let Ok(mut session) = self.session.try_lock()
            && let Some(session) = session.take()
        {
            session.stop();
        }
    }
}
